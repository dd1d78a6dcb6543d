//! Time-windowed program guide queries.
//!
//! A `getEvents` reply can be split over several messages sharing one
//! sequence number; every chunk but the last carries `more = 1`. The fold
//! stops on the first chunk without `more`, or once the backend has moved past
//! the requested window.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, trace};
use tokio::time::Instant;

use htsp_protocol::{Message, Value};

use crate::client::{Chunk, HtspSession};
use crate::directory::resolve_icon;
use crate::error::HtspError;
use crate::host::ids::program_entry_id;
use crate::host::types::ProgramEntry;

/// One guide query for a single channel.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Backend channel id sent to the server.
    pub native_channel_id: u32,
    /// Host-scoped channel id stamped on the returned entries.
    pub channel_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EventQuery {
    fn request(&self) -> Message {
        Message::request("getEvents")
            .with("channelId", self.native_channel_id)
            .with("maxTime", self.end.timestamp())
    }

    fn in_window(&self, entry: &ProgramEntry) -> bool {
        entry.start_date >= self.start && entry.start_date < self.end
    }
}

/// Folds `getEvents` chunks into program entries.
struct EventFold<'a> {
    query: &'a EventQuery,
    http_base_url: &'a str,
    chunks: usize,
}

impl EventFold<'_> {
    fn absorb(&mut self, reply: Message) -> Result<Chunk<ProgramEntry>, HtspError> {
        self.chunks += 1;
        let mut entries = Vec::new();
        let mut past_horizon = false;

        for event in reply.list_or_empty("events").iter().filter_map(Value::as_map) {
            if let Some(channel) = event.opt_u32("channelId") {
                if channel != self.query.native_channel_id {
                    trace!("Skipping event for channel {}", channel);
                    continue;
                }
            }
            if let Some(entry) = program_from_event(event, &self.query.channel_id, self.http_base_url) {
                past_horizon |= entry.start_date >= self.query.end;
                entries.push(entry);
            }
        }

        trace!(
            "getEvents chunk {}: {} entries, more={}",
            self.chunks,
            entries.len(),
            reply.flag("more")
        );

        if reply.flag("more") && !past_horizon {
            Ok(Chunk::More(entries))
        } else {
            Ok(Chunk::Done(entries))
        }
    }
}

/// Fetch the program entries of one channel starting within `[start, end)`.
///
/// Entries come back ordered by start time with no repeated (show, start)
/// pair.
pub async fn get_events(
    session: &HtspSession,
    query: &EventQuery,
    deadline: Instant,
) -> Result<Vec<ProgramEntry>, HtspError> {
    if query.end <= query.start {
        return Ok(Vec::new());
    }

    let mut fold = EventFold {
        query,
        http_base_url: session.http_base_url(),
        chunks: 0,
    };
    let raw = session
        .send_streaming(
            query.request(),
            |reply| fold.absorb(reply),
            session.config().max_event_chunks,
            deadline,
        )
        .await?;
    let received = raw.len();

    let mut seen = HashSet::new();
    let mut entries: Vec<ProgramEntry> = raw
        .into_iter()
        .filter(|entry| query.in_window(entry))
        .filter(|entry| seen.insert((entry.show_id.clone(), entry.start_date)))
        .collect();
    entries.sort_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)));

    debug!(
        "[HTSP {}] getEvents for channel {}: {} of {} entries in window",
        session.config().label,
        query.native_channel_id,
        entries.len(),
        received
    );
    Ok(entries)
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Genre names for the DVB content nibble.
fn content_genre(content_type: u32) -> Option<&'static str> {
    let genre = match (content_type >> 4) & 0x0F {
        0x1 => "Movie",
        0x2 => "News",
        0x3 => "Show",
        0x4 => "Sports",
        0x5 => "Children",
        0x6 => "Music",
        0x7 => "Arts",
        0x8 => "Social",
        0x9 => "Education",
        0xA => "Leisure",
        _ => return None,
    };
    Some(genre)
}

/// Build a program entry from one event map. Events without a valid time
/// span are skipped.
pub fn program_from_event(event: &Message, channel_id: &str, http_base_url: &str) -> Option<ProgramEntry> {
    let show_id = event.opt_u32("eventId")?.to_string();
    let start = timestamp(event.opt_i64("start")?)?;
    let stop = timestamp(event.opt_i64("stop")?)?;
    if stop <= start {
        return None;
    }

    let content_type = event.opt_u32("contentType").unwrap_or(0);
    let nibble = (content_type >> 4) & 0x0F;

    Some(ProgramEntry {
        id: program_entry_id(channel_id, start, &show_id),
        channel_id: channel_id.to_string(),
        show_id,
        name: event.opt_str("title").unwrap_or_default().to_string(),
        episode_title: event.opt_str("subtitle").map(str::to_string),
        overview: event
            .opt_str("description")
            .or_else(|| event.opt_str("summary"))
            .map(str::to_string),
        start_date: start,
        end_date: stop,
        genres: content_genre(content_type).map(str::to_string).into_iter().collect(),
        is_movie: nibble == 0x1,
        is_news: nibble == 0x2,
        is_sports: nibble == 0x4,
        is_kids: nibble == 0x5,
        image_url: event.opt_str("image").map(|img| resolve_icon(http_base_url, img)),
        season_number: event.opt_u32("seasonNumber").filter(|n| *n > 0),
        episode_number: event.opt_u32("episodeNumber").filter(|n| *n > 0),
        official_rating: event
            .opt_u32("ageRating")
            .filter(|age| *age > 0)
            .map(|age| age.to_string()),
    })
}
