//! Host-facing descriptors produced by the tuner host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel kind as the host understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Tv,
    Radio,
}

/// A channel exposed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Host-scoped channel id, `{tuner_id}_{native_id}`.
    pub id: String,
    /// Owning tuner instance.
    pub tuner_host_id: String,
    pub name: String,
    /// Logical channel number, `major` or `major.minor`.
    pub number: String,
    pub image_url: Option<String>,
    pub channel_type: ChannelType,
    /// Names of the tags the channel belongs to.
    pub tags: Vec<String>,
}

/// One program occurrence in the guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramEntry {
    /// Deterministic host-facing id derived from show, start and channel.
    pub id: String,
    pub channel_id: String,
    /// Backend event identifier.
    pub show_id: String,
    pub name: String,
    pub episode_title: Option<String>,
    pub overview: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub genres: Vec<String>,
    pub is_movie: bool,
    pub is_news: bool,
    pub is_sports: bool,
    pub is_kids: bool,
    pub image_url: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub official_rating: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaProtocol {
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStreamType {
    Video,
    Audio,
}

/// An elementary stream inside a media source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub stream_type: MediaStreamType,
    /// Position inside the container; -1 when unknown.
    pub index: i32,
    pub is_interlaced: bool,
}

impl MediaStream {
    /// Video stream with unknown index, flagged interlaced so the host deinterlaces.
    pub fn unknown_video() -> Self {
        Self {
            stream_type: MediaStreamType::Video,
            index: -1,
            is_interlaced: true,
        }
    }

    /// Audio stream with unknown index.
    pub fn unknown_audio() -> Self {
        Self {
            stream_type: MediaStreamType::Audio,
            index: -1,
            is_interlaced: false,
        }
    }
}

/// A playable live stream for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub id: String,
    /// Ticketed HTTP URL; short-lived and single use.
    pub path: String,
    pub protocol: MediaProtocol,
    pub media_streams: Vec<MediaStream>,
    pub requires_opening: bool,
    pub requires_closing: bool,
    pub supports_direct_play: bool,
    pub supports_direct_stream: bool,
    pub supports_transcoding: bool,
    pub is_infinite_stream: bool,
}

impl StreamSource {
    /// Build a container-agnostic live source for a ticketed URL.
    pub fn live(id: String, path: String) -> Self {
        Self {
            id,
            path,
            protocol: MediaProtocol::Http,
            media_streams: vec![MediaStream::unknown_video(), MediaStream::unknown_audio()],
            requires_opening: true,
            requires_closing: true,
            supports_direct_play: false,
            supports_direct_stream: true,
            supports_transcoding: true,
            is_infinite_stream: true,
        }
    }
}
