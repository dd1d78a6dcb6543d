//! In-memory channel catalog fed by backend push messages.
//!
//! The backend pushes its full channel and tag catalog after
//! `enableAsyncMetadata`, finishing with `initialSyncCompleted`, and keeps
//! pushing updates for as long as the connection lives. Records are replaced
//! wholesale on update; readers get a consistent snapshot without any
//! network round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;
use tokio::sync::watch;

use htsp_protocol::{Message, ProtocolError, Value};

use crate::host::ids::create_host_channel_id;
use crate::host::types::{ChannelDescriptor, ChannelType};

/// An elementary service carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
}

/// A backend channel as last pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub id: u32,
    pub name: String,
    pub number: u32,
    pub number_minor: Option<u32>,
    pub icon: Option<String>,
    pub tags: Vec<u32>,
    pub services: Vec<ServiceRecord>,
    /// Event currently airing.
    pub event_id: Option<u32>,
    pub next_event_id: Option<u32>,
}

impl ChannelRecord {
    /// Decode a `channelAdd` / `channelUpdate` message.
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let id = msg.get_u32("channelId")?;

        let services = msg
            .list_or_empty("services")
            .iter()
            .filter_map(Value::as_map)
            .map(|svc| ServiceRecord {
                name: svc.opt_str("name").unwrap_or_default().to_string(),
                service_type: svc.opt_str("type").unwrap_or_default().to_string(),
            })
            .collect();

        Ok(Self {
            id,
            name: msg
                .opt_str("channelName")
                .map(str::to_string)
                .unwrap_or_else(|| format!("Channel {}", id)),
            number: msg.opt_u32("channelNumber").unwrap_or(0),
            number_minor: msg.opt_u32("channelNumberMinor").filter(|m| *m > 0),
            icon: msg.opt_str("channelIcon").map(str::to_string),
            tags: u32_list(msg.list_or_empty("tags")),
            services,
            event_id: msg.opt_u32("eventId").filter(|e| *e > 0),
            next_event_id: msg.opt_u32("nextEventId").filter(|e| *e > 0),
        })
    }

    /// Channel number as shown to users.
    pub fn display_number(&self) -> String {
        match self.number_minor {
            Some(minor) => format!("{}.{}", self.number, minor),
            None => self.number.to_string(),
        }
    }

    /// A channel is radio when every one of its services is a radio service.
    pub fn is_radio(&self) -> bool {
        !self.services.is_empty()
            && self
                .services
                .iter()
                .all(|s| s.service_type.to_ascii_lowercase().contains("radio"))
    }
}

/// A channel tag (group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub id: u32,
    pub name: String,
    pub icon: Option<String>,
    pub members: Vec<u32>,
}

impl TagRecord {
    /// Decode a `tagAdd` / `tagUpdate` message.
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        let id = msg.get_u32("tagId")?;
        Ok(Self {
            id,
            name: msg
                .opt_str("tagName")
                .map(str::to_string)
                .unwrap_or_else(|| format!("Tag {}", id)),
            icon: msg.opt_str("tagIcon").map(str::to_string),
            members: u32_list(msg.list_or_empty("members")),
        })
    }
}

fn u32_list(values: &[Value]) -> Vec<u32> {
    values
        .iter()
        .filter_map(Value::as_i64)
        .filter_map(|v| u32::try_from(v).ok())
        .collect()
}

#[derive(Default)]
struct Catalog {
    channels: HashMap<u32, Arc<ChannelRecord>>,
    tags: HashMap<u32, Arc<TagRecord>>,
}

/// The authoritative channel catalog for one session.
pub struct ChannelDirectory {
    catalog: RwLock<Catalog>,
    synced: watch::Sender<bool>,
    event_pushes: AtomicU64,
}

impl Default for ChannelDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDirectory {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            catalog: RwLock::new(Catalog::default()),
            synced,
            event_pushes: AtomicU64::new(0),
        }
    }

    /// Forget the catalog ahead of a new connection's initial sync.
    pub fn reset(&self) {
        let mut catalog = self.catalog.write();
        catalog.channels.clear();
        catalog.tags.clear();
        self.synced.send_replace(false);
    }

    /// Apply a push message. Returns `Ok(false)` for methods the directory
    /// does not track.
    pub fn apply_push(&self, method: &str, msg: &Message) -> Result<bool, ProtocolError> {
        match method {
            "channelAdd" | "channelUpdate" => {
                let record = ChannelRecord::from_message(msg)?;
                trace!("{} {} '{}'", method, record.id, record.name);
                self.catalog
                    .write()
                    .channels
                    .insert(record.id, Arc::new(record));
            }
            "channelDelete" => {
                let id = msg.get_u32("channelId")?;
                if self.catalog.write().channels.remove(&id).is_none() {
                    debug!("channelDelete for unknown channel {}", id);
                }
            }
            "tagAdd" | "tagUpdate" => {
                let record = TagRecord::from_message(msg)?;
                self.catalog.write().tags.insert(record.id, Arc::new(record));
            }
            "tagDelete" => {
                let id = msg.get_u32("tagId")?;
                self.catalog.write().tags.remove(&id);
            }
            "initialSyncCompleted" => {
                debug!(
                    "Initial sync completed: {} channels, {} tags",
                    self.channel_count(),
                    self.catalog.read().tags.len()
                );
                self.synced.send_replace(true);
            }
            "eventAdd" | "eventUpdate" | "eventDelete" => {
                self.event_pushes.fetch_add(1, Ordering::Relaxed);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the backend has finished pushing the initial catalog.
    pub async fn wait_for_initial_sync(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    pub fn channel(&self, id: u32) -> Option<Arc<ChannelRecord>> {
        self.catalog.read().channels.get(&id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.catalog.read().channels.len()
    }

    /// Native ids of every known channel.
    pub fn channel_ids(&self) -> Vec<u32> {
        self.catalog.read().channels.keys().copied().collect()
    }

    /// Number of event push messages seen since creation.
    pub fn event_pushes(&self) -> u64 {
        self.event_pushes.load(Ordering::Relaxed)
    }

    /// Snapshot the catalog as host descriptors owned by `tuner_id`.
    ///
    /// Channel ids are wrapped into host-scoped ids and relative channel icons
    /// are resolved against `http_base_url`. The result is ordered by channel
    /// number, then name.
    pub fn build_channel_infos(&self, tuner_id: &str, http_base_url: &str) -> Vec<ChannelDescriptor> {
        let (mut channels, tags) = {
            let catalog = self.catalog.read();
            let channels: Vec<Arc<ChannelRecord>> = catalog.channels.values().cloned().collect();
            (channels, catalog.tags.clone())
        };

        channels.sort_by(|a, b| {
            (a.number, a.number_minor.unwrap_or(0), &a.name)
                .cmp(&(b.number, b.number_minor.unwrap_or(0), &b.name))
        });

        channels
            .iter()
            .map(|ch| ChannelDescriptor {
                id: create_host_channel_id(tuner_id, ch.id),
                tuner_host_id: tuner_id.to_string(),
                name: ch.name.clone(),
                number: ch.display_number(),
                image_url: ch.icon.as_deref().map(|icon| resolve_icon(http_base_url, icon)),
                channel_type: if ch.is_radio() {
                    ChannelType::Radio
                } else {
                    ChannelType::Tv
                },
                tags: ch
                    .tags
                    .iter()
                    .filter_map(|id| tags.get(id).map(|t| t.name.clone()))
                    .collect(),
            })
            .collect()
    }
}

/// Absolute icon URLs pass through; backend-relative ones hang off the base URL.
pub fn resolve_icon(http_base_url: &str, icon: &str) -> String {
    if icon.starts_with("http://") || icon.starts_with("https://") {
        icon.to_string()
    } else {
        format!(
            "{}/{}",
            http_base_url.trim_end_matches('/'),
            icon.trim_start_matches('/')
        )
    }
}
