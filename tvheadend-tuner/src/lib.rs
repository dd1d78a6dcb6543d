//! Tvheadend live TV tuner host.
//!
//! Exposes a Tvheadend backend to a media-server host through the
//! [`TunerHost`] trait: channel listing, ticketed stream resolution and
//! program guide queries. Underneath is an HTSP client keeping one
//! persistent, authenticated, multiplexed connection per configured tuner.
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tvheadend_tuner::{TunerHost, TunerHostInfo, TvheadendTunerHost};
//!
//! # async fn run() -> Result<(), tvheadend_tuner::HtspError> {
//! let host = TvheadendTunerHost::new();
//! let tuner = TunerHostInfo::new("tuner0", "http://localhost:9981");
//! let cancel = CancellationToken::new();
//!
//! for channel in host.get_channels(&tuner, &cancel).await? {
//!     println!("{} {}", channel.number, channel.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod host;

#[cfg(test)]
mod test_support;

pub use client::{HtspSession, ServerInfo, SessionState};
pub use config::{SessionConfig, TunerHostInfo, TvheadendOptions};
pub use directory::ChannelDirectory;
pub use error::HtspError;
pub use events::{get_events, EventQuery};
pub use host::{
    ChannelDescriptor, ChannelType, ProgramEntry, SessionManager, StreamSource, TunerHost,
    TvheadendTunerHost,
};
