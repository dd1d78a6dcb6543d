//! Host-facing side of the tuner: descriptors, id translation, the session
//! registry and the tuner host adapter.

pub mod ids;
pub mod manager;
pub mod tuner_host;
pub mod types;

pub use manager::SessionManager;
pub use tuner_host::{TunerHost, TvheadendTunerHost, OPERATION_TIMEOUT};
pub use types::{
    ChannelDescriptor, ChannelType, MediaProtocol, MediaStream, MediaStreamType, ProgramEntry,
    StreamSource,
};
