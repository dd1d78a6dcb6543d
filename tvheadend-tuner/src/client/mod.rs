//! HTSP client: framing, request correlation and the connection session.

mod codec;
mod correlator;
mod keepalive;
mod session;

pub use codec::HtspCodec;
pub use correlator::{Correlator, PendingGuard, Reply};
pub use session::{Chunk, HtspSession, ServerInfo, SessionState};
