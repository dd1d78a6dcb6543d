//! Keep-alive for a ready connection.

use std::sync::Weak;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use htsp_protocol::Message;

use crate::client::session::{HtspSession, Link};

/// Longest wait for a `getSysTime` reply.
const KEEPALIVE_RESPONSE_DEADLINE: Duration = Duration::from_secs(10);

/// Consecutive failures after which the connection is considered dead.
const KEEPALIVE_MAX_FAILURES: u32 = 3;

/// Ping the backend every `interval` until the connection ends.
///
/// Tears the connection down after too many consecutive failures; the next
/// operation on the session reconnects.
pub(crate) async fn keepalive_loop(session: Weak<HtspSession>, link: Link, interval: Duration) {
    let label = match session.upgrade() {
        Some(session) => session.config().label.clone(),
        None => return,
    };
    let response_deadline = KEEPALIVE_RESPONSE_DEADLINE.min(interval);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = link.closed.cancelled() => {
                debug!("[HTSP {}] Connection closed, exiting keep-alive loop", label);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let deadline = Instant::now() + response_deadline;
        match link.request(Message::request("getSysTime"), deadline).await {
            Ok(_) => {
                if failures > 0 {
                    info!("[HTSP {}] Keep-alive restored", label);
                }
                failures = 0;
            }
            Err(e) => {
                if link.closed.is_cancelled() || e.is_fatal_for_connection() {
                    debug!("[HTSP {}] Keep-alive stopping: {}", label, e);
                    return;
                }
                failures += 1;
                warn!(
                    "[HTSP {}] Keep-alive failed ({}/{}): {}",
                    label, failures, KEEPALIVE_MAX_FAILURES, e
                );
                if failures >= KEEPALIVE_MAX_FAILURES {
                    match session.upgrade() {
                        Some(session) => session.teardown(link.generation, "keep-alive timed out"),
                        None => link.closed.cancel(),
                    }
                    return;
                }
            }
        }
    }
}
