//! Per-tuner session registry.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::client::HtspSession;
use crate::config::{SessionConfig, TunerHostInfo};
use crate::error::HtspError;

/// Map of tuner id to its HTSP session.
///
/// Tuner ids compare case-insensitively. Sessions are created on first use and
/// replaced when the tuner's connection settings change.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<HtspSession>>>,
}

fn key(tuner_id: &str) -> String {
    tuner_id.to_lowercase()
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for a tuner, creating it if needed.
    pub async fn get_or_create(&self, tuner: &TunerHostInfo) -> Result<Arc<HtspSession>, HtspError> {
        let config = SessionConfig::from_tuner(tuner)?;
        let key = key(&tuner.id);

        // Fast path: existing session with the same settings
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                if session.config().same_endpoint(&config) {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let mut sessions = self.sessions.write().await;

        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(&key) {
            if session.config().same_endpoint(&config) {
                debug!("Reusing session for tuner {} (after lock)", tuner.id);
                return Ok(Arc::clone(session));
            }
            info!("Tuner {} was reconfigured, replacing its session", tuner.id);
            session.dispose();
        }

        info!("Creating session for tuner {} ({})", tuner.id, config.htsp_addr);
        let session = HtspSession::new(config);
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    pub async fn get(&self, tuner_id: &str) -> Option<Arc<HtspSession>> {
        self.sessions.read().await.get(&key(tuner_id)).cloned()
    }

    /// Remove and dispose a tuner's session. Returns false if there was none.
    pub async fn remove(&self, tuner_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(&key(tuner_id));
        match removed {
            Some(session) => {
                info!("Removing session for tuner {}", tuner_id);
                session.dispose();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Dispose every session.
    pub async fn dispose_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (id, session) in sessions {
            debug!("Disposing session {}", id);
            session.dispose();
        }
    }
}
