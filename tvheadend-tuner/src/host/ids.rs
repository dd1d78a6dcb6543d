//! Translation between backend-native and host-scoped identifiers.
//!
//! A host channel id is `"{tuner_id}_{native_id}"`. Only canonical decimal
//! native ids are accepted on the way back in, so the mapping is a bijection
//! per tuner.

use chrono::{DateTime, Utc};

use crate::error::HtspError;

/// Wrap a native channel id for the host.
pub fn create_host_channel_id(tuner_id: &str, native_id: u32) -> String {
    format!("{}_{}", tuner_id, native_id)
}

/// Recover the native channel id from a host channel id of this tuner.
pub fn tuner_channel_id_from_host(tuner_id: &str, host_id: &str) -> Result<u32, HtspError> {
    let invalid = || HtspError::InvalidChannelId(host_id.to_string());

    let rest = host_id
        .strip_prefix(tuner_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(invalid)?;
    let native: u32 = rest.parse().map_err(|_| invalid())?;

    // Reject "+5", "05" and friends, which would map two host ids onto one channel.
    if native.to_string() != rest {
        return Err(invalid());
    }
    Ok(native)
}

/// Deterministic program id for one (show, start, channel) occurrence.
pub fn program_entry_id(channel_id: &str, start: DateTime<Utc>, show_id: &str) -> String {
    format!("{}_{}_{}", channel_id, start.timestamp(), show_id)
}

/// Id of the stream source for a native channel.
pub fn stream_source_id(native_id: u32) -> String {
    format!("tvh_{}", native_id)
}

/// Ticketed stream URL: `{base}{path}?ticket={ticket}`.
pub fn build_stream_url(http_base_url: &str, path: &str, ticket: &str) -> String {
    let base = http_base_url.trim_end_matches('/');
    let separator = if path.starts_with('/') { "" } else { "/" };
    format!(
        "{}{}{}?ticket={}",
        base,
        separator,
        path,
        urlencoding::encode(ticket)
    )
}
