//! Tuner host adapter: maps host operations onto HTSP sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use htsp_protocol::Message;

use crate::client::HtspSession;
use crate::config::{SessionConfig, TunerHostInfo, TvheadendOptions, DEFAULT_URL};
use crate::error::HtspError;
use crate::events::{get_events, EventQuery};
use crate::host::ids::{build_stream_url, stream_source_id, tuner_channel_id_from_host};
use crate::host::manager::SessionManager;
use crate::host::types::{ChannelDescriptor, ProgramEntry, StreamSource};

/// Upper bound on any single host operation.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// The contract a live TV tuner provider fulfils for the host.
#[async_trait]
pub trait TunerHost: Send + Sync {
    /// Provider type key.
    fn host_type(&self) -> &'static str;

    /// Display name.
    fn name(&self) -> &'static str;

    fn supports_guide_data(&self, tuner: &TunerHostInfo) -> bool;

    /// Configuration offered when the user adds a new tuner.
    fn default_configuration(&self) -> TunerHostInfo;

    async fn get_channels(
        &self,
        tuner: &TunerHostInfo,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelDescriptor>, HtspError>;

    async fn get_channel_stream(
        &self,
        tuner: &TunerHostInfo,
        channel: &ChannelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<StreamSource, HtspError>;

    /// All playable sources for a channel.
    async fn get_channel_stream_sources(
        &self,
        tuner: &TunerHostInfo,
        channel: &ChannelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamSource>, HtspError> {
        Ok(vec![self.get_channel_stream(tuner, channel, cancel).await?])
    }

    async fn get_programs(
        &self,
        tuner: &TunerHostInfo,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProgramEntry>, HtspError>;

    async fn validate_options(
        &self,
        tuner: &TunerHostInfo,
        cancel: &CancellationToken,
    ) -> Result<(), HtspError>;

    /// Forget a tuner that the host no longer has.
    async fn remove_tuner(&self, tuner_id: &str);
}

/// Tvheadend tuner host backed by one HTSP session per tuner.
pub struct TvheadendTunerHost {
    sessions: SessionManager,
    operation_timeout: Duration,
}

impl Default for TvheadendTunerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl TvheadendTunerHost {
    pub fn new() -> Self {
        Self {
            sessions: SessionManager::new(),
            operation_timeout: OPERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run `op` under the operation ceiling and the caller's cancellation,
    /// whichever fires first.
    async fn within_budget<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, HtspError>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = Result<T, HtspError>>,
    {
        let deadline = Instant::now() + self.operation_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HtspError::Cancelled),
            result = tokio::time::timeout_at(deadline, op(deadline)) => {
                result.unwrap_or(Err(HtspError::Timeout))
            }
        }
    }

    async fn ready_session(
        &self,
        tuner: &TunerHostInfo,
        deadline: Instant,
    ) -> Result<Arc<HtspSession>, HtspError> {
        let session = self.sessions.get_or_create(tuner).await?;
        session.ensure_connection(deadline).await?;
        Ok(session)
    }

    async fn channels(&self, tuner: &TunerHostInfo, deadline: Instant) -> Result<Vec<ChannelDescriptor>, HtspError> {
        let session = self.ready_session(tuner, deadline).await?;

        // The session may have been created under another spelling of the id.
        let channels = session
            .directory()
            .build_channel_infos(&tuner.id, session.http_base_url());

        debug!("[HTSP {}] Returning {} channels", tuner.id, channels.len());
        Ok(channels)
    }

    async fn stream(
        &self,
        tuner: &TunerHostInfo,
        channel: &ChannelDescriptor,
        deadline: Instant,
    ) -> Result<StreamSource, HtspError> {
        let native = tuner_channel_id_from_host(&tuner.id, &channel.id)?;
        let session = self.ready_session(tuner, deadline).await?;

        let reply = session
            .send(Message::request("getTicket").with("channelId", native), deadline)
            .await?;
        let url = build_stream_url(
            session.http_base_url(),
            reply.get_str("path")?,
            reply.get_str("ticket")?,
        );

        debug!("[HTSP {}] Stream ticket issued for channel {}", tuner.id, native);
        Ok(StreamSource::live(stream_source_id(native), url))
    }

    async fn programs(
        &self,
        tuner: &TunerHostInfo,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Vec<ProgramEntry>, HtspError> {
        let native = tuner_channel_id_from_host(&tuner.id, channel_id)?;
        let session = self.ready_session(tuner, deadline).await?;

        info!(
            "[HTSP {}] Requesting events of channel {} from {} to {}",
            tuner.id, native, start, end
        );
        let query = EventQuery {
            native_channel_id: native,
            channel_id: channel_id.to_string(),
            start,
            end,
        };
        get_events(&session, &query, deadline).await
    }

    async fn validate(&self, tuner: &TunerHostInfo, deadline: Instant) -> Result<(), HtspError> {
        let config = SessionConfig::from_tuner(tuner)?;
        let session = HtspSession::new(config);
        let result = session.ensure_connection(deadline).await;
        session.dispose();
        result
    }
}

#[async_trait]
impl TunerHost for TvheadendTunerHost {
    fn host_type(&self) -> &'static str {
        "tvheadend"
    }

    fn name(&self) -> &'static str {
        "Tvheadend"
    }

    fn supports_guide_data(&self, _tuner: &TunerHostInfo) -> bool {
        true
    }

    fn default_configuration(&self) -> TunerHostInfo {
        TunerHostInfo::new("", DEFAULT_URL).with_options(TvheadendOptions::default())
    }

    async fn get_channels(
        &self,
        tuner: &TunerHostInfo,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelDescriptor>, HtspError> {
        self.within_budget(cancel, |deadline| self.channels(tuner, deadline))
            .await
    }

    async fn get_channel_stream(
        &self,
        tuner: &TunerHostInfo,
        channel: &ChannelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<StreamSource, HtspError> {
        self.within_budget(cancel, |deadline| self.stream(tuner, channel, deadline))
            .await
    }

    async fn get_programs(
        &self,
        tuner: &TunerHostInfo,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProgramEntry>, HtspError> {
        self.within_budget(cancel, |deadline| {
            self.programs(tuner, channel_id, start, end, deadline)
        })
        .await
    }

    async fn validate_options(
        &self,
        tuner: &TunerHostInfo,
        cancel: &CancellationToken,
    ) -> Result<(), HtspError> {
        self.within_budget(cancel, |deadline| self.validate(tuner, deadline))
            .await
    }

    async fn remove_tuner(&self, tuner_id: &str) {
        self.sessions.remove(tuner_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use htsp_protocol::Value;

    use crate::host::ids::create_host_channel_id;
    use crate::host::types::{ChannelType, MediaProtocol, MediaStreamType};
    use crate::test_support::{channel, MockBackend, MockOptions, Scripted};

    const T0: i64 = 1_700_000_000;

    fn responder(req: &Message) -> Option<Scripted> {
        match req.method() {
            Some("getTicket") => {
                let reply = if req.opt_u32("channelId") == Some(5) {
                    Message::new().with("path", "/stream/channelid/5").with("ticket", "abc")
                } else {
                    Message::new().with("error", "No such channel")
                };
                Some(Scripted::Reply(vec![reply]))
            }
            Some("getEvents") => {
                let event = |id: u32, start: i64| {
                    Value::Map(
                        Message::new()
                            .with("eventId", id)
                            .with("channelId", 5)
                            .with("start", start)
                            .with("stop", start + 300)
                            .with("title", format!("Show {}", id)),
                    )
                };
                Some(Scripted::Reply(vec![
                    Message::new().with("events", vec![event(1, T0 + 100)]).with("more", 1),
                    Message::new().with("events", vec![event(2, T0 + 2000)]),
                ]))
            }
            _ => None,
        }
    }

    async fn backend() -> MockBackend {
        MockBackend::start(
            MockOptions::default()
                .with_channels(vec![
                    channel(5, "Five", 5),
                    channel(1, "One", 1),
                    channel(12, "Twelve", 12),
                ])
                .with_responder(responder),
        )
        .await
    }

    #[test]
    fn test_host_metadata() {
        let host = TvheadendTunerHost::new();
        assert_eq!(host.host_type(), "tvheadend");
        let default = host.default_configuration();
        assert_eq!(default.url, "http://localhost:9981");
        assert!(host.supports_guide_data(&default));
    }

    #[tokio::test]
    async fn test_get_channels_wraps_ids() {
        let mock = backend().await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        let cancel = CancellationToken::new();

        let channels = host.get_channels(&tuner, &cancel).await.unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["tuner0_1", "tuner0_5", "tuner0_12"]);
        assert!(channels.iter().all(|c| c.tuner_host_id == "tuner0"));
        assert!(channels.iter().all(|c| c.channel_type == ChannelType::Tv));

        for ch in &channels {
            let native = tuner_channel_id_from_host("tuner0", &ch.id).unwrap();
            assert_eq!(create_host_channel_id("tuner0", native), ch.id);
        }

        host.get_channels(&tuner, &cancel).await.unwrap();
        assert_eq!(mock.connections(), 1);

        // Same session, ids scoped by the spelling the caller used.
        let upper = host.get_channels(&mock.tuner("TUNER0"), &cancel).await.unwrap();
        assert_eq!(upper[0].id, "TUNER0_1");
        assert_eq!(upper[0].tuner_host_id, "TUNER0");
        assert_eq!(mock.connections(), 1);
    }

    #[tokio::test]
    async fn test_get_stream_builds_ticket_url() {
        let mock = backend().await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        let cancel = CancellationToken::new();

        let channels = host.get_channels(&tuner, &cancel).await.unwrap();
        let five = channels.iter().find(|c| c.name == "Five").unwrap();

        let sources = host
            .get_channel_stream_sources(&tuner, five, &cancel)
            .await
            .unwrap();
        assert_eq!(sources.len(), 1);
        let source = &sources[0];
        assert_eq!(source.id, "tvh_5");
        assert_eq!(source.path, "http://127.0.0.1:9981/stream/channelid/5?ticket=abc");
        assert_eq!(source.protocol, MediaProtocol::Http);
        assert!(source.requires_opening && source.requires_closing && source.is_infinite_stream);
        assert!(!source.supports_direct_play);
        assert_eq!(source.media_streams[0].stream_type, MediaStreamType::Video);
        assert!(source.media_streams[0].is_interlaced);
        assert_eq!(source.media_streams[1].index, -1);
    }

    #[tokio::test]
    async fn test_get_stream_surfaces_backend_error() {
        let mock = backend().await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        let cancel = CancellationToken::new();

        let mut channel = host.get_channels(&tuner, &cancel).await.unwrap().remove(0);
        channel.id = create_host_channel_id("tuner0", 99);
        let err = host.get_channel_stream(&tuner, &channel, &cancel).await.unwrap_err();
        assert_eq!(err, HtspError::Backend("No such channel".to_string()));

        channel.id = "other_5".to_string();
        let err = host.get_channel_stream(&tuner, &channel, &cancel).await.unwrap_err();
        assert!(matches!(err, HtspError::InvalidChannelId(_)));
    }

    #[tokio::test]
    async fn test_get_programs_is_deterministic() {
        let mock = backend().await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        let cancel = CancellationToken::new();
        let start = Utc.timestamp_opt(T0, 0).unwrap();
        let end = Utc.timestamp_opt(T0 + 3600, 0).unwrap();

        let first = host
            .get_programs(&tuner, "tuner0_5", start, end, &cancel)
            .await
            .unwrap();
        let second = host
            .get_programs(&tuner, "tuner0_5", start, end, &cancel)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0].id, format!("tuner0_5_{}_1", T0 + 100));
        assert_eq!(first[1].channel_id, "tuner0_5");
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let mock = MockBackend::start(MockOptions::default().with_responder(|req: &Message| {
            (req.method() == Some("getTicket")).then_some(Scripted::Silent)
        }))
        .await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        let cancel = CancellationToken::new();
        let channel = ChannelDescriptor {
            id: "tuner0_5".to_string(),
            tuner_host_id: "tuner0".to_string(),
            name: "Five".to_string(),
            number: "5".to_string(),
            image_url: None,
            channel_type: ChannelType::Tv,
            tags: Vec::new(),
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let err = host.get_channel_stream(&tuner, &channel, &cancel).await.unwrap_err();
        assert_eq!(err, HtspError::Cancelled);

        let session = host.sessions().get("tuner0").await.unwrap();
        assert_eq!(session.state(), crate::client::SessionState::Ready);
    }

    #[tokio::test]
    async fn test_operation_ceiling() {
        let mock = MockBackend::start(MockOptions::default().with_responder(|req: &Message| {
            (req.method() == Some("getTicket")).then_some(Scripted::Silent)
        }))
        .await;
        let host = TvheadendTunerHost::new().with_timeout(Duration::from_millis(300));
        let tuner = mock.tuner("tuner0");
        let channel = ChannelDescriptor {
            id: "tuner0_5".to_string(),
            tuner_host_id: "tuner0".to_string(),
            name: "Five".to_string(),
            number: "5".to_string(),
            image_url: None,
            channel_type: ChannelType::Tv,
            tags: Vec::new(),
        };

        let err = host
            .get_channel_stream(&tuner, &channel, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, HtspError::Timeout);
    }

    #[tokio::test]
    async fn test_validate_options() {
        let mock = MockBackend::start(MockOptions::default().with_credentials("viewer", "secret")).await;
        let host = TvheadendTunerHost::new();
        let cancel = CancellationToken::new();

        host.validate_options(&mock.tuner("tuner0"), &cancel).await.unwrap();
        assert!(host.sessions().is_empty().await);

        let mut wrong = mock.tuner("tuner0");
        wrong.options.password = Some("nope".to_string());
        let err = host.validate_options(&wrong, &cancel).await.unwrap_err();
        assert!(matches!(err, HtspError::Authentication(_)));

        let bad_url = TunerHostInfo::new("t", "not a url");
        let err = host.validate_options(&bad_url, &cancel).await.unwrap_err();
        assert!(matches!(err, HtspError::Config(_)));
    }

    #[tokio::test]
    async fn test_remove_tuner() {
        let mock = backend().await;
        let host = TvheadendTunerHost::new();
        let tuner = mock.tuner("tuner0");
        host.get_channels(&tuner, &CancellationToken::new()).await.unwrap();
        assert_eq!(host.sessions().len().await, 1);

        host.remove_tuner("tuner0").await;
        assert!(host.sessions().is_empty().await);
    }
}
