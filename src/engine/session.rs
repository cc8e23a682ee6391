// Scanner session state machine: session identity, long-poll events and capture completion.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::block_store::{BlockNumber, BlockStore};
use super::downloader::{self, BlockDownloader};
use super::events::{event_channel, DeliveredImage, EventReceiver, EventSender, SessionEvent};
use super::stats::{PipelineStats, StatsSnapshot};
use crate::config::{ClientConfig, FIRST_IMAGE_BLOCK, RELEASE_ALL_LAST_BLOCK};
use crate::error::{Result, ScanError};
use crate::source::http_source::HttpTransport;
use crate::source::messages::{
    CommandRequest, CommandResponse, EventRecord, SessionResponse, SessionState, SessionStatus,
    StatusDetected,
};
use crate::source::traits::ScannerTransport;

#[derive(Debug, Default)]
struct PollState {
    enabled: bool,
    in_flight: bool,
    retries: u32,
}

/// Mutable session data. Guarded by one lock, never held across an await.
pub(crate) struct SessionShared {
    session_id: Option<String>,
    revision: u64,
    state: SessionState,
    status: Option<SessionStatus>,
    done_capturing: bool,
    image_blocks_drained: bool,
    paused: bool,
    stopping: bool,
    capture_finished: bool,
    poll: PollState,
    pub(crate) blocks: BlockStore,
    /// Every file delivered so far, independent of event subscribers keeping up.
    pub(crate) delivered: Vec<DeliveredImage>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            session_id: None,
            revision: 0,
            state: SessionState::NoSession,
            status: None,
            done_capturing: false,
            image_blocks_drained: false,
            paused: false,
            stopping: false,
            capture_finished: false,
            poll: PollState::default(),
            blocks: BlockStore::new(),
            delivered: Vec::new(),
        }
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn should_auto_close(&self) -> bool {
        self.done_capturing
            && self.image_blocks_drained
            && !self.paused
            && !self.stopping
            && !self.capture_finished
    }
}

/// Everything a session's tasks share. Spawned tasks hold an `Arc` to it and
/// check [`SessionCore::is_alive`] before touching state.
pub(crate) struct SessionCore {
    pub(crate) transport: Arc<dyn ScannerTransport>,
    pub(crate) config: ClientConfig,
    pub(crate) state: Mutex<SessionShared>,
    pub(crate) downloader: BlockDownloader,
    pub(crate) stats: PipelineStats,
    events: EventSender,
    shutdown: CancellationToken,
}

impl SessionCore {
    pub(crate) fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_error(&self, err: ScanError) {
        self.emit(SessionEvent::Error(Arc::new(err)));
    }

    fn session_id(&self) -> Result<String> {
        self.state
            .lock()
            .session_id
            .clone()
            .ok_or(ScanError::NoSession)
    }

    /// Send a command and apply any session data it carries. Success is not checked.
    async fn command(self: &Arc<Self>, request: &CommandRequest) -> Result<CommandResponse> {
        let response = self.transport.command(request).await?;
        if let Some(session) = &response.results.session {
            self.update_session(session);
        }
        Ok(response)
    }

    /// Apply session data from a response or event.
    ///
    /// Data older than the tracked revision is dropped and `false` returned.
    /// Listeners hear about state and status only when they change.
    pub(crate) fn update_session(self: &Arc<Self>, session: &SessionResponse) -> bool {
        if !self.is_alive() {
            debug!("session torn down, ignoring revision {}", session.revision);
            return false;
        }
        let mut notifications = Vec::new();
        let (release_all, auto_close) = {
            let mut st = self.state.lock();
            if session.revision < st.revision {
                debug!(
                    "dropping stale session data revision={} current={}",
                    session.revision, st.revision
                );
                return false;
            }
            if let Some(id) = st.session_id.as_deref() {
                if id != session.session_id {
                    warn!(
                        "ignoring session data for session={} (ours is {})",
                        session.session_id, id
                    );
                    return false;
                }
            }

            let prev_state = st.state;
            let prev_status = st.status;
            st.revision = session.revision;
            st.state = session.state;
            st.status = Some(session.status);
            if let Some(done) = session.done_capturing {
                st.done_capturing = done;
            }
            if let Some(drained) = session.image_blocks_drained {
                st.image_blocks_drained = drained;
            }

            if prev_state != st.state {
                info!("session state {:?} -> {:?}", prev_state, st.state);
                notifications.push(SessionEvent::StateChanged { state: st.state });
            }
            if prev_status != st.status {
                info!(
                    "session status detected={:?} success={}",
                    session.status.detected, session.status.success
                );
                notifications.push(SessionEvent::StatusChanged {
                    detected: session.status.detected,
                    success: session.status.success,
                });
            }
            if st.state == SessionState::NoSession {
                st.poll.enabled = false;
            }

            let release_all =
                st.state == SessionState::Closed && prev_state != SessionState::Closed && st.stopping;
            let auto_close = st.should_auto_close();
            if auto_close {
                st.stopping = true;
                st.poll.enabled = false;
            }
            (release_all, auto_close)
        };

        for event in notifications {
            self.emit(event);
        }

        if release_all {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = core
                    .release_image_blocks(FIRST_IMAGE_BLOCK, RELEASE_ALL_LAST_BLOCK)
                    .await
                {
                    warn!("releasing outstanding image blocks failed: {}", e);
                    if core.is_alive() {
                        core.emit_error(e);
                    }
                }
            });
        }

        if auto_close {
            let core = Arc::clone(self);
            tokio::spawn(async move { core.finish_capture().await });
        }

        true
    }

    /// Close the session after capture is done, then report completion whatever the close outcome.
    async fn finish_capture(self: Arc<Self>) {
        info!("capture done and image blocks drained, closing session");
        if let Err(e) = self.send_close().await {
            warn!("closing session after capture failed: {}", e);
        }

        // Anything already persisted locally goes out before completion is reported.
        downloader::deliver_completed(&self).await;

        let first = {
            let mut st = self.state.lock();
            st.poll.enabled = false;
            !std::mem::replace(&mut st.capture_finished, true)
        };
        if first && self.is_alive() {
            info!("capture finished");
            self.emit(SessionEvent::CaptureFinished);
        }
    }

    async fn send_close(self: &Arc<Self>) -> Result<()> {
        let id = self.session_id()?;
        let response = self.command(&CommandRequest::close_session(&id)).await?;
        if !response.results.success {
            return Err(ScanError::CommandFailed {
                method: "closeSession",
                code: response.results.code,
            });
        }
        Ok(())
    }

    /// Ask the scanner to free an inclusive range of image blocks.
    pub(crate) async fn release_image_blocks(
        self: &Arc<Self>,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<()> {
        let id = self.session_id()?;
        let response = self
            .command(&CommandRequest::release_image_blocks(&id, from, to))
            .await?;
        if !response.results.success {
            return Err(ScanError::ReleaseImageBlocksFailed {
                from,
                to,
                code: response.results.code,
            });
        }
        Ok(())
    }

    fn enqueue_blocks(self: &Arc<Self>, blocks: &[BlockNumber]) {
        let added = self.state.lock().blocks.enqueue(blocks);
        if !added.is_empty() {
            info!("enqueued image blocks {:?}", added);
        }
        downloader::fill_window(self);
    }

    fn process_events(self: &Arc<Self>, events: &[EventRecord]) {
        for record in events {
            debug!(
                "event {} revision={}",
                record.event, record.session.revision
            );
            if !self.update_session(&record.session) {
                continue;
            }
            if let Some(blocks) = &record.session.image_blocks {
                self.enqueue_blocks(blocks);
            }
        }
    }

    /// Start the long-poll loop unless one is already running or polling is off.
    fn start_polling(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if !st.poll.enabled || st.poll.in_flight || !self.is_alive() {
                return;
            }
            st.poll.in_flight = true;
        }
        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.poll_loop().await;
            core.state.lock().poll.in_flight = false;
            debug!("event polling stopped");
        });
    }

    async fn poll_loop(self: &Arc<Self>) {
        loop {
            let request = {
                let st = self.state.lock();
                if !st.poll.enabled {
                    return;
                }
                let Some(id) = st.session_id.as_deref() else {
                    return;
                };
                CommandRequest::wait_for_events(id, st.revision)
            };

            let result = tokio::select! {
                r = self.transport.command(&request) => r,
                _ = self.shutdown.cancelled() => return,
            };

            match result {
                Err(e) => {
                    let attempts = {
                        let mut st = self.state.lock();
                        st.poll.retries += 1;
                        st.poll.retries
                    };
                    if attempts >= self.config.poll_retry_limit {
                        error!("waitForEvents failed {} times, giving up: {}", attempts, e);
                        self.state.lock().poll.enabled = false;
                        self.emit_error(ScanError::PollingAbandoned { attempts });
                        return;
                    }
                    warn!("waitForEvents failed (attempt {}): {}", attempts, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_retry_delay()) => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                Ok(response) if !response.results.success => {
                    error!("waitForEvents reported failure code={:?}", response.results.code);
                    self.state.lock().poll.enabled = false;
                    self.emit_error(ScanError::CommandFailed {
                        method: "waitForEvents",
                        code: response.results.code,
                    });
                    return;
                }
                Ok(response) => {
                    if !self.is_alive() {
                        return;
                    }
                    self.process_events(&response.results.events);
                    self.state.lock().poll.retries = 0;
                }
            }
        }
    }

    fn teardown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let leftovers = {
            let mut st = self.state.lock();
            st.poll.enabled = false;
            st.blocks.drain_downloaded()
        };
        debug!("session teardown, {} undelivered blocks dropped", leftovers.len());
        self.downloader.remove_scratch();
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub revision: u64,
    pub state: SessionState,
    pub detected: Option<StatusDetected>,
    pub done_capturing: bool,
    pub image_blocks_drained: bool,
    pub paused: bool,
    pub stopping: bool,
    pub polling: bool,
    pub capture_finished: bool,
    pub delivered_watermark: BlockNumber,
    pub downloads_in_flight: usize,
    pub tracked_blocks: usize,
    pub stats: StatsSnapshot,
}

/// One client run against one scanner.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Create a session over `transport`. Nothing is sent until [`Session::open`].
    pub fn new(transport: Arc<dyn ScannerTransport>, config: ClientConfig) -> Result<Self> {
        let downloader = BlockDownloader::new(&config)?;
        let (events, _) = event_channel(config.event_capacity.max(1));
        let core = Arc::new(SessionCore {
            transport,
            config,
            state: Mutex::new(SessionShared::new()),
            downloader,
            stats: PipelineStats::new(),
            events,
            shutdown: CancellationToken::new(),
        });
        Ok(Self { core })
    }

    /// Convenience constructor using the HTTP transport.
    pub fn connect(base_url: &str, config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(base_url)?);
        Self::new(transport, config)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.core.events.subscribe()
    }

    /// Resolve the capability token, create the session and start polling for events.
    pub async fn open(&self) -> Result<()> {
        let info = self.core.transport.resolve_token().await?;
        debug!("resolved token for {}", info.device_type);

        let response = self
            .core
            .transport
            .command(&CommandRequest::create_session())
            .await?;
        if !response.results.success {
            return Err(ScanError::CommandFailed {
                method: "createSession",
                code: response.results.code,
            });
        }
        let session = response
            .results
            .session
            .as_ref()
            .filter(|s| !s.session_id.is_empty())
            .ok_or(ScanError::MissingSessionId)?;

        {
            let mut st = self.core.state.lock();
            let mut fresh = SessionShared::new();
            fresh.session_id = Some(session.session_id.clone());
            fresh.paused = st.paused;
            fresh.poll.enabled = true;
            fresh.poll.in_flight = st.poll.in_flight;
            *st = fresh;
        }
        self.core.update_session(session);
        info!("session {} opened", session.session_id);

        self.core.start_polling();
        Ok(())
    }

    /// Send a capability task. The task JSON is passed through untouched.
    pub async fn send_task(&self, task: Value) -> Result<()> {
        let id = self.core.session_id()?;
        self.checked(CommandRequest::send_task(&id, task)).await
    }

    pub async fn start_capturing(&self) -> Result<()> {
        let id = self.core.session_id()?;
        self.checked(CommandRequest::start_capturing(&id)).await
    }

    pub async fn stop_capturing(&self) -> Result<()> {
        let id = self.core.session_id()?;
        self.checked(CommandRequest::stop_capturing(&id)).await
    }

    pub async fn release_image_blocks(&self, from: BlockNumber, to: BlockNumber) -> Result<()> {
        self.core.release_image_blocks(from, to).await
    }

    /// Close the session. Only the first call reaches the scanner.
    pub async fn close_session(&self) -> Result<()> {
        {
            let mut st = self.core.state.lock();
            if st.stopping {
                debug!("close already in progress");
                return Ok(());
            }
            st.stopping = true;
        }
        self.core.send_close().await
    }

    /// Pausing holds off the automatic close once capture is done.
    pub fn set_paused(&self, paused: bool) {
        let auto_close = {
            let mut st = self.core.state.lock();
            st.paused = paused;
            let auto_close = st.should_auto_close();
            if auto_close {
                st.stopping = true;
                st.poll.enabled = false;
            }
            auto_close
        };
        if auto_close {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move { core.finish_capture().await });
        }
    }

    /// Files delivered so far, in block order.
    pub fn delivered_images(&self) -> Vec<DeliveredImage> {
        self.core.state.lock().delivered.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = self.core.state.lock();
        SessionSnapshot {
            session_id: st.session_id.clone(),
            revision: st.revision,
            state: st.state,
            detected: st.status.and_then(|s| s.detected),
            done_capturing: st.done_capturing,
            image_blocks_drained: st.image_blocks_drained,
            paused: st.paused,
            stopping: st.stopping,
            polling: st.poll.enabled,
            capture_finished: st.capture_finished,
            delivered_watermark: st.blocks.delivered_watermark(),
            downloads_in_flight: st.blocks.in_flight(),
            tracked_blocks: st.blocks.tracked(),
            stats: self.core.stats.snapshot(),
        }
    }

    /// Stop polling, abandon in-flight work and remove the scratch directory.
    pub fn shutdown(&self) {
        self.core.teardown();
    }

    async fn checked(&self, request: CommandRequest) -> Result<()> {
        let response = self.core.command(&request).await?;
        if !response.results.success {
            return Err(ScanError::CommandFailed {
                method: request.method,
                code: response.results.code,
            });
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Session dropped, tearing down");
        self.core.teardown();
    }
}
