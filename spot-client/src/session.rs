//! Session: the one object a UI talks to. Owns the channel slot, the correlator and the
//! core, and runs the inbound dispatcher and the reminder clock in the background.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use spot_core::{
    CacheSnapshot, Notice, NoticeKind, OpTag, ProtocolError, RefreshSummary, ReservationAttempt,
    ReservationError, Response, SpotCore, SpotId, SpotStatus,
};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelEventKind, ChannelState, EventSender};
use crate::claim;
use crate::config::Config;
use crate::correlator::{Correlator, Dispatch, RequestError};
use crate::launcher::{self, NavigationLauncher};
use crate::notify::{self, LogSink, NoticeSink};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
}

/// Cheap to clone; all clones share one connection and one core.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    core: Arc<tokio::sync::Mutex<SpotCore>>,
    correlator: Correlator,
    channel: Mutex<Option<Channel>>,
    generation: AtomicU64,
    /// A connect is in flight.
    connecting: AtomicBool,
    events: EventSender,
    sink: Arc<dyn NoticeSink>,
    launcher: Arc<dyn NavigationLauncher>,
    clock: Arc<Notify>,
    versions: watch::Sender<u64>,
}

impl Session {
    /// Session with log notices and the launcher named by `nav_command`. Needs a tokio runtime.
    pub fn new(config: Config) -> Self {
        let launcher = launcher::from_command(config.nav_command.as_deref());
        Self::with_parts(config, Arc::new(LogSink), launcher)
    }

    pub fn with_parts(
        config: Config,
        sink: Arc<dyn NoticeSink>,
        launcher: Arc<dyn NavigationLauncher>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let core = Arc::new(tokio::sync::Mutex::new(SpotCore::with_config(config.core_config())));
        let clock = Arc::new(Notify::new());
        let (versions, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            correlator: Correlator::new(config.request_timeout()),
            config,
            core,
            channel: Mutex::new(None),
            generation: AtomicU64::new(0),
            connecting: AtomicBool::new(false),
            events,
            sink,
            launcher,
            clock,
            versions,
        });
        tokio::spawn(notify::run_clock(
            Arc::downgrade(&inner.core),
            inner.clock.clone(),
            inner.sink.clone(),
        ));
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open the channel to the configured endpoint, replacing (and closing) any current one.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.inner.teardown(None, None, false).await;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = self.inner.config.endpoint.clone();
        self.inner.connecting.store(true, Ordering::SeqCst);
        let opened = tokio::time::timeout(
            self.inner.config.request_timeout(),
            Channel::open(&endpoint, generation, self.inner.events.clone()),
        )
        .await;
        self.inner.connecting.store(false, Ordering::SeqCst);
        let opened = opened.unwrap_or_else(|_| Err(ChannelError::ConnectTimeout { endpoint }))?;
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            // A newer connect won the race.
            opened.close();
            return Ok(());
        }
        if let Some(old) = self.inner.slot().replace(opened) {
            old.close();
        }
        Ok(())
    }

    /// Close the channel. Pending requests fail with `ChannelClosed`; live claims abort.
    pub async fn disconnect(&self) {
        self.inner.teardown(None, None, false).await;
    }

    pub fn state(&self) -> ChannelState {
        match self.inner.slot().as_ref() {
            Some(channel) => channel.state(),
            None if self.inner.connecting.load(Ordering::SeqCst) => ChannelState::Connecting,
            None => ChannelState::Disconnected,
        }
    }

    /// Generic request for any operation, including ones the core does not interpret.
    /// A failure is also reported as a notice.
    pub async fn request(&self, op: impl Into<OpTag>, body: Value) -> Result<Response, RequestError> {
        let op = op.into();
        let result = self.send_request(op.clone(), body).await;
        if let Err(e) = &result {
            self.notify(&Notice::general(NoticeKind::RequestFailed, format!("{op} failed: {e}")));
        }
        result
    }

    /// Fetch and apply a RefreshData snapshot.
    pub async fn refresh(&self) -> Result<RefreshSummary, SessionError> {
        let response = self.request(OpTag::RefreshData, Value::Null).await?;
        let summary = self.inner.core.lock().await.on_refresh_response(&response);
        match summary {
            Ok(summary) => {
                self.inner.versions.send_replace(summary.version);
                Ok(summary)
            }
            Err(e) => {
                self.notify(&Notice::general(
                    NoticeKind::RequestFailed,
                    format!("Could not read parking data: {e}"),
                ));
                Err(e.into())
            }
        }
    }

    /// Run a full claim on `spot_id` and return the attempt as it ended.
    pub async fn claim(&self, spot_id: SpotId) -> Result<ReservationAttempt, SessionError> {
        let (key, actions) = self.inner.core.lock().await.begin_claim(spot_id, Instant::now())?;
        claim::drive(self, actions).await;
        let core = self.inner.core.lock().await;
        core.attempt(spot_id)
            .filter(|a| a.key() == key)
            .cloned()
            .ok_or(SessionError::Reservation(ReservationError::UnknownAttempt(spot_id)))
    }

    /// Abort the live claim on `spot_id`. A server hold is released in the background.
    pub async fn cancel(&self, spot_id: SpotId) -> Result<(), SessionError> {
        let actions = self.inner.core.lock().await.cancel(spot_id, Instant::now())?;
        self.spawn_drive(actions);
        Ok(())
    }

    /// Give back an accepted reservation. Returns once the server has answered (or failed).
    pub async fn release(&self, spot_id: SpotId) -> Result<(), SessionError> {
        let actions = self.inner.core.lock().await.release(spot_id, Instant::now())?;
        claim::drive(self, actions).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.inner.core.lock().await.snapshot()
    }

    pub async fn effective_status(&self, spot_id: SpotId) -> Option<SpotStatus> {
        self.inner.core.lock().await.effective_status(spot_id)
    }

    pub async fn attempt(&self, spot_id: SpotId) -> Option<ReservationAttempt> {
        self.inner.core.lock().await.attempt(spot_id).cloned()
    }

    /// Cache version after each applied refresh (requested or pushed).
    pub fn subscribe_refreshes(&self) -> watch::Receiver<u64> {
        self.inner.versions.subscribe()
    }

    /// Refresh every `refresh_interval` while the channel is open. None if disabled.
    /// The loop ends when the last session clone is dropped.
    pub fn spawn_refresh_loop(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.refresh_interval()?;
        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let session = Session { inner };
                if session.state() != ChannelState::Open {
                    continue;
                }
                if let Err(e) = session.refresh().await {
                    debug!(error = %e, "background refresh failed");
                }
            }
        }))
    }

    pub(crate) async fn send_request(&self, op: OpTag, body: Value) -> Result<Response, RequestError> {
        self.send_request_within(op, body, self.inner.config.request_timeout())
            .await
    }

    pub(crate) async fn send_request_within(
        &self,
        op: OpTag,
        body: Value,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        let pending = {
            let slot = self.inner.slot();
            self.inner.correlator.start_within(slot.as_ref(), op, body, timeout)?
        };
        pending.wait().await
    }

    pub(crate) fn core(&self) -> &tokio::sync::Mutex<SpotCore> {
        &self.inner.core
    }

    pub(crate) fn launcher(&self) -> &dyn NavigationLauncher {
        self.inner.launcher.as_ref()
    }

    pub(crate) fn notify(&self, notice: &Notice) {
        self.inner.sink.notify(notice);
    }

    /// Tell the clock that deadlines may have moved.
    pub(crate) fn wake_clock(&self) {
        self.inner.clock.notify_one();
    }

    fn spawn_drive(&self, actions: Vec<spot_core::HostAction>) {
        let session = self.clone();
        tokio::spawn(async move { claim::drive(&session, actions).await });
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the channel (only if it is `generation`, when given), abort live claims,
    /// then fail pending requests.
    async fn teardown(&self, generation: Option<u64>, error: Option<String>, remote: bool) {
        let taken = {
            let mut slot = self.slot();
            let replaced = matches!((slot.as_ref(), generation), (Some(ch), Some(g)) if ch.generation() != g);
            if replaced {
                None
            } else {
                slot.take()
            }
        };
        let Some(channel) = taken else {
            return;
        };
        let generation = channel.generation();
        channel.close();

        let actions = self.core.lock().await.on_channel_closed(Instant::now());
        notify::deliver(self.sink.as_ref(), actions);
        self.clock.notify_one();

        let failure = match &error {
            Some(e) => RequestError::ChannelError(e.clone()),
            None => RequestError::ChannelClosed,
        };
        let failed = self.correlator.fail_all(failure);
        if remote {
            warn!(generation, failed, error = ?error, "connection to server lost");
            self.sink.notify(&Notice::general(
                NoticeKind::ConnectionLost,
                match &error {
                    Some(e) => format!("Lost connection to the parking server: {e}"),
                    None => "The parking server closed the connection.".to_string(),
                },
            ));
        } else {
            info!(generation, failed, "disconnected");
        }
    }

    async fn on_event(&self, event: ChannelEvent) {
        if event.generation != self.generation.load(Ordering::SeqCst) {
            debug!(generation = event.generation, "event from a replaced channel");
            return;
        }
        match event.kind {
            ChannelEventKind::Frame(payload) => {
                if let Dispatch::Unsolicited(response) = self.correlator.on_frame(&payload) {
                    self.on_push(response).await;
                }
            }
            ChannelEventKind::Closed(error) => {
                self.teardown(Some(event.generation), error, true).await;
            }
        }
    }

    /// Server-initiated messages. A RefreshData push is applied like a requested one.
    async fn on_push(&self, response: Response) {
        match response.op {
            Some(OpTag::RefreshData) if response.fields.contains_key("data") => {
                match self.core.lock().await.on_refresh_response(&response) {
                    Ok(summary) => {
                        self.versions.send_replace(summary.version);
                    }
                    Err(e) => warn!(error = %e, "ignoring malformed RefreshData push"),
                }
            }
            _ => debug!(op = ?response.op, status = ?response.status, "unsolicited message ignored"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.clock.notify_one();
        if let Some(channel) = self.slot().take() {
            channel.close();
        }
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_event(event).await;
    }
    debug!("dispatcher stopped");
}
