//! Long and short polling transport.

use super::{parse_delivery, DeliveryBatch, StreamEvent, TransportStyle};
use crate::config::{millis_or, NetworkConfig, PollingConfig, StreamConfig};
use crate::error::{MageError, Result};
use crate::router::EventRouter;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use url::Url;

/// Timing and endpoint of one polling transport.
#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub url: String,
    /// Pause after a successful or timed out poll.
    pub after_request_interval: Duration,
    /// Pause after a failed poll.
    pub after_error_interval: Duration,
    /// Bound on a single poll request.
    pub poll_timeout: Duration,
}

impl PollingSettings {
    pub fn new(style: TransportStyle, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            after_request_interval: style.default_after_request_interval(),
            after_error_interval: StreamConfig::AFTER_ERROR_INTERVAL,
            poll_timeout: StreamConfig::POLL_TIMEOUT,
        }
    }

    pub fn from_config(style: TransportStyle, config: &PollingConfig) -> Self {
        let defaults = Self::new(style, config.url.clone());
        Self {
            after_request_interval: millis_or(
                config.after_request_interval,
                defaults.after_request_interval,
            ),
            after_error_interval: millis_or(
                config.after_error_interval,
                defaults.after_error_interval,
            ),
            poll_timeout: millis_or(config.timeout, defaults.poll_timeout),
            ..defaults
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_intervals(mut self, after_request: Duration, after_error: Duration) -> Self {
        self.after_request_interval = after_request;
        self.after_error_interval = after_error;
        self
    }
}

#[derive(Default)]
struct PollState {
    running: bool,
    session_key: Option<String>,
    confirm_ids: Vec<String>,
    last_error: Option<MageError>,
    shutdown: Option<oneshot::Sender<()>>,
}

enum PollOutcome {
    TimedOut,
    Received(String),
    Failed {
        error: MageError,
        data: Option<String>,
    },
}

struct Inner {
    style: TransportStyle,
    settings: PollingSettings,
    endpoint: Url,
    http: reqwest::Client,
    router: Arc<EventRouter>,
    runtime: Handle,
    state: Mutex<PollState>,
    events: broadcast::Sender<StreamEvent>,
}

/// Polling message stream client. Cheap to clone.
#[derive(Clone)]
pub struct PollingClient {
    inner: Arc<Inner>,
}

impl PollingClient {
    /// Create a stopped client on the current tokio runtime.
    pub fn new(
        style: TransportStyle,
        settings: PollingSettings,
        http: reqwest::Client,
        router: Arc<EventRouter>,
    ) -> Result<Self> {
        let endpoint = Url::parse(&settings.url).map_err(|e| MageError::Config {
            message: format!("invalid {} url {}: {}", style, settings.url, e),
        })?;
        let runtime = Handle::try_current().map_err(|e| MageError::Config {
            message: format!("message stream requires a tokio runtime: {}", e),
        })?;
        let (events, _) = broadcast::channel(NetworkConfig::EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                style,
                settings,
                endpoint,
                http,
                router,
                runtime,
                state: Mutex::new(PollState::default()),
                events,
            }),
        })
    }

    pub fn style(&self) -> TransportStyle {
        self.inner.style
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.inner.settings
    }

    /// Start polling. A running stream is left alone unless `restart` is set,
    /// in which case the in-flight poll is abandoned and a fresh one begins.
    pub fn start(&self, restart: bool) {
        let shutdown = {
            let mut state = self.inner.lock_state();
            if state.running {
                if !restart {
                    return;
                }
                if let Some(tx) = state.shutdown.take() {
                    let _ = tx.send(());
                }
                debug!("Restarting {} message stream", self.inner.style);
            }

            let (tx, rx) = oneshot::channel();
            state.running = true;
            state.shutdown = Some(tx);
            rx
        };

        info!(
            "Starting {} message stream at {}",
            self.inner.style, self.inner.endpoint
        );
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(inner.run(shutdown));
    }

    /// Stop polling and abort the in-flight request or pause.
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(tx) = state.shutdown.take() {
            let _ = tx.send(());
        }
        info!("Stopped {} message stream", self.inner.style);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Queue a delivery id for confirmation on the next poll.
    pub fn confirm(&self, id: impl Into<String>) {
        self.inner.lock_state().confirm_ids.push(id.into());
    }

    /// Ids that will be sent with the next poll.
    pub fn pending_confirmations(&self) -> Vec<String> {
        self.inner.lock_state().confirm_ids.clone()
    }

    /// Set or clear the session key sent with every poll.
    pub fn set_session_key(&self, key: Option<String>) {
        self.inner.lock_state().session_key = key;
    }

    pub fn session_key(&self) -> Option<String> {
        self.inner.lock_state().session_key.clone()
    }

    /// The error of the most recent poll, cleared by the next success.
    pub fn last_error(&self) -> Option<MageError> {
        self.inner.lock_state().last_error.clone()
    }

    /// Subscribe to delivery/error/desync signals.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Handle for router listeners, which must not keep the stream alive.
    pub(crate) fn downgrade(&self) -> WeakPollingClient {
        WeakPollingClient(Arc::downgrade(&self.inner))
    }
}

pub(crate) struct WeakPollingClient(Weak<Inner>);

impl WeakPollingClient {
    pub(crate) fn upgrade(&self) -> Option<PollingClient> {
        self.0.upgrade().map(|inner| PollingClient { inner })
    }
}

impl fmt::Debug for PollingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("PollingClient")
            .field("style", &self.inner.style)
            .field("url", &self.inner.settings.url)
            .field("running", &state.running)
            .field("pending_confirmations", &state.confirm_ids.len())
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let Some(url) = self.next_request() else {
                break;
            };

            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                outcome = self.poll(url) => outcome,
            };
            let pause = self.handle(outcome);

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!("{} poll loop exited", self.style);
    }

    /// Build the next poll URL, taking the pending confirmations with it.
    fn next_request(&self) -> Option<Url> {
        let mut state = self.lock_state();
        if !state.running {
            return None;
        }

        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("transport", self.style.as_str());
            if let Some(key) = &state.session_key {
                query.append_pair("sessionKey", key);
            }
            if !state.confirm_ids.is_empty() {
                query.append_pair("confirmIds", &state.confirm_ids.join(","));
            }
        }
        state.confirm_ids.clear();
        Some(url)
    }

    async fn poll(&self, url: Url) -> PollOutcome {
        let timeout = self.settings.poll_timeout;
        let response = match self.http.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return PollOutcome::TimedOut,
            Err(e) => {
                return PollOutcome::Failed {
                    error: MageError::from_request(e, timeout),
                    data: None,
                }
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return PollOutcome::TimedOut,
            Err(e) => {
                return PollOutcome::Failed {
                    error: MageError::from_request(e, timeout),
                    data: None,
                }
            }
        };

        if !status.is_success() {
            return PollOutcome::Failed {
                error: MageError::from_status(status),
                data: Some(body),
            };
        }
        PollOutcome::Received(body)
    }

    /// Process a poll outcome and return the pause before the next one.
    fn handle(&self, outcome: PollOutcome) -> Duration {
        match outcome {
            PollOutcome::TimedOut => {
                debug!("{} poll timed out, polling again", self.style);
                self.lock_state().last_error = None;
                self.settings.after_request_interval
            }
            PollOutcome::Received(body) => match parse_delivery(&body) {
                Ok(batches) => {
                    self.lock_state().last_error = None;
                    if let Some(batches) = batches {
                        self.deliver(batches);
                    }
                    self.settings.after_request_interval
                }
                Err(error) => self.fail(error, Some(body)),
            },
            PollOutcome::Failed { error, data } => self.fail(error, data),
        }
    }

    fn fail(&self, error: MageError, data: Option<String>) -> Duration {
        warn!(
            "{} poll failed, retrying in {:?}: {}",
            self.style, self.settings.after_error_interval, error
        );
        self.lock_state().last_error = Some(error.clone());
        self.emit(StreamEvent::Error { error, data });
        self.settings.after_error_interval
    }

    /// Route every message, then queue the batch for confirmation.
    fn deliver(&self, batches: Vec<DeliveryBatch>) {
        for batch in &batches {
            for message in &batch.messages {
                if let Err(e) = self.router.route(&message.event_name, &message.event_data) {
                    warn!("Desync on pushed event {}: {}", message.event_name, e);
                    self.emit(StreamEvent::Desync(e));
                }
            }
            self.lock_state().confirm_ids.push(batch.id.clone());
        }

        debug!("Delivered {} message batches", batches.len());
        self.emit(StreamEvent::Delivery(batches));
    }
}
