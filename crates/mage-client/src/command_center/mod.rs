//! Batching command center.
//!
//! Commands are queued synchronously and cut into a single HTTP batch on the
//! next scheduling tick. Only one batch is in flight at a time; commands
//! queued meanwhile wait for the next batch, which is scheduled as soon as the
//! in-flight one completes.
//!
//! # Scheduling
//!
//! `send` never awaits before queueing. The cut-over runs in a spawned task
//! that yields once first, so on a current-thread runtime every `send` made
//! in the same synchronous stretch lands in the same batch.
//!
//! On a multi-thread runtime another worker can pick the cut-over up while
//! the caller is still queueing. Commands are then split across consecutive
//! batches. Each still settles exactly once and batches keep queue order,
//! but a burst is only guaranteed to share one batch on a current-thread
//! runtime.

mod hooks;
pub mod protocol;

pub use hooks::{Hook, HookRegistry};
pub use protocol::CommandOutcome;

use crate::config::{CommandCenterConfig, NetworkConfig};
use crate::error::{MageError, Result};
use crate::router::EventRouter;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

/// Settings for the batch endpoint.
#[derive(Debug, Clone)]
pub struct CommandCenterSettings {
    /// Base URL; command names are appended as a path segment.
    pub url: String,
    /// Bound on one batch exchange.
    pub timeout: Duration,
}

impl CommandCenterSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: NetworkConfig::BATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&CommandCenterConfig> for CommandCenterSettings {
    fn from(config: &CommandCenterConfig) -> Self {
        Self::new(config.url.clone()).with_timeout(config.timeout())
    }
}

/// Signals published by the command center.
#[derive(Debug, Clone)]
pub enum CommandCenterEvent {
    /// A command was appended to the queue.
    Queued { name: String },
    /// A batch cut-over was scheduled.
    Scheduled { query_id: u64 },
    /// A whole batch failed; every command in it was rejected.
    Error(MageError),
    /// An event attached to a command could not be applied.
    Desync(MageError),
}

/// Outcome of a queued command, settled when its batch completes.
#[must_use = "dropping a PendingCommand discards the command's outcome"]
#[derive(Debug)]
pub struct PendingCommand {
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCommand {
    /// A command that failed before it could be queued.
    pub(crate) fn failed(error: MageError) -> Self {
        let (reply, rx) = oneshot::channel();
        let _ = reply.send(Err(error));
        Self { rx }
    }
}

impl Future for PendingCommand {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(MageError::Cancelled)))
    }
}

struct Command {
    name: String,
    params: String,
    reply: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct QueueState {
    queue: Vec<Command>,
    scheduled: bool,
    locked: bool,
    query_id: u64,
}

struct Inner {
    http: reqwest::Client,
    settings: CommandCenterSettings,
    runtime: Handle,
    state: Mutex<QueueState>,
    hooks: RwLock<HookRegistry>,
    router: Arc<EventRouter>,
    events: broadcast::Sender<CommandCenterEvent>,
}

/// Queue, scheduler and batch exchange. Cheap to clone.
#[derive(Clone)]
pub struct CommandCenter {
    inner: Arc<Inner>,
}

impl CommandCenter {
    /// Create a command center on the current tokio runtime.
    ///
    /// Use a current-thread runtime when commands sent together must travel
    /// in one batch; see the module docs.
    pub fn new(
        http: reqwest::Client,
        settings: CommandCenterSettings,
        router: Arc<EventRouter>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| MageError::Config {
            message: format!("command center requires a tokio runtime: {}", e),
        })?;
        if runtime.runtime_flavor() == RuntimeFlavor::MultiThread {
            debug!("Command center on a multi-thread runtime; bursts may span batches");
        }
        let (events, _) = broadcast::channel(NetworkConfig::EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                settings,
                runtime,
                state: Mutex::new(QueueState::default()),
                hooks: RwLock::new(HookRegistry::new()),
                router,
                events,
            }),
        })
    }

    /// Queue a command and return a future for its outcome.
    ///
    /// `params` should serialize to a JSON array (a `Vec`, a tuple or a
    /// `json!([...])`). The command is queued before this returns; the future
    /// settles once its batch completes. Errors, including parameter
    /// serialization failures, are only ever reported through the future.
    pub fn send<P: Serialize>(&self, name: impl Into<String>, params: P) -> PendingCommand {
        let params = match serde_json::to_string(&params) {
            Ok(params) => params,
            Err(e) => return PendingCommand::failed(e.into()),
        };

        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(Command {
            name: name.into(),
            params,
            reply,
        });

        PendingCommand { rx }
    }

    /// Register a header hook, applied from the next batch on.
    pub fn register_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn(&[String]) -> Option<Map<String, Value>> + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, Arc::new(hook));
    }

    pub fn unregister_hook(&self, name: &str) -> bool {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(name)
    }

    /// Subscribe to queue/schedule/error/desync signals.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandCenterEvent> {
        self.inner.events.subscribe()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.inner.router
    }

    /// Commands waiting for the next batch.
    pub fn queue_len(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Whether a batch is in flight.
    pub fn is_locked(&self) -> bool {
        self.inner.lock_state().locked
    }

    /// Query id of the most recently scheduled batch (0 before the first).
    pub fn last_query_id(&self) -> u64 {
        self.inner.lock_state().query_id
    }
}

impl fmt::Debug for CommandCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("CommandCenter")
            .field("url", &self.inner.settings.url)
            .field("queued", &state.queue.len())
            .field("locked", &state.locked)
            .field("query_id", &state.query_id)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CommandCenterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(self: &Arc<Self>, command: Command) {
        let name = command.name.clone();
        self.lock_state().queue.push(command);
        self.emit(CommandCenterEvent::Queued { name });
        self.schedule();
    }

    /// Post a cut-over unless one is pending or a batch is in flight.
    fn schedule(self: &Arc<Self>) {
        let query_id = {
            let mut state = self.lock_state();
            if state.locked || state.scheduled {
                return;
            }
            state.query_id += 1;
            state.scheduled = true;
            state.query_id
        };

        self.emit(CommandCenterEvent::Scheduled { query_id });

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::task::yield_now().await;
            inner.dispatch_batch(query_id).await;
        });
    }

    async fn dispatch_batch(self: Arc<Self>, query_id: u64) {
        let batch = {
            let mut state = self.lock_state();
            state.scheduled = false;
            if state.queue.is_empty() {
                return;
            }
            state.locked = true;
            std::mem::take(&mut state.queue)
        };

        let result = self.exchange(&batch, query_id).await;
        self.unlock();

        match result {
            Ok(body) => self.settle(batch, &body),
            Err(e) => self.fail_batch(batch, e),
        }
    }

    async fn exchange(&self, batch: &[Command], query_id: u64) -> Result<String> {
        let names: Vec<String> = batch.iter().map(|c| c.name.clone()).collect();
        let params: Vec<String> = batch.iter().map(|c| c.params.clone()).collect();

        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let header = hooks.build_header(&params);

        let url = protocol::batch_url(&self.settings.url, &names, query_id)?;
        let body = protocol::encode_body(&header, &params)?;
        let timeout = self.settings.timeout;

        debug!(
            "Sending batch {} with {} commands: {}",
            query_id,
            batch.len(),
            names.join(",")
        );

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, NetworkConfig::BATCH_CONTENT_TYPE)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MageError::from_request(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MageError::from_status(status));
        }

        response
            .text()
            .await
            .map_err(|e| MageError::from_request(e, timeout))
    }

    fn unlock(self: &Arc<Self>) {
        let pending = {
            let mut state = self.lock_state();
            state.locked = false;
            !state.queue.is_empty()
        };
        if pending {
            self.schedule();
        }
    }

    fn settle(&self, batch: Vec<Command>, body: &str) {
        let outcomes = match protocol::decode_response(body, batch.len()) {
            Ok(outcomes) => outcomes,
            Err(e) => return self.fail_batch(batch, e),
        };

        for (command, outcome) in batch.into_iter().zip(outcomes) {
            if let Err(e) = self.router.route_all(&outcome.events) {
                if e.is_desync() {
                    warn!("Desync while applying events of {}: {}", command.name, e);
                    self.emit(CommandCenterEvent::Desync(e.clone()));
                }
                let _ = command.reply.send(Err(e));
                continue;
            }

            let reply = match outcome.error_code {
                Some(code) => {
                    debug!("Command {} failed with {}", command.name, code);
                    Err(MageError::Command { code })
                }
                None => Ok(outcome.result),
            };
            let _ = command.reply.send(reply);
        }
    }

    fn fail_batch(&self, batch: Vec<Command>, error: MageError) {
        warn!("Batch of {} commands failed: {}", batch.len(), error);
        for command in batch {
            let _ = command.reply.send(Err(error.clone()));
        }
        self.emit(CommandCenterEvent::Error(error));
    }
}
