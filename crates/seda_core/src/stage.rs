use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use seda_error::{Result, SedaError};
use tracing::{debug, info, trace};

use crate::event::{CallbackContext, StageEvent};
use crate::history::HistoryKind;
use crate::thread_pool::{PoolShared, ThreadPool};

/// Stage specific behavior.
///
/// A handler receives events from its stage's queue on a pool thread. Every
/// event handed to a handler must eventually be forwarded to another stage or
/// completed (`done`, `done_immediate`, `done_timeout`, `discard`).
pub trait StageHandler: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Apply configured properties. Called once before the stage is
    /// connected.
    fn set_properties(&mut self, _properties: &StageProperties) -> Result<()> {
        Ok(())
    }

    /// Validate and cache next stages. Called during `connect`, an error
    /// prevents the stage from connecting.
    fn initialize(&self, _stage: &Arc<Stage>) -> Result<()> {
        Ok(())
    }

    fn handle_event(&self, stage: &Arc<Stage>, event: StageEvent);

    /// Called when a callback registered by this stage fires.
    fn callback_event(
        &self,
        _stage: &Arc<Stage>,
        event: StageEvent,
        _context: Option<CallbackContext>,
    ) {
        event.done_immediate();
    }

    /// Called when a callback registered by this stage fires after the
    /// event's deadline passed.
    fn timeout_event(
        &self,
        stage: &Arc<Stage>,
        event: StageEvent,
        context: Option<CallbackContext>,
    ) {
        debug!(stage = %stage.name(), "event timed out");
        self.callback_event(stage, event, context);
    }

    /// Called at the start of `disconnect`, before waiting for outstanding
    /// events.
    fn disconnect_prepare(&self, _stage: &Arc<Stage>) {}

    /// Release resources. The stage may be initialized again afterwards.
    fn cleanup(&self, _stage: &Arc<Stage>) {}
}

/// Connection state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unconnected,
    Connected,
    Draining,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug)]
enum Status {
    Unconnected,
    Connected(Arc<PoolShared>),
    Draining,
}

#[derive(Debug)]
struct StageQueue {
    events: VecDeque<StageEvent>,
    status: Status,
    /// Events scheduled on the pool that haven't finished executing.
    outstanding: usize,
}

#[derive(Debug, Default)]
struct StageWiring {
    pool: Option<Arc<PoolShared>>,
    next_stages: Vec<Arc<Stage>>,
}

/// A named processing step with an input queue.
pub struct Stage {
    name: Arc<str>,
    handler: Box<dyn StageHandler>,
    queue: Mutex<StageQueue>,
    drained: Condvar,
    wiring: RwLock<StageWiring>,
}

impl Stage {
    pub fn new(name: &str, handler: impl StageHandler) -> Arc<Stage> {
        Self::from_boxed(name, Box::new(handler))
    }

    pub fn from_boxed(name: &str, handler: Box<dyn StageHandler>) -> Arc<Stage> {
        Arc::new(Stage {
            name: name.into(),
            handler,
            queue: Mutex::new(StageQueue {
                events: VecDeque::new(),
                status: Status::Unconnected,
                outstanding: 0,
            }),
            drained: Condvar::new(),
            wiring: RwLock::new(StageWiring::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Get the handler as a concrete type.
    pub fn handler_as<T: StageHandler>(&self) -> Option<&T> {
        self.handler.as_any().downcast_ref::<T>()
    }

    /// Assign the thread pool this stage runs on.
    ///
    /// Panics if the stage is connected.
    pub fn set_pool(&self, pool: &ThreadPool) {
        self.set_pool_shared(pool.shared().clone());
    }

    pub(crate) fn set_pool_shared(&self, pool: Arc<PoolShared>) {
        assert!(
            matches!(self.queue.lock().status, Status::Unconnected),
            "Cannot change the thread pool of connected stage {}",
            self.name
        );
        self.wiring.write().pool = Some(pool);
    }

    pub(crate) fn pool_shared(&self) -> Option<Arc<PoolShared>> {
        self.wiring.read().pool.clone()
    }

    pub fn pool_name(&self) -> Option<String> {
        self.wiring.read().pool.as_ref().map(|p| p.name().to_string())
    }

    /// Append a next stage.
    pub fn push_stage(&self, next: Arc<Stage>) {
        self.wiring.write().next_stages.push(next);
    }

    /// Remove all next stages.
    pub fn clear_next_stages(&self) {
        self.wiring.write().next_stages.clear();
    }

    /// Snapshot of the next stages in configured order.
    pub fn next_stages(&self) -> Vec<Arc<Stage>> {
        self.wiring.read().next_stages.clone()
    }

    pub fn next_stage(&self, idx: usize) -> Option<Arc<Stage>> {
        self.wiring.read().next_stages.get(idx).cloned()
    }

    pub fn status(&self) -> StageState {
        match self.queue.lock().status {
            Status::Unconnected => StageState::Unconnected,
            Status::Connected(_) => StageState::Connected,
            Status::Draining => StageState::Draining,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.queue.lock().status, Status::Connected(_))
    }

    /// Number of queued events.
    pub fn qlen(&self) -> usize {
        self.queue.lock().events.len()
    }

    pub fn qempty(&self) -> bool {
        self.queue.lock().events.is_empty()
    }

    /// Number of events scheduled on the pool that haven't finished
    /// executing.
    pub fn outstanding(&self) -> usize {
        self.queue.lock().outstanding
    }

    /// Add an event to this stage.
    ///
    /// A connected stage schedules the event on its pool. An unconnected
    /// stage holds onto the event until it's connected. A draining stage
    /// rejects the event.
    pub fn add_event(self: &Arc<Self>, event: StageEvent) -> Result<(), RejectedEvent> {
        self.enqueue(event, true)
    }

    /// Add an event whose callback should be replayed on this stage. Only
    /// accepted while the stage is connected.
    pub(crate) fn reschedule_event(
        self: &Arc<Self>,
        event: StageEvent,
    ) -> Result<(), RejectedEvent> {
        self.enqueue(event, false)
    }

    fn enqueue(self: &Arc<Self>, event: StageEvent, backlog: bool) -> Result<(), RejectedEvent> {
        let mut queue = self.queue.lock();
        let pool = match &queue.status {
            Status::Connected(pool) => Some(pool.clone()),
            Status::Unconnected if backlog => None,
            Status::Unconnected | Status::Draining => {
                return Err(RejectedEvent {
                    stage: self.name.clone(),
                    event,
                });
            }
        };
        queue.events.push_back(event);

        match pool {
            Some(pool) => {
                queue.outstanding += 1;
                drop(queue);
                pool.schedule(self.clone());
            }
            None => trace!(stage = %self.name, "queued event on unconnected stage"),
        }

        Ok(())
    }

    /// Connect the stage, allowing it to process events.
    ///
    /// The stage must have a thread pool and its handler must initialize
    /// successfully. Events queued while unconnected are scheduled.
    ///
    /// Panics if the stage is not unconnected.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        assert_eq!(
            StageState::Unconnected,
            self.status(),
            "Cannot connect stage {}",
            self.name
        );

        let pool = self.pool_shared().ok_or_else(|| {
            SedaError::new("Stage has no thread pool").with_field("stage", &self.name)
        })?;

        self.handler.initialize(self).map_err(|e| {
            SedaError::with_source("Failed to initialize stage", Box::new(e))
                .with_field("stage", &self.name)
        })?;

        let backlog = {
            let mut queue = self.queue.lock();
            let backlog = queue.events.len();
            queue.outstanding += backlog;
            queue.status = Status::Connected(pool.clone());
            backlog
        };

        for _ in 0..backlog {
            pool.schedule(self.clone());
        }

        info!(stage = %self.name, pool = %pool.name(), backlog, "connected stage");

        Ok(())
    }

    /// Disconnect the stage.
    ///
    /// New events are rejected, then blocks until all scheduled events have
    /// finished. The handler is cleaned up and the pool and next stages are
    /// cleared.
    ///
    /// Panics if the stage is not connected.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut queue = self.queue.lock();
            assert!(
                matches!(queue.status, Status::Connected(_)),
                "Cannot disconnect stage {}, stage not connected",
                self.name
            );
            queue.status = Status::Draining;
        }

        debug!(stage = %self.name, "draining stage");
        self.handler.disconnect_prepare(self);

        {
            let mut queue = self.queue.lock();
            while queue.outstanding > 0 {
                self.drained.wait(&mut queue);
            }
        }

        self.handler.cleanup(self);

        {
            let mut wiring = self.wiring.write();
            wiring.pool = None;
            wiring.next_stages.clear();
        }

        self.queue.lock().status = Status::Unconnected;
        info!(stage = %self.name, "disconnected stage");
    }

    /// Pop the next event.
    ///
    /// Panics if the queue is empty. Every run queue entry for this stage
    /// corresponds to a queued event.
    pub(crate) fn remove_event(&self) -> StageEvent {
        let Some(event) = self.queue.lock().events.pop_front() else {
            panic!("Run queue entry for stage {} with an empty queue", self.name);
        };
        event
    }

    /// Mark a scheduled event as finished.
    pub(crate) fn release_event(&self) {
        let mut queue = self.queue.lock();
        assert!(queue.outstanding > 0, "Released more events than scheduled");
        queue.outstanding -= 1;
        if queue.outstanding == 0 && !matches!(queue.status, Status::Connected(_)) {
            self.drained.notify_all();
        }
    }

    pub(crate) fn run_handle(self: &Arc<Self>, event: StageEvent) {
        trace!(stage = %self.name, "handling event");
        self.handler.handle_event(self, event);
    }

    pub(crate) fn run_callback(
        self: &Arc<Self>,
        mut event: StageEvent,
        context: Option<CallbackContext>,
        kind: HistoryKind,
    ) {
        if let Some(pool) = self.pool_shared() {
            let history = pool.history();
            if history.enabled {
                event.record_stage(&self.name, kind, history.max_hops);
            }
        }

        trace!(stage = %self.name, %kind, "running callback");
        match kind {
            HistoryKind::Timeout => self.handler.timeout_event(self, event, context),
            HistoryKind::Handle | HistoryKind::Callback => {
                self.handler.callback_event(self, event, context)
            }
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("qlen", &self.qlen())
            .finish_non_exhaustive()
    }
}

/// An event a stage refused to accept, handed back to the caller.
pub struct RejectedEvent {
    stage: Arc<str>,
    event: StageEvent,
}

impl RejectedEvent {
    pub(crate) fn new(stage: &str, event: StageEvent) -> Self {
        RejectedEvent {
            stage: stage.into(),
            event,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn into_event(self) -> StageEvent {
        self.event
    }
}

impl fmt::Debug for RejectedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedEvent")
            .field("stage", &self.stage)
            .field("event", &self.event)
            .finish()
    }
}

impl fmt::Display for RejectedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage {} is not accepting events", self.stage)
    }
}

/// String key/value configuration for a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageProperties(BTreeMap<String, String>);

impl StageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// Parse a property value.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.0.get(key) {
            Some(value) => value.parse::<T>().map(Some).map_err(|e| {
                SedaError::new(format!("Failed to parse property: {e}"))
                    .with_field("key", key)
                    .with_field("value", value)
            }),
            None => Ok(None),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for StageProperties {
    fn from(value: BTreeMap<String, String>) -> Self {
        StageProperties(value)
    }
}
