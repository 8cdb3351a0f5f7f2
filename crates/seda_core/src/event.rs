use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::callback::CompletionCallback;
use crate::history::{EventHistory, HistoryKind};

/// Opaque context attached to a completion callback, handed back to the
/// registering stage when the callback fires.
pub type CallbackContext = Box<dyn Any + Send>;

/// Deadline shared between events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    deadline: Instant,
}

impl TimeoutInfo {
    pub fn new(deadline: Instant) -> Self {
        TimeoutInfo { deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn has_timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A unit of work passed between stages.
///
/// An event carries an opaque payload and a stack of completion callbacks.
/// Completing an event (`done`, `done_immediate`, `done_timeout`) consumes
/// it and runs the callback on top of the stack. Once the stack is empty,
/// completion drops the event.
pub struct StageEvent {
    payload: Box<dyn Any + Send>,
    callbacks: Vec<CompletionCallback>,
    /// Set while the event sits in a stage queue waiting for its top callback
    /// to be replayed.
    is_callback: bool,
    history: Option<EventHistory>,
    timeout: Option<Arc<TimeoutInfo>>,
}

impl StageEvent {
    pub fn new<T>(payload: T) -> Self
    where
        T: Any + Send,
    {
        StageEvent {
            payload: Box::new(payload),
            callbacks: Vec::new(),
            is_callback: false,
            history: None,
            timeout: None,
        }
    }

    /// Create an event without a payload.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }

    /// Take the payload out of the event, leaving `()` in its place.
    ///
    /// Returns None and leaves the payload untouched if it is not a `T`.
    pub fn take_payload<T: Any>(&mut self) -> Option<T> {
        let payload = std::mem::replace(&mut self.payload, Box::new(()));
        match payload.downcast::<T>() {
            Ok(payload) => Some(*payload),
            Err(payload) => {
                self.payload = payload;
                None
            }
        }
    }

    pub fn set_payload<T>(&mut self, payload: T)
    where
        T: Any + Send,
    {
        self.payload = Box::new(payload);
    }

    /// Push a callback onto the callback stack.
    pub fn push_callback(&mut self, callback: CompletionCallback) {
        self.callbacks.push(callback);
    }

    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    pub fn num_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// If this event is waiting for its top callback to run.
    pub fn is_callback(&self) -> bool {
        self.is_callback
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.timeout = Some(Arc::new(TimeoutInfo::new(deadline)));
    }

    /// Timeouts too large to represent leave the event without a deadline.
    pub fn set_timeout_after(&mut self, timeout: Duration) {
        self.timeout = Instant::now()
            .checked_add(timeout)
            .map(|deadline| Arc::new(TimeoutInfo::new(deadline)));
    }

    /// Share the deadline of another event with this one.
    pub fn share_timeout_info(&mut self, other: &StageEvent) {
        self.timeout = other.timeout.clone();
    }

    pub fn timeout_info(&self) -> Option<&Arc<TimeoutInfo>> {
        self.timeout.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.as_ref().map(|t| t.deadline())
    }

    pub fn has_timed_out(&self) -> bool {
        self.timeout.as_ref().is_some_and(|t| t.has_timed_out())
    }

    pub fn history(&self) -> Option<&EventHistory> {
        self.history.as_ref()
    }

    /// Record that this event crossed into `stage`.
    ///
    /// Panics if the hop count exceeds `max_hops`.
    pub fn record_stage(&mut self, stage: &Arc<str>, kind: HistoryKind, max_hops: u32) {
        self.history
            .get_or_insert_with(EventHistory::default)
            .record(stage, kind, max_hops);
    }

    /// Complete the event asynchronously.
    ///
    /// The top callback is rescheduled onto its target stage's thread pool.
    /// If the target stage isn't connected, the callback runs on the current
    /// thread instead.
    pub fn done(mut self) {
        let target = match self.callbacks.last() {
            Some(callback) => callback.target().clone(),
            None => {
                trace!("event completed with no callbacks");
                return;
            }
        };

        self.is_callback = true;
        if let Err(rejected) = target.reschedule_event(self) {
            trace!(stage = %rejected.stage(), "running callback inline, stage not connected");
            rejected.into_event().done_immediate();
        }
    }

    /// Complete the event by running the top callback on the current thread.
    pub fn done_immediate(mut self) {
        if let Some(callback) = self.callbacks.pop() {
            self.is_callback = false;
            callback.event_done(self);
        }
    }

    /// Like `done_immediate`, but runs the timeout handler of the top
    /// callback.
    pub fn done_timeout(mut self) {
        if let Some(callback) = self.callbacks.pop() {
            self.is_callback = false;
            callback.event_timeout(self);
        }
    }

    /// Drop the event without running any of its callbacks.
    pub fn discard(mut self) {
        self.callbacks.clear();
    }
}

impl Drop for StageEvent {
    fn drop(&mut self) {
        if !self.callbacks.is_empty() {
            warn!(
                callbacks = self.callbacks.len(),
                target = %self.callbacks[self.callbacks.len() - 1].target().name(),
                "dropping event with pending callbacks"
            );
        }
    }
}

impl fmt::Debug for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEvent")
            .field("callbacks", &self.callbacks)
            .field("is_callback", &self.is_callback)
            .field("deadline", &self.deadline())
            .field("hops", &self.history.as_ref().map(|h| h.hops()))
            .finish_non_exhaustive()
    }
}
