//! Deadline ordered timer service.
//!
//! The timer stage holds events until their deadline, then completes them
//! with `done`, firing whatever callback the registering stage pushed onto
//! the event. Timers can be registered and cancelled directly through the
//! handler, or by sending a `TimerRequest` to the stage.
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use seda_error::{Result, ResultExt, SedaError};
use tracing::{debug, error, trace, warn};

use crate::event::StageEvent;
use crate::stage::{Stage, StageHandler};
use crate::thread_pool::panic_message;

/// Deadlines further out are clamped to this delay.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

static NEXT_NONCE: AtomicU64 = AtomicU64::new(0);

/// Identifies a registered timer.
///
/// Tokens order by deadline first, then by registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken {
    deadline: Instant,
    nonce: u64,
}

impl TimerToken {
    fn new(deadline: Instant) -> Self {
        TimerToken {
            deadline,
            nonce: NEXT_NONCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.nonce)
    }
}

/// When a timer should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDeadline {
    /// Relative to the time of registration.
    After(Duration),
    /// Wall clock time. Times in the past fire immediately.
    At(SystemTime),
    Monotonic(Instant),
}

impl TimerDeadline {
    /// Relative and wall clock deadlines are capped at `MAX_TIMER_DELAY`
    /// from now.
    fn resolve(self) -> Instant {
        let delay = match self {
            Self::After(delay) => delay,
            Self::At(time) => time.duration_since(SystemTime::now()).unwrap_or_default(),
            Self::Monotonic(instant) => return instant,
        };
        Instant::now() + delay.min(MAX_TIMER_DELAY)
    }
}

/// Request payload for the event based timer interface.
///
/// The request event is completed with `done` once processed, with the
/// token or cancellation result filled in.
#[derive(Debug)]
pub enum TimerRequest {
    Register(TimerRegister),
    Cancel(TimerCancel),
}

#[derive(Debug)]
pub struct TimerRegister {
    event: Option<StageEvent>,
    deadline: TimerDeadline,
    token: Option<TimerToken>,
}

#[derive(Debug)]
pub struct TimerCancel {
    token: TimerToken,
    cancelled: bool,
}

impl TimerRequest {
    /// Request to hold `event` until `deadline`.
    pub fn register(event: StageEvent, deadline: TimerDeadline) -> Self {
        TimerRequest::Register(TimerRegister {
            event: Some(event),
            deadline,
            token: None,
        })
    }

    pub fn cancel(token: TimerToken) -> Self {
        TimerRequest::Cancel(TimerCancel {
            token,
            cancelled: false,
        })
    }

    /// Token of the registered timer, set once a register request is
    /// processed.
    pub fn token(&self) -> Option<TimerToken> {
        match self {
            Self::Register(req) => req.token,
            Self::Cancel(req) => Some(req.token),
        }
    }

    /// If a cancel request removed its timer.
    pub fn cancelled(&self) -> bool {
        match self {
            Self::Register(_) => false,
            Self::Cancel(req) => req.cancelled,
        }
    }

    /// Take back the event of a register request that was never processed.
    pub fn into_event(self) -> Option<StageEvent> {
        match self {
            Self::Register(req) => req.event,
            Self::Cancel(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct TimerQueue {
    timers: BTreeMap<TimerToken, StageEvent>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct TimerCore {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

/// Stage holding events until a deadline.
#[derive(Debug, Default)]
pub struct TimerStage {
    core: Arc<TimerCore>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl TimerStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `event` until `deadline`, then complete it with `done`.
    pub fn register(&self, event: StageEvent, deadline: TimerDeadline) -> TimerToken {
        let token = TimerToken::new(deadline.resolve());

        let mut queue = self.core.queue.lock();
        let earliest = queue
            .timers
            .first_key_value()
            .is_none_or(|(first, _)| token < *first);

        let prev = queue.timers.insert(token, event);
        assert!(prev.is_none(), "Duplicate timer token {token}");

        if earliest {
            self.core.wakeup.notify_all();
        }
        trace!(%token, "registered timer");

        token
    }

    /// Cancel a timer, dropping its event without running any callbacks.
    ///
    /// Returns false if the timer already fired or doesn't exist.
    pub fn cancel(&self, token: &TimerToken) -> bool {
        let removed = self.core.queue.lock().timers.remove(token);
        match removed {
            Some(event) => {
                trace!(%token, "cancelled timer");
                event.discard();
                true
            }
            None => false,
        }
    }

    /// Number of timers waiting to fire.
    pub fn num_events(&self) -> usize {
        self.core.queue.lock().timers.len()
    }

    fn handle_request(&self, request: &mut TimerRequest) {
        match request {
            TimerRequest::Register(req) => match req.event.take() {
                Some(event) => req.token = Some(self.register(event, req.deadline)),
                None => warn!("timer register request without an event"),
            },
            TimerRequest::Cancel(req) => req.cancelled = self.cancel(&req.token),
        }
    }
}

impl StageHandler for TimerStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initialize(&self, stage: &Arc<Stage>) -> Result<()> {
        if !stage.next_stages().is_empty() {
            return Err(SedaError::new("Timer stage cannot have next stages")
                .with_field("stage", stage.name()));
        }

        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return Err(SedaError::new("Timer maintenance thread already running")
                .with_field("stage", stage.name()));
        }

        self.core.queue.lock().shutdown = false;

        let core = self.core.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-timer", stage.name()))
            .spawn(move || run_maintenance(core))
            .context_fn(|| format!("Failed to start timer thread for {}", stage.name()))?;
        *maintenance = Some(handle);

        Ok(())
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        match event.payload_mut::<TimerRequest>() {
            Some(request) => self.handle_request(request),
            None => warn!(stage = %stage.name(), "unexpected payload for timer stage"),
        }
        event.done();
    }

    fn disconnect_prepare(&self, stage: &Arc<Stage>) {
        {
            let mut queue = self.core.queue.lock();
            queue.shutdown = true;
            self.core.wakeup.notify_all();
        }

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(stage = %stage.name(), "timer thread panicked");
            }
        }
    }

    fn cleanup(&self, stage: &Arc<Stage>) {
        let pending = std::mem::take(&mut self.core.queue.lock().timers);
        if !pending.is_empty() {
            debug!(stage = %stage.name(), pending = pending.len(), "timing out pending timers");
        }
        for (_, event) in pending {
            event.done_timeout();
        }
    }
}

fn run_maintenance(core: Arc<TimerCore>) {
    debug!("timer thread started");

    let mut queue = core.queue.lock();
    loop {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(entry) = queue.timers.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            fired.push(entry.remove());
        }

        if !fired.is_empty() {
            trace!(count = fired.len(), "firing timers");
            MutexGuard::unlocked(&mut queue, || {
                for event in fired {
                    fire(event);
                }
            });
            continue;
        }

        if queue.shutdown {
            break;
        }

        match queue.timers.first_key_value().map(|(token, _)| token.deadline) {
            Some(deadline) => {
                core.wakeup.wait_until(&mut queue, deadline);
            }
            None => core.wakeup.wait(&mut queue),
        }
    }

    debug!("timer thread exited");
}

/// Complete a fired timer.
///
/// Callbacks targeting unconnected stages run inline on the timer thread. A
/// panic in one aborts the process, same as on a pool worker.
fn fire(event: StageEvent) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| event.done()));
    if let Err(payload) = result {
        let msg = panic_message(payload.as_ref());
        error!(%msg, "timer callback panicked, aborting");
        process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_order_by_deadline_then_nonce() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let a = TimerToken::new(deadline);
        let b = TimerToken::new(deadline);
        let earlier = TimerToken::new(deadline - Duration::from_millis(10));

        assert!(a < b);
        assert!(earlier < a);
        assert_ne!(a, b);
    }

    #[test]
    fn past_wall_clock_resolves_to_now() {
        let before = Instant::now();
        let resolved = TimerDeadline::At(SystemTime::UNIX_EPOCH).resolve();
        assert!(resolved >= before);
        assert!(resolved <= Instant::now());
    }

    #[test]
    fn far_future_deadlines_are_clamped() {
        let timer = TimerStage::new();
        let latest = Instant::now() + MAX_TIMER_DELAY;

        let relative = timer.register(StageEvent::empty(), TimerDeadline::After(Duration::MAX));
        let wall_clock = timer.register(
            StageEvent::empty(),
            TimerDeadline::At(SystemTime::now() + Duration::from_secs(1 << 40)),
        );
        assert_eq!(2, timer.num_events());

        for token in [relative, wall_clock] {
            assert!(token.deadline() >= latest);
            assert!(token.deadline() <= Instant::now() + MAX_TIMER_DELAY);
        }
        assert!(relative < wall_clock);
    }

    #[test]
    fn register_and_cancel_without_thread() {
        let timer = TimerStage::new();
        let token = timer.register(StageEvent::empty(), TimerDeadline::After(Duration::from_secs(60)));
        assert_eq!(1, timer.num_events());

        assert!(timer.cancel(&token));
        assert!(!timer.cancel(&token));
        assert_eq!(0, timer.num_events());
    }

    #[test]
    fn request_records_token() {
        let timer = TimerStage::new();
        let mut request = TimerRequest::register(
            StageEvent::empty(),
            TimerDeadline::After(Duration::from_secs(60)),
        );
        timer.handle_request(&mut request);
        let token = request.token().unwrap();

        let mut cancel = TimerRequest::cancel(token);
        timer.handle_request(&mut cancel);
        assert!(cancel.cancelled());
        assert!(request.into_event().is_none());
    }
}
