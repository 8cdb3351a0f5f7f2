#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use seda_core::callback::CompletionCallback;
use seda_core::event::{CallbackContext, StageEvent};
use seda_core::history::{EventHistoryConfig, HistoryKind};
use seda_core::stage::{Stage, StageHandler};
use seda_core::thread_pool::ThreadPool;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_pool(name: &str, num_threads: usize) -> ThreadPool {
    logutil::init_test();
    ThreadPool::try_new(name, num_threads, EventHistoryConfig::default()).unwrap()
}

/// Poll `f` until it returns true or the timeout is reached.
pub fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    f()
}

/// Connect a stage to a pool, wiring in next stages.
pub fn connect(stage: &Arc<Stage>, pool: &ThreadPool, next: &[&Arc<Stage>]) {
    stage.set_pool(pool);
    for next in next {
        stage.push_stage((*next).clone());
    }
    stage.connect().unwrap();
}

/// Forwards every event to its first next stage.
#[derive(Debug, Default)]
pub struct ForwardStage;

impl StageHandler for ForwardStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, stage: &Arc<Stage>, event: StageEvent) {
        match stage.next_stage(0) {
            Some(next) => {
                if let Err(rejected) = next.add_event(event) {
                    rejected.into_event().done_immediate();
                }
            }
            None => event.done(),
        }
    }
}

/// Records `u64` payloads, then completes the event with `done`.
#[derive(Debug, Default)]
pub struct CountingStage {
    pub seen: Mutex<Vec<u64>>,
    pub histories: Mutex<Vec<Vec<(String, HistoryKind)>>>,
}

impl CountingStage {
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl StageHandler for CountingStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, _stage: &Arc<Stage>, event: StageEvent) {
        if let Some(history) = event.history() {
            let entries = history
                .entries()
                .iter()
                .map(|e| (e.stage.to_string(), e.kind))
                .collect();
            self.histories.lock().push(entries);
        }
        if let Some(id) = event.payload::<u64>() {
            self.seen.lock().push(*id);
        }
        event.done();
    }
}

/// Pushes a callback onto each event before forwarding it, logging its
/// label when the callback fires.
#[derive(Debug)]
pub struct CallbackStage {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl StageHandler for CallbackStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        event.push_callback(CompletionCallback::with_context(stage, self.label));
        match stage.next_stage(0) {
            Some(next) => {
                if let Err(rejected) = next.add_event(event) {
                    rejected.into_event().done_immediate();
                }
            }
            None => event.done(),
        }
    }

    fn callback_event(
        &self,
        _stage: &Arc<Stage>,
        event: StageEvent,
        context: Option<CallbackContext>,
    ) {
        let label = context
            .and_then(|ctx| ctx.downcast::<&'static str>().ok())
            .map(|label| label.to_string())
            .unwrap_or_default();
        self.log.lock().push(label);
        event.done_immediate();
    }
}

/// Records callbacks and timeouts fired on this stage, keyed by the `String`
/// context of the callback.
#[derive(Debug, Default)]
pub struct RecorderStage {
    pub callbacks: Mutex<Vec<String>>,
    pub timeouts: Mutex<Vec<String>>,
    pub handled: AtomicUsize,
}

impl RecorderStage {
    pub fn callbacks(&self) -> Vec<String> {
        self.callbacks.lock().clone()
    }

    pub fn timeouts(&self) -> Vec<String> {
        self.timeouts.lock().clone()
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

fn context_string(context: Option<CallbackContext>) -> String {
    context
        .and_then(|ctx| ctx.downcast::<String>().ok())
        .map(|s| *s)
        .unwrap_or_default()
}

impl StageHandler for RecorderStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, _stage: &Arc<Stage>, event: StageEvent) {
        self.handled.fetch_add(1, Ordering::SeqCst);
        event.done();
    }

    fn callback_event(
        &self,
        _stage: &Arc<Stage>,
        event: StageEvent,
        context: Option<CallbackContext>,
    ) {
        self.callbacks.lock().push(context_string(context));
        event.done_immediate();
    }

    fn timeout_event(
        &self,
        _stage: &Arc<Stage>,
        event: StageEvent,
        context: Option<CallbackContext>,
    ) {
        self.timeouts.lock().push(context_string(context));
        event.done_timeout();
    }
}

/// Event carrying a callback into `target` with a `String` context.
pub fn event_with_callback(target: &Arc<Stage>, context: &str) -> StageEvent {
    let mut event = StageEvent::empty();
    event.push_callback(CompletionCallback::with_context(target, context.to_string()));
    event
}
