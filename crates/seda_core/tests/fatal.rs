//! Protocol violations that take the process down.
//!
//! Aborting tests re-run themselves in a child process and check how the
//! child exited.
mod common;

use std::any::Any;
use std::env;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{ForwardStage, RecorderStage, WAIT_TIMEOUT, connect, event_with_callback, test_pool};
use seda_core::callback::CompletionCallback;
use seda_core::event::{CallbackContext, StageEvent};
use seda_core::history::EventHistoryConfig;
use seda_core::stage::{Stage, StageHandler};
use seda_core::thread_pool::ThreadPool;
use seda_core::timer::{TimerDeadline, TimerStage};

const CHILD_ENV: &str = "SEDA_FATAL_TEST_CHILD";

fn in_child() -> bool {
    env::var_os(CHILD_ENV).is_some()
}

/// Run a single test of this binary in a child process.
fn run_in_child(test: &str) -> ExitStatus {
    Command::new(env::current_exe().unwrap())
        .args(["--exact", test, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap()
}

fn assert_aborted(status: ExitStatus) {
    assert!(!status.success(), "child exited normally: {status}");

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(Some(6), status.signal());
    }
}

#[test]
#[should_panic(expected = "Event exceeded max hops")]
fn callback_chain_past_max_hops_panics() {
    logutil::init_test();
    let pool = ThreadPool::try_new("hops-callback", 1, EventHistoryConfig::enabled(3)).unwrap();
    let stage = Stage::new("bounce", ForwardStage);
    connect(&stage, &pool, &[]);

    // Every callback runs inline on this thread and records a hop.
    let mut event = StageEvent::empty();
    for _ in 0..5 {
        event.push_callback(CompletionCallback::new(&stage));
    }
    event.done_immediate();
}

#[test]
fn forwarding_loop_past_max_hops_aborts() {
    if !in_child() {
        assert_aborted(run_in_child("forwarding_loop_past_max_hops_aborts"));
        return;
    }

    logutil::init_test();
    let pool = ThreadPool::try_new("hops-loop", 1, EventHistoryConfig::enabled(5)).unwrap();
    let stage = Stage::new("loop", ForwardStage);
    connect(&stage, &pool, &[&stage]);

    stage.add_event(StageEvent::empty()).unwrap();
    thread::sleep(WAIT_TIMEOUT);
}

/// Panics whenever one of its callbacks fires.
#[derive(Debug)]
struct ExplodingCallback;

impl StageHandler for ExplodingCallback {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, _stage: &Arc<Stage>, event: StageEvent) {
        event.done();
    }

    fn callback_event(
        &self,
        stage: &Arc<Stage>,
        _event: StageEvent,
        _context: Option<CallbackContext>,
    ) {
        panic!("callback on {} exploded", stage.name());
    }
}

#[test]
fn timer_callback_panic_aborts() {
    if !in_child() {
        assert_aborted(run_in_child("timer_callback_panic_aborts"));
        return;
    }

    let pool = test_pool("timer-panic", 1);
    let timer = Stage::new("timer", TimerStage::new());
    let recorder = Stage::new("recorder", RecorderStage::default());
    connect(&timer, &pool, &[]);
    connect(&recorder, &pool, &[]);

    // Never connected, so the callback runs on the timer thread.
    let exploding = Stage::new("exploding", ExplodingCallback);
    let service = timer.handler_as::<TimerStage>().unwrap();

    let mut event = StageEvent::empty();
    event.push_callback(CompletionCallback::new(&exploding));
    service.register(event, TimerDeadline::After(Duration::from_millis(5)));
    service.register(
        event_with_callback(&recorder, "later"),
        TimerDeadline::After(Duration::from_millis(50)),
    );

    thread::sleep(WAIT_TIMEOUT);
}
