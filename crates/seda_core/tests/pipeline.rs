mod common;

use std::sync::Arc;
use std::time::Instant;

use common::{
    CallbackStage, CountingStage, ForwardStage, RecorderStage, WAIT_TIMEOUT, connect,
    event_with_callback, test_pool, wait_until,
};
use parking_lot::Mutex;
use seda_core::event::StageEvent;
use seda_core::history::{EventHistoryConfig, HistoryKind};
use seda_core::stage::Stage;
use seda_core::thread_pool::ThreadPool;

#[test]
fn three_stage_pipeline_delivers_each_event_once() {
    let pool = test_pool("pipeline", 2);

    let a = Stage::new("a", ForwardStage);
    let b = Stage::new("b", ForwardStage);
    let c = Stage::new("c", CountingStage::default());
    connect(&c, &pool, &[]);
    connect(&b, &pool, &[&c]);
    connect(&a, &pool, &[&b]);

    for id in 0..100_u64 {
        a.add_event(StageEvent::new(id)).unwrap();
    }

    let counter = c.handler_as::<CountingStage>().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || counter.count() == 100));

    a.disconnect();
    b.disconnect();
    c.disconnect();

    let mut seen = counter.seen.lock().clone();
    seen.sort_unstable();
    assert_eq!((0..100).collect::<Vec<u64>>(), seen);
    assert_eq!(0, c.outstanding());
}

#[test]
fn callbacks_run_in_lifo_order() {
    let pool = test_pool("lifo", 2);
    let log = Arc::new(Mutex::new(Vec::new()));

    let first = Stage::new(
        "first",
        CallbackStage {
            label: "first",
            log: log.clone(),
        },
    );
    let second = Stage::new(
        "second",
        CallbackStage {
            label: "second",
            log: log.clone(),
        },
    );
    let last = Stage::new("last", CountingStage::default());
    connect(&last, &pool, &[]);
    connect(&second, &pool, &[&last]);
    connect(&first, &pool, &[&second]);

    first.add_event(StageEvent::new(7_u64)).unwrap();

    assert!(wait_until(WAIT_TIMEOUT, || log.lock().len() == 2));
    assert_eq!(vec!["second", "first"], *log.lock());

    first.disconnect();
    second.disconnect();
    last.disconnect();
}

#[test]
fn single_thread_pool_keeps_fifo_order() {
    let pool = test_pool("fifo", 1);
    let stage = Stage::new("fifo", CountingStage::default());
    connect(&stage, &pool, &[]);

    for id in 0..50_u64 {
        stage.add_event(StageEvent::new(id)).unwrap();
    }
    stage.disconnect();

    let counter = stage.handler_as::<CountingStage>().unwrap();
    assert_eq!((0..50).collect::<Vec<u64>>(), *counter.seen.lock());
}

#[test]
fn history_records_stage_crossings() {
    logutil::init_test();
    let pool = ThreadPool::try_new("history", 1, EventHistoryConfig::enabled(10)).unwrap();

    let a = Stage::new("a", ForwardStage);
    let b = Stage::new("b", CountingStage::default());
    connect(&b, &pool, &[]);
    connect(&a, &pool, &[&b]);

    a.add_event(StageEvent::new(1_u64)).unwrap();

    let counter = b.handler_as::<CountingStage>().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || counter.histories.lock().len() == 1));

    let expected = vec![
        ("a".to_string(), HistoryKind::Handle),
        ("b".to_string(), HistoryKind::Handle),
    ];
    assert_eq!(expected, counter.histories.lock()[0]);

    a.disconnect();
    b.disconnect();
}

#[test]
fn timed_out_event_skips_handler() {
    let pool = test_pool("timeout", 1);

    let recorder = Stage::new("recorder", RecorderStage::default());
    let worker = Stage::new("worker", CountingStage::default());
    connect(&recorder, &pool, &[]);
    connect(&worker, &pool, &[]);

    let mut event = event_with_callback(&recorder, "expired");
    event.set_payload(3_u64);
    event.set_deadline(Instant::now());
    worker.add_event(event).unwrap();

    let rec = recorder.handler_as::<RecorderStage>().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || rec.timeouts().len() == 1));
    assert_eq!(vec!["expired"], rec.timeouts());
    assert!(rec.callbacks().is_empty());
    assert_eq!(0, worker.handler_as::<CountingStage>().unwrap().count());

    worker.disconnect();
    recorder.disconnect();
}

#[test]
fn completion_rescheduled_on_callback_stage_pool() {
    let worker_pool = test_pool("worker-pool", 1);
    let reply_pool = test_pool("reply-pool", 1);

    let recorder = Stage::new("recorder", RecorderStage::default());
    let worker = Stage::new("worker", CountingStage::default());
    connect(&recorder, &reply_pool, &[]);
    connect(&worker, &worker_pool, &[]);

    for idx in 0..10 {
        worker
            .add_event(event_with_callback(&recorder, &idx.to_string()))
            .unwrap();
    }

    let rec = recorder.handler_as::<RecorderStage>().unwrap();
    assert!(wait_until(WAIT_TIMEOUT, || rec.callbacks().len() == 10));
    let expected: Vec<_> = (0..10).map(|idx| idx.to_string()).collect();
    assert_eq!(expected, rec.callbacks());

    worker.disconnect();
    recorder.disconnect();
}
