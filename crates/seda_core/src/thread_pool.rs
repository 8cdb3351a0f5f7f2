use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use seda_error::{Result, SedaError};
use tracing::{debug, error, info, trace, warn};

use crate::event::StageEvent;
use crate::history::{EventHistoryConfig, HistoryKind};
use crate::stage::{Stage, StageHandler};

/// Name of the pool stages run on when none is configured.
pub const DEFAULT_THREAD_POOL: &str = "default";

/// A pool of worker threads executing events for the stages assigned to it.
///
/// Workers pull stages with pending events off a shared run queue, one entry
/// per scheduled event. Dropping the pool stops all of its threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    name: Arc<str>,
    history: EventHistoryConfig,
    run_queue: Mutex<RunQueue>,
    run_cond: Condvar,
    threads: Mutex<ThreadState>,
    threads_cond: Condvar,
    /// Internal stage receiving thread termination events.
    killer: Arc<Stage>,
    next_thread_id: AtomicUsize,
}

#[derive(Debug, Default)]
struct RunQueue {
    stages: VecDeque<Arc<Stage>>,
    /// Number of workers waiting for work.
    idle: usize,
}

#[derive(Debug, Default)]
struct ThreadState {
    count: usize,
    to_kill: usize,
    killing: bool,
    workers: HashMap<usize, JoinHandle<()>>,
    /// Workers that left their loop but haven't been joined yet.
    exited: Vec<usize>,
}

impl ThreadPool {
    /// Create a new pool with `num_threads` worker threads.
    ///
    /// Errors if not all threads could be created.
    pub fn try_new(name: &str, num_threads: usize, history: EventHistoryConfig) -> Result<Self> {
        let killer = Stage::new(&format!("{name}-kill-thread"), KillThreadStage);
        let pool = ThreadPool {
            shared: Arc::new(PoolShared {
                name: name.into(),
                history,
                run_queue: Mutex::new(RunQueue::default()),
                run_cond: Condvar::new(),
                threads: Mutex::new(ThreadState::default()),
                threads_cond: Condvar::new(),
                killer,
                next_thread_id: AtomicUsize::new(0),
            }),
        };

        let created = pool.add_threads(num_threads);
        if created < num_threads {
            return Err(SedaError::new("Failed to create thread pool threads")
                .with_field("pool", name)
                .with_field("requested", num_threads)
                .with_field("created", created));
        }

        info!(pool = %name, num_threads, "created thread pool");

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn num_threads(&self) -> usize {
        self.shared.threads.lock().count
    }

    pub fn history(&self) -> EventHistoryConfig {
        self.shared.history
    }

    /// Number of scheduled events not yet picked up by a worker.
    pub fn run_queue_len(&self) -> usize {
        self.shared.run_queue.lock().stages.len()
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Add worker threads to the pool, returning the number of threads
    /// actually created.
    pub fn add_threads(&self, n: usize) -> usize {
        let mut created = 0;
        for _ in 0..n {
            let id = self.shared.next_thread_id.fetch_add(1, Ordering::Relaxed);
            let shared = self.shared.clone();

            let mut threads = self.shared.threads.lock();
            let result = thread::Builder::new()
                .name(format!("{}-{id}", self.shared.name))
                .spawn(move || run_worker(shared, id));

            match result {
                Ok(handle) => {
                    threads.count += 1;
                    threads.workers.insert(id, handle);
                    created += 1;
                }
                Err(e) => {
                    warn!(pool = %self.shared.name, %e, "failed to create worker thread");
                    break;
                }
            }
        }

        debug!(pool = %self.shared.name, requested = n, created, "added threads");

        created
    }

    /// Stop `n` worker threads, blocking until they've exited.
    ///
    /// Returns the number of threads stopped. Only one kill can be in
    /// progress at a time, a concurrent call returns 0.
    pub fn kill_threads(&self, n: usize) -> usize {
        let n = {
            let mut threads = self.shared.threads.lock();
            if threads.killing {
                warn!(pool = %self.shared.name, "thread kill already in progress");
                return 0;
            }
            let n = n.min(threads.count);
            if n == 0 {
                return 0;
            }
            threads.killing = true;
            threads.to_kill = n;
            n
        };

        let killer = &self.shared.killer;
        killer.set_pool_shared(self.shared.clone());
        if let Err(e) = killer.connect() {
            error!(pool = %self.shared.name, %e, "failed to connect kill stage");
            let mut threads = self.shared.threads.lock();
            threads.killing = false;
            threads.to_kill = 0;
            return 0;
        }

        for _ in 0..n {
            if let Err(rejected) = killer.add_event(StageEvent::new(KillThread)) {
                // Connected above, only we disconnect it.
                panic!("{rejected}");
            }
        }

        let exited: Vec<_> = {
            let mut threads = self.shared.threads.lock();
            while threads.to_kill > 0 {
                self.shared.threads_cond.wait(&mut threads);
            }
            let ids = std::mem::take(&mut threads.exited);
            ids.into_iter()
                .filter_map(|id| threads.workers.remove(&id))
                .collect()
        };
        for handle in exited {
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "worker thread panicked while exiting");
            }
        }

        killer.disconnect();
        self.shared.threads.lock().killing = false;

        info!(pool = %self.shared.name, killed = n, "killed threads");

        n
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let num_threads = self.num_threads();
        self.kill_threads(num_threads);
        debug!(pool = %self.shared.name, "dropped thread pool");
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.shared.name)
            .field("num_threads", &self.num_threads())
            .finish_non_exhaustive()
    }
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn history(&self) -> EventHistoryConfig {
        self.history
    }

    /// Put a stage with a pending event on the run queue.
    pub(crate) fn schedule(&self, stage: Arc<Stage>) {
        let mut queue = self.run_queue.lock();
        queue.stages.push_back(stage);
        if queue.idle > 0 {
            self.run_cond.notify_one();
        }
    }

    /// Block until a stage is ready.
    fn next_stage(&self) -> Arc<Stage> {
        let mut queue = self.run_queue.lock();
        loop {
            if let Some(stage) = queue.stages.pop_front() {
                return stage;
            }
            queue.idle += 1;
            self.run_cond.wait(&mut queue);
            queue.idle -= 1;
        }
    }

    fn thread_exited(&self, id: usize) {
        let mut threads = self.threads.lock();
        threads.count -= 1;
        threads.to_kill = threads.to_kill.saturating_sub(1);
        threads.exited.push(id);
        self.threads_cond.notify_all();
    }
}

impl fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolShared")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

fn run_worker(shared: Arc<PoolShared>, id: usize) {
    debug!(pool = %shared.name, id, "worker started");

    loop {
        let stage = shared.next_stage();
        let event = stage.remove_event();

        let result = panic::catch_unwind(AssertUnwindSafe(|| execute(&shared, &stage, event)));
        if let Err(payload) = result {
            let msg = panic_message(payload.as_ref());
            error!(pool = %shared.name, stage = %stage.name(), %msg, "stage panicked, aborting");
            process::abort();
        }

        stage.release_event();

        if Arc::ptr_eq(&stage, &shared.killer) {
            break;
        }
    }

    debug!(pool = %shared.name, id, "worker exited");
    shared.thread_exited(id);
}

/// Run a single event for a stage.
fn execute(shared: &PoolShared, stage: &Arc<Stage>, mut event: StageEvent) {
    if event.is_callback() {
        if event.has_timed_out() {
            event.done_timeout();
        } else {
            event.done_immediate();
        }
        return;
    }

    if shared.history.enabled {
        event.record_stage(stage.name_arc(), HistoryKind::Handle, shared.history.max_hops);
    }

    if event.has_timed_out() {
        trace!(stage = %stage.name(), "event timed out before handling");
        event.done();
        return;
    }

    stage.run_handle(event);
}

/// Payload telling a worker to exit.
#[derive(Debug)]
struct KillThread;

/// Internal stage whose events terminate the worker running them. The
/// worker leaves its loop after running one of these.
#[derive(Debug)]
struct KillThreadStage;

impl StageHandler for KillThreadStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        if event.take_payload::<KillThread>().is_none() {
            warn!(stage = %stage.name(), "unexpected event on kill stage");
        }
        event.discard();
    }
}
