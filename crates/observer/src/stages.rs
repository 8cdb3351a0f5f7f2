//! Stages of the demo request pipeline.
//!
//! A request enters at the session stage, passes the session gate so that at
//! most one request per session is executing, then walks the step stages
//! until storage completes it. Completion flows back to the session stage
//! which replies to the client and releases the session.
use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use seda_core::callback::CompletionCallback;
use seda_core::dispatcher::{EventDispatcher, KeyedExclusive};
use seda_core::event::{CallbackContext, StageEvent};
use seda_core::registry::StageRegistry;
use seda_core::stage::{Stage, StageHandler, StageProperties};
use seda_error::Result;
use tracing::{debug, warn};

pub const SESSION_STAGE: &str = "SessionStage";

const STEP_STAGES: &[&str] = &[
    "ParseStage",
    "ResolveStage",
    "PlanCacheStage",
    "OptimizeStage",
    "ExecuteStage",
    "StorageStage",
];

/// A client request travelling through the pipeline.
#[derive(Debug)]
pub struct SqlRequest {
    pub session_id: u64,
    pub seq: usize,
    pub sql: String,
    /// Stages that handled the request, in order.
    pub trace: Vec<String>,
    reply: mpsc::Sender<SqlResponse>,
}

impl SqlRequest {
    pub fn new(session_id: u64, seq: usize, sql: String, reply: mpsc::Sender<SqlResponse>) -> Self {
        SqlRequest {
            session_id,
            seq,
            sql,
            trace: Vec::new(),
            reply,
        }
    }
}

#[derive(Debug)]
pub struct SqlResponse {
    pub session_id: u64,
    pub seq: usize,
    pub trace: Vec<String>,
    pub latency: Duration,
}

pub type SessionGate = EventDispatcher<KeyedExclusive<fn(&StageEvent) -> Option<String>>>;

fn session_key(event: &StageEvent) -> Option<String> {
    event
        .payload::<SqlRequest>()
        .map(|req| req.session_id.to_string())
}

pub fn session_gate() -> SessionGate {
    EventDispatcher::new(KeyedExclusive::new(
        session_key as fn(&StageEvent) -> Option<String>,
    ))
}

/// Register every observer stage class.
pub fn register_stages(registry: &mut StageRegistry) {
    registry.register(SESSION_STAGE, |_| SessionStage);
    registry.register("SessionGate", |_| session_gate());
    for class in STEP_STAGES {
        registry.register(class, |_| StepStage::default());
    }
}

/// Entry point for client requests.
#[derive(Debug)]
pub struct SessionStage;

impl StageHandler for SessionStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        let Some(gate) = stage.next_stage(0) else {
            warn!(stage = %stage.name(), "no session gate, dropping request");
            event.done_immediate();
            return;
        };

        event.push_callback(CompletionCallback::with_context(stage, Instant::now()));
        if let Err(rejected) = gate.add_event(event) {
            // Unwind our own callback so the client still gets a reply.
            rejected.into_event().done_immediate();
        }
    }

    fn callback_event(
        &self,
        stage: &Arc<Stage>,
        mut event: StageEvent,
        context: Option<CallbackContext>,
    ) {
        let latency = context
            .and_then(|ctx| ctx.downcast::<Instant>().ok())
            .map(|started| started.elapsed())
            .unwrap_or_default();

        if let Some(request) = event.take_payload::<SqlRequest>() {
            let session = request.session_id.to_string();
            let response = SqlResponse {
                session_id: request.session_id,
                seq: request.seq,
                trace: request.trace,
                latency,
            };
            if request.reply.send(response).is_err() {
                warn!(%session, "client went away before reply");
            }

            let gate = stage.next_stage(0);
            if let Some(dispatcher) = gate.as_ref().and_then(|g| g.handler_as::<SessionGate>()) {
                dispatcher.finish(&session);
            }
        }

        event.done_immediate();
    }
}

/// A single processing step. Records itself in the request trace and
/// forwards to its first next stage, completing the request when it has
/// none.
#[derive(Debug, Default)]
pub struct StepStage {
    work: Duration,
}

impl StageHandler for StepStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_properties(&mut self, properties: &StageProperties) -> Result<()> {
        if let Some(us) = properties.get_parsed::<u64>("work_us")? {
            self.work = Duration::from_micros(us);
        }
        Ok(())
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        if let Some(request) = event.payload_mut::<SqlRequest>() {
            request.trace.push(stage.name().to_string());
            debug!(stage = %stage.name(), session = request.session_id, seq = request.seq, "step");
        }
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }

        match stage.next_stage(0) {
            Some(next) => {
                if let Err(rejected) = next.add_event(event) {
                    rejected.into_event().done();
                }
            }
            None => event.done(),
        }
    }
}
