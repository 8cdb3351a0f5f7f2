use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use seda_error::{Result, SedaError};
use tracing::{debug, info};

use crate::callback::CompletionCallback;
use crate::event::{CallbackContext, StageEvent};
use crate::stage::{Stage, StageHandler, StageProperties, StageState};
use crate::timer::{TimerDeadline, TimerRequest, TimerStage};

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Payload of the report event the metrics stage keeps sending itself.
#[derive(Debug)]
struct MetricsReport;

/// Periodically logs queue statistics of the stages it watches.
///
/// The first next stage must be a timer stage driving the reports, the
/// remaining next stages are the ones being watched.
#[derive(Debug)]
pub struct MetricsStage {
    interval: Duration,
    timer: RwLock<Option<Arc<Stage>>>,
    watched: RwLock<Vec<Arc<Stage>>>,
    reports: AtomicU64,
}

impl MetricsStage {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        MetricsStage {
            interval,
            timer: RwLock::new(None),
            watched: RwLock::new(Vec::new()),
            reports: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of reports produced so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    fn report(&self) {
        let count = self.reports.fetch_add(1, Ordering::Relaxed) + 1;
        for stage in self.watched.read().iter() {
            info!(
                stage = %stage.name(),
                status = %stage.status(),
                qlen = stage.qlen(),
                outstanding = stage.outstanding(),
                "stage queue metrics"
            );
        }
        debug!(reports = count, "metrics report");
    }
}

impl Default for MetricsStage {
    fn default() -> Self {
        Self::new()
    }
}

impl StageHandler for MetricsStage {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn set_properties(&mut self, properties: &StageProperties) -> Result<()> {
        if let Some(ms) = properties.get_parsed::<u64>("report_interval_ms")? {
            if ms == 0 {
                return Err(SedaError::new("Report interval must be greater than zero"));
            }
            self.interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn initialize(&self, stage: &Arc<Stage>) -> Result<()> {
        let mut next = stage.next_stages();
        if next.is_empty() {
            return Err(SedaError::new("Metrics stage requires a timer as its first next stage")
                .with_field("stage", stage.name()));
        }

        let timer = next.remove(0);
        if timer.handler_as::<TimerStage>().is_none() {
            return Err(SedaError::new("First next stage of metrics stage is not a timer")
                .with_field("stage", stage.name())
                .with_field("next", timer.name()));
        }

        *self.timer.write() = Some(timer);
        *self.watched.write() = next;

        // Not connected yet, held until connect finishes.
        if let Err(rejected) = stage.add_event(StageEvent::new(MetricsReport)) {
            return Err(SedaError::new(rejected.to_string()).with_field("stage", stage.name()));
        }

        Ok(())
    }

    fn handle_event(&self, stage: &Arc<Stage>, mut event: StageEvent) {
        // An unconnected timer with a pool hasn't been started yet and holds
        // the request until it is.
        let timer = self.timer.read().clone();
        let timer = match timer {
            Some(timer)
                if timer.is_connected()
                    || (timer.status() == StageState::Unconnected
                        && timer.pool_name().is_some()) =>
            {
                timer
            }
            _ => {
                debug!(stage = %stage.name(), "timer stopped, stopping metrics");
                event.discard();
                return;
            }
        };

        event.push_callback(CompletionCallback::new(stage));
        let request = TimerRequest::register(event, TimerDeadline::After(self.interval));
        if let Err(rejected) = timer.add_event(StageEvent::new(request)) {
            debug!(stage = %rejected.stage(), "timer rejected metrics request");
            let mut request = rejected.into_event();
            if let Some(event) = request
                .take_payload::<TimerRequest>()
                .and_then(TimerRequest::into_event)
            {
                event.discard();
            }
        }
    }

    fn callback_event(
        &self,
        stage: &Arc<Stage>,
        event: StageEvent,
        _context: Option<CallbackContext>,
    ) {
        self.report();

        if !stage.is_connected() {
            event.discard();
            return;
        }
        if let Err(rejected) = stage.add_event(event) {
            rejected.into_event().discard();
        }
    }

    fn cleanup(&self, _stage: &Arc<Stage>) {
        *self.timer.write() = None;
        self.watched.write().clear();
    }
}
