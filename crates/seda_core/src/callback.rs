use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::event::{CallbackContext, StageEvent};
use crate::history::HistoryKind;
use crate::stage::Stage;

/// One-shot completion handler bound to a stage.
///
/// When the callback fires, the target stage's `callback_event` (or
/// `timeout_event`) is invoked with the event and the callback's context.
pub struct CompletionCallback {
    target: Arc<Stage>,
    context: Option<CallbackContext>,
}

impl CompletionCallback {
    pub fn new(target: &Arc<Stage>) -> Self {
        CompletionCallback {
            target: target.clone(),
            context: None,
        }
    }

    pub fn with_context<C>(target: &Arc<Stage>, context: C) -> Self
    where
        C: Any + Send,
    {
        CompletionCallback {
            target: target.clone(),
            context: Some(Box::new(context)),
        }
    }

    pub fn target(&self) -> &Arc<Stage> {
        &self.target
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub(crate) fn event_done(self, event: StageEvent) {
        let CompletionCallback { target, context } = self;
        target.run_callback(event, context, HistoryKind::Callback);
    }

    pub(crate) fn event_timeout(self, event: StageEvent) {
        let CompletionCallback { target, context } = self;
        target.run_callback(event, context, HistoryKind::Timeout);
    }
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCallback")
            .field("target", &self.target.name())
            .field("has_context", &self.context.is_some())
            .finish()
    }
}
