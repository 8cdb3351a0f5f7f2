//! Conditional admission of events.
//!
//! An `EventDispatcher` sits in front of a single next stage and asks a
//! `DispatchPolicy` whether each arriving event may pass. Events that may not
//! pass yet are stored under a key until `wakeup` is called for that key.
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use seda_error::{Result, SedaError};
use tracing::{debug, error, trace, warn};

use crate::event::StageEvent;
use crate::stage::{Stage, StageHandler};

/// Opaque context stored alongside an event, passed back to the policy when
/// the event is woken up.
pub type DispatchContext = Box<dyn Any + Send>;

/// Outcome of a dispatch decision.
pub enum Dispatch {
    /// Forward the event to the next stage.
    Send(StageEvent),
    /// Hold the event until woken up with `key`.
    Store {
        event: StageEvent,
        key: String,
        context: Option<DispatchContext>,
    },
    /// The policy disposed of the event.
    Fail,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(event) => f.debug_tuple("Send").field(event).finish(),
            Self::Store { event, key, .. } => f
                .debug_struct("Store")
                .field("event", event)
                .field("key", key)
                .finish_non_exhaustive(),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

/// Decides whether an event may proceed.
///
/// Called with the dispatcher's store locked, so decisions are serialized
/// with `wakeup`.
pub trait DispatchPolicy: Send + Sync + 'static {
    /// `context` is None for newly arriving events, and the stored context
    /// for events being woken up.
    fn dispatch(&self, event: StageEvent, context: Option<DispatchContext>) -> Dispatch;
}

struct StoredEvent {
    event: StageEvent,
    context: Option<DispatchContext>,
}

type EventStore = HashMap<String, VecDeque<StoredEvent>>;

/// Stage handler gating events to its single next stage.
pub struct EventDispatcher<P> {
    policy: P,
    store: Mutex<EventStore>,
    next_stage: RwLock<Option<Arc<Stage>>>,
}

impl<P> EventDispatcher<P>
where
    P: DispatchPolicy,
{
    pub fn new(policy: P) -> Self {
        EventDispatcher {
            policy,
            store: Mutex::new(HashMap::new()),
            next_stage: RwLock::new(None),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Number of events waiting across all keys.
    pub fn num_stored(&self) -> usize {
        self.store.lock().values().map(|list| list.len()).sum()
    }

    /// Re-dispatch the oldest event stored under `key`.
    ///
    /// Returns true if the event was sent to the next stage.
    pub fn wakeup(&self, key: &str) -> bool {
        self.wakeup_with(key, |_| {})
    }

    /// Run `f` with the store locked, then wake up the oldest event stored
    /// under `key`.
    fn wakeup_with<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&P),
    {
        let to_send = {
            let mut store = self.store.lock();
            f(&self.policy);

            let stored = match store.get_mut(key) {
                Some(list) => {
                    let stored = list.pop_front();
                    if list.is_empty() {
                        store.remove(key);
                    }
                    stored
                }
                None => None,
            };

            match stored {
                Some(stored) => self.route(&mut store, stored.event, stored.context),
                None => return false,
            }
        };

        match to_send {
            Some(event) => {
                self.send(event);
                true
            }
            None => false,
        }
    }

    /// Apply the policy, storing the event if needed. Returns the event if it
    /// should be sent.
    fn route(
        &self,
        store: &mut EventStore,
        event: StageEvent,
        context: Option<DispatchContext>,
    ) -> Option<StageEvent> {
        match self.policy.dispatch(event, context) {
            Dispatch::Send(event) => Some(event),
            Dispatch::Store {
                event,
                key,
                context,
            } => {
                trace!(%key, "storing event");
                store
                    .entry(key)
                    .or_default()
                    .push_back(StoredEvent { event, context });
                None
            }
            Dispatch::Fail => {
                error!("failed to dispatch event");
                None
            }
        }
    }

    fn send(&self, event: StageEvent) {
        let next = self.next_stage.read().clone();
        match next {
            Some(next) => {
                if let Err(rejected) = next.add_event(event) {
                    warn!(stage = %rejected.stage(), "next stage rejected dispatched event");
                    rejected.into_event().done_immediate();
                }
            }
            None => {
                error!("dispatcher has no next stage");
                event.done_immediate();
            }
        }
    }
}

impl<P> fmt::Debug for EventDispatcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

impl<P> StageHandler for EventDispatcher<P>
where
    P: DispatchPolicy,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initialize(&self, stage: &Arc<Stage>) -> Result<()> {
        let next = stage.next_stages();
        if next.len() != 1 {
            return Err(SedaError::new("Dispatcher requires exactly one next stage")
                .with_field("stage", stage.name())
                .with_field("next_stages", next.len()));
        }
        *self.next_stage.write() = Some(next[0].clone());
        Ok(())
    }

    fn handle_event(&self, _stage: &Arc<Stage>, event: StageEvent) {
        let to_send = {
            let mut store = self.store.lock();
            self.route(&mut store, event, None)
        };

        if let Some(event) = to_send {
            self.send(event);
        }
    }

    fn cleanup(&self, stage: &Arc<Stage>) {
        let store = std::mem::take(&mut *self.store.lock());
        let count: usize = store.values().map(|list| list.len()).sum();
        if count > 0 {
            debug!(stage = %stage.name(), count, "completing stored events");
        }

        for stored in store.into_values().flatten() {
            stored.event.done();
        }

        *self.next_stage.write() = None;
    }
}

/// Policy allowing at most one in-flight event per key.
///
/// The key is extracted from the event by a user provided function. Events
/// without a key always pass. A key is held until it's released with
/// `EventDispatcher::finish`.
pub struct KeyedExclusive<F> {
    key_fn: F,
    in_flight: Mutex<HashSet<String>>,
}

impl<F> KeyedExclusive<F>
where
    F: Fn(&StageEvent) -> Option<String> + Send + Sync + 'static,
{
    pub fn new(key_fn: F) -> Self {
        KeyedExclusive {
            key_fn,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains(key)
    }

    fn release(&self, key: &str) -> bool {
        self.in_flight.lock().remove(key)
    }
}

impl<F> DispatchPolicy for KeyedExclusive<F>
where
    F: Fn(&StageEvent) -> Option<String> + Send + Sync + 'static,
{
    fn dispatch(&self, event: StageEvent, context: Option<DispatchContext>) -> Dispatch {
        let Some(key) = (self.key_fn)(&event) else {
            return Dispatch::Send(event);
        };

        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&key) {
            Dispatch::Store {
                event,
                key,
                context,
            }
        } else {
            in_flight.insert(key);
            Dispatch::Send(event)
        }
    }
}

impl<F> EventDispatcher<KeyedExclusive<F>>
where
    F: Fn(&StageEvent) -> Option<String> + Send + Sync + 'static,
{
    /// Release `key` and send the next event stored under it, if any.
    ///
    /// Returns true if a stored event was sent.
    pub fn finish(&self, key: &str) -> bool {
        self.wakeup_with(key, |policy| {
            if !policy.release(key) {
                warn!(%key, "finished key that was not in flight");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_key(event: &StageEvent) -> Option<String> {
        event.payload::<u32>().map(|id| format!("session-{id}"))
    }

    #[test]
    fn keyed_exclusive_stores_second_event() {
        let policy = KeyedExclusive::new(session_key);

        let first = policy.dispatch(StageEvent::new(1_u32), None);
        assert!(matches!(first, Dispatch::Send(_)));

        let second = policy.dispatch(StageEvent::new(1_u32), None);
        match second {
            Dispatch::Store { key, .. } => assert_eq!("session-1", key),
            other => panic!("unexpected dispatch: {other:?}"),
        }

        let other = policy.dispatch(StageEvent::new(2_u32), None);
        assert!(matches!(other, Dispatch::Send(_)));

        assert!(policy.is_in_flight("session-1"));
        assert!(policy.release("session-1"));
        assert!(!policy.is_in_flight("session-1"));
    }

    #[test]
    fn keyless_events_pass() {
        let policy = KeyedExclusive::new(session_key);
        for _ in 0..3 {
            let dispatch = policy.dispatch(StageEvent::new("no key"), None);
            assert!(matches!(dispatch, Dispatch::Send(_)));
        }
    }

    #[test]
    fn wakeup_unknown_key() {
        let dispatcher = EventDispatcher::new(KeyedExclusive::new(session_key));
        assert!(!dispatcher.wakeup("missing"));
        assert_eq!(0, dispatcher.num_stored());
    }
}
