//! The event bus.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use keel_core::{KeelError, KeelResult};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::phases::Phase;

/// Priority used when none is given.
pub const DEFAULT_PRIORITY: i32 = 0;

type HandlerFn<P> = Arc<dyn Fn(&mut <P as Phase>::Payload) -> KeelResult<()> + Send + Sync>;

struct Entry {
    priority: i32,
    seq: u64,
    label: String,
    handler: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct State {
    handlers: HashMap<&'static str, Vec<Entry>>,
    dispatched: HashSet<&'static str>,
    next_seq: u64,
}

/// Something that registers handlers for one or more phases.
///
/// ```
/// use std::sync::Arc;
/// use keel_events::{BuildView, EventBus, Subscriber};
///
/// struct Branding;
///
/// impl Subscriber for Branding {
///     fn subscribe(self: Arc<Self>, bus: &EventBus) {
///         bus.subscribe::<BuildView, _>("branding", 10, |view| view.insert("brand", "Keel"));
///     }
/// }
///
/// let bus = EventBus::new();
/// bus.add_subscriber(Arc::new(Branding));
/// assert_eq!(bus.handler_count("build-view"), 1);
/// ```
pub trait Subscriber: Send + Sync + 'static {
    /// Registers this subscriber's handlers on `bus`.
    fn subscribe(self: Arc<Self>, bus: &EventBus);
}

/// Ordered handlers per phase.
///
/// Handlers run highest priority first; equal priorities run in
/// registration order. Dispatch works on a snapshot, so a handler registered
/// while (or after) a phase is dispatched does not run in that dispatch.
#[derive(Default)]
pub struct EventBus {
    state: RwLock<State>,
}

impl EventBus {
    /// An empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for phase `P`.
    ///
    /// `label` names the handler in logs.
    pub fn subscribe<P, F>(&self, label: impl Into<String>, priority: i32, handler: F)
    where
        P: Phase,
        F: Fn(&mut P::Payload) -> KeelResult<()> + Send + Sync + 'static,
    {
        let label = label.into();
        let handler: HandlerFn<P> = Arc::new(handler);

        let mut state = self.state.write();
        if state.dispatched.contains(P::NAME) {
            warn!(phase = P::NAME, handler = %label, "subscribed after the phase was dispatched");
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.handlers.entry(P::NAME).or_default().push(Entry {
            priority,
            seq,
            label,
            handler: Box::new(handler),
        });
    }

    /// Lets `subscriber` register its handlers.
    pub fn add_subscriber<S: Subscriber + ?Sized>(&self, subscriber: Arc<S>) {
        subscriber.subscribe(self);
    }

    /// Runs every handler of `P` against `payload`.
    ///
    /// Stops at the first failing handler and returns its error. Changes made
    /// by the handlers that already ran stay in `payload`.
    pub fn dispatch<P: Phase>(&self, payload: &mut P::Payload) -> KeelResult<()> {
        let snapshot = self.snapshot::<P>()?;
        debug!(phase = P::NAME, handlers = snapshot.len(), "dispatching phase");

        for (label, handler) in snapshot {
            if let Err(err) = handler(payload) {
                warn!(phase = P::NAME, handler = %label, error = %err, "phase handler failed");
                return Err(err);
            }
        }
        Ok(())
    }

    fn snapshot<P: Phase>(&self) -> KeelResult<Vec<(String, HandlerFn<P>)>> {
        let mut state = self.state.write();
        state.dispatched.insert(P::NAME);

        let Some(entries) = state.handlers.get(P::NAME) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<&Entry> = entries.iter().collect();
        ordered.sort_by_key(|entry| (Reverse(entry.priority), entry.seq));

        ordered
            .into_iter()
            .map(|entry| {
                entry
                    .handler
                    .downcast_ref::<HandlerFn<P>>()
                    .map(|handler| (entry.label.clone(), Arc::clone(handler)))
                    .ok_or_else(|| {
                        KeelError::internal(format!(
                            "handler {} does not accept the {} payload",
                            entry.label,
                            P::NAME
                        ))
                    })
            })
            .collect()
    }

    /// Number of handlers registered for `phase`.
    #[must_use]
    pub fn handler_count(&self, phase: &str) -> usize {
        self.state.read().handlers.get(phase).map_or(0, Vec::len)
    }

    /// Whether `phase` has been dispatched at least once.
    #[must_use]
    pub fn has_dispatched(&self, phase: &str) -> bool {
        self.state.read().dispatched.contains(phase)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        let mut phases: Vec<_> = state
            .handlers
            .iter()
            .map(|(name, entries)| (*name, entries.len()))
            .collect();
        phases.sort_unstable();
        f.debug_struct("EventBus").field("phases", &phases).finish()
    }
}
