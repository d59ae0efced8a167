//! See [`SignalBus`].

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use ahash::AHashMap;
use bytes::Bytes;
use derivative::Derivative;

use crate::carrier::PeerId;

/// Observes one delivered event: the originating peer (if any) and the
/// argument payload.
pub type Listener = Box<dyn FnMut(Option<PeerId>, &Bytes)>;

/// Name-keyed listener registry with a breadth-first dispatch trampoline.
///
/// Listeners run in the single-threaded host context, and a listener is
/// free to broadcast further events. Rather than recursing - which nests
/// unboundedly when listeners chain - a broadcast issued while one is
/// already being dispatched is enqueued and the outer dispatch drains it
/// in arrival order.
///
/// Handles are cheap clones sharing one registry.
///
/// # Example
///
/// ```
/// use std::{cell::RefCell, rc::Rc};
/// use bytes::Bytes;
/// use trellis::signal::SignalBus;
///
/// let bus = SignalBus::new();
/// let seen = Rc::new(RefCell::new(Vec::new()));
///
/// let inner = bus.clone();
/// let log = Rc::clone(&seen);
/// bus.connect("outer", Box::new(move |_, _| {
///     log.borrow_mut().push("outer");
///     // enqueued, not recursed into
///     inner.broadcast(None, "inner", Bytes::new());
///     log.borrow_mut().push("outer done");
/// }));
/// let log = Rc::clone(&seen);
/// bus.connect("inner", Box::new(move |_, _| log.borrow_mut().push("inner")));
///
/// bus.broadcast(None, "outer", Bytes::new());
/// assert_eq!(vec!["outer", "outer done", "inner"], *seen.borrow());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SignalBus {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Derivative, Default)]
#[derivative(Debug)]
struct Inner {
    #[derivative(Debug = "ignore")]
    listeners: AHashMap<String, Vec<Listener>>,
    pending: VecDeque<(Option<PeerId>, String, Bytes)>,
    dispatching: bool,
}

impl SignalBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `event`.
    ///
    /// Listeners for one event run in registration order. Registering from
    /// inside a listener is allowed; the new listener joins dispatch from
    /// the next event onward.
    pub fn connect(&self, event: impl Into<String>, listener: Listener) {
        self.inner
            .borrow_mut()
            .listeners
            .entry(event.into())
            .or_default()
            .push(listener);
    }

    /// Number of listeners registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .borrow()
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Delivers `payload` to every listener of `event`.
    ///
    /// If a dispatch is already running on this bus - i.e. this call came
    /// from inside a listener - the event is enqueued and delivered once
    /// the current one finishes, breadth-first.
    pub fn broadcast(&self, origin: Option<PeerId>, event: &str, payload: Bytes) {
        {
            let mut inner = self.inner.borrow_mut();
            inner
                .pending
                .push_back((origin, event.to_owned(), payload));
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }

        loop {
            let next = self.inner.borrow_mut().pending.pop_front();
            let Some((origin, event, payload)) = next else {
                break;
            };
            // take the listener list out of the registry while it runs, so
            // listeners may borrow the bus through their own handles
            let listeners = self.inner.borrow_mut().listeners.remove(&event);
            let Some(mut listeners) = listeners else {
                continue;
            };
            for listener in &mut listeners {
                listener(origin, &payload);
            }
            let mut inner = self.inner.borrow_mut();
            // listeners registered mid-dispatch landed in a fresh list;
            // keep both, originals first
            if let Some(newly) = inner.listeners.remove(&event) {
                listeners.extend(newly);
            }
            inner.listeners.insert(event, listeners);
        }
        self.inner.borrow_mut().dispatching = false;
    }
}
