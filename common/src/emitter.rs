// Composed publish/subscribe emitter used by consumers and producers

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

/// An event that can be dispatched through an [`Emitter`]
pub trait Event {
    /// Key used to look up listeners for this event
    type Kind: Copy + Eq + Hash + Debug;

    fn kind(&self) -> Self::Kind;
}

/// Identifier returned by [`Emitter::on`], used to remove a listener later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<dyn Fn(&E)>;

struct Registration<E> {
    id: ListenerId,
    once: bool,
    listener: Listener<E>,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Rc::clone(&self.listener),
        }
    }
}

/// Listener registry mapping an event kind to listeners in registration order.
///
/// Emission iterates a snapshot of the registry, so listeners may register,
/// remove listeners or emit again while being called. Listeners registered
/// during an emit first fire on the next emit; listeners removed during an
/// emit (including by `remove_all_listeners`) are not called for the rest of it.
pub struct Emitter<E: Event> {
    listeners: RefCell<HashMap<E::Kind, Vec<Registration<E>>>>,
    next_id: Cell<u64>,
}

impl<E: Event> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E: Event> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for every event of the given kind
    pub fn on(&self, kind: E::Kind, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.register(kind, false, Rc::new(listener))
    }

    /// Register a listener that is removed after its first invocation
    pub fn once(&self, kind: E::Kind, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.register(kind, true, Rc::new(listener))
    }

    fn register(&self, kind: E::Kind, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .entry(kind)
            .or_default()
            .push(Registration { id, once, listener });
        id
    }

    /// Remove a single listener. Returns false if it was not registered.
    pub fn remove_listener(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|r| r.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Remove every listener for `kind`, or every listener at all when `None`
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut listeners = self.listeners.borrow_mut();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .borrow()
            .get(&kind)
            .map_or(0, |registered| registered.len())
    }

    /// Call every listener registered for the event's kind, in registration order.
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Registration<E>> = match self.listeners.borrow().get(&kind) {
            Some(registered) => registered.clone(),
            None => return 0,
        };

        let mut invoked = 0;
        for registration in &snapshot {
            if !self.claim(kind, registration) {
                continue;
            }
            (registration.listener)(event);
            invoked += 1;
        }
        invoked
    }

    /// Check that a snapshot entry is still registered right before calling it.
    /// A `once` listener is removed here, so it runs at most once even when
    /// emits nest.
    fn claim(&self, kind: E::Kind, registration: &Registration<E>) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };
        let Some(position) = registered.iter().position(|r| r.id == registration.id) else {
            return false;
        };
        if registration.once {
            registered.remove(position);
            if registered.is_empty() {
                listeners.remove(&kind);
            }
        }
        true
    }
}
