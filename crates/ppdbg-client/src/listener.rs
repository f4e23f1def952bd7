//! Named-event listener registry.
//!
//! Handlers are kept per event name in registration order. Dispatch clones
//! the handler list before invoking anything, so a handler may register or
//! remove listeners (including itself) while an event is being delivered.
//! Handler panics are not caught.

use crate::envelope::Envelope;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Listener name that receives every unsolicited event.
pub const WILDCARD: &str = "*";

/// A shared event handler.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

type ListenerMap<T> = HashMap<String, Vec<(u64, Handler<T>)>>;

/// Disposer returned by `listen`.
///
/// Dropping it leaves the handler registered; call [`Subscription::remove`]
/// to detach. Removing more than once is a no-op.
pub struct Subscription {
    remover: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(remover: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remover: Mutex::new(Some(Box::new(remover))),
        }
    }

    /// Detach the handler.
    pub fn remove(&self) {
        // Take before calling so a re-entrant remove sees None.
        let remover = self.remover.lock().take();
        if let Some(remover) = remover {
            remover();
        }
    }

    /// Whether [`remove`](Self::remove) has not been called yet.
    pub fn is_active(&self) -> bool {
        self.remover.lock().is_some()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Remove every subscription in `subscriptions`.
pub fn forget(subscriptions: impl IntoIterator<Item = Subscription>) {
    for subscription in subscriptions {
        subscription.remove();
    }
}

/// Maps event names to ordered handler lists.
pub struct ListenerRegistry<T: ?Sized + 'static> {
    lists: Arc<RwLock<ListenerMap<T>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized + 'static> ListenerRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            lists: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `handler` under `name`.
    pub fn listen(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        self.listen_handler(name, Arc::new(handler))
    }

    /// Register an already shared handler under `name`.
    pub fn listen_handler(&self, name: impl Into<String>, handler: Handler<T>) -> Subscription {
        let name = name.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.lists
            .write()
            .entry(name.clone())
            .or_default()
            .push((id, handler));

        let lists: Weak<RwLock<ListenerMap<T>>> = Arc::downgrade(&self.lists);
        Subscription::new(move || {
            if let Some(lists) = lists.upgrade() {
                remove_entry(&lists, &name, id);
            }
        })
    }

    /// Register several handlers at once.
    pub fn listen_all<N, I>(&self, handlers: I) -> Vec<Subscription>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Handler<T>)>,
    {
        handlers
            .into_iter()
            .map(|(name, handler)| self.listen_handler(name, handler))
            .collect()
    }

    /// Snapshot of the handlers registered under `name`.
    pub fn handlers(&self, name: &str) -> Vec<Handler<T>> {
        self.lists
            .read()
            .get(name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Invoke every handler registered under `name`, in registration order.
    ///
    /// Returns how many handlers ran.
    pub fn dispatch(&self, name: &str, value: &T) -> usize {
        let handlers = self.handlers(name);
        for handler in &handlers {
            handler(value);
        }
        handlers.len()
    }

    /// Number of handlers registered under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.lists.read().get(name).map_or(0, Vec::len)
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.lists.read().values().map(Vec::len).sum()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.lists.write().clear();
    }
}

impl ListenerRegistry<Envelope> {
    /// Deliver an unsolicited envelope: wildcard handlers first, then the
    /// handlers registered under its event name.
    pub fn dispatch_event(&self, envelope: &Envelope) -> usize {
        let wildcard = self.dispatch(WILDCARD, envelope);
        wildcard + self.dispatch(&envelope.event, envelope)
    }
}

impl<T: ?Sized + 'static> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lists = self.lists.read();
        let mut names: Vec<(&String, usize)> =
            lists.iter().map(|(name, list)| (name, list.len())).collect();
        names.sort();
        f.debug_struct("ListenerRegistry")
            .field("lists", &names)
            .finish()
    }
}

fn remove_entry<T: ?Sized + 'static>(lists: &RwLock<ListenerMap<T>>, name: &str, id: u64) {
    let mut lists = lists.write();
    if let Some(list) = lists.get_mut(name) {
        list.retain(|(entry_id, _)| *entry_id != id);
        if list.is_empty() {
            lists.remove(name);
        }
    }
}
