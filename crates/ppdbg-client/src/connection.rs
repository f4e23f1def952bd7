//! Connection-state broadcasting and batched listener registration.
//!
//! The session itself only knows about frames. Whether the debugger counts
//! as "connected" is tracked here, by whoever owns the session, through
//! [`ConnectionState::change`]. Two pseudo-events hang off it:
//!
//! - [`CONNECTION`] runs once right away if already connected, then on every
//!   transition into connected.
//! - [`CONNECTION_CHANGE`] runs on every call to `change` with the new flag.

use crate::envelope::Envelope;
use crate::listener::{forget, Handler, ListenerRegistry, Subscription};
use crate::session::Session;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Pseudo-event fired when the session becomes connected.
pub const CONNECTION: &str = "connection";

/// Pseudo-event fired with the new flag on every connection change.
pub const CONNECTION_CHANGE: &str = "connection.change";

/// Tracks and broadcasts whether the debugger is connected.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: AtomicBool,
    changes: ListenerRegistry<bool>,
}

impl ConnectionState {
    /// Create a disconnected state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the new state and notify every change subscriber.
    pub fn change(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let notified = self.changes.dispatch(CONNECTION_CHANGE, &connected);
        debug!(connected, notified, "Connection state changed");
    }

    /// Last value passed to [`change`](Self::change).
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run `handler` with the new flag on every change.
    pub fn on_connection_change(
        &self,
        handler: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.changes
            .listen(CONNECTION_CHANGE, move |connected: &bool| handler(*connected))
    }

    /// Run `handler` now if connected, then on every transition into
    /// connected.
    pub fn on_connection(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::new(handler);
        if self.is_connected() {
            handler();
        }
        self.changes
            .listen(CONNECTION_CHANGE, move |connected: &bool| {
                if *connected {
                    handler();
                }
            })
    }
}

enum Route {
    Connection(Arc<dyn Fn() + Send + Sync>),
    ConnectionChange(Arc<dyn Fn(bool) + Send + Sync>),
    Event(String, Handler<Envelope>),
}

/// A batch of handlers for [`Listeners::listen`].
#[derive(Default)]
pub struct Handlers {
    routes: Vec<Route>,
}

impl Handlers {
    /// Start an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle [`CONNECTION`].
    pub fn on_connection(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.routes.push(Route::Connection(Arc::new(handler)));
        self
    }

    /// Handle [`CONNECTION_CHANGE`].
    pub fn on_connection_change(mut self, handler: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.routes.push(Route::ConnectionChange(Arc::new(handler)));
        self
    }

    /// Handle the unsolicited event `name`.
    pub fn on(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Self {
        self.routes.push(Route::Event(name.into(), Arc::new(handler)));
        self
    }

    /// Number of handlers in the batch.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("count", &self.routes.len())
            .finish()
    }
}

/// A session paired with its connection state.
///
/// This is what state caches subscribe through: protocol events go to the
/// session's registry, connection pseudo-events go to the broadcaster.
#[derive(Debug, Clone)]
pub struct Listeners {
    session: Session,
    connection: Arc<ConnectionState>,
}

impl Listeners {
    /// Pair `session` with a fresh, disconnected state.
    pub fn new(session: Session) -> Self {
        Self::with_state(session, Arc::new(ConnectionState::new()))
    }

    /// Pair `session` with an existing state.
    pub fn with_state(session: Session, connection: Arc<ConnectionState>) -> Self {
        Self {
            session,
            connection,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The connection broadcaster.
    pub fn connection(&self) -> &Arc<ConnectionState> {
        &self.connection
    }

    /// Register a batch of handlers, routing each to where it belongs.
    pub fn listen(&self, handlers: Handlers) -> Vec<Subscription> {
        handlers
            .routes
            .into_iter()
            .map(|route| match route {
                Route::Connection(handler) => {
                    self.connection.on_connection(move || handler())
                }
                Route::ConnectionChange(handler) => self
                    .connection
                    .on_connection_change(move |connected| handler(connected)),
                Route::Event(name, handler) => {
                    self.session.listeners().listen_handler(name, handler)
                }
            })
            .collect()
    }

    /// Remove every subscription.
    pub fn forget(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        forget(subscriptions);
    }
}
