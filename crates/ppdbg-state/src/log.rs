//! Bounded buffer of emulator log output.

use parking_lot::{Mutex, RwLock};
use ppdbg_client::{
    forget, Envelope, ErrorLevel, Handlers, ListenerRegistry, Listeners, Subscription,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How many items the buffer keeps.
pub const MAX_LOG_ITEMS: usize = 5000;

const ITEMS_CHANGED: &str = "items";

/// One buffered line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogItem {
    /// Position in the stream, starting at 1.
    pub id: u64,
    /// Text, including its trailing newline.
    pub message: String,
    /// Severity.
    pub level: Option<ErrorLevel>,
    /// Emulator log channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Emulator timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

struct Inner {
    items: RwLock<VecDeque<LogItem>>,
    next_id: AtomicU64,
    capacity: usize,
    watchers: ListenerRegistry<[LogItem]>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Collects `log` events and session errors.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Inner>,
}

impl LogBuffer {
    /// Create an empty buffer holding up to [`MAX_LOG_ITEMS`].
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_ITEMS)
    }

    /// Create an empty buffer holding up to `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(VecDeque::with_capacity(capacity.min(MAX_LOG_ITEMS))),
                next_id: AtomicU64::new(1),
                capacity,
                watchers: ListenerRegistry::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a buffer fed by `log` events and by the session's error
    /// callback, which it takes over.
    pub fn attach(listeners: &Listeners) -> Self {
        let buffer = Self::new();

        let weak = Arc::downgrade(&buffer.inner);
        listeners.session().set_on_error(move |message, level| {
            if let Some(inner) = weak.upgrade() {
                LogBuffer { inner }.push_error(message, level);
            }
        });

        let weak = Arc::downgrade(&buffer.inner);
        let subscriptions = listeners.listen(Handlers::new().on("log", move |envelope| {
            if let Some(inner) = weak.upgrade() {
                LogBuffer { inner }.push_event(envelope);
            }
        }));
        *buffer.inner.subscriptions.lock() = subscriptions;

        buffer
    }

    /// Append a `log` event.
    pub fn push_event(&self, envelope: &Envelope) {
        self.push(
            envelope.message().unwrap_or_default().to_string(),
            envelope.level(),
            envelope.get_str("channel").map(str::to_string),
            envelope.get_str("timestamp").map(str::to_string),
        );
    }

    /// Append an error-path message. A newline is added.
    pub fn push_error(&self, message: &str, level: Option<ErrorLevel>) {
        self.push(format!("{message}\n"), level, None, None);
    }

    fn push(
        &self,
        message: String,
        level: Option<ErrorLevel>,
        channel: Option<String>,
        timestamp: Option<String>,
    ) {
        let snapshot = {
            let mut items = self.inner.items.write();
            // Allocated under the lock so ids stay ordered in the buffer.
            items.push_back(LogItem {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                message,
                level,
                channel,
                timestamp,
            });
            while items.len() > self.inner.capacity {
                items.pop_front();
            }
            if self.inner.watchers.is_empty() {
                return;
            }
            items.iter().cloned().collect::<Vec<_>>()
        };
        self.inner.watchers.dispatch(ITEMS_CHANGED, &snapshot[..]);
    }

    /// Copy of the buffered items, oldest first.
    pub fn items(&self) -> Vec<LogItem> {
        self.inner.items.read().iter().cloned().collect()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    /// Whether nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `watcher` with the current items now and after every append.
    pub fn listen(&self, watcher: impl Fn(&[LogItem]) + Send + Sync + 'static) -> Subscription {
        watcher(self.items().as_slice());
        self.inner.watchers.listen(ITEMS_CHANGED, watcher)
    }

    /// Stop collecting `log` events.
    pub fn shutdown(&self) {
        forget(std::mem::take(&mut *self.inner.subscriptions.lock()));
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBuffer")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
