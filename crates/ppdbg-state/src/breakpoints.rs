//! Breakpoint persistence across debugger sessions.
//!
//! When enabled, breakpoints are saved per game whenever the debugger
//! reports a change and re-added the next time the same game is loaded.
//! Change notifications are debounced so that a burst of edits results in a
//! single `*.breakpoint.list` request per kind.

use crate::error::{Result, StateError};
use parking_lot::Mutex;
use ppdbg_client::event::breakpoint_list;
use ppdbg_client::{forget, DebuggerEvent, Envelope, Handlers, Listeners, Session, Subscription};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between a breakpoint change and the list request it triggers.
pub const UPDATE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Fields that describe a breakpoint but cannot be sent back to add it.
const INFORMATIONAL_FIELDS: &[&str] = &["code", "symbol", "hits"];

/// Fields the debugger reports as null but does not accept as null.
const NULLABLE_FIELDS: &[&str] = &["condition", "logFormat"];

/// The two breakpoint families the debugger tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Execution breakpoints.
    Cpu,
    /// Memory access breakpoints.
    Memory,
}

impl BreakpointKind {
    /// Both kinds.
    pub const ALL: [BreakpointKind; 2] = [Self::Cpu, Self::Memory];

    /// Event namespace, `cpu` or `memory`.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }

    /// Event that adds one breakpoint.
    pub fn add_event(self) -> String {
        format!("{}.breakpoint.add", self.prefix())
    }

    /// Event that lists every breakpoint.
    pub fn list_event(self) -> String {
        format!("{}.breakpoint.list", self.prefix())
    }

    /// Events that signal the list changed.
    pub fn change_events(self) -> [String; 3] {
        let prefix = self.prefix();
        [
            format!("{prefix}.breakpoint.add"),
            format!("{prefix}.breakpoint.update"),
            format!("{prefix}.breakpoint.remove"),
        ]
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Strip a listed breakpoint down to what `*.breakpoint.add` accepts.
pub fn clean_for_persist(breakpoint: &Value) -> Value {
    let mut breakpoint = breakpoint.clone();
    if let Value::Object(fields) = &mut breakpoint {
        for key in INFORMATIONAL_FIELDS {
            fields.remove(*key);
        }
        for key in NULLABLE_FIELDS {
            if fields.get(*key).is_some_and(Value::is_null) {
                fields.remove(*key);
            }
        }
    }
    breakpoint
}

/// One JSON file per breakpoint kind and game under a directory.
#[derive(Debug, Clone)]
pub struct BreakpointStore {
    dir: PathBuf,
}

impl BreakpointStore {
    /// Store files under `dir`, created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding `kind` breakpoints for `game_id`.
    pub fn path(&self, kind: BreakpointKind, game_id: &str) -> Result<PathBuf> {
        let valid = !game_id.is_empty()
            && game_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StateError::InvalidGameId(game_id.to_string()));
        }
        Ok(self.dir.join(format!("breakpoints_{kind}_{game_id}.json")))
    }

    /// Saved breakpoints, or an empty list if none were saved.
    pub fn load(&self, kind: BreakpointKind, game_id: &str) -> Result<Vec<Value>> {
        let path = self.path(kind, game_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Replace the saved breakpoints.
    pub fn save(&self, kind: BreakpointKind, game_id: &str, breakpoints: &[Value]) -> Result<()> {
        let path = self.path(kind, game_id)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_string_pretty(breakpoints)?)?;
        debug!(?path, count = breakpoints.len(), "Saved breakpoints");
        Ok(())
    }
}

struct Inner {
    session: Session,
    store: BreakpointStore,
    enabled: AtomicBool,
    debounce: Duration,
    game_id: Mutex<Option<String>>,
    scheduled: Mutex<HashSet<BreakpointKind>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Saves and restores breakpoints per game.
#[derive(Clone)]
pub struct BreakpointPersister {
    inner: Arc<Inner>,
}

impl BreakpointPersister {
    /// Subscribe to `listeners`, storing files in `store`.
    ///
    /// Starts disabled. Restores and list requests are spawned on the
    /// current Tokio runtime.
    pub fn attach(listeners: &Listeners, store: BreakpointStore) -> Self {
        Self::attach_with_debounce(listeners, store, UPDATE_DEBOUNCE)
    }

    /// Like [`attach`](Self::attach) with a custom debounce delay.
    pub fn attach_with_debounce(
        listeners: &Listeners,
        store: BreakpointStore,
        debounce: Duration,
    ) -> Self {
        let persister = Self {
            inner: Arc::new(Inner {
                session: listeners.session().clone(),
                store,
                enabled: AtomicBool::new(false),
                debounce,
                game_id: Mutex::new(None),
                scheduled: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let weak = Arc::downgrade(&persister.inner);
        let on = |handler: fn(&Arc<Inner>, &Envelope)| {
            let weak = weak.clone();
            move |envelope: &Envelope| {
                if let Some(inner) = weak.upgrade() {
                    handler(&inner, envelope);
                }
            }
        };

        let mut handlers = Handlers::new()
            .on("game.start", on(Inner::game_loaded))
            .on("game.status", on(Inner::game_loaded))
            .on("game.quit", on(|inner, _| *inner.game_id.lock() = None));
        for kind in BreakpointKind::ALL {
            for event in kind.change_events() {
                let weak = weak.clone();
                handlers = handlers.on(event, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        inner.schedule_update(kind);
                    }
                });
            }
            let weak = weak.clone();
            handlers = handlers.on(kind.list_event(), move |envelope| {
                if let Some(inner) = weak.upgrade() {
                    inner.process_list(kind, envelope);
                }
            });
        }

        *persister.inner.subscriptions.lock() = listeners.listen(handlers);
        persister
    }

    /// Turn persistence on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, dir = ?self.inner.store.dir(), "Breakpoint persistence toggled");
    }

    /// Whether persistence is on.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Game whose breakpoints are being tracked.
    pub fn game_id(&self) -> Option<String> {
        self.inner.game_id.lock().clone()
    }

    /// The backing store.
    pub fn store(&self) -> &BreakpointStore {
        &self.inner.store
    }

    /// Stop following debugger events.
    pub fn shutdown(&self) {
        forget(std::mem::take(&mut *self.inner.subscriptions.lock()));
    }
}

impl fmt::Debug for BreakpointPersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointPersister")
            .field("enabled", &self.is_enabled())
            .field("game_id", &self.game_id())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl Inner {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn tracked_game(&self) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        self.game_id.lock().clone()
    }

    fn game_loaded(self: &Arc<Self>, envelope: &Envelope) {
        if !self.enabled() {
            return;
        }
        let event = DebuggerEvent::from_envelope(envelope);
        let Some(game_id) = event.game_id() else {
            return;
        };
        *self.game_id.lock() = Some(game_id.to_string());

        for kind in BreakpointKind::ALL {
            self.restore(kind, game_id);
        }
    }

    fn restore(&self, kind: BreakpointKind, game_id: &str) {
        let saved = match self.store.load(kind, game_id) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(%kind, game_id = %game_id, error = %e, "Unable to restore breakpoints");
                return;
            }
        };
        if saved.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%kind, "No runtime to restore breakpoints on");
            return;
        };

        info!(%kind, game_id = %game_id, count = saved.len(), "Restoring breakpoints");
        for breakpoint in saved {
            let request = self
                .session
                .send(Envelope::with_fields(kind.add_event(), breakpoint));
            runtime.spawn(async move {
                if let Err(e) = request.await {
                    warn!(%kind, error = %e, "Unable to restore breakpoint");
                }
            });
        }
    }

    fn schedule_update(self: &Arc<Self>, kind: BreakpointKind) {
        if self.tracked_game().is_none() {
            return;
        }
        if !self.scheduled.lock().insert(kind) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.scheduled.lock().remove(&kind);
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let debounce = self.debounce;
        runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let request = inner.session.send(Envelope::new(kind.list_event()));
            inner.scheduled.lock().remove(&kind);
            drop(inner);

            match request.await {
                Ok(Some(reply)) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.process_list(kind, &reply);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(%kind, error = %e, "Breakpoint list request failed"),
            }
        });
    }

    fn process_list(&self, kind: BreakpointKind, envelope: &Envelope) {
        let Some(game_id) = self.tracked_game() else {
            return;
        };
        let Some(breakpoints) = breakpoint_list(envelope) else {
            return;
        };

        let cleaned: Vec<Value> = breakpoints.iter().map(clean_for_persist).collect();
        if let Err(e) = self.store.save(kind, &game_id, &cleaned) {
            warn!(%kind, game_id = %game_id, error = %e, "Unable to save breakpoints");
        }
    }
}
