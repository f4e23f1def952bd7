//! Cached emulator state.
//!
//! [`GameStatus`] follows the debugger's events to keep a snapshot of what
//! the emulator is doing: which game is loaded, whether it is running,
//! paused or stopped at a breakpoint, and where `pc` is. Watchers are only
//! told about snapshots that actually differ from the previous one.

use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use ppdbg_client::{
    forget, DebuggerEvent, Envelope, Handlers, ListenerRegistry, Listeners, Session,
    Subscription,
};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

const STATE_CHANGED: &str = "state";

/// Events [`GameStatus`] follows.
pub const GAME_EVENTS: &[&str] = &[
    "cpu.stepping",
    "cpu.resume",
    "cpu.setReg",
    "cpu.getAllRegs",
    "game.start",
    "game.status",
    "game.quit",
    "game.pause",
    "game.resume",
];

/// A snapshot of the emulator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameState {
    /// Id of the loaded game.
    pub id: Option<String>,
    /// Whether a debugger connection is active.
    pub connected: bool,
    /// Whether the CPU is in break mode.
    pub stepping: bool,
    /// Whether emulation is paused.
    pub paused: bool,
    /// Whether a game has been started.
    pub started: bool,
    /// Program counter, or 0.
    pub pc: u32,
    /// Thread selected for inspection.
    pub current_thread: Option<u32>,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            id: None,
            connected: false,
            stepping: false,
            paused: true,
            started: false,
            pc: 0,
            current_thread: None,
        }
    }
}

impl GameState {
    /// Fold one debugger event into the snapshot.
    pub fn apply(&mut self, event: &DebuggerEvent) {
        match event {
            DebuggerEvent::CpuStatus { stepping, paused, pc } => {
                self.connected = true;
                self.started = *pc != 0 || *stepping;
                self.stepping = *stepping;
                self.paused = *paused;
                self.pc = *pc;
            }
            DebuggerEvent::CpuStepping { pc } => {
                self.stepping = true;
                self.pc = *pc;
            }
            DebuggerEvent::CpuResume => self.stepping = false,
            DebuggerEvent::CpuSetReg { .. } | DebuggerEvent::CpuGetAllRegs { .. } => {
                if let Some(pc) = event.pc() {
                    self.pc = pc;
                }
            }
            DebuggerEvent::GameStart { .. } => {
                self.id = event.game_id().map(str::to_string);
                self.started = true;
                self.paused = false;
            }
            DebuggerEvent::GameStatus { .. } => {
                self.id = event.game_id().map(str::to_string);
            }
            DebuggerEvent::GameQuit => {
                self.started = false;
                self.stepping = false;
                self.paused = true;
                self.pc = 0;
                self.current_thread = None;
            }
            DebuggerEvent::GamePause => self.paused = true,
            DebuggerEvent::GameResume => self.paused = false,
            _ => {}
        }
    }

    /// Reset for a connection change. Any reconnect is assumed paused until
    /// the emulator says otherwise.
    pub fn connection_changed(&mut self, connected: bool) {
        self.connected = connected;
        self.started = false;
        self.stepping = false;
        self.paused = true;
        if !connected {
            self.current_thread = None;
        }
    }
}

struct Inner {
    state: RwLock<GameState>,
    watchers: ListenerRegistry<GameState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Inner {
    fn update(&self, change: impl FnOnce(&mut GameState)) {
        let snapshot = {
            let mut state = self.state.write();
            let mut next = state.clone();
            change(&mut next);
            if next == *state {
                return;
            }
            *state = next.clone();
            next
        };
        debug!(?snapshot, "Game state changed");
        self.watchers.dispatch(STATE_CHANGED, &snapshot);
    }
}

/// Live cache of the emulator state.
#[derive(Clone)]
pub struct GameStatus {
    inner: Arc<Inner>,
}

impl GameStatus {
    /// Create a detached cache in the default state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(GameState::default()),
                watchers: ListenerRegistry::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a cache and subscribe it to `listeners`.
    ///
    /// Each time the connection comes up, `cpu.status` is requested to seed
    /// the cache. This needs a Tokio runtime.
    pub fn attach(listeners: &Listeners) -> Self {
        let status = Self::new();
        let weak = Arc::downgrade(&status.inner);
        let session = listeners.session().clone();

        let mut handlers = Handlers::new()
            .on_connection({
                let weak = weak.clone();
                move || request_cpu_status(&weak, &session)
            })
            .on_connection_change({
                let weak = weak.clone();
                move |connected| {
                    if let Some(inner) = weak.upgrade() {
                        inner.update(|state| state.connection_changed(connected));
                    }
                }
            });
        for name in GAME_EVENTS {
            let weak = weak.clone();
            handlers = handlers.on(*name, move |envelope| {
                if let Some(inner) = weak.upgrade() {
                    let event = DebuggerEvent::from_envelope(envelope);
                    inner.update(|state| state.apply(&event));
                }
            });
        }

        *status.inner.subscriptions.lock() = listeners.listen(handlers);
        status
    }

    /// Current snapshot.
    pub fn state(&self) -> GameState {
        self.inner.state.read().clone()
    }

    /// Fold a reply or event into the cache.
    pub fn apply(&self, envelope: &Envelope) {
        let event = DebuggerEvent::from_envelope(envelope);
        self.inner.update(|state| state.apply(&event));
    }

    /// Select the thread to inspect.
    pub fn set_current_thread(&self, thread: Option<u32>) {
        self.inner.update(|state| state.current_thread = thread);
    }

    /// Ask the emulator for its CPU and game status and fold both replies in.
    pub async fn refresh(&self, session: &Session) -> Result<GameState> {
        let cpu = session.send(Envelope::new("cpu.status"));
        let game = session.send(Envelope::new("game.status"));
        for reply in [cpu.await?, game.await?].into_iter().flatten() {
            self.apply(&reply);
        }
        Ok(self.state())
    }

    /// Run `watcher` with every new snapshot.
    pub fn listen_state(
        &self,
        watcher: impl Fn(&GameState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.watchers.listen(STATE_CHANGED, watcher)
    }

    /// Stop following debugger events.
    pub fn shutdown(&self) {
        forget(std::mem::take(&mut *self.inner.subscriptions.lock()));
    }
}

impl Default for GameStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameStatus")
            .field("state", &*self.inner.state.read())
            .finish_non_exhaustive()
    }
}

fn request_cpu_status(weak: &Weak<Inner>, session: &Session) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to request cpu.status on");
        return;
    };
    let reply = session.send(Envelope::new("cpu.status"));
    let weak = weak.clone();
    runtime.spawn(async move {
        let result = reply.await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match result {
            Ok(Some(reply)) => {
                let event = DebuggerEvent::from_envelope(&reply);
                inner.update(|state| state.apply(&event));
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "cpu.status failed");
                inner.update(|state| {
                    state.stepping = false;
                    state.paused = true;
                });
            }
        }
    });
}
