//! # ppdbg State
//!
//! Caches fed by a PPSSPP debugger session.
//!
//! - [`GameStatus`]: which game is loaded and whether it is running, paused
//!   or stepping
//! - [`LogBuffer`]: the last [`MAX_LOG_ITEMS`] lines of emulator log output
//!   and session errors
//! - [`BreakpointPersister`]: saves breakpoints per game and restores them
//!   when the game is loaded again
//!
//! Each subscribes through a [`Listeners`](ppdbg_client::Listeners) and
//! unsubscribes on `shutdown()`.

pub mod breakpoints;
pub mod error;
pub mod game;
pub mod log;

pub use breakpoints::{
    clean_for_persist, BreakpointKind, BreakpointPersister, BreakpointStore, UPDATE_DEBOUNCE,
};
pub use error::{Result, StateError};
pub use game::{GameState, GameStatus, GAME_EVENTS};
pub use log::{LogBuffer, LogItem, MAX_LOG_ITEMS};
