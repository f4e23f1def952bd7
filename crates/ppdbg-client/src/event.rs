//! Typed views of the events the client cares about.
//!
//! The debugger defines many more events than these; anything not listed
//! decodes to [`DebuggerEvent::Other`] with the raw envelope.

use crate::envelope::{Envelope, ErrorLevel};
use serde::Deserialize;
use serde_json::Value;

/// Game identification attached to `game.*` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GameInfo {
    /// Disc or homebrew id, e.g. `ULUS10336`.
    #[serde(default)]
    pub id: Option<String>,
    /// Disc version.
    #[serde(default)]
    pub version: Option<String>,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
}

/// One register category from `cpu.getAllRegs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegisterCategory {
    /// Category id; 0 is the GPR category.
    #[serde(default)]
    pub id: u32,
    /// Category name.
    #[serde(default)]
    pub name: String,
    /// Register values as unsigned integers.
    #[serde(default, rename = "uintValues")]
    pub uint_values: Vec<u32>,
}

/// Register category holding the general purpose registers and `pc`.
pub const GPR_CATEGORY: u32 = 0;

/// Index of `pc` within [`GPR_CATEGORY`].
pub const PC_REGISTER: u32 = 32;

/// A decoded debugger event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event")]
pub enum DebuggerEvent {
    /// Emulator log output.
    #[serde(rename = "log")]
    Log {
        /// Log text, usually with a trailing newline.
        #[serde(default)]
        message: String,
        /// Severity.
        #[serde(default)]
        level: Option<ErrorLevel>,
        /// Log channel, e.g. `SCEKERNEL`.
        #[serde(default)]
        channel: Option<String>,
    },
    /// Error push or reply.
    #[serde(rename = "error")]
    Error {
        /// Error text.
        #[serde(default)]
        message: String,
        /// Severity.
        #[serde(default)]
        level: Option<ErrorLevel>,
    },
    /// Reply to `cpu.status`.
    #[serde(rename = "cpu.status")]
    CpuStatus {
        /// Whether the CPU is in break mode.
        #[serde(default)]
        stepping: bool,
        /// Whether emulation is paused.
        #[serde(default)]
        paused: bool,
        /// Current program counter.
        #[serde(default)]
        pc: u32,
    },
    /// The CPU entered break mode.
    #[serde(rename = "cpu.stepping")]
    CpuStepping {
        /// Program counter at the break.
        #[serde(default)]
        pc: u32,
    },
    /// The CPU left break mode.
    #[serde(rename = "cpu.resume")]
    CpuResume,
    /// A register was written.
    #[serde(rename = "cpu.setReg")]
    CpuSetReg {
        /// Register category.
        category: u32,
        /// Register index.
        register: u32,
        /// New value.
        #[serde(rename = "uintValue")]
        uint_value: u32,
    },
    /// Every register, by category.
    #[serde(rename = "cpu.getAllRegs")]
    CpuGetAllRegs {
        /// Categories in id order.
        #[serde(default)]
        categories: Vec<RegisterCategory>,
    },
    /// A game started.
    #[serde(rename = "game.start")]
    GameStart {
        /// The game, if known.
        #[serde(default)]
        game: Option<GameInfo>,
    },
    /// Reply or push describing the running game.
    #[serde(rename = "game.status")]
    GameStatus {
        /// The game, if any is running.
        #[serde(default)]
        game: Option<GameInfo>,
    },
    /// The game stopped.
    #[serde(rename = "game.quit")]
    GameQuit,
    /// Emulation paused.
    #[serde(rename = "game.pause")]
    GamePause,
    /// Emulation resumed.
    #[serde(rename = "game.resume")]
    GameResume,
    /// Any other event.
    #[serde(skip)]
    Other(Envelope),
}

impl DebuggerEvent {
    /// Decode `envelope`, falling back to [`DebuggerEvent::Other`] for
    /// unknown or malformed events.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let Ok(value) = serde_json::to_value(envelope) else {
            return Self::Other(envelope.clone());
        };
        serde_json::from_value(value).unwrap_or_else(|_| Self::Other(envelope.clone()))
    }

    /// The `pc` this event reports, if it reports one.
    pub fn pc(&self) -> Option<u32> {
        match self {
            Self::CpuStatus { pc, .. } | Self::CpuStepping { pc } => Some(*pc),
            Self::CpuSetReg {
                category,
                register,
                uint_value,
            } if *category == GPR_CATEGORY && *register == PC_REGISTER => Some(*uint_value),
            Self::CpuGetAllRegs { categories } => categories
                .first()
                .and_then(|gpr| gpr.uint_values.get(PC_REGISTER as usize))
                .copied(),
            _ => None,
        }
    }

    /// The game id carried by `game.start` or `game.status`.
    pub fn game_id(&self) -> Option<&str> {
        match self {
            Self::GameStart { game } | Self::GameStatus { game } => {
                game.as_ref().and_then(|g| g.id.as_deref())
            }
            _ => None,
        }
    }
}

/// Breakpoints listed by `cpu.breakpoint.list` or `memory.breakpoint.list`.
pub fn breakpoint_list(envelope: &Envelope) -> Option<&Vec<Value>> {
    envelope.get("breakpoints").and_then(Value::as_array)
}
