//! # ppdbg Client
//!
//! Session client for the PPSSPP remote debugger protocol.
//!
//! PPSSPP exposes its debugger as a WebSocket speaking the
//! `debugger.ppsspp.org` sub-protocol. Every message is a JSON object naming
//! an `event`. Requests that expect an answer carry a `ticket`, and the
//! answer echoes it back. Everything else the emulator sends (log lines,
//! breakpoint hits, game state) arrives as unsolicited events.
//!
//! ## Features
//!
//! - **Session**: one connection at a time, opened by URI or found through
//!   LAN discovery
//! - **Multiplexing**: concurrent requests correlated by ticket, failed
//!   together when the connection goes away
//! - **Listeners**: per-event and wildcard handlers with removable
//!   subscriptions
//! - **Connection state**: `connection` / `connection.change` pseudo-events
//!   for state caches
//!
//! ## Example
//!
//! ```rust,no_run
//! use ppdbg_client::{Envelope, Session};
//!
//! # async fn run() -> ppdbg_client::Result<()> {
//! let session = Session::new()?;
//! session.auto_connect().await?;
//!
//! let _log = session.listen("log", |event| {
//!     print!("{}", event.message().unwrap_or_default());
//! });
//!
//! let reply = session
//!     .send(Envelope::new("cpu.getReg").with("name", "pc"))
//!     .await?;
//! println!("{reply:?}");
//!
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Message Routing
//!
//! ```text
//! inbound frame
//!   ├─ unparseable ───────────────> error callback
//!   ├─ event == "error" ──────────> error callback, then below
//!   ├─ has ticket ────────────────> pending request (or error callback
//!   │                               if nothing is waiting on it)
//!   └─ no ticket ─────────────────> "*" handlers, then named handlers
//! ```

pub mod connection;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod event;
pub mod listener;
pub mod multiplex;
pub mod session;
pub mod ticket;
pub mod transport;

// Re-export main types
pub use connection::{ConnectionState, Handlers, Listeners, CONNECTION, CONNECTION_CHANGE};
pub use discovery::{Candidate, CandidateSource, HttpDiscovery, DEBUGGER_PATH, DISCOVERY_URL};
pub use envelope::{Envelope, ErrorLevel, ERROR_EVENT};
pub use error::{ClientError, Result};
pub use event::{DebuggerEvent, GameInfo, RegisterCategory};
pub use listener::{forget, Handler, ListenerRegistry, Subscription, WILDCARD};
pub use multiplex::{is_fire_and_forget, NO_RESPONSE_EVENTS};
pub use session::{
    Session, SessionBuilder, WeakSession, REMOTE_DISCONNECT_MESSAGE, USER_DISCONNECT_MESSAGE,
};
pub use ticket::{RandomTickets, TicketGenerator, TicketSource};
pub use transport::{
    Connector, Inbound, Outbound, Transport, TransportPeer, WsConnector, SUB_PROTOCOL,
};
