//! Debugger session: one logical connection to a PPSSPP instance.
//!
//! A [`Session`] owns at most one live transport. Each connection gets a
//! reader task that handles inbound frames strictly in order: error frames
//! go to the error callback, ticketed replies complete pending requests, and
//! everything else is dispatched to the listener registry. When the
//! transport closes, for any reason, the close callback runs once and every
//! request still waiting is failed.

use crate::discovery::{CandidateSource, HttpDiscovery, DISCOVERY_URL};
use crate::envelope::{Envelope, ErrorLevel};
use crate::error::{ClientError, Result};
use crate::listener::{Handler, ListenerRegistry, Subscription};
use crate::multiplex::{is_fire_and_forget, FailedRequests, PendingRequests, ReplyReceiver};
use crate::ticket::{TicketGenerator, TicketSource};
use crate::transport::{
    Connector, Inbound, Outbound, Transport, WsConnector, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message pending requests fail with after [`Session::disconnect`].
pub const USER_DISCONNECT_MESSAGE: &str = "Disconnected from PPSSPP";

/// Message pending requests fail with when the transport closes.
pub const REMOTE_DISCONNECT_MESSAGE: &str = "PPSSPP disconnected";

/// Receives protocol errors and `error` pushes.
pub type ErrorCallback = Arc<dyn Fn(&str, Option<ErrorLevel>) + Send + Sync>;

/// Runs when the transport closes.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

struct Connection {
    generation: u64,
    uri: String,
    outgoing: mpsc::UnboundedSender<Outbound>,
    shutdown: CancellationToken,
}

enum Link {
    Idle,
    Opening,
    Open(Connection),
}

struct State {
    link: Link,
    pending: PendingRequests,
    next_generation: u64,
}

struct Inner {
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn CandidateSource>,
    state: Mutex<State>,
    listeners: ListenerRegistry<Envelope>,
    tickets: TicketGenerator,
    on_error: RwLock<Option<ErrorCallback>>,
    on_close: RwLock<Option<CloseCallback>>,
}

/// A connection to the PPSSPP debugger.
///
/// Cheap to clone; clones share the same connection, pending requests and
/// listeners.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// A [`Session`] handle that does not keep the connection alive.
///
/// Callbacks stored on the session should hold one of these instead of a
/// clone. Once every [`Session`] is dropped the connection is closed.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<Inner>,
}

impl WeakSession {
    /// The session, if any handle to it is still alive.
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakSession")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// Configures a [`Session`].
pub struct SessionBuilder {
    connector: Option<Arc<dyn Connector>>,
    discovery: Option<Arc<dyn CandidateSource>>,
    discovery_url: String,
    tickets: Option<TicketGenerator>,
}

impl SessionBuilder {
    fn new() -> Self {
        Self {
            connector: None,
            discovery: None,
            discovery_url: DISCOVERY_URL.to_string(),
            tickets: None,
        }
    }

    /// Open transports with `connector` instead of [`WsConnector`].
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Query `source` for candidates instead of the HTTP match service.
    pub fn discovery(mut self, source: impl CandidateSource + 'static) -> Self {
        self.discovery = Some(Arc::new(source));
        self
    }

    /// Query a different match service URL.
    pub fn discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = url.into();
        self
    }

    /// Draw tickets from `source`.
    pub fn ticket_source(mut self, source: impl TicketSource + 'static) -> Self {
        self.tickets = Some(TicketGenerator::with_source(source));
        self
    }

    /// Build the session.
    pub fn build(self) -> Result<Session> {
        let discovery: Arc<dyn CandidateSource> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(HttpDiscovery::new(self.discovery_url)?),
        };
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));

        Ok(Session {
            inner: Arc::new(Inner {
                connector,
                discovery,
                state: Mutex::new(State {
                    link: Link::Idle,
                    pending: PendingRequests::default(),
                    next_generation: 0,
                }),
                listeners: ListenerRegistry::new(),
                tickets: self.tickets.unwrap_or_default(),
                on_error: RwLock::new(None),
                on_close: RwLock::new(None),
            }),
        })
    }
}

impl Session {
    /// Create a session using WebSockets and the default match service.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Start configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Connect to a debugger at `uri`, e.g. `ws://192.168.1.20:45023/debugger`.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        let _opening = self.inner.begin_opening()?;
        self.open(uri).await
    }

    /// Discover debuggers on the local network and connect to the first one
    /// that accepts.
    pub async fn auto_connect(&self) -> Result<()> {
        let _opening = self.inner.begin_opening()?;

        let candidates = match self.inner.discovery.candidates().await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                warn!("Discovery returned no debuggers");
                return Err(ClientError::discovery("empty listing"));
            }
            Err(e) => {
                warn!(error = %e, "Discovery failed");
                return Err(ClientError::discovery(e.to_string()));
            }
        };

        let mut last_error = None;
        for candidate in candidates {
            let uri = candidate.uri();
            match self.open(&uri).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(uri = %uri, error = %e, "Candidate failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::discovery("empty listing")))
    }

    async fn open(&self, uri: &str) -> Result<()> {
        let transport = self.inner.connector.open(uri).await?;
        self.inner.install(uri, transport);
        info!(uri = %uri, "Connected to PPSSPP");
        Ok(())
    }

    /// Close the connection.
    ///
    /// Pending requests fail with [`USER_DISCONNECT_MESSAGE`]. The close
    /// callback still runs once the reader task observes the shutdown.
    pub fn disconnect(&self) -> Result<()> {
        let (connection, failed) = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut state.link, Link::Idle) {
                Link::Open(connection) => (connection, state.pending.drain()),
                other => {
                    state.link = other;
                    return Err(ClientError::NotConnected);
                }
            }
        };

        let failed = failed.fail(USER_DISCONNECT_MESSAGE);
        let _ = connection.outgoing.send(Outbound::Close(NORMAL_CLOSURE));
        connection.shutdown.cancel();
        info!(uri = %connection.uri, failed, "Disconnected from PPSSPP");
        Ok(())
    }

    /// Send a request.
    ///
    /// The envelope is ticketed and written before this returns; the future
    /// only waits for the reply. Fire-and-forget events resolve to `None`
    /// without waiting. An `error` reply fails with
    /// [`ClientError::Debugger`].
    pub fn send(
        &self,
        envelope: Envelope,
    ) -> impl Future<Output = Result<Option<Envelope>>> + Send + 'static {
        let submitted = self.inner.submit(envelope);
        async move {
            match submitted? {
                None => Ok(None),
                Some(reply) => match reply.await {
                    Ok(outcome) => outcome.map(Some),
                    Err(_) => Err(ClientError::Disconnected {
                        message: REMOTE_DISCONNECT_MESSAGE.to_string(),
                    }),
                },
            }
        }
    }

    /// Register a handler for unsolicited events named `name`, or for every
    /// event with [`WILDCARD`](crate::WILDCARD).
    pub fn listen(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.listen(name, handler)
    }

    /// Register several handlers at once.
    pub fn listen_all<N, I>(&self, handlers: I) -> Vec<Subscription>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Handler<Envelope>)>,
    {
        self.inner.listeners.listen_all(handlers)
    }

    /// The listener registry events are dispatched to.
    pub fn listeners(&self) -> &ListenerRegistry<Envelope> {
        &self.inner.listeners
    }

    /// Route protocol errors and `error` pushes to `callback` instead of the
    /// log.
    pub fn set_on_error(&self, callback: impl Fn(&str, Option<ErrorLevel>) + Send + Sync + 'static) {
        *self.inner.on_error.write() = Some(Arc::new(callback));
    }

    /// Run `callback` whenever the transport closes.
    pub fn set_on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_close.write() = Some(Arc::new(callback));
    }

    /// Remove both callbacks.
    pub fn clear_callbacks(&self) {
        *self.inner.on_error.write() = None;
        *self.inner.on_close.write() = None;
    }

    /// Whether a connection is open.
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.state.lock().link, Link::Open(_))
    }

    /// URI of the open connection.
    pub fn uri(&self) -> Option<String> {
        match &self.inner.state.lock().link {
            Link::Open(connection) => Some(connection.uri.clone()),
            _ => None,
        }
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// A handle that does not keep this session alive.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("uri", &self.uri())
            .field("pending", &self.pending_count())
            .field("listeners", &self.inner.listeners)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("discovery_url", &self.discovery_url)
            .finish_non_exhaustive()
    }
}

/// Resets the link to idle if the connect attempt did not install one.
struct OpeningGuard<'a> {
    inner: &'a Inner,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if matches!(state.link, Link::Opening) {
            state.link = Link::Idle;
        }
    }
}

/// Runs close handling when the reader task ends, including by panic.
struct ReaderGuard {
    inner: Weak<Inner>,
    generation: u64,
    closed: Option<(u16, String)>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let (code, reason) = self
            .closed
            .take()
            .unwrap_or((ABNORMAL_CLOSURE, String::new()));
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_close(self.generation, code, &reason);
        }
    }
}

impl Inner {
    fn begin_opening(&self) -> Result<OpeningGuard<'_>> {
        let mut state = self.state.lock();
        if !matches!(state.link, Link::Idle) {
            return Err(ClientError::AlreadyConnected);
        }
        state.link = Link::Opening;
        Ok(OpeningGuard { inner: self })
    }

    fn install(self: &Arc<Self>, uri: &str, transport: Transport) {
        let Transport { outgoing, incoming } = transport;
        let shutdown = CancellationToken::new();

        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.link = Link::Open(Connection {
                generation,
                uri: uri.to_string(),
                outgoing,
                shutdown: shutdown.clone(),
            });
            generation
        };

        tokio::spawn(read_loop(Arc::downgrade(self), generation, incoming, shutdown));
    }

    fn submit(&self, mut envelope: Envelope) -> Result<Option<ReplyReceiver>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let outgoing = match &state.link {
            Link::Open(connection) => connection.outgoing.clone(),
            _ => return Err(ClientError::NotConnected),
        };

        if is_fire_and_forget(&envelope.event) {
            envelope.ticket = None;
            let text = envelope.to_json()?;
            debug!(event = %envelope.event, "Sending event");
            outgoing
                .send(Outbound::Text(text))
                .map_err(|_| ClientError::NotConnected)?;
            return Ok(None);
        }

        let pending = &state.pending;
        let ticket = self.tickets.generate(|t| pending.contains(t))?;
        envelope.ticket = Some(ticket.clone());
        let text = envelope.to_json()?;

        debug!(event = %envelope.event, ticket = %ticket, "Sending request");
        outgoing
            .send(Outbound::Text(text))
            .map_err(|_| ClientError::NotConnected)?;
        Ok(Some(state.pending.register(ticket)))
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(
                    &format!("Failed to parse message from PPSSPP: {e}"),
                    Some(ErrorLevel::Error),
                );
                return;
            }
        };

        if envelope.is_error() {
            self.report(envelope.message().unwrap_or_default(), envelope.level());
        }

        match envelope.ticket.clone() {
            Some(ticket) => {
                let unmatched = self.state.lock().pending.resolve(&ticket, envelope);
                if let Err(envelope) = unmatched {
                    let json = envelope.to_json().unwrap_or_default();
                    self.report(
                        &format!("Received mismatched ticket: {json}"),
                        Some(ErrorLevel::Error),
                    );
                }
            }
            None => {
                self.listeners.dispatch_event(&envelope);
            }
        }
    }

    fn report(&self, message: &str, level: Option<ErrorLevel>) {
        let callback = self.on_error.read().clone();
        match (callback, level) {
            (Some(callback), _) => callback(message, level),
            (None, None | Some(ErrorLevel::Error)) => error!("{message}"),
            (None, Some(level)) => info!(%level, "{message}"),
        }
    }

    fn handle_close(&self, generation: u64, code: u16, reason: &str) {
        let failed = {
            let mut state = self.state.lock();
            if matches!(&state.link, Link::Open(c) if c.generation == generation) {
                state.link = Link::Idle;
            }
            // A newer connection may already be open; its requests stay.
            if matches!(state.link, Link::Idle) {
                state.pending.drain()
            } else {
                FailedRequests::default()
            }
        };

        info!(generation, code, reason = %reason, "PPSSPP disconnected");

        let callback = self.on_close.read().clone();
        if let Some(callback) = callback {
            callback();
        }
        failed.fail(REMOTE_DISCONNECT_MESSAGE);
    }
}

impl Drop for Inner {
    // Last handle gone: close the socket and stop the reader.
    fn drop(&mut self) {
        if let Link::Open(connection) = &self.state.get_mut().link {
            let _ = connection.outgoing.send(Outbound::Close(NORMAL_CLOSURE));
            connection.shutdown.cancel();
            debug!(uri = %connection.uri, "Session dropped while connected");
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<Inbound>,
    shutdown: CancellationToken,
) {
    let mut guard = ReaderGuard {
        inner,
        generation,
        closed: None,
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                guard.closed = Some((NORMAL_CLOSURE, String::new()));
                break;
            }
            frame = incoming.recv() => match frame {
                Some(Inbound::Text(text)) => match guard.inner.upgrade() {
                    Some(inner) => inner.handle_frame(&text),
                    None => break,
                },
                Some(Inbound::Closed { code, reason }) => {
                    guard.closed = Some((code, reason));
                    break;
                }
                None => break,
            },
        }
    }
}
