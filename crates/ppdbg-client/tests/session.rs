//! Session behavior driven through an in-memory connector.

use async_trait::async_trait;
use parking_lot::Mutex;
use ppdbg_client::{
    Candidate, ClientError, Connector, Envelope, ErrorLevel, Handlers, Listeners, Outbound,
    Result, Session, Subscription, TicketSource, Transport, TransportPeer, WILDCARD,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Hands out in-memory transports and records every attempt.
struct MockConnector {
    attempts: Arc<Mutex<Vec<String>>>,
    failing: HashSet<String>,
    peers: mpsc::UnboundedSender<TransportPeer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, uri: &str) -> Result<Transport> {
        self.attempts.lock().push(uri.to_string());
        if self.failing.contains(uri) {
            return Err(ClientError::connect(uri, "connection refused"));
        }
        let (transport, peer) = Transport::channel();
        let _ = self.peers.send(peer);
        Ok(transport)
    }
}

/// Yields every ticket twice in a row, so every other draw collides.
struct Stuttering(AtomicU64);

impl TicketSource for Stuttering {
    fn next_ticket(&self) -> String {
        format!("t{}", self.0.fetch_add(1, Ordering::SeqCst) / 2)
    }
}

struct Harness {
    session: Session,
    attempts: Arc<Mutex<Vec<String>>>,
    peers: mpsc::UnboundedReceiver<TransportPeer>,
}

impl Harness {
    fn new(failing: &[&str], candidates: Vec<Candidate>) -> Self {
        Self::with_builder(failing, candidates, |b| b)
    }

    fn with_builder(
        failing: &[&str],
        candidates: Vec<Candidate>,
        configure: impl FnOnce(ppdbg_client::SessionBuilder) -> ppdbg_client::SessionBuilder,
    ) -> Self {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let (tx, peers) = mpsc::unbounded_channel();
        let connector = MockConnector {
            attempts: Arc::clone(&attempts),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            peers: tx,
        };
        let builder = Session::builder()
            .connector(connector)
            .discovery(candidates);
        let session = configure(builder).build().unwrap();
        Self {
            session,
            attempts,
            peers,
        }
    }

    async fn connect(&mut self) -> TransportPeer {
        self.session.connect("ws://127.0.0.1:45000/debugger").await.unwrap();
        self.peers.recv().await.unwrap()
    }
}

async fn next_request(peer: &mut TransportPeer) -> Envelope {
    match tokio::time::timeout(WAIT, peer.sent.recv()).await.unwrap() {
        Some(Outbound::Text(text)) => Envelope::parse(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

fn reply_to(request: &Envelope, event: &str) -> Envelope {
    let mut reply = Envelope::new(event);
    reply.ticket = request.ticket.clone();
    reply
}

fn channel_handler<T: Send + 'static>(
    tx: mpsc::UnboundedSender<T>,
    map: impl Fn(&Envelope) -> T + Send + Sync + 'static,
) -> impl Fn(&Envelope) + Send + Sync + 'static {
    move |envelope| {
        let _ = tx.send(map(envelope));
    }
}

#[tokio::test]
async fn test_concurrent_tickets_distinct_under_collisions() {
    let mut harness = Harness::with_builder(&[], vec![], |b| {
        b.ticket_source(Stuttering(AtomicU64::new(0)))
    });
    let mut peer = harness.connect().await;

    let futures: Vec<_> = (0..10)
        .map(|i| harness.session.send(Envelope::new("cpu.getReg").with("register", i)))
        .collect();
    assert_eq!(harness.session.pending_count(), 10);

    let mut tickets = HashSet::new();
    for _ in 0..10 {
        let request = next_request(&mut peer).await;
        assert!(tickets.insert(request.ticket.clone().unwrap()));
        peer.push(reply_to(&request, "cpu.getReg").to_json().unwrap());
    }

    for future in futures {
        assert!(future.await.unwrap().is_some());
    }
    assert_eq!(harness.session.pending_count(), 0);
}

#[tokio::test]
async fn test_fire_and_forget_never_pends() {
    let mut harness = Harness::new(&[], vec![]);
    let mut peer = harness.connect().await;

    for i in 0..1000 {
        let event = if i % 2 == 0 { "cpu.stepping" } else { "cpu.resume" };
        let reply = harness.session.send(Envelope::new(event)).await.unwrap();
        assert!(reply.is_none());
        assert_eq!(harness.session.pending_count(), 0);
    }

    let first = next_request(&mut peer).await;
    assert_eq!(first.event, "cpu.stepping");
    assert!(first.ticket.is_none());
}

#[tokio::test]
async fn test_reply_resolves_only_its_request() {
    let mut harness = Harness::new(&[], vec![]);
    let mut peer = harness.connect().await;

    let first = harness.session.send(Envelope::new("memory.read"));
    let second = harness.session.send(Envelope::new("cpu.status"));
    let first_request = next_request(&mut peer).await;
    let second_request = next_request(&mut peer).await;

    let reply = reply_to(&first_request, "some.result").with("value", 42);
    peer.push(reply.to_json().unwrap());

    let resolved = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
    assert_eq!(resolved, Some(reply));
    assert_eq!(harness.session.pending_count(), 1);

    peer.push(reply_to(&second_request, "cpu.status").to_json().unwrap());
    assert!(tokio::time::timeout(WAIT, second).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_error_reply_rejects_without_broadcast() {
    let mut harness = Harness::new(&[], vec![]);
    let mut peer = harness.connect().await;

    let (tx, mut broadcast) = mpsc::unbounded_channel();
    let _sub = harness
        .session
        .listen("error", channel_handler(tx, |e| e.clone()));
    let reported = Arc::new(Mutex::new(Vec::new()));
    {
        let reported = Arc::clone(&reported);
        harness
            .session
            .set_on_error(move |message, level| reported.lock().push((message.to_string(), level)));
    }

    let pending = harness.session.send(Envelope::new("cpu.breakpoint.add"));
    let request = next_request(&mut peer).await;
    let mut reply = Envelope::error("bad", ErrorLevel::Error);
    reply.ticket = request.ticket.clone();
    peer.push(reply.to_json().unwrap());

    let err = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "bad");
    assert!(matches!(
        err,
        ClientError::Debugger {
            level: Some(ErrorLevel::Error),
            ..
        }
    ));
    assert!(broadcast.try_recv().is_err());
    assert_eq!(
        *reported.lock(),
        vec![("bad".to_string(), Some(ErrorLevel::Error))]
    );
}

#[tokio::test]
async fn test_disconnect_fails_all_pending() {
    let mut harness = Harness::new(&[], vec![]);
    let mut peer = harness.connect().await;

    let futures: Vec<_> = (0..3)
        .map(|_| harness.session.send(Envelope::new("cpu.status")))
        .collect();
    harness.session.disconnect().unwrap();

    for future in futures {
        let err = tokio::time::timeout(WAIT, future).await.unwrap().unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(err.to_string(), "Disconnected from PPSSPP");
    }

    let err = harness.session.send(Envelope::new("cpu.status")).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));

    // Three requests, then the close frame.
    for _ in 0..3 {
        next_request(&mut peer).await;
    }
    assert_eq!(peer.sent.recv().await, Some(Outbound::Close(1000)));

    let _peer = harness.connect().await;
    assert!(harness.session.is_connected());
}

#[tokio::test]
async fn test_double_connect_rejected() {
    let mut harness = Harness::new(&[], vec![Candidate::new("10.0.0.9", 1)]);
    let mut peer = harness.connect().await;

    let err = harness
        .session
        .connect("ws://10.0.0.2:45000/debugger")
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected));
    let err = harness.session.auto_connect().await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected));
    assert_eq!(harness.attempts.lock().len(), 1);

    let pending = harness.session.send(Envelope::new("game.status"));
    let request = next_request(&mut peer).await;
    peer.push(reply_to(&request, "game.status").to_json().unwrap());
    assert!(tokio::time::timeout(WAIT, pending).await.unwrap().is_ok());
    assert_eq!(
        harness.session.uri().as_deref(),
        Some("ws://127.0.0.1:45000/debugger")
    );
}

#[tokio::test]
async fn test_wildcard_then_specific() {
    let mut harness = Harness::new(&[], vec![]);
    let peer = harness.connect().await;

    let (tx, mut seen) = mpsc::unbounded_channel();
    let _specific = harness
        .session
        .listen("log", channel_handler(tx.clone(), |_| "specific"));
    let _wildcard = harness
        .session
        .listen(WILDCARD, channel_handler(tx, |_| "wildcard"));

    peer.push(r#"{"event":"log","message":"hi"}"#);
    peer.push(r#"{"event":"game.pause"}"#);

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(tokio::time::timeout(WAIT, seen.recv()).await.unwrap().unwrap());
    }
    assert_eq!(order, vec!["wildcard", "specific", "wildcard"]);
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_self_disposal_during_dispatch() {
    let mut harness = Harness::new(&[], vec![]);
    let peer = harness.connect().await;

    let (tx, mut seen) = mpsc::unbounded_channel();
    let slot: Arc<OnceLock<Subscription>> = Arc::new(OnceLock::new());
    let once = {
        let slot = Arc::clone(&slot);
        let tx = tx.clone();
        harness.session.listen("game.start", move |_| {
            let _ = tx.send("once");
            if let Some(sub) = slot.get() {
                sub.remove();
            }
        })
    };
    slot.set(once).unwrap();
    let _later = harness
        .session
        .listen("game.quit", channel_handler(tx, |_| "quit"));

    peer.push(r#"{"event":"game.start"}"#);
    peer.push(r#"{"event":"game.start"}"#);
    peer.push(r#"{"event":"game.quit"}"#);

    assert_eq!(tokio::time::timeout(WAIT, seen.recv()).await.unwrap(), Some("once"));
    assert_eq!(tokio::time::timeout(WAIT, seen.recv()).await.unwrap(), Some("quit"));
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_connection_pseudo_events() {
    let harness = Harness::new(&[], vec![]);
    let listeners = Listeners::new(harness.session.clone());
    listeners.connection().change(true);

    let connections = Arc::new(Mutex::new(0));
    let changes = Arc::new(Mutex::new(Vec::new()));
    let _subs = {
        let connections = Arc::clone(&connections);
        let changes = Arc::clone(&changes);
        listeners.listen(
            Handlers::new()
                .on_connection(move || *connections.lock() += 1)
                .on_connection_change(move |c| changes.lock().push(c)),
        )
    };
    assert_eq!(*connections.lock(), 1);

    listeners.connection().change(false);
    listeners.connection().change(true);
    assert_eq!(*connections.lock(), 2);
    assert_eq!(*changes.lock(), vec![false, true]);
}

#[tokio::test]
async fn test_auto_connect_falls_through_candidates() {
    let candidates = vec![
        Candidate::new("10.0.0.1", 1001),
        Candidate::new("10.0.0.2", 1002),
        Candidate::new("10.0.0.3", 1003),
    ];
    let mut harness = Harness::new(
        &["ws://10.0.0.1:1001/debugger", "ws://10.0.0.2:1002/debugger"],
        candidates,
    );

    harness.session.auto_connect().await.unwrap();
    assert!(harness.peers.recv().await.is_some());
    assert_eq!(
        *harness.attempts.lock(),
        vec![
            "ws://10.0.0.1:1001/debugger",
            "ws://10.0.0.2:1002/debugger",
            "ws://10.0.0.3:1003/debugger",
        ]
    );
    assert_eq!(
        harness.session.uri().as_deref(),
        Some("ws://10.0.0.3:1003/debugger")
    );
}

#[tokio::test]
async fn test_auto_connect_reports_last_failure() {
    let candidates = vec![
        Candidate::new("10.0.0.1", 1001),
        Candidate::new("10.0.0.2", 1002),
    ];
    let harness = Harness::new(
        &["ws://10.0.0.1:1001/debugger", "ws://10.0.0.2:1002/debugger"],
        candidates,
    );

    let err = harness.session.auto_connect().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Couldn't connect to ws://10.0.0.2:1002/debugger: connection refused"
    );
    assert!(!harness.session.is_connected());

    // The failed attempt must not leave the session stuck in "opening".
    let err = harness.session.auto_connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }));
}

#[tokio::test]
async fn test_transport_close_fails_pending_and_fires_once() {
    let mut harness = Harness::new(&[], vec![]);
    let peer = harness.connect().await;

    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    let session = harness.session.clone();
    harness.session.set_on_close(move || {
        // Reentrant disconnect is a harmless "not connected".
        let reentrant = session.disconnect();
        let _ = closed_tx.send((session.is_connected(), reentrant.is_err()));
    });

    let pending = harness.session.send(Envelope::new("cpu.status"));
    peer.close(1006, "");

    let err = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "PPSSPP disconnected");
    assert_eq!(
        tokio::time::timeout(WAIT, closed.recv()).await.unwrap(),
        Some((false, true))
    );
    assert!(closed.try_recv().is_err());
    assert!(!harness.session.is_connected());
    harness.session.clear_callbacks();
}

#[tokio::test]
async fn test_user_disconnect_fires_close_callback() {
    let mut harness = Harness::new(&[], vec![]);
    let _peer = harness.connect().await;

    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    harness.session.set_on_close(move || {
        let _ = closed_tx.send(());
    });

    harness.session.disconnect().unwrap();
    assert_eq!(tokio::time::timeout(WAIT, closed.recv()).await.unwrap(), Some(()));
    assert!(matches!(
        harness.session.disconnect(),
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_protocol_errors_reach_error_callback() {
    let mut harness = Harness::new(&[], vec![]);
    let peer = harness.connect().await;

    let (tx, mut reported) = mpsc::unbounded_channel();
    harness.session.set_on_error(move |message, level| {
        let _ = tx.send((message.to_string(), level));
    });

    peer.push("this is not json");
    peer.push(r#"{"event":"cpu.status","ticket":"nobody"}"#);
    peer.push(r#"{"event":"error","message":"Bad breakpoint","level":3}"#);

    let (message, level) = tokio::time::timeout(WAIT, reported.recv()).await.unwrap().unwrap();
    assert!(message.starts_with("Failed to parse message from PPSSPP: "));
    assert_eq!(level, Some(ErrorLevel::Error));

    let (message, level) = tokio::time::timeout(WAIT, reported.recv()).await.unwrap().unwrap();
    assert!(message.starts_with("Received mismatched ticket: "));
    assert!(message.contains("nobody"));
    assert_eq!(level, Some(ErrorLevel::Error));

    let (message, level) = tokio::time::timeout(WAIT, reported.recv()).await.unwrap().unwrap();
    assert_eq!(message, "Bad breakpoint");
    assert_eq!(level, Some(ErrorLevel::Warn));

    // The session survives all of it.
    assert!(harness.session.is_connected());
}

/// Takes `delay` to open each transport.
struct SlowConnector {
    delay: Duration,
    attempts: Arc<Mutex<Vec<String>>>,
    peers: mpsc::UnboundedSender<TransportPeer>,
}

#[async_trait]
impl Connector for SlowConnector {
    async fn open(&self, uri: &str) -> Result<Transport> {
        self.attempts.lock().push(uri.to_string());
        tokio::time::sleep(self.delay).await;
        let (transport, peer) = Transport::channel();
        let _ = self.peers.send(peer);
        Ok(transport)
    }
}

#[tokio::test]
async fn test_connect_while_opening_rejected() {
    const URI: &str = "ws://127.0.0.1:45000/debugger";

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut peers) = mpsc::unbounded_channel();
    let session = Session::builder()
        .connector(SlowConnector {
            delay: Duration::from_millis(200),
            attempts: Arc::clone(&attempts),
            peers: tx,
        })
        .discovery(vec![Candidate::new("10.0.0.9", 1)])
        .build()
        .unwrap();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(URI).await })
    };
    tokio::time::timeout(WAIT, async {
        while attempts.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!session.is_connected());
    let err = session.connect("ws://10.0.0.2:45000/debugger").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected));
    assert_eq!(err.to_string(), "Already connected, disconnect first");
    let err = session.auto_connect().await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyConnected));

    first.await.unwrap().unwrap();
    assert!(session.is_connected());
    assert_eq!(attempts.lock().len(), 1);
    let _first_peer = peers.recv().await.unwrap();
    session.disconnect().unwrap();

    // Abandoning a connect mid-open leaves the session free to connect again.
    let abandoned = tokio::time::timeout(Duration::from_millis(50), session.connect(URI)).await;
    assert!(abandoned.is_err());
    assert!(!session.is_connected());

    session.connect(URI).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(attempts.lock().len(), 3);
}

#[tokio::test]
async fn test_dropping_last_handle_closes_connection() {
    let mut harness = Harness::new(&[], vec![]);
    let mut peer = harness.connect().await;

    let weak = harness.session.downgrade();
    assert!(weak.upgrade().is_some());
    drop(harness.session);

    assert!(weak.upgrade().is_none());
    assert_eq!(
        tokio::time::timeout(WAIT, peer.sent.recv()).await.unwrap(),
        Some(Outbound::Close(1000))
    );
    assert_eq!(
        tokio::time::timeout(WAIT, peer.sent.recv()).await.unwrap(),
        None
    );
    tokio::time::timeout(WAIT, async {
        while peer.push(r#"{"event":"log"}"#) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stale_close_leaves_new_connection_alone() {
    let mut harness = Harness::new(&[], vec![]);
    let first = harness.connect().await;

    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    let weak = harness.session.downgrade();
    harness.session.set_on_close(move || {
        let connected = weak.upgrade().is_some_and(|session| session.is_connected());
        let _ = closed_tx.send(connected);
    });

    harness.session.disconnect().unwrap();
    let mut second = harness.connect().await;
    let pending = harness.session.send(Envelope::new("cpu.status"));
    first.close(1000, "");

    // Whether the old reader finished before or after the reconnect, the
    // new connection keeps its pending request.
    tokio::time::timeout(WAIT, closed.recv()).await.unwrap().unwrap();
    let request = next_request(&mut second).await;
    second.push(reply_to(&request, "cpu.status").to_json().unwrap());
    assert!(tokio::time::timeout(WAIT, pending).await.unwrap().is_ok());
    assert!(harness.session.is_connected());
}
