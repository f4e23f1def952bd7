//! Command implementations.

use crate::settings::Settings;
use anyhow::{bail, Context, Result};
use ppdbg_client::{ConnectionState, Envelope, Listeners, Session, WeakSession, WILDCARD};
use ppdbg_state::{BreakpointPersister, BreakpointStore, GameStatus, LogBuffer};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const CLIENT_NAME: &str = "ppdbg";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A connected session with its state caches.
pub struct Debugger {
    listeners: Listeners,
    log: LogBuffer,
    status: GameStatus,
    breakpoints: BreakpointPersister,
    closed: Arc<Notify>,
}

impl Debugger {
    /// Connect using `settings` and announce this client to PPSSPP.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let session = Session::builder()
            .discovery_url(&settings.discovery_url)
            .build()
            .context("failed to create debugger session")?;
        let listeners = Listeners::new(session.clone());

        let log = LogBuffer::attach(&listeners);
        let status = GameStatus::attach(&listeners);
        let breakpoints = BreakpointPersister::attach(
            &listeners,
            BreakpointStore::new(&settings.breakpoint_dir),
        );
        breakpoints.set_enabled(settings.persist_breakpoints);

        let closed = Arc::new(Notify::new());
        {
            let weak = session.downgrade();
            let connection = Arc::clone(listeners.connection());
            let closed = Arc::clone(&closed);
            session.set_on_close(move || connection_lost(&weak, &connection, &closed));
        }

        let connected = match &settings.uri {
            Some(uri) => session.connect(uri).await,
            None => session.auto_connect().await,
        };
        if let Err(e) = connected {
            listeners.connection().change(false);
            session.clear_callbacks();
            return Err(e).context("Debugger could not connect");
        }
        info!(uri = ?session.uri(), "Debugger connected");
        listeners.connection().change(true);

        let announce = Envelope::new("version")
            .with("name", CLIENT_NAME)
            .with("version", CLIENT_VERSION);
        if let Err(e) = session.send(announce).await {
            warn!(error = %e, "PPSSPP seems to think this debugger is out of date");
        }

        Ok(Self {
            listeners,
            log,
            status,
            breakpoints,
            closed,
        })
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        self.listeners.session()
    }

    /// Wait until PPSSPP closes the connection.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    /// Disconnect and detach every cache.
    pub fn close(self) {
        if self.session().is_connected() {
            let _ = self.session().disconnect();
        }
        self.breakpoints.shutdown();
        self.status.shutdown();
        self.log.shutdown();
        self.session().clear_callbacks();
    }
}

/// Mark the connection down, unless a newer one already replaced it.
fn connection_lost(session: &WeakSession, connection: &ConnectionState, closed: &Notify) {
    if session.upgrade().is_some_and(|session| session.is_connected()) {
        debug!("Ignoring close of a replaced connection");
        return;
    }
    info!("Debugger disconnected");
    connection.change(false);
    closed.notify_one();
}

/// Parse the optional JSON object given on the command line.
pub fn parse_fields(fields: Option<&str>) -> Result<Value> {
    let Some(fields) = fields else {
        return Ok(Value::Object(serde_json::Map::new()));
    };
    let value: Value = serde_json::from_str(fields).context("fields are not valid JSON")?;
    if !value.is_object() {
        bail!("fields must be a JSON object");
    }
    Ok(value)
}

/// Send one request and print the reply.
pub async fn send(settings: &Settings, event: &str, fields: Option<&str>) -> Result<()> {
    let fields = parse_fields(fields)?;
    let debugger = Debugger::connect(settings).await?;

    let reply = debugger
        .session()
        .send(Envelope::with_fields(event, fields))
        .await;
    debugger.close();

    match reply.with_context(|| format!("{event} failed"))? {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
        None => println!("{event} sent"),
    }
    Ok(())
}

/// Print unsolicited events until interrupted or disconnected.
pub async fn watch(settings: &Settings, events: &[String]) -> Result<()> {
    let debugger = Debugger::connect(settings).await?;

    let print = |envelope: &Envelope| match envelope.to_json() {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Unprintable event"),
    };
    let subscriptions = if events.is_empty() {
        vec![debugger.session().listen(WILDCARD, print)]
    } else {
        events
            .iter()
            .map(|event| debugger.session().listen(event.as_str(), print))
            .collect()
    };

    // Error-path messages land in the log buffer without a channel.
    let last_seen = AtomicU64::new(0);
    let errors = debugger.log.listen(move |items| {
        for item in items {
            let seen = last_seen.load(Ordering::Relaxed);
            if item.id > seen {
                last_seen.store(item.id, Ordering::Relaxed);
                if item.channel.is_none() && item.timestamp.is_none() {
                    eprint!("{}", item.message);
                }
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
        () = debugger.closed() => {}
    }

    errors.remove();
    ppdbg_client::forget(subscriptions);
    debugger.close();
    Ok(())
}

/// Print the emulator status.
pub async fn status(settings: &Settings) -> Result<()> {
    let debugger = Debugger::connect(settings).await?;
    let state = debugger.status.refresh(debugger.session()).await;
    debugger.close();

    let state = state.context("failed to query status")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ppdbg_client::{Candidate, Connector, Transport, TransportPeer};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_fields() {
        assert_eq!(parse_fields(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_fields(Some(r#"{"address": 8, "enabled": true}"#)).unwrap(),
            serde_json::json!({"address": 8, "enabled": true})
        );
        assert!(parse_fields(Some("[1, 2]")).is_err());
        assert!(parse_fields(Some("{")).is_err());
    }

    struct ChannelConnector(mpsc::UnboundedSender<TransportPeer>);

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn open(&self, _uri: &str) -> ppdbg_client::Result<Transport> {
            let (transport, peer) = Transport::channel();
            let _ = self.0.send(peer);
            Ok(transport)
        }
    }

    #[tokio::test]
    async fn test_connection_lost_skips_replaced_connection() {
        let (tx, _peers) = mpsc::unbounded_channel();
        let session = Session::builder()
            .connector(ChannelConnector(tx))
            .discovery(Vec::<Candidate>::new())
            .build()
            .unwrap();
        let weak = session.downgrade();
        let connection = ConnectionState::new();
        let closed = Notify::new();

        session.connect("ws://127.0.0.1:45000/debugger").await.unwrap();
        connection.change(true);
        connection_lost(&weak, &connection, &closed);
        assert!(connection.is_connected());
        assert!(tokio::time::timeout(Duration::from_millis(20), closed.notified())
            .await
            .is_err());

        session.disconnect().unwrap();
        connection_lost(&weak, &connection, &closed);
        assert!(!connection.is_connected());
        tokio::time::timeout(Duration::from_secs(5), closed.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let settings = Settings {
            uri: Some("ws://127.0.0.1:1/debugger".to_string()),
            ..Settings::default()
        };
        let err = Debugger::connect(&settings).await.err().unwrap();
        assert_eq!(err.to_string(), "Debugger could not connect");
        assert!(format!("{err:#}").contains("Couldn't connect to ws://127.0.0.1:1/debugger"));
    }
}
