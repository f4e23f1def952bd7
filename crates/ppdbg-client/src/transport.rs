//! Duplex frame transport.
//!
//! A [`Session`](crate::Session) never touches a socket directly. It asks a
//! [`Connector`] to open a [`Transport`], which is just a pair of channels:
//! text frames and close requests go out, text frames and the final close
//! notification come in. [`WsConnector`] backs that with a WebSocket;
//! [`Transport::channel`] gives an in-memory pair for tests and embedding.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// WebSocket sub-protocol the debugger speaks.
pub const SUB_PROTOCOL: &str = "debugger.ppsspp.org";

/// Close code for a normal, client-initiated shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the stream ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized envelope.
    Text(String),
    /// Close the connection with the given code.
    Close(u16),
}

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame, expected to hold one envelope.
    Text(String),
    /// The connection is gone. Always the last item.
    Closed {
        /// Close code (1000 normal, 1006 abnormal).
        code: u16,
        /// Close reason or transport error.
        reason: String,
    },
}

/// Client side of an open connection.
#[derive(Debug)]
pub struct Transport {
    /// Frames to write.
    pub outgoing: mpsc::UnboundedSender<Outbound>,
    /// Frames read.
    pub incoming: mpsc::UnboundedReceiver<Inbound>,
}

/// Far side of a [`Transport`] created by [`Transport::channel`].
#[derive(Debug)]
pub struct TransportPeer {
    /// What the client wrote.
    pub sent: mpsc::UnboundedReceiver<Outbound>,
    /// Feed frames to the client.
    pub deliver: mpsc::UnboundedSender<Inbound>,
}

impl Transport {
    /// Create a connected in-memory transport and its peer.
    pub fn channel() -> (Transport, TransportPeer) {
        let (outgoing, sent) = mpsc::unbounded_channel();
        let (deliver, incoming) = mpsc::unbounded_channel();
        (
            Transport { outgoing, incoming },
            TransportPeer { sent, deliver },
        )
    }
}

impl TransportPeer {
    /// Deliver a text frame. Returns false once the client stopped reading.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.deliver.send(Inbound::Text(text.into())).is_ok()
    }

    /// Simulate the server closing the connection.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.deliver.send(Inbound::Closed {
            code,
            reason: reason.into(),
        });
    }
}

/// Opens transports to debugger endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `uri`.
    ///
    /// Resolves once the connection is usable; fails if the endpoint closes
    /// or rejects the handshake first.
    async fn open(&self, uri: &str) -> Result<Transport>;
}

/// Opens WebSocket connections negotiating [`SUB_PROTOCOL`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, uri: &str) -> Result<Transport> {
        let mut request = uri
            .into_client_request()
            .map_err(|e| ClientError::connect(uri, e))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUB_PROTOCOL),
        );

        // tungstenite fails the handshake unless the server echoes the
        // requested sub-protocol.
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::connect(uri, e))?;

        debug!(uri = %uri, "WebSocket handshake complete");

        let (sink, stream) = stream.split();
        let (transport, peer) = Transport::channel();
        tokio::spawn(write_frames(sink, peer.sent));
        tokio::spawn(read_frames(stream, peer.deliver));

        Ok(transport)
    }
}

async fn write_frames(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = outgoing.recv().await {
        match frame {
            Outbound::Text(text) => {
                trace!(bytes = text.len(), "Writing frame");
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Borrowed(""),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "WebSocket close failed");
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    deliver: mpsc::UnboundedSender<Inbound>,
) {
    let (code, reason) = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if deliver.send(Inbound::Text(text)).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if deliver.send(Inbound::Text(text)).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
            }
            // Ping/pong are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (ABNORMAL_CLOSURE, e.to_string()),
            None => break (ABNORMAL_CLOSURE, String::new()),
        }
    };
    let _ = deliver.send(Inbound::Closed { code, reason });
}
