//! Binary WebSocket transport to the voice agent.
//!
//! Frames are raw PCM payloads, one binary message per captured block.
//! Session metadata travels only in the connection target's query string.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, Stream, StreamExt};
use shared_proto::session::ConnectParams;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::connect_async;
use url::Url;

/// How long `close()` waits for the writer to flush the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport closed")]
    Closed,
}

/// Build the URL the connector dials: endpoint plus session query parameters.
pub fn connection_target(endpoint: &str, params: &ConnectParams) -> Result<Url, TransportError> {
    let mut url = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{other}', expected ws or wss"
            )))
        }
    }

    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.query_pairs() {
            query.append_pair(key, value);
        }
    }

    Ok(url)
}

/// Something that arrived from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Binary payload, expected to be i16 PCM.
    Audio(Vec<u8>),
    /// A message the line protocol does not allow.
    Violation(String),
}

/// An open duplex link. Dropping it aborts the background tasks.
pub struct TransportLink {
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TransportLink {
    /// Link over plain channels, with no socket behind it.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            writer: None,
            reader: None,
        }
    }

    /// Queue one frame. Frames leave in call order.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match &self.outbound {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// Next inbound item; `None` once the remote side is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub async fn close(mut self) {
        // Dropping the sender ends the writer loop, which then sends the close frame
        self.outbound.take();

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                tracing::warn!(component = "transport", "close frame not flushed in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound.close();
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

pub trait Connector: Send + Sync {
    /// Make exactly one connection attempt.
    fn connect(&self, target: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, target: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        Box::pin(async move {
            // The query carries the caller phone, keep it out of the logs
            let host = target.host_str().unwrap_or_default().to_string();
            let path = target.path().to_string();

            let (ws_stream, _) = connect_async(target.as_str())
                .await
                .map_err(|e| TransportError::Handshake(e.to_string()))?;

            tracing::info!(component = "transport", host = %host, path = %path, "connected to voice agent");

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

            let writer = tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if let Err(e) = write.send(Message::Binary(frame)).await {
                        tracing::warn!(component = "transport", error = %e, "failed to send frame");
                        return;
                    }
                }
                if let Err(e) = write.close().await {
                    tracing::debug!(component = "transport", error = %e, "close frame not delivered");
                }
            });

            let reader = tokio::spawn(async move {
                read_frames(&mut read, &in_tx).await;
                tracing::info!(component = "transport", "inbound stream ended");
            });

            Ok(TransportLink {
                outbound: Some(out_tx),
                inbound: in_rx,
                writer: Some(writer),
                reader: Some(reader),
            })
        })
    }
}

/// Forward socket messages until the socket closes or errors.
async fn read_frames<S>(read: &mut S, inbound: &mpsc::UnboundedSender<Inbound>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let item = match msg {
            Ok(Message::Binary(data)) => Inbound::Audio(data),
            Ok(Message::Text(text)) => {
                Inbound::Violation(format!("unexpected text message ({} bytes)", text.len()))
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(frame)) => {
                tracing::info!(component = "transport", frame = ?frame, "agent closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(component = "transport", error = %e, "websocket error");
                break;
            }
        };

        if inbound.send(item).is_err() {
            break;
        }
    }
}
