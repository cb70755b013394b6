//! WebSocket transport.
//!
//! Each protocol message travels as one JSON text frame. [`bridge`] pumps
//! frames between a socket and one end of a [`Transport::pair`], returning
//! the other end, so the sync layers only ever deal with transports.
//!
//! ```text
//!   ClientDoc ── Transport ══ pair ══ pump ── tokio-tungstenite ─┐
//!                                                                │ ws
//!   ServerDoc ── Transport ══ pair ══ pump ── axum WebSocket ────┘
//! ```

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use url::Url;

use crate::handshake::{self, ConnectError, Connector};
use crate::protocol::Msg;
use crate::transport::Transport;

/// What the pump needs from a socket message type.
pub trait WsMessage: Sized + Send + 'static {
    fn text(text: String) -> Self;

    /// The text payload, or `Err(closing)` for non-text frames.
    fn into_text(self) -> Result<String, bool>;
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn into_text(self) -> Result<String, bool> {
        match self {
            Self::Text(text) => Ok(text.as_str().to_owned()),
            Self::Close(_) => Err(true),
            _ => Err(false),
        }
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn into_text(self) -> Result<String, bool> {
        match self {
            Self::Text(text) => Ok(text.as_str().to_owned()),
            Self::Close(_) => Err(true),
            _ => Err(false),
        }
    }
}

/// Spawn a pump between `socket` and a new transport pair and return the
/// application end. Closing either side closes the other.
pub fn bridge<S, M, E>(socket: S) -> Transport
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Unpin + Send + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    let (app, socket_end) = Transport::pair();
    tokio::spawn(pump(socket, socket_end));
    app
}

async fn pump<S, M, E>(socket: S, transport: Transport)
where
    S: Stream<Item = Result<M, E>> + Sink<M> + Unpin,
    M: WsMessage,
    E: Display + Send,
{
    let (mut sink, mut stream) = socket.split();
    let (sender, mut receiver) = transport.split();

    let outbound = async {
        while let Some(msg) = receiver.recv().await {
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    log::error!("dropping unencodable {} message: {e}", msg.kind());
                    continue;
                }
            };
            if sink.send(M::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let inbound = async {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(msg) => match msg.into_text() {
                    Ok(text) => text,
                    Err(true) => break,
                    Err(false) => continue,
                },
                Err(e) => {
                    log::info!("websocket error: {e}");
                    break;
                }
            };
            match Msg::decode(&text) {
                Ok(msg) => sender.send(msg),
                Err(e) => log::warn!("dropping malformed frame: {e}"),
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
    sender.close();
}

/// Connects to a sync server over WebSocket and authenticates.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    token: String,
    params: Vec<(String, String)>,
    timeout: Duration,
}

impl WsConnector {
    /// `endpoint` is the full socket URL, e.g. `ws://host:8080/v1/ws`.
    pub fn new(endpoint: &str, token: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            token: token.into(),
            params: Vec::new(),
            timeout: Duration::from_secs(10),
        })
    }

    /// Extra query parameter sent with every connection.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url_for(&self, doc_id: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("docId", doc_id)
            .extend_pairs(self.params.iter());
        url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, doc_id: &str) -> Result<Transport, ConnectError> {
        let url = self.url_for(doc_id);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        let mut transport = bridge(socket);
        handshake::authenticate(&mut transport, &self.token, self.timeout).await?;
        Ok(transport)
    }
}
