//! Transport backends for the realtime channel.
//!
//! A transport is opened synchronously and reports its lifecycle through a
//! channel of [`TransportEvent`]s produced by a background I/O task, so the
//! manager sees websocket and SSE connections through one interface.

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::retry::with_timeout;
use crate::stream::decoder::{extract_data, DecodeError, FrameSplitter, DONE_SENTINEL};

/// Wire protocol backing a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Bidirectional websocket.
    #[default]
    Ws,
    /// Receive-only server-sent events over a streaming GET.
    Sse,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ws => "ws",
            Protocol::Sse => "sse",
        }
    }

    /// Whether the protocol can carry outbound messages.
    pub fn is_writable(self) -> bool {
        matches!(self, Protocol::Ws)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and data notifications emitted by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and ready.
    Opened,
    /// One inbound text message.
    Message(String),
    /// The connection failed. Terminal for this transport.
    Error(String),
    /// The connection ended. Terminal for this transport.
    Closed,
}

/// Errors raised inside transport I/O tasks.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket handshake or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP transport error for the SSE stream.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The SSE endpoint answered with a non-success status.
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),

    /// The channel URL could not be built.
    #[error("invalid url: {0}")]
    Url(String),

    /// The connection was not established in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The SSE body grew past the frame buffer limit.
    #[error("frame decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// An opened transport.
///
/// `events` yields the transport's notifications in order. `outbound` is
/// present only for writable transports. `task` aborts the I/O task.
#[derive(Debug)]
pub struct TransportHandle {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub outbound: Option<mpsc::UnboundedSender<String>>,
    pub task: Option<AbortHandle>,
}

/// Opens transports for the manager.
///
/// `open` must not block; connection establishment happens in the background
/// and is reported through [`TransportHandle::events`].
pub trait Connector: Send + Sync {
    fn open(&self, url: &str, protocol: Protocol) -> TransportHandle;
}

/// Connector backed by `tokio-tungstenite` and `reqwest`.
#[derive(Clone, Debug)]
pub struct DefaultConnector {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), connect_timeout)
    }

    /// Uses a caller-provided HTTP client for SSE connections.
    pub fn with_client(http: reqwest::Client, connect_timeout: Duration) -> Self {
        Self {
            http,
            connect_timeout,
        }
    }
}

impl Connector for DefaultConnector {
    fn open(&self, url: &str, protocol: Protocol) -> TransportHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let url = url.to_string();

        match protocol {
            Protocol::Ws => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let connect_timeout = self.connect_timeout;
                let task = tokio::spawn(async move {
                    let result = run_websocket(&url, connect_timeout, outbound_rx, &events_tx).await;
                    finish(protocol, result, &events_tx);
                });
                TransportHandle {
                    events: events_rx,
                    outbound: Some(outbound_tx),
                    task: Some(task.abort_handle()),
                }
            }
            Protocol::Sse => {
                let http = self.http.clone();
                let connect_timeout = self.connect_timeout;
                let task = tokio::spawn(async move {
                    let result = run_sse(&http, &url, connect_timeout, &events_tx).await;
                    finish(protocol, result, &events_tx);
                });
                TransportHandle {
                    events: events_rx,
                    outbound: None,
                    task: Some(task.abort_handle()),
                }
            }
        }
    }
}

fn finish(
    protocol: Protocol,
    result: Result<(), TransportError>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    match result {
        Ok(()) => {
            debug!(event = "transport_closed", protocol = %protocol);
            let _ = events_tx.send(TransportEvent::Closed);
        }
        Err(err) => {
            warn!(event = "transport_failed", protocol = %protocol, error = %err);
            let _ = events_tx.send(TransportEvent::Error(err.to_string()));
        }
    }
}

async fn run_websocket(
    url: &str,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(), TransportError> {
    let request = url.into_client_request()?;
    let (mut socket, _) = with_timeout(connect_timeout, connect_async(request))
        .await
        .map_err(|_| TransportError::ConnectTimeout(connect_timeout))??;
    let _ = events_tx.send(TransportEvent::Opened);

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => socket.send(Message::Text(text)).await?,
                    None => {
                        // Manager released the transport.
                        let _ = socket.close(None).await;
                        return Ok(());
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events_tx.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = events_tx.send(TransportEvent::Message(text));
                        }
                        Err(_) => debug!(event = "binary_frame_ignored"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}

async fn run_sse(
    http: &reqwest::Client,
    url: &str,
    connect_timeout: Duration,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(), TransportError> {
    let request = http
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send();
    let response = with_timeout(connect_timeout, request)
        .await
        .map_err(|_| TransportError::ConnectTimeout(connect_timeout))??;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::HttpStatus(status));
    }
    let _ = events_tx.send(TransportEvent::Opened);

    let mut body = std::pin::pin!(response.bytes_stream());
    let mut splitter = FrameSplitter::new();
    let mut frames = Vec::new();
    while let Some(chunk) = body.next().await {
        let result = splitter.push(&chunk?, &mut frames);
        for frame in frames.drain(..) {
            if let Some(data) = sse_message(&frame) {
                let _ = events_tx.send(TransportEvent::Message(data));
            }
        }
        result?;
    }

    Ok(())
}

/// Returns the `data:` content of an SSE frame worth forwarding.
///
/// Heartbeats with empty data and the `[DONE]` sentinel are not messages.
fn sse_message(frame: &str) -> Option<String> {
    let data = extract_data(frame)?;
    if data.is_empty() {
        return None;
    }
    if data == DONE_SENTINEL {
        debug!(event = "sse_sentinel_skipped");
        return None;
    }
    Some(data)
}
