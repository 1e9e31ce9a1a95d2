//! WebSocket transport.
//!
//! A [`Connector`] opens one link per connection attempt. Each link runs in
//! its own task and reports back through a shared event channel, tagged with
//! the [`LinkId`] it was opened under so the owner can ignore events from a
//! link it already tore down. Dropping a [`TransportLink`] closes the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::DisconnectReason;

pub type LinkId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Open,
    Message(String),
    /// Terminal; no further events follow for this link.
    Lost(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub link: LinkId,
    pub kind: TransportEventKind,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Write half of an open (or opening) link.
#[derive(Debug)]
pub struct TransportLink {
    outgoing: mpsc::UnboundedSender<String>,
}

impl TransportLink {
    pub fn new(outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self { outgoing }
    }

    /// Queues a text frame. Returns false once the link task has ended.
    pub fn send(&self, frame: String) -> bool {
        self.outgoing.send(frame).is_ok()
    }
}

/// Opens transports. Implementations must not block; the link does its work in
/// a spawned task and reports through `events`.
pub trait Connector: Send + 'static {
    fn open(&mut self, link: LinkId, url: &str, events: TransportEvents) -> TransportLink;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&mut self, link: LinkId, url: &str, events: TransportEvents) -> TransportLink {
        // `wss://` handshakes need a process-wide rustls provider; a second install is a no-op error.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(link, url.to_string(), outgoing_rx, events));
        TransportLink::new(outgoing_tx)
    }
}

async fn run_link(
    link: LinkId,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: TransportEvents,
) {
    let emit = |kind: TransportEventKind| {
        let _ = events.send(TransportEvent { link, kind });
    };

    let socket = tokio::select! {
        connected = connect_async(url.as_str()) => match connected {
            Ok((socket, _response)) => socket,
            Err(err) => {
                warn!(link, %url, error = %err, "failed to connect");
                emit(TransportEventKind::Lost(DisconnectReason::Error(err.to_string())));
                return;
            }
        },
        None = outgoing.recv() => {
            debug!(link, "link dropped while connecting");
            return;
        }
    };

    debug!(link, %url, "transport open");
    emit(TransportEventKind::Open);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(WsMessage::text(frame)).await {
                        emit(TransportEventKind::Lost(DisconnectReason::Error(err.to_string())));
                        return;
                    }
                }
                None => {
                    debug!(link, "link dropped, closing socket");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => emit(TransportEventKind::Message(text.to_string())),
                Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => emit(TransportEventKind::Message(text)),
                    Err(_) => warn!(link, len = data.len(), "dropping binary frame that is not UTF-8"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) => DisconnectReason::Closed {
                            code: Some(frame.code.into()),
                            reason: frame.reason.to_string(),
                        },
                        None => DisconnectReason::Closed {
                            code: None,
                            reason: "server closed connection".to_string(),
                        },
                    };
                    emit(TransportEventKind::Lost(reason));
                    return;
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    emit(TransportEventKind::Lost(DisconnectReason::Error(err.to_string())));
                    return;
                }
                None => {
                    emit(TransportEventKind::Lost(DisconnectReason::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }));
                    return;
                }
            },
        }
    }
}
