//! Transport channel: one WebSocket connection carrying JSON text messages.
//! A writer task drains an unbounded queue; a reader task forwards inbound payloads as events.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use spot_core::wire::{self, FrameEncodeError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Something happened on the channel opened as `generation`.
/// Events from a replaced channel carry an old generation and must be ignored.
#[derive(Debug)]
pub struct ChannelEvent {
    pub generation: u64,
    pub kind: ChannelEventKind,
}

#[derive(Debug)]
pub enum ChannelEventKind {
    /// One inbound message payload.
    Frame(Vec<u8>),
    /// Connection is gone. `Some` carries the transport error, `None` a clean close.
    Closed(Option<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: tungstenite::Error,
    },
    #[error("connect to {endpoint} timed out")]
    ConnectTimeout { endpoint: String },
    #[error("channel is not open")]
    NotOpen,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// `ws://` is assumed when the endpoint names no scheme.
pub fn ws_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    }
}

/// Shared by the reader and the writer. Whichever fails first reports the closure; it is
/// reported once per channel, and never after a local close.
struct Closer {
    generation: u64,
    state: watch::Sender<ChannelState>,
    events: EventSender,
    reported: AtomicBool,
}

impl Closer {
    fn report(&self, error: Option<String>) {
        self.state.send_replace(ChannelState::Closed);
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(e) => warn!(generation = self.generation, error = %e, "channel lost"),
            None => info!(generation = self.generation, "channel closed by peer"),
        }
        let _ = self.events.send(ChannelEvent {
            generation: self.generation,
            kind: ChannelEventKind::Closed(error),
        });
    }

    fn silence(&self) {
        self.reported.store(true, Ordering::SeqCst);
        self.state.send_replace(ChannelState::Closed);
    }
}

pub struct Channel {
    generation: u64,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<String>,
    closer: Arc<Closer>,
    reader: JoinHandle<()>,
}

impl Channel {
    /// Connect and start the reader and writer tasks. Inbound traffic goes to `events`.
    pub async fn open(endpoint: &str, generation: u64, events: EventSender) -> Result<Self, ChannelError> {
        let url = ws_url(endpoint);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|source| ChannelError::Connect {
                endpoint: url.clone(),
                source,
            })?;
        let peer = match socket.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        info!(endpoint = %url, generation, "channel open");
        Ok(Self::start(socket, peer, generation, events))
    }

    /// Wrap an already-upgraded socket (server side of a test or simulator).
    pub fn from_socket<S>(socket: WebSocketStream<S>, generation: u64, events: EventSender) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(socket, None, generation, events)
    }

    fn start<S>(
        socket: WebSocketStream<S>,
        peer: Option<SocketAddr>,
        generation: u64,
        events: EventSender,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (state, _) = watch::channel(ChannelState::Open);
        let closer = Arc::new(Closer {
            generation,
            state,
            events,
            reported: AtomicBool::new(false),
        });
        tokio::spawn(write_loop(sink, rx, closer.clone()));
        let reader = tokio::spawn(read_loop(stream, closer.clone()));
        Self {
            generation,
            peer,
            outbound: tx,
            closer,
            reader,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ChannelState {
        *self.closer.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.closer.state.subscribe()
    }

    /// Queue one message. Fails with `NotOpen` unless the channel is `Open`.
    pub fn send<T: Serialize>(&self, msg: &T) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }
        let text = wire::encode_message(msg)?;
        self.outbound.send(text).map_err(|_| ChannelError::NotOpen)
    }

    /// Tear down. Emits no event; the owner fails its pending work itself.
    /// Messages already queued are still flushed, followed by a close frame.
    pub fn close(self) {
        self.closer.silence();
        self.reader.abort();
        debug!(generation = self.generation, "channel closed locally");
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    closer: Arc<Closer>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!(generation = closer.generation, error = %e, "channel write failed");
            closer.report(Some(e.to_string()));
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, closer: Arc<Closer>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let error = loop {
        let payload = match stream.next().await {
            None => break None,
            Some(Err(e)) => break Some(e.to_string()),
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) => break None,
            // Ping/pong are answered by tungstenite.
            Some(Ok(_)) => continue,
        };
        if let Err(e) = wire::check_len(payload.len()) {
            break Some(e.to_string());
        }
        let event = ChannelEvent {
            generation: closer.generation,
            kind: ChannelEventKind::Frame(payload),
        };
        if closer.events.send(event).is_err() {
            // Owner is gone.
            break None;
        }
    };
    closer.report(error);
}
