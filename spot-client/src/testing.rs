//! Loopback WebSocket server speaking the client's messages, for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use spot_core::Request;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::channel::{Channel, ChannelEvent};

type Handler = Arc<dyn Fn(&Request) -> Vec<Value> + Send + Sync>;

pub type ServerSocket = WebSocketStream<TcpStream>;

enum Command {
    Text(String),
    Kick,
}

pub struct FakeServer {
    pub addr: String,
    requests: mpsc::UnboundedReceiver<Request>,
    /// Received but not yet taken by `next_request`.
    backlog: VecDeque<Request>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
}

impl FakeServer {
    /// Every request is recorded and answered with whatever `handler` returns (possibly nothing).
    pub async fn spawn(handler: impl Fn(&Request) -> Vec<Value> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (req_tx, requests) = mpsc::unbounded_channel();
        let current: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>> = Arc::default();
        let handler: Handler = Arc::new(handler);
        let slot = current.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (mut sink, mut stream) = socket.split();
                let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
                *slot.lock().unwrap() = Some(cmd_tx.clone());
                let handler = handler.clone();
                let req_tx = req_tx.clone();
                let reader = tokio::spawn(async move {
                    while let Some(Ok(msg)) = stream.next().await {
                        let Message::Text(text) = msg else {
                            continue;
                        };
                        let Ok(request) = serde_json::from_str::<Request>(&text) else {
                            continue;
                        };
                        let replies = handler(&request);
                        let _ = req_tx.send(request);
                        for reply in replies {
                            let _ = cmd_tx.send(Command::Text(reply.to_string()));
                        }
                    }
                });
                tokio::spawn(async move {
                    while let Some(cmd) = cmd_rx.recv().await {
                        match cmd {
                            Command::Text(text) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Command::Kick => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    reader.abort();
                });
            }
        });
        Self {
            addr,
            requests,
            backlog: VecDeque::new(),
            current,
        }
    }

    /// Send a message on the current connection.
    pub fn push(&self, msg: Value) {
        self.send(Command::Text(msg.to_string()));
    }

    /// Send `payload` verbatim as one text message.
    pub fn push_raw(&self, payload: &[u8]) {
        self.send(Command::Text(String::from_utf8_lossy(payload).into_owned()));
    }

    /// Close the current connection with a close frame.
    pub fn kick(&self) {
        self.send(Command::Kick);
    }

    /// Next request whose op is `op`. Requests with other ops stay queued for later calls.
    pub async fn next_request(&mut self, op: &str) -> Request {
        if let Some(at) = self.backlog.iter().position(|r| r.op.as_str() == op) {
            return self.backlog.remove(at).unwrap();
        }
        loop {
            let request = self.requests.recv().await.unwrap();
            if request.op.as_str() == op {
                return request;
            }
            self.backlog.push_back(request);
        }
    }

    /// Ops of the requests received so far and not yet taken, oldest first.
    pub fn received_ops(&mut self) -> Vec<String> {
        while let Ok(request) = self.requests.try_recv() {
            self.backlog.push_back(request);
        }
        self.backlog.iter().map(|r| r.op.as_str().to_string()).collect()
    }

    fn send(&self, cmd: Command) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(cmd);
        }
    }
}

/// A client channel (generation 1) connected to a bare server socket.
pub async fn ws_pair() -> (Channel, mpsc::UnboundedReceiver<ChannelEvent>, ServerSocket) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let accept = async {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    };
    let (channel, server) = tokio::join!(Channel::open(&addr, 1, tx), accept);
    (channel.unwrap(), rx, server)
}

/// Next text message on `server`, parsed as JSON.
pub async fn read_json(server: &mut ServerSocket) -> Value {
    loop {
        if let Message::Text(text) = server.next().await.unwrap().unwrap() {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// One lot "P6" with spots 1..=n, all free, each a unit square.
pub fn lots_json(n: u32) -> Value {
    let spaces: Vec<Value> = (1..=n)
        .map(|id| {
            let lat = 33.0 + f64::from(id);
            serde_json::json!({
                "space_id": id,
                "block": 1,
                "status": 0,
                "coordinates": [
                    {"latitude": lat, "longitude": -117.0},
                    {"latitude": lat, "longitude": -116.0},
                    {"latitude": lat + 1.0, "longitude": -116.0},
                    {"latitude": lat + 1.0, "longitude": -117.0},
                    {"latitude": lat, "longitude": -117.0}
                ]
            })
        })
        .collect();
    serde_json::json!([{ "lot_id": "P6", "name": "Lot P6", "spaces": spaces }])
}
