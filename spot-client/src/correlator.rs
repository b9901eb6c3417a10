//! Request correlation: every request gets a fresh id and a one-shot slot that is
//! resolved exactly once, by its response, a channel failure, or its timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use spot_core::{wire, OpTag, Request, Response};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelError, ChannelState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("not connected")]
    NoChannel,
    #[error("connection is not open")]
    ChannelNotOpen,
    #[error("connection closed")]
    ChannelClosed,
    #[error("connection error: {0}")]
    ChannelError(String),
    #[error("malformed response: {0}")]
    ParseError(String),
    #[error("{op} got no answer within {after:?}")]
    Timeout { op: OpTag, after: Duration },
    #[error("could not encode request: {0}")]
    Encode(String),
}

type Slot = oneshot::Sender<Result<Response, RequestError>>;

struct Pending {
    op: OpTag,
    issued_at: Instant,
    slot: Slot,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// What became of one inbound frame.
#[derive(Debug)]
pub enum Dispatch {
    Resolved { id: u64 },
    Failed { id: u64 },
    /// No request was waiting for it (server push or a late answer).
    Unsolicited(Response),
    Dropped,
}

pub struct Correlator {
    next_id: AtomicU64,
    pending: PendingMap,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register and send a request. The returned handle resolves with the answer.
    /// Nothing is registered when the send itself fails.
    pub fn start(
        &self,
        channel: Option<&Channel>,
        op: OpTag,
        body: Value,
    ) -> Result<PendingResponse, RequestError> {
        self.start_within(channel, op, body, self.timeout)
    }

    /// Like `start`, but the answer is awaited for `timeout` instead of the default.
    pub fn start_within(
        &self,
        channel: Option<&Channel>,
        op: OpTag,
        body: Value,
        timeout: Duration,
    ) -> Result<PendingResponse, RequestError> {
        let channel = channel.ok_or(RequestError::NoChannel)?;
        if channel.state() != ChannelState::Open {
            return Err(RequestError::ChannelNotOpen);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            Pending {
                op: op.clone(),
                issued_at: Instant::now(),
                slot: tx,
            },
        );
        let request = Request::new(id, op.clone(), body);
        if let Err(e) = channel.send(&request) {
            lock(&self.pending).remove(&id);
            return Err(match e {
                ChannelError::Encode(e) => RequestError::Encode(e.to_string()),
                _ => RequestError::ChannelNotOpen,
            });
        }
        debug!(request_id = id, op = %op, "request sent");
        Ok(PendingResponse {
            id,
            op,
            rx,
            pending: self.pending.clone(),
            timeout,
        })
    }

    /// Route one inbound payload. By `id` when present; otherwise to the single pending
    /// request with the same `op`. Malformed JSON fails the oldest pending request.
    pub fn on_frame(&self, payload: &[u8]) -> Dispatch {
        let value: Value = match wire::decode_message(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "inbound frame is not JSON");
                return self.fail_oldest(RequestError::ParseError(e.to_string()));
            }
        };
        let claimed_id = value.get("id").and_then(Value::as_u64);
        let response: Response = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, request_id = ?claimed_id, "inbound frame has a bad shape");
                return match claimed_id {
                    Some(id) => self.fail(id, RequestError::ParseError(e.to_string())),
                    None => Dispatch::Dropped,
                };
            }
        };
        let target = match (response.id, response.op.as_ref()) {
            (Some(id), _) => lock(&self.pending).contains_key(&id).then_some(id),
            (None, Some(op)) => self.only_pending_with(op),
            (None, None) => None,
        };
        let Some(id) = target else {
            debug!(request_id = ?response.id, op = ?response.op, "no pending request for response");
            return Dispatch::Unsolicited(response);
        };
        let Some(entry) = lock(&self.pending).remove(&id) else {
            return Dispatch::Unsolicited(response);
        };
        debug!(
            request_id = id,
            op = %entry.op,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "response matched"
        );
        let _ = entry.slot.send(Ok(response));
        Dispatch::Resolved { id }
    }

    /// Fail every pending request (channel closed or broken). Returns how many were failed.
    pub fn fail_all(&self, error: RequestError) -> usize {
        let drained: Vec<(u64, Pending)> = lock(&self.pending).drain().collect();
        let n = drained.len();
        for (id, entry) in drained {
            debug!(request_id = id, op = %entry.op, error = %error, "request failed");
            let _ = entry.slot.send(Err(error.clone()));
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    fn fail(&self, id: u64, error: RequestError) -> Dispatch {
        match lock(&self.pending).remove(&id) {
            Some(entry) => {
                let _ = entry.slot.send(Err(error));
                Dispatch::Failed { id }
            }
            None => Dispatch::Dropped,
        }
    }

    fn fail_oldest(&self, error: RequestError) -> Dispatch {
        let oldest = lock(&self.pending)
            .iter()
            .min_by_key(|(id, p)| (p.issued_at, **id))
            .map(|(id, _)| *id);
        match oldest {
            Some(id) => self.fail(id, error),
            None => Dispatch::Dropped,
        }
    }

    fn only_pending_with(&self, op: &OpTag) -> Option<u64> {
        let pending = lock(&self.pending);
        let mut matching = pending.iter().filter(|(_, p)| &p.op == op).map(|(id, _)| *id);
        match (matching.next(), matching.next()) {
            (Some(id), None) => Some(id),
            (Some(_), Some(_)) => {
                warn!(op = %op, "id-less response matches several pending requests; ignoring");
                None
            }
            _ => None,
        }
    }
}

fn lock(pending: &Mutex<HashMap<u64, Pending>>) -> MutexGuard<'_, HashMap<u64, Pending>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle for one in-flight request. Dropping it deregisters the request.
pub struct PendingResponse {
    id: u64,
    op: OpTag,
    rx: oneshot::Receiver<Result<Response, RequestError>>,
    pending: PendingMap,
    timeout: Duration,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(mut self) -> Result<Response, RequestError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ChannelClosed),
            Err(_) => {
                warn!(request_id = self.id, op = %self.op, "request timed out");
                Err(RequestError::Timeout {
                    op: self.op.clone(),
                    after: self.timeout,
                })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}
