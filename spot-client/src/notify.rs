//! User notifications: where notices go, and the clock task that fires reservation
//! deadlines and reminders held by the core.

use std::sync::{Arc, Mutex, Weak};

use spot_core::{HostAction, Notice, NoticeKind, SpotCore};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Receives every user-visible notice.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Notices become log lines.
pub struct LogSink;

impl NoticeSink for LogSink {
    fn notify(&self, notice: &Notice) {
        match notice.kind {
            NoticeKind::Accepted | NoticeKind::Released | NoticeKind::ReminderDue => {
                info!(spot_id = ?notice.spot_id, kind = ?notice.kind, "{}", notice.message)
            }
            _ => warn!(spot_id = ?notice.spot_id, kind = ?notice.kind, "{}", notice.message),
        }
    }
}

/// Notices are printed for the person at the terminal.
pub struct ConsoleSink;

impl NoticeSink for ConsoleSink {
    fn notify(&self, notice: &Notice) {
        println!("{}", notice.message);
    }
}

/// Keeps every notice; used by `watch`-style hosts and tests.
#[derive(Default)]
pub struct MemorySink {
    notices: Mutex<Vec<Notice>>,
}

impl MemorySink {
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn kinds(&self) -> Vec<NoticeKind> {
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|n| n.kind)
            .collect()
    }
}

impl NoticeSink for MemorySink {
    fn notify(&self, notice: &Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notice.clone());
    }
}

/// Deliver the notices among `actions`; anything else is unexpected from a clock tick.
pub fn deliver(sink: &dyn NoticeSink, actions: Vec<HostAction>) {
    for action in actions {
        match action {
            HostAction::Notify(notice) => sink.notify(&notice),
            other => debug!(?other, "ignoring non-notice action from tick"),
        }
    }
}

/// Sleep until the core's next wakeup, tick it, repeat. `wake` must be signalled whenever
/// the core may have gained an earlier deadline. Ends once the core is dropped.
pub async fn run_clock(core: Weak<tokio::sync::Mutex<SpotCore>>, wake: Arc<Notify>, sink: Arc<dyn NoticeSink>) {
    loop {
        let next = match core.upgrade() {
            Some(core) => core.lock().await.next_wakeup(),
            None => break,
        };
        match next {
            Some(at) => {
                let at = tokio::time::Instant::from_std(at);
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = wake.notified() => continue,
                }
            }
            None => {
                wake.notified().await;
                continue;
            }
        }
        let Some(core) = core.upgrade() else {
            break;
        };
        let actions = core.lock().await.tick(std::time::Instant::now());
        deliver(sink.as_ref(), actions);
    }
    debug!("reminder clock stopped");
}
