//! Runs the host actions the core asks for until none are left.

use std::collections::VecDeque;
use std::time::Instant;

use spot_core::{HostAction, Notice, NoticeKind, OpTag, Outbound};
use tracing::{debug, warn};

use crate::session::Session;

/// Perform `actions` in order. Whatever the core returns in reply is queued behind them,
/// so one call carries a claim from its first query to its terminal notice.
pub(crate) async fn drive(session: &Session, actions: Vec<HostAction>) {
    let mut work: VecDeque<HostAction> = actions.into();
    while let Some(action) = work.pop_front() {
        let follow_up = match action {
            HostAction::Notify(notice) => {
                session.notify(&notice);
                continue;
            }
            HostAction::Navigate { key, request } => {
                let result = session.launcher().launch(&request);
                if let Err(e) = &result {
                    warn!(spot_id = key.spot_id, error = %e, "navigation handoff failed");
                }
                session
                    .core()
                    .lock()
                    .await
                    .on_navigation_handoff(key, result, Instant::now())
            }
            HostAction::Send(Outbound {
                key,
                op,
                body,
                reply_by,
            }) => {
                // A reserve answer counts until the window closes, however long that is.
                let wait = reply_by
                    .map(|by| by.saturating_duration_since(Instant::now()))
                    .map_or(session.config().request_timeout(), |left| {
                        left.max(session.config().request_timeout())
                    });
                let result = session.send_request_within(op.clone(), body, wait).await;
                let mut core = session.core().lock().await;
                match result {
                    Ok(response) => core.on_response(key, &op, &response, Instant::now()),
                    Err(e) => {
                        if op == OpTag::ReleaseSpot {
                            session.notify(&Notice::for_spot(
                                key.spot_id,
                                NoticeKind::RequestFailed,
                                format!("Could not release spot {}: {e}", key.spot_id),
                            ));
                        }
                        core.on_request_failed(key, &e.to_string(), Instant::now())
                    }
                }
            }
            HostAction::PollLater { key, after } => {
                debug!(spot_id = key.spot_id, ?after, "polling reserve again later");
                tokio::time::sleep(after).await;
                session.core().lock().await.on_poll_elapsed(key, Instant::now())
            }
        };
        session.wake_clock();
        work.extend(follow_up);
    }
}
