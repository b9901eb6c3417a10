//! Host-driven API: SpotCore receives events from host, returns actions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheSnapshot, RefreshSummary, SpotCache};
use crate::navigation::{HandoffError, NavigationRequest, Platform};
use crate::protocol::{
    self, LotSnapshot, OpTag, ProtocolError, Response, SpotId, SpotStatus,
};
use crate::reminder::{ReminderBook, DEFAULT_REMINDER_LEAD};
use crate::reservation::{
    AttemptKey, ClaimAction, Notice, NoticeKind, ReservationAttempt, ReservationBook,
    ReservationError, DEFAULT_PRERESERVE_POLL, DEFAULT_RESERVATION_WINDOW,
};

/// Tunables for the core. Hosts fill this from their own configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    pub reservation_window: Duration,
    pub prereserve_poll: Duration,
    pub reminder_lead: Duration,
    pub platform: Platform,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            reservation_window: DEFAULT_RESERVATION_WINDOW,
            prereserve_poll: DEFAULT_PRERESERVE_POLL,
            reminder_lead: DEFAULT_REMINDER_LEAD,
            platform: Platform::default(),
        }
    }
}

/// A request the host must send on behalf of an attempt.
/// Feed the answer back with `on_response`, or a failure with `on_request_failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub key: AttemptKey,
    pub op: OpTag,
    pub body: Value,
    /// The answer is still wanted until then (the window deadline for ReserveSpot).
    pub reply_by: Option<Instant>,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum HostAction {
    Send(Outbound),
    /// Wait `after`, then call `on_poll_elapsed`.
    PollLater { key: AttemptKey, after: Duration },
    /// Fire-and-forget; report the result with `on_navigation_handoff`.
    Navigate {
        key: AttemptKey,
        request: NavigationRequest,
    },
    Notify(Notice),
}

/// Main coordinator. Owns the spot cache, the reservation attempts and the reminders.
pub struct SpotCore {
    cache: SpotCache,
    reservations: ReservationBook,
    reminders: ReminderBook,
    platform: Platform,
}

impl SpotCore {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        Self {
            cache: SpotCache::new(),
            reservations: ReservationBook::new(config.reservation_window, config.prereserve_poll),
            reminders: ReminderBook::new(config.reminder_lead),
            platform: config.platform,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn set_platform(&mut self, platform: Platform) {
        self.platform = platform;
    }

    /// Replace the whole cache with a new set of lot snapshots.
    pub fn apply_refresh(&mut self, lots: Vec<LotSnapshot>) -> RefreshSummary {
        let summary = self.cache.refresh(lots);
        info!(
            version = summary.version,
            spots = summary.spots,
            lots = summary.lots,
            added = summary.added,
            dropped = summary.dropped,
            "spot cache refreshed"
        );
        summary
    }

    /// Parse a RefreshData answer and apply it. A bad payload leaves the cache untouched.
    pub fn on_refresh_response(
        &mut self,
        response: &Response,
    ) -> Result<RefreshSummary, ProtocolError> {
        let lots = response.refresh_payload()?;
        Ok(self.apply_refresh(lots))
    }

    pub fn cache(&self) -> &SpotCache {
        &self.cache
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.snapshot()
    }

    /// Cached status, shown as reserved while this client holds the spot.
    pub fn effective_status(&self, spot_id: SpotId) -> Option<SpotStatus> {
        let cached = self.cache.get(spot_id)?.status;
        let held = self
            .reservations
            .attempt(spot_id)
            .is_some_and(ReservationAttempt::holds_reservation);
        Some(if held { SpotStatus::Reserved } else { cached })
    }

    /// User selected a spot.
    pub fn begin_claim(
        &mut self,
        spot_id: SpotId,
        now: Instant,
    ) -> Result<(AttemptKey, Vec<HostAction>), ReservationError> {
        let (key, actions) = self.reservations.begin(spot_id, now)?;
        Ok((key, self.drive(actions, now)))
    }

    /// Answer to a request issued through `HostAction::Send`. `op` is the tag that was sent.
    pub fn on_response(
        &mut self,
        key: AttemptKey,
        op: &OpTag,
        response: &Response,
        now: Instant,
    ) -> Vec<HostAction> {
        let actions = match op {
            OpTag::QuerySpot => match response.query_outcome() {
                Ok(outcome) => self.reservations.on_query_result(key, &outcome, now),
                Err(e) => self.reservations.on_request_failed(key, &e.to_string(), now),
            },
            OpTag::ReserveSpot => match response.reserve_outcome() {
                Ok(outcome) => self.reservations.on_reserve_result(key, &outcome, now),
                Err(e) => self.reservations.on_request_failed(key, &e.to_string(), now),
            },
            other => {
                debug!(
                    spot_id = key.spot_id,
                    op = %other,
                    status = response.status.as_deref().unwrap_or(""),
                    "claim-side response"
                );
                vec![]
            }
        };
        self.drive(actions, now)
    }

    /// A request issued for `key` failed before any answer arrived.
    pub fn on_request_failed(&mut self, key: AttemptKey, reason: &str, now: Instant) -> Vec<HostAction> {
        let actions = self.reservations.on_request_failed(key, reason, now);
        self.drive(actions, now)
    }

    pub fn on_navigation_handoff(
        &mut self,
        key: AttemptKey,
        result: Result<(), HandoffError>,
        now: Instant,
    ) -> Vec<HostAction> {
        let actions = self.reservations.on_navigation_handoff(key, result, now);
        self.drive(actions, now)
    }

    pub fn on_poll_elapsed(&mut self, key: AttemptKey, now: Instant) -> Vec<HostAction> {
        let actions = self.reservations.on_poll_elapsed(key, now);
        self.drive(actions, now)
    }

    pub fn cancel(&mut self, spot_id: SpotId, now: Instant) -> Result<Vec<HostAction>, ReservationError> {
        let actions = self.reservations.cancel(spot_id)?;
        Ok(self.drive(actions, now))
    }

    pub fn release(&mut self, spot_id: SpotId, now: Instant) -> Result<Vec<HostAction>, ReservationError> {
        let actions = self.reservations.release(spot_id)?;
        Ok(self.drive(actions, now))
    }

    pub fn on_channel_closed(&mut self, now: Instant) -> Vec<HostAction> {
        let actions = self.reservations.on_channel_closed();
        self.drive(actions, now)
    }

    /// Periodic tick: reservation deadlines, then due reminders.
    pub fn tick(&mut self, now: Instant) -> Vec<HostAction> {
        let actions = self.reservations.tick(now);
        let mut out = self.drive(actions, now);
        for reminder in self.reminders.due(now) {
            info!(spot_id = reminder.spot_id, handle = reminder.handle, "reminder due");
            out.push(HostAction::Notify(Notice::for_spot(
                reminder.spot_id,
                NoticeKind::ReminderDue,
                reminder.message,
            )));
        }
        out
    }

    /// When `tick` next has something to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.reservations.next_deadline(), self.reminders.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn navigation_request(&self, spot_id: SpotId) -> Result<NavigationRequest, HandoffError> {
        let spot = self
            .cache
            .get(spot_id)
            .ok_or(HandoffError::UnknownSpot(spot_id))?;
        NavigationRequest::for_spot(spot, self.platform)
    }

    pub fn attempt(&self, spot_id: SpotId) -> Option<&ReservationAttempt> {
        self.reservations.attempt(spot_id)
    }

    pub fn active_claims(&self) -> Vec<SpotId> {
        self.reservations.active_spots()
    }

    pub fn prune_finished(&mut self) -> usize {
        self.reservations.prune_finished()
    }

    pub fn reminders(&self) -> &ReminderBook {
        &self.reminders
    }

    /// Turn state-machine actions into host actions. Reminder actions are applied here;
    /// a navigation request that cannot be built is fed straight back as a failed handoff.
    fn drive(&mut self, actions: Vec<ClaimAction>, now: Instant) -> Vec<HostAction> {
        let mut queue: VecDeque<ClaimAction> = actions.into();
        let mut out = Vec::new();
        while let Some(action) = queue.pop_front() {
            match action {
                ClaimAction::SendQuery { spot_id } => {
                    out.extend(self.outbound(spot_id, OpTag::QuerySpot, protocol::query_spot_body(spot_id)));
                }
                ClaimAction::SendReserve { spot_id, window } => {
                    let body = protocol::reserve_spot_body(spot_id, window.as_secs());
                    out.extend(self.outbound(spot_id, OpTag::ReserveSpot, body));
                }
                ClaimAction::SendRelease { spot_id } => {
                    out.extend(self.outbound(spot_id, OpTag::ReleaseSpot, protocol::release_spot_body(spot_id)));
                }
                ClaimAction::PollReserve { spot_id, after } => {
                    if let Some(key) = self.key_for(spot_id) {
                        out.push(HostAction::PollLater { key, after });
                    }
                }
                ClaimAction::LaunchNavigation { spot_id } => {
                    let Some(key) = self.key_for(spot_id) else {
                        continue;
                    };
                    match self.navigation_request(spot_id) {
                        Ok(request) => out.push(HostAction::Navigate { key, request }),
                        Err(e) => {
                            queue.extend(self.reservations.on_navigation_handoff(key, Err(e), now));
                        }
                    }
                }
                ClaimAction::ArmReminder { spot_id, window } => {
                    self.reminders.arm(spot_id, window, now);
                }
                ClaimAction::DisarmReminder { spot_id } => {
                    self.reminders.cancel_spot(spot_id);
                }
                ClaimAction::Notify(notice) => out.push(HostAction::Notify(notice)),
            }
        }
        out
    }

    fn key_for(&self, spot_id: SpotId) -> Option<AttemptKey> {
        self.reservations.attempt(spot_id).map(ReservationAttempt::key)
    }

    fn outbound(&self, spot_id: SpotId, op: OpTag, body: Value) -> Option<HostAction> {
        let attempt = self.reservations.attempt(spot_id)?;
        let reply_by = if op == OpTag::ReserveSpot { attempt.deadline() } else { None };
        Some(HostAction::Send(Outbound {
            key: attempt.key(),
            op,
            body,
            reply_by,
        }))
    }
}

impl Default for SpotCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CongestionLevel;
    use crate::protocol::{Coordinate, SpotSnapshot};
    use crate::reservation::{AbortReason, Phase, RejectReason};
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(600);

    fn square(lat: f64, lng: f64) -> Vec<Coordinate> {
        let c = |latitude, longitude| Coordinate {
            latitude,
            longitude,
        };
        vec![
            c(lat, lng),
            c(lat, lng + 2.0),
            c(lat + 2.0, lng + 2.0),
            c(lat + 2.0, lng),
            c(lat, lng),
        ]
    }

    fn core() -> SpotCore {
        let mut core = SpotCore::with_config(CoreConfig {
            reservation_window: WINDOW,
            ..CoreConfig::default()
        });
        core.apply_refresh(vec![LotSnapshot {
            lot_id: "P6".to_string(),
            name: Some("Lot P6".to_string()),
            congestion_percent: Some(0.9),
            spaces: vec![
                SpotSnapshot {
                    id: 1,
                    block: Some(1),
                    status: 0,
                    coordinates: square(10.0, 20.0),
                },
                SpotSnapshot {
                    id: 2,
                    block: Some(1),
                    status: 0,
                    coordinates: vec![],
                },
            ],
        }]);
        core
    }

    fn sends(actions: &[HostAction]) -> Vec<&Outbound> {
        actions
            .iter()
            .filter_map(|a| match a {
                HostAction::Send(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    fn notices(actions: &[HostAction]) -> Vec<NoticeKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                HostAction::Notify(n) => Some(n.kind),
                _ => None,
            })
            .collect()
    }

    fn status(op: OpTag, s: &str) -> Response {
        Response::new(None, op, Some(s))
    }

    #[test]
    fn claim_runs_query_navigate_reserve_and_arms_reminder() {
        let mut core = core();
        let now = Instant::now();
        let (key, actions) = core.begin_claim(1, now).unwrap();
        let out = sends(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].op, OpTag::QuerySpot);
        assert_eq!(out[0].body, json!({"spot_id": 1}));

        let actions = core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        let HostAction::Navigate { request, .. } = &actions[0] else {
            panic!("expected navigation, got {actions:?}");
        };
        assert_eq!(request.destination, Coordinate { latitude: 11.0, longitude: 21.0 });

        let actions = core.on_navigation_handoff(key, Ok(()), now);
        assert_eq!(sends(&actions)[0].body, json!({"spot_id": 1, "window_secs": 600}));
        assert_eq!(sends(&actions)[0].reply_by, Some(now + WINDOW));

        let actions = core.on_response(key, &OpTag::ReserveSpot, &status(OpTag::ReserveSpot, "reserved"), now);
        assert_eq!(notices(&actions), vec![NoticeKind::Accepted]);
        assert_eq!(core.attempt(1).unwrap().phase(), Phase::Accepted);
        assert_eq!(core.effective_status(1), Some(SpotStatus::Reserved));
        assert_eq!(core.snapshot().get(1).unwrap().status, SpotStatus::Available);

        let fire_at = now + WINDOW - DEFAULT_REMINDER_LEAD;
        assert_eq!(core.next_wakeup(), Some(fire_at));
        assert!(core.tick(fire_at - Duration::from_millis(1)).is_empty());
        assert_eq!(notices(&core.tick(fire_at)), vec![NoticeKind::ReminderDue]);
        assert!(core.tick(fire_at + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn spot_without_geometry_reports_handoff_failure_and_still_reserves() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(2, now).unwrap();
        let actions = core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        assert_eq!(notices(&actions), vec![NoticeKind::HandoffFailed]);
        assert_eq!(sends(&actions)[0].op, OpTag::ReserveSpot);
        assert_eq!(core.attempt(2).unwrap().phase(), Phase::Reserving);
    }

    #[test]
    fn taken_ends_rejected_without_reminder() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        core.on_navigation_handoff(key, Ok(()), now);
        let actions = core.on_response(key, &OpTag::ReserveSpot, &status(OpTag::ReserveSpot, "taken"), now);
        assert_eq!(notices(&actions), vec![NoticeKind::Rejected(RejectReason::Taken)]);
        assert!(core.reminders().is_empty());
        assert_eq!(core.next_wakeup(), None);
    }

    #[test]
    fn response_without_status_aborts_attempt() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        let bare = Response::new(None, OpTag::QuerySpot, None);
        let actions = core.on_response(key, &OpTag::QuerySpot, &bare, now);
        assert_eq!(notices(&actions), vec![NoticeKind::Aborted(AbortReason::RequestFailed)]);
    }

    #[test]
    fn prereserved_schedules_poll_then_resends() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        core.on_navigation_handoff(key, Ok(()), now);
        let actions = core.on_response(key, &OpTag::ReserveSpot, &status(OpTag::ReserveSpot, "prereserved"), now);
        assert!(actions.contains(&HostAction::PollLater {
            key,
            after: DEFAULT_PRERESERVE_POLL
        }));
        let actions = core.on_poll_elapsed(key, now + DEFAULT_PRERESERVE_POLL);
        assert_eq!(sends(&actions)[0].op, OpTag::ReserveSpot);
    }

    #[test]
    fn cancel_while_reserving_sends_release() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        core.on_navigation_handoff(key, Ok(()), now);
        let actions = core.cancel(1, now).unwrap();
        assert_eq!(sends(&actions)[0].op, OpTag::ReleaseSpot);
        assert_eq!(notices(&actions), vec![NoticeKind::Aborted(AbortReason::UserCancelled)]);
    }

    #[test]
    fn release_disarms_pending_reminder() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        core.on_navigation_handoff(key, Ok(()), now);
        core.on_response(key, &OpTag::ReserveSpot, &status(OpTag::ReserveSpot, "reserved"), now);
        assert_eq!(core.reminders().len(), 1);

        let actions = core.release(1, now).unwrap();
        assert_eq!(sends(&actions)[0].op, OpTag::ReleaseSpot);
        assert!(core.reminders().is_empty());
        assert_eq!(core.effective_status(1), Some(SpotStatus::Available));
        assert!(core.tick(now + WINDOW).is_empty());
    }

    #[test]
    fn channel_close_aborts_live_claims() {
        let mut core = core();
        let now = Instant::now();
        core.begin_claim(1, now).unwrap();
        core.begin_claim(2, now).unwrap();
        let actions = core.on_channel_closed(now);
        assert_eq!(
            notices(&actions),
            vec![
                NoticeKind::Aborted(AbortReason::ChannelClosed),
                NoticeKind::Aborted(AbortReason::ChannelClosed)
            ]
        );
        assert!(core.active_claims().is_empty());
        assert_eq!(core.prune_finished(), 2);
    }

    #[test]
    fn refresh_response_replaces_cache() {
        let mut core = core();
        let response = Response::new(Some(1), OpTag::RefreshData, None).with_field(
            "data",
            json!([{ "lot_id": "P7", "spaces": [{ "space_id": 9, "status": 2 }] }]),
        );
        let summary = core.on_refresh_response(&response).unwrap();
        assert_eq!(summary.version, 2);
        assert_eq!(summary.dropped, 2);
        assert!(core.snapshot().get(1).is_none());
        assert_eq!(core.effective_status(9), Some(SpotStatus::Reserved));
        assert_eq!(core.snapshot().lot_congestion("P6").level(), CongestionLevel::Unknown);

        let broken = Response::new(Some(2), OpTag::RefreshData, None);
        assert!(core.on_refresh_response(&broken).is_err());
        assert_eq!(core.cache().version(), 2);
    }

    #[test]
    fn unknown_spot_cannot_navigate() {
        let core = core();
        assert_eq!(
            core.navigation_request(42).unwrap_err(),
            HandoffError::UnknownSpot(42)
        );
    }

    #[test]
    fn held_spot_keeps_its_reminder_when_claimed_again() {
        let mut core = core();
        let now = Instant::now();
        let (key, _) = core.begin_claim(1, now).unwrap();
        core.on_response(key, &OpTag::QuerySpot, &status(OpTag::QuerySpot, "available"), now);
        core.on_navigation_handoff(key, Ok(()), now);
        core.on_response(key, &OpTag::ReserveSpot, &status(OpTag::ReserveSpot, "reserved"), now);

        assert_eq!(
            core.begin_claim(1, now).unwrap_err(),
            ReservationError::AlreadyHeld(1)
        );
        assert!(core.reminders().pending_for(1).is_some());
        assert_eq!(core.effective_status(1), Some(SpotStatus::Reserved));
        assert!(core.release(1, now).is_ok());
    }
}
