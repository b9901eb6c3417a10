//! Soft-reservation state machine: query, navigation handoff, reserve, outcome.
//! Host-driven: every event returns the actions the host must perform next.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::navigation::HandoffError;
use crate::protocol::{QueryOutcome, ReserveOutcome, SpotId};

/// Default time the server holds a soft reservation.
pub const DEFAULT_RESERVATION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default delay before re-sending ReserveSpot while the spot is prereserved.
pub const DEFAULT_PRERESERVE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Querying,
    NavigationStarted,
    Reserving,
    Prereserved,
    Accepted,
    Rejected,
    TimedOut,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Accepted | Phase::Rejected | Phase::TimedOut | Phase::Aborted
        )
    }

    /// Phases in which a ReserveSpot answer is expected.
    fn awaits_reserve(self) -> bool {
        matches!(self, Phase::Reserving | Phase::Prereserved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Querying => "querying",
            Phase::NavigationStarted => "navigation_started",
            Phase::Reserving => "reserving",
            Phase::Prereserved => "prereserved",
            Phase::Accepted => "accepted",
            Phase::Rejected => "rejected",
            Phase::TimedOut => "timed_out",
            Phase::Aborted => "aborted",
        }
    }
}

/// Why an attempt ended in `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Query said occupied.
    Occupied,
    /// Query said reserved.
    AlreadyReserved,
    /// Reserve lost the race to a car parking there.
    Preoccupied,
    /// Reserve lost the race to another client.
    Taken,
    /// Server answered with a status this client does not know.
    Unrecognized,
}

/// Why an attempt ended in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UserCancelled,
    ChannelClosed,
    RequestFailed,
}

/// Who ended an attempt in `TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    /// Local deadline elapsed.
    Window,
    /// Server reported `time_limit_reached`.
    Server,
}

/// Identifies one attempt. Events carrying a stale attempt id are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub spot_id: SpotId,
    pub attempt_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationAttempt {
    pub attempt_id: Uuid,
    pub spot_id: SpotId,
    pub started_at: Instant,
    phase: Phase,
    deadline: Option<Instant>,
    reject_reason: Option<RejectReason>,
    abort_reason: Option<AbortReason>,
    timeout_source: Option<TimeoutSource>,
    released: bool,
}

impl ReservationAttempt {
    fn new(spot_id: SpotId, now: Instant) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            spot_id,
            started_at: now,
            phase: Phase::Querying,
            deadline: None,
            reject_reason: None,
            abort_reason: None,
            timeout_source: None,
            released: false,
        }
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            spot_id: self.spot_id,
            attempt_id: self.attempt_id,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reservation deadline; set on entering `Reserving`.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.reject_reason
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    pub fn timeout_source(&self) -> Option<TimeoutSource> {
        self.timeout_source
    }

    /// Accepted, then given back with `release`.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Accepted and still held.
    pub fn holds_reservation(&self) -> bool {
        self.phase == Phase::Accepted && !self.released
    }
}

/// User-visible message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Accepted,
    Rejected(RejectReason),
    TimedOut(TimeoutSource),
    Aborted(AbortReason),
    PrereservedWarning,
    HandoffFailed,
    Released,
    ReminderDue,
    RequestFailed,
    /// The server side of the channel went away.
    ConnectionLost,
}

impl NoticeKind {
    /// Notices that close an attempt. Exactly one of these is emitted per attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NoticeKind::Accepted
                | NoticeKind::Rejected(_)
                | NoticeKind::TimedOut(_)
                | NoticeKind::Aborted(_)
        )
    }
}

/// One user notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub spot_id: Option<SpotId>,
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn for_spot(spot_id: SpotId, kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            spot_id: Some(spot_id),
            kind,
            message: message.into(),
        }
    }

    pub fn general(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            spot_id: None,
            kind,
            message: message.into(),
        }
    }
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimAction {
    SendQuery { spot_id: SpotId },
    /// Fire-and-forget turn-by-turn handoff; report the result with `on_navigation_handoff`.
    LaunchNavigation { spot_id: SpotId },
    SendReserve { spot_id: SpotId, window: Duration },
    /// Re-send ReserveSpot after `after` if the attempt is still prereserved.
    PollReserve { spot_id: SpotId, after: Duration },
    /// Best-effort release of a server-side hold.
    SendRelease { spot_id: SpotId },
    ArmReminder { spot_id: SpotId, window: Duration },
    DisarmReminder { spot_id: SpotId },
    Notify(Notice),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("an attempt on spot {0} is already in progress")]
    AttemptInProgress(SpotId),
    #[error("no attempt for spot {0}")]
    UnknownAttempt(SpotId),
    #[error("spot {0} has no accepted reservation")]
    NotAccepted(SpotId),
    #[error("spot {0} is already reserved by this client")]
    AlreadyHeld(SpotId),
}

/// All attempts, at most one per spot. Terminal attempts stay readable until replaced or pruned.
pub struct ReservationBook {
    attempts: HashMap<SpotId, ReservationAttempt>,
    window: Duration,
    prereserve_poll: Duration,
}

impl ReservationBook {
    pub fn new(window: Duration, prereserve_poll: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            window,
            prereserve_poll,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// User selected a spot. Fails if that spot already has a non-terminal attempt.
    pub fn begin(
        &mut self,
        spot_id: SpotId,
        now: Instant,
    ) -> Result<(AttemptKey, Vec<ClaimAction>), ReservationError> {
        if let Some(existing) = self.attempts.get(&spot_id) {
            if !existing.phase.is_terminal() {
                return Err(ReservationError::AttemptInProgress(spot_id));
            }
            if existing.holds_reservation() {
                return Err(ReservationError::AlreadyHeld(spot_id));
            }
        }
        let attempt = ReservationAttempt::new(spot_id, now);
        let key = attempt.key();
        info!(spot_id, attempt_id = %key.attempt_id, "claim started");
        self.attempts.insert(spot_id, attempt);
        Ok((key, vec![ClaimAction::SendQuery { spot_id }]))
    }

    /// QuerySpot answered.
    pub fn on_query_result(
        &mut self,
        key: AttemptKey,
        outcome: &QueryOutcome,
        _now: Instant,
    ) -> Vec<ClaimAction> {
        let Some(attempt) = self.live(key, |p| p == Phase::Querying, "query result") else {
            return vec![];
        };
        let spot_id = attempt.spot_id;
        match outcome {
            QueryOutcome::Available => {
                attempt.phase = Phase::NavigationStarted;
                debug!(spot_id, "spot available; starting navigation");
                vec![ClaimAction::LaunchNavigation { spot_id }]
            }
            QueryOutcome::Occupied => reject(attempt, RejectReason::Occupied),
            QueryOutcome::Reserved => reject(attempt, RejectReason::AlreadyReserved),
            QueryOutcome::Unrecognized(status) => {
                warn!(spot_id, status = %status, "unrecognized query status; rejecting");
                reject(attempt, RejectReason::Unrecognized)
            }
        }
    }

    /// Host invoked the navigation launcher. Failure is reported but does not stop the claim.
    pub fn on_navigation_handoff(
        &mut self,
        key: AttemptKey,
        result: Result<(), HandoffError>,
        now: Instant,
    ) -> Vec<ClaimAction> {
        let window = self.window;
        let Some(attempt) = self.live(key, |p| p == Phase::NavigationStarted, "navigation handoff")
        else {
            return vec![];
        };
        let spot_id = attempt.spot_id;
        let mut actions = Vec::new();
        if let Err(err) = result {
            warn!(spot_id, error = %err, "navigation handoff failed");
            actions.push(ClaimAction::Notify(Notice::for_spot(
                spot_id,
                NoticeKind::HandoffFailed,
                format!("Could not open navigation to spot {spot_id}: {err}"),
            )));
        }
        attempt.phase = Phase::Reserving;
        attempt.deadline = Some(now + window);
        actions.push(ClaimAction::SendReserve { spot_id, window });
        actions
    }

    /// ReserveSpot answered. A response at or after the deadline loses to the timeout.
    pub fn on_reserve_result(
        &mut self,
        key: AttemptKey,
        outcome: &ReserveOutcome,
        now: Instant,
    ) -> Vec<ClaimAction> {
        let window = self.window;
        let poll = self.prereserve_poll;
        let Some(attempt) = self.live(key, Phase::awaits_reserve, "reserve result") else {
            return vec![];
        };
        let spot_id = attempt.spot_id;
        if attempt.deadline.is_some_and(|d| now >= d) {
            debug!(spot_id, ?outcome, "reserve result arrived after the window; discarding");
            return time_out(attempt, TimeoutSource::Window);
        }
        match outcome {
            ReserveOutcome::Reserved => {
                attempt.phase = Phase::Accepted;
                info!(spot_id, attempt_id = %attempt.attempt_id, "reservation accepted");
                vec![
                    ClaimAction::ArmReminder { spot_id, window },
                    ClaimAction::Notify(Notice::for_spot(
                        spot_id,
                        NoticeKind::Accepted,
                        format!(
                            "Spot {spot_id} is reserved for {} minutes.",
                            window.as_secs() / 60
                        ),
                    )),
                ]
            }
            ReserveOutcome::Prereserved => {
                let mut actions = Vec::new();
                if attempt.phase != Phase::Prereserved {
                    attempt.phase = Phase::Prereserved;
                    actions.push(ClaimAction::Notify(Notice::for_spot(
                        spot_id,
                        NoticeKind::PrereservedWarning,
                        format!("Spot {spot_id} is on hold for someone else; still trying."),
                    )));
                }
                actions.push(ClaimAction::PollReserve {
                    spot_id,
                    after: poll,
                });
                actions
            }
            ReserveOutcome::Preoccupied => reject(attempt, RejectReason::Preoccupied),
            ReserveOutcome::Taken => reject(attempt, RejectReason::Taken),
            ReserveOutcome::TimeLimitReached => time_out(attempt, TimeoutSource::Server),
            ReserveOutcome::Unrecognized(status) => {
                warn!(spot_id, status = %status, "unrecognized reserve status; rejecting");
                reject(attempt, RejectReason::Unrecognized)
            }
        }
    }

    /// Host waited out a `PollReserve`. Re-sends ReserveSpot only if still prereserved.
    pub fn on_poll_elapsed(&mut self, key: AttemptKey, now: Instant) -> Vec<ClaimAction> {
        let window = self.window;
        let Some(attempt) = self.live(key, |p| p == Phase::Prereserved, "prereserve poll") else {
            return vec![];
        };
        if attempt.deadline.is_some_and(|d| now >= d) {
            return time_out(attempt, TimeoutSource::Window);
        }
        vec![ClaimAction::SendReserve {
            spot_id: attempt.spot_id,
            window,
        }]
    }

    /// The attempt's in-flight request failed (transport, parse or request timeout).
    /// A request for the attempt failed. Past the window deadline this is the window
    /// running out, not a failure.
    pub fn on_request_failed(&mut self, key: AttemptKey, reason: &str, now: Instant) -> Vec<ClaimAction> {
        let Some(attempt) = self.live(key, |p| !p.is_terminal(), "request failure") else {
            return vec![];
        };
        if attempt.phase.awaits_reserve() && attempt.deadline.is_some_and(|d| now >= d) {
            debug!(spot_id = attempt.spot_id, reason, "request failed after the window");
            return time_out(attempt, TimeoutSource::Window);
        }
        warn!(spot_id = attempt.spot_id, reason, "claim request failed");
        let message = format!("Claim on spot {} failed: {reason}", attempt.spot_id);
        abort(attempt, AbortReason::RequestFailed, message)
    }

    /// User gave up. Releases a server hold if one may exist.
    pub fn cancel(&mut self, spot_id: SpotId) -> Result<Vec<ClaimAction>, ReservationError> {
        let attempt = self
            .attempts
            .get_mut(&spot_id)
            .filter(|a| !a.phase.is_terminal())
            .ok_or(ReservationError::UnknownAttempt(spot_id))?;
        let holds = attempt.phase.awaits_reserve();
        let mut actions = abort(
            attempt,
            AbortReason::UserCancelled,
            format!("Claim on spot {spot_id} cancelled."),
        );
        if holds {
            actions.insert(0, ClaimAction::SendRelease { spot_id });
        }
        Ok(actions)
    }

    /// Give back an accepted reservation early. The attempt stays `Accepted`, marked released.
    pub fn release(&mut self, spot_id: SpotId) -> Result<Vec<ClaimAction>, ReservationError> {
        let attempt = self
            .attempts
            .get_mut(&spot_id)
            .filter(|a| a.holds_reservation())
            .ok_or(ReservationError::NotAccepted(spot_id))?;
        attempt.released = true;
        info!(spot_id, attempt_id = %attempt.attempt_id, "reservation released");
        Ok(vec![
            ClaimAction::SendRelease { spot_id },
            ClaimAction::DisarmReminder { spot_id },
            ClaimAction::Notify(Notice::for_spot(
                spot_id,
                NoticeKind::Released,
                format!("Spot {spot_id} released."),
            )),
        ])
    }

    /// Channel went away: every non-terminal attempt is aborted.
    pub fn on_channel_closed(&mut self) -> Vec<ClaimAction> {
        let mut actions = Vec::new();
        for attempt in self.attempts.values_mut() {
            if attempt.phase.is_terminal() {
                continue;
            }
            let message = format!(
                "Lost connection while claiming spot {}.",
                attempt.spot_id
            );
            actions.extend(abort(attempt, AbortReason::ChannelClosed, message));
        }
        actions
    }

    /// Enforce reservation deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<ClaimAction> {
        let mut actions = Vec::new();
        for attempt in self.attempts.values_mut() {
            if attempt.phase.awaits_reserve() && attempt.deadline.is_some_and(|d| now >= d) {
                actions.extend(time_out(attempt, TimeoutSource::Window));
            }
        }
        actions
    }

    /// Earliest deadline among attempts waiting on ReserveSpot.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.attempts
            .values()
            .filter(|a| a.phase.awaits_reserve())
            .filter_map(|a| a.deadline)
            .min()
    }

    pub fn attempt(&self, spot_id: SpotId) -> Option<&ReservationAttempt> {
        self.attempts.get(&spot_id)
    }

    /// Current phase of the attempt identified by `key`, if it is still the spot's attempt.
    pub fn phase_of(&self, key: AttemptKey) -> Option<Phase> {
        self.attempts
            .get(&key.spot_id)
            .filter(|a| a.attempt_id == key.attempt_id)
            .map(|a| a.phase)
    }

    pub fn active_spots(&self) -> Vec<SpotId> {
        let mut out: Vec<SpotId> = self
            .attempts
            .values()
            .filter(|a| !a.phase.is_terminal())
            .map(|a| a.spot_id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Drop terminal attempts except held reservations. Returns how many were removed.
    pub fn prune_finished(&mut self) -> usize {
        let before = self.attempts.len();
        self.attempts
            .retain(|_, a| !a.phase.is_terminal() || a.holds_reservation());
        before - self.attempts.len()
    }

    /// Look up the attempt for `key` if it is current and in a phase accepted by `expects`.
    /// Anything else is a late or stale event and is dropped.
    fn live(
        &mut self,
        key: AttemptKey,
        expects: impl Fn(Phase) -> bool,
        event: &'static str,
    ) -> Option<&mut ReservationAttempt> {
        match self.attempts.get_mut(&key.spot_id) {
            Some(a) if a.attempt_id == key.attempt_id && expects(a.phase) => Some(a),
            Some(a) => {
                debug!(
                    spot_id = key.spot_id,
                    attempt_id = %key.attempt_id,
                    phase = a.phase.as_str(),
                    event,
                    "discarding event for stale or finished attempt"
                );
                None
            }
            None => {
                debug!(spot_id = key.spot_id, event, "discarding event for unknown attempt");
                None
            }
        }
    }
}

impl Default for ReservationBook {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVATION_WINDOW, DEFAULT_PRERESERVE_POLL)
    }
}

fn reject(attempt: &mut ReservationAttempt, reason: RejectReason) -> Vec<ClaimAction> {
    attempt.phase = Phase::Rejected;
    attempt.reject_reason = Some(reason);
    let spot_id = attempt.spot_id;
    info!(spot_id, attempt_id = %attempt.attempt_id, ?reason, "claim rejected");
    let message = match reason {
        RejectReason::Occupied => format!("Spot {spot_id} is occupied."),
        RejectReason::AlreadyReserved => format!("Spot {spot_id} is already reserved."),
        RejectReason::Preoccupied => format!("Someone parked in spot {spot_id} first."),
        RejectReason::Taken => format!("Spot {spot_id} was taken by another driver."),
        RejectReason::Unrecognized => {
            format!("Spot {spot_id} could not be reserved (unexpected server answer).")
        }
    };
    vec![
        ClaimAction::DisarmReminder { spot_id },
        ClaimAction::Notify(Notice::for_spot(
            spot_id,
            NoticeKind::Rejected(reason),
            message,
        )),
    ]
}

fn time_out(attempt: &mut ReservationAttempt, source: TimeoutSource) -> Vec<ClaimAction> {
    attempt.phase = Phase::TimedOut;
    attempt.timeout_source = Some(source);
    let spot_id = attempt.spot_id;
    info!(spot_id, attempt_id = %attempt.attempt_id, ?source, "claim timed out");
    vec![
        ClaimAction::DisarmReminder { spot_id },
        ClaimAction::Notify(Notice::for_spot(
            spot_id,
            NoticeKind::TimedOut(source),
            format!("Reservation window for spot {spot_id} ran out."),
        )),
    ]
}

fn abort(attempt: &mut ReservationAttempt, reason: AbortReason, message: String) -> Vec<ClaimAction> {
    attempt.phase = Phase::Aborted;
    attempt.abort_reason = Some(reason);
    let spot_id = attempt.spot_id;
    info!(spot_id, attempt_id = %attempt.attempt_id, ?reason, "claim aborted");
    vec![
        ClaimAction::DisarmReminder { spot_id },
        ClaimAction::Notify(Notice::for_spot(
            spot_id,
            NoticeKind::Aborted(reason),
            message,
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(600);

    fn book() -> ReservationBook {
        ReservationBook::new(WINDOW, Duration::from_secs(5))
    }

    fn terminal_notices(actions: &[ClaimAction]) -> Vec<NoticeKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                ClaimAction::Notify(n) if n.kind.is_terminal() => Some(n.kind),
                _ => None,
            })
            .collect()
    }

    /// Drive an attempt up to `Reserving`.
    fn reserving(book: &mut ReservationBook, spot: SpotId, now: Instant) -> AttemptKey {
        let (key, _) = book.begin(spot, now).unwrap();
        book.on_query_result(key, &QueryOutcome::Available, now);
        let actions = book.on_navigation_handoff(key, Ok(()), now);
        assert_eq!(
            actions,
            vec![ClaimAction::SendReserve {
                spot_id: spot,
                window: WINDOW
            }]
        );
        key
    }

    #[test]
    fn available_then_reserved_is_accepted_and_arms_reminder() {
        let mut book = book();
        let now = Instant::now();
        let (key, actions) = book.begin(1, now).unwrap();
        assert_eq!(actions, vec![ClaimAction::SendQuery { spot_id: 1 }]);

        let actions = book.on_query_result(key, &QueryOutcome::Available, now);
        assert_eq!(actions, vec![ClaimAction::LaunchNavigation { spot_id: 1 }]);
        assert_eq!(book.phase_of(key), Some(Phase::NavigationStarted));

        book.on_navigation_handoff(key, Ok(()), now);
        assert_eq!(book.phase_of(key), Some(Phase::Reserving));

        let actions = book.on_reserve_result(key, &ReserveOutcome::Reserved, now);
        assert!(actions.contains(&ClaimAction::ArmReminder {
            spot_id: 1,
            window: WINDOW
        }));
        assert_eq!(terminal_notices(&actions), vec![NoticeKind::Accepted]);
        assert_eq!(book.phase_of(key), Some(Phase::Accepted));
    }

    #[test]
    fn taken_after_available_query_is_rejected_without_reminder() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 2, now);
        let actions = book.on_reserve_result(key, &ReserveOutcome::Taken, now);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClaimAction::ArmReminder { .. })));
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::Rejected(RejectReason::Taken)]
        );
        assert_eq!(book.phase_of(key), Some(Phase::Rejected));
    }

    #[test]
    fn occupied_query_ends_without_navigation_or_reserve() {
        let mut book = book();
        let now = Instant::now();
        let (key, _) = book.begin(3, now).unwrap();
        let actions = book.on_query_result(key, &QueryOutcome::Occupied, now);
        assert!(!actions.iter().any(|a| matches!(
            a,
            ClaimAction::LaunchNavigation { .. } | ClaimAction::SendReserve { .. }
        )));
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::Rejected(RejectReason::Occupied)]
        );
        let reserved_query = book.begin(4, now).unwrap().0;
        book.on_query_result(reserved_query, &QueryOutcome::Reserved, now);
        assert_eq!(
            book.attempt(4).unwrap().reject_reason(),
            Some(RejectReason::AlreadyReserved)
        );
    }

    #[test]
    fn second_attempt_on_same_spot_is_refused() {
        let mut book = book();
        let now = Instant::now();
        book.begin(5, now).unwrap();
        assert_eq!(
            book.begin(5, now).unwrap_err(),
            ReservationError::AttemptInProgress(5)
        );
        assert!(book.begin(6, now).is_ok());
        assert_eq!(book.active_spots(), vec![5, 6]);
    }

    #[test]
    fn new_attempt_allowed_after_terminal() {
        let mut book = book();
        let now = Instant::now();
        let (first, _) = book.begin(5, now).unwrap();
        book.on_query_result(first, &QueryOutcome::Occupied, now);
        let (second, _) = book.begin(5, now).unwrap();
        assert_ne!(first.attempt_id, second.attempt_id);
        assert_eq!(book.phase_of(first), None);
        assert_eq!(book.phase_of(second), Some(Phase::Querying));
    }

    #[test]
    fn stale_attempt_results_are_ignored() {
        let mut book = book();
        let now = Instant::now();
        let (first, _) = book.begin(7, now).unwrap();
        book.cancel(7).unwrap();
        let (second, _) = book.begin(7, now).unwrap();
        let actions = book.on_query_result(first, &QueryOutcome::Occupied, now);
        assert!(actions.is_empty());
        assert_eq!(book.phase_of(second), Some(Phase::Querying));
    }

    #[test]
    fn window_elapsed_wins_over_late_reserved() {
        let mut book = book();
        let start = Instant::now();
        let key = reserving(&mut book, 8, start);
        let late = start + WINDOW + Duration::from_millis(1);
        let actions = book.on_reserve_result(key, &ReserveOutcome::Reserved, late);
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::TimedOut(TimeoutSource::Window)]
        );
        assert_eq!(book.phase_of(key), Some(Phase::TimedOut));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ClaimAction::ArmReminder { .. })));
    }

    #[test]
    fn tick_times_out_and_later_response_is_discarded() {
        let mut book = book();
        let start = Instant::now();
        let key = reserving(&mut book, 9, start);
        assert_eq!(book.next_deadline(), Some(start + WINDOW));
        assert!(book.tick(start + WINDOW - Duration::from_millis(1)).is_empty());

        let actions = book.tick(start + WINDOW);
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::TimedOut(TimeoutSource::Window)]
        );
        let after = book.on_reserve_result(
            key,
            &ReserveOutcome::Reserved,
            start + WINDOW + Duration::from_millis(1),
        );
        assert!(after.is_empty());
        assert_eq!(book.phase_of(key), Some(Phase::TimedOut));
        assert_eq!(book.next_deadline(), None);
    }

    #[test]
    fn terminal_phase_never_changes() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 10, now);
        book.on_reserve_result(key, &ReserveOutcome::Reserved, now);

        assert!(book.on_reserve_result(key, &ReserveOutcome::Taken, now).is_empty());
        assert!(book.on_query_result(key, &QueryOutcome::Occupied, now).is_empty());
        assert!(book.on_request_failed(key, "boom", now).is_empty());
        assert!(book.tick(now + WINDOW * 2).is_empty());
        assert!(book.on_channel_closed().is_empty());
        assert_eq!(book.cancel(10).unwrap_err(), ReservationError::UnknownAttempt(10));
        assert_eq!(book.phase_of(key), Some(Phase::Accepted));
    }

    #[test]
    fn prereserved_warns_once_and_keeps_polling() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 11, now);
        let first = book.on_reserve_result(key, &ReserveOutcome::Prereserved, now);
        assert!(first.iter().any(|a| matches!(
            a,
            ClaimAction::Notify(Notice {
                kind: NoticeKind::PrereservedWarning,
                ..
            })
        )));
        assert!(first.contains(&ClaimAction::PollReserve {
            spot_id: 11,
            after: Duration::from_secs(5)
        }));
        assert_eq!(book.phase_of(key), Some(Phase::Prereserved));

        let second = book.on_reserve_result(key, &ReserveOutcome::Prereserved, now);
        assert_eq!(
            second,
            vec![ClaimAction::PollReserve {
                spot_id: 11,
                after: Duration::from_secs(5)
            }]
        );
        book.on_reserve_result(key, &ReserveOutcome::Reserved, now);
        assert_eq!(book.phase_of(key), Some(Phase::Accepted));
    }

    #[test]
    fn poll_resends_only_while_prereserved() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 16, now);
        assert!(book.on_poll_elapsed(key, now).is_empty());
        book.on_reserve_result(key, &ReserveOutcome::Prereserved, now);
        assert_eq!(
            book.on_poll_elapsed(key, now + Duration::from_secs(5)),
            vec![ClaimAction::SendReserve {
                spot_id: 16,
                window: WINDOW
            }]
        );
        let actions = book.on_poll_elapsed(key, now + WINDOW);
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::TimedOut(TimeoutSource::Window)]
        );
    }

    #[test]
    fn preoccupied_and_unknown_statuses_reject() {
        let mut book = book();
        let now = Instant::now();
        let a = reserving(&mut book, 12, now);
        book.on_reserve_result(a, &ReserveOutcome::Preoccupied, now);
        assert_eq!(
            book.attempt(12).unwrap().reject_reason(),
            Some(RejectReason::Preoccupied)
        );

        let b = reserving(&mut book, 13, now);
        book.on_reserve_result(b, &ReserveOutcome::Unrecognized("held".into()), now);
        assert_eq!(
            book.attempt(13).unwrap().reject_reason(),
            Some(RejectReason::Unrecognized)
        );

        let c = reserving(&mut book, 14, now);
        book.on_reserve_result(c, &ReserveOutcome::TimeLimitReached, now);
        assert_eq!(
            book.attempt(14).unwrap().timeout_source(),
            Some(TimeoutSource::Server)
        );
    }

    #[test]
    fn handoff_failure_is_reported_but_claim_continues() {
        let mut book = book();
        let now = Instant::now();
        let (key, _) = book.begin(15, now).unwrap();
        book.on_query_result(key, &QueryOutcome::Available, now);
        let actions = book.on_navigation_handoff(
            key,
            Err(HandoffError::LaunchFailed("no maps app".into())),
            now,
        );
        assert!(matches!(
            &actions[0],
            ClaimAction::Notify(Notice {
                kind: NoticeKind::HandoffFailed,
                ..
            })
        ));
        assert!(matches!(actions[1], ClaimAction::SendReserve { spot_id: 15, .. }));
        assert_eq!(book.phase_of(key), Some(Phase::Reserving));
    }

    #[test]
    fn channel_close_aborts_every_live_attempt() {
        let mut book = book();
        let now = Instant::now();
        book.begin(20, now).unwrap();
        reserving(&mut book, 21, now);
        let done = book.begin(22, now).unwrap().0;
        book.on_query_result(done, &QueryOutcome::Occupied, now);

        let actions = book.on_channel_closed();
        assert_eq!(
            terminal_notices(&actions),
            vec![
                NoticeKind::Aborted(AbortReason::ChannelClosed),
                NoticeKind::Aborted(AbortReason::ChannelClosed)
            ]
        );
        assert!(book.active_spots().is_empty());
        assert_eq!(book.attempt(22).unwrap().phase(), Phase::Rejected);
    }

    #[test]
    fn cancel_while_reserving_releases_hold() {
        let mut book = book();
        let now = Instant::now();
        reserving(&mut book, 30, now);
        let actions = book.cancel(30).unwrap();
        assert_eq!(actions[0], ClaimAction::SendRelease { spot_id: 30 });
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::Aborted(AbortReason::UserCancelled)]
        );

        let (key, _) = book.begin(31, now).unwrap();
        let actions = book.cancel(31).unwrap();
        assert!(!actions.contains(&ClaimAction::SendRelease { spot_id: 31 }));
        assert_eq!(book.phase_of(key), Some(Phase::Aborted));
    }

    #[test]
    fn release_accepted_disarms_reminder() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 40, now);
        assert_eq!(book.release(40).unwrap_err(), ReservationError::NotAccepted(40));
        book.on_reserve_result(key, &ReserveOutcome::Reserved, now);
        let actions = book.release(40).unwrap();
        assert!(actions.contains(&ClaimAction::DisarmReminder { spot_id: 40 }));
        assert!(actions.contains(&ClaimAction::SendRelease { spot_id: 40 }));
        let attempt = book.attempt(40).unwrap();
        assert_eq!(attempt.phase(), Phase::Accepted);
        assert!(attempt.is_released());
        assert_eq!(book.release(40).unwrap_err(), ReservationError::NotAccepted(40));
        assert_eq!(book.prune_finished(), 1);
    }

    #[test]
    fn request_failure_aborts_once() {
        let mut book = book();
        let now = Instant::now();
        let (key, _) = book.begin(50, now).unwrap();
        let actions = book.on_request_failed(key, "request timed out", now);
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::Aborted(AbortReason::RequestFailed)]
        );
        assert!(book.on_request_failed(key, "again", now).is_empty());
    }

    #[test]
    fn reserve_failure_past_deadline_is_a_window_timeout() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 51, now);
        let actions = book.on_request_failed(key, "no answer", now + WINDOW);
        assert_eq!(
            terminal_notices(&actions),
            vec![NoticeKind::TimedOut(TimeoutSource::Window)]
        );
        assert_eq!(book.attempt(51).unwrap().timeout_source(), Some(TimeoutSource::Window));
    }

    #[test]
    fn held_spot_cannot_be_claimed_again() {
        let mut book = book();
        let now = Instant::now();
        let key = reserving(&mut book, 52, now);
        book.on_reserve_result(key, &ReserveOutcome::Reserved, now);
        assert_eq!(book.begin(52, now).unwrap_err(), ReservationError::AlreadyHeld(52));
        assert!(book.attempt(52).unwrap().holds_reservation());

        book.release(52).unwrap();
        assert!(book.begin(52, now).is_ok());
    }

    #[test]
    fn prune_keeps_live_and_accepted() {
        let mut book = book();
        let now = Instant::now();
        let accepted = reserving(&mut book, 60, now);
        book.on_reserve_result(accepted, &ReserveOutcome::Reserved, now);
        let rejected = book.begin(61, now).unwrap().0;
        book.on_query_result(rejected, &QueryOutcome::Occupied, now);
        book.begin(62, now).unwrap();

        assert_eq!(book.prune_finished(), 1);
        assert!(book.attempt(60).is_some());
        assert!(book.attempt(61).is_none());
        assert!(book.attempt(62).is_some());
    }
}
