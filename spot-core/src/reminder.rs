//! Reservation reminders: one pending "your window is closing" alert per spot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::SpotId;

/// Default head start given to the driver before the window closes.
pub const DEFAULT_REMINDER_LEAD: Duration = Duration::from_secs(60);

/// Opaque handle for a scheduled reminder.
pub type TimerHandle = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Reminder {
    pub handle: TimerHandle,
    pub spot_id: SpotId,
    pub fire_at: Instant,
    pub message: String,
}

/// Pending reminders. Each fires at most once; cancelled ones never fire.
#[derive(Debug)]
pub struct ReminderBook {
    pending: HashMap<TimerHandle, Reminder>,
    next_handle: TimerHandle,
    lead: Duration,
}

impl ReminderBook {
    pub fn new(lead: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            next_handle: 1,
            lead,
        }
    }

    /// When a reminder for a window of `window` armed at `now` fires.
    /// Lead is clamped so a short window still fires at or after `now`.
    pub fn fire_time(&self, now: Instant, window: Duration) -> Instant {
        now + window.saturating_sub(self.lead)
    }

    /// Schedule a reminder for `spot_id`. Replaces any reminder already pending for that spot.
    pub fn arm(&mut self, spot_id: SpotId, window: Duration, now: Instant) -> TimerHandle {
        self.cancel_spot(spot_id);
        let handle = self.next_handle;
        self.next_handle += 1;
        let left = window.min(self.lead).as_secs().div_ceil(60).max(1);
        let reminder = Reminder {
            handle,
            spot_id,
            fire_at: self.fire_time(now, window),
            message: format!(
                "Your reservation for spot {spot_id} ends in about {left} minute{}.",
                if left == 1 { "" } else { "s" }
            ),
        };
        tracing::debug!(spot_id, handle, "reminder armed");
        self.pending.insert(handle, reminder);
        handle
    }

    /// Cancel by handle. Unknown or already-fired handles are a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle).is_some()
    }

    /// Cancel whatever reminder is pending for `spot_id`.
    pub fn cancel_spot(&mut self, spot_id: SpotId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|_, r| r.spot_id != spot_id);
        before != self.pending.len()
    }

    /// Remove and return every reminder due at `now`, earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<Reminder> {
        let handles: Vec<TimerHandle> = self
            .pending
            .values()
            .filter(|r| r.fire_at <= now)
            .map(|r| r.handle)
            .collect();
        let mut fired: Vec<Reminder> = handles
            .into_iter()
            .filter_map(|h| self.pending.remove(&h))
            .collect();
        fired.sort_by_key(|r| (r.fire_at, r.handle));
        fired
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|r| r.fire_at).min()
    }

    pub fn pending_for(&self, spot_id: SpotId) -> Option<&Reminder> {
        self.pending.values().find(|r| r.spot_id == spot_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for ReminderBook {
    fn default() -> Self {
        Self::new(DEFAULT_REMINDER_LEAD)
    }
}
