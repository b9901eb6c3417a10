//! SpotMe soft-reservation core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod cache;
pub mod core;
pub mod ffi;
pub mod navigation;
pub mod protocol;
pub mod reminder;
pub mod reservation;
pub mod wire;

pub use cache::{CacheSnapshot, Congestion, CongestionLevel, LotRecord, RefreshSummary, SpotCache, SpotRecord};
pub use crate::core::{CoreConfig, HostAction, Outbound, SpotCore};
pub use navigation::{HandoffError, NavigationRequest, Platform};
pub use protocol::{
    Coordinate, LotId, LotSnapshot, OpTag, ProtocolError, QueryOutcome, Request, ReserveOutcome, Response,
    SpotId, SpotSnapshot, SpotStatus,
};
pub use reminder::{Reminder, ReminderBook, TimerHandle};
pub use reservation::{
    AbortReason, AttemptKey, Notice, NoticeKind, Phase, RejectReason, ReservationAttempt, ReservationError,
    TimeoutSource,
};
pub use wire::{decode_message, encode_message, FrameDecodeError, FrameEncodeError};
