use ulid::Ulid;

use crate::model::{format_hhmm, Minute};

#[derive(Debug)]
pub enum SchedulerError {
    /// Unknown resource or booking id.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Slot natural key does not resolve on the resource.
    UnknownSlot { weekday: u8, start: Minute },
    /// Malformed availability definition, rejected at definition time.
    InvalidWindow(&'static str),
    /// Requested time not covered by any availability window.
    OutsideAvailability,
    /// All units of the slot's capacity are taken on that date.
    SlotFull { capacity: u32 },
    /// Overlaps an existing confirmed booking (carries the blocking id).
    SlotConflict(Ulid),
    /// Slot key names a weekday other than the requested date's.
    WeekdayMismatch { key_weekday: u8, date_weekday: u8 },
    /// Resource is deactivated; history stays, new bookings don't.
    ResourceInactive(Ulid),
    /// Cancel attempted by someone who is neither owner nor building manager.
    Forbidden,
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    /// Ledger I/O failure — retryable, never swallowed.
    Storage(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::NotFound(id) => write!(f, "not found: {id}"),
            SchedulerError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            SchedulerError::UnknownSlot { weekday, start } => {
                write!(f, "no slot at weekday {weekday} {}", format_hhmm(*start))
            }
            SchedulerError::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
            SchedulerError::OutsideAvailability => {
                write!(f, "requested time is outside availability")
            }
            SchedulerError::SlotFull { capacity } => {
                write!(f, "slot full: all {capacity} spots taken")
            }
            SchedulerError::SlotConflict(id) => write!(f, "conflicts with booking: {id}"),
            SchedulerError::WeekdayMismatch { key_weekday, date_weekday } => {
                write!(f, "slot weekday {key_weekday} does not match date weekday {date_weekday}")
            }
            SchedulerError::ResourceInactive(id) => write!(f, "resource inactive: {id}"),
            SchedulerError::Forbidden => write!(f, "not permitted"),
            SchedulerError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            SchedulerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SchedulerError::Storage(e) => write!(f, "ledger error: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Expected business rejections are returned, counted, and logged at
    /// debug only; everything else is a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SchedulerError::OutsideAvailability
                | SchedulerError::SlotFull { .. }
                | SchedulerError::SlotConflict(_)
        )
    }
}
