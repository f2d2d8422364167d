use ulid::Ulid;

use crate::model::{ReservationStatus, SlotKey};

#[derive(Debug, PartialEq)]
pub enum ParkError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    SlotNotFound(SlotKey),
    DuplicateSlot(SlotKey),
    /// Commit-time overlap with an existing occupying reservation.
    Conflict(Ulid),
    /// No free slot matched the zone, vehicle, and window of the request.
    ZoneFull,
    /// A directly requested slot does not accept the draft's vehicle type.
    VehicleMismatch(SlotKey),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    InvalidSchedule(&'static str),
    ScheduleConflict,
    InvalidGranularity(u32),
    InvalidSpan,
    LimitExceeded(&'static str),
    WalError(String),
}

impl ParkError {
    /// True for the one error an allocator retry can resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ParkError::Conflict(_))
    }
}

impl std::fmt::Display for ParkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParkError::NotFound(id) => write!(f, "not found: {id}"),
            ParkError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            ParkError::SlotNotFound(key) => write!(f, "slot not found: {}", key.label()),
            ParkError::DuplicateSlot(key) => {
                write!(f, "slot already registered: {}", key.label())
            }
            ParkError::Conflict(id) => write!(f, "overlaps reservation: {id}"),
            ParkError::ZoneFull => write!(f, "no free slot for the requested window"),
            ParkError::VehicleMismatch(key) => {
                write!(f, "slot {} does not accept this vehicle type", key.label())
            }
            ParkError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            ParkError::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
            ParkError::ScheduleConflict => {
                write!(f, "schedule rule overlaps an existing rule's weekdays")
            }
            ParkError::InvalidGranularity(min) => {
                write!(f, "invalid cell granularity: {min} minutes")
            }
            ParkError::InvalidSpan => write!(f, "window end precedes start"),
            ParkError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            ParkError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for ParkError {}
