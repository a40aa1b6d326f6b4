use thiserror::Error;

use crate::model::{Hour, Reservation, ReservationId};
use crate::settings::SettingsError;
use crate::store::StoreError;

/// Why a candidate reservation was refused. The first failing check wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required fields: {}", .missing.join(", "))]
    IncompleteFields { missing: Vec<&'static str> },
    #[error("invalid time range [{start}, {end})")]
    InvalidTimeRange { start: Hour, end: Hour },
    #[error("{hours} hours exceeds the {max} hour limit")]
    DurationExceeded { hours: Hour, max: u32 },
    #[error(
        "overlaps reservation {} for apartment {} on {} [{}, {})",
        .0.id, .0.apartment, .0.date, .0.start_hour, .0.end_hour
    )]
    OverlapConflict(Box<Reservation>),
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),
    #[error("gave up after {attempts} concurrent commit attempts")]
    ConcurrentConflict { attempts: u32 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl From<SettingsError> for BookingError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Store(e) => BookingError::StoreUnavailable(e),
            SettingsError::Invalid(msg) => BookingError::StoreUnavailable(StoreError::Codec(msg.into())),
        }
    }
}

impl From<serde_json::Error> for BookingError {
    fn from(e: serde_json::Error) -> Self {
        BookingError::StoreUnavailable(e.into())
    }
}

impl BookingError {
    /// Stable machine-readable code, one per failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Invalid(ValidationError::IncompleteFields { .. }) => "incomplete_fields",
            BookingError::Invalid(ValidationError::InvalidTimeRange { .. }) => "invalid_time_range",
            BookingError::Invalid(ValidationError::DurationExceeded { .. }) => "duration_exceeded",
            BookingError::Invalid(ValidationError::OverlapConflict(_)) => "overlap_conflict",
            BookingError::NotFound(_) => "not_found",
            BookingError::ConcurrentConflict { .. } => "concurrent_conflict",
            BookingError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// `true` when the caller's input was at fault rather than the service.
    pub fn is_user_error(&self) -> bool {
        matches!(self, BookingError::Invalid(_) | BookingError::NotFound(_))
    }

    /// The reservation that blocked the request, if any.
    pub fn conflict(&self) -> Option<&Reservation> {
        match self {
            BookingError::Invalid(ValidationError::OverlapConflict(r)) => Some(r),
            _ => None,
        }
    }
}
