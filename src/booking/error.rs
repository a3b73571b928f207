use chrono::NaiveTime;

use crate::model::*;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("capacity: {0}")]
    Capacity(String),
    #[error("conflict with reservation {reservation_id} ({start}-{end})")]
    Conflict {
        reservation_id: ReservationId,
        start: NaiveTime,
        end: NaiveTime,
    },
    #[error("limit exceeded: {active} active reservations on that day (max {limit})")]
    Limit { active: usize, limit: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("storage unavailable, retry: {0}")]
    Transient(String),
}

impl BookingError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::Capacity(_) => "capacity",
            BookingError::Conflict { .. } => "conflict",
            BookingError::Limit { .. } => "limit",
            BookingError::NotFound(_) => "not_found",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::InvalidTransition { .. } => "invalid_transition",
            BookingError::Transient(_) => "transient",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::Transient(_))
    }

    pub(crate) fn reservation_not_found(id: ReservationId) -> Self {
        BookingError::NotFound(format!("reservation {id}"))
    }

    pub(crate) fn table_not_found(id: TableId) -> Self {
        BookingError::NotFound(format!("table {id}"))
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingReservation(id) => BookingError::reservation_not_found(id),
            StoreError::MissingTable(id) => BookingError::table_not_found(id),
            other => {
                if !other.is_transient() {
                    // Out-of-scope writes are a locking bug, not load
                    tracing::error!("store rejected write: {other}");
                }
                BookingError::Transient(other.to_string())
            }
        }
    }
}
