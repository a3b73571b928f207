use chrono::NaiveDateTime;

use crate::config::BookingPolicy;
use crate::model::*;
use crate::store::{Store, StoreTx};

use super::{BookingError, Bookings};

/// What a committed change did to a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Created,
    /// Table, time, party or notes changed; status unchanged.
    Updated,
    StatusChanged,
    Deleted,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Created => "created",
            TransitionKind::Updated => "updated",
            TransitionKind::StatusChanged => "status_changed",
            TransitionKind::Deleted => "deleted",
        }
    }
}

/// One committed lifecycle step, handed to the fanout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub before: Option<Reservation>,
    /// Row as committed; for `Deleted`, the row as it was last stored.
    pub after: Reservation,
}

impl Transition {
    pub fn created(row: Reservation) -> Self {
        Self {
            kind: TransitionKind::Created,
            before: None,
            after: row,
        }
    }

    pub fn updated(before: Reservation, after: Reservation) -> Self {
        Self {
            kind: TransitionKind::Updated,
            before: Some(before),
            after,
        }
    }

    pub fn status_changed(before: Reservation, after: Reservation) -> Self {
        Self {
            kind: TransitionKind::StatusChanged,
            before: Some(before),
            after,
        }
    }

    pub fn deleted(row: Reservation) -> Self {
        Self {
            kind: TransitionKind::Deleted,
            before: Some(row.clone()),
            after: row,
        }
    }

    pub fn old_status(&self) -> Option<ReservationStatus> {
        self.before.as_ref().map(|r| r.status)
    }

    pub fn new_status(&self) -> ReservationStatus {
        self.after.status
    }
}

pub fn initial_status(policy: &BookingPolicy) -> ReservationStatus {
    if policy.auto_confirm {
        ReservationStatus::Confirmed
    } else {
        ReservationStatus::Pending
    }
}

/// Edges of the status graph. Same-status requests are handled by callers
/// as no-ops and never reach here.
pub fn can_transition(from: ReservationStatus, to: ReservationStatus) -> bool {
    use ReservationStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed) | (Pending | Confirmed, Cancelled) | (Pending | Confirmed, Completed)
    )
}

/// Owners may only cancel; every other move needs staff or admin.
pub fn authorize(caller: &Caller, row: &Reservation, to: ReservationStatus) -> Result<(), BookingError> {
    if caller.is_privileged() {
        return Ok(());
    }
    if row.user_id != caller.id {
        return Err(BookingError::Forbidden("not the owner of this reservation"));
    }
    if to != ReservationStatus::Cancelled {
        return Err(BookingError::Forbidden("only staff may change this status"));
    }
    Ok(())
}

impl<S: Store> Bookings<S> {
    /// Move a reservation to `to`. Requesting the current status succeeds
    /// without committing anything, which makes repeated cancels harmless.
    pub async fn set_reservation_status(
        &self,
        caller: &Caller,
        id: ReservationId,
        to: ReservationStatus,
    ) -> Result<Reservation, BookingError> {
        let current = self.load_managed(caller, id).await?;
        authorize(caller, &current, to)?;

        let (mut tx, before) = self.lock_reservation(&current, &[]).await?;
        if before.status == to {
            tx.rollback().await;
            tracing::debug!("reservation {id} already {to}");
            return Ok(before);
        }
        if !can_transition(before.status, to) {
            tx.rollback().await;
            return Err(BookingError::InvalidTransition {
                from: before.status,
                to,
            });
        }

        let mut row = before.clone();
        row.status = to;
        let after = match tx.update_reservation(row).await {
            Ok(after) => after,
            Err(e) => {
                tx.rollback().await;
                return Err(e.into());
            }
        };
        tracing::info!(
            "reservation {id} {} -> {} by user {}",
            before.status,
            after.status,
            caller.id
        );
        self.finish(tx, Transition::status_changed(before, after)).await
    }

    /// Soft-cancel. Cancelling a cancelled reservation is a successful no-op.
    pub async fn cancel_reservation(&self, caller: &Caller, id: ReservationId) -> Result<Reservation, BookingError> {
        self.set_reservation_status(caller, id, ReservationStatus::Cancelled).await
    }

    /// Complete every active reservation that ended at or before `now`.
    /// Returns how many were completed; individual failures are logged.
    pub async fn sweep_finished(&self, now: NaiveDateTime) -> Result<usize, BookingError> {
        let due = self.store.active_ending_before(now).await?;
        let system = Caller::system();
        let mut completed = 0;
        for row in due {
            match self
                .set_reservation_status(&system, row.id, ReservationStatus::Completed)
                .await
            {
                Ok(_) => completed += 1,
                // May have been cancelled or moved meanwhile
                Err(e) => tracing::debug!("sweep skip {}: {e}", row.id),
            }
        }
        Ok(completed)
    }
}
