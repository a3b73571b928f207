mod availability;
mod error;
mod lifecycle;
mod transaction;
pub mod validate;

pub use availability::{conflicts, find_conflict};
pub use error::BookingError;
pub use lifecycle::{can_transition, initial_status, Transition, TransitionKind};

use chrono::NaiveDate;

use crate::config::BookingPolicy;
use crate::fanout::Fanout;
use crate::model::*;
use crate::store::Store;

/// The booking core: availability, atomic writes and the reservation
/// lifecycle over a [`Store`], with every committed change handed to the
/// [`Fanout`].
pub struct Bookings<S: Store> {
    store: S,
    policy: BookingPolicy,
    fanout: Fanout,
}

impl<S: Store> Bookings<S> {
    pub fn new(store: S, policy: BookingPolicy, fanout: Fanout) -> Self {
        Self {
            store,
            policy,
            fanout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub(crate) fn resolve_buffer(&self, requested: Option<u16>) -> Result<u16, BookingError> {
        validate::buffer(requested.unwrap_or(self.policy.default_buffer_minutes))
    }

    // ── Tables ───────────────────────────────────────────────

    /// Create or replace a table. Staff and admin only.
    pub async fn upsert_table(&self, caller: &Caller, table: Table) -> Result<Table, BookingError> {
        require_privileged(caller)?;
        if table.capacity == 0 {
            return Err(BookingError::Validation("table capacity must be positive".into()));
        }
        let table = self.store.put_table(table).await?;
        tracing::info!(
            "table {} (#{}) saved: capacity {}, {:?}",
            table.id,
            table.number,
            table.capacity,
            table.status
        );
        self.fanout.publish_table(&table);
        Ok(table)
    }

    pub async fn set_table_status(
        &self,
        caller: &Caller,
        table_id: TableId,
        status: TableStatus,
    ) -> Result<Table, BookingError> {
        require_privileged(caller)?;
        let mut table = self
            .store
            .get_table(table_id)
            .await?
            .ok_or_else(|| BookingError::table_not_found(table_id))?;
        if table.status == status {
            return Ok(table);
        }
        table.status = status;
        let table = self.store.put_table(table).await?;
        tracing::info!("table {table_id} marked {status:?} by user {}", caller.id);
        self.fanout.publish_table(&table);
        Ok(table)
    }

    pub async fn list_tables(&self) -> Result<Vec<Table>, BookingError> {
        Ok(self.store.list_tables().await?)
    }

    // ── Reads for pull-based refresh ─────────────────────────

    pub async fn get_reservation(&self, caller: &Caller, id: ReservationId) -> Result<Reservation, BookingError> {
        self.load_managed(caller, id).await
    }

    pub async fn user_reservations(
        &self,
        caller: &Caller,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, BookingError> {
        Ok(self.store.user_reservations(caller.id, date).await?)
    }

    /// Every reservation on a table and day, any status. Staff and admin only.
    pub async fn table_reservations(
        &self,
        caller: &Caller,
        table_id: TableId,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, BookingError> {
        require_privileged(caller)?;
        use ReservationStatus::*;
        Ok(self
            .store
            .query_reservations(table_id, date, &[Pending, Confirmed, Cancelled, Completed])
            .await?)
    }
}

fn require_privileged(caller: &Caller) -> Result<(), BookingError> {
    if caller.is_privileged() {
        Ok(())
    } else {
        Err(BookingError::Forbidden("staff or admin role required"))
    }
}
