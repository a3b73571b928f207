//! Storage collaborator contract.
//!
//! The booking core never touches storage except through these traits. Any
//! transactional store can back them as long as `begin_atomic` serializes
//! every unit that names an overlapping scope: advisory locks, row locks, or
//! a single writer per scope all satisfy the contract.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out waiting for lock on {0:?}")]
    LockTimeout(ScopeKey),
    #[error("write outside the locked scopes: {0:?}")]
    OutOfScope(SlotKey),
    #[error("reservation {0} not found")]
    MissingReservation(ReservationId),
    #[error("table {0} not found")]
    MissingTable(TableId),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl StoreError {
    /// Whether retrying the same unit may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_) | StoreError::Wal(_))
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open an atomic unit holding exclusive access to `scopes` until the
    /// returned handle is dropped.
    async fn begin_atomic(&self, scopes: &[ScopeKey]) -> Result<Self::Tx, StoreError>;

    async fn get_table(&self, id: TableId) -> Result<Option<Table>, StoreError>;

    async fn list_tables(&self) -> Result<Vec<Table>, StoreError>;

    async fn put_table(&self, table: Table) -> Result<Table, StoreError>;

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    /// Reservations on `(table_id, date)` whose status is in `statuses`.
    async fn query_reservations(
        &self,
        table_id: TableId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<Reservation>, StoreError>;

    /// A user's reservations, optionally limited to one date.
    async fn user_reservations(
        &self,
        user_id: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Active reservations whose end lies at or before `cutoff`.
    async fn active_ending_before(&self, cutoff: NaiveDateTime) -> Result<Vec<Reservation>, StoreError>;
}

/// Handle on one atomic unit. Dropping it without `commit` rolls back.
///
/// Reads observe committed state; staged writes become visible to everyone
/// at once when `commit` returns.
#[async_trait]
pub trait StoreTx: Send {
    async fn get_table(&mut self, id: TableId) -> Result<Option<Table>, StoreError>;

    async fn get_reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    async fn query_reservations(
        &mut self,
        table_id: TableId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn count_user_reservations(
        &mut self,
        user_id: UserId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<usize, StoreError>;

    async fn insert_reservation(&mut self, draft: ReservationDraft) -> Result<Reservation, StoreError>;

    async fn update_reservation(&mut self, row: Reservation) -> Result<Reservation, StoreError>;

    async fn delete_reservation(&mut self, id: ReservationId) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self);
}
