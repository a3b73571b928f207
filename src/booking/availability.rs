use chrono::{NaiveDate, NaiveTime};

use crate::model::*;
use crate::store::Store;

use super::{validate, BookingError, Bookings};

// ── Conflict rule ─────────────────────────────────────────────────

/// Whether a request for `query` with `buffer` collides with `existing`.
///
/// The two windows must be separated by at least the larger of the two
/// buffers: the existing window is grown by that gap on both sides and
/// compared with the raw requested window. With a zero gap this is plain
/// half-open overlap, so back-to-back bookings are allowed.
pub fn conflicts(query: &Window, buffer: u16, existing: &Reservation) -> bool {
    if !existing.status.is_active() {
        return false;
    }
    let gap = buffer.max(existing.buffer_minutes);
    existing.window().expand(gap).overlaps(query)
}

/// First active reservation in `existing` colliding with `query`, skipping
/// `exclude` (the reservation being modified).
pub fn find_conflict<'a>(
    existing: &'a [Reservation],
    query: &Window,
    buffer: u16,
    exclude: Option<ReservationId>,
) -> Option<&'a Reservation> {
    existing
        .iter()
        .filter(|r| Some(r.id) != exclude)
        .find(|r| conflicts(query, buffer, r))
}

pub(super) fn conflict_error(hit: &Reservation) -> BookingError {
    BookingError::Conflict {
        reservation_id: hit.id,
        start: hit.start,
        end: hit.end,
    }
}

/// Reject tables that cannot seat the party right now.
pub(super) fn ensure_bookable(table: &Table, party_size: u32, max_party_size: u32) -> Result<(), BookingError> {
    if table.status != TableStatus::Available {
        return Err(BookingError::Capacity(format!(
            "table {} is not available for booking",
            table.number
        )));
    }
    ensure_seats(table, party_size, max_party_size)
}

pub(super) fn ensure_seats(table: &Table, party_size: u32, max_party_size: u32) -> Result<(), BookingError> {
    if party_size > table.capacity {
        return Err(BookingError::Capacity(format!(
            "party of {party_size} exceeds capacity {} of table {}",
            table.capacity, table.number
        )));
    }
    if party_size > max_party_size {
        return Err(BookingError::Capacity(format!(
            "party of {party_size} exceeds the maximum of {max_party_size}"
        )));
    }
    Ok(())
}

// ── Resolver ─────────────────────────────────────────────────────

impl<S: Store> Bookings<S> {
    /// The active reservation blocking `[start, end)` on the table, if any.
    pub async fn find_conflict(
        &self,
        table_id: TableId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        buffer: u16,
        exclude: Option<ReservationId>,
    ) -> Result<Option<Reservation>, BookingError> {
        let window = Window::from_times(start, end);
        let active = self
            .store
            .query_reservations(table_id, date, &ReservationStatus::ACTIVE)
            .await?;
        Ok(find_conflict(&active, &window, buffer, exclude).cloned())
    }

    pub async fn is_available(
        &self,
        table_id: TableId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        buffer: u16,
        exclude: Option<ReservationId>,
    ) -> Result<bool, BookingError> {
        Ok(self
            .find_conflict(table_id, date, start, end, buffer, exclude)
            .await?
            .is_none())
    }

    /// Tables that are in service, seat the party, and are free for the
    /// window. Smallest adequate table first.
    pub async fn list_available_tables(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        party_size: Option<u32>,
        buffer: u16,
    ) -> Result<Vec<Table>, BookingError> {
        let mut candidates: Vec<Table> = self
            .store
            .list_tables()
            .await?
            .into_iter()
            .filter(|t| t.status == TableStatus::Available)
            .filter(|t| party_size.is_none_or(|p| t.capacity >= p))
            .collect();
        candidates.sort_by_key(|t| (t.capacity, t.number, t.id));

        let mut free = Vec::with_capacity(candidates.len());
        for table in candidates {
            if self.is_available(table.id, date, start, end, buffer, None).await? {
                free.push(table);
            }
        }
        Ok(free)
    }

    /// Caller-facing availability query: validates input and applies the
    /// default buffer.
    pub async fn check_availability(
        &self,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        party_size: Option<u32>,
        buffer: Option<u16>,
    ) -> Result<Vec<Table>, BookingError> {
        validate::window(start, end)?;
        if let Some(p) = party_size {
            validate::party_size(p)?;
        }
        let buffer = self.resolve_buffer(buffer)?;
        self.list_available_tables(date, start, end, party_size, buffer).await
    }
}
