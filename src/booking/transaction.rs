use std::time::Instant;

use crate::model::*;
use crate::observability;
use crate::store::{Store, StoreTx};

use super::availability::{conflict_error, ensure_bookable, ensure_seats, find_conflict};
use super::lifecycle::{initial_status, Transition};
use super::{validate, BookingError, Bookings};

enum Created {
    Inserted(Reservation),
    /// The same request was already committed (client retry).
    Existing(Reservation),
}

impl<S: Store> Bookings<S> {
    /// Book a table. Table check, conflict check, daily quota and insert run
    /// as one atomic unit on `(table, date)` and `(user, date)`.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        request: ReservationRequest,
    ) -> Result<Reservation, BookingError> {
        validate::window(request.start, request.end)?;
        validate::party_size(request.party_size)?;
        let buffer_minutes = self.resolve_buffer(request.buffer_minutes)?;
        let draft = ReservationDraft {
            user_id: caller.id,
            table_id: request.table_id,
            date: request.date,
            start: request.start,
            end: request.end,
            party_size: request.party_size,
            status: initial_status(&self.policy),
            notes: validate::notes(request.notes)?,
            buffer_minutes,
        };

        let started = Instant::now();
        let scopes = [
            ScopeKey::Slot(draft.slot()),
            ScopeKey::UserDay(draft.user_id, draft.date),
        ];
        let mut tx = self.store.begin_atomic(&scopes).await?;
        let outcome = self.create_in(&mut tx, draft).await;
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS, "op" => "create")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Created::Inserted(row)) => {
                tracing::info!(
                    "reservation {} created: table {} on {} {}-{} for user {}",
                    row.id,
                    row.table_id,
                    row.date,
                    row.start,
                    row.end,
                    row.user_id
                );
                self.finish(tx, Transition::created(row)).await
            }
            Ok(Created::Existing(row)) => {
                tx.rollback().await;
                tracing::debug!("reservation {} replayed for user {}", row.id, row.user_id);
                Ok(row)
            }
            Err(e) => {
                tx.rollback().await;
                self.record_rejection("create", &e);
                Err(e)
            }
        }
    }

    async fn create_in(&self, tx: &mut S::Tx, draft: ReservationDraft) -> Result<Created, BookingError> {
        let table = tx.get_table(draft.table_id).await?.ok_or_else(|| {
            BookingError::Capacity(format!("table {} does not exist", draft.table_id))
        })?;
        ensure_bookable(&table, draft.party_size, self.policy.max_party_size)?;

        let active = tx
            .query_reservations(draft.table_id, draft.date, &ReservationStatus::ACTIVE)
            .await?;
        if let Some(existing) = active.iter().find(|r| r.same_request(&draft)) {
            return Ok(Created::Existing(existing.clone()));
        }

        let window = Window::from_times(draft.start, draft.end);
        if let Some(hit) = find_conflict(&active, &window, draft.buffer_minutes, None) {
            return Err(conflict_error(hit));
        }

        let held = tx
            .count_user_reservations(draft.user_id, draft.date, &ReservationStatus::ACTIVE)
            .await?;
        if held >= self.policy.daily_limit {
            return Err(BookingError::Limit {
                active: held,
                limit: self.policy.daily_limit,
            });
        }

        Ok(Created::Inserted(tx.insert_reservation(draft).await?))
    }

    /// Change table, date, time, party size or notes. Any schedule change is
    /// re-checked against other reservations, excluding this one, inside the
    /// same atomic unit as the write.
    pub async fn update_reservation(
        &self,
        caller: &Caller,
        id: ReservationId,
        patch: ReservationPatch,
        buffer: Option<u16>,
    ) -> Result<Reservation, BookingError> {
        let buffer = buffer.map(validate::buffer).transpose()?;
        if let Some(p) = patch.party_size {
            validate::party_size(p)?;
        }
        let current = self.load_managed(caller, id).await?;

        let target = SlotKey {
            table_id: patch.table_id.unwrap_or(current.table_id),
            date: patch.date.unwrap_or(current.date),
        };
        let extra = [
            ScopeKey::Slot(target),
            ScopeKey::UserDay(current.user_id, target.date),
        ];

        let started = Instant::now();
        let (mut tx, before) = self.lock_reservation(&current, &extra).await?;
        let outcome = self.update_in(&mut tx, &before, patch, buffer).await;
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS, "op" => "update")
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Some(after)) => {
                tracing::info!("reservation {id} updated by user {}", caller.id);
                self.finish(tx, Transition::updated(before, after)).await
            }
            Ok(None) => {
                tx.rollback().await;
                Ok(before)
            }
            Err(e) => {
                tx.rollback().await;
                self.record_rejection("update", &e);
                Err(e)
            }
        }
    }

    /// Returns `None` when the patch changes nothing.
    async fn update_in(
        &self,
        tx: &mut S::Tx,
        before: &Reservation,
        patch: ReservationPatch,
        buffer: Option<u16>,
    ) -> Result<Option<Reservation>, BookingError> {
        if before.status.is_terminal() {
            return Err(BookingError::Validation(format!(
                "reservation {} is {} and can no longer be changed",
                before.id, before.status
            )));
        }

        let mut merged = before.clone();
        if let Some(table_id) = patch.table_id {
            merged.table_id = table_id;
        }
        if let Some(date) = patch.date {
            merged.date = date;
        }
        if let Some(start) = patch.start {
            merged.start = start;
        }
        if let Some(end) = patch.end {
            merged.end = end;
        }
        if let Some(party_size) = patch.party_size {
            merged.party_size = party_size;
        }
        if patch.notes.is_some() {
            merged.notes = validate::notes(patch.notes)?;
        }
        if let Some(buffer) = buffer {
            merged.buffer_minutes = buffer;
        }
        if merged == *before {
            return Ok(None);
        }
        let window = validate::window(merged.start, merged.end)?;

        let table_changed = merged.table_id != before.table_id;
        if table_changed || merged.party_size != before.party_size {
            let table = tx.get_table(merged.table_id).await?.ok_or_else(|| {
                BookingError::Capacity(format!("table {} does not exist", merged.table_id))
            })?;
            if table_changed {
                ensure_bookable(&table, merged.party_size, self.policy.max_party_size)?;
            } else {
                ensure_seats(&table, merged.party_size, self.policy.max_party_size)?;
            }
        }

        let rescheduled = table_changed
            || merged.date != before.date
            || merged.start != before.start
            || merged.end != before.end
            || merged.buffer_minutes != before.buffer_minutes;
        if rescheduled {
            let active = tx
                .query_reservations(merged.table_id, merged.date, &ReservationStatus::ACTIVE)
                .await?;
            if let Some(hit) = find_conflict(&active, &window, merged.buffer_minutes, Some(merged.id)) {
                return Err(conflict_error(hit));
            }
        }

        if merged.date != before.date {
            let held = tx
                .count_user_reservations(merged.user_id, merged.date, &ReservationStatus::ACTIVE)
                .await?;
            if held >= self.policy.daily_limit {
                return Err(BookingError::Limit {
                    active: held,
                    limit: self.policy.daily_limit,
                });
            }
        }

        Ok(Some(tx.update_reservation(merged).await?))
    }

    /// Hard delete, open to the owner only and only before completion.
    pub async fn delete_reservation(&self, caller: &Caller, id: ReservationId) -> Result<(), BookingError> {
        let current = self.load_managed(caller, id).await?;
        if current.user_id != caller.id {
            return Err(BookingError::Forbidden("only the owner may delete a reservation"));
        }
        let (mut tx, before) = self.lock_reservation(&current, &[]).await?;
        if before.status == ReservationStatus::Completed {
            tx.rollback().await;
            return Err(BookingError::Forbidden("completed reservations cannot be deleted"));
        }
        if let Err(e) = tx.delete_reservation(id).await {
            tx.rollback().await;
            return Err(e.into());
        }
        tracing::info!("reservation {id} deleted by user {}", caller.id);
        self.finish(tx, Transition::deleted(before)).await?;
        Ok(())
    }

    // ── Shared steps ─────────────────────────────────────────

    /// Load a reservation the caller owns or, for staff, any reservation.
    pub(super) async fn load_managed(&self, caller: &Caller, id: ReservationId) -> Result<Reservation, BookingError> {
        let row = self
            .store
            .get_reservation(id)
            .await?
            .ok_or_else(|| BookingError::reservation_not_found(id))?;
        if !caller.may_manage(&row) {
            return Err(BookingError::Forbidden("not the owner of this reservation"));
        }
        Ok(row)
    }

    /// Open an atomic unit over the reservation's slot plus `extra` scopes,
    /// then re-read the row under the lock.
    pub(super) async fn lock_reservation(
        &self,
        current: &Reservation,
        extra: &[ScopeKey],
    ) -> Result<(S::Tx, Reservation), BookingError> {
        let mut scopes = Vec::with_capacity(extra.len() + 1);
        scopes.push(ScopeKey::Slot(current.slot()));
        scopes.extend_from_slice(extra);

        let mut tx = self.store.begin_atomic(&scopes).await?;
        let row = tx
            .get_reservation(current.id)
            .await?
            .ok_or_else(|| BookingError::reservation_not_found(current.id))?;
        if row.slot() != current.slot() {
            // Moved by a concurrent update before we got the lock.
            return Err(BookingError::Transient(format!(
                "reservation {} changed concurrently",
                current.id
            )));
        }
        Ok((tx, row))
    }

    /// Commit, then publish while the unit still holds its locks so events
    /// for one reservation go out in commit order.
    pub(super) async fn finish(&self, mut tx: S::Tx, transition: Transition) -> Result<Reservation, BookingError> {
        tx.commit().await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "kind" => transition.kind.as_str()).increment(1);
        self.fanout.publish(&transition);
        drop(tx);
        Ok(transition.after)
    }

    fn record_rejection(&self, op: &'static str, e: &BookingError) {
        metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "op" => op, "reason" => e.code()).increment(1);
        tracing::debug!("{op} rejected: {e}");
    }
}
