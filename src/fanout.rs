use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::booking::{Transition, TransitionKind};
use crate::model::*;
use crate::observability;
use crate::rooms::{ConnectionId, Delivery, Registry, RoomKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ReservationCreated,
    ReservationUpdated,
    ReservationConfirmed,
    ReservationCancelled,
    ReservationCompleted,
    ReservationDeleted,
    AvailabilityUpdated,
    TableUpdated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ReservationCreated => "reservation-created",
            EventKind::ReservationUpdated => "reservation-updated",
            EventKind::ReservationConfirmed => "reservation-confirmed",
            EventKind::ReservationCancelled => "reservation-cancelled",
            EventKind::ReservationCompleted => "reservation-completed",
            EventKind::ReservationDeleted => "reservation-deleted",
            EventKind::AvailabilityUpdated => "availability-updated",
            EventKind::TableUpdated => "table-updated",
        }
    }

    fn for_transition(t: &Transition) -> Self {
        match t.kind {
            TransitionKind::Created => EventKind::ReservationCreated,
            TransitionKind::Updated => EventKind::ReservationUpdated,
            TransitionKind::Deleted => EventKind::ReservationDeleted,
            TransitionKind::StatusChanged => match t.new_status() {
                ReservationStatus::Confirmed => EventKind::ReservationConfirmed,
                ReservationStatus::Cancelled => EventKind::ReservationCancelled,
                ReservationStatus::Completed => EventKind::ReservationCompleted,
                ReservationStatus::Pending => EventKind::ReservationUpdated,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationChange {
    pub reservation_id: ReservationId,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_status: Option<ReservationStatus>,
    pub new_status: ReservationStatus,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Set when an update moved the reservation off another table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_table_id: Option<TableId>,
}

/// What a live client receives. Built once per commit and shared by every
/// recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Ulid,
    pub kind: EventKind,
    pub table_id: TableId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<ReservationChange>,
    /// Derived availability hint, or the stored status for `table-updated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_status: Option<TableStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn table(kind: EventKind, table_id: TableId, status: TableStatus) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            table_id,
            reservation: None,
            table_status: Some(status),
            timestamp: Utc::now(),
        }
    }

    pub fn reservation(transition: &Transition) -> Self {
        let row = &transition.after;
        let previous_table_id = transition
            .before
            .as_ref()
            .map(|b| b.table_id)
            .filter(|&t| t != row.table_id);
        Self {
            id: Ulid::new(),
            kind: EventKind::for_transition(transition),
            table_id: row.table_id,
            reservation: Some(ReservationChange {
                reservation_id: row.id,
                user_id: row.user_id,
                old_status: transition.old_status(),
                new_status: transition.new_status(),
                date: row.date,
                start: row.start,
                end: row.end,
                previous_table_id,
            }),
            table_status: None,
            timestamp: Utc::now(),
        }
    }
}

/// Availability hints a transition implies, per affected table. The stored
/// table status is never touched by these.
fn availability_hints(t: &Transition) -> Vec<(TableId, TableStatus)> {
    let table = t.after.table_id;
    match t.kind {
        TransitionKind::Created => vec![(table, TableStatus::Reserved)],
        TransitionKind::Deleted => vec![(table, TableStatus::Available)],
        TransitionKind::StatusChanged => match t.new_status() {
            ReservationStatus::Confirmed => vec![(table, TableStatus::Reserved)],
            ReservationStatus::Cancelled | ReservationStatus::Completed => {
                vec![(table, TableStatus::Available)]
            }
            ReservationStatus::Pending => Vec::new(),
        },
        TransitionKind::Updated => {
            let mut hints = Vec::new();
            if let Some(before) = &t.before
                && before.table_id != table
            {
                hints.push((before.table_id, TableStatus::Available));
            }
            hints.push((table, TableStatus::Reserved));
            hints
        }
    }
}

/// Turns committed transitions into change events and routes them through
/// the room registry. Publishing never fails the caller.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<Registry>,
}

impl Fanout {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn publish(&self, transition: &Transition) {
        let event = Arc::new(ChangeEvent::reservation(transition));
        let mut rooms = vec![
            RoomKey::Table(transition.after.table_id),
            RoomKey::UserReservations(transition.after.user_id),
            RoomKey::AdminDashboard,
        ];
        if let Some(previous) = event.reservation.as_ref().and_then(|r| r.previous_table_id) {
            rooms.push(RoomKey::Table(previous));
        }
        self.send(&rooms, event);

        for (table_id, status) in availability_hints(transition) {
            let hint = ChangeEvent::table(EventKind::AvailabilityUpdated, table_id, status);
            self.send(&[RoomKey::Table(table_id)], Arc::new(hint));
        }
    }

    pub fn publish_table(&self, table: &Table) {
        let event = ChangeEvent::table(EventKind::TableUpdated, table.id, table.status);
        self.send(
            &[RoomKey::Table(table.id), RoomKey::AdminDashboard],
            Arc::new(event),
        );
    }

    /// Deliver once to the union of the rooms' members.
    fn send(&self, rooms: &[RoomKey], event: Arc<ChangeEvent>) {
        let recipients: HashSet<ConnectionId> = rooms
            .iter()
            .flat_map(|room| self.registry.members_of(*room))
            .collect();

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for conn in recipients {
            match self.registry.deliver(conn, &event) {
                Delivery::Sent => delivered += 1,
                Delivery::Full => {
                    dropped += 1;
                    tracing::warn!("outbox full for connection {conn}, dropped {}", event.kind.as_str());
                }
                Delivery::Closed => dropped += 1,
            }
        }

        let kind = event.kind.as_str();
        metrics::counter!(observability::FANOUT_DELIVERED_TOTAL, "kind" => kind).increment(delivered);
        if dropped > 0 {
            metrics::counter!(observability::FANOUT_DROPPED_TOTAL, "kind" => kind).increment(dropped);
        }
        tracing::debug!("{kind} for table {} delivered to {delivered} connection(s)", event.table_id);
    }
}
