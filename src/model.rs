use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub type TableId = u32;
pub type ReservationId = u64;
pub type UserId = u64;

/// Minutes since midnight. Interval arithmetic works only in this unit.
pub type Minute = i32;

pub fn minute_of_day(t: NaiveTime) -> Minute {
    (t.num_seconds_from_midnight() / 60) as Minute
}

/// Half-open window `[start, end)` within one calendar day.
///
/// Buffered windows may extend below zero or past 24h; that is fine, they
/// are only ever compared with other windows of the same day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Minute,
    pub end: Minute,
}

impl Window {
    /// Empty or inverted windows are representable; `booking::validate::window`
    /// refuses them before any conflict check.
    pub fn new(start: Minute, end: Minute) -> Self {
        Self { start, end }
    }

    pub fn from_times(start: NaiveTime, end: NaiveTime) -> Self {
        Self::new(minute_of_day(start), minute_of_day(end))
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Grow both ends by `buffer` minutes.
    pub fn expand(&self, buffer: u16) -> Window {
        let b = Minute::from(buffer);
        Window {
            start: self.start - b,
            end: self.end + b,
        }
    }
}

// ── Tables ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    /// Number painted on the table, shown to guests.
    pub number: u32,
    pub capacity: u32,
    pub status: TableStatus,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Statuses that occupy their table slot.
    pub const ACTIVE: [ReservationStatus; 2] =
        [ReservationStatus::Pending, ReservationStatus::Confirmed];

    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub table_id: TableId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub buffer_minutes: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn window(&self) -> Window {
        Window::from_times(self.start, self.end)
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey {
            table_id: self.table_id,
            date: self.date,
        }
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end)
    }

    /// Same requester asking for the same table and window again.
    pub fn same_request(&self, draft: &ReservationDraft) -> bool {
        self.user_id == draft.user_id
            && self.table_id == draft.table_id
            && self.date == draft.date
            && self.start == draft.start
            && self.end == draft.end
    }
}

/// A reservation as requested by a caller, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub table_id: TableId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub party_size: u32,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub buffer_minutes: Option<u16>,
}

/// Fully resolved row handed to the store for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub user_id: UserId,
    pub table_id: TableId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub notes: Option<String>,
    pub buffer_minutes: u16,
}

impl ReservationDraft {
    pub fn slot(&self) -> SlotKey {
        SlotKey {
            table_id: self.table_id,
            date: self.date,
        }
    }
}

/// Fields a caller may change on an existing reservation. `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPatch {
    #[serde(default)]
    pub table_id: Option<TableId>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start: Option<NaiveTime>,
    #[serde(default)]
    pub end: Option<NaiveTime>,
    #[serde(default)]
    pub party_size: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

/// Identity fact supplied by the identity collaborator. Trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    /// Identity used by background housekeeping.
    pub fn system() -> Self {
        Self {
            id: 0,
            role: Role::Admin,
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Staff | Role::Admin)
    }

    pub fn may_manage(&self, reservation: &Reservation) -> bool {
        self.is_privileged() || reservation.user_id == self.id
    }
}

// ── Lock scopes ──────────────────────────────────────────────────

/// The reservation set of one table on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub table_id: TableId,
    pub date: NaiveDate,
}

/// Unit an atomic store operation serializes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Slot(SlotKey),
    /// A user's reservations on one day (daily quota).
    UserDay(UserId, NaiveDate),
}

// ── WAL records ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    TableUpserted(Table),
    ReservationUpserted(Reservation),
    ReservationDeleted { id: ReservationId },
}

/// One atomic unit. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub changes: Vec<Change>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn window_basics() {
        let w = Window::from_times(t(9, 0), t(10, 30));
        assert_eq!(w.start, 540);
        assert_eq!(w.end, 630);
        assert_eq!(w.duration(), 90);
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [
            (Window::new(0, 60), Window::new(30, 90)),
            (Window::new(0, 60), Window::new(60, 120)),
            (Window::new(10, 20), Window::new(0, 100)),
            (Window::new(0, 10), Window::new(50, 60)),
        ];
        for (a, b) in cases {
            assert_eq!(a.overlaps(&b), b.overlaps(&a), "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn window_overlaps_itself() {
        let w = Window::new(540, 600);
        assert!(w.overlaps(&w));
    }

    #[test]
    fn adjacent_windows_do_not_overlap() {
        let a = Window::from_times(t(9, 0), t(10, 0));
        let b = Window::from_times(t(10, 0), t(11, 0));
        assert!(!a.overlaps(&b));
        assert!(!a.expand(0).overlaps(&b));
        assert!(a.expand(1).overlaps(&b));
    }

    #[test]
    fn sub_minute_window_collapses_without_panicking() {
        let start = NaiveTime::from_hms_opt(9, 0, 10).unwrap();
        let end = NaiveTime::from_hms_opt(9, 0, 50).unwrap();
        let w = Window::from_times(start, end);
        assert_eq!(w, Window::new(540, 540));
        assert_eq!(w.duration(), 0);
    }

    #[test]
    fn expand_is_symmetric() {
        let w = Window::new(600, 660).expand(15);
        assert_eq!(w, Window { start: 585, end: 675 });
    }

    #[test]
    fn expand_may_cross_midnight() {
        let w = Window::from_times(t(0, 5), t(0, 45)).expand(15);
        assert_eq!(w.start, -10);
    }

    #[test]
    fn status_activity() {
        assert!(ReservationStatus::Pending.is_active());
        assert!(ReservationStatus::Confirmed.is_active());
        assert!(ReservationStatus::Cancelled.is_terminal());
        assert!(ReservationStatus::Completed.is_terminal());
    }

    #[test]
    fn scope_keys_sort_slots_first() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let mut keys = vec![
            ScopeKey::UserDay(1, date),
            ScopeKey::Slot(SlotKey { table_id: 9, date }),
            ScopeKey::Slot(SlotKey { table_id: 2, date }),
        ];
        keys.sort();
        assert_eq!(keys[0], ScopeKey::Slot(SlotKey { table_id: 2, date }));
        assert_eq!(keys[2], ScopeKey::UserDay(1, date));
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let commit = Commit {
            changes: vec![
                Change::TableUpserted(Table {
                    id: 5,
                    number: 5,
                    capacity: 8,
                    status: TableStatus::Available,
                }),
                Change::ReservationDeleted { id: 7 },
            ],
        };
        let bytes = bincode::serialize(&commit).unwrap();
        let decoded: Commit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(commit, decoded);
    }
}
