use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::fanout::ChangeEvent;
use crate::limits::*;
use crate::model::{TableId, UserId};

pub type ConnectionId = Ulid;

/// A logical fanout group live connections subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomKey {
    Table(TableId),
    UserReservations(UserId),
    AdminDashboard,
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Table(id) => write!(f, "table-{id}"),
            RoomKey::UserReservations(id) => write!(f, "user-reservations-{id}"),
            RoomKey::AdminDashboard => f.write_str("admin-dashboard"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room key: {0:?}")]
pub struct RoomParseError(String);

impl FromStr for RoomKey {
    type Err = RoomParseError;

    /// Only the canonical spelling parses, so `"table-05"` and `"table-+5"`
    /// never alias `"table-5"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RoomParseError(s.to_string());
        let room = if s == "admin-dashboard" {
            RoomKey::AdminDashboard
        } else if let Some(id) = s.strip_prefix("user-reservations-") {
            id.parse().map(RoomKey::UserReservations).map_err(|_| bad())?
        } else if let Some(id) = s.strip_prefix("table-") {
            id.parse().map(RoomKey::Table).map_err(|_| bad())?
        } else {
            return Err(bad());
        };
        if room.to_string() != s {
            return Err(bad());
        }
        Ok(room)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = RoomParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RoomKey> for String {
    fn from(room: RoomKey) -> Self {
        room.to_string()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection already in {0} rooms")]
    TooManyRooms(usize),
}

/// Outcome of handing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Connection gone or its writer stopped.
    Closed,
    /// Outbox at capacity; the event was dropped for this connection.
    Full,
}

struct Member {
    rooms: HashSet<RoomKey>,
    outbox: mpsc::Sender<Arc<ChangeEvent>>,
}

/// Live connections and their room memberships.
///
/// Lock order is always connection shard, then room shard; nothing takes
/// them the other way round.
pub struct Registry {
    connections: DashMap<ConnectionId, Member>,
    rooms: DashMap<RoomKey, HashSet<ConnectionId>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Track a new connection and return the receiving end of its outbox.
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<Arc<ChangeEvent>> {
        self.drop_connection(id);
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.connections.insert(
            id,
            Member {
                rooms: HashSet::new(),
                outbox: tx,
            },
        );
        rx
    }

    /// Idempotent; returns whether the membership is new.
    pub fn join(&self, id: ConnectionId, room: RoomKey) -> Result<bool, RoomError> {
        let mut member = self
            .connections
            .get_mut(&id)
            .ok_or(RoomError::UnknownConnection(id))?;
        if member.rooms.contains(&room) {
            return Ok(false);
        }
        if member.rooms.len() >= MAX_ROOMS_PER_CONNECTION {
            return Err(RoomError::TooManyRooms(member.rooms.len()));
        }
        member.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(id);
        Ok(true)
    }

    /// Returns whether the connection was in the room.
    pub fn leave(&self, id: ConnectionId, room: RoomKey) -> bool {
        let Some(mut member) = self.connections.get_mut(&id) else {
            return false;
        };
        if !member.rooms.remove(&room) {
            return false;
        }
        self.remove_member(room, id);
        true
    }

    /// Forget a connection and all its memberships. Returns how many rooms
    /// it was in.
    pub fn drop_connection(&self, id: ConnectionId) -> usize {
        let Some((_, member)) = self.connections.remove(&id) else {
            return 0;
        };
        for room in &member.rooms {
            self.remove_member(*room, id);
        }
        member.rooms.len()
    }

    fn remove_member(&self, room: RoomKey, id: ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(&room) {
            members.remove(&id);
        }
        self.rooms.remove_if(&room, |_, members| members.is_empty());
    }

    pub fn members_of(&self, room: RoomKey) -> HashSet<ConnectionId> {
        self.rooms
            .get(&room)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, id: ConnectionId) -> HashSet<RoomKey> {
        self.connections
            .get(&id)
            .map(|m| m.rooms.clone())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Non-blocking hand-off to one connection's outbox.
    pub fn deliver(&self, id: ConnectionId, event: &Arc<ChangeEvent>) -> Delivery {
        let Some(member) = self.connections.get(&id) else {
            return Delivery::Closed;
        };
        match member.outbox.try_send(event.clone()) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{ChangeEvent, EventKind};
    use crate::model::TableStatus;

    fn event() -> Arc<ChangeEvent> {
        Arc::new(ChangeEvent::table(EventKind::TableUpdated, 1, TableStatus::Available))
    }

    #[test]
    fn room_key_format_and_parse() {
        for room in [
            RoomKey::Table(5),
            RoomKey::UserReservations(42),
            RoomKey::AdminDashboard,
        ] {
            assert_eq!(room.to_string().parse::<RoomKey>().unwrap(), room);
        }
        assert_eq!(RoomKey::Table(5).to_string(), "table-5");
        assert_eq!(RoomKey::UserReservations(42).to_string(), "user-reservations-42");
        assert!("table-".parse::<RoomKey>().is_err());
        assert!("table-x".parse::<RoomKey>().is_err());
        assert!("lobby".parse::<RoomKey>().is_err());
    }

    #[test]
    fn room_key_rejects_non_canonical_ids() {
        for key in ["table-05", "table-+5", "user-reservations-007", "user-reservations-+1", "table-0x5"] {
            assert!(key.parse::<RoomKey>().is_err(), "{key} should not parse");
        }
        assert_eq!("table-0".parse::<RoomKey>().unwrap(), RoomKey::Table(0));
    }

    #[test]
    fn room_key_serde_as_string() {
        let json = serde_json::to_string(&RoomKey::Table(3)).unwrap();
        assert_eq!(json, "\"table-3\"");
        let back: RoomKey = serde_json::from_str("\"admin-dashboard\"").unwrap();
        assert_eq!(back, RoomKey::AdminDashboard);
        assert!(serde_json::from_str::<RoomKey>("\"nope\"").is_err());
    }

    #[test]
    fn join_is_idempotent() {
        let reg = Registry::new();
        let conn = Ulid::new();
        let _rx = reg.register(conn);

        assert_eq!(reg.join(conn, RoomKey::Table(1)), Ok(true));
        assert_eq!(reg.join(conn, RoomKey::Table(1)), Ok(false));
        assert_eq!(reg.members_of(RoomKey::Table(1)).len(), 1);
    }

    #[test]
    fn join_unknown_connection_rejected() {
        let reg = Registry::new();
        let conn = Ulid::new();
        assert_eq!(
            reg.join(conn, RoomKey::AdminDashboard),
            Err(RoomError::UnknownConnection(conn))
        );
        assert!(reg.members_of(RoomKey::AdminDashboard).is_empty());
    }

    #[test]
    fn leave_and_drop_clean_up() {
        let reg = Registry::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let _ra = reg.register(a);
        let _rb = reg.register(b);

        reg.join(a, RoomKey::Table(1)).unwrap();
        reg.join(a, RoomKey::AdminDashboard).unwrap();
        reg.join(b, RoomKey::Table(1)).unwrap();

        assert!(reg.leave(b, RoomKey::Table(1)));
        assert!(!reg.leave(b, RoomKey::Table(1)));
        assert_eq!(reg.members_of(RoomKey::Table(1)), HashSet::from([a]));

        assert_eq!(reg.drop_connection(a), 2);
        assert!(reg.members_of(RoomKey::Table(1)).is_empty());
        assert!(reg.members_of(RoomKey::AdminDashboard).is_empty());
        assert!(reg.rooms.is_empty());
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn room_limit_per_connection() {
        let reg = Registry::new();
        let conn = Ulid::new();
        let _rx = reg.register(conn);
        for i in 0..MAX_ROOMS_PER_CONNECTION {
            reg.join(conn, RoomKey::Table(i as TableId)).unwrap();
        }
        assert!(matches!(
            reg.join(conn, RoomKey::AdminDashboard),
            Err(RoomError::TooManyRooms(_))
        ));
    }

    #[tokio::test]
    async fn deliver_reports_closed_and_full() {
        let reg = Registry::new();
        let conn = Ulid::new();
        let mut rx = reg.register(conn);

        assert_eq!(reg.deliver(conn, &event()), Delivery::Sent);
        assert!(rx.recv().await.is_some());

        for _ in 0..OUTBOX_CAPACITY {
            assert_eq!(reg.deliver(conn, &event()), Delivery::Sent);
        }
        assert_eq!(reg.deliver(conn, &event()), Delivery::Full);

        drop(rx);
        assert_eq!(reg.deliver(conn, &event()), Delivery::Closed);
        assert_eq!(reg.deliver(Ulid::new(), &event()), Delivery::Closed);
    }

    #[test]
    fn register_twice_resets_memberships() {
        let reg = Registry::new();
        let conn = Ulid::new();
        let _rx = reg.register(conn);
        reg.join(conn, RoomKey::Table(2)).unwrap();

        let _rx2 = reg.register(conn);
        assert!(reg.rooms_of(conn).is_empty());
        assert!(reg.members_of(RoomKey::Table(2)).is_empty());
    }
}
