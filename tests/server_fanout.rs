use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use tablebook::booking::Bookings;
use tablebook::config::BookingPolicy;
use tablebook::fanout::Fanout;
use tablebook::rooms::Registry;
use tablebook::server;
use tablebook::store::MemoryStore;

const PASSWORD: &str = "tablebook";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("tablebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = MemoryStore::open(dir.join("tablebook.wal"), Duration::from_secs(5)).unwrap();
    let bookings = Arc::new(Bookings::new(
        store,
        BookingPolicy::default(),
        Fanout::new(Arc::new(Registry::new())),
    ));
    let password: Arc<str> = PASSWORD.into();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let bookings = bookings.clone();
            let password = password.clone();
            tokio::spawn(async move {
                let _ = server::process_connection(socket, bookings, password).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    events: VecDeque<Value>,
}

impl Client {
    async fn raw(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            events: VecDeque::new(),
        }
    }

    async fn connect(addr: SocketAddr, user_id: u64, role: &str) -> Self {
        let mut client = Self::raw(addr).await;
        let reply = client
            .request(json!({ "op": "hello", "user_id": user_id, "role": role, "password": PASSWORD }))
            .await;
        assert_eq!(reply["type"], "ok", "handshake failed: {reply}");
        client
    }

    async fn next_line(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.framed.next())
            .await
            .ok()??
            .unwrap();
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Send one request and return its reply, queueing any events that
    /// arrive first.
    async fn request(&mut self, body: Value) -> Value {
        self.framed.send(body.to_string()).await.unwrap();
        loop {
            let frame = self.next_line().await.expect("no reply");
            if frame["type"] == "event" {
                self.events.push_back(frame);
            } else {
                return frame;
            }
        }
    }

    async fn ok(&mut self, body: Value) -> Value {
        let reply = self.request(body).await;
        assert_eq!(reply["type"], "ok", "request failed: {reply}");
        reply.get("data").cloned().unwrap_or(Value::Null)
    }

    /// Next pushed event, waiting briefly for it.
    async fn event(&mut self) -> Option<Value> {
        if let Some(e) = self.events.pop_front() {
            return Some(e);
        }
        let frame = self.next_line().await?;
        assert_eq!(frame["type"], "event", "unexpected frame: {frame}");
        Some(frame)
    }

    async fn event_kinds(&mut self, n: usize) -> Vec<String> {
        let mut kinds = Vec::new();
        for _ in 0..n {
            let e = self.event().await.expect("missing event");
            kinds.push(e["event"]["kind"].as_str().unwrap().to_string());
        }
        kinds
    }

    async fn quiet(&mut self) -> bool {
        if !self.events.is_empty() {
            return false;
        }
        tokio::time::timeout(Duration::from_millis(200), self.framed.next())
            .await
            .is_err()
    }
}

fn reservation(table_id: u32, start: &str, end: &str) -> Value {
    json!({
        "op": "create",
        "reservation": {
            "table_id": table_id,
            "date": "2026-03-14",
            "start": start,
            "end": end,
            "party_size": 2,
        }
    })
}

async fn seed_table(staff: &mut Client, id: u32, capacity: u32) {
    staff
        .ok(json!({
            "op": "upsert_table",
            "table": { "id": id, "number": id, "capacity": capacity, "status": "available" }
        }))
        .await;
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_rejects_bad_password() {
    let addr = start_test_server().await;
    let mut client = Client::raw(addr).await;
    let reply = client
        .request(json!({ "op": "hello", "user_id": 1, "role": "customer", "password": "wrong" }))
        .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "unauthenticated");
    // Server hangs up
    assert!(client.next_line().await.is_none());
}

#[tokio::test]
async fn handshake_required_first() {
    let addr = start_test_server().await;
    let mut client = Client::raw(addr).await;
    let reply = client.request(json!({ "op": "list_tables" })).await;
    assert_eq!(reply["code"], "unauthenticated");
}

#[tokio::test]
async fn create_fans_out_to_table_user_and_admin_rooms() {
    let addr = start_test_server().await;
    let mut staff = Client::connect(addr, 1, "staff").await;
    seed_table(&mut staff, 5, 8).await;
    staff.ok(json!({ "op": "join", "room": "admin-dashboard" })).await;

    let mut watcher = Client::connect(addr, 20, "customer").await;
    watcher.ok(json!({ "op": "join", "room": "table-5" })).await;

    let mut owner = Client::connect(addr, 10, "customer").await;
    owner.ok(json!({ "op": "join", "room": "user-reservations-10" })).await;

    let mut bystander = Client::connect(addr, 30, "customer").await;
    bystander.ok(json!({ "op": "join", "room": "user-reservations-30" })).await;

    let created = owner.ok(reservation(5, "09:00:00", "10:30:00")).await;
    assert_eq!(created["status"], "confirmed");
    let id = created["id"].as_u64().unwrap();

    let event = owner.event().await.expect("owner event");
    assert_eq!(event["event"]["kind"], "reservation-created");
    assert_eq!(event["event"]["reservation"]["reservation_id"], id);
    assert_eq!(event["event"]["reservation"]["new_status"], "confirmed");

    assert_eq!(
        watcher.event_kinds(2).await,
        vec!["reservation-created", "availability-updated"]
    );
    assert_eq!(staff.event_kinds(1).await, vec!["reservation-created"]);
    assert!(bystander.quiet().await);
}

#[tokio::test]
async fn conflict_error_over_the_wire() {
    let addr = start_test_server().await;
    let mut staff = Client::connect(addr, 1, "staff").await;
    seed_table(&mut staff, 5, 8).await;

    let mut a = Client::connect(addr, 10, "customer").await;
    let mut b = Client::connect(addr, 11, "customer").await;
    let first = a.ok(reservation(5, "09:00:00", "10:30:00")).await;

    let reply = b.request(reservation(5, "10:40:00", "12:00:00")).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "conflict");
    assert_eq!(reply["retryable"], false);

    let check = b
        .ok(json!({
            "op": "check_availability",
            "table_id": 5, "date": "2026-03-14", "start": "10:40:00", "end": "12:00:00"
        }))
        .await;
    assert_eq!(check["available"], false);
    assert_eq!(check["conflict"]["reservation_id"], first["id"]);

    b.ok(reservation(5, "10:46:00", "12:00:00")).await;
}

#[tokio::test]
async fn customers_limited_to_own_rooms() {
    let addr = start_test_server().await;
    let mut customer = Client::connect(addr, 10, "customer").await;

    let reply = customer.request(json!({ "op": "join", "room": "admin-dashboard" })).await;
    assert_eq!(reply["code"], "forbidden");
    let reply = customer
        .request(json!({ "op": "join", "room": "user-reservations-11" }))
        .await;
    assert_eq!(reply["code"], "forbidden");

    let joined = customer.ok(json!({ "op": "join", "room": "table-3" })).await;
    assert_eq!(joined["joined"], true);
    let again = customer.ok(json!({ "op": "join", "room": "table-3" })).await;
    assert_eq!(again["joined"], false);
    let left = customer.ok(json!({ "op": "leave", "room": "table-3" })).await;
    assert_eq!(left["left"], true);
}

#[tokio::test]
async fn bad_frames_get_error_replies() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr, 10, "customer").await;

    let reply = client.request(json!({ "op": "no_such_op" })).await;
    assert_eq!(reply["code"], "bad_request");

    // Connection still usable
    let tables = client.ok(json!({ "op": "list_tables" })).await;
    assert_eq!(tables, json!([]));
}

#[tokio::test]
async fn sub_minute_window_is_a_validation_error() {
    let addr = start_test_server().await;
    let mut staff = Client::connect(addr, 1, "staff").await;
    seed_table(&mut staff, 5, 8).await;

    let mut client = Client::connect(addr, 10, "customer").await;
    client.ok(json!({ "op": "join", "room": "table-5" })).await;
    let reply = client.request(reservation(5, "09:00:10", "09:00:50")).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "validation");

    // Session and its room membership survive the rejection
    client.ok(reservation(5, "09:00:00", "10:00:00")).await;
    assert_eq!(
        client.event_kinds(2).await,
        vec!["reservation-created", "availability-updated"]
    );
}

#[tokio::test]
async fn cancel_twice_emits_once_and_disconnect_leaves_rooms() {
    let addr = start_test_server().await;
    let mut staff = Client::connect(addr, 1, "staff").await;
    seed_table(&mut staff, 5, 8).await;

    let mut owner = Client::connect(addr, 10, "customer").await;
    let created = owner.ok(reservation(5, "09:00:00", "10:00:00")).await;
    let id = created["id"].as_u64().unwrap();

    let mut watcher = Client::connect(addr, 20, "customer").await;
    watcher.ok(json!({ "op": "join", "room": "table-5" })).await;

    let first = owner.ok(json!({ "op": "cancel", "id": id })).await;
    let second = owner.ok(json!({ "op": "cancel", "id": id })).await;
    assert_eq!(first, second);
    assert_eq!(first["status"], "cancelled");

    assert_eq!(
        watcher.event_kinds(2).await,
        vec!["reservation-cancelled", "availability-updated"]
    );
    assert!(watcher.quiet().await);

    drop(watcher);
    // Fanout to a vanished member must not disturb the writer
    let again = owner.ok(reservation(5, "09:00:00", "10:00:00")).await;
    assert_eq!(again["status"], "confirmed");
}
