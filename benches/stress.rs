use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

struct Conn {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Conn {
    async fn open(host: &str, port: u16, password: &str, user_id: u64, role: &str) -> Conn {
        let socket = TcpStream::connect((host, port)).await.expect("connect failed");
        let mut conn = Conn {
            framed: Framed::new(socket, LinesCodec::new()),
        };
        let reply = conn
            .call(json!({ "op": "hello", "user_id": user_id, "role": role, "password": password }))
            .await;
        assert_eq!(reply["type"], "ok", "handshake failed: {reply}");
        conn
    }

    /// Send a request and wait for its reply, skipping pushed events.
    async fn call(&mut self, body: Value) -> Value {
        self.framed.send(body.to_string()).await.expect("send failed");
        loop {
            let line = self
                .framed
                .next()
                .await
                .expect("server closed connection")
                .expect("read failed");
            let frame: Value = serde_json::from_str(&line).expect("bad frame");
            if frame["type"] != "event" {
                return frame;
            }
        }
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

struct Target {
    host: String,
    port: u16,
    password: String,
    /// Offsets every user id and date so repeated runs don't collide.
    run: u64,
}

impl Target {
    async fn conn(&self, user_id: u64, role: &str) -> Conn {
        Conn::open(&self.host, self.port, &self.password, self.run * 1_000_000 + user_id, role).await
    }

    fn date(&self, offset: u64) -> NaiveDate {
        let base = NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid base date");
        base.checked_add_days(Days::new(self.run % 1000 * 5000 + offset))
            .unwrap_or(base)
    }
}

fn create(table_id: u32, date: NaiveDate, start: &str, end: &str) -> Value {
    json!({
        "op": "create",
        "reservation": {
            "table_id": table_id,
            "date": date,
            "start": start,
            "end": end,
            "party_size": 2,
            "buffer_minutes": 0,
        }
    })
}

async fn setup(target: &Target) {
    let mut staff = target.conn(0, "staff").await;
    for id in 1..=10u32 {
        let reply = staff
            .call(json!({
                "op": "upsert_table",
                "table": { "id": id, "number": id, "capacity": 4, "status": "available" }
            }))
            .await;
        assert_eq!(reply["type"], "ok", "table setup failed: {reply}");
    }
    println!("  upserted 10 tables");
}

async fn phase1_sequential(target: &Target) {
    let mut conn = target.conn(1, "customer").await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    // One booking per day keeps the daily limit out of the way
    for i in 0..n {
        let t = Instant::now();
        let reply = conn.call(create(1, target.date(i as u64), "12:00:00", "13:00:00")).await;
        assert_eq!(reply["type"], "ok", "create failed: {reply}");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contention(target: &Target) {
    let n_clients = 50u64;
    let rounds = 20u64;
    let start = Instant::now();
    let mut winners_per_round = Vec::new();

    for round in 0..rounds {
        let date = target.date(3000 + round);
        let mut handles = Vec::new();
        for c in 0..n_clients {
            let mut conn = target.conn(10_000 + round * n_clients + c, "customer").await;
            handles.push(tokio::spawn(async move {
                conn.call(create(2, date, "19:00:00", "21:00:00")).await
            }));
        }
        let mut winners = 0;
        for h in handles {
            let reply = h.await.expect("task panicked");
            match reply["type"].as_str() {
                Some("ok") => winners += 1,
                _ => assert_eq!(reply["code"], "conflict", "unexpected reply: {reply}"),
            }
        }
        winners_per_round.push(winners);
    }

    let elapsed = start.elapsed();
    let double_booked = winners_per_round.iter().filter(|w| **w != 1).count();
    println!(
        "  {rounds} rounds x {n_clients} racers in {:.2}s, rounds with != 1 winner: {double_booked}",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(target: &Target) {
    let writers = 8u64;
    let per_writer = 100u64;
    let mut writer_handles = Vec::new();

    for w in 0..writers {
        let mut conn = target.conn(20_000 + w, "customer").await;
        let date0 = 3500 + w * per_writer;
        let dates: Vec<NaiveDate> = (0..per_writer).map(|i| target.date(date0 + i)).collect();
        let table = 3 + (w % 8) as u32;
        writer_handles.push(tokio::spawn(async move {
            for date in dates {
                conn.call(create(table, date, "08:00:00", "09:00:00")).await;
            }
        }));
    }

    let mut reader = target.conn(30_000, "customer").await;
    let date = target.date(3500);
    let mut latencies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && writer_handles.iter().any(|h| !h.is_finished()) {
        let t = Instant::now();
        let reply = reader
            .call(json!({
                "op": "available_tables",
                "date": date, "start": "08:00:00", "end": "09:00:00", "party_size": 2
            }))
            .await;
        assert_eq!(reply["type"], "ok", "availability failed: {reply}");
        latencies.push(t.elapsed());
    }

    for h in writer_handles {
        h.await.expect("writer panicked");
    }
    print_latency("availability latency under write load", &mut latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n = 200u64;
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n {
        let host = target.host.clone();
        let port = target.port;
        let password = target.password.clone();
        let user = target.run * 1_000_000 + 40_000 + i;
        handles.push(tokio::spawn(async move {
            let mut conn = Conn::open(&host, port, &password, user, "customer").await;
            let room = format!("user-reservations-{user}");
            conn.call(json!({ "op": "join", "room": room })).await;
        }));
    }
    for h in handles {
        h.await.expect("connection task panicked");
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} connect+hello+join in {:.2}s = {:.0} conn/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("TABLEBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TABLEBOOK_PORT")
        .unwrap_or_else(|_| "7878".into())
        .parse()
        .expect("invalid TABLEBOOK_PORT");
    let password = std::env::var("TABLEBOOK_PASSWORD").unwrap_or_else(|_| "tablebook".into());
    let run = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() % 100_000)
        .unwrap_or(0);

    println!("=== tablebook stress benchmark ===");
    println!("target: {host}:{port} (run {run})\n");
    let target = Target {
        host,
        port,
        password,
        run,
    };

    println!("[setup]");
    setup(&target).await;

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] same-slot contention");
    phase2_contention(&target).await;

    println!("\n[phase 3] availability reads under write load");
    phase3_read_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
