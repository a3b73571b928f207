use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{Store, StoreError, StoreTx};

/// Changes per commit frame when writing a compaction snapshot.
const SNAPSHOT_CHUNK: usize = 1024;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single fsync for the whole batch; a failed batch is cut off the log.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(commit, _)| commit))
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── State ────────────────────────────────────────────────

struct Inner {
    tables: DashMap<TableId, Table>,
    reservations: DashMap<ReservationId, Reservation>,
    /// `(table, date)` → reservation ids, the index conflict checks scan.
    slots: DashMap<SlotKey, Vec<ReservationId>>,
    by_user: DashMap<UserId, Vec<ReservationId>>,
    next_id: AtomicU64,
    locks: DashMap<ScopeKey, Arc<Mutex<()>>>,
    lock_timeout: Duration,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits take it shared, compaction exclusive, so a snapshot never
    /// misses a commit that reached the log.
    gate: RwLock<()>,
}

impl Inner {
    fn apply(&self, change: &Change) {
        match change {
            Change::TableUpserted(table) => {
                self.tables.insert(table.id, table.clone());
            }
            Change::ReservationUpserted(row) => {
                self.next_id.fetch_max(row.id + 1, Ordering::Relaxed);
                match self.reservations.insert(row.id, row.clone()) {
                    Some(old) if old.slot() != row.slot() => {
                        self.unindex_slot(old.slot(), old.id);
                        self.slots.entry(row.slot()).or_default().push(row.id);
                    }
                    Some(_) => {}
                    None => {
                        self.slots.entry(row.slot()).or_default().push(row.id);
                        self.by_user.entry(row.user_id).or_default().push(row.id);
                    }
                }
            }
            Change::ReservationDeleted { id } => {
                if let Some((_, old)) = self.reservations.remove(id) {
                    self.unindex_slot(old.slot(), old.id);
                    if let Some(mut ids) = self.by_user.get_mut(&old.user_id) {
                        ids.retain(|r| *r != old.id);
                    }
                }
            }
        }
    }

    fn unindex_slot(&self, slot: SlotKey, id: ReservationId) {
        if let Some(mut ids) = self.slots.get_mut(&slot) {
            ids.retain(|r| *r != id);
        }
    }

    fn query(&self, table_id: TableId, date: NaiveDate, statuses: &[ReservationStatus]) -> Vec<Reservation> {
        let ids = match self.slots.get(&SlotKey { table_id, date }) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        let mut rows: Vec<Reservation> = ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|r| r.value().clone()))
            .filter(|r| statuses.contains(&r.status))
            .collect();
        rows.sort_by_key(|r| (r.start, r.id));
        rows
    }

    fn user_rows(&self, user_id: UserId) -> Vec<Reservation> {
        let ids = match self.by_user.get(&user_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.reservations.get(id).map(|r| r.value().clone()))
            .collect()
    }

    async fn wal_append(&self, commit: Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append then apply, the only path by which state changes.
    async fn persist(&self, commit: Commit) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        let changes = commit.changes.clone();
        self.wal_append(commit).await?;
        for change in &changes {
            self.apply(change);
        }
        Ok(())
    }

    /// Minimal commits that recreate the current state.
    fn snapshot(&self) -> Vec<Commit> {
        let mut tables: Vec<Table> = self.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by_key(|t| t.id);
        let mut rows: Vec<Reservation> = self.reservations.iter().map(|e| e.value().clone()).collect();
        rows.sort_by_key(|r| r.id);

        let changes: Vec<Change> = tables
            .into_iter()
            .map(Change::TableUpserted)
            .chain(rows.into_iter().map(Change::ReservationUpserted))
            .collect();
        changes
            .chunks(SNAPSHOT_CHUNK)
            .map(|c| Commit { changes: c.to_vec() })
            .collect()
    }
}

/// In-process store persisted to a write-ahead log.
///
/// Atomic units lock their scopes with per-scope async mutexes, acquired in
/// sorted order so overlapping units cannot deadlock.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Replay `wal_path` and start the group-commit writer.
    pub fn open(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let (wal, commits) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner {
            tables: DashMap::new(),
            reservations: DashMap::new(),
            slots: DashMap::new(),
            by_user: DashMap::new(),
            next_id: AtomicU64::new(1),
            locks: DashMap::new(),
            lock_timeout,
            wal_tx,
            gate: RwLock::new(()),
        };
        for commit in &commits {
            for change in &commit.changes {
                inner.apply(change);
            }
        }
        tracing::info!(
            "store replayed {} commits: {} tables, {} reservations",
            commits.len(),
            inner.tables.len(),
            inner.reservations.len()
        );

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn reservation_count(&self) -> usize {
        self.inner.reservations.len()
    }

    /// Rewrite the WAL with only the records needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.inner.gate.write().await;
        let commits = self.inner.snapshot();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin_atomic(&self, scopes: &[ScopeKey]) -> Result<MemoryTx, StoreError> {
        let mut sorted = scopes.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut tx = MemoryTx {
            inner: self.inner.clone(),
            scopes: sorted.clone(),
            guards: Vec::with_capacity(sorted.len()),
            staged: Vec::new(),
        };

        let wait_start = Instant::now();
        for scope in sorted {
            let lock = self
                .inner
                .locks
                .entry(scope)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            match tokio::time::timeout(self.inner.lock_timeout, lock.lock_owned()).await {
                Ok(guard) => tx.guards.push(guard),
                Err(_) => {
                    metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                    tracing::warn!("lock wait on {scope:?} exceeded {:?}", self.inner.lock_timeout);
                    return Err(StoreError::LockTimeout(scope));
                }
            }
        }
        metrics::histogram!(observability::LOCK_WAIT_SECONDS).record(wait_start.elapsed().as_secs_f64());
        Ok(tx)
    }

    async fn get_table(&self, id: TableId) -> Result<Option<Table>, StoreError> {
        Ok(self.inner.tables.get(&id).map(|t| t.value().clone()))
    }

    async fn list_tables(&self) -> Result<Vec<Table>, StoreError> {
        let mut tables: Vec<Table> = self.inner.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by_key(|t| t.id);
        Ok(tables)
    }

    async fn put_table(&self, table: Table) -> Result<Table, StoreError> {
        self.inner
            .persist(Commit {
                changes: vec![Change::TableUpserted(table.clone())],
            })
            .await?;
        Ok(table)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(self.inner.reservations.get(&id).map(|r| r.value().clone()))
    }

    async fn query_reservations(
        &self,
        table_id: TableId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.inner.query(table_id, date, statuses))
    }

    async fn user_reservations(
        &self,
        user_id: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut rows = self.inner.user_rows(user_id);
        if let Some(date) = date {
            rows.retain(|r| r.date == date);
        }
        rows.sort_by_key(|r| (r.date, r.start, r.id));
        Ok(rows)
    }

    async fn active_ending_before(&self, cutoff: NaiveDateTime) -> Result<Vec<Reservation>, StoreError> {
        let mut rows: Vec<Reservation> = self
            .inner
            .reservations
            .iter()
            .filter(|e| e.status.is_active() && e.ends_at() <= cutoff)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

/// An open atomic unit on a [`MemoryStore`].
pub struct MemoryTx {
    inner: Arc<Inner>,
    scopes: Vec<ScopeKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    staged: Vec<Change>,
}

impl MemoryTx {
    fn check_scope(&self, slot: SlotKey) -> Result<(), StoreError> {
        if self.scopes.contains(&ScopeKey::Slot(slot)) {
            Ok(())
        } else {
            Err(StoreError::OutOfScope(slot))
        }
    }

    fn committed_row(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.inner
            .reservations
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::MissingReservation(id))
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.guards.clear();
        // Drop lock entries nobody else holds or waits on.
        for scope in &self.scopes {
            self.inner
                .locks
                .remove_if(scope, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_table(&mut self, id: TableId) -> Result<Option<Table>, StoreError> {
        Ok(self.inner.tables.get(&id).map(|t| t.value().clone()))
    }

    async fn get_reservation(&mut self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(self.inner.reservations.get(&id).map(|r| r.value().clone()))
    }

    async fn query_reservations(
        &mut self,
        table_id: TableId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.inner.query(table_id, date, statuses))
    }

    async fn count_user_reservations(
        &mut self,
        user_id: UserId,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .user_rows(user_id)
            .iter()
            .filter(|r| r.date == date && statuses.contains(&r.status))
            .count())
    }

    async fn insert_reservation(&mut self, draft: ReservationDraft) -> Result<Reservation, StoreError> {
        self.check_scope(draft.slot())?;
        let now = Utc::now();
        let row = Reservation {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            user_id: draft.user_id,
            table_id: draft.table_id,
            date: draft.date,
            start: draft.start,
            end: draft.end,
            party_size: draft.party_size,
            status: draft.status,
            notes: draft.notes,
            buffer_minutes: draft.buffer_minutes,
            created_at: now,
            updated_at: now,
        };
        self.staged.push(Change::ReservationUpserted(row.clone()));
        Ok(row)
    }

    async fn update_reservation(&mut self, mut row: Reservation) -> Result<Reservation, StoreError> {
        let existing = self.committed_row(row.id)?;
        self.check_scope(existing.slot())?;
        self.check_scope(row.slot())?;
        row.created_at = existing.created_at;
        row.updated_at = Utc::now();
        self.staged.push(Change::ReservationUpserted(row.clone()));
        Ok(row)
    }

    async fn delete_reservation(&mut self, id: ReservationId) -> Result<(), StoreError> {
        let existing = self.committed_row(id)?;
        self.check_scope(existing.slot())?;
        self.staged.push(Change::ReservationDeleted { id });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(&mut self.staged);
        self.inner.persist(Commit { changes }).await
    }

    async fn rollback(&mut self) {
        self.staged.clear();
    }
}
