//! In-process table service.
//!
//! Implements the versioning, precondition, soft-delete and idempotency
//! rules of the HTTP contract against plain maps. Used as a test double and
//! as the backing store of the reference server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{RemoteError, RemoteTable};
use crate::models::{strip_system_properties, Payload, RemoteRow, Row, Version};

#[derive(Debug, Clone)]
struct StoredRow {
    fields: Payload,
    version: Version,
    updated_at: DateTime<Utc>,
    deleted: bool,
}

impl StoredRow {
    fn to_remote(&self, id: &str) -> RemoteRow {
        RemoteRow {
            row: Row {
                id: id.to_string(),
                version: Some(self.version.clone()),
                fields: self.fields.clone(),
            },
            updated_at: Some(self.updated_at),
            deleted: self.deleted,
        }
    }
}

/// Replies kept for idempotent retries unless configured otherwise.
pub const DEFAULT_REPLY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
enum Reply {
    Row(Result<RemoteRow, RemoteError>),
    Unit(Result<(), RemoteError>),
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, StoredRow>>,
    replies: HashMap<String, Reply>,
    /// Keys in `replies`, oldest first.
    reply_order: VecDeque<String>,
    reply_capacity: Option<usize>,
    next_version: u64,
    clock: Option<DateTime<Utc>>,
    calls: usize,
    fail_next: usize,
    lose_next: usize,
    offline: bool,
}

impl Inner {
    fn reachable(&mut self) -> Result<(), RemoteError> {
        self.calls += 1;
        if self.offline {
            return Err(RemoteError::Transport("service unreachable".to_string()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RemoteError::Transport("connection reset".to_string()));
        }
        Ok(())
    }

    /// Applied, but the caller never hears about it.
    fn response_lost(&mut self) -> bool {
        if self.lose_next > 0 {
            self.lose_next -= 1;
            return true;
        }
        false
    }

    /// Caches the reply for `key`, evicting the oldest once over capacity.
    fn remember(&mut self, key: &str, reply: Reply) {
        if self.replies.insert(key.to_string(), reply).is_none() {
            self.reply_order.push_back(key.to_string());
        }
        let capacity = self.reply_capacity.unwrap_or(DEFAULT_REPLY_CAPACITY);
        while self.reply_order.len() > capacity {
            if let Some(oldest) = self.reply_order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
    }

    fn next_version(&mut self) -> Version {
        self.next_version += 1;
        Version::new(format!("{:012x}", self.next_version))
    }

    /// Strictly increasing timestamps so `updatedSince` paging never skips.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn table(&mut self, table: &str) -> &mut BTreeMap<String, StoredRow> {
        self.tables.entry(table.to_string()).or_default()
    }

    fn apply_insert(&mut self, table: &str, row: &Row) -> Result<RemoteRow, RemoteError> {
        // A tombstone does not block inserting the id again
        if let Some(existing) = self.table(table).get(&row.id).filter(|s| !s.deleted) {
            return Err(RemoteError::Conflict(Box::new(existing.to_remote(&row.id))));
        }

        let mut fields = row.fields.clone();
        strip_system_properties(&mut fields);
        let stored = StoredRow {
            fields,
            version: self.next_version(),
            updated_at: self.tick(),
            deleted: false,
        };
        let remote = stored.to_remote(&row.id);
        self.table(table).insert(row.id.clone(), stored);
        Ok(remote)
    }

    fn apply_update(&mut self, table: &str, row: &Row) -> Result<RemoteRow, RemoteError> {
        let version = self.next_version();
        let updated_at = self.tick();

        let stored = match self.table(table).get_mut(&row.id) {
            Some(stored) if !stored.deleted => stored,
            _ => return Err(RemoteError::NotFound),
        };
        if let Some(expected) = &row.version {
            if *expected != stored.version {
                return Err(RemoteError::Conflict(Box::new(stored.to_remote(&row.id))));
            }
        }

        let mut fields = row.fields.clone();
        strip_system_properties(&mut fields);
        stored.fields = fields;
        stored.version = version;
        stored.updated_at = updated_at;
        Ok(stored.to_remote(&row.id))
    }

    fn apply_delete(
        &mut self,
        table: &str,
        id: &str,
        version: Option<&Version>,
    ) -> Result<(), RemoteError> {
        let next_version = self.next_version();
        let updated_at = self.tick();

        let stored = match self.table(table).get_mut(id) {
            Some(stored) if !stored.deleted => stored,
            _ => return Err(RemoteError::NotFound),
        };
        if let Some(expected) = version {
            if *expected != stored.version {
                return Err(RemoteError::Conflict(Box::new(stored.to_remote(id))));
            }
        }

        stored.deleted = true;
        stored.version = next_version;
        stored.updated_at = updated_at;
        Ok(())
    }
}

/// In-memory [`RemoteTable`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, outside the lock.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Bounds how many idempotency keys are remembered.
    pub fn with_reply_capacity(mut self, capacity: usize) -> Self {
        self.inner.get_mut().reply_capacity = Some(capacity);
        self
    }

    /// Number of calls that reached the service, failed ones included.
    pub async fn calls(&self) -> usize {
        self.inner.lock().await.calls
    }

    /// Makes the next `count` calls fail with a transport error.
    pub async fn fail_next(&self, count: usize) {
        self.inner.lock().await.fail_next = count;
    }

    /// Applies the next `count` mutations but reports a transport error.
    pub async fn lose_next_response(&self, count: usize) {
        self.inner.lock().await.lose_next = count;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    /// Server-side view of a row, soft-deleted rows included.
    pub async fn get(&self, table: &str, id: &str) -> Option<RemoteRow> {
        let mut inner = self.inner.lock().await;
        inner.table(table).get(id).map(|stored| stored.to_remote(id))
    }

    /// Seeds a row as if another client had written it. Keeps `row.version`
    /// when given, otherwise assigns one.
    pub async fn put(&self, table: &str, row: Row) -> RemoteRow {
        let mut inner = self.inner.lock().await;
        let version = match row.version {
            Some(version) => version,
            None => inner.next_version(),
        };
        let mut fields = row.fields;
        strip_system_properties(&mut fields);
        let stored = StoredRow {
            fields,
            version,
            updated_at: inner.tick(),
            deleted: false,
        };
        let remote = stored.to_remote(&row.id);
        inner.table(table).insert(row.id, stored);
        remote
    }

    /// Soft-deletes a row as if another client had done it.
    pub async fn remove(&self, table: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.apply_delete(table, id, None).is_ok()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteTable for MemoryRemote {
    async fn insert(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.reachable()?;

        if let Some(Reply::Row(reply)) = inner.replies.get(key) {
            return reply.clone();
        }
        let reply = inner.apply_insert(table, row);
        inner.remember(key, Reply::Row(reply.clone()));

        if inner.response_lost() {
            return Err(RemoteError::Transport("response lost".to_string()));
        }
        reply
    }

    async fn update(&self, table: &str, row: &Row, key: &str) -> Result<RemoteRow, RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.reachable()?;

        if let Some(Reply::Row(reply)) = inner.replies.get(key) {
            return reply.clone();
        }
        let reply = inner.apply_update(table, row);
        inner.remember(key, Reply::Row(reply.clone()));

        if inner.response_lost() {
            return Err(RemoteError::Transport("response lost".to_string()));
        }
        reply
    }

    async fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&Version>,
        key: &str,
    ) -> Result<(), RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.reachable()?;

        if let Some(Reply::Unit(reply)) = inner.replies.get(key) {
            return reply.clone();
        }
        let reply = inner.apply_delete(table, id, version);
        inner.remember(key, Reply::Unit(reply.clone()));

        if inner.response_lost() {
            return Err(RemoteError::Transport("response lost".to_string()));
        }
        reply
    }

    async fn changes(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock().await;
        inner.reachable()?;

        let mut changed: Vec<RemoteRow> = inner
            .table(table)
            .iter()
            .filter(|(_, stored)| since.map_or(true, |mark| stored.updated_at > mark))
            .map(|(id, stored)| stored.to_remote(id))
            .collect();
        changed.sort_by_key(|remote| remote.updated_at);
        changed.truncate(limit);
        Ok(changed)
    }
}
