//! 内存存储实现（默认后端，也用于测试）
//! In-memory stores: the default backend, also used by tests.

use super::traits::{IndexSpec, LedgerStore, OfflineStore, StoreError, StoreResult, UserDirectory};
use crate::comm::settings::DirectoryUser;
use crate::domain::{
    AckKind, DeliveryRecord, DeliveryStatus, MessageCounts, NotificationLog, OnlineStatus, Page, PageRequest,
    PushChannel, PushRecord, PushStatus, RecordQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// 可切换的可用性开关，用于模拟后端故障
/// Availability switch used to simulate backend outages.
#[derive(Debug)]
struct Availability(AtomicBool);

impl Default for Availability {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl Availability {
    fn check(&self, backend: &str) -> StoreResult<()> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} offline", backend)))
        }
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }
}

struct OfflineList {
    items: VecDeque<String>,
    expires_at: Instant,
}

/// 内存离线存储，语义与 Redis 列表一致
#[derive(Default)]
pub struct MemoryOfflineStore {
    lists: DashMap<String, OfflineList>,
    availability: Availability,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }

    fn purge_expired(&self, key: &str) {
        self.lists.remove_if(key, |_, l| l.expires_at <= Instant::now());
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> StoreResult<()> {
        self.availability.check("offline store")?;
        let now = Instant::now();
        let mut list = self.lists.entry(key.to_string()).or_insert_with(|| OfflineList {
            items: VecDeque::with_capacity(cap.min(16)),
            expires_at: now,
        });
        if list.expires_at <= now {
            list.items.clear();
        }
        list.items.push_front(value);
        list.items.truncate(cap);
        list.expires_at = now + ttl;
        Ok(())
    }

    async fn range_all(&self, key: &str) -> StoreResult<Vec<String>> {
        self.availability.check("offline store")?;
        self.purge_expired(key);
        Ok(self
            .lists
            .get(key)
            .map(|l| l.items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_oldest(&self, key: &str, count: usize) -> StoreResult<()> {
        self.availability.check("offline store")?;
        if let Some(mut list) = self.lists.get_mut(key) {
            let keep = list.items.len().saturating_sub(count);
            list.items.truncate(keep);
        }
        self.lists.remove_if(key, |_, l| l.items.is_empty());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.availability.check("offline store")?;
        self.lists.remove(key);
        Ok(())
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        self.availability.check("offline store")?;
        self.purge_expired(key);
        Ok(self.lists.get(key).map(|l| l.items.len()).unwrap_or(0))
    }
}

#[derive(Default)]
struct LedgerTables {
    indexes: Vec<IndexSpec>,
    records: HashMap<(String, i64), DeliveryRecord>,
    push_records: HashMap<String, PushRecord>,
    logs: Vec<NotificationLog>,
    statuses: HashMap<i64, OnlineStatus>,
}

/// 内存投递记录存储；唯一键由 map 的键保证
/// In-memory ledger; unique keys are the map keys.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: RwLock<LedgerTables>,
    availability: Availability,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }

    pub fn index_names(&self) -> Vec<&'static str> {
        self.tables.read().indexes.iter().map(|i| i.name).collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<()> {
        self.availability.check("ledger")?;
        let mut tables = self.tables.write();
        for spec in specs {
            if !tables.indexes.iter().any(|i| i.name == spec.name) {
                tables.indexes.push(spec.clone());
            }
        }
        Ok(())
    }

    async fn insert_record(&self, record: DeliveryRecord) -> StoreResult<()> {
        self.availability.check("ledger")?;
        let mut tables = self.tables.write();
        let key = (record.message_id.clone(), record.user_id);
        if tables.records.contains_key(&key) {
            return Err(StoreError::Conflict(format!("({}, {})", key.0, key.1)));
        }
        tables.records.insert(key, record);
        Ok(())
    }

    async fn update_delivery(
        &self,
        message_id: &str,
        user_id: i64,
        status: DeliveryStatus,
        channel: PushChannel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.availability.check("ledger")?;
        let mut tables = self.tables.write();
        match tables.records.get_mut(&(message_id.to_string(), user_id)) {
            Some(r) => {
                r.delivery_status = status;
                r.push_channel = channel;
                r.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_ack(
        &self,
        message_id: &str,
        user_id: i64,
        ack: AckKind,
        at: DateTime<Utc>,
        connection_id: Option<&str>,
    ) -> StoreResult<Option<DeliveryRecord>> {
        self.availability.check("ledger")?;
        let mut tables = self.tables.write();
        Ok(tables.records.get_mut(&(message_id.to_string(), user_id)).map(|r| {
            r.apply_ack(ack, at, connection_id);
            r.clone()
        }))
    }

    async fn find_record(&self, message_id: &str, user_id: i64) -> StoreResult<Option<DeliveryRecord>> {
        self.availability.check("ledger")?;
        Ok(self.tables.read().records.get(&(message_id.to_string(), user_id)).cloned())
    }

    async fn query_records(&self, query: &RecordQuery) -> StoreResult<Page<DeliveryRecord>> {
        self.availability.check("ledger")?;
        let mut matched: Vec<DeliveryRecord> = self
            .tables
            .read()
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.user_id.cmp(&b.user_id)));
        Ok(Page::from_sorted(matched, query.paging()))
    }

    async fn message_counts(&self, message_id: &str) -> StoreResult<MessageCounts> {
        self.availability.check("ledger")?;
        let mut counts = MessageCounts::default();
        for r in self.tables.read().records.values().filter(|r| r.message_id == message_id) {
            counts.add(r);
        }
        Ok(counts)
    }

    async fn insert_push_record(&self, record: PushRecord) -> StoreResult<()> {
        self.availability.check("ledger")?;
        let mut tables = self.tables.write();
        if tables.push_records.contains_key(&record.message_id) {
            return Err(StoreError::Conflict(record.message_id));
        }
        tables.push_records.insert(record.message_id.clone(), record);
        Ok(())
    }

    async fn finish_push_record(
        &self,
        message_id: &str,
        status: PushStatus,
        delivered: u64,
        failed: u64,
        total: u64,
    ) -> StoreResult<()> {
        self.availability.check("ledger")?;
        if let Some(p) = self.tables.write().push_records.get_mut(message_id) {
            p.status = status;
            p.delivered_count = delivered;
            p.failed_count = failed;
            p.total_count = total;
        }
        Ok(())
    }

    async fn push_record_exists(&self, message_id: &str) -> StoreResult<bool> {
        self.availability.check("ledger")?;
        Ok(self.tables.read().push_records.contains_key(message_id))
    }

    async fn remove_push_record(&self, message_id: &str) -> StoreResult<()> {
        self.availability.check("ledger")?;
        self.tables.write().push_records.remove(message_id);
        Ok(())
    }

    async fn list_push_records(&self, page: PageRequest) -> StoreResult<Page<PushRecord>> {
        self.availability.check("ledger")?;
        let mut all: Vec<PushRecord> = self.tables.read().push_records.values().cloned().collect();
        all.sort_by(|a, b| b.push_time.cmp(&a.push_time));
        Ok(Page::from_sorted(all, page))
    }

    async fn append_log(&self, log: NotificationLog) -> StoreResult<()> {
        self.availability.check("ledger")?;
        self.tables.write().logs.push(log);
        Ok(())
    }

    async fn logs_for(&self, message_id: &str, limit: usize) -> StoreResult<Vec<NotificationLog>> {
        self.availability.check("ledger")?;
        let mut logs: Vec<NotificationLog> = self
            .tables
            .read()
            .logs
            .iter()
            .filter(|l| l.message_id == message_id)
            .cloned()
            .collect();
        // 稳定排序：同一时间戳保持追加顺序的倒序
        logs.reverse();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn load_status(&self, user_id: i64) -> StoreResult<Option<OnlineStatus>> {
        self.availability.check("ledger")?;
        Ok(self.tables.read().statuses.get(&user_id).cloned())
    }

    async fn upsert_status(&self, status: OnlineStatus) -> StoreResult<()> {
        self.availability.check("ledger")?;
        self.tables.write().statuses.insert(status.user_id, status);
        Ok(())
    }

    async fn online_statuses(&self) -> StoreResult<Vec<OnlineStatus>> {
        self.availability.check("ledger")?;
        let mut rows: Vec<OnlineStatus> =
            self.tables.read().statuses.values().filter(|s| s.is_online).cloned().collect();
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rows)
    }

    async fn touch_status(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.availability.check("ledger")?;
        if let Some(s) = self.tables.write().statuses.get_mut(&user_id) {
            s.last_seen = at;
            s.updated_at = at;
        }
        Ok(())
    }

    async fn force_offline(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        self.availability.check("ledger")?;
        if let Some(s) = self.tables.write().statuses.get_mut(&user_id) {
            s.is_online = false;
            s.offline_time = Some(at);
            s.updated_at = at;
        }
        Ok(())
    }
}

/// 静态用户目录（来自配置）
/// Static user directory, seeded from configuration.
#[derive(Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<i64, (String, bool)>>,
    availability: Availability,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: &[DirectoryUser]) -> Self {
        let dir = Self::new();
        for u in users {
            dir.insert(u.id, &u.username, u.admin);
        }
        dir
    }

    pub fn insert(&self, user_id: i64, username: &str, admin: bool) {
        self.users.write().insert(user_id, (username.to_string(), admin));
    }

    pub fn remove(&self, user_id: i64) {
        self.users.write().remove(&user_id);
    }

    pub fn set_available(&self, available: bool) {
        self.availability.set(available);
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn admin_user_ids(&self) -> StoreResult<Vec<i64>> {
        self.availability.check("directory")?;
        let mut ids: Vec<i64> = self
            .users
            .read()
            .iter()
            .filter(|(_, (_, admin))| *admin)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn username(&self, user_id: i64) -> StoreResult<Option<String>> {
        self.availability.check("directory")?;
        Ok(self.users.read().get(&user_id).map(|(name, _)| name.clone()))
    }
}
