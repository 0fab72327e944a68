use crate::domain::{ConnectionMeta, OnlineStatus};
use crate::error::NotifyError;
use crate::service::ledger::DeliveryLedger;
use crate::ws::PresenceWriter;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

/// 清扫结果 / Sweep outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub touched: usize,
    pub downgraded: usize,
}

/// 在线状态视图 / Presence view over the ledger's online-status rows
///
/// 写入经互斥锁串行化，保证读-改-写的计数正确。
/// Writes are serialized so read-modify-write counters stay consistent.
pub struct PresenceTracker {
    ledger: Arc<DeliveryLedger>,
    stale_after: ChronoDuration,
    write_lock: tokio::sync::Mutex<()>,
}

impl PresenceTracker {
    pub fn new(ledger: Arc<DeliveryLedger>, stale_after: Duration) -> Self {
        Self {
            ledger,
            stale_after: ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::minutes(5)),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn mark_online(&self, user_id: i64, meta: &ConnectionMeta) -> Result<OnlineStatus, NotifyError> {
        let _guard = self.write_lock.lock().await;
        let prev = self.ledger.load_status(user_id).await?;
        let status = OnlineStatus::went_online(prev, user_id, meta, Utc::now());
        self.ledger.upsert_status(status.clone()).await?;
        Ok(status)
    }

    /// 无记录时返回 `Ok(None)` / `Ok(None)` when the user has no row
    pub async fn mark_offline(&self, user_id: i64) -> Result<Option<OnlineStatus>, NotifyError> {
        let _guard = self.write_lock.lock().await;
        let Some(prev) = self.ledger.load_status(user_id).await? else {
            return Ok(None);
        };
        let status = prev.went_offline(Utc::now());
        self.ledger.upsert_status(status.clone()).await?;
        Ok(Some(status))
    }

    /// 列出在线用户；超过过期时间的行直接写为离线，不经过 `mark_offline`
    /// List online users; stale rows are downgraded by a direct write that bypasses
    /// `mark_offline`.
    pub async fn list_online(&self) -> Result<Vec<OnlineStatus>, NotifyError> {
        let now = Utc::now();
        let rows = self.ledger.online_statuses().await?;
        let mut online = Vec::with_capacity(rows.len());
        for row in rows {
            if now - row.last_seen < self.stale_after {
                online.push(row);
                continue;
            }
            tracing::info!(user_id = row.user_id, last_seen = %row.last_seen, "⏰ Stale presence downgraded");
            if let Err(e) = self.ledger.force_offline(row.user_id, now).await {
                tracing::warn!(user_id = row.user_id, "stale presence repair failed: {}", e);
            }
        }
        Ok(online)
    }

    /// 台账中的当前标记，不做过期检查
    /// The ledger's current flag, without a staleness check.
    pub async fn is_online(&self, user_id: i64) -> Result<bool, NotifyError> {
        Ok(self
            .ledger
            .load_status(user_id)
            .await?
            .is_some_and(|s| s.is_online))
    }

    /// 刷新仍有连接的用户的 `last_seen`，没有连接的在线行写为离线。
    /// 先读取在线行，再逐行在写锁内检查连接，与 `mark_online` 串行。
    /// Refresh `last_seen` for users with live sockets; online rows without one go offline.
    /// Rows are read first and each liveness check runs under the write lock, so a
    /// concurrent `mark_online` is never overwritten.
    pub async fn sweep(&self, is_live: impl Fn(i64) -> bool) -> Result<SweepReport, NotifyError> {
        let mut report = SweepReport::default();
        for row in self.ledger.online_statuses().await? {
            let _guard = self.write_lock.lock().await;
            let now = Utc::now();
            if is_live(row.user_id) {
                self.ledger.touch_status(row.user_id, now).await?;
                report.touched += 1;
            } else {
                self.ledger.force_offline(row.user_id, now).await?;
                report.downgraded += 1;
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PresenceWriter for PresenceTracker {
    async fn mark_online(&self, user_id: i64, meta: &ConnectionMeta) {
        if let Err(e) = PresenceTracker::mark_online(self, user_id, meta).await {
            tracing::warn!(user_id, "mark online failed: {}", e);
        }
    }

    async fn mark_offline(&self, user_id: i64) {
        if let Err(e) = PresenceTracker::mark_offline(self, user_id).await {
            tracing::warn!(user_id, "mark offline failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LedgerStore, MemoryLedgerStore};

    fn tracker() -> (PresenceTracker, Arc<MemoryLedgerStore>) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(DeliveryLedger::new(store.clone(), Duration::from_secs(5), 100));
        (PresenceTracker::new(ledger, Duration::from_secs(300)), store)
    }

    fn meta(conn: &str) -> ConnectionMeta {
        ConnectionMeta {
            username: "alice".to_string(),
            connection_id: conn.to_string(),
            client_ip: "10.0.0.1".to_string(),
            user_agent: "test-agent/1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reconnect_without_disconnect_keeps_count() {
        let (tracker, _) = tracker();
        tracker.mark_online(1, &meta("a")).await.unwrap();
        let s = tracker.mark_online(1, &meta("b")).await.unwrap();
        assert_eq!(s.total_online_count, 1);
        assert_eq!(s.connection_id.as_deref(), Some("b"));

        tracker.mark_offline(1).await.unwrap();
        let s = tracker.mark_online(1, &meta("c")).await.unwrap();
        assert_eq!(s.total_online_count, 2);
    }

    #[tokio::test]
    async fn test_offline_accumulates_seconds() {
        let (tracker, store) = tracker();
        let mut s = tracker.mark_online(2, &meta("a")).await.unwrap();
        s.online_time = Some(Utc::now() - ChronoDuration::seconds(90));
        store.upsert_status(s).await.unwrap();
        let off = tracker.mark_offline(2).await.unwrap().unwrap();
        assert!(!off.is_online);
        assert!(off.total_online_seconds >= 90);
        assert!(off.offline_time.is_some());
        assert!(tracker.mark_offline(404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_online_repairs_stale_rows() {
        let (tracker, store) = tracker();
        let mut stale = tracker.mark_online(13, &meta("a")).await.unwrap();
        stale.last_seen = Utc::now() - ChronoDuration::minutes(10);
        store.upsert_status(stale).await.unwrap();
        tracker.mark_online(14, &meta("b")).await.unwrap();

        let online: Vec<i64> = tracker.list_online().await.unwrap().iter().map(|s| s.user_id).collect();
        assert_eq!(online, vec![14]);
        assert!(!tracker.is_online(13).await.unwrap());
        assert!(tracker.is_online(14).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_downgrades_users_without_sockets() {
        let (tracker, _) = tracker();
        tracker.mark_online(1, &meta("a")).await.unwrap();
        tracker.mark_online(2, &meta("b")).await.unwrap();
        let report = tracker.sweep(|uid| uid == 1).await.unwrap();
        assert_eq!(report, SweepReport { touched: 1, downgraded: 1 });
        assert!(tracker.is_online(1).await.unwrap());
        assert!(!tracker.is_online(2).await.unwrap());
    }
}
