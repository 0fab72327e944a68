use crate::error::NotifyError;
use crate::storage::UserDirectory;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 管理员名单快照 / Admin roster snapshot
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub user_ids: Vec<i64>,
    loaded_at: Option<Instant>,
}

impl RosterSnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

/// 短 TTL 管理员名单缓存，读取无锁
/// Short-TTL admin roster cache with lock-free reads.
pub struct AdminRoster {
    directory: Arc<dyn UserDirectory>,
    snapshot: ArcSwap<RosterSnapshot>,
    ttl: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AdminRoster {
    pub fn new(directory: Arc<dyn UserDirectory>, ttl: Duration) -> Self {
        Self {
            directory,
            snapshot: ArcSwap::from_pointee(RosterSnapshot::default()),
            ttl,
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 返回当前快照，过期时先刷新；刷新失败继续使用旧快照
    /// Current snapshot, refreshed when stale; a failed refresh keeps the previous one.
    pub async fn current(&self) -> Arc<RosterSnapshot> {
        let snapshot = self.snapshot.load_full();
        if snapshot.is_fresh(self.ttl) {
            return snapshot;
        }

        let _guard = self.refresh_lock.lock().await;
        // 等锁期间可能已被其他调用者刷新
        let snapshot = self.snapshot.load_full();
        if snapshot.is_fresh(self.ttl) {
            return snapshot;
        }
        if let Err(e) = self.reload().await {
            tracing::warn!("admin roster refresh failed, serving previous snapshot: {}", e);
        }
        self.snapshot.load_full()
    }

    /// 强制重新加载 / Force a reload
    pub async fn refresh(&self) -> Result<usize, NotifyError> {
        let _guard = self.refresh_lock.lock().await;
        self.reload().await
    }

    async fn reload(&self) -> Result<usize, NotifyError> {
        let mut ids = self
            .directory
            .admin_user_ids()
            .await
            .map_err(|e| NotifyError::DirectoryUnavailable(format!("admin roster: {}", e)))?;
        ids.sort_unstable();
        ids.dedup();
        let count = ids.len();
        self.snapshot.store(Arc::new(RosterSnapshot {
            user_ids: ids,
            loaded_at: Some(Instant::now()),
        }));
        tracing::debug!(admins = count, "📋 Admin roster refreshed");
        Ok(count)
    }

    /// 不触发刷新的快照读取
    pub fn cached(&self) -> Arc<RosterSnapshot> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StaticDirectory;

    #[tokio::test]
    async fn test_loads_admins_on_first_use() {
        let dir = Arc::new(StaticDirectory::default());
        dir.insert(1, "alice", true);
        dir.insert(2, "bob", true);
        dir.insert(3, "carol", false);
        let roster = AdminRoster::new(dir, Duration::from_secs(300));
        assert!(roster.cached().user_ids.is_empty());
        assert_eq!(roster.current().await.user_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_not_reloaded() {
        let dir = Arc::new(StaticDirectory::default());
        dir.insert(1, "alice", true);
        let roster = AdminRoster::new(dir.clone(), Duration::from_secs(300));
        roster.current().await;
        dir.insert(2, "bob", true);
        assert_eq!(roster.current().await.user_ids, vec![1]);
        roster.refresh().await.unwrap();
        assert_eq!(roster.current().await.user_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let dir = Arc::new(StaticDirectory::default());
        dir.insert(1, "alice", true);
        let roster = AdminRoster::new(dir.clone(), Duration::ZERO);
        assert_eq!(roster.current().await.user_ids, vec![1]);
        dir.set_available(false);
        assert_eq!(roster.current().await.user_ids, vec![1]);
        assert!(matches!(
            roster.refresh().await,
            Err(NotifyError::DirectoryUnavailable(_))
        ));
    }
}
