use crate::comm::settings::OfflineSettings;
use crate::domain::{Notification, NotificationType, OfflineEntry, WireFrame};
use crate::error::NotifyError;
use crate::storage::{OfflineStore, StoreError};
use crate::ws::Connection;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// 离线消息缓冲：每用户一个有上限的列表（最新在前）
/// Offline buffer: one capped list per user, newest first.
pub struct OfflineBuffer {
    store: Arc<dyn OfflineStore>,
    settings: OfflineSettings,
}

impl OfflineBuffer {
    pub fn new(store: Arc<dyn OfflineStore>, mut settings: OfflineSettings) -> Self {
        // LTRIM 0 -1 会保留整个列表，上限至少为 1
        settings.max_entries = settings.max_entries.max(1);
        Self { store, settings }
    }

    pub fn key(&self, user_id: i64) -> String {
        format!("{}{}", self.settings.key_prefix, user_id)
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.settings.deadline_secs)
    }

    async fn call<T>(&self, op: &str, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, NotifyError> {
        match tokio::time::timeout(self.deadline(), fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(NotifyError::OfflineStoreUnavailable(format!("{}: {}", op, e))),
            Err(_) => Err(NotifyError::OfflineStoreUnavailable(format!("{}: deadline exceeded", op))),
        }
    }

    /// 头部插入、截断并续期，作为一个批次提交
    /// Prepend, trim and refresh the TTL as one batch.
    pub async fn push(&self, user_id: i64, notification: &Notification) -> Result<(), NotifyError> {
        let entry = OfflineEntry {
            saved_at: Utc::now(),
            notification: notification.clone(),
        };
        let value = serde_json::to_string(&entry)
            .map_err(|e| NotifyError::OfflineStoreUnavailable(format!("encode: {}", e)))?;
        let key = self.key(user_id);
        self.call(
            "push",
            self.store.push_capped(
                &key,
                value,
                self.settings.max_entries,
                Duration::from_secs(self.settings.ttl_secs),
            ),
        )
        .await?;
        tracing::debug!(user_id, message_id = %notification.message_id, "offline message stored");
        Ok(())
    }

    /// 按提交顺序（最旧在前）回放到连接；全部入队成功后才移除已读取的条目，
    /// 回放期间新写入的消息保留在列表中。返回已回放的消息 ID。
    /// Replay to the connection oldest-first; only after every entry was enqueued are the
    /// entries that were read removed, so pushes racing the replay stay buffered.
    /// Returns the replayed message IDs.
    pub async fn drain_to(&self, user_id: i64, conn: &Connection) -> Result<Vec<String>, NotifyError> {
        let key = self.key(user_id);
        let raw = self.call("range", self.store.range_all(&key)).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut replayed = Vec::with_capacity(raw.len());
        for value in raw.iter().rev() {
            let entry: OfflineEntry = match serde_json::from_str(value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(user_id, "skipping undecodable offline entry: {}", e);
                    continue;
                }
            };
            let frame = self
                .replay_frame(entry.notification.clone())
                .encode()
                .map_err(|e| NotifyError::Transport(format!("encode offline frame: {}", e)))?;
            conn.enqueue(frame)?;
            replayed.push(entry.notification.message_id);
        }

        self.call("remove_oldest", self.store.remove_oldest(&key, raw.len()))
            .await?;
        tracing::info!(user_id, count = replayed.len(), "📋 Offline messages replayed");
        Ok(replayed)
    }

    fn replay_frame(&self, mut notification: Notification) -> WireFrame {
        notification.content = format!("{}{}", self.settings.marker, notification.content);
        notification.kind = NotificationType::OfflineMessage;
        WireFrame::from_notification(&notification)
    }

    pub async fn count(&self, user_id: i64) -> Result<usize, NotifyError> {
        self.call("count", self.store.len(&self.key(user_id))).await
    }

    pub async fn clear(&self, user_id: i64) -> Result<(), NotifyError> {
        self.call("clear", self.store.delete(&self.key(user_id))).await
    }
}
