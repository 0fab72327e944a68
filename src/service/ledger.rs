use crate::domain::{
    AckKind, DeliveryRecord, DeliveryStatus, LogEvent, MessageStats, NotificationLog, OnlineStatus, Page, PageRequest,
    PushChannel, PushRecord, PushStatus, RecordQuery,
};
use crate::error::NotifyError;
use crate::storage::{LedgerStore, StoreError, REQUIRED_INDEXES};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 投递台账：接收记录、在线状态、推送记录与迁移日志
/// Delivery ledger: receive records, online status, push records and the transition log.
///
/// 每次存储调用都有独立的超时。
/// Every store call runs under its own deadline.
pub struct DeliveryLedger {
    store: Arc<dyn LedgerStore>,
    deadline: Duration,
    log_limit: usize,
    failed_writes: AtomicU64,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn LedgerStore>, deadline: Duration, log_limit: usize) -> Self {
        Self {
            store,
            deadline,
            log_limit,
            failed_writes: AtomicU64::new(0),
        }
    }

    async fn call<T>(&self, op: &str, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, NotifyError> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(NotifyError::LedgerUnavailable(format!("{}: {}", op, e))),
            Err(_) => Err(NotifyError::LedgerUnavailable(format!("{}: deadline exceeded", op))),
        }
    }

    /// 启动时创建索引 / Create indexes at startup
    pub async fn ensure_indexes(&self) -> Result<(), NotifyError> {
        self.call("ensure_indexes", self.store.ensure_indexes(REQUIRED_INDEXES))
            .await?;
        tracing::info!(count = REQUIRED_INDEXES.len(), "✅ Ledger indexes ensured");
        Ok(())
    }

    /// 写入接收记录；记录已存在时返回 `Ok(false)`
    /// Insert a receive record; `Ok(false)` when it already exists.
    pub async fn record_delivery(&self, record: DeliveryRecord) -> Result<bool, NotifyError> {
        match tokio::time::timeout(self.deadline, self.store.insert_record(record)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(StoreError::Conflict(_))) => Ok(false),
            Ok(Err(e)) => Err(NotifyError::LedgerUnavailable(format!("insert_record: {}", e))),
            Err(_) => Err(NotifyError::LedgerUnavailable("insert_record: deadline exceeded".to_string())),
        }
    }

    pub async fn update_delivery(
        &self,
        message_id: &str,
        user_id: i64,
        status: DeliveryStatus,
        channel: PushChannel,
    ) -> Result<bool, NotifyError> {
        self.call(
            "update_delivery",
            self.store.update_delivery(message_id, user_id, status, channel, Utc::now()),
        )
        .await
    }

    /// 幂等确认：不存在的记录返回 `NotFound`
    /// Idempotent ack; a missing record yields `NotFound`.
    pub async fn mark(
        &self,
        message_id: &str,
        user_id: i64,
        ack: AckKind,
        connection_id: Option<&str>,
    ) -> Result<DeliveryRecord, NotifyError> {
        let at = Utc::now();
        let record = self
            .call(
                "apply_ack",
                self.store.apply_ack(message_id, user_id, ack, at, connection_id),
            )
            .await?
            .ok_or_else(|| NotifyError::NotFound(format!("receive record ({}, {})", message_id, user_id)))?;

        self.append_log(
            NotificationLog::new(message_id, Some(user_id), ack.log_event()).with_connection(connection_id),
        )
        .await;
        Ok(record)
    }

    pub async fn find_record(&self, message_id: &str, user_id: i64) -> Result<Option<DeliveryRecord>, NotifyError> {
        self.call("find_record", self.store.find_record(message_id, user_id))
            .await
    }

    pub async fn query_records(&self, query: &RecordQuery) -> Result<Page<DeliveryRecord>, NotifyError> {
        self.call("query_records", self.store.query_records(query)).await
    }

    pub async fn message_stats(&self, message_id: &str) -> Result<MessageStats, NotifyError> {
        let counts = self
            .call("message_counts", self.store.message_counts(message_id))
            .await?;
        Ok(MessageStats::from_counts(message_id, counts))
    }

    pub async fn create_push_record(&self, record: PushRecord) -> Result<(), NotifyError> {
        match tokio::time::timeout(self.deadline, self.store.insert_push_record(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(StoreError::Conflict(id))) => Err(NotifyError::validation(
                "message_id",
                format!("消息ID已存在: {}", id),
            )),
            Ok(Err(e)) => Err(NotifyError::LedgerUnavailable(format!("insert_push_record: {}", e))),
            Err(_) => Err(NotifyError::LedgerUnavailable(
                "insert_push_record: deadline exceeded".to_string(),
            )),
        }
    }

    pub async fn finish_push_record(
        &self,
        message_id: &str,
        delivered: u64,
        failed: u64,
        total: u64,
    ) -> Result<PushStatus, NotifyError> {
        let status = PushStatus::from_counts(delivered, failed, total);
        self.call(
            "finish_push_record",
            self.store
                .finish_push_record(message_id, status, delivered, failed, total),
        )
        .await?;
        Ok(status)
    }

    pub async fn push_record_exists(&self, message_id: &str) -> Result<bool, NotifyError> {
        self.call("push_record_exists", self.store.push_record_exists(message_id))
            .await
    }

    pub async fn remove_push_record(&self, message_id: &str) -> Result<(), NotifyError> {
        self.call("remove_push_record", self.store.remove_push_record(message_id))
            .await
    }

    pub async fn list_push_records(&self, page: PageRequest) -> Result<Page<PushRecord>, NotifyError> {
        self.call("list_push_records", self.store.list_push_records(page))
            .await
    }

    /// 追加迁移日志；失败只记录警告
    /// Append to the transition log; failures are only logged.
    pub async fn append_log(&self, log: NotificationLog) {
        let message_id = log.message_id.clone();
        let event = log.event_type;
        if let Err(e) = self.call("append_log", self.store.append_log(log)).await {
            self.record_failed_write();
            tracing::warn!(message_id = %message_id, event = event.as_str(), "transition log write failed: {}", e);
        }
    }

    pub async fn log_event(&self, message_id: &str, user_id: Option<i64>, event: LogEvent) {
        self.append_log(NotificationLog::new(message_id, user_id, event)).await;
    }

    pub async fn logs_for(&self, message_id: &str, limit: Option<usize>) -> Result<Vec<NotificationLog>, NotifyError> {
        let limit = limit.unwrap_or(self.log_limit).min(self.log_limit).max(1);
        self.call("logs_for", self.store.logs_for(message_id, limit)).await
    }

    pub async fn load_status(&self, user_id: i64) -> Result<Option<OnlineStatus>, NotifyError> {
        self.call("load_status", self.store.load_status(user_id)).await
    }

    pub async fn upsert_status(&self, status: OnlineStatus) -> Result<(), NotifyError> {
        self.call("upsert_status", self.store.upsert_status(status)).await
    }

    pub async fn online_statuses(&self) -> Result<Vec<OnlineStatus>, NotifyError> {
        self.call("online_statuses", self.store.online_statuses()).await
    }

    pub async fn touch_status(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), NotifyError> {
        self.call("touch_status", self.store.touch_status(user_id, at)).await
    }

    pub async fn force_offline(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), NotifyError> {
        self.call("force_offline", self.store.force_offline(user_id, at)).await
    }

    pub fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }
}
