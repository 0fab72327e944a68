use crate::domain::{
    AckKind, DeliveryRecord, DeliveryStatus, MessageCounts, NotificationLog, OnlineStatus, Page, PageRequest,
    PushChannel, PushRecord, PushStatus, RecordQuery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// 存储层错误 / Storage error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 后端不可达或操作失败 / backend unreachable or operation failed
    #[error("存储不可用: {0}")]
    Unavailable(String),
    /// 唯一约束冲突 / unique constraint violated
    #[error("唯一约束冲突: {0}")]
    Conflict(String),
    #[error("数据编码错误: {0}")]
    Codec(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 索引描述 / Index description, enforced at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub name: &'static str,
    pub fields: &'static [&'static str],
    pub unique: bool,
}

impl IndexSpec {
    const fn new(collection: &'static str, name: &'static str, fields: &'static [&'static str], unique: bool) -> Self {
        Self { collection, name, fields, unique }
    }
}

pub const RECEIVE_RECORDS: &str = "admin_user_receive_records";
pub const ONLINE_STATUS: &str = "admin_user_online_status";
pub const PUSH_RECORDS: &str = "push_records";
pub const NOTIFICATION_LOGS: &str = "notification_logs";

/// 必需的索引 / Required indexes
pub const REQUIRED_INDEXES: &[IndexSpec] = &[
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_message_id", &["message_id"], false),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_user_id", &["user_id"], false),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_created_at", &["created_at DESC"], false),
    IndexSpec::new(RECEIVE_RECORDS, "uniq_rr_message_user", &["message_id", "user_id"], true),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_is_online", &["is_online_at_send"], false),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_is_received", &["is_received"], false),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_is_read", &["is_read"], false),
    IndexSpec::new(RECEIVE_RECORDS, "idx_rr_is_confirmed", &["is_confirmed"], false),
    IndexSpec::new(ONLINE_STATUS, "uniq_os_user_id", &["user_id"], true),
    IndexSpec::new(ONLINE_STATUS, "idx_os_is_online", &["is_online"], false),
    IndexSpec::new(ONLINE_STATUS, "idx_os_last_seen", &["last_seen DESC"], false),
    IndexSpec::new(ONLINE_STATUS, "idx_os_username", &["username"], false),
    IndexSpec::new(PUSH_RECORDS, "uniq_pr_message_id", &["message_id"], true),
    IndexSpec::new(PUSH_RECORDS, "idx_pr_push_time", &["push_time DESC"], false),
    IndexSpec::new(NOTIFICATION_LOGS, "idx_nl_message_time", &["message_id", "timestamp DESC"], false),
];

/// 离线消息的键值存储
/// Key-value store backing the offline buffer.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// 头部插入、截断到 `cap`、设置过期时间，三步作为一个原子批次提交
    /// Prepend, trim to `cap` and set the TTL as one atomic batch.
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> StoreResult<()>;
    /// 读取整个列表（最新在前）/ whole list, newest first
    async fn range_all(&self, key: &str) -> StoreResult<Vec<String>>;
    /// 从尾部（最旧一端）移除 `count` 条；列表为空时删除键
    /// Remove `count` entries from the oldest end; an emptied list loses its key.
    async fn remove_oldest(&self, key: &str, count: usize) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn len(&self, key: &str) -> StoreResult<usize>;
}

/// 投递记录文档存储
/// Document store behind the delivery ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 创建或确认索引 / create or verify indexes
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<()>;

    /// 唯一键冲突时返回 `Conflict` / `Conflict` on duplicate `(message_id, user_id)`
    async fn insert_record(&self, record: DeliveryRecord) -> StoreResult<()>;

    /// 更新投递状态，返回是否命中记录
    async fn update_delivery(
        &self,
        message_id: &str,
        user_id: i64,
        status: DeliveryStatus,
        channel: PushChannel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// 原子地应用确认（时间戳首次写入为准），记录不存在时返回 `None`
    /// Apply an ack atomically with first-write-wins timestamps; `None` when absent.
    async fn apply_ack(
        &self,
        message_id: &str,
        user_id: i64,
        ack: AckKind,
        at: DateTime<Utc>,
        connection_id: Option<&str>,
    ) -> StoreResult<Option<DeliveryRecord>>;

    async fn find_record(&self, message_id: &str, user_id: i64) -> StoreResult<Option<DeliveryRecord>>;

    /// 按创建时间倒序分页 / newest first
    async fn query_records(&self, query: &RecordQuery) -> StoreResult<Page<DeliveryRecord>>;

    async fn message_counts(&self, message_id: &str) -> StoreResult<MessageCounts>;

    async fn insert_push_record(&self, record: PushRecord) -> StoreResult<()>;

    async fn finish_push_record(
        &self,
        message_id: &str,
        status: PushStatus,
        delivered: u64,
        failed: u64,
        total: u64,
    ) -> StoreResult<()>;

    async fn push_record_exists(&self, message_id: &str) -> StoreResult<bool>;

    /// 未被受理的提交撤销其推送记录 / drop the record of a submission that was not accepted
    async fn remove_push_record(&self, message_id: &str) -> StoreResult<()>;

    async fn list_push_records(&self, page: PageRequest) -> StoreResult<Page<PushRecord>>;

    async fn append_log(&self, log: NotificationLog) -> StoreResult<()>;

    /// 最新在前 / newest first
    async fn logs_for(&self, message_id: &str, limit: usize) -> StoreResult<Vec<NotificationLog>>;

    async fn load_status(&self, user_id: i64) -> StoreResult<Option<OnlineStatus>>;

    async fn upsert_status(&self, status: OnlineStatus) -> StoreResult<()>;

    async fn online_statuses(&self) -> StoreResult<Vec<OnlineStatus>>;

    /// 刷新 `last_seen` / refresh `last_seen`
    async fn touch_status(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// 直接写入下线标记，不累计在线时长
    /// Direct write of `is_online=false`; does not accumulate online time.
    async fn force_offline(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()>;
}

/// 业务用户目录（管理员名单与用户名）
/// Business user directory: admin roster and usernames.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn admin_user_ids(&self) -> StoreResult<Vec<i64>>;
    async fn username(&self, user_id: i64) -> StoreResult<Option<String>>;
}
