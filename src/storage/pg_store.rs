//! PostgreSQL 投递记录存储与用户目录（`postgres` feature）
//! PostgreSQL ledger store and user directory

use super::traits::{
    IndexSpec, LedgerStore, StoreError, StoreResult, UserDirectory, NOTIFICATION_LOGS, ONLINE_STATUS, PUSH_RECORDS,
    RECEIVE_RECORDS,
};
use crate::domain::{
    AckKind, DeliveryRecord, DeliveryStatus, LogEvent, MessageCounts, NotificationLog, OnlineStatus, Page,
    PageRequest, Priority, PushChannel, PushRecord, PushStatus, RecordQuery, Target,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS admin_user_receive_records (
        message_id TEXT NOT NULL,
        user_id BIGINT NOT NULL,
        username TEXT NOT NULL DEFAULT '',
        delivery_status TEXT NOT NULL,
        is_online_at_send BOOLEAN NOT NULL DEFAULT FALSE,
        is_received BOOLEAN NOT NULL DEFAULT FALSE,
        received_at TIMESTAMPTZ,
        is_read BOOLEAN NOT NULL DEFAULT FALSE,
        read_at TIMESTAMPTZ,
        is_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
        confirmed_at TIMESTAMPTZ,
        push_channel TEXT NOT NULL,
        connection_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS admin_user_online_status (
        user_id BIGINT NOT NULL,
        username TEXT NOT NULL DEFAULT '',
        is_online BOOLEAN NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL,
        online_time TIMESTAMPTZ,
        offline_time TIMESTAMPTZ,
        total_online_count BIGINT NOT NULL DEFAULT 0,
        total_online_seconds BIGINT NOT NULL DEFAULT 0,
        connection_id TEXT,
        client_ip TEXT,
        user_agent TEXT,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS push_records (
        message_id TEXT NOT NULL,
        type TEXT NOT NULL,
        content TEXT NOT NULL,
        target TEXT NOT NULL,
        target_ids BIGINT[] NOT NULL DEFAULT '{}',
        priority TEXT NOT NULL,
        need_confirm BOOLEAN NOT NULL DEFAULT FALSE,
        sender_id BIGINT,
        status TEXT NOT NULL,
        delivered_count BIGINT NOT NULL DEFAULT 0,
        failed_count BIGINT NOT NULL DEFAULT 0,
        total_count BIGINT NOT NULL DEFAULT 0,
        push_time TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS notification_logs (
        id BIGSERIAL PRIMARY KEY,
        message_id TEXT NOT NULL,
        user_id BIGINT,
        event_type TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        connection_id TEXT,
        client_ip TEXT
    )",
];

pub async fn connect_pool(url: &str, max_connections: u32) -> StoreResult<Pool<Postgres>> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .max_lifetime(Some(Duration::from_secs(1800)))
        .idle_timeout(Some(Duration::from_secs(300)))
        .acquire_timeout(Duration::from_secs(3))
        .connect(url)
        .await
        .map_err(db_err)
}

fn db_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
        _ => StoreError::Unavailable(format!("postgres: {}", e)),
    }
}

fn codec<T: std::fmt::Display>(field: &str, value: T) -> StoreError {
    StoreError::Codec(format!("{}: {}", field, value))
}

fn map_record(row: &PgRow) -> StoreResult<DeliveryRecord> {
    let status: String = row.try_get("delivery_status").map_err(db_err)?;
    let channel: String = row.try_get("push_channel").map_err(db_err)?;
    Ok(DeliveryRecord {
        message_id: row.try_get("message_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        username: row.try_get("username").map_err(db_err)?,
        delivery_status: DeliveryStatus::parse(&status).ok_or_else(|| codec("delivery_status", &status))?,
        is_online_at_send: row.try_get("is_online_at_send").map_err(db_err)?,
        is_received: row.try_get("is_received").map_err(db_err)?,
        received_at: row.try_get("received_at").map_err(db_err)?,
        is_read: row.try_get("is_read").map_err(db_err)?,
        read_at: row.try_get("read_at").map_err(db_err)?,
        is_confirmed: row.try_get("is_confirmed").map_err(db_err)?,
        confirmed_at: row.try_get("confirmed_at").map_err(db_err)?,
        push_channel: PushChannel::parse(&channel).ok_or_else(|| codec("push_channel", &channel))?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn map_status(row: &PgRow) -> StoreResult<OnlineStatus> {
    Ok(OnlineStatus {
        user_id: row.try_get("user_id").map_err(db_err)?,
        username: row.try_get("username").map_err(db_err)?,
        is_online: row.try_get("is_online").map_err(db_err)?,
        last_seen: row.try_get("last_seen").map_err(db_err)?,
        online_time: row.try_get("online_time").map_err(db_err)?,
        offline_time: row.try_get("offline_time").map_err(db_err)?,
        total_online_count: row.try_get("total_online_count").map_err(db_err)?,
        total_online_seconds: row.try_get("total_online_seconds").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        client_ip: row.try_get("client_ip").map_err(db_err)?,
        user_agent: row.try_get("user_agent").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn map_push_record(row: &PgRow) -> StoreResult<PushRecord> {
    let target: String = row.try_get("target").map_err(db_err)?;
    let priority: String = row.try_get("priority").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let delivered: i64 = row.try_get("delivered_count").map_err(db_err)?;
    let failed: i64 = row.try_get("failed_count").map_err(db_err)?;
    let total: i64 = row.try_get("total_count").map_err(db_err)?;
    Ok(PushRecord {
        message_id: row.try_get("message_id").map_err(db_err)?,
        kind: row.try_get("type").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        target: Target::from_str(&target).map_err(|e| codec("target", e))?,
        target_ids: row.try_get("target_ids").map_err(db_err)?,
        priority: Priority::from_str(&priority).map_err(|e| codec("priority", e))?,
        need_confirm: row.try_get("need_confirm").map_err(db_err)?,
        sender_id: row.try_get("sender_id").map_err(db_err)?,
        status: PushStatus::parse(&status).ok_or_else(|| codec("status", &status))?,
        delivered_count: delivered.max(0) as u64,
        failed_count: failed.max(0) as u64,
        total_count: total.max(0) as u64,
        push_time: row.try_get("push_time").map_err(db_err)?,
    })
}

fn map_log(row: &PgRow) -> StoreResult<NotificationLog> {
    let event: String = row.try_get("event_type").map_err(db_err)?;
    Ok(NotificationLog {
        message_id: row.try_get("message_id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        event_type: LogEvent::parse(&event).ok_or_else(|| codec("event_type", &event))?,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        connection_id: row.try_get("connection_id").map_err(db_err)?,
        client_ip: row.try_get("client_ip").map_err(db_err)?,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, q: &RecordQuery) {
    qb.push(" WHERE TRUE");
    if let Some(m) = &q.message_id {
        qb.push(" AND message_id = ").push_bind(m.clone());
    }
    if let Some(u) = q.user_id {
        qb.push(" AND user_id = ").push_bind(u);
    }
    if let Some(prefix) = &q.username {
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        qb.push(" AND username LIKE ").push_bind(format!("{}%", escaped));
    }
    if let Some(b) = q.is_online {
        qb.push(" AND is_online_at_send = ").push_bind(b);
    }
    if let Some(b) = q.is_received {
        qb.push(" AND is_received = ").push_bind(b);
    }
    if let Some(b) = q.is_read {
        qb.push(" AND is_read = ").push_bind(b);
    }
    if let Some(b) = q.is_confirmed {
        qb.push(" AND is_confirmed = ").push_bind(b);
    }
    if let Some(s) = q.delivery_status {
        qb.push(" AND delivery_status = ").push_bind(s.as_str());
    }
    if let Some(c) = q.push_channel {
        qb.push(" AND push_channel = ").push_bind(c.as_str());
    }
    if let Some(t) = q.created_from {
        qb.push(" AND created_at >= ").push_bind(t);
    }
    if let Some(t) = q.created_to {
        qb.push(" AND created_at <= ").push_bind(t);
    }
}

/// PostgreSQL 投递记录存储
pub struct PgLedgerStore {
    pool: Pool<Postgres>,
}

impl PgLedgerStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<()> {
        for ddl in CREATE_TABLES {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        for spec in specs {
            let ddl = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if spec.unique { "UNIQUE " } else { "" },
                spec.name,
                spec.collection,
                spec.fields.join(", ")
            );
            sqlx::query(&ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        tracing::info!(
            "✅ ledger schema ready: {}, {}, {}, {}",
            RECEIVE_RECORDS,
            ONLINE_STATUS,
            PUSH_RECORDS,
            NOTIFICATION_LOGS
        );
        Ok(())
    }

    async fn insert_record(&self, r: DeliveryRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO admin_user_receive_records (message_id, user_id, username, delivery_status, \
             is_online_at_send, is_received, received_at, is_read, read_at, is_confirmed, confirmed_at, \
             push_channel, connection_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&r.message_id)
        .bind(r.user_id)
        .bind(&r.username)
        .bind(r.delivery_status.as_str())
        .bind(r.is_online_at_send)
        .bind(r.is_received)
        .bind(r.received_at)
        .bind(r.is_read)
        .bind(r.read_at)
        .bind(r.is_confirmed)
        .bind(r.confirmed_at)
        .bind(r.push_channel.as_str())
        .bind(&r.connection_id)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
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
        let result = sqlx::query(
            "UPDATE admin_user_receive_records SET delivery_status = $3, push_channel = $4, updated_at = $5 \
             WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(status.as_str())
        .bind(channel.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_ack(
        &self,
        message_id: &str,
        user_id: i64,
        ack: AckKind,
        at: DateTime<Utc>,
        connection_id: Option<&str>,
    ) -> StoreResult<Option<DeliveryRecord>> {
        // COALESCE 保证时间戳首次写入为准
        let query = match ack {
            AckKind::Received => sqlx::query(
                "UPDATE admin_user_receive_records SET is_received = TRUE, received_at = COALESCE(received_at, $3), \
                 connection_id = COALESCE(connection_id, $4), updated_at = $3 \
                 WHERE message_id = $1 AND user_id = $2 RETURNING *",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(at)
            .bind(connection_id),
            AckKind::Read => sqlx::query(
                "UPDATE admin_user_receive_records SET is_read = TRUE, read_at = COALESCE(read_at, $3), \
                 updated_at = $3 WHERE message_id = $1 AND user_id = $2 RETURNING *",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(at),
            AckKind::Confirmed => sqlx::query(
                "UPDATE admin_user_receive_records SET is_confirmed = TRUE, \
                 confirmed_at = COALESCE(confirmed_at, $3), updated_at = $3 \
                 WHERE message_id = $1 AND user_id = $2 RETURNING *",
            )
            .bind(message_id)
            .bind(user_id)
            .bind(at),
        };
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;
        row.as_ref().map(map_record).transpose()
    }

    async fn find_record(&self, message_id: &str, user_id: i64) -> StoreResult<Option<DeliveryRecord>> {
        let row = sqlx::query("SELECT * FROM admin_user_receive_records WHERE message_id = $1 AND user_id = $2")
            .bind(message_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_record).transpose()
    }

    async fn query_records(&self, query: &RecordQuery) -> StoreResult<Page<DeliveryRecord>> {
        let paging = query.paging();

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) AS total FROM admin_user_receive_records");
        push_filters(&mut count_qb, query);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("total")
            .map_err(db_err)?;

        let mut qb = QueryBuilder::new("SELECT * FROM admin_user_receive_records");
        push_filters(&mut qb, query);
        qb.push(" ORDER BY created_at DESC, user_id ASC LIMIT ")
            .push_bind(paging.page_size as i64)
            .push(" OFFSET ")
            .push_bind(paging.offset() as i64);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let items = rows.iter().map(map_record).collect::<StoreResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: paging.page,
            page_size: paging.page_size,
        })
    }

    async fn message_counts(&self, message_id: &str) -> StoreResult<MessageCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COUNT(*) FILTER (WHERE is_online_at_send) AS online, \
             COUNT(*) FILTER (WHERE is_received) AS received, \
             COUNT(*) FILTER (WHERE is_read) AS read, \
             COUNT(*) FILTER (WHERE is_confirmed) AS confirmed \
             FROM admin_user_receive_records WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let get = |col: &str| -> StoreResult<u64> { Ok(row.try_get::<i64, _>(col).map_err(db_err)?.max(0) as u64) };
        Ok(MessageCounts {
            total: get("total")?,
            online: get("online")?,
            received: get("received")?,
            read: get("read")?,
            confirmed: get("confirmed")?,
        })
    }

    async fn insert_push_record(&self, p: PushRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO push_records (message_id, type, content, target, target_ids, priority, need_confirm, \
             sender_id, status, delivered_count, failed_count, total_count, push_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&p.message_id)
        .bind(&p.kind)
        .bind(&p.content)
        .bind(p.target.as_str())
        .bind(&p.target_ids)
        .bind(p.priority.as_str())
        .bind(p.need_confirm)
        .bind(p.sender_id)
        .bind(p.status.as_str())
        .bind(p.delivered_count as i64)
        .bind(p.failed_count as i64)
        .bind(p.total_count as i64)
        .bind(p.push_time)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
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
        sqlx::query(
            "UPDATE push_records SET status = $2, delivered_count = $3, failed_count = $4, total_count = $5 \
             WHERE message_id = $1",
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(delivered as i64)
        .bind(failed as i64)
        .bind(total as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn push_record_exists(&self, message_id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM push_records WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn remove_push_record(&self, message_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM push_records WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_push_records(&self, page: PageRequest) -> StoreResult<Page<PushRecord>> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM push_records")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("total")
            .map_err(db_err)?;
        let rows = sqlx::query("SELECT * FROM push_records ORDER BY push_time DESC LIMIT $1 OFFSET $2")
            .bind(page.page_size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(Page {
            items: rows.iter().map(map_push_record).collect::<StoreResult<Vec<_>>>()?,
            total: total.max(0) as u64,
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn append_log(&self, log: NotificationLog) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO notification_logs (message_id, user_id, event_type, timestamp, connection_id, client_ip) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&log.message_id)
        .bind(log.user_id)
        .bind(log.event_type.as_str())
        .bind(log.timestamp)
        .bind(&log.connection_id)
        .bind(&log.client_ip)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn logs_for(&self, message_id: &str, limit: usize) -> StoreResult<Vec<NotificationLog>> {
        let rows = sqlx::query(
            "SELECT * FROM notification_logs WHERE message_id = $1 ORDER BY timestamp DESC, id DESC LIMIT $2",
        )
        .bind(message_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(map_log).collect()
    }

    async fn load_status(&self, user_id: i64) -> StoreResult<Option<OnlineStatus>> {
        let row = sqlx::query("SELECT * FROM admin_user_online_status WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(map_status).transpose()
    }

    async fn upsert_status(&self, s: OnlineStatus) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO admin_user_online_status (user_id, username, is_online, last_seen, online_time, \
             offline_time, total_online_count, total_online_seconds, connection_id, client_ip, user_agent, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (user_id) DO UPDATE SET username = EXCLUDED.username, is_online = EXCLUDED.is_online, \
             last_seen = EXCLUDED.last_seen, online_time = EXCLUDED.online_time, offline_time = EXCLUDED.offline_time, \
             total_online_count = EXCLUDED.total_online_count, total_online_seconds = EXCLUDED.total_online_seconds, \
             connection_id = EXCLUDED.connection_id, client_ip = EXCLUDED.client_ip, \
             user_agent = EXCLUDED.user_agent, updated_at = EXCLUDED.updated_at",
        )
        .bind(s.user_id)
        .bind(&s.username)
        .bind(s.is_online)
        .bind(s.last_seen)
        .bind(s.online_time)
        .bind(s.offline_time)
        .bind(s.total_online_count)
        .bind(s.total_online_seconds)
        .bind(&s.connection_id)
        .bind(&s.client_ip)
        .bind(&s.user_agent)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn online_statuses(&self) -> StoreResult<Vec<OnlineStatus>> {
        let rows = sqlx::query("SELECT * FROM admin_user_online_status WHERE is_online ORDER BY last_seen DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(map_status).collect()
    }

    async fn touch_status(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE admin_user_online_status SET last_seen = $2, updated_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn force_offline(&self, user_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE admin_user_online_status SET is_online = FALSE, offline_time = $2, updated_at = $2 \
             WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

/// 从业务库读取用户（所有用户都在管理员名单中，与后台账号表一致）
/// Reads users from the business database; every row of the table is an admin account.
pub struct PgUserDirectory {
    pool: Pool<Postgres>,
    admin_sql: String,
    username_sql: String,
}

impl PgUserDirectory {
    pub fn new(pool: Pool<Postgres>, table: &str) -> StoreResult<Self> {
        let valid = regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| codec("table", e))?;
        if !valid.is_match(table) {
            return Err(codec("table", table));
        }
        Ok(Self {
            pool,
            admin_sql: format!("SELECT id FROM \"{}\"", table),
            username_sql: format!("SELECT username FROM \"{}\" WHERE id = $1", table),
        })
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn admin_user_ids(&self) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(&self.admin_sql).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(|r| r.try_get::<i64, _>("id").map_err(db_err)).collect()
    }

    async fn username(&self, user_id: i64) -> StoreResult<Option<String>> {
        let row = sqlx::query(&self.username_sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get::<String, _>("username").map_err(db_err)).transpose()
    }
}
