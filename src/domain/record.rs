//! 投递审计记录 / Delivery audit records

use crate::domain::notification::{Notification, Priority, Target};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// 投递状态
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Offline,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Offline => "offline",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "offline" => Some(DeliveryStatus::Offline),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// 推送渠道
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PushChannel {
    Websocket,
    Offline,
}

impl PushChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushChannel::Websocket => "websocket",
            PushChannel::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "websocket" => Some(PushChannel::Websocket),
            "offline" => Some(PushChannel::Offline),
            _ => None,
        }
    }
}

/// 单个 (消息, 用户) 的接收记录，唯一键 `(message_id, user_id)`
/// One receive record per (message, user); unique on `(message_id, user_id)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub user_id: i64,
    pub username: String,
    pub delivery_status: DeliveryStatus,
    pub is_online_at_send: bool,
    pub is_received: bool,
    pub received_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub push_channel: PushChannel,
    pub connection_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn new(
        message_id: &str,
        user_id: i64,
        username: String,
        status: DeliveryStatus,
        channel: PushChannel,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            user_id,
            username,
            delivery_status: status,
            is_online_at_send: status == DeliveryStatus::Delivered,
            is_received: false,
            received_at: None,
            is_read: false,
            read_at: None,
            is_confirmed: false,
            confirmed_at: None,
            push_channel: channel,
            connection_id: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// 应用确认，时间戳首次写入后不再覆盖
    /// Apply an ack; the first timestamp wins.
    pub fn apply_ack(&mut self, ack: AckKind, at: DateTime<Utc>, connection_id: Option<&str>) {
        match ack {
            AckKind::Received => {
                self.is_received = true;
                self.received_at.get_or_insert(at);
                if self.connection_id.is_none() {
                    self.connection_id = connection_id.map(str::to_string);
                }
            }
            AckKind::Read => {
                self.is_read = true;
                self.read_at.get_or_insert(at);
            }
            AckKind::Confirmed => {
                self.is_confirmed = true;
                self.confirmed_at.get_or_insert(at);
            }
        }
        self.updated_at = at;
    }
}

/// 确认类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Received,
    Read,
    Confirmed,
}

impl AckKind {
    pub fn log_event(&self) -> LogEvent {
        match self {
            AckKind::Received => LogEvent::Received,
            AckKind::Read => LogEvent::Read,
            AckKind::Confirmed => LogEvent::Confirmed,
        }
    }
}

/// 用户在线状态，唯一键 `user_id`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct OnlineStatus {
    pub user_id: i64,
    pub username: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub online_time: Option<DateTime<Utc>>,
    pub offline_time: Option<DateTime<Utc>>,
    pub total_online_count: i64,
    pub total_online_seconds: i64,
    pub connection_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 建立连接时的元信息
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub username: String,
    pub connection_id: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl OnlineStatus {
    /// 上线后的状态；上一条记录仍在线（未观察到断开的重连）时不增加计数
    /// State after going online; a reconnect without an observed disconnect keeps the count.
    pub fn went_online(prev: Option<OnlineStatus>, user_id: i64, meta: &ConnectionMeta, now: DateTime<Utc>) -> Self {
        let (count, seconds, offline_time, was_online, prev_username) = match &prev {
            Some(p) => (
                p.total_online_count,
                p.total_online_seconds,
                p.offline_time,
                p.is_online,
                p.username.clone(),
            ),
            None => (0, 0, None, false, String::new()),
        };
        Self {
            user_id,
            username: if meta.username.is_empty() { prev_username } else { meta.username.clone() },
            is_online: true,
            last_seen: now,
            online_time: Some(now),
            offline_time,
            total_online_count: if was_online { count } else { count + 1 },
            total_online_seconds: seconds,
            connection_id: Some(meta.connection_id.clone()),
            client_ip: Some(meta.client_ip.clone()),
            user_agent: Some(meta.user_agent.clone()),
            updated_at: now,
        }
    }

    /// 下线：累加本次在线时长
    /// Going offline accumulates the session length.
    pub fn went_offline(mut self, now: DateTime<Utc>) -> Self {
        if let Some(online_time) = self.online_time {
            if self.is_online {
                self.total_online_seconds += (now - online_time).num_seconds().max(0);
            }
        }
        self.is_online = false;
        self.offline_time = Some(now);
        self.updated_at = now;
        self
    }
}

/// 离线消息条目，存储于 `offline_msg:<user_id>` 列表
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OfflineEntry {
    pub saved_at: DateTime<Utc>,
    pub notification: Notification,
}

/// 推送记录状态
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Queued,
    Delivered,
    Partial,
    Failed,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushStatus::Queued => "queued",
            PushStatus::Delivered => "delivered",
            PushStatus::Partial => "partial",
            PushStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(PushStatus::Queued),
            "delivered" => Some(PushStatus::Delivered),
            "partial" => Some(PushStatus::Partial),
            "failed" => Some(PushStatus::Failed),
            _ => None,
        }
    }

    /// 根据投递结果得出状态
    pub fn from_counts(delivered: u64, failed: u64, total: u64) -> Self {
        if total == 0 || delivered == total {
            PushStatus::Delivered
        } else if delivered == 0 && failed == total {
            PushStatus::Failed
        } else {
            PushStatus::Partial
        }
    }
}

/// 每条通知一行的推送记录（包括广播）
/// One push record per submitted notification, broadcasts included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct PushRecord {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub target: Target,
    pub target_ids: Vec<i64>,
    pub priority: Priority,
    pub need_confirm: bool,
    pub sender_id: Option<i64>,
    pub status: PushStatus,
    pub delivered_count: u64,
    pub failed_count: u64,
    pub total_count: u64,
    pub push_time: DateTime<Utc>,
}

impl PushRecord {
    pub fn queued(n: &Notification) -> Self {
        Self {
            message_id: n.message_id.clone(),
            kind: n.kind.as_str().to_string(),
            content: n.content.clone(),
            target: n.target,
            target_ids: n.target_ids.clone(),
            priority: n.priority,
            need_confirm: n.need_confirm,
            sender_id: n.sender_id,
            status: PushStatus::Queued,
            delivered_count: 0,
            failed_count: 0,
            total_count: 0,
            push_time: n.created_at,
        }
    }
}

/// 状态迁移事件
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Created,
    Delivered,
    Offline,
    Replayed,
    Failed,
    Received,
    Read,
    Confirmed,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::Created => "created",
            LogEvent::Delivered => "delivered",
            LogEvent::Offline => "offline",
            LogEvent::Replayed => "replayed",
            LogEvent::Failed => "failed",
            LogEvent::Received => "received",
            LogEvent::Read => "read",
            LogEvent::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(LogEvent::Created),
            "delivered" => Some(LogEvent::Delivered),
            "offline" => Some(LogEvent::Offline),
            "replayed" => Some(LogEvent::Replayed),
            "failed" => Some(LogEvent::Failed),
            "received" => Some(LogEvent::Received),
            "read" => Some(LogEvent::Read),
            "confirmed" => Some(LogEvent::Confirmed),
            _ => None,
        }
    }
}

/// 只追加的状态迁移日志
/// Append-only transition log row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct NotificationLog {
    pub message_id: String,
    /// 广播的创建事件没有用户 / broadcast creation has no user
    pub user_id: Option<i64>,
    pub event_type: LogEvent,
    pub timestamp: DateTime<Utc>,
    pub connection_id: Option<String>,
    pub client_ip: Option<String>,
}

impl NotificationLog {
    pub fn new(message_id: &str, user_id: Option<i64>, event_type: LogEvent) -> Self {
        Self {
            message_id: message_id.to_string(),
            user_id,
            event_type,
            timestamp: Utc::now(),
            connection_id: None,
            client_ip: None,
        }
    }

    pub fn with_connection(mut self, connection_id: Option<&str>) -> Self {
        self.connection_id = connection_id.map(str::to_string);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ack_first_timestamp_wins() {
        let t0 = Utc::now();
        let mut rec = DeliveryRecord::new("m1", 42, "u".into(), DeliveryStatus::Delivered, PushChannel::Websocket, t0);
        let t1 = t0 + Duration::seconds(1);
        let t2 = t0 + Duration::seconds(2);
        rec.apply_ack(AckKind::Received, t1, Some("conn-a"));
        rec.apply_ack(AckKind::Received, t2, Some("conn-b"));
        assert!(rec.is_received);
        assert_eq!(rec.received_at, Some(t1));
        assert_eq!(rec.connection_id.as_deref(), Some("conn-a"));
    }

    #[test]
    fn test_reconnect_without_disconnect_keeps_count() {
        let now = Utc::now();
        let meta = ConnectionMeta {
            username: "alice".into(),
            connection_id: "c1".into(),
            client_ip: "10.0.0.1".into(),
            user_agent: "Mozilla/5.0 test".into(),
        };
        let first = OnlineStatus::went_online(None, 1, &meta, now);
        assert_eq!(first.total_online_count, 1);
        let again = OnlineStatus::went_online(Some(first.clone()), 1, &meta, now);
        assert_eq!(again.total_online_count, 1);
        let offline = again.went_offline(now + Duration::seconds(30));
        assert_eq!(offline.total_online_seconds, 30);
        let back = OnlineStatus::went_online(Some(offline), 1, &meta, now + Duration::seconds(40));
        assert_eq!(back.total_online_count, 2);
        assert_eq!(back.total_online_seconds, 30);
    }

    #[test]
    fn test_push_status_from_counts() {
        assert_eq!(PushStatus::from_counts(3, 0, 3), PushStatus::Delivered);
        assert_eq!(PushStatus::from_counts(0, 3, 3), PushStatus::Failed);
        assert_eq!(PushStatus::from_counts(1, 2, 3), PushStatus::Partial);
        assert_eq!(PushStatus::from_counts(0, 0, 0), PushStatus::Delivered);
    }
}
