use crate::error::NotifyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// 通知类型 / Notification type
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderCreated,
    OrderPaid,
    OrderCancelled,
    OrderRefunded,
    SystemNotice,
    OfflineMessage,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::OrderCreated => "order_created",
            NotificationType::OrderPaid => "order_paid",
            NotificationType::OrderCancelled => "order_cancelled",
            NotificationType::OrderRefunded => "order_refunded",
            NotificationType::SystemNotice => "system_notice",
            NotificationType::OfflineMessage => "offline_message",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order_created" => Ok(NotificationType::OrderCreated),
            "order_paid" => Ok(NotificationType::OrderPaid),
            "order_cancelled" => Ok(NotificationType::OrderCancelled),
            "order_refunded" => Ok(NotificationType::OrderRefunded),
            "system_notice" => Ok(NotificationType::SystemNotice),
            "offline_message" => Ok(NotificationType::OfflineMessage),
            other => Err(NotifyError::validation("type", format!("未知的通知类型: {}", other))),
        }
    }
}

/// 优先级 / Priority
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" | "0" => Ok(Priority::Low),
            "normal" | "1" => Ok(Priority::Normal),
            "high" | "2" => Ok(Priority::High),
            "urgent" | "3" => Ok(Priority::Urgent),
            other => Err(NotifyError::validation("priority", format!("未知的优先级: {}", other))),
        }
    }
}

/// 投递目标 / Delivery target
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    User,
    Admin,
    All,
    Custom,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::User => "user",
            Target::Admin => "admin",
            Target::All => "all",
            Target::Custom => "custom",
        }
    }
}

impl FromStr for Target {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Target::User),
            "admin" => Ok(Target::Admin),
            "all" => Ok(Target::All),
            "custom" => Ok(Target::Custom),
            other => Err(NotifyError::validation("target", format!("未知的投递目标: {}", other))),
        }
    }
}

/// 通知消息，入队后不可变
/// A notification; immutable once queued.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct Notification {
    /// 为空时由 Notify API 生成 / generated by the Notify API when empty
    #[serde(default)]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
    pub target: Target,
    #[serde(default)]
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub exclude_ids: Vec<i64>,
    #[serde(default)]
    pub need_confirm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
}

impl Notification {
    pub fn new(kind: NotificationType, content: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            kind,
            content: content.into(),
            payload: None,
            created_at: Utc::now(),
            priority: Priority::Normal,
            target: Target::All,
            target_ids: Vec::new(),
            exclude_ids: Vec::new(),
            need_confirm: false,
            sender_id: None,
        }
    }

    pub fn to_users(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.target = Target::User;
        self.target_ids = ids.into_iter().collect();
        self
    }

    pub fn to_admins(mut self) -> Self {
        self.target = Target::Admin;
        self
    }

    pub fn to_all(mut self) -> Self {
        self.target = Target::All;
        self
    }

    pub fn to_custom(mut self, ids: impl IntoIterator<Item = i64>, exclude: impl IntoIterator<Item = i64>) -> Self {
        self.target = Target::Custom;
        self.target_ids = ids.into_iter().collect();
        self.exclude_ids = exclude.into_iter().collect();
        self
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn need_confirm(mut self) -> Self {
        self.need_confirm = true;
        self
    }

    pub fn from_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }
}

/// 生成消息ID `msg_<纳秒时间戳>_<uuid前8位>`
/// Generate a message ID `msg_<unix-nanos>_<uuid8>`
pub fn generate_message_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}_{}", nanos, &uuid[..8])
}

/// HTTP 提交请求，枚举字段以字符串接收并在转换时验证
/// HTTP submit body; enum fields arrive as strings and are validated on conversion.
#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct SendNotificationRequest {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub exclude_ids: Vec<i64>,
    #[serde(default)]
    pub need_confirm: bool,
}

impl SendNotificationRequest {
    pub fn into_notification(self, sender_id: i64) -> Result<Notification, NotifyError> {
        let kind = NotificationType::from_str(&self.kind)?;
        let target = Target::from_str(&self.target)?;
        let priority = match self.priority.as_deref() {
            Some(p) => Priority::from_str(p)?,
            None => Priority::Normal,
        };
        Ok(Notification {
            message_id: self.message_id.unwrap_or_default(),
            kind,
            content: self.content,
            payload: self.data,
            created_at: Utc::now(),
            priority,
            target,
            target_ids: self.target_ids,
            exclude_ids: self.exclude_ids,
            need_confirm: self.need_confirm,
            sender_id: Some(sender_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('_').next().map(str::len), Some(8));
    }

    #[test]
    fn test_request_with_unknown_enum_is_validation_error() {
        let req = SendNotificationRequest {
            message_id: None,
            kind: "order_shipped".to_string(),
            content: "x".to_string(),
            data: None,
            priority: None,
            target: "user".to_string(),
            target_ids: vec![1],
            exclude_ids: vec![],
            need_confirm: false,
        };
        assert!(matches!(
            req.into_notification(1),
            Err(NotifyError::Validation { ref field, .. }) if field == "type"
        ));
    }

    #[test]
    fn test_priority_accepts_numeric_levels() {
        assert_eq!(Priority::from_str("3").unwrap(), Priority::Urgent);
        assert_eq!(Priority::from_str("low").unwrap(), Priority::Low);
        assert!(Priority::from_str("5").is_err());
    }

    #[test]
    fn test_notification_serializes_type_field() {
        let n = Notification::new(NotificationType::OrderPaid, "paid")
            .to_users([42])
            .with_id("m1");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "order_paid");
        assert_eq!(v["target"], "user");
        assert_eq!(v["target_ids"][0], 42);
    }
}
