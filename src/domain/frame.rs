use crate::comm::time::{now_wire, wire_time};
use crate::domain::notification::{Notification, NotificationType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// 已序列化的出站帧，每条通知只序列化一次
/// An encoded outbound frame; each notification is serialized once.
pub type Frame = Arc<str>;

/// 服务端 → 客户端帧
/// Server → client frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub data: Option<serde_json::Value>,
    pub time: String,
    pub message_id: String,
}

impl WireFrame {
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            kind: n.kind.as_str().to_string(),
            content: n.content.clone(),
            data: n.payload.clone(),
            time: wire_time(n.created_at),
            message_id: n.message_id.clone(),
        }
    }

    pub fn system_notice(content: impl Into<String>) -> Self {
        Self {
            kind: NotificationType::SystemNotice.as_str().to_string(),
            content: content.into(),
            data: None,
            time: now_wire(),
            message_id: String::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: "pong".to_string(),
            content: String::new(),
            data: None,
            time: now_wire(),
            message_id: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// 客户端 → 服务端帧，只识别 `ping` 与 `message_received`
/// Client → server frame; only `ping` and `message_received` are recognised.
#[derive(Deserialize, Debug, Clone)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_field_names() {
        let n = Notification::new(NotificationType::OrderPaid, "paid")
            .to_users([42])
            .with_id("m1");
        let frame = WireFrame::from_notification(&n).encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "order_paid");
        assert_eq!(v["message_id"], "m1");
        assert_eq!(v["content"], "paid");
        assert!(v["data"].is_null());
        assert_eq!(v["time"].as_str().map(str::len), Some(19));
    }

    #[test]
    fn test_inbound_parses_without_message_id() {
        let f: InboundFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(f.kind, "ping");
        assert!(f.message_id.is_none());
    }
}
