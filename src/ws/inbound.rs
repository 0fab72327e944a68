//! 客户端上行帧处理 / Client-originated frame handling
//!
//! 上行帧从不广播：`ping` 回复 `pong`，`message_received` 记录送达确认，其余丢弃。
//! Inbound frames are never broadcast: `ping` gets a `pong`, `message_received`
//! records a receipt, anything else is dropped.

use crate::domain::InboundFrame;
use crate::ws::connection::Connection;
use async_trait::async_trait;
use std::sync::Arc;

/// 解析后的上行动作 / Parsed inbound action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    Ping,
    Received { message_id: String },
    Ignore { reason: String },
}

impl InboundAction {
    pub fn classify(text: &str) -> Self {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                return InboundAction::Ignore {
                    reason: format!("not a json frame: {}", e),
                }
            }
        };
        match frame.kind.as_str() {
            "ping" => InboundAction::Ping,
            "message_received" => match frame.message_id {
                Some(id) if !id.is_empty() => InboundAction::Received { message_id: id },
                _ => InboundAction::Ignore {
                    reason: "message_received without message_id".to_string(),
                },
            },
            other => InboundAction::Ignore {
                reason: format!("unsupported frame type '{}'", other),
            },
        }
    }
}

/// 上行帧处理器 / Handler for inbound frames
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_frame(&self, conn: &Arc<Connection>, text: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(InboundAction::classify(r#"{"type":"ping"}"#), InboundAction::Ping);
        assert_eq!(
            InboundAction::classify(r#"{"type":"message_received","message_id":"m1"}"#),
            InboundAction::Received {
                message_id: "m1".to_string()
            }
        );
        assert!(matches!(
            InboundAction::classify(r#"{"type":"message_received"}"#),
            InboundAction::Ignore { .. }
        ));
        assert!(matches!(
            InboundAction::classify(r#"{"type":"chat","content":"hi all"}"#),
            InboundAction::Ignore { .. }
        ));
        assert!(matches!(InboundAction::classify("hello"), InboundAction::Ignore { .. }));
    }
}
