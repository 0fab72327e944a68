//! 实时通知推送核心：WebSocket Hub、优先级分发、离线缓冲、投递台账与在线状态
//! Real-time notification core: WebSocket hub, prioritized dispatch, offline buffer,
//! delivery ledger and presence.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod comm;
pub mod conf;
pub mod domain;
pub mod error;
pub mod middleware;
pub mod service;
pub mod storage;
pub mod tasks;
pub mod ws;

pub use error::{AppError, AppResult, NotifyError};
pub use service::NotificationCore;
