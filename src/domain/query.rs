use crate::domain::record::{DeliveryRecord, DeliveryStatus, PushChannel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const DEFAULT_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 500;

/// 接收记录查询条件
/// Receive-record query filters
#[derive(Deserialize, Debug, Clone, Default, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct RecordQuery {
    pub message_id: Option<String>,
    pub user_id: Option<i64>,
    /// 用户名前缀 / username prefix
    pub username: Option<String>,
    pub is_online: Option<bool>,
    pub is_received: Option<bool>,
    pub is_read: Option<bool>,
    pub is_confirmed: Option<bool>,
    pub delivery_status: Option<DeliveryStatus>,
    pub push_channel: Option<PushChannel>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

impl RecordQuery {
    pub fn for_message(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, r: &DeliveryRecord) -> bool {
        self.message_id.as_deref().map_or(true, |m| r.message_id == m)
            && self.user_id.map_or(true, |u| r.user_id == u)
            && self.username.as_deref().map_or(true, |p| r.username.starts_with(p))
            && self.is_online.map_or(true, |b| r.is_online_at_send == b)
            && self.is_received.map_or(true, |b| r.is_received == b)
            && self.is_read.map_or(true, |b| r.is_read == b)
            && self.is_confirmed.map_or(true, |b| r.is_confirmed == b)
            && self.delivery_status.map_or(true, |s| r.delivery_status == s)
            && self.push_channel.map_or(true, |c| r.push_channel == c)
            && self.created_from.map_or(true, |t| r.created_at >= t)
            && self.created_to.map_or(true, |t| r.created_at <= t)
    }

    pub fn paging(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

/// 分页参数
#[derive(Deserialize, Debug, Clone, Copy, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

/// 规范化后的分页（页码从 1 开始）
/// Normalised paging, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    pub fn new(page: Option<u64>, page_size: Option<u64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1) * self.page_size
    }
}

impl From<PageParams> for PageRequest {
    fn from(p: PageParams) -> Self {
        PageRequest::new(p.page, p.page_size)
    }
}

/// 分页结果
#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

impl<T> Page<T> {
    pub fn from_sorted(all: Vec<T>, req: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(req.offset() as usize)
            .take(req.page_size as usize)
            .collect();
        Self {
            items,
            total,
            page: req.page,
            page_size: req.page_size,
        }
    }
}

/// 单条消息的原始计数
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub total: u64,
    pub online: u64,
    pub received: u64,
    pub read: u64,
    pub confirmed: u64,
}

impl MessageCounts {
    pub fn add(&mut self, r: &DeliveryRecord) {
        self.total += 1;
        self.online += u64::from(r.is_online_at_send);
        self.received += u64::from(r.is_received);
        self.read += u64::from(r.is_read);
        self.confirmed += u64::from(r.is_confirmed);
    }
}

/// 单条消息的聚合统计（含比率）
/// Aggregate counts and rates for one message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct MessageStats {
    pub message_id: String,
    pub total: u64,
    pub online: u64,
    pub received: u64,
    pub read: u64,
    pub confirmed: u64,
    pub online_rate: f64,
    pub received_rate: f64,
    pub read_rate: f64,
    pub confirmed_rate: f64,
}

impl MessageStats {
    pub fn from_counts(message_id: &str, c: MessageCounts) -> Self {
        let rate = |n: u64| {
            if c.total == 0 {
                0.0
            } else {
                n as f64 / c.total as f64
            }
        };
        Self {
            message_id: message_id.to_string(),
            total: c.total,
            online: c.online,
            received: c.received,
            read: c.read,
            confirmed: c.confirmed,
            online_rate: rate(c.online),
            received_rate: rate(c.received),
            read_rate: rate(c.read),
            confirmed_rate: rate(c.confirmed),
        }
    }
}
