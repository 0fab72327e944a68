use crate::domain::{DeliveryRecord, DeliveryStatus, Frame, LogEvent, Notification, PushChannel, Target, WireFrame};
use crate::service::ledger::DeliveryLedger;
use crate::service::offline::OfflineBuffer;
use crate::service::roster::AdminRoster;
use crate::storage::UserDirectory;
use crate::ws::Hub;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

/// 一次扇出的结果 / Outcome of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct FanOutReport {
    /// 目标用户数（广播时为连接数）/ target users (connections for broadcasts)
    pub recipients: usize,
    /// 至少一个连接收到的用户 / users reached on at least one socket
    pub delivered: usize,
    /// 写入离线缓冲的用户 / users whose message went to the offline buffer
    pub buffered: usize,
    pub failed: usize,
    /// 实际入队的连接数 / sockets that accepted the frame
    pub connections: usize,
}

enum UserOutcome {
    Live(usize),
    Buffered,
    Failed,
}

/// 台账写入重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// 按目标类型路由一条通知
/// Routes one notification by its target kind.
pub struct FanOut {
    hub: Hub,
    roster: Arc<AdminRoster>,
    offline: Arc<OfflineBuffer>,
    ledger: Arc<DeliveryLedger>,
    directory: Arc<dyn UserDirectory>,
    retry: RetryPolicy,
}

impl FanOut {
    pub fn new(
        hub: Hub,
        roster: Arc<AdminRoster>,
        offline: Arc<OfflineBuffer>,
        ledger: Arc<DeliveryLedger>,
        directory: Arc<dyn UserDirectory>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            hub,
            roster,
            offline,
            ledger,
            directory,
            retry,
        }
    }

    /// 序列化一次后按 `target` 路由，最后更新推送记录
    /// Serialize once, route by `target`, then finish the push record.
    pub async fn run(&self, n: &Notification) -> FanOutReport {
        let frame = match WireFrame::from_notification(n).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(message_id = %n.message_id, "failed to encode notification: {}", e);
                self.finish(n, 0, 1, 1).await;
                return FanOutReport {
                    failed: 1,
                    ..FanOutReport::default()
                };
            }
        };

        let report = match n.target {
            Target::All => {
                let connections = self.hub.active_connections();
                match self.hub.broadcast(frame).await {
                    Ok(()) => FanOutReport {
                        recipients: connections,
                        delivered: connections,
                        connections,
                        ..FanOutReport::default()
                    },
                    Err(e) => {
                        tracing::warn!(message_id = %n.message_id, "broadcast rejected: {}", e);
                        FanOutReport {
                            recipients: connections,
                            failed: connections,
                            ..FanOutReport::default()
                        }
                    }
                }
            }
            Target::User => self.to_users(n, &frame, dedup(&n.target_ids, &[])).await,
            Target::Custom => self.to_users(n, &frame, dedup(&n.target_ids, &n.exclude_ids)).await,
            Target::Admin => {
                let roster = self.roster.current().await;
                let ids = dedup(&roster.user_ids, &n.exclude_ids);
                self.to_users(n, &frame, ids).await
            }
        };

        self.finish(
            n,
            (report.delivered + report.buffered) as u64,
            report.failed as u64,
            report.recipients as u64,
        )
        .await;
        tracing::debug!(
            message_id = %n.message_id,
            target = n.target.as_str(),
            recipients = report.recipients,
            delivered = report.delivered,
            buffered = report.buffered,
            failed = report.failed,
            "fan-out finished"
        );
        report
    }

    async fn to_users(&self, n: &Notification, frame: &Frame, user_ids: Vec<i64>) -> FanOutReport {
        let mut report = FanOutReport {
            recipients: user_ids.len(),
            ..FanOutReport::default()
        };
        for user_id in user_ids {
            match self.deliver_to(n, frame, user_id).await {
                UserOutcome::Live(sockets) => {
                    report.delivered += 1;
                    report.connections += sockets;
                }
                UserOutcome::Buffered => report.buffered += 1,
                UserOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    /// 在线则直接投递，否则写入离线缓冲（仅限目录中存在的用户）
    /// Live delivery when connected, otherwise the offline buffer (directory users only).
    ///
    /// 入队失败不重试：饱和连接已被注销。
    async fn deliver_to(&self, n: &Notification, frame: &Frame, user_id: i64) -> UserOutcome {
        let live = self.hub.send_to_user(user_id, frame).await;
        let username = match self.directory.username(user_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(user_id, "username lookup failed: {}", e);
                None
            }
        };

        if live > 0 {
            self.write_record(n, user_id, username.unwrap_or_default(), DeliveryStatus::Delivered, PushChannel::Websocket)
                .await;
            return UserOutcome::Live(live);
        }

        let Some(username) = username else {
            tracing::debug!(user_id, message_id = %n.message_id, "offline user unknown to directory, not buffered");
            self.write_record(n, user_id, String::new(), DeliveryStatus::Offline, PushChannel::Offline)
                .await;
            return UserOutcome::Failed;
        };

        match self.offline.push(user_id, n).await {
            Ok(()) => {
                self.write_record(n, user_id, username, DeliveryStatus::Offline, PushChannel::Offline)
                    .await;
                UserOutcome::Buffered
            }
            Err(e) => {
                tracing::warn!(user_id, message_id = %n.message_id, "offline message dropped: {}", e);
                self.write_record(n, user_id, username, DeliveryStatus::Failed, PushChannel::Offline)
                    .await;
                UserOutcome::Failed
            }
        }
    }

    /// 第一次写入在当前任务内完成，失败后在后台重试
    /// First attempt runs inline; failures are retried in the background.
    async fn write_record(
        &self,
        n: &Notification,
        user_id: i64,
        username: String,
        status: DeliveryStatus,
        channel: PushChannel,
    ) {
        let record = DeliveryRecord::new(&n.message_id, user_id, username, status, channel, Utc::now());
        let event = match status {
            DeliveryStatus::Delivered => LogEvent::Delivered,
            DeliveryStatus::Offline => LogEvent::Offline,
            _ => LogEvent::Failed,
        };

        match self.ledger.record_delivery(record.clone()).await {
            Ok(_) => self.ledger.log_event(&n.message_id, Some(user_id), event).await,
            Err(e) => {
                tracing::warn!(user_id, message_id = %n.message_id, "receive record write failed, retrying: {}", e);
                let ledger = self.ledger.clone();
                let retry = self.retry;
                tokio::spawn(async move {
                    retry_record(ledger, record, event, retry).await;
                });
            }
        }
    }

    async fn finish(&self, n: &Notification, delivered: u64, failed: u64, total: u64) {
        if let Err(e) = self
            .ledger
            .finish_push_record(&n.message_id, delivered, failed, total)
            .await
        {
            self.ledger.record_failed_write();
            tracing::warn!(message_id = %n.message_id, "push record update failed: {}", e);
        }
    }
}

async fn retry_record(ledger: Arc<DeliveryLedger>, record: DeliveryRecord, event: LogEvent, retry: RetryPolicy) {
    for attempt in 1..=retry.max_retries {
        tokio::time::sleep(retry.delay).await;
        match ledger.record_delivery(record.clone()).await {
            Ok(_) => {
                ledger
                    .log_event(&record.message_id, Some(record.user_id), event)
                    .await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = record.user_id,
                    message_id = %record.message_id,
                    attempt,
                    "receive record retry failed: {}",
                    e
                );
            }
        }
    }
    ledger.record_failed_write();
    tracing::error!(
        user_id = record.user_id,
        message_id = %record.message_id,
        "receive record abandoned after {} retries",
        retry.max_retries
    );
}

/// 去重并保持原顺序，跳过排除的 ID
fn dedup(ids: &[i64], exclude: &[i64]) -> Vec<i64> {
    let exclude: HashSet<i64> = exclude.iter().copied().collect();
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .copied()
        .filter(|id| !exclude.contains(id) && seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_order_and_excludes() {
        assert_eq!(dedup(&[3, 1, 3, 2, 1], &[]), vec![3, 1, 2]);
        assert_eq!(dedup(&[3, 1, 2], &[1]), vec![3, 2]);
        assert!(dedup(&[], &[1]).is_empty());
    }
}
