use crate::comm::settings::NotifySettings;
use crate::domain::{
    generate_message_id, AckKind, DeliveryRecord, DeliveryStatus, Frame, LogEvent, MessageStats, Notification,
    NotificationLog, OnlineStatus, Page, PageRequest, PushChannel, PushRecord, RecordQuery, SendNotificationRequest,
    Target, WireFrame,
};
use crate::error::NotifyError;
use crate::service::dispatcher::{Dispatcher, DispatcherStats, SubmitOutcome};
use crate::service::fanout::{FanOut, RetryPolicy};
use crate::service::ledger::DeliveryLedger;
use crate::service::offline::OfflineBuffer;
use crate::service::presence::{PresenceTracker, SweepReport};
use crate::service::roster::AdminRoster;
use crate::storage::{LedgerStore, OfflineStore, UserDirectory};
use crate::ws::{Connection, ConnectionTiming, Hub, HubStats, InboundAction, InboundHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use utoipa::ToSchema;

/// 通知内容上限（字节）/ Content limit in bytes
pub const MAX_CONTENT_BYTES: usize = 4096;

/// 核心依赖的三个存储 / The three stores the core runs on
#[derive(Clone)]
pub struct CoreStores {
    pub offline: Arc<dyn OfflineStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub directory: Arc<dyn UserDirectory>,
}

/// 周期统计 / Periodic statistics
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CoreStats {
    pub hub: HubStats,
    pub dispatcher: DispatcherStats,
    pub failed_ledger_writes: u64,
}

/// 通知核心：持有 Hub、分发器、离线缓冲与投递台账
/// Notification core owning the hub, dispatcher, offline buffer and delivery ledger.
///
/// HTTP 处理器通过 `web::Data<Arc<NotificationCore>>` 注入使用。
pub struct NotificationCore {
    settings: Arc<NotifySettings>,
    hub: Hub,
    dispatcher: Dispatcher,
    offline: Arc<OfflineBuffer>,
    ledger: Arc<DeliveryLedger>,
    presence: Arc<PresenceTracker>,
    roster: Arc<AdminRoster>,
    directory: Arc<dyn UserDirectory>,
    timing: ConnectionTiming,
    shutdown_tx: watch::Sender<bool>,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationCore {
    /// 创建索引并启动 Hub、分发器和维护任务
    /// Ensure indexes, then start the hub, the dispatcher and the maintenance tasks.
    pub async fn start(settings: NotifySettings, stores: CoreStores) -> Result<Arc<Self>, NotifyError> {
        let settings = Arc::new(settings);
        let ledger = Arc::new(DeliveryLedger::new(
            stores.ledger,
            Duration::from_secs(settings.ledger.deadline_secs),
            settings.ledger.log_query_limit,
        ));
        ledger.ensure_indexes().await?;

        let presence = Arc::new(PresenceTracker::new(
            ledger.clone(),
            Duration::from_secs(settings.presence.stale_after_secs),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, hub_task) = Hub::spawn(presence.clone(), shutdown_rx);

        let roster = Arc::new(AdminRoster::new(
            stores.directory.clone(),
            Duration::from_secs(settings.roster.ttl_secs),
        ));
        let offline = Arc::new(OfflineBuffer::new(stores.offline, settings.offline.clone()));
        let fanout = Arc::new(FanOut::new(
            hub.clone(),
            roster.clone(),
            offline.clone(),
            ledger.clone(),
            stores.directory.clone(),
            RetryPolicy {
                max_retries: settings.dispatcher.max_retries,
                delay: settings.dispatcher.retry_delay(),
            },
        ));
        let dispatcher = Dispatcher::start(fanout, &settings.dispatcher);

        let core = Arc::new(Self {
            timing: ConnectionTiming::from(&settings.hub),
            settings,
            hub,
            dispatcher,
            offline,
            ledger,
            presence,
            roster,
            directory: stores.directory,
            shutdown_tx,
            hub_task: Mutex::new(Some(hub_task)),
            tasks: Mutex::new(Vec::new()),
        });
        crate::tasks::spawn_core_tasks(&core);
        tracing::info!("✅ Notification core started");
        Ok(core)
    }

    pub fn settings(&self) -> &NotifySettings {
        &self.settings
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn timing(&self) -> ConnectionTiming {
        self.timing
    }

    pub fn roster(&self) -> &AdminRoster {
        &self.roster
    }

    /// 关闭信号接收端，供后台任务使用
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// 登记后台任务，关闭时等待其退出
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// 提交通知 / Submit a notification
    ///
    /// 入队前的台账操作与 `Urgent` 的等待共用一个 `submit_wait` 截止时间；
    /// 台账超时不阻止入队。队列拒绝时撤销推送记录，调用方可用同一 ID 重试。
    /// Pre-queue ledger work and the urgent wait share one `submit_wait` deadline; a slow
    /// ledger never blocks queueing. When the queue rejects the task its push record is
    /// removed so the caller may retry with the same ID.
    pub async fn submit(&self, mut notification: Notification) -> Result<SubmitOutcome, NotifyError> {
        validate(&notification)?;
        let deadline = Instant::now() + self.dispatcher.submit_wait();

        let caller_id = !notification.message_id.is_empty();
        if !caller_id {
            notification.message_id = generate_message_id();
        }
        let recorded = match tokio::time::timeout_at(deadline, self.admit(&notification, caller_id)).await {
            Ok(Ok(recorded)) => recorded,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.ledger.record_failed_write();
                tracing::warn!(message_id = %notification.message_id, "ledger too slow, push record skipped");
                false
            }
        };

        let message_id = notification.message_id.clone();
        let created = NotificationLog::new(&message_id, None, LogEvent::Created);
        tracing::debug!(
            message_id = %message_id,
            kind = notification.kind.as_str(),
            target = notification.target.as_str(),
            priority = notification.priority.as_str(),
            "notification submitted"
        );

        match self.dispatcher.submit_until(notification, deadline).await {
            Ok(outcome) => {
                let ledger = self.ledger.clone();
                tokio::spawn(async move { ledger.append_log(created).await });
                Ok(outcome)
            }
            Err(e) => {
                if recorded {
                    self.retract_push_record(&message_id, deadline).await;
                }
                Err(e)
            }
        }
    }

    /// 重复检查并写入推送记录，返回记录是否写入
    async fn admit(&self, notification: &Notification, caller_id: bool) -> Result<bool, NotifyError> {
        if caller_id {
            match self.ledger.push_record_exists(&notification.message_id).await {
                Ok(true) => {
                    return Err(NotifyError::validation(
                        "message_id",
                        format!("消息ID已存在: {}", notification.message_id),
                    ))
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(message_id = %notification.message_id, "duplicate check skipped: {}", e),
            }
        }

        match self.ledger.create_push_record(PushRecord::queued(notification)).await {
            Ok(()) => Ok(true),
            Err(e @ NotifyError::Validation { .. }) => Err(e),
            Err(e) => {
                self.ledger.record_failed_write();
                tracing::warn!(message_id = %notification.message_id, "push record write failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn retract_push_record(&self, message_id: &str, deadline: Instant) {
        match tokio::time::timeout_at(deadline, self.ledger.remove_push_record(message_id)).await {
            Ok(Ok(())) => tracing::debug!(message_id, "push record retracted"),
            Ok(Err(e)) => tracing::warn!(message_id, "push record retract failed: {}", e),
            Err(_) => {
                tracing::warn!(message_id, "push record retract continues in background");
                let ledger = self.ledger.clone();
                let message_id = message_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = ledger.remove_push_record(&message_id).await {
                        tracing::warn!(message_id = %message_id, "push record retract failed: {}", e);
                    }
                });
            }
        }
    }

    /// 校验并提交 HTTP 请求体 / Validate and submit an HTTP request body
    pub async fn send(&self, request: SendNotificationRequest, sender_id: i64) -> Result<SubmitOutcome, NotifyError> {
        let notification = request.into_notification(sender_id)?;
        self.submit(notification).await
    }

    pub async fn mark_received(
        &self,
        message_id: &str,
        user_id: i64,
        connection_id: Option<&str>,
    ) -> Result<DeliveryRecord, NotifyError> {
        self.ledger
            .mark(message_id, user_id, AckKind::Received, connection_id)
            .await
    }

    pub async fn mark_read(&self, message_id: &str, user_id: i64) -> Result<DeliveryRecord, NotifyError> {
        self.ledger.mark(message_id, user_id, AckKind::Read, None).await
    }

    pub async fn mark_confirmed(&self, message_id: &str, user_id: i64) -> Result<DeliveryRecord, NotifyError> {
        self.ledger
            .mark(message_id, user_id, AckKind::Confirmed, None)
            .await
    }

    /// 批量标记已读，返回成功的数量；台账不可用时直接返回错误
    /// Mark several messages read; returns how many were updated.
    pub async fn mark_read_batch(&self, message_ids: &[String], user_id: i64) -> Result<usize, NotifyError> {
        let mut updated = 0;
        for message_id in message_ids {
            match self.mark_read(message_id, user_id).await {
                Ok(_) => updated += 1,
                Err(NotifyError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    pub async fn status_of(&self, message_id: &str) -> Result<MessageStats, NotifyError> {
        self.ledger.message_stats(message_id).await
    }

    /// 台账中的在线标记；台账不可用时退回 Hub 的实时状态
    /// The ledger's online flag, falling back to the hub when the ledger is unavailable.
    pub async fn is_online(&self, user_id: i64) -> bool {
        match self.presence.is_online(user_id).await {
            Ok(online) => online,
            Err(e) => {
                tracing::debug!(user_id, "presence lookup failed, using hub: {}", e);
                self.hub.is_online(user_id)
            }
        }
    }

    pub async fn list_online(&self) -> Result<Vec<OnlineStatus>, NotifyError> {
        self.presence.list_online().await
    }

    pub async fn sweep_presence(&self) -> Result<SweepReport, NotifyError> {
        let hub = &self.hub;
        self.presence.sweep(|user_id| hub.is_online(user_id)).await
    }

    pub async fn query_records(&self, query: &RecordQuery) -> Result<Page<DeliveryRecord>, NotifyError> {
        self.ledger.query_records(query).await
    }

    pub async fn logs_for(&self, message_id: &str, limit: Option<usize>) -> Result<Vec<NotificationLog>, NotifyError> {
        self.ledger.logs_for(message_id, limit).await
    }

    pub async fn list_push_records(&self, page: PageRequest) -> Result<Page<PushRecord>, NotifyError> {
        self.ledger.list_push_records(page).await
    }

    pub async fn offline_count(&self, user_id: i64) -> Result<usize, NotifyError> {
        self.offline.count(user_id).await
    }

    pub async fn clear_offline(&self, user_id: i64) -> Result<(), NotifyError> {
        self.offline.clear(user_id).await
    }

    /// 为用户创建连接及其出站队列 / Create a connection with its outbound queue
    pub fn open_connection(
        &self,
        user_id: i64,
        remote_addr: &str,
        user_agent: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        Connection::open(user_id, remote_addr, user_agent, self.settings.hub.outbound_capacity)
    }

    /// 注册连接、发送欢迎帧并回放离线消息
    /// Register a connection, send the welcome frame and replay offline messages.
    pub async fn attach(&self, conn: &Arc<Connection>) -> Result<(), NotifyError> {
        let username = match self.directory.username(conn.user_id).await {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(user_id = conn.user_id, "username lookup failed: {}", e);
                String::new()
            }
        };
        self.hub.register(conn.clone(), &conn.meta(username)).await?;

        if self.settings.hub.welcome_frame {
            match WireFrame::system_notice("connection established").encode() {
                Ok(frame) => {
                    if let Err(e) = conn.enqueue(frame) {
                        tracing::debug!(connection_id = %conn.connection_id, "welcome frame skipped: {}", e);
                    }
                }
                Err(e) => tracing::warn!("welcome frame encode failed: {}", e),
            }
        }

        self.replay_offline(conn).await;
        Ok(())
    }

    async fn replay_offline(&self, conn: &Arc<Connection>) {
        let replayed = match self.offline.drain_to(conn.user_id, conn).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(user_id = conn.user_id, "offline replay incomplete, list kept: {}", e);
                return;
            }
        };
        for message_id in replayed {
            if let Err(e) = self
                .ledger
                .update_delivery(&message_id, conn.user_id, DeliveryStatus::Delivered, PushChannel::Offline)
                .await
            {
                self.ledger.record_failed_write();
                tracing::warn!(user_id = conn.user_id, message_id = %message_id, "replay audit failed: {}", e);
                continue;
            }
            self.ledger
                .append_log(
                    NotificationLog::new(&message_id, Some(conn.user_id), LogEvent::Replayed)
                        .with_connection(Some(&conn.connection_id)),
                )
                .await;
        }
    }

    pub async fn stats(&self) -> CoreStats {
        CoreStats {
            hub: self.hub.stats().await,
            dispatcher: self.dispatcher.stats(),
            failed_ledger_writes: self.ledger.failed_writes(),
        }
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// 关闭顺序：排空分发队列，停止 Hub（注销所有连接），等待后台任务
    /// Shutdown order: drain the dispatcher queue, stop the hub (unregistering every
    /// connection), then wait for background tasks.
    pub async fn shutdown(&self) {
        let timeout = Duration::from_secs(self.settings.server.shutdown_timeout_secs);
        self.dispatcher.shutdown(timeout).await;

        let _ = self.shutdown_tx.send(true);
        let hub_task = self.hub_task.lock().take();
        if let Some(handle) = hub_task {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("hub control loop did not stop within {:?}", timeout);
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tokio::time::timeout(timeout, futures_util::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("maintenance tasks did not stop within {:?}", timeout);
        }
        tracing::info!("👋 Notification core stopped");
    }
}

fn validate(n: &Notification) -> Result<(), NotifyError> {
    if n.content.len() > MAX_CONTENT_BYTES {
        return Err(NotifyError::validation(
            "content",
            format!("内容长度不能超过 {} 字节", MAX_CONTENT_BYTES),
        ));
    }
    if matches!(n.target, Target::User | Target::Custom) && n.target_ids.is_empty() {
        return Err(NotifyError::validation("target_ids", "目标用户列表不能为空"));
    }
    Ok(())
}

#[async_trait]
impl InboundHandler for NotificationCore {
    async fn on_frame(&self, conn: &Arc<Connection>, text: &str) {
        match InboundAction::classify(text) {
            InboundAction::Ping => match WireFrame::pong().encode() {
                Ok(frame) => {
                    if let Err(e) = conn.enqueue(frame) {
                        tracing::debug!(connection_id = %conn.connection_id, "pong dropped: {}", e);
                    }
                }
                Err(e) => tracing::warn!("pong encode failed: {}", e),
            },
            InboundAction::Received { message_id } => {
                if let Err(e) = self
                    .mark_received(&message_id, conn.user_id, Some(&conn.connection_id))
                    .await
                {
                    tracing::debug!(user_id = conn.user_id, message_id = %message_id, "socket ack ignored: {}", e);
                }
            }
            InboundAction::Ignore { reason } => {
                tracing::debug!(connection_id = %conn.connection_id, "inbound frame dropped: {}", reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NotificationType;

    #[test]
    fn test_validate_rejects_oversize_content() {
        let n = Notification::new(NotificationType::SystemNotice, "x".repeat(MAX_CONTENT_BYTES + 1)).to_all();
        assert!(matches!(
            validate(&n),
            Err(NotifyError::Validation { ref field, .. }) if field == "content"
        ));
        let n = Notification::new(NotificationType::SystemNotice, "x".repeat(MAX_CONTENT_BYTES)).to_all();
        assert!(validate(&n).is_ok());
    }

    #[test]
    fn test_validate_requires_targets_for_user_and_custom() {
        let n = Notification::new(NotificationType::OrderPaid, "paid").to_users(Vec::<i64>::new());
        assert!(validate(&n).is_err());
        let n = Notification::new(NotificationType::OrderPaid, "paid").to_custom(Vec::<i64>::new(), [1]);
        assert!(validate(&n).is_err());
        let n = Notification::new(NotificationType::OrderPaid, "paid").to_admins();
        assert!(validate(&n).is_ok());
    }
}
