use crate::api::admin::OfflineSummary;
use crate::api::notify::{AckRequest, BatchReadRequest, BatchReadResult, ReceivedRequest};
use crate::domain::{
    DeliveryRecord, DeliveryStatus, LogEvent, MessageStats, NotificationLog, NotificationType, OnlineStatus,
    Priority, PushChannel, PushRecord, PushStatus, SendNotificationRequest, Target,
};
use crate::service::{DispatcherStats, FanOutReport, SubmitOutcome};
use crate::ws::HubStats;
use utoipa::OpenApi;

/// OpenAPI 文档聚合
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::ws::ws_connect,
        crate::api::ws::ws_stats,
        crate::api::notify::mark_received,
        crate::api::notify::mark_read,
        crate::api::notify::mark_confirmed,
        crate::api::notify::mark_read_batch,
        crate::api::admin::send_notification,
        crate::api::admin::query_records,
        crate::api::admin::message_status,
        crate::api::admin::message_logs,
        crate::api::admin::push_records,
        crate::api::admin::online_users,
        crate::api::admin::offline_count,
        crate::api::admin::clear_offline,
    ),
    components(
        schemas(
            HubStats,
            DispatcherStats,
            SubmitOutcome,
            FanOutReport,
            SendNotificationRequest,
            NotificationType,
            Priority,
            Target,
            DeliveryRecord,
            DeliveryStatus,
            PushChannel,
            PushRecord,
            PushStatus,
            NotificationLog,
            LogEvent,
            OnlineStatus,
            MessageStats,
            ReceivedRequest,
            AckRequest,
            BatchReadRequest,
            BatchReadResult,
            OfflineSummary,
        )
    ),
    tags(
        (name = "Notify", description = "推送连接与客户端回执"),
        (name = "Admin", description = "通知提交、投递审计与在线状态")
    )
)]
pub struct ApiDoc;
