//! 推送与审计接口
//! Submission and audit endpoints

use crate::api_success;
use crate::auth::AuthUser;
use crate::domain::{
    DeliveryRecord, MessageStats, NotificationLog, OnlineStatus, Page, PageParams, PushRecord, RecordQuery,
    SendNotificationRequest,
};
use crate::error::AppResult;
use crate::service::{NotificationCore, SubmitOutcome};
use actix_web::{web, Responder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogQuery {
    /// 最多返回条数
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OfflineSummary {
    pub user_id: i64,
    pub count: usize,
}

/// 提交通知
///
/// 紧急通知会等待投递完成（最长 5 秒），其余优先级入队即返回。
#[utoipa::path(
    post,
    path = "/notify/send",
    tag = "Admin",
    request_body = SendNotificationRequest,
    responses(
        (status = 200, description = "已受理", body = SubmitOutcome),
        (status = 400, description = "参数校验失败"),
        (status = 503, description = "分发队列已满")
    )
)]
#[actix_web::post("/send")]
pub async fn send_notification(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    body: web::Json<SendNotificationRequest>,
) -> AppResult<impl Responder> {
    let outcome = core.send(body.into_inner(), user.0).await?;
    tracing::info!(
        sender_id = user.0,
        message_id = %outcome.message_id,
        completed = outcome.completed,
        "📨 Notification accepted"
    );
    api_success!(outcome)
}

/// 分页查询接收记录
#[utoipa::path(
    get,
    path = "/notify/records",
    tag = "Admin",
    params(RecordQuery),
    responses((status = 200, description = "接收记录", body = Page<DeliveryRecord>))
)]
#[actix_web::get("/records")]
pub async fn query_records(
    _user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    query: web::Query<RecordQuery>,
) -> AppResult<impl Responder> {
    let page = core.query_records(&query).await?;
    api_success!(page)
}

/// 单条消息的送达统计
#[utoipa::path(
    get,
    path = "/notify/status/{message_id}",
    tag = "Admin",
    params(("message_id" = String, Path, description = "消息ID")),
    responses((status = 200, description = "计数与比率", body = MessageStats))
)]
#[actix_web::get("/status/{message_id}")]
pub async fn message_status(
    _user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    path: web::Path<String>,
) -> AppResult<impl Responder> {
    let stats = core.status_of(&path).await?;
    api_success!(stats)
}

/// 单条消息的状态迁移日志（新的在前）
#[utoipa::path(
    get,
    path = "/notify/logs/{message_id}",
    tag = "Admin",
    params(("message_id" = String, Path, description = "消息ID"), LogQuery),
    responses((status = 200, description = "迁移日志", body = Vec<NotificationLog>))
)]
#[actix_web::get("/logs/{message_id}")]
pub async fn message_logs(
    _user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    path: web::Path<String>,
    query: web::Query<LogQuery>,
) -> AppResult<impl Responder> {
    let logs = core.logs_for(&path, query.limit).await?;
    api_success!(logs)
}

/// 分页查询推送记录
#[utoipa::path(
    get,
    path = "/notify/push-records",
    tag = "Admin",
    params(PageParams),
    responses((status = 200, description = "推送记录", body = Page<PushRecord>))
)]
#[actix_web::get("/push-records")]
pub async fn push_records(
    _user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    query: web::Query<PageParams>,
) -> AppResult<impl Responder> {
    let page = core.list_push_records(query.into_inner().into()).await?;
    api_success!(page)
}

/// 在线用户列表（过期的在线标记会被修正）
#[utoipa::path(
    get,
    path = "/notify/online",
    tag = "Admin",
    responses((status = 200, description = "在线状态", body = Vec<OnlineStatus>))
)]
#[actix_web::get("/online")]
pub async fn online_users(_user: AuthUser, core: web::Data<Arc<NotificationCore>>) -> AppResult<impl Responder> {
    let online = core.list_online().await?;
    api_success!(online)
}

/// 离线消息数量
#[utoipa::path(
    get,
    path = "/notify/offline/{user_id}",
    tag = "Admin",
    params(("user_id" = i64, Path, description = "用户ID")),
    responses(
        (status = 200, description = "离线消息数量", body = OfflineSummary),
        (status = 503, description = "离线存储不可用")
    )
)]
#[actix_web::get("/offline/{user_id}")]
pub async fn offline_count(
    _user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    path: web::Path<i64>,
) -> AppResult<impl Responder> {
    let user_id = path.into_inner();
    let count = core.offline_count(user_id).await?;
    api_success!(OfflineSummary { user_id, count })
}

/// 清空离线消息
#[utoipa::path(
    delete,
    path = "/notify/offline/{user_id}",
    tag = "Admin",
    params(("user_id" = i64, Path, description = "用户ID")),
    responses(
        (status = 200, description = "已清空", body = OfflineSummary),
        (status = 503, description = "离线存储不可用")
    )
)]
#[actix_web::delete("/offline/{user_id}")]
pub async fn clear_offline(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    path: web::Path<i64>,
) -> AppResult<impl Responder> {
    let user_id = path.into_inner();
    core.clear_offline(user_id).await?;
    tracing::info!(operator = user.0, user_id, "offline list cleared");
    api_success!(OfflineSummary { user_id, count: 0 })
}
