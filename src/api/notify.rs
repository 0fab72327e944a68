//! 客户端回执接口
//! Client acknowledgement endpoints

use crate::api_success;
use crate::auth::AuthUser;
use crate::domain::DeliveryRecord;
use crate::error::AppResult;
use crate::service::NotificationCore;
use actix_web::{web, Responder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// 已接收回执
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReceivedRequest {
    pub message_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// 已读或已确认回执
#[derive(Debug, Deserialize, ToSchema)]
pub struct AckRequest {
    pub message_id: String,
}

/// 批量已读
#[derive(Debug, Deserialize, ToSchema)]
pub struct BatchReadRequest {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchReadResult {
    pub requested: usize,
    pub updated: usize,
}

/// 标记已接收
#[utoipa::path(
    post,
    path = "/notify/received",
    tag = "Notify",
    request_body = ReceivedRequest,
    responses(
        (status = 200, description = "回执已记录", body = DeliveryRecord),
        (status = 404, description = "接收记录不存在"),
        (status = 503, description = "台账不可用")
    )
)]
#[actix_web::post("/received")]
pub async fn mark_received(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    body: web::Json<ReceivedRequest>,
) -> AppResult<impl Responder> {
    let record = core
        .mark_received(&body.message_id, user.0, body.connection_id.as_deref())
        .await?;
    api_success!(record)
}

/// 标记已读
#[utoipa::path(
    post,
    path = "/notify/read",
    tag = "Notify",
    request_body = AckRequest,
    responses(
        (status = 200, description = "回执已记录", body = DeliveryRecord),
        (status = 404, description = "接收记录不存在"),
        (status = 503, description = "台账不可用")
    )
)]
#[actix_web::post("/read")]
pub async fn mark_read(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    body: web::Json<AckRequest>,
) -> AppResult<impl Responder> {
    let record = core.mark_read(&body.message_id, user.0).await?;
    api_success!(record)
}

/// 标记已确认
#[utoipa::path(
    post,
    path = "/notify/confirmed",
    tag = "Notify",
    request_body = AckRequest,
    responses(
        (status = 200, description = "回执已记录", body = DeliveryRecord),
        (status = 404, description = "接收记录不存在"),
        (status = 503, description = "台账不可用")
    )
)]
#[actix_web::post("/confirmed")]
pub async fn mark_confirmed(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    body: web::Json<AckRequest>,
) -> AppResult<impl Responder> {
    let record = core.mark_confirmed(&body.message_id, user.0).await?;
    api_success!(record)
}

/// 批量标记已读；不存在的记录被跳过
#[utoipa::path(
    post,
    path = "/notify/read/batch",
    tag = "Notify",
    request_body = BatchReadRequest,
    responses(
        (status = 200, description = "已更新数量", body = BatchReadResult),
        (status = 503, description = "台账不可用")
    )
)]
#[actix_web::post("/read/batch")]
pub async fn mark_read_batch(
    user: AuthUser,
    core: web::Data<Arc<NotificationCore>>,
    body: web::Json<BatchReadRequest>,
) -> AppResult<impl Responder> {
    let updated = core.mark_read_batch(&body.message_ids, user.0).await?;
    api_success!(BatchReadResult {
        requested: body.message_ids.len(),
        updated,
    })
}
