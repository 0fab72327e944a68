//! WebSocket 接入与 Hub 统计
//! WebSocket upgrade endpoint and hub statistics

use crate::auth::{extract_token, AuthState};
use crate::error::{AppError, AppResult};
use crate::middleware::{client_ip, user_agent, ConnectionPermit};
use crate::service::NotificationCore;
use crate::ws::{session, HubStats, InboundHandler};
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Responder};
use actix_ws::CloseCode;
use std::sync::Arc;
use tokio::time::timeout;

/// 建立推送连接
///
/// 令牌先取 `token` 查询参数，再取 `Authorization` 头。连接守卫发放的名额随连接存活，
/// 连接结束时归还。路由挂在 `ConnectionGuardMiddleware` 之后。
#[utoipa::path(
    get,
    path = "/ws",
    tag = "Notify",
    params(("token" = Option<String>, Query, description = "登录令牌")),
    responses(
        (status = 101, description = "协议升级成功"),
        (status = 400, description = "User-Agent 不合法"),
        (status = 401, description = "令牌无效"),
        (status = 429, description = "连接过多")
    )
)]
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    core: web::Data<Arc<NotificationCore>>,
    auth: web::Data<AuthState>,
) -> AppResult<HttpResponse> {
    let permit = req.extensions_mut().remove::<ConnectionPermit>();

    let token = extract_token(&req, &auth.token_param).ok_or_else(|| AppError::auth("缺少令牌"))?;
    let user_id = auth.authenticator.resolve(&token).await?;

    let ip = permit
        .as_ref()
        .map(|p| p.ip().to_string())
        .unwrap_or_else(|| client_ip(&req));
    let agent = user_agent(&req);

    let (response, ws_session, msg_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::validation("upgrade", e.to_string()))?;

    let core = core.get_ref().clone();
    let (conn, outbound) = core.open_connection(user_id, &ip, &agent);
    let timing = core.timing();
    let handshake = core.settings().hub.handshake_timeout();

    actix_web::rt::spawn(async move {
        let _permit = permit;
        match timeout(handshake, core.attach(&conn)).await {
            Ok(Ok(())) => {
                tracing::info!(user_id, connection_id = %conn.connection_id, ip = %ip, "✅ Client connected");
                let handler: Arc<dyn InboundHandler> = core.clone();
                session::serve(conn, outbound, ws_session, msg_stream, timing, core.hub().clone(), handler).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id, connection_id = %conn.connection_id, "attach failed: {}", e);
                core.hub().unregister(&conn).await;
                let _ = ws_session.close(Some(CloseCode::Error.into())).await;
            }
            Err(_) => {
                tracing::warn!(user_id, connection_id = %conn.connection_id, "attach timed out after {:?}", handshake);
                core.hub().unregister(&conn).await;
                let _ = ws_session.close(Some(CloseCode::Away.into())).await;
            }
        }
    });

    Ok(response)
}

/// 获取 Hub 连接统计
#[utoipa::path(
    get,
    path = "/ws/stats",
    tag = "Notify",
    responses((status = 200, description = "连接统计", body = HubStats))
)]
pub async fn ws_stats(core: web::Data<Arc<NotificationCore>>) -> AppResult<impl Responder> {
    let stats = core.hub().stats().await;
    Ok(web::Json(stats))
}
