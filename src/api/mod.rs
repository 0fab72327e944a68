//! HTTP 接口 / HTTP surface

pub mod admin;
pub mod notify;
pub mod swagger;
pub mod ws;

use crate::middleware::{ConnectionGuard, ConnectionGuardMiddleware};
use actix_web::web;

/// 注册全部路由；只有 `/ws` 升级经过连接守卫
/// Register every route; only the `/ws` upgrade passes through the connection guard.
pub fn configure(cfg: &mut web::ServiceConfig, guard: ConnectionGuard) {
    cfg.service(
        web::resource("/ws")
            .wrap(ConnectionGuardMiddleware::new(guard))
            .route(web::get().to(ws::ws_connect)),
    )
    .route("/ws/stats", web::get().to(ws::ws_stats))
    .service(
        web::scope("/notify")
            .service(notify::mark_received)
            .service(notify::mark_read_batch)
            .service(notify::mark_read)
            .service(notify::mark_confirmed)
            .service(admin::send_notification)
            .service(admin::query_records)
            .service(admin::message_status)
            .service(admin::message_logs)
            .service(admin::push_records)
            .service(admin::online_users)
            .service(admin::offline_count)
            .service(admin::clear_offline),
    );
}
