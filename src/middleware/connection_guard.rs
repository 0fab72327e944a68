use crate::comm::settings::LimitSettings;
use crate::error::AppError;
use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage, HttpRequest, ResponseError,
};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// 连接被拒绝的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardRejection {
    #[error("User-Agent 无效")]
    UserAgent,
    #[error("IP {ip} 并发连接数已达上限 {limit}")]
    PerIpLimit { ip: String, limit: usize },
    #[error("IP {ip} 连接过于频繁，请稍后再试")]
    RateLimited { ip: String },
    #[error("服务器连接数已达上限 {limit}")]
    GlobalLimit { limit: usize },
}

impl From<GuardRejection> for AppError {
    fn from(r: GuardRejection) -> Self {
        match r {
            GuardRejection::UserAgent => AppError::validation("User-Agent", r.to_string()),
            GuardRejection::PerIpLimit { .. } | GuardRejection::RateLimited { .. } => {
                AppError::too_many_requests(r.to_string())
            }
            GuardRejection::GlobalLimit { .. } => AppError::unavailable("websocket", r.to_string()),
        }
    }
}

#[derive(Default)]
struct GuardState {
    active: HashMap<String, usize>,
    attempts: HashMap<String, VecDeque<Instant>>,
    total: usize,
}

struct GuardInner {
    per_ip: usize,
    per_window: usize,
    window: Duration,
    global: usize,
    min_user_agent_len: usize,
    whitelist: Vec<Regex>,
    state: Mutex<GuardState>,
}

/// 按 IP 的连接守卫：并发上限、滑动窗口连接频率与全局上限
/// Per-IP connection guard: concurrent cap, sliding-window connect rate and a global cap.
#[derive(Clone)]
pub struct ConnectionGuard {
    inner: Arc<GuardInner>,
}

impl ConnectionGuard {
    pub fn new(limits: &LimitSettings) -> Self {
        let whitelist = limits
            .whitelist
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("ignoring invalid whitelist pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();
        Self {
            inner: Arc::new(GuardInner {
                per_ip: limits.per_ip_connections,
                per_window: limits.connects_per_window,
                window: Duration::from_secs(limits.window_secs),
                global: limits.global_connections,
                min_user_agent_len: limits.min_user_agent_len,
                whitelist,
                state: Mutex::new(GuardState::default()),
            }),
        }
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.inner.whitelist.iter().any(|re| re.is_match(ip))
    }

    /// 检查并占用一个连接名额 / Check the caps and take a connection slot
    pub fn admit(&self, ip: &str, user_agent: &str) -> Result<ConnectionPermit, GuardRejection> {
        if user_agent.len() < self.inner.min_user_agent_len {
            return Err(GuardRejection::UserAgent);
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.global {
            return Err(GuardRejection::GlobalLimit {
                limit: self.inner.global,
            });
        }

        if !self.is_whitelisted(ip) {
            let window = self.inner.window;
            let attempts = state.attempts.entry(ip.to_string()).or_default();
            while attempts.front().is_some_and(|t| now.duration_since(*t) >= window) {
                attempts.pop_front();
            }
            if attempts.len() >= self.inner.per_window {
                return Err(GuardRejection::RateLimited { ip: ip.to_string() });
            }
            attempts.push_back(now);

            let active = state.active.get(ip).copied().unwrap_or(0);
            if active >= self.inner.per_ip {
                return Err(GuardRejection::PerIpLimit {
                    ip: ip.to_string(),
                    limit: self.inner.per_ip,
                });
            }
        }

        *state.active.entry(ip.to_string()).or_insert(0) += 1;
        state.total += 1;
        Ok(ConnectionPermit {
            inner: self.inner.clone(),
            ip: ip.to_string(),
        })
    }

    pub fn active_for(&self, ip: &str) -> usize {
        self.inner.state.lock().active.get(ip).copied().unwrap_or(0)
    }

    pub fn total_active(&self) -> usize {
        self.inner.state.lock().total
    }

    /// 清理过期的连接记录 / Drop expired attempt history
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.inner.window;
        let mut state = self.inner.state.lock();
        let before = state.attempts.len();
        state.attempts.retain(|_, attempts| {
            while attempts.front().is_some_and(|t| now.duration_since(*t) >= window) {
                attempts.pop_front();
            }
            !attempts.is_empty()
        });
        before - state.attempts.len()
    }
}

/// 连接名额，释放时归还 / A connection slot, returned on drop
pub struct ConnectionPermit {
    inner: Arc<GuardInner>,
    ip: String,
}

impl ConnectionPermit {
    pub fn ip(&self) -> &str {
        &self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(count) = state.active.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(&self.ip);
            }
        }
        state.total = state.total.saturating_sub(1);
    }
}

/// 获取客户端IP地址
pub fn client_ip(req: &HttpRequest) -> String {
    if let Some(forwarded_for) = req.headers().get("X-Forwarded-For") {
        if let Ok(value) = forwarded_for.to_str() {
            if let Some(first_ip) = value.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = req.headers().get("X-Real-IP") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn user_agent(req: &HttpRequest) -> String {
    req.headers()
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// WebSocket 握手前的连接守卫中间件；通过时把 `ConnectionPermit` 放入请求扩展
/// Guard middleware in front of the WebSocket upgrade; on success the `ConnectionPermit`
/// is placed in the request extensions.
pub struct ConnectionGuardMiddleware {
    guard: ConnectionGuard,
}

impl ConnectionGuardMiddleware {
    pub fn new(guard: ConnectionGuard) -> Self {
        Self { guard }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ConnectionGuardMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = ConnectionGuardService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ConnectionGuardService {
            service: Rc::new(service),
            guard: self.guard.clone(),
        }))
    }
}

pub struct ConnectionGuardService<S> {
    service: Rc<S>,
    guard: ConnectionGuard,
}

impl<S, B> Service<ServiceRequest> for ConnectionGuardService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let guard = self.guard.clone();

        Box::pin(async move {
            let ip = client_ip(req.request());
            let agent = user_agent(req.request());

            match guard.admit(&ip, &agent) {
                Ok(permit) => {
                    debug!("连接检查通过: IP {} 活跃 {}", ip, guard.active_for(&ip));
                    req.extensions_mut().insert(permit);
                    let response = service.call(req).await?;
                    Ok(response.map_into_boxed_body())
                }
                Err(rejection) => {
                    warn!("连接被拒绝: IP {} - {}", ip, rejection);
                    let response = AppError::from(rejection).error_response();
                    Ok(req.into_response(response))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, web, App, HttpResponse};

    const AGENT: &str = "Mozilla/5.0 (test)";

    fn limits(per_ip: usize, per_window: usize, global: usize) -> LimitSettings {
        LimitSettings {
            per_ip_connections: per_ip,
            connects_per_window: per_window,
            window_secs: 60,
            global_connections: global,
            ..LimitSettings::default()
        }
    }

    #[test]
    fn test_eleventh_concurrent_connection_rejected() {
        let guard = ConnectionGuard::new(&limits(10, 100, 10_000));
        let permits: Vec<_> = (0..10).map(|_| guard.admit("1.2.3.4", AGENT).unwrap()).collect();
        assert!(matches!(
            guard.admit("1.2.3.4", AGENT),
            Err(GuardRejection::PerIpLimit { .. })
        ));
        assert!(guard.admit("5.6.7.8", AGENT).is_ok());
        drop(permits);
        assert_eq!(guard.active_for("1.2.3.4"), 0);
        assert!(guard.admit("1.2.3.4", AGENT).is_ok());
    }

    #[test]
    fn test_eleventh_attempt_in_window_rejected() {
        let guard = ConnectionGuard::new(&limits(100, 10, 10_000));
        for _ in 0..10 {
            drop(guard.admit("1.2.3.4", AGENT).unwrap());
        }
        assert!(matches!(
            guard.admit("1.2.3.4", AGENT),
            Err(GuardRejection::RateLimited { .. })
        ));
    }

    #[test]
    fn test_global_cap_and_user_agent() {
        let guard = ConnectionGuard::new(&limits(10, 10, 2));
        let _a = guard.admit("1.1.1.1", AGENT).unwrap();
        let _b = guard.admit("2.2.2.2", AGENT).unwrap();
        assert!(matches!(
            guard.admit("3.3.3.3", AGENT),
            Err(GuardRejection::GlobalLimit { .. })
        ));
        assert_eq!(guard.admit("3.3.3.3", "curl").err(), Some(GuardRejection::UserAgent));
    }

    #[test]
    fn test_whitelist_bypasses_ip_caps() {
        let guard = ConnectionGuard::new(&LimitSettings {
            whitelist: vec![r"^10\.0\.".to_string()],
            ..limits(1, 1, 100)
        });
        let _held: Vec<_> = (0..5).map(|_| guard.admit("10.0.0.7", AGENT).unwrap()).collect();
        assert_eq!(guard.total_active(), 5);
    }

    #[test]
    fn test_cleanup_drops_empty_histories() {
        let guard = ConnectionGuard::new(&LimitSettings {
            window_secs: 0,
            ..limits(10, 10, 100)
        });
        drop(guard.admit("1.2.3.4", AGENT).unwrap());
        assert_eq!(guard.cleanup_expired(), 1);
    }

    async fn upgrade() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn test_middleware_returns_429_when_over_cap() {
        let guard = ConnectionGuard::new(&limits(100, 2, 100));
        let app = actix_test::init_service(
            App::new()
                .wrap(ConnectionGuardMiddleware::new(guard))
                .route("/ws", web::get().to(upgrade)),
        )
        .await;

        for _ in 0..2 {
            let req = actix_test::TestRequest::get()
                .uri("/ws")
                .insert_header(("User-Agent", AGENT))
                .insert_header(("X-Real-IP", "9.9.9.9"))
                .to_request();
            assert!(actix_test::call_service(&app, req).await.status().is_success());
        }
        let req = actix_test::TestRequest::get()
            .uri("/ws")
            .insert_header(("User-Agent", AGENT))
            .insert_header(("X-Real-IP", "9.9.9.9"))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 429);

        let req = actix_test::TestRequest::get()
            .uri("/ws")
            .insert_header(("User-Agent", "short"))
            .to_request();
        assert_eq!(actix_test::call_service(&app, req).await.status(), 400);
    }
}
