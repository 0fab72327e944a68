//! 认证：令牌 → 用户ID
//! Authentication: token → user ID

use crate::comm::settings::AuthSettings;
use crate::error::AppError;
use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use async_trait::async_trait;
use futures_util::future::LocalBoxFuture;
use sa_token_core::{StpUtil, TokenValue};
use std::collections::HashMap;
use std::sync::Arc;

/// 令牌解析器 / Resolves a token to a user ID
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<i64, AppError>;
}

/// 通过 Sa-Token 解析登录ID
/// Resolves the login ID through Sa-Token.
pub struct SaTokenAuthenticator;

#[async_trait]
impl Authenticator for SaTokenAuthenticator {
    async fn resolve(&self, token: &str) -> Result<i64, AppError> {
        let token = TokenValue::new(token);
        let login_id = StpUtil::get_login_id(&token)
            .await
            .map_err(|e| AppError::auth(format!("令牌无效: {}", e)))?;
        login_id
            .parse::<i64>()
            .map_err(|_| AppError::auth(format!("登录ID不是用户ID: {}", login_id)))
    }
}

/// 静态令牌表，用于测试与本地开发
/// Static token table for tests and local development.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, i64>,
}

impl StaticAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = (String, i64)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn resolve(&self, token: &str) -> Result<i64, AppError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| AppError::auth("令牌无效"))
    }
}

/// 处理器共享的认证状态 / Authentication state shared with handlers
#[derive(Clone)]
pub struct AuthState {
    pub authenticator: Arc<dyn Authenticator>,
    pub token_param: String,
}

impl AuthState {
    pub fn new(authenticator: Arc<dyn Authenticator>, token_param: impl Into<String>) -> Self {
        Self {
            authenticator,
            token_param: token_param.into(),
        }
    }

    /// 按配置选择实现 / Pick the implementation named in the settings
    pub fn from_settings(settings: &AuthSettings) -> Self {
        let authenticator: Arc<dyn Authenticator> = match settings.provider.as_str() {
            "static" => Arc::new(StaticAuthenticator::new(
                settings
                    .static_tokens
                    .iter()
                    .map(|t| (t.token.clone(), t.user_id)),
            )),
            _ => Arc::new(SaTokenAuthenticator),
        };
        Self::new(authenticator, settings.token_query_param.clone())
    }
}

/// 先取查询参数中的令牌，再取 `Authorization` 头
/// Token from the query string first, then the `Authorization` header.
pub fn extract_token(req: &HttpRequest, query_param: &str) -> Option<String> {
    let from_query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|q| q.get(query_param).cloned())
        .filter(|t| !t.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// 已认证的用户ID / Authenticated user ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub i64);

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AuthState>>().cloned();
        let token = state
            .as_ref()
            .and_then(|s| extract_token(req, &s.token_param));

        Box::pin(async move {
            let state = state.ok_or_else(|| AppError::auth("认证未配置"))?;
            let token = token.ok_or_else(|| AppError::auth("缺少令牌"))?;
            let user_id = state.authenticator.resolve(&token).await?;
            Ok(AuthUser(user_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App, HttpResponse};

    fn state() -> AuthState {
        AuthState::new(
            Arc::new(StaticAuthenticator::new([("tok-42".to_string(), 42)])),
            "token",
        )
    }

    async fn whoami(user: AuthUser) -> HttpResponse {
        HttpResponse::Ok().body(user.0.to_string())
    }

    #[actix_web::test]
    async fn test_token_from_query_or_header() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state()))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let req = test::TestRequest::get().uri("/me?token=tok-42").to_request();
        assert_eq!(test::call_and_read_body(&app, req).await, "42");

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", "Bearer tok-42"))
            .to_request();
        assert_eq!(test::call_and_read_body(&app, req).await, "42");

        let req = test::TestRequest::get().uri("/me?token=bad").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get().uri("/me").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    // StpUtil 的全局管理器只能初始化一次，Sa-Token 相关断言集中在这里
    #[actix_web::test]
    async fn test_sa_token_login_id_resolves_to_user() {
        crate::conf::init_sa_token(&crate::comm::NotifySettings::default())
            .await
            .unwrap();

        let token = StpUtil::login(42).await.unwrap();
        assert_eq!(SaTokenAuthenticator.resolve(token.as_str()).await.unwrap(), 42);

        let named = StpUtil::login("alice").await.unwrap();
        assert!(SaTokenAuthenticator.resolve(named.as_str()).await.is_err());
        assert!(SaTokenAuthenticator.resolve("not-a-token").await.is_err());
    }
}
