//! Sa-Token 配置初始化
//! Sa-Token Configuration Initialization

use crate::comm::settings::NotifySettings;
use anyhow::Result;
use async_trait::async_trait;
use sa_token_core::config::TokenStyle;
use sa_token_core::{SaTokenConfig, SaTokenListener, SaTokenManager};
use sa_token_storage_memory::MemoryStorage;
use std::sync::Arc;

/// 登录事件只写日志；推送连接的生命周期由 Hub 管理
/// Login events are only logged; socket lifetime belongs to the hub.
pub struct SessionListener;

#[async_trait]
impl SaTokenListener for SessionListener {
    async fn on_login(&self, login_id: &str, _token: &str, login_type: &str) {
        tracing::debug!(login_id, login_type, "token issued");
    }

    async fn on_logout(&self, login_id: &str, _token: &str, login_type: &str) {
        tracing::debug!(login_id, login_type, "token revoked");
    }

    async fn on_kick_out(&self, login_id: &str, _token: &str, login_type: &str) {
        tracing::info!(login_id, login_type, "👋 user kicked out");
    }
}

/// 初始化 Sa-Token（StpUtil 随之初始化）
/// Initialize Sa-Token; StpUtil is initialized with it.
///
/// 配置了 Redis 且启用 `redis` 功能时使用 Redis 存储，否则使用内存存储。
/// Uses Redis storage when configured and the `redis` feature is on, memory otherwise.
pub async fn init_sa_token(settings: &NotifySettings) -> Result<Arc<SaTokenManager>> {
    let mut config_builder = SaTokenConfig::builder()
        .token_name("Authorization")
        .timeout(settings.auth.token_timeout_secs)
        .register_listener(Arc::new(SessionListener))
        .token_style(TokenStyle::Tik)
        .auto_renew(true);

    match settings.redis.url.as_deref() {
        Some(_url) => {
            #[cfg(feature = "redis")]
            {
                use sa_token_storage_redis::{RedisConfig, RedisStorage};

                let redis_storage = RedisStorage::new(RedisConfig {
                    url: _url.to_string(),
                    prefix: settings
                        .redis
                        .prefix
                        .clone()
                        .unwrap_or_else(|| "sa_token:".to_string()),
                })
                .await?;
                config_builder = config_builder.storage(Arc::new(redis_storage));
                tracing::info!("Sa-Token using Redis storage: {}", _url);
            }

            #[cfg(not(feature = "redis"))]
            {
                tracing::warn!("Redis feature not enabled, Sa-Token falling back to memory storage");
                config_builder = config_builder.storage(Arc::new(MemoryStorage::new()));
            }
        }
        None => {
            config_builder = config_builder.storage(Arc::new(MemoryStorage::new()));
            tracing::info!("Sa-Token using memory storage");
        }
    }

    Ok(Arc::new(config_builder.build()))
}
