use actix_web::{middleware::Logger, web, App, HttpServer};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, instrument, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::AuthState;
use crate::comm::settings::NotifySettings;
use crate::comm::tracing::init_tracing;
use crate::conf::init_sa_token;
use crate::error::{AppError, AppResult};
use crate::middleware::ConnectionGuard;
use crate::service::{CoreStores, NotificationCore};
use crate::storage::{
    LedgerStore, MemoryLedgerStore, MemoryOfflineStore, OfflineStore, StaticDirectory, UserDirectory,
};
use crate::tasks::spawn_guard_cleanup;

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub config_file: Option<String>,
}

/// 应用启动器
pub struct AppBootstrap {
    overrides: ServerOverrides,
}

impl AppBootstrap {
    /// 创建新的应用启动器
    pub fn new() -> Self {
        Self {
            overrides: ServerOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ServerOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// 运行应用服务器：加载配置、初始化日志与认证、启动通知核心，最后启动 HTTP 服务
    #[instrument(skip(self))]
    pub async fn run(self) -> AppResult<()> {
        let mut settings = NotifySettings::load(self.overrides.config_file.as_deref())?;
        if let Some(host) = self.overrides.host.clone() {
            settings.server.host = host;
        }
        if let Some(port) = self.overrides.port {
            settings.server.port = port;
        }
        if self.overrides.workers.is_some() {
            settings.server.workers = self.overrides.workers;
        }

        init_tracing("vgo-notify", &settings.logging).map_err(AppError::Internal)?;
        settings.log_summary();

        self.init_sa_token_with_retry(&settings).await?;
        let auth_state = AuthState::from_settings(&settings.auth);

        let stores = build_stores(&settings).await?;
        let core = NotificationCore::start(settings.clone(), stores).await?;

        let guard = ConnectionGuard::new(&settings.limits);
        spawn_guard_cleanup(guard.clone(), &core);

        let result = self
            .start_http_server(&settings, core.clone(), auth_state, guard)
            .await;

        // HTTP 服务停止后再关闭核心，保证处理中的请求仍能提交
        core.shutdown().await;

        match result {
            Ok(()) => {
                info!("🛑 Server stopped");
                Ok(())
            }
            Err(e) => {
                error!("服务器运行失败: {}", e);
                Err(e)
            }
        }
    }

    /// 带重试机制的Sa-Token初始化
    async fn init_sa_token_with_retry(&self, settings: &NotifySettings) -> AppResult<()> {
        const MAX_RETRIES: u32 = 3;
        const TIMEOUT_DURATION: Duration = Duration::from_secs(30);

        if settings.auth.provider != "sa_token" {
            info!("Sa-Token skipped, auth provider is {}", settings.auth.provider);
            return Ok(());
        }

        for attempt in 1..=MAX_RETRIES {
            match timeout(TIMEOUT_DURATION, init_sa_token(settings)).await {
                Ok(Ok(_manager)) => {
                    info!("Sa-Token初始化成功");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("Sa-Token初始化失败 (尝试 {}): {}", attempt, e);
                    if attempt == MAX_RETRIES {
                        return Err(AppError::unavailable("sa-token", e.to_string()));
                    }
                }
                Err(_) => {
                    warn!("Sa-Token初始化超时 (尝试 {})", attempt);
                    if attempt == MAX_RETRIES {
                        return Err(AppError::timeout("sa-token initialization"));
                    }
                }
            }

            // 指数退避
            let delay = Duration::from_millis(1000 * 2_u64.pow(attempt - 1));
            info!("等待 {:?} 后重试", delay);
            sleep(delay).await;
        }

        Err(AppError::timeout("sa-token initialization"))
    }

    /// 启动HTTP服务器
    async fn start_http_server(
        &self,
        settings: &NotifySettings,
        core: Arc<NotificationCore>,
        auth_state: AuthState,
        guard: ConnectionGuard,
    ) -> AppResult<()> {
        let core_data = web::Data::new(core);
        let auth_data = web::Data::new(auth_state);

        let mut server = HttpServer::new(move || {
            let guard = guard.clone();
            App::new()
                .wrap(Logger::default())
                .app_data(core_data.clone())
                .app_data(auth_data.clone())
                .service(SwaggerUi::new("/swagger-ui/{_:.*}").url(
                    "/api-doc/openapi.json",
                    crate::api::swagger::ApiDoc::openapi(),
                ))
                .configure(move |cfg| crate::api::configure(cfg, guard))
        })
        .shutdown_timeout(settings.server.shutdown_timeout_secs);
        if let Some(workers) = settings.server.workers {
            server = server.workers(workers);
        }

        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        info!("🚀 Listening on {}", addr);
        server
            .bind(&addr)
            .map_err(|e| AppError::Internal(anyhow::Error::new(e)))?
            .run()
            .await
            .map_err(|e| AppError::Internal(anyhow::Error::new(e)))?;

        Ok(())
    }
}

impl Default for AppBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

/// 按配置构建三个存储
/// Build the three stores named in the settings.
pub async fn build_stores(settings: &NotifySettings) -> AppResult<CoreStores> {
    let offline = build_offline_store(settings).await?;

    #[cfg(feature = "postgres")]
    let pool = match settings.database.url.as_deref() {
        Some(url) if settings.ledger.backend == "postgres" || settings.directory.backend == "postgres" => Some(
            crate::storage::pg_store::connect_pool(url, settings.database.max_connections)
                .await
                .map_err(|e| AppError::database(e.to_string()))?,
        ),
        _ => None,
    };

    let ledger: Arc<dyn LedgerStore> = match settings.ledger.backend.as_str() {
        #[cfg(feature = "postgres")]
        "postgres" => match pool.clone() {
            Some(pool) => Arc::new(crate::storage::pg_store::PgLedgerStore::new(pool)),
            None => return Err(AppError::validation("database.url", "postgres 台账需要数据库地址")),
        },
        "memory" => Arc::new(MemoryLedgerStore::new()),
        other => {
            return Err(AppError::validation(
                "ledger.backend",
                format!("不支持的台账存储: {}", other),
            ))
        }
    };

    let directory: Arc<dyn UserDirectory> = match settings.directory.backend.as_str() {
        #[cfg(feature = "postgres")]
        "postgres" => match pool {
            Some(pool) => Arc::new(
                crate::storage::pg_store::PgUserDirectory::new(pool, &settings.directory.table)
                    .map_err(|e| AppError::validation("directory.table", e.to_string()))?,
            ),
            None => return Err(AppError::validation("database.url", "postgres 用户目录需要数据库地址")),
        },
        "static" => Arc::new(StaticDirectory::from_users(&settings.directory.users)),
        other => {
            return Err(AppError::validation(
                "directory.backend",
                format!("不支持的用户目录: {}", other),
            ))
        }
    };

    info!(
        ledger = %settings.ledger.backend,
        directory = %settings.directory.backend,
        "📋 Stores ready"
    );
    Ok(CoreStores {
        offline,
        ledger,
        directory,
    })
}

async fn build_offline_store(settings: &NotifySettings) -> AppResult<Arc<dyn OfflineStore>> {
    if let Some(url) = settings.redis.url.as_deref() {
        if let Some(store) = connect_redis(url).await? {
            info!("Offline store using Redis");
            return Ok(store);
        }
    }
    Ok(Arc::new(MemoryOfflineStore::new()))
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> AppResult<Option<Arc<dyn OfflineStore>>> {
    let store = crate::storage::redis_store::RedisOfflineStore::connect(url)
        .await
        .map_err(|e| AppError::unavailable("redis", e.to_string()))?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> AppResult<Option<Arc<dyn OfflineStore>>> {
    warn!("Redis feature not enabled, offline store falling back to memory");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_settings_build_memory_stores() {
        let settings = NotifySettings::default();
        let stores = build_stores(&settings).await.unwrap();
        assert!(stores.directory.admin_user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let mut settings = NotifySettings::default();
        settings.ledger.backend = "mongo".to_string();
        assert!(build_stores(&settings).await.is_err());
    }
}
