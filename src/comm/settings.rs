//! 通知服务的类型化配置
//! Typed settings for the notification service
//!
//! 所有字段都有默认值，配置文件只需要覆盖需要修改的部分。
//! Every field has a default; config files only override what they change.

use crate::comm::config::{ConfigManager, ConfigSource};
use crate::comm::config_validator::ConfigValidator;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub dispatcher: DispatcherSettings,
    pub offline: OfflineSettings,
    pub ledger: LedgerSettings,
    pub presence: PresenceSettings,
    pub roster: RosterSettings,
    pub directory: DirectorySettings,
    pub limits: LimitSettings,
    pub auth: AuthSettings,
    pub redis: RedisSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub debug: bool,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: None,
            debug: false,
            shutdown_timeout_secs: 30,
        }
    }
}

/// 连接与 Hub 参数 / Connection and hub parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub outbound_capacity: usize,
    pub pong_wait_secs: u64,
    pub ping_period_secs: u64,
    pub write_wait_secs: u64,
    pub ping_write_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub welcome_frame: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            pong_wait_secs: 60,
            ping_period_secs: 54,
            write_wait_secs: 10,
            ping_write_secs: 3,
            handshake_timeout_secs: 3,
            max_frame_bytes: 4096,
            welcome_frame: true,
        }
    }
}

impl HubSettings {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn ping_write(&self) -> Duration {
        Duration::from_secs(self.ping_write_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    /// 未设置时为 4 × CPU / defaults to 4 × CPU when unset
    pub workers: Option<usize>,
    pub submit_wait_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 50_000,
            workers: None,
            submit_wait_secs: 5,
            max_retries: 3,
            retry_delay_secs: 2,
        }
    }
}

impl DispatcherSettings {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus * 4
        })
    }

    pub fn submit_wait(&self) -> Duration {
        Duration::from_secs(self.submit_wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineSettings {
    pub key_prefix: String,
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub deadline_secs: u64,
    pub marker: String,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            key_prefix: "offline_msg:".to_string(),
            max_entries: 100,
            ttl_secs: 7 * 24 * 3600,
            deadline_secs: 5,
            marker: "[offline] ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// `memory` 或 `postgres` / `memory` or `postgres`
    pub backend: String,
    pub deadline_secs: u64,
    pub log_query_limit: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            deadline_secs: 5,
            log_query_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub stats_interval_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            sweep_interval_secs: 120,
            stats_interval_secs: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterSettings {
    pub ttl_secs: u64,
}

impl Default for RosterSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

/// 静态用户目录（无数据库时使用）
/// Static user directory used when no database is configured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// `static` 或 `postgres`
    pub backend: String,
    pub table: String,
    pub users: Vec<DirectoryUser>,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            backend: "static".to_string(),
            table: "user".to_string(),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

/// 连接限制 / Connection caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub per_ip_connections: usize,
    pub connects_per_window: usize,
    pub window_secs: u64,
    pub global_connections: usize,
    pub min_user_agent_len: usize,
    /// IP 白名单（正则）/ IP whitelist patterns
    pub whitelist: Vec<String>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            per_ip_connections: 10,
            connects_per_window: 10,
            window_secs: 60,
            global_connections: 10_000,
            min_user_agent_len: 10,
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// `sa_token` 或 `static`
    pub provider: String,
    pub token_query_param: String,
    pub token_timeout_secs: i64,
    pub static_tokens: Vec<StaticToken>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            provider: "sa_token".to_string(),
            token_query_param: "token".to_string(),
            token_timeout_secs: 86_400,
            static_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl NotifySettings {
    /// 从分层配置源加载并验证
    /// Load from layered sources and validate
    pub fn load(config_file: Option<&str>) -> AppResult<Self> {
        let mut sources = Vec::new();
        if let Some(path) = config_file {
            sources.push(ConfigSource::required_file(path));
        }
        let manager = ConfigManager::with_sources(sources).map_err(AppError::Internal)?;
        manager.log_sources_info();
        Self::from_manager(&manager)
    }

    /// 从已构建的配置管理器反序列化并验证
    pub fn from_manager(manager: &ConfigManager) -> AppResult<Self> {
        let settings: NotifySettings = manager.deserialize()?;
        ConfigValidator::new().validate(&settings)?;
        info!("配置加载和验证成功 / settings loaded and validated");
        debug!("settings: {:?}", settings);
        Ok(settings)
    }

    /// 打印配置摘要
    pub fn log_summary(&self) {
        info!(
            host = %self.server.host,
            port = self.server.port,
            ledger = %self.ledger.backend,
            directory = %self.directory.backend,
            auth = %self.auth.provider,
            dispatcher_workers = self.dispatcher.worker_count(),
            queue_capacity = self.dispatcher.queue_capacity,
            "📋 configuration summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_constants() {
        let s = NotifySettings::default();
        assert_eq!(s.dispatcher.queue_capacity, 50_000);
        assert_eq!(s.hub.outbound_capacity, 256);
        assert_eq!(s.offline.max_entries, 100);
        assert_eq!(s.offline.ttl_secs, 604_800);
        assert_eq!(s.hub.pong_wait_secs, 60);
        assert_eq!(s.hub.ping_period_secs, 54);
        assert_eq!(s.limits.per_ip_connections, 10);
        assert_eq!(s.limits.global_connections, 10_000);
        assert_eq!(s.presence.stale_after_secs, 300);
        assert_eq!(s.offline.key_prefix, "offline_msg:");
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let manager = ConfigManager::isolated(vec![ConfigSource::toml(
            "[server]\nport = 9001\n[dispatcher]\nworkers = 2\n\n[[directory.users]]\nid = 1\nusername = \"root\"\nadmin = true\n",
        )])
        .unwrap();
        let s = NotifySettings::from_manager(&manager).unwrap();
        assert_eq!(s.server.port, 9001);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.dispatcher.worker_count(), 2);
        assert_eq!(s.directory.users.len(), 1);
        assert!(s.directory.users[0].admin);
    }

    #[test]
    fn test_worker_count_defaults_to_four_per_cpu() {
        let s = DispatcherSettings::default();
        assert!(s.worker_count() >= 4);
        assert_eq!(s.worker_count() % 4, 0);
    }
}
