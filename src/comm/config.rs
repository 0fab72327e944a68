use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// 环境变量前缀 / Environment variable prefix
pub const ENV_PREFIX: &str = "VGO_NOTIFY";

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {path}")]
    FileNotFound { path: String },
    #[error("配置项 '{key}' 不存在")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("配置值无效: {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// 配置数据源信息
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置管理器
///
/// 加载顺序（后加载者优先）：
/// `config/default.toml` → `config/<APP_ENV>.toml` → 调用方提供的配置源 → 环境变量
///
/// Load order (later wins): default file, environment file, caller sources, env vars.
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 只加载默认配置源
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用指定的配置源创建配置管理器
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let mut ordered = vec![
            ConfigSource::File {
                path: "config/default.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: format!("config/{}.toml", app_env),
                format: Some(FileFormat::Toml),
                required: false,
            },
        ];
        ordered.extend(sources);
        ordered.push(ConfigSource::Env {
            prefix: ENV_PREFIX.to_string(),
            separator: "__",
        });

        Self::build(ordered)
    }

    /// 不加载任何默认文件，只使用给定配置源（测试使用）
    /// Build from the given sources only, without default files or env vars.
    pub fn isolated(sources: Vec<ConfigSource>) -> Result<Self> {
        Self::build(sources)
    }

    fn build(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::new();

        for (index, source) in sources.into_iter().enumerate() {
            let mut info = source.get_source_info(index as u8 + 1);

            // 可选文件不存在时跳过，必需文件不存在时报错
            if let ConfigSource::File { path, required, .. } = &source {
                if !std::path::Path::new(path).exists() {
                    if *required {
                        return Err(ConfigError::FileNotFound { path: path.clone() }.into());
                    }
                    sources_info.push(info);
                    continue;
                }
            }

            builder = source.add_to_builder(builder)?;
            info.loaded = true;
            sources_info.push(info);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败: {}", e))?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 获取指定 key 的配置值
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败: {}", key, e))
    }

    /// 获取指定 key 的配置值，如果不存在返回默认值
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 安全获取配置值，返回详细错误信息
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::TypeConversionError {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 检查配置项是否存在
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    /// 反序列化整个配置树
    /// Deserialize the whole tree into a typed settings struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> std::result::Result<T, ConfigError> {
        self.config
            .clone()
            .try_deserialize::<T>()
            .map_err(|e| ConfigError::TypeConversionError {
                key: "<root>".to_string(),
                message: e.to_string(),
            })
    }

    /// 获取所有配置源信息
    pub fn get_sources_info(&self) -> &[ConfigSourceInfo] {
        &self.sources_info
    }

    /// 记录配置源加载情况
    pub fn log_sources_info(&self) {
        for info in &self.sources_info {
            if info.loaded {
                tracing::info!(priority = info.priority, "✓ config source loaded: {}", info.description);
            } else {
                tracing::debug!(priority = info.priority, "✗ config source skipped: {}", info.description);
            }
        }
    }
}

/// 配置源类型
pub enum ConfigSource {
    /// 文件配置源
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源（HashMap）
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    /// 必需的配置文件（命令行 --config）
    pub fn required_file(path: impl Into<String>) -> Self {
        ConfigSource::File {
            path: path.into(),
            format: None,
            required: true,
        }
    }

    /// TOML 字符串配置源
    pub fn toml(content: impl Into<String>) -> Self {
        ConfigSource::String {
            content: content.into(),
            format: FileFormat::Toml,
        }
    }

    /// 获取配置源信息
    pub fn get_source_info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => (
                "File",
                format!("文件配置源: {} (必需: {})", path, required),
            ),
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("环境变量配置源: 前缀={}, 分隔符={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => ("Memory", format!("内存配置源: {} 个配置项", map.len())),
            ConfigSource::String { .. } => ("String", "字符串配置源".to_string()),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    pub fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file_source = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("_")
                    .separator(separator)
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let json_content = serde_json::to_string(&map)
                    .map_err(|e| anyhow!("序列化内存配置失败: {}", e))?;
                Ok(builder.add_source(File::from_str(&json_content, FileFormat::Json)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigManager, ConfigSource};
    use std::collections::HashMap;

    #[test]
    fn test_config_from_string() {
        let manager =
            ConfigManager::isolated(vec![ConfigSource::toml("[server]\nport = 8080")]).unwrap();
        assert_eq!(manager.get::<i64>("server.port").unwrap(), 8080);
        assert!(manager.exists("server.port"));
        assert!(!manager.exists("server.host"));
    }

    #[test]
    fn test_later_source_wins() {
        let manager = ConfigManager::isolated(vec![
            ConfigSource::toml("[hub]\noutbound_capacity = 256"),
            ConfigSource::toml("[hub]\noutbound_capacity = 16"),
        ])
        .unwrap();
        assert_eq!(manager.get::<usize>("hub.outbound_capacity").unwrap(), 16);
    }

    #[test]
    fn test_config_from_memory() {
        let mut map = HashMap::new();
        map.insert(
            "host".to_string(),
            serde_json::Value::String("127.0.0.1".to_string()),
        );
        let manager = ConfigManager::isolated(vec![ConfigSource::Memory(map)]).unwrap();
        assert_eq!(manager.get::<String>("host").unwrap(), "127.0.0.1");
        assert_eq!(manager.get_or::<u16>("port", 9000), 9000);
    }

    #[test]
    fn test_missing_key_reports_not_found() {
        let manager = ConfigManager::isolated(vec![ConfigSource::toml("a = 1")]).unwrap();
        assert!(matches!(
            manager.get_safe::<i64>("b"),
            Err(ConfigError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn test_required_file_missing_fails() {
        let result = ConfigManager::isolated(vec![ConfigSource::required_file(
            "/definitely/not/here.toml",
        )]);
        assert!(result.is_err());
    }
}
