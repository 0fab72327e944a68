use crate::comm::settings::NotifySettings;
use crate::error::{AppError, AppResult};
use std::collections::HashMap;

/// 配置验证规则
#[derive(Debug, Clone)]
pub struct ConfigValidationRule {
    pub key: String,
    pub data_type: ConfigDataType,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub allowed_values: Option<Vec<String>>,
    pub regex_pattern: Option<String>,
    pub description: String,
}

impl ConfigValidationRule {
    fn integer(key: &str, min: f64, max: f64, description: &str) -> Self {
        Self {
            key: key.to_string(),
            data_type: ConfigDataType::Integer,
            min_value: Some(min),
            max_value: Some(max),
            allowed_values: None,
            regex_pattern: None,
            description: description.to_string(),
        }
    }

    fn one_of(key: &str, allowed: &[&str], description: &str) -> Self {
        Self {
            key: key.to_string(),
            data_type: ConfigDataType::String,
            min_value: None,
            max_value: None,
            allowed_values: Some(allowed.iter().map(|s| s.to_string()).collect()),
            regex_pattern: None,
            description: description.to_string(),
        }
    }
}

/// 配置数据类型
#[derive(Debug, Clone)]
pub enum ConfigDataType {
    String,
    Integer,
    Boolean,
}

/// 配置验证器
pub struct ConfigValidator {
    rules: HashMap<String, ConfigValidationRule>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let mut rules = HashMap::new();
        let mut add = |rule: ConfigValidationRule| {
            rules.insert(rule.key.clone(), rule);
        };

        add(ConfigValidationRule {
            key: "server.host".to_string(),
            data_type: ConfigDataType::String,
            min_value: None,
            max_value: None,
            allowed_values: None,
            regex_pattern: Some(r"^[a-zA-Z0-9.:\-]+$".to_string()),
            description: "服务器主机地址".to_string(),
        });
        add(ConfigValidationRule::integer("server.port", 1.0, 65535.0, "服务器端口"));
        add(ConfigValidationRule::integer("hub.outbound_capacity", 1.0, 65536.0, "连接发送队列容量"));
        add(ConfigValidationRule::integer("hub.max_frame_bytes", 64.0, 1_048_576.0, "最大入站帧"));
        add(ConfigValidationRule::integer("hub.pong_wait_secs", 1.0, 3600.0, "pong 等待时间"));
        add(ConfigValidationRule::integer("hub.ping_period_secs", 1.0, 3600.0, "ping 周期"));
        add(ConfigValidationRule::integer("hub.write_wait_secs", 1.0, 300.0, "写超时"));
        add(ConfigValidationRule::integer("dispatcher.queue_capacity", 1.0, 10_000_000.0, "调度队列容量"));
        add(ConfigValidationRule::integer("dispatcher.max_retries", 0.0, 20.0, "最大重试次数"));
        add(ConfigValidationRule::integer("offline.max_entries", 1.0, 100_000.0, "离线消息上限"));
        add(ConfigValidationRule::integer("offline.ttl_secs", 1.0, 90.0 * 86400.0, "离线消息过期时间"));
        add(ConfigValidationRule::integer("presence.stale_after_secs", 1.0, 86400.0, "在线状态过期时间"));
        add(ConfigValidationRule::integer("limits.per_ip_connections", 1.0, 100_000.0, "单 IP 连接上限"));
        add(ConfigValidationRule::integer("limits.global_connections", 1.0, 10_000_000.0, "全局连接上限"));
        add(ConfigValidationRule::one_of(
            "logging.level",
            &["trace", "debug", "info", "warn", "error"],
            "日志级别",
        ));
        add(ConfigValidationRule::one_of("ledger.backend", &["memory", "postgres"], "投递记录存储"));
        add(ConfigValidationRule::one_of("directory.backend", &["static", "postgres"], "用户目录"));
        add(ConfigValidationRule::one_of("auth.provider", &["sa_token", "static"], "认证方式"));
        add(ConfigValidationRule {
            key: "logging.json_format".to_string(),
            data_type: ConfigDataType::Boolean,
            min_value: None,
            max_value: None,
            allowed_values: None,
            regex_pattern: None,
            description: "JSON 日志".to_string(),
        });

        Self { rules }
    }

    /// 验证整个配置
    pub fn validate(&self, settings: &NotifySettings) -> AppResult<()> {
        let tree = serde_json::to_value(settings)
            .map_err(|e| AppError::validation("<root>", e.to_string()))?;

        for rule in self.rules.values() {
            let pointer = format!("/{}", rule.key.replace('.', "/"));
            match tree.pointer(&pointer) {
                Some(value) => self.validate_against_rule(rule, value)?,
                None => {
                    return Err(AppError::validation(&rule.key, "配置项缺失"));
                }
            }
        }

        // 跨字段约束 / cross-field constraints
        if settings.hub.ping_period_secs >= settings.hub.pong_wait_secs {
            return Err(AppError::validation(
                "hub.ping_period_secs",
                "ping 周期必须小于 pong 等待时间",
            ));
        }
        if settings.dispatcher.workers == Some(0) {
            return Err(AppError::validation("dispatcher.workers", "工作线程数必须大于0"));
        }
        if settings.ledger.backend == "postgres" && settings.database.url.is_none() {
            return Err(AppError::validation("database.url", "postgres 存储需要数据库地址"));
        }
        for pattern in &settings.limits.whitelist {
            regex::Regex::new(pattern)
                .map_err(|e| AppError::validation("limits.whitelist", format!("正则表达式错误: {}", e)))?;
        }

        Ok(())
    }

    /// 根据规则验证值
    fn validate_against_rule(&self, rule: &ConfigValidationRule, value: &serde_json::Value) -> AppResult<()> {
        match (&rule.data_type, value) {
            (ConfigDataType::String, serde_json::Value::String(s)) => {
                if let Some(pattern) = &rule.regex_pattern {
                    let regex = regex::Regex::new(pattern)
                        .map_err(|e| AppError::validation(&rule.key, format!("正则表达式错误: {}", e)))?;
                    if !regex.is_match(s) {
                        return Err(AppError::validation(&rule.key, "值不匹配正则表达式"));
                    }
                }

                if let Some(allowed) = &rule.allowed_values {
                    if !allowed.contains(s) {
                        return Err(AppError::validation(
                            &rule.key,
                            format!("值必须是以下之一: {}", allowed.join(", ")),
                        ));
                    }
                }
            }
            (ConfigDataType::Integer, serde_json::Value::Number(n)) => {
                let f = n.as_f64().unwrap_or_default();
                if let Some(min) = rule.min_value {
                    if f < min {
                        return Err(AppError::validation(&rule.key, format!("值必须大于等于 {}", min)));
                    }
                }
                if let Some(max) = rule.max_value {
                    if f > max {
                        return Err(AppError::validation(&rule.key, format!("值必须小于等于 {}", max)));
                    }
                }
            }
            (ConfigDataType::Boolean, serde_json::Value::Bool(_)) => {}
            _ => {
                return Err(AppError::validation(
                    &rule.key,
                    format!("数据类型不匹配，期望: {:?} ({})", rule.data_type, rule.description),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let validator = ConfigValidator::new();
        assert!(validator.validate(&NotifySettings::default()).is_ok());
    }

    #[test]
    fn test_invalid_port() {
        let mut settings = NotifySettings::default();
        settings.server.port = 0;
        assert!(ConfigValidator::new().validate(&settings).is_err());
    }

    #[test]
    fn test_ping_period_must_be_below_pong_wait() {
        let mut settings = NotifySettings::default();
        settings.hub.ping_period_secs = 60;
        let err = ConfigValidator::new().validate(&settings).unwrap_err();
        assert!(err.to_string().contains("hub.ping_period_secs"));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut settings = NotifySettings::default();
        settings.logging.level = "verbose".to_string();
        assert!(ConfigValidator::new().validate(&settings).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut settings = NotifySettings::default();
        settings.hub.outbound_capacity = 0;
        assert!(ConfigValidator::new().validate(&settings).is_err());
    }

    #[test]
    fn test_zero_offline_cap_rejected() {
        let mut settings = NotifySettings::default();
        settings.offline.max_entries = 0;
        let err = ConfigValidator::new().validate(&settings).unwrap_err();
        assert!(err.to_string().contains("offline.max_entries"));
    }

    #[test]
    fn test_postgres_ledger_requires_url() {
        let mut settings = NotifySettings::default();
        settings.ledger.backend = "postgres".to_string();
        assert!(ConfigValidator::new().validate(&settings).is_err());
        settings.database.url = Some("postgres://localhost/notify".to_string());
        assert!(ConfigValidator::new().validate(&settings).is_ok());
    }
}
