use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// 统一的应用错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] crate::comm::config::ConfigError),

    #[error("认证错误: {message}")]
    Auth { message: String },

    #[error("验证错误: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("网络错误: {0}")]
    Network(#[from] actix_web::Error),

    #[error("数据库错误: {message}")]
    Database { message: String },

    #[error("服务不可用: {service}: {message}")]
    Unavailable { service: String, message: String },

    #[error("请求过于频繁: {message}")]
    TooManyRequests { message: String },

    #[error("超时错误: {operation}")]
    Timeout { operation: String },

    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建验证错误
    pub fn validation<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// 创建服务不可用错误
    pub fn unavailable<T: Into<String>, U: Into<String>>(service: T, message: U) -> Self {
        Self::Unavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// 创建限流错误
    pub fn too_many_requests<T: Into<String>>(message: T) -> Self {
        Self::TooManyRequests {
            message: message.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout<T: Into<String>>(operation: T) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// 创建资源未找到错误
    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// 获取错误代码
    pub fn error_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 1001,
            AppError::Auth { .. } => 1002,
            AppError::Validation { .. } => 1004,
            AppError::Network(_) => 1005,
            AppError::Database { .. } => 1006,
            AppError::Unavailable { .. } => 1007,
            AppError::Timeout { .. } => 1008,
            AppError::NotFound { .. } => 1009,
            AppError::TooManyRequests { .. } => 1010,
            AppError::Internal(_) => 1000,
        }
    }

    /// 获取HTTP状态码
    pub fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Auth { .. } => StatusCode::UNAUTHORIZED,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "Config",
            AppError::Auth { .. } => "Auth",
            AppError::Validation { .. } => "Validation",
            AppError::Network(_) => "Network",
            AppError::Database { .. } => "Database",
            AppError::Unavailable { .. } => "Unavailable",
            AppError::TooManyRequests { .. } => "TooManyRequests",
            AppError::Timeout { .. } => "Timeout",
            AppError::NotFound { .. } => "NotFound",
            AppError::Internal(_) => "Internal",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = AppError::status_code(self);
        let error_code = self.error_code();

        // 内部错误只记录日志，不把细节返回给调用方
        // Internal details stay in the log
        let message = match self {
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                "内部错误".to_string()
            }
            AppError::Database { .. } => {
                tracing::error!("Database error: {}", self);
                self.to_string()
            }
            AppError::Unavailable { .. } => {
                tracing::warn!("Service unavailable: {}", self);
                self.to_string()
            }
            _ => {
                tracing::info!("Client error: {}", self);
                self.to_string()
            }
        };

        HttpResponse::build(status).json(json!({
            "success": false,
            "error": {
                "code": error_code,
                "message": message,
                "type": self.kind()
            },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

/// 应用结果类型
pub type AppResult<T> = Result<T, AppError>;

/// 通知核心错误类型
/// Notification core error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// 连接已关闭或写超时 / socket closed or write deadline exceeded
    #[error("传输错误: {0}")]
    Transport(String),

    /// 出站队列已满 / outbound queue full, drop-slow-consumer
    #[error("连接发送队列已满: {connection_id}")]
    Saturated { connection_id: String },

    #[error("调度队列已满")]
    QueueFull,

    #[error("投递记录存储不可用: {0}")]
    LedgerUnavailable(String),

    #[error("离线消息存储不可用: {0}")]
    OfflineStoreUnavailable(String),

    #[error("用户目录不可用: {0}")]
    DirectoryUnavailable(String),

    #[error("验证错误: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("通知核心已关闭")]
    Closed,
}

impl NotifyError {
    pub fn validation<T: Into<String>, U: Into<String>>(field: T, message: U) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn timeout<T: Into<String>>(operation: T) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

/// 核心错误到 HTTP 错误的映射
/// Mapping from core errors to the HTTP surface
impl From<NotifyError> for AppError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::Validation { field, message } => AppError::Validation { field, message },
            NotifyError::QueueFull => AppError::unavailable("dispatcher", err.to_string()),
            NotifyError::LedgerUnavailable(_) => AppError::unavailable("ledger", err.to_string()),
            NotifyError::OfflineStoreUnavailable(_) => AppError::unavailable("offline_store", err.to_string()),
            NotifyError::DirectoryUnavailable(_) => AppError::unavailable("directory", err.to_string()),
            NotifyError::Closed => AppError::unavailable("notification_core", err.to_string()),
            NotifyError::NotFound(resource) => AppError::NotFound { resource },
            NotifyError::Timeout { operation } => AppError::Timeout { operation },
            other => AppError::Internal(anyhow::anyhow!(other)),
        }
    }
}

/// 成功响应结构
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// 便捷宏：创建API成功响应
#[macro_export]
macro_rules! api_success {
    ($data:expr) => {
        Ok(actix_web::web::Json($crate::error::ApiResponse::success($data)))
    };
}
