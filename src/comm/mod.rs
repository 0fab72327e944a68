/// 通用模块：配置、日志、时间
/// Common module: configuration, logging, time

pub mod config;
pub mod config_validator;
pub mod settings;
pub mod time;
pub mod tracing;

// 重新导出主要的公共接口
pub use settings::NotifySettings;
