use crate::comm::settings::LoggingSettings;
use anyhow::Result;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// 本地时间格式 `YYYY-MM-DD HH:MM:SS.cc`
struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        write!(w, "{}.{:02}", now.format("%Y-%m-%d %H:%M:%S"), cs)
    }
}

/// 初始化日志
/// Initialize the global subscriber.
///
/// `RUST_LOG` 优先于配置中的 `logging.level`；`json_format = true` 时输出 bunyan JSON。
/// `RUST_LOG` wins over `logging.level`; `json_format = true` switches to bunyan JSON.
pub fn init_tracing(service_name: &str, logging: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json_format {
        let formatting_layer = BunyanFormattingLayer::new(service_name.into(), std::io::stdout);
        Registry::default()
            .with(env_filter)
            .with(JsonStorageLayer)
            .with(formatting_layer)
            .try_init()?;
    } else {
        Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_timer(LogTimer)
                    .with_target(false)
                    .compact(),
            )
            .try_init()?;
    }
    Ok(())
}
