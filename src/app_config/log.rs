use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber, Layer};

use crate::app_config::env::{env_is_true, env_or_default};

// 设置日志
pub async fn setup_logging() -> anyhow::Result<()> {
    let app_env = env_or_default("APP_ENV", "LOCAL");

    if app_env == "LOCAL" {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_writer(std::io::stdout)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let info_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "info.log");
        let error_file = RollingFileAppender::new(Rotation::DAILY, "log_files", "error.log");

        let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
        let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);
        // guard不能提前drop，否则落盘线程退出
        std::mem::forget(info_guard);
        std::mem::forget(error_guard);

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(info_non_blocking)
                    .with_filter(EnvFilter::new("info")),
            )
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(error_non_blocking)
                    .with_filter(EnvFilter::new("error")),
            )
            .init();
    }

    // rbatis的SQL日志走log门面，调试时单独打开
    if env_is_true("DB_DEBUG", false) {
        fast_log::init(
            fast_log::Config::new()
                .console()
                .level(log::LevelFilter::Debug),
        )
        .map_err(|e| anyhow::anyhow!("fast_log init error: {}", e))?;
    }
    Ok(())
}
