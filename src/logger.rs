use std::path::Path;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Console logging plus, when `log_dir` is set, a daily-rolling file beside
/// the plugin logs. `RUST_LOG` overrides the configured level.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let console = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "quiver.log");
            let file = fmt::layer().with_ansi(false).with_writer(appender);
            Registry::default().with(filter).with(console).with(file).init();
        }
        None => {
            Registry::default().with(filter).with(console).init();
        }
    }
    Ok(())
}
