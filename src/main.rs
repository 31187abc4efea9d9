use std::path::Path;
use std::{env, fs};

use anyhow::Result;
use clap::Parser;
use hook_plugin::handle::WORKER_EXE;
use hook_plugin::manager::PluginManager;
use hook_plugin::runtime::PLUGIN_LOG_DIR_ENV;
use hook_plugin::supervisor::LifecycleReport;
use tracing::{debug, error, info, warn};

mod config;
mod logger;

use config::HostSettings;

#[derive(Parser, Debug)]
#[command(name = "quiver", about = "Plugin execution host for the Quiver API client", version)]
struct Cli {
    /// Directory holding one subdirectory per plugin
    #[arg(long)]
    plugins_dir: Option<std::path::PathBuf>,

    /// Directory for rolling log files; console-only when omitted
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Per-hook-call timeout in seconds
    #[arg(long)]
    call_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings =
        HostSettings::resolve(cli.plugins_dir, cli.log_dir, cli.log_level, cli.call_timeout_secs);
    logger::init_tracing(&settings.log_level, settings.log_dir.as_deref())?;

    // workers inherit this and log beside the host instead of on stdout
    if let Some(dir) = &settings.log_dir {
        unsafe { env::set_var(PLUGIN_LOG_DIR_ENV, dir.join("plugins")) };
    }

    let (manager, mut reports) = PluginManager::with_call_timeout(settings.call_timeout);
    let started = activate_all(&manager, &settings.plugins_dir);
    info!(
        "quiver plugin host up, {started} plugin(s) running from {}",
        settings.plugins_dir.display()
    );

    loop {
        tokio::select! {
            Some(report) = reports.recv() => log_report(report),
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    manager.shutdown();
    Ok(())
}

/// Activate every subdirectory of `plugins_dir` that bundles a worker
/// executable. One bad plugin never stops the rest from coming up.
fn activate_all(manager: &PluginManager, plugins_dir: &Path) -> usize {
    let entries = match fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot read plugins dir {}: {err}", plugins_dir.display());
            return 0;
        }
    };

    let mut started = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(WORKER_EXE).is_file() {
            debug!("skipping {}: no worker executable", path.display());
            continue;
        }
        match manager.activate(&path) {
            Ok(handle) => {
                started += 1;
                tokio::spawn(async move {
                    match handle.query_info().await {
                        Ok(meta) => {
                            info!(plugin = %meta.name, version = %meta.version, "plugin ready")
                        }
                        Err(err) => {
                            warn!(plugin = %handle.name(), "info query failed: {err}")
                        }
                    }
                });
            }
            Err(err) => error!("could not activate {}: {err}", path.display()),
        }
    }
    started
}

fn log_report(report: LifecycleReport) {
    match report {
        LifecycleReport::Fault { plugin_dir, message, .. } => {
            warn!(plugin = %plugin_dir.display(), "plugin fault: {message}");
        }
        LifecycleReport::Exit { plugin_dir, code, clean, .. } => {
            if clean {
                info!(plugin = %plugin_dir.display(), "plugin exited cleanly");
            } else {
                warn!(plugin = %plugin_dir.display(), code = ?code, "plugin exited abnormally");
            }
        }
    }
}
