//! Worker-side runtime: wires stdin/stdout hook traffic to a
//! [`HookHandler`] implementation, so plugins themselves can be plain Rust
//! binaries.
//!
//! A plugin is three lines of glue:
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     hook_plugin::runtime::init_file_logging();
//!     hook_plugin::runtime::serve(MyPlugin::default()).await
//! }
//! ```
//!
//! Stdout belongs to the protocol. Anything a plugin logs must go to stderr
//! or to the log file; a single stray `println!` corrupts the wire.

use std::path::PathBuf;
use std::sync::{Arc, Once};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::protocol::{
    ExportArgs, ExportResult, FilterArgs, FilterResult, HookCall, HookName, HookReply,
    HttpRequestActionArgs, HttpRequestActionResult, ImportArgs, ImportResult, PluginInfo,
};
use crate::supervisor::PLUGIN_DIR_ENV;

/// Env var naming the directory plugin log files go to. Inherited from the
/// host; when unset, logging stays uninitialized.
pub const PLUGIN_LOG_DIR_ENV: &str = "QUIVER_PLUGIN_LOG_DIR";

/// Implement this in your plugin. Every hook except `info` defaults to a
/// "not implemented" failure, so a plugin only writes the hooks it has.
///
/// Errors are plain strings; they travel to the host verbatim as the
/// `error` field of the reply.
#[async_trait]
pub trait HookHandler: Send + Sync + 'static {
    async fn info(&self) -> Result<PluginInfo, String>;

    async fn filter(&self, _args: FilterArgs) -> Result<FilterResult, String> {
        Err("not implemented".into())
    }

    async fn import(&self, _args: ImportArgs) -> Result<ImportResult, String> {
        Err("not implemented".into())
    }

    async fn export(&self, _args: ExportArgs) -> Result<ExportResult, String> {
        Err("not implemented".into())
    }

    async fn http_request_action(
        &self,
        _args: HttpRequestActionArgs,
    ) -> Result<HttpRequestActionResult, String> {
        Err("not implemented".into())
    }
}

/// The directory this plugin was activated from.
pub fn plugin_dir() -> Option<PathBuf> {
    std::env::var_os(PLUGIN_DIR_ENV).map(PathBuf::from)
}

/// File-based tracing setup for plugin processes. Writes daily-rolling
/// files under [`PLUGIN_LOG_DIR_ENV`]; never stdout.
pub fn init_file_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let Some(dir) = std::env::var_os(PLUGIN_LOG_DIR_ENV).map(PathBuf::from) else {
            return;
        };
        let _ = std::fs::create_dir_all(&dir);
        let appender = tracing_appender::rolling::daily(&dir, "plugin.log");
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = Registry::default().with(filter).with(
            fmt::layer().with_ansi(false).with_target(false).with_writer(appender),
        );
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Run the hook loop until stdin reaches EOF, which is the host telling the
/// worker to go away. Calls are handled concurrently, so a slow hook never
/// blocks the next one and replies go out in completion order.
pub async fn serve<H: HookHandler>(handler: H) -> Result<()> {
    let handler = Arc::new(handler);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut out = BufWriter::new(io::stdout());
        while let Some(line) = rx.recv().await {
            if out.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if out.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HookCall>(&line) {
            Ok(call) => {
                let handler = Arc::clone(&handler);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = dispatch(handler.as_ref(), call).await;
                    match serde_json::to_string(&reply) {
                        Ok(s) => {
                            let _ = tx.send(format!("{s}\n"));
                        }
                        Err(err) => warn!("failed to serialize reply: {err}"),
                    }
                });
            }
            // no id to reply to, so all we can do is log and keep reading
            Err(err) => warn!("ignoring malformed call: {err}"),
        }
    }

    Ok(())
}

/// Dispatch one call to the handler and fold the outcome into a reply
/// bearing the same correlation id.
pub async fn dispatch<H: HookHandler>(handler: &H, call: HookCall) -> HookReply {
    let id = call.correlation_id.clone();
    let outcome = match call.name {
        HookName::Info => handler.info().await.and_then(encode),
        HookName::Filter => match decode::<FilterArgs>(call.payload) {
            Ok(args) => handler.filter(args).await.and_then(encode),
            Err(e) => Err(e),
        },
        HookName::Import => match decode::<ImportArgs>(call.payload) {
            Ok(args) => handler.import(args).await.and_then(encode),
            Err(e) => Err(e),
        },
        HookName::Export => match decode::<ExportArgs>(call.payload) {
            Ok(args) => handler.export(args).await.and_then(encode),
            Err(e) => Err(e),
        },
        HookName::HttpRequestAction => match decode::<HttpRequestActionArgs>(call.payload) {
            Ok(args) => handler.http_request_action(args).await.and_then(encode),
            Err(e) => Err(e),
        },
    };
    match outcome {
        Ok(payload) => HookReply::success(id, payload),
        Err(error) => HookReply::failure(id, error),
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("invalid params: {e}"))
}

fn encode<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}
