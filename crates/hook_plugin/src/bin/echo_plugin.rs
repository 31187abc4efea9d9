//! Reference plugin used by the integration suite: uppercases through the
//! filter hook and exercises every failure path the protocol has. A few
//! magic filter inputs drive worker behavior from the host side:
//!
//! * `crash!`: exit with code 1 before replying
//! * `quit!`: exit with code 0 before replying
//! * `garble!`: write a non-JSON line to stdout, then reply normally
//! * `sleep:N:text`: reply with `TEXT` after N milliseconds

use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use hook_plugin::protocol::{
    ExportArgs, ExportResult, FilterArgs, FilterResult, HookName, HttpRequestActionArgs,
    HttpRequestActionResult, PluginInfo,
};
use hook_plugin::runtime::{self, HookHandler};

struct EchoPlugin;

#[async_trait]
impl HookHandler for EchoPlugin {
    async fn info(&self) -> Result<PluginInfo, String> {
        let name = runtime::plugin_dir()
            .and_then(|dir| dir.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "echo".to_string());
        Ok(PluginInfo {
            name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some("reference plugin for the hook protocol".to_string()),
            capabilities: vec![HookName::Filter, HookName::Export, HookName::HttpRequestAction],
        })
    }

    async fn filter(&self, args: FilterArgs) -> Result<FilterResult, String> {
        match args.text.as_str() {
            "crash!" => std::process::exit(1),
            "quit!" => std::process::exit(0),
            "garble!" => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "this is not a protocol frame");
                let _ = out.flush();
                Ok(FilterResult { text: "GARBLE".to_string() })
            }
            text => {
                if let Some(rest) = text.strip_prefix("sleep:") {
                    let (millis, rest) =
                        rest.split_once(':').ok_or("bad sleep marker, want sleep:N:text")?;
                    let millis: u64 =
                        millis.parse().map_err(|e| format!("bad sleep millis: {e}"))?;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    return Ok(FilterResult { text: rest.to_uppercase() });
                }
                Ok(FilterResult { text: text.to_uppercase() })
            }
        }
    }

    async fn export(&self, args: ExportArgs) -> Result<ExportResult, String> {
        let content = serde_json::to_string(&args.request).map_err(|e| e.to_string())?;
        Ok(ExportResult { content })
    }

    async fn http_request_action(
        &self,
        args: HttpRequestActionArgs,
    ) -> Result<HttpRequestActionResult, String> {
        let mut request = args.request;
        if let Some(obj) = request.as_object_mut() {
            obj.insert("appliedAction".to_string(), serde_json::Value::String(args.action));
        }
        Ok(HttpRequestActionResult { request: Some(request) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_file_logging();
    runtime::serve(EchoPlugin).await
}
