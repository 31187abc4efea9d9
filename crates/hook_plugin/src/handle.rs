use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::broker::{DEFAULT_CALL_TIMEOUT, InvocationBroker};
use crate::error::PluginError;
use crate::protocol::{
    ExportArgs, ExportResult, FilterArgs, FilterResult, HookName, HttpRequestActionArgs,
    HttpRequestActionResult, ImportArgs, ImportResult, PluginInfo,
};
use crate::supervisor::{LifecycleReport, WorkerState, WorkerSupervisor};

/// Name of the worker executable expected inside a plugin directory.
pub const WORKER_EXE: &str = "plugin";

/// One activated plugin: a worker process, its channel, and the broker
/// multiplexing calls over it, behind typed methods per hook.
///
/// The handle exclusively owns its supervisor and pending-call state;
/// nothing is shared across instances. Dropping the handle kills the
/// worker.
pub struct PluginHandle {
    name: String,
    plugin_dir: PathBuf,
    broker: InvocationBroker,
    supervisor: WorkerSupervisor,
}

impl PluginHandle {
    /// Activate the plugin at `plugin_dir` by spawning its bundled worker
    /// executable.
    pub fn spawn(
        plugin_dir: &Path,
        reports: mpsc::UnboundedSender<LifecycleReport>,
    ) -> Result<Self, PluginError> {
        Self::spawn_with_program(&plugin_dir.join(WORKER_EXE), plugin_dir, reports, DEFAULT_CALL_TIMEOUT)
    }

    /// Same, but with an explicit worker program and per-call timeout.
    pub fn spawn_with_program(
        program: &Path,
        plugin_dir: &Path,
        reports: mpsc::UnboundedSender<LifecycleReport>,
        call_timeout: Duration,
    ) -> Result<Self, PluginError> {
        let name = plugin_name(plugin_dir)
            .ok_or_else(|| PluginError::InvalidPluginDir(plugin_dir.to_path_buf()))?;
        let (supervisor, channel) = WorkerSupervisor::spawn(program, plugin_dir, reports)?;
        let broker = InvocationBroker::new(channel, call_timeout);
        Ok(Self { name, plugin_dir: plugin_dir.to_path_buf(), broker, supervisor })
    }

    /// Generic typed call: serialize the args, invoke the hook, deserialize
    /// the reply payload.
    async fn call<A, T>(&self, hook: HookName, args: &A) -> Result<T, PluginError>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_value(args)?;
        let reply = self.broker.invoke(hook, payload).await?;
        Ok(serde_json::from_value(reply)?)
    }

    // ---------------------------------------------------------------------
    // One method per hook
    // ---------------------------------------------------------------------

    pub async fn query_info(&self) -> Result<PluginInfo, PluginError> {
        self.call(HookName::Info, &Value::Null).await
    }

    pub async fn run_filter(&self, args: FilterArgs) -> Result<FilterResult, PluginError> {
        self.call(HookName::Filter, &args).await
    }

    pub async fn run_import(&self, args: ImportArgs) -> Result<ImportResult, PluginError> {
        self.call(HookName::Import, &args).await
    }

    pub async fn run_export(&self, args: ExportArgs) -> Result<ExportResult, PluginError> {
        self.call(HookName::Export, &args).await
    }

    pub async fn run_http_request_action(
        &self,
        args: HttpRequestActionArgs,
    ) -> Result<HttpRequestActionResult, PluginError> {
        self.call(HookName::HttpRequestAction, &args).await
    }

    // ---------------------------------------------------------------------

    /// Plugin name, the stem of its directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    /// Calls currently awaiting a reply from this worker.
    pub fn in_flight(&self) -> usize {
        self.broker.in_flight()
    }

    /// Ask the worker to die. Pending calls fail with `WorkerTerminated`.
    pub fn kill(&self) {
        self.supervisor.kill();
    }

    /// Resolves once the worker process is gone.
    pub async fn terminated(&self) {
        self.supervisor.terminated().await
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("plugin_dir", &self.plugin_dir)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

pub(crate) fn plugin_name(dir: &Path) -> Option<String> {
    dir.file_stem().and_then(|s| s.to_str()).map(|s| s.to_owned())
}
