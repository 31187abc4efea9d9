use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::info;

use crate::broker::DEFAULT_CALL_TIMEOUT;
use crate::error::PluginError;
use crate::handle::{PluginHandle, WORKER_EXE, plugin_name};
use crate::supervisor::LifecycleReport;

/// Registry of live plugin instances, keyed by plugin name (the directory
/// stem). Which directories get activated, and when, is the caller's
/// business; the manager only runs what it is handed.
///
/// All instances report lifecycle events into the single receiver returned
/// by [`PluginManager::new`].
pub struct PluginManager {
    plugins: DashMap<String, Arc<PluginHandle>>,
    reports: UnboundedSender<LifecycleReport>,
    call_timeout: Duration,
}

impl PluginManager {
    pub fn new() -> (Self, UnboundedReceiver<LifecycleReport>) {
        Self::with_call_timeout(DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_call_timeout(call_timeout: Duration) -> (Self, UnboundedReceiver<LifecycleReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self { plugins: DashMap::new(), reports: tx, call_timeout };
        (manager, rx)
    }

    /// Extra handles onto the report stream, e.g. for supervisors created
    /// outside the manager.
    pub fn report_sender(&self) -> UnboundedSender<LifecycleReport> {
        self.reports.clone()
    }

    /// Spawn the worker bundled in `plugin_dir` and register the instance.
    pub fn activate(&self, plugin_dir: &Path) -> Result<Arc<PluginHandle>, PluginError> {
        self.activate_with_program(&plugin_dir.join(WORKER_EXE), plugin_dir)
    }

    /// Same, with an explicit worker program.
    pub fn activate_with_program(
        &self,
        program: &Path,
        plugin_dir: &Path,
    ) -> Result<Arc<PluginHandle>, PluginError> {
        let name = plugin_name(plugin_dir)
            .ok_or_else(|| PluginError::InvalidPluginDir(plugin_dir.to_path_buf()))?;
        if self.plugins.contains_key(&name) {
            return Err(PluginError::AlreadyActive(name));
        }

        let handle = Arc::new(PluginHandle::spawn_with_program(
            program,
            plugin_dir,
            self.reports.clone(),
            self.call_timeout,
        )?);

        // a concurrent activate of the same name may have won in between
        match self.plugins.entry(name.clone()) {
            Entry::Occupied(_) => {
                handle.kill();
                Err(PluginError::AlreadyActive(name))
            }
            Entry::Vacant(slot) => {
                info!(plugin = %name, dir = %plugin_dir.display(), "plugin activated");
                slot.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginHandle>> {
        self.plugins.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<String> {
        self.plugins.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Kill and unregister one instance. Returns false for unknown names.
    pub fn deactivate(&self, name: &str) -> bool {
        match self.plugins.remove(name) {
            Some((_, handle)) => {
                info!(plugin = %name, "plugin deactivated");
                handle.kill();
                true
            }
            None => false,
        }
    }

    /// Kill everything. The report stream stays open until the manager is
    /// dropped, so final exit reports are still observable.
    pub fn shutdown(&self) {
        for entry in self.plugins.iter() {
            entry.value().kill();
        }
        self.plugins.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_activation_registers_nothing() {
        let (manager, _reports) = PluginManager::new();
        let tmp = tempfile::tempdir().unwrap();

        let err = manager.activate(tmp.path()).unwrap_err();
        assert!(matches!(err, PluginError::Spawn(_)));
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn unknown_names_are_handled_gracefully() {
        let (manager, _reports) = PluginManager::new();
        assert!(manager.get("nope").is_none());
        assert!(!manager.deactivate("nope"));
    }
}
