use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::HookName;

/// Everything that can go wrong between issuing a hook call and receiving
/// its reply, plus the spawn-time failures that precede both.
///
/// Transport problems (`ChannelClosed`, `WorkerTerminated`, `TimedOut`) are
/// never retried here; whether to retry is the caller's decision. `Hook` is
/// the worker saying "I ran and failed" and carries its message verbatim.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The channel can no longer accept or deliver messages.
    #[error("plugin channel is closed")]
    ChannelClosed,

    /// The worker exited or faulted while this call was still pending.
    #[error("plugin worker terminated before replying")]
    WorkerTerminated,

    /// No reply arrived in time.
    #[error("hook `{hook}` timed out after {timeout:?}")]
    TimedOut { hook: HookName, timeout: Duration },

    /// The worker replied with an application-level failure.
    #[error("{0}")]
    Hook(String),

    /// A plugin with the same name is already running.
    #[error("plugin `{0}` is already active")]
    AlreadyActive(String),

    /// The plugin directory has no usable name stem.
    #[error("not a usable plugin directory: {0}")]
    InvalidPluginDir(PathBuf),

    #[error("failed to spawn plugin worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("bad hook payload: {0}")]
    Codec(#[from] serde_json::Error),
}
