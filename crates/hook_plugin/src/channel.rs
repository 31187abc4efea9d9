use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

use crate::error::PluginError;
use crate::protocol::{HookCall, HookReply};

const OUTBOUND_QUEUE: usize = 32;
const INBOUND_FANOUT: usize = 256;

/// Bidirectional, ordered message transport to exactly one worker.
///
/// Outbound calls are queued through an mpsc the writer task drains into the
/// worker's stdin, one JSON line per call. Inbound lines are parsed and
/// fanned out on a broadcast, so any number of listeners each observe every
/// reply in arrival order. The broadcast sender lives in the reader task;
/// when the worker goes away the stream ends and every subscriber sees it.
pub struct PluginChannel {
    outbound: mpsc::Sender<HookCall>,
    inbound: broadcast::Receiver<HookReply>,
    closed: Arc<AtomicBool>,
}

impl Clone for PluginChannel {
    fn clone(&self) -> Self {
        Self {
            outbound: self.outbound.clone(),
            inbound: self.inbound.resubscribe(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl PluginChannel {
    /// Wire a channel over a spawned worker's stdio. `fault_tx` receives a
    /// line of diagnostics for every inbound frame that fails to parse;
    /// such frames are skipped, not fatal.
    pub(crate) fn from_child_io(
        stdin: ChildStdin,
        stdout: ChildStdout,
        fault_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<HookCall>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = broadcast::channel::<HookReply>(INBOUND_FANOUT);
        let closed = Arc::new(AtomicBool::new(false));

        // writer: queue → stdin, stop on the first write error
        let mut stdin = stdin;
        tokio::spawn(async move {
            while let Some(call) = out_rx.recv().await {
                let line = match serde_json::to_string(&call) {
                    Ok(line) => line,
                    Err(err) => {
                        error!("dropping unserializable hook call: {err}");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // reader: stdout → broadcast; dropping `in_tx` at EOF closes the stream
        let closed_mark = Arc::clone(&closed);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HookReply>(&line) {
                    Ok(reply) => {
                        let _ = in_tx.send(reply);
                    }
                    Err(err) => {
                        warn!("unparseable frame from worker: {err}");
                        let _ = fault_tx.send(format!("unparseable frame: {err}"));
                    }
                }
            }
            closed_mark.store(true, Ordering::Release);
        });

        Self { outbound: out_tx, inbound: in_rx, closed }
    }

    /// In-memory channel pair for tests: the returned [`LoopbackWorker`]
    /// plays the worker side of the wire.
    pub fn loopback() -> (Self, LoopbackWorker) {
        let (out_tx, out_rx) = mpsc::channel::<HookCall>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = broadcast::channel::<HookReply>(INBOUND_FANOUT);
        let channel = Self {
            outbound: out_tx,
            inbound: in_rx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (channel, LoopbackWorker { calls: out_rx, replies: in_tx })
    }

    /// Enqueue one call for delivery, preserving send order.
    pub async fn send(&self, call: HookCall) -> Result<(), PluginError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PluginError::ChannelClosed);
        }
        self.outbound.send(call).await.map_err(|_| PluginError::ChannelClosed)
    }

    /// A fresh listener over the inbound stream. Every subscriber receives
    /// every reply; a `Closed` recv error means the worker is gone.
    pub fn subscribe(&self) -> broadcast::Receiver<HookReply> {
        self.inbound.resubscribe()
    }

    /// Detached close handle: marks the transport dead so later sends fail
    /// fast instead of queueing into a pipe nobody reads. Unlike a channel
    /// clone it keeps no sender alive, so holding one does not hold the
    /// worker's stdin open.
    pub(crate) fn closer(&self) -> ChannelCloser {
        ChannelCloser(Arc::clone(&self.closed))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub(crate) struct ChannelCloser(Arc<AtomicBool>);

impl ChannelCloser {
    pub(crate) fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The far end of a [`PluginChannel::loopback`] pair.
pub struct LoopbackWorker {
    /// Calls the host has sent, in order.
    pub calls: mpsc::Receiver<HookCall>,
    /// Handle for injecting replies; drop it to simulate worker death.
    pub replies: broadcast::Sender<HookReply>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::HookName;

    fn call(id: &str) -> HookCall {
        HookCall::new(id.into(), HookName::Filter, json!({"n": id}))
    }

    #[tokio::test]
    async fn delivers_calls_in_send_order() {
        let (channel, mut worker) = PluginChannel::loopback();
        channel.send(call("a")).await.unwrap();
        channel.send(call("b")).await.unwrap();

        assert_eq!(worker.calls.recv().await.unwrap().correlation_id.as_str(), "a");
        assert_eq!(worker.calls.recv().await.unwrap().correlation_id.as_str(), "b");
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_reply() {
        let (channel, worker) = PluginChannel::loopback();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        worker.replies.send(HookReply::success("x".into(), json!(1))).unwrap();

        assert_eq!(first.recv().await.unwrap().correlation_id().as_str(), "x");
        assert_eq!(second.recv().await.unwrap().correlation_id().as_str(), "x");
    }

    #[tokio::test]
    async fn send_fails_once_worker_side_is_gone() {
        let (channel, worker) = PluginChannel::loopback();
        drop(worker.calls);

        let err = channel.send(call("a")).await.unwrap_err();
        assert!(matches!(err, PluginError::ChannelClosed));
    }

    #[tokio::test]
    async fn send_fails_once_marked_closed() {
        let (channel, _worker) = PluginChannel::loopback();
        channel.closer().close();

        let err = channel.send(call("a")).await.unwrap_err();
        assert!(matches!(err, PluginError::ChannelClosed));
    }

    #[tokio::test]
    async fn subscribers_observe_worker_death() {
        let (channel, worker) = PluginChannel::loopback();
        let mut listener = channel.subscribe();
        drop(worker.replies);

        let err = listener.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Closed));
    }
}
