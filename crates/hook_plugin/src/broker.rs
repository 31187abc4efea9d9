use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{trace, warn};

use crate::channel::PluginChannel;
use crate::correlation::CorrelationId;
use crate::error::PluginError;
use crate::protocol::{HookCall, HookName, HookReply};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Completion = oneshot::Sender<Result<Value, PluginError>>;

/// Request/response multiplexer over one [`PluginChannel`].
///
/// Any number of calls may be in flight at once; replies arrive in whatever
/// order the worker produces them and are paired purely by correlation id.
/// The pending table maps each id to a single-fire completion. `remove`
/// yields the completion, so settle-after-remove is exactly-once by
/// construction and a duplicate or late reply finds nothing to fire.
///
/// When the inbound stream ends (worker exit or stdio fault) the listener
/// fails every still-pending call with `WorkerTerminated` rather than
/// leaving it to hang, and each call is additionally bounded by a timeout.
pub struct InvocationBroker {
    channel: PluginChannel,
    pending: Arc<DashMap<CorrelationId, Completion>>,
    timeout: Duration,
}

impl InvocationBroker {
    pub fn new(channel: PluginChannel, timeout: Duration) -> Self {
        let pending: Arc<DashMap<CorrelationId, Completion>> = Arc::new(DashMap::new());

        let mut replies = channel.subscribe();
        let table = Arc::clone(&pending);
        tokio::spawn(async move {
            loop {
                match replies.recv().await {
                    Ok(reply) => route_reply(&table, reply),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("reply listener lagged, {missed} replies dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // worker is gone; nothing pending can ever be answered
            let stranded: Vec<CorrelationId> =
                table.iter().map(|entry| entry.key().clone()).collect();
            for id in stranded {
                if let Some((_, completion)) = table.remove(&id) {
                    let _ = completion.send(Err(PluginError::WorkerTerminated));
                }
            }
        });

        Self { channel, pending, timeout }
    }

    /// Issue one hook call and suspend until its correlated reply, channel
    /// closure, worker termination, or the timeout, whichever is first.
    pub async fn invoke(&self, name: HookName, payload: Value) -> Result<Value, PluginError> {
        let id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();

        // register before sending so a reply can never beat the table entry
        self.pending.insert(id.clone(), tx);

        let call = HookCall::new(id.clone(), name, payload);
        if let Err(err) = self.channel.send(call).await {
            self.pending.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // completion dropped unsettled; only happens when the
                // listener is already gone
                self.pending.remove(&id);
                Err(PluginError::WorkerTerminated)
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(PluginError::TimedOut { hook: name, timeout: self.timeout })
            }
        }
    }

    /// Number of calls currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

fn route_reply(table: &DashMap<CorrelationId, Completion>, reply: HookReply) {
    let id = reply.correlation_id().clone();
    match table.remove(&id) {
        Some((_, completion)) => {
            let outcome = match reply {
                HookReply::Success(s) => Ok(s.payload),
                HookReply::Failure(f) => Err(PluginError::Hook(f.error)),
            };
            let _ = completion.send(outcome);
        }
        // duplicate, late, or foreign reply
        None => trace!("discarding reply for unknown correlation id {id}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::channel::LoopbackWorker;

    fn broker_pair() -> (Arc<InvocationBroker>, LoopbackWorker) {
        let (channel, worker) = PluginChannel::loopback();
        (Arc::new(InvocationBroker::new(channel, Duration::from_secs(5))), worker)
    }

    #[tokio::test]
    async fn pairs_replies_by_id_regardless_of_arrival_order() {
        let (broker, mut worker) = broker_pair();

        let driver = tokio::spawn(async move {
            let a = worker.calls.recv().await.unwrap();
            let b = worker.calls.recv().await.unwrap();
            // answer the second call first
            worker
                .replies
                .send(HookReply::success(b.correlation_id.clone(), b.payload.clone()))
                .unwrap();
            worker
                .replies
                .send(HookReply::success(a.correlation_id.clone(), a.payload.clone()))
                .unwrap();
        });

        let (ra, rb) = tokio::join!(
            broker.invoke(HookName::Filter, json!({"n": "a"})),
            broker.invoke(HookName::Filter, json!({"n": "b"})),
        );
        assert_eq!(ra.unwrap(), json!({"n": "a"}));
        assert_eq!(rb.unwrap(), json!({"n": "b"}));
        assert_eq!(broker.in_flight(), 0);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_calls_never_share_a_correlation_id() {
        let (broker, mut worker) = broker_pair();
        const CALLS: usize = 32;

        let driver = tokio::spawn(async move {
            let mut seen = HashSet::new();
            let mut received = Vec::new();
            for _ in 0..CALLS {
                let call = worker.calls.recv().await.unwrap();
                assert!(seen.insert(call.correlation_id.clone()), "correlation id reused");
                received.push(call);
            }
            for call in received {
                worker
                    .replies
                    .send(HookReply::success(call.correlation_id, call.payload))
                    .unwrap();
            }
        });

        let mut tasks = vec![];
        for n in 0..CALLS {
            let broker = Arc::clone(&broker);
            tasks.push(tokio::spawn(async move {
                broker.invoke(HookName::Filter, json!({ "n": n })).await
            }));
        }
        for (n, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), json!({ "n": n }));
        }
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_surfaces_worker_message() {
        let (broker, mut worker) = broker_pair();

        let driver = tokio::spawn(async move {
            let call = worker.calls.recv().await.unwrap();
            worker
                .replies
                .send(HookReply::failure(call.correlation_id, "not implemented"))
                .unwrap();
        });

        let err = broker.invoke(HookName::Info, Value::Null).await.unwrap_err();
        match err {
            PluginError::Hook(msg) => assert_eq!(msg, "not implemented"),
            other => panic!("expected hook error, got {other:?}"),
        }
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_and_duplicate_replies_are_discarded() {
        let (broker, mut worker) = broker_pair();

        let driver = tokio::spawn(async move {
            let call = worker.calls.recv().await.unwrap();
            // a reply nobody asked for
            worker
                .replies
                .send(HookReply::success("no-such-id".into(), json!("stray")))
                .unwrap();
            worker
                .replies
                .send(HookReply::success(call.correlation_id.clone(), json!("real")))
                .unwrap();
            // duplicate of an already-settled id
            worker
                .replies
                .send(HookReply::success(call.correlation_id, json!("dup")))
                .unwrap();
            worker
        });

        let result = broker.invoke(HookName::Export, json!({})).await.unwrap();
        assert_eq!(result, json!("real"));

        // the broker is still fully usable afterwards
        let mut worker = driver.await.unwrap();
        let follow_up = tokio::spawn(async move {
            let call = worker.calls.recv().await.unwrap();
            worker
                .replies
                .send(HookReply::success(call.correlation_id, json!("next")))
                .unwrap();
        });
        assert_eq!(broker.invoke(HookName::Export, json!({})).await.unwrap(), json!("next"));
        follow_up.await.unwrap();
    }

    #[tokio::test]
    async fn failed_send_fails_immediately_and_leaks_no_entry() {
        let (channel, worker) = PluginChannel::loopback();
        let broker = InvocationBroker::new(channel, Duration::from_secs(5));
        drop(worker.calls);

        let err = broker.invoke(HookName::Import, json!({})).await.unwrap_err();
        assert!(matches!(err, PluginError::ChannelClosed));
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn worker_death_rejects_every_pending_call() {
        let (broker, mut worker) = broker_pair();

        let driver = tokio::spawn(async move {
            // swallow both calls, reply to neither, then die
            let _ = worker.calls.recv().await.unwrap();
            let _ = worker.calls.recv().await.unwrap();
            drop(worker.replies);
        });

        let (ra, rb) = tokio::join!(
            broker.invoke(HookName::Filter, json!({"n": 1})),
            broker.invoke(HookName::Filter, json!({"n": 2})),
        );
        assert!(matches!(ra.unwrap_err(), PluginError::WorkerTerminated));
        assert!(matches!(rb.unwrap_err(), PluginError::WorkerTerminated));
        assert_eq!(broker.in_flight(), 0);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let (channel, mut worker) = PluginChannel::loopback();
        let broker = InvocationBroker::new(channel, Duration::from_millis(50));

        let driver = tokio::spawn(async move {
            // accept the call but never answer in time
            let call = worker.calls.recv().await.unwrap();
            (call, worker)
        });

        let err = broker.invoke(HookName::Filter, json!({})).await.unwrap_err();
        match err {
            PluginError::TimedOut { hook, .. } => assert_eq!(hook, HookName::Filter),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(broker.in_flight(), 0);

        // a straggler reply after the timeout finds nothing to fire
        let (call, worker) = driver.await.unwrap();
        worker.replies.send(HookReply::success(call.correlation_id, json!("late"))).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(broker.in_flight(), 0);
    }
}
