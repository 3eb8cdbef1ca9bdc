use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use weft_core::ids::SessionKey;
use weft_core::WeftError;
use weft_store::conversations::ConversationRepo;
use weft_store::Database;

use crate::runner::{AgentRegistry, AgentRunner};

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Queued calls allowed per session before callers get `Busy`.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { queue_capacity: 32 }
    }
}

struct EntityJob {
    input: Value,
    reply: oneshot::Sender<Result<String, WeftError>>,
}

/// Routes `run` calls to one worker task per session key. A worker processes
/// its queue one job at a time, so calls against the same conversation never
/// interleave; distinct keys run concurrently.
pub struct SessionDispatcher {
    registry: Arc<AgentRegistry>,
    conversations: Arc<ConversationRepo>,
    workers: DashMap<SessionKey, mpsc::Sender<EntityJob>>,
    config: DispatcherConfig,
}

impl SessionDispatcher {
    pub fn new(registry: Arc<AgentRegistry>, db: Database, config: DispatcherConfig) -> Self {
        Self {
            registry,
            conversations: Arc::new(ConversationRepo::new(db)),
            workers: DashMap::new(),
            config,
        }
    }

    /// Run one turn of the agent behind `key`. Serialized per key; a full
    /// queue surfaces as retryable `Busy` rather than waiting.
    #[instrument(skip(self, input), fields(key = %key))]
    pub async fn run(&self, key: &SessionKey, input: Value) -> Result<String, WeftError> {
        let runner = self
            .registry
            .get(&key.agent)
            .ok_or_else(|| WeftError::UnknownAgent(key.agent.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = EntityJob {
            input,
            reply: reply_tx,
        };

        let tx = self.worker_for(key, Arc::clone(&runner));
        match tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %key, "session queue full");
                return Err(WeftError::Busy(key.to_string()));
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                // Stale entry from a worker that exited; replace it once.
                self.workers.remove(key);
                let tx = self.worker_for(key, runner);
                tx.try_send(job)
                    .map_err(|_| WeftError::Transient(format!("session worker for {key} unavailable")))?;
            }
        }

        reply_rx
            .await
            .map_err(|_| WeftError::Transient(format!("session worker for {key} dropped reply")))?
    }

    fn worker_for(
        &self,
        key: &SessionKey,
        runner: Arc<dyn AgentRunner>,
    ) -> mpsc::Sender<EntityJob> {
        self.workers
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity);
                let conversations = Arc::clone(&self.conversations);
                let key = key.clone();
                tokio::spawn(worker_loop(key, runner, conversations, rx));
                tx
            })
            .clone()
    }
}

async fn worker_loop(
    key: SessionKey,
    runner: Arc<dyn AgentRunner>,
    conversations: Arc<ConversationRepo>,
    mut rx: mpsc::Receiver<EntityJob>,
) {
    debug!(key = %key, "session worker started");
    while let Some(job) = rx.recv().await {
        let result = run_one(&key, runner.as_ref(), &conversations, job.input).await;
        // Caller may have gone away; the turn still ran to completion.
        let _ = job.reply.send(result);
    }
    debug!(key = %key, "session worker stopped");
}

async fn run_one(
    key: &SessionKey,
    runner: &dyn AgentRunner,
    conversations: &ConversationRepo,
    input: Value,
) -> Result<String, WeftError> {
    let state = match conversations.get(key)? {
        Some(state) => state,
        None => runner.initial_state(),
    };

    let reply = runner
        .run(state, &input)
        .await
        .map_err(|e| WeftError::Adapter(e.to_string()))?;

    // State is persisted only after a successful turn; a failed run leaves
    // the conversation exactly as it was.
    conversations.put(key, &reply.state)?;
    Ok(reply.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AgentReply, EchoRunner, FnRunner, RunnerError};
    use async_trait::async_trait;
    use serde_json::json;
    use weft_core::ids::{AgentName, SessionId};

    fn key(agent: &str, session: &str) -> SessionKey {
        SessionKey::new(AgentName::new(agent), SessionId::from_raw(session))
    }

    fn dispatcher_with(
        registry: AgentRegistry,
        config: DispatcherConfig,
    ) -> (SessionDispatcher, Database) {
        let db = Database::in_memory().unwrap();
        (
            SessionDispatcher::new(Arc::new(registry), db.clone(), config),
            db,
        )
    }

    #[tokio::test]
    async fn unknown_agent_fails_fast() {
        let (dispatcher, _db) = dispatcher_with(AgentRegistry::new(), DispatcherConfig::default());
        let err = dispatcher
            .run(&key("ghost", "sess_1"), json!("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::UnknownAgent(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn state_persists_across_calls() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoRunner));
        let (dispatcher, db) = dispatcher_with(registry, DispatcherConfig::default());

        let k = key("echo", "sess_1");
        dispatcher.run(&k, json!("one")).await.unwrap();
        let out = dispatcher.run(&k, json!("two")).await.unwrap();
        assert_eq!(out, "echo: two");

        // The transcript carried over from the first call
        let repo = ConversationRepo::new(db);
        let state = repo.get(&k).unwrap().unwrap();
        assert_eq!(state["transcript"], json!(["one", "two"]));
    }

    #[tokio::test]
    async fn failed_turn_does_not_persist_state() {
        let mut registry = AgentRegistry::new();
        registry.register(
            "flaky",
            Arc::new(FnRunner::new(json!({"turns": 0}), |state, input| {
                if input == &json!("boom") {
                    return Err(RunnerError::Failed("asked to fail".into()));
                }
                let turns = state["turns"].as_i64().unwrap_or(0) + 1;
                Ok(AgentReply {
                    state: json!({"turns": turns}),
                    output: turns.to_string(),
                })
            })),
        );
        let (dispatcher, _db) = dispatcher_with(registry, DispatcherConfig::default());
        let k = key("flaky", "sess_1");

        assert_eq!(dispatcher.run(&k, json!("ok")).await.unwrap(), "1");
        let err = dispatcher.run(&k, json!("boom")).await.unwrap_err();
        assert!(matches!(err, WeftError::Adapter(_)));
        // Next successful turn sees the state from turn 1, not a half-write
        assert_eq!(dispatcher.run(&k, json!("ok")).await.unwrap(), "2");
    }

    #[tokio::test]
    async fn runner_failure_is_retryable() {
        let mut registry = AgentRegistry::new();
        registry.register(
            "overloaded",
            Arc::new(FnRunner::new(json!(null), |_, _| -> Result<AgentReply, RunnerError> {
                Err(RunnerError::Failed("model overloaded".into()))
            })),
        );
        let (dispatcher, _db) = dispatcher_with(registry, DispatcherConfig::default());

        // A failed turn never persisted state, so resending the same input
        // is safe and the caller is told so.
        let err = dispatcher
            .run(&key("overloaded", "sess_1"), json!("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Adapter(_)));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn concurrent_calls_to_one_key_are_serialized() {
        let mut registry = AgentRegistry::new();
        registry.register(
            "counter",
            Arc::new(FnRunner::new(json!({"count": 0}), |state, _| {
                let count = state["count"].as_i64().unwrap_or(0) + 1;
                Ok(AgentReply {
                    state: json!({"count": count}),
                    output: count.to_string(),
                })
            })),
        );
        let (dispatcher, _db) = dispatcher_with(registry, DispatcherConfig::default());
        let dispatcher = Arc::new(dispatcher);
        let k = key("counter", "sess_1");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let d = Arc::clone(&dispatcher);
            let k = k.clone();
            handles.push(tokio::spawn(async move { d.run(&k, json!(null)).await }));
        }
        let mut outputs = Vec::new();
        for h in handles {
            outputs.push(h.await.unwrap().unwrap());
        }

        // Every increment was applied on top of the previous one
        outputs.sort();
        let mut expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
        expected.sort();
        assert_eq!(outputs, expected);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share_state() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoRunner));
        let (dispatcher, _db) = dispatcher_with(registry, DispatcherConfig::default());

        dispatcher.run(&key("echo", "sess_a"), json!("a")).await.unwrap();
        let out = dispatcher.run(&key("echo", "sess_b"), json!("b")).await.unwrap();
        assert_eq!(out, "echo: b");
    }

    struct StallingRunner {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl AgentRunner for StallingRunner {
        fn initial_state(&self) -> Value {
            json!(null)
        }

        async fn run(&self, state: Value, _input: &Value) -> Result<AgentReply, RunnerError> {
            self.release.notified().await;
            Ok(AgentReply {
                state,
                output: "done".into(),
            })
        }
    }

    #[tokio::test]
    async fn full_queue_returns_busy() {
        let release = Arc::new(tokio::sync::Notify::new());
        let mut registry = AgentRegistry::new();
        registry.register(
            "slow",
            Arc::new(StallingRunner {
                release: Arc::clone(&release),
            }),
        );
        let (dispatcher, _db) =
            dispatcher_with(registry, DispatcherConfig { queue_capacity: 1 });
        let dispatcher = Arc::new(dispatcher);
        let k = key("slow", "sess_1");

        // First call occupies the worker, second fills the queue slot
        let d1 = Arc::clone(&dispatcher);
        let k1 = k.clone();
        let first = tokio::spawn(async move { d1.run(&k1, json!(1)).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let d2 = Arc::clone(&dispatcher);
        let k2 = k.clone();
        let second = tokio::spawn(async move { d2.run(&k2, json!(2)).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let err = dispatcher.run(&k, json!(3)).await.unwrap_err();
        assert!(matches!(err, WeftError::Busy(_)));
        assert!(err.retryable());

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "done");
        release.notify_one();
        assert_eq!(second.await.unwrap().unwrap(), "done");
    }
}
