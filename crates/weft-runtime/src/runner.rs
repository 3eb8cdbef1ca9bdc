use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use weft_core::ids::AgentName;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{0}")]
    Failed(String),
}

/// What a runner hands back from one turn: the full replacement state and
/// the output for the caller.
#[derive(Clone, Debug)]
pub struct AgentReply {
    pub state: Value,
    pub output: String,
}

/// Adapter seam between the session runtime and whatever does the actual
/// reasoning. The runtime owns state loading and persistence; the runner
/// only transforms (state, input) into (state, output).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// State for a session that has never run.
    fn initial_state(&self) -> Value;

    async fn run(&self, state: Value, input: &Value) -> Result<AgentReply, RunnerError>;
}

/// Name → runner map, built once at startup and passed where needed.
#[derive(Default)]
pub struct AgentRegistry {
    runners: HashMap<AgentName, Arc<dyn AgentRunner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, runner: Arc<dyn AgentRunner>) {
        self.runners.insert(AgentName::new(name), runner);
    }

    pub fn get(&self, name: &AgentName) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn contains(&self, name: &AgentName) -> bool {
        self.runners.contains_key(name)
    }

    pub fn names(&self) -> Vec<&AgentName> {
        self.runners.keys().collect()
    }
}

/// Closure-backed runner. The workhorse for tests and canned demo agents.
pub struct FnRunner<F> {
    initial: Value,
    f: F,
}

impl<F> FnRunner<F>
where
    F: Fn(Value, &Value) -> Result<AgentReply, RunnerError> + Send + Sync,
{
    pub fn new(initial: Value, f: F) -> Self {
        Self { initial, f }
    }
}

#[async_trait]
impl<F> AgentRunner for FnRunner<F>
where
    F: Fn(Value, &Value) -> Result<AgentReply, RunnerError> + Send + Sync,
{
    fn initial_state(&self) -> Value {
        self.initial.clone()
    }

    async fn run(&self, state: Value, input: &Value) -> Result<AgentReply, RunnerError> {
        (self.f)(state, input)
    }
}

/// Demo runner: keeps a transcript of everything it has seen and echoes
/// the latest input back.
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    fn initial_state(&self) -> Value {
        json!({ "transcript": [] })
    }

    async fn run(&self, mut state: Value, input: &Value) -> Result<AgentReply, RunnerError> {
        let rendered = match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Some(transcript) = state
            .get_mut("transcript")
            .and_then(Value::as_array_mut)
        {
            transcript.push(input.clone());
        }
        Ok(AgentReply {
            state,
            output: format!("echo: {rendered}"),
        })
    }
}
