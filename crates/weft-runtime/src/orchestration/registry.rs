use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::context::{OrchestrationContext, OrchestrationError};

/// A deterministic workflow function. `execute` is re-run from the top on
/// every turn; all interaction with the outside world goes through the
/// context, and yielding happens by propagating `Suspended` with `?`.
pub trait Orchestration: Send + Sync {
    fn execute(
        &self,
        ctx: &mut OrchestrationContext,
        input: &Value,
    ) -> Result<Value, OrchestrationError>;
}

/// Closure-backed orchestration, for tests and compact registrations.
pub struct FnOrchestration<F>(pub F);

impl<F> Orchestration for FnOrchestration<F>
where
    F: Fn(&mut OrchestrationContext, &Value) -> Result<Value, OrchestrationError> + Send + Sync,
{
    fn execute(
        &self,
        ctx: &mut OrchestrationContext,
        input: &Value,
    ) -> Result<Value, OrchestrationError> {
        (self.0)(ctx, input)
    }
}

/// Name → orchestration map, built at startup alongside the agent registry.
#[derive(Default)]
pub struct OrchestrationRegistry {
    orchestrations: HashMap<String, Arc<dyn Orchestration>>,
}

impl OrchestrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, orchestration: Arc<dyn Orchestration>) {
        self.orchestrations.insert(name.into(), orchestration);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut OrchestrationContext, &Value) -> Result<Value, OrchestrationError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(FnOrchestration(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Orchestration>> {
        self.orchestrations.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.orchestrations.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.orchestrations.keys().map(String::as_str).collect()
    }
}
