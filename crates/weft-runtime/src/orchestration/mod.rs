mod context;
mod engine;
mod registry;

pub use context::{ChildFailure, NewAction, OrchestrationContext, OrchestrationError, Task};
pub use engine::{Engine, EngineConfig, EngineMsg};
pub use registry::{FnOrchestration, Orchestration, OrchestrationRegistry};
