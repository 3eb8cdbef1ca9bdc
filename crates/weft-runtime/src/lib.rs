pub mod bus;
pub mod entity;
pub mod orchestration;
pub mod runner;
pub mod workflows;

pub use bus::{EventBus, RaiseAck};
pub use entity::{DispatcherConfig, SessionDispatcher};
pub use orchestration::{
    Engine, EngineConfig, Orchestration, OrchestrationContext, OrchestrationError,
    OrchestrationRegistry,
};
pub use runner::{AgentRegistry, AgentReply, AgentRunner, RunnerError};
