pub mod errors;
pub mod history;
pub mod ids;

pub use errors::WeftError;
pub use history::{ActionKind, ActionRecord, ActionStatus, InstanceRow, InstanceStatus};
pub use ids::{AgentName, InstanceId, SessionId, SessionKey};
