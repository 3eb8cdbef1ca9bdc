use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::InstanceId;

/// What an orchestration asked the runtime to do at one call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Serialized call into a session entity.
    Call,
    /// Child orchestration instance.
    SubOrchestration,
    /// Durable delay.
    Timer,
    /// Wait for a named event raised from outside.
    ExternalEvent,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::SubOrchestration => write!(f, "sub_orchestration"),
            Self::Timer => write!(f, "timer"),
            Self::ExternalEvent => write!(f, "external_event"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(Self::Call),
            "sub_orchestration" => Ok(Self::SubOrchestration),
            "timer" => Ok(Self::Timer),
            "external_event" => Ok(Self::ExternalEvent),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// One appended history record. `sequence_no` is the call-site position in
/// program order; `resolved_order` is the per-instance completion stamp
/// that makes "which finished first" stable across replays.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRecord {
    pub instance_id: InstanceId,
    pub sequence_no: u32,
    pub kind: ActionKind,
    /// Logical name: event name for waits, orchestration name for children,
    /// operation name for calls and timers.
    pub name: String,
    /// Call target (session key) when kind is Call, child instance id when
    /// kind is SubOrchestration.
    pub target: Option<String>,
    pub input: Option<Value>,
    pub status: ActionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub resolved_order: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    /// Suspended with every outstanding wait being an external event.
    Pending,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceRow {
    pub id: InstanceId,
    pub orchestration: String,
    pub input: Value,
    pub status: InstanceStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub custom_status: Option<Value>,
    pub parent_instance_id: Option<InstanceId>,
    pub parent_sequence_no: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}
