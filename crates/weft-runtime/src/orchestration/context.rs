use std::time::Duration;

use serde_json::Value;

use weft_core::history::{ActionKind, ActionRecord, ActionStatus};
use weft_core::ids::{InstanceId, SessionId, SessionKey};

/// One failed participant of a `wait_all`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Not a failure: the turn reached a call site whose outcome is not
    /// recorded yet. The engine parks the instance until it resolves.
    #[error("suspended awaiting a recorded outcome")]
    Suspended,

    #[error("input missing: {0}")]
    InputMissing(String),

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("{} awaited task(s) failed", .0.len())]
    Aggregate(Vec<ChildFailure>),

    #[error("nondeterministic replay at sequence {sequence_no}: recorded {recorded}, code asked for {requested}")]
    Nondeterminism {
        sequence_no: u32,
        recorded: String,
        requested: String,
    },

    #[error("history limit of {0} records exceeded")]
    HistoryLimit(u32),
}

/// Handle to one claimed call site. Cheap, copyable, only meaningful
/// against the context that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Task {
    seq: u32,
}

impl Task {
    pub fn sequence_no(&self) -> u32 {
        self.seq
    }
}

/// An action claimed this turn with no recorded counterpart; the engine
/// persists and dispatches these after the turn returns.
#[derive(Clone, Debug)]
pub struct NewAction {
    pub sequence_no: u32,
    pub kind: ActionKind,
    pub name: String,
    pub target: Option<String>,
    pub input: Option<Value>,
}

/// Replay cursor over an instance's history. Each operation claims the next
/// sequence number; a recorded action at that position is validated against
/// what the code asked for, anything else becomes a newly scheduled action.
pub struct OrchestrationContext {
    instance_id: InstanceId,
    records: Vec<ActionRecord>,
    cursor: u32,
    new_actions: Vec<NewAction>,
    custom_status: Option<Value>,
    history_cap: u32,
}

impl OrchestrationContext {
    pub fn new(instance_id: InstanceId, records: Vec<ActionRecord>, history_cap: u32) -> Self {
        Self {
            instance_id,
            records,
            cursor: 0,
            new_actions: Vec::new(),
            custom_status: None,
            history_cap,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Session id for the next call site, stable across replays. Used when
    /// a workflow starts a fresh conversation rather than continuing one.
    pub fn derived_session(&self) -> SessionId {
        SessionId::from_raw(format!("{}:{}", self.instance_id, self.cursor))
    }

    /// Schedule (or replay) a serialized call into a session entity.
    pub fn call_agent(
        &mut self,
        key: &SessionKey,
        input: Value,
    ) -> Result<Task, OrchestrationError> {
        self.claim(ActionKind::Call, "run", Some(key.to_string()), Some(input))
    }

    /// Schedule (or replay) a child orchestration. The child's instance id
    /// derives from this call site, so replays address the same child.
    pub fn call_sub_orchestration(
        &mut self,
        name: &str,
        input: Value,
    ) -> Result<Task, OrchestrationError> {
        let child = self.instance_id.child(self.cursor);
        self.claim(
            ActionKind::SubOrchestration,
            name,
            Some(child.to_string()),
            Some(input),
        )
    }

    /// Schedule (or replay) a durable delay.
    pub fn start_timer(&mut self, delay: Duration) -> Result<Task, OrchestrationError> {
        self.claim(
            ActionKind::Timer,
            "delay",
            None,
            Some(Value::from(delay.as_millis() as u64)),
        )
    }

    /// Schedule (or replay) a wait for a named external event.
    pub fn wait_event(&mut self, name: &str) -> Result<Task, OrchestrationError> {
        self.claim(ActionKind::ExternalEvent, name, None, None)
    }

    /// Caller-visible progress snapshot; replaces any previous one.
    pub fn set_custom_status(&mut self, status: Value) {
        self.custom_status = Some(status);
    }

    fn claim(
        &mut self,
        kind: ActionKind,
        name: &str,
        target: Option<String>,
        input: Option<Value>,
    ) -> Result<Task, OrchestrationError> {
        let seq = self.cursor;
        self.cursor += 1;

        if let Some(record) = self.records.get(seq as usize) {
            let target_matches = match (&record.target, &target) {
                (Some(recorded), Some(requested)) => recorded == requested,
                (None, None) => true,
                _ => false,
            };
            if record.kind != kind || record.name != name || !target_matches {
                return Err(OrchestrationError::Nondeterminism {
                    sequence_no: seq,
                    recorded: format!("{} {}", record.kind, record.name),
                    requested: format!("{kind} {name}"),
                });
            }
            return Ok(Task { seq });
        }

        if seq >= self.history_cap {
            return Err(OrchestrationError::HistoryLimit(self.history_cap));
        }

        self.new_actions.push(NewAction {
            sequence_no: seq,
            kind,
            name: name.to_owned(),
            target,
            input,
        });
        Ok(Task { seq })
    }

    fn record(&self, task: Task) -> Option<&ActionRecord> {
        self.records.get(task.seq as usize)
    }

    /// Outcome of a single task. Unrecorded or unresolved ⇒ `Suspended`.
    pub fn result(&self, task: Task) -> Result<Value, OrchestrationError> {
        match self.record(task) {
            Some(record) => match record.status {
                ActionStatus::Completed => {
                    Ok(record.result.clone().unwrap_or(Value::Null))
                }
                ActionStatus::Failed => Err(OrchestrationError::TaskFailed(
                    record.error.clone().unwrap_or_else(|| "unknown".into()),
                )),
                ActionStatus::Scheduled => Err(OrchestrationError::Suspended),
            },
            None => Err(OrchestrationError::Suspended),
        }
    }

    /// Fan-in: all results in task order. Any recorded failure fails the
    /// wait immediately, even while other participants are outstanding.
    pub fn wait_all(&self, tasks: &[Task]) -> Result<Vec<Value>, OrchestrationError> {
        let mut failures = Vec::new();
        let mut outputs = Vec::with_capacity(tasks.len());
        let mut outstanding = false;

        for (index, task) in tasks.iter().enumerate() {
            match self.record(*task).map(|r| (r.status, r)) {
                Some((ActionStatus::Completed, record)) => {
                    outputs.push(record.result.clone().unwrap_or(Value::Null));
                }
                Some((ActionStatus::Failed, record)) => failures.push(ChildFailure {
                    index,
                    error: record.error.clone().unwrap_or_else(|| "unknown".into()),
                }),
                _ => outstanding = true,
            }
        }

        if !failures.is_empty() {
            return Err(OrchestrationError::Aggregate(failures));
        }
        if outstanding {
            return Err(OrchestrationError::Suspended);
        }
        Ok(outputs)
    }

    /// First resolution wins, decided by the persisted resolution stamp so
    /// the winner is the same on every replay. Losers stay outstanding.
    pub fn wait_any(&self, tasks: &[Task]) -> Result<(usize, Value), OrchestrationError> {
        let mut winner: Option<(u32, usize)> = None;
        for (index, task) in tasks.iter().enumerate() {
            if let Some(record) = self.record(*task) {
                if let Some(order) = record.resolved_order {
                    if record.status.is_resolved()
                        && winner.map_or(true, |(best, _)| order < best)
                    {
                        winner = Some((order, index));
                    }
                }
            }
        }

        match winner {
            Some((_, index)) => {
                let value = self.result(tasks[index])?;
                Ok((index, value))
            }
            None => Err(OrchestrationError::Suspended),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<NewAction>, Option<Value>) {
        (self.new_actions, self.custom_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::ids::AgentName;

    fn record(
        seq: u32,
        kind: ActionKind,
        name: &str,
        target: Option<&str>,
        status: ActionStatus,
        result: Option<Value>,
        error: Option<&str>,
        resolved_order: Option<u32>,
    ) -> ActionRecord {
        ActionRecord {
            instance_id: InstanceId::from_raw("inst_test"),
            sequence_no: seq,
            kind,
            name: name.to_owned(),
            target: target.map(str::to_owned),
            input: None,
            status,
            result,
            error: error.map(str::to_owned),
            resolved_order,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn ctx(records: Vec<ActionRecord>) -> OrchestrationContext {
        OrchestrationContext::new(InstanceId::from_raw("inst_test"), records, 4096)
    }

    fn writer_key() -> SessionKey {
        SessionKey::new(AgentName::new("writer"), SessionId::from_raw("sess_1"))
    }

    #[test]
    fn first_execution_schedules_and_suspends() {
        let mut c = ctx(vec![]);
        let task = c.call_agent(&writer_key(), json!("hi")).unwrap();
        assert!(matches!(c.result(task), Err(OrchestrationError::Suspended)));

        let (actions, _) = c.into_parts();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].sequence_no, 0);
        assert_eq!(actions[0].kind, ActionKind::Call);
        assert_eq!(actions[0].target.as_deref(), Some("writer--sess_1"));
    }

    #[test]
    fn replay_returns_recorded_result() {
        let mut c = ctx(vec![record(
            0,
            ActionKind::Call,
            "run",
            Some("writer--sess_1"),
            ActionStatus::Completed,
            Some(json!("an essay")),
            None,
            Some(1),
        )]);
        let task = c.call_agent(&writer_key(), json!("hi")).unwrap();
        assert_eq!(c.result(task).unwrap(), json!("an essay"));

        let (actions, _) = c.into_parts();
        assert!(actions.is_empty(), "replay must not reschedule");
    }

    #[test]
    fn recorded_failure_surfaces_as_task_failed() {
        let mut c = ctx(vec![record(
            0,
            ActionKind::Call,
            "run",
            Some("writer--sess_1"),
            ActionStatus::Failed,
            None,
            Some("runner exploded"),
            Some(1),
        )]);
        let task = c.call_agent(&writer_key(), json!("hi")).unwrap();
        assert!(matches!(
            c.result(task),
            Err(OrchestrationError::TaskFailed(msg)) if msg == "runner exploded"
        ));
    }

    #[test]
    fn kind_drift_is_nondeterminism() {
        let mut c = ctx(vec![record(
            0,
            ActionKind::Call,
            "run",
            Some("writer--sess_1"),
            ActionStatus::Completed,
            Some(json!("x")),
            None,
            Some(1),
        )]);
        let err = c.wait_event("approval_event").unwrap_err();
        assert!(matches!(err, OrchestrationError::Nondeterminism { sequence_no: 0, .. }));
    }

    #[test]
    fn target_drift_is_nondeterminism() {
        let mut c = ctx(vec![record(
            0,
            ActionKind::Call,
            "run",
            Some("writer--sess_1"),
            ActionStatus::Completed,
            Some(json!("x")),
            None,
            Some(1),
        )]);
        let other = SessionKey::new(AgentName::new("translator"), SessionId::from_raw("sess_1"));
        assert!(matches!(
            c.call_agent(&other, json!("hi")),
            Err(OrchestrationError::Nondeterminism { .. })
        ));
    }

    #[test]
    fn fan_out_schedules_everything_before_suspending() {
        let mut c = ctx(vec![]);
        let a = c.call_agent(&writer_key(), json!("fr")).unwrap();
        let b = c
            .call_agent(
                &SessionKey::new(AgentName::new("writer"), SessionId::from_raw("sess_2")),
                json!("es"),
            )
            .unwrap();
        assert!(matches!(c.wait_all(&[a, b]), Err(OrchestrationError::Suspended)));

        let (actions, _) = c.into_parts();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn wait_all_returns_results_in_task_order() {
        let c = ctx(vec![
            record(0, ActionKind::Call, "run", Some("a--s"), ActionStatus::Completed, Some(json!("first")), None, Some(2)),
            record(1, ActionKind::Call, "run", Some("b--s"), ActionStatus::Completed, Some(json!("second")), None, Some(1)),
        ]);
        // Tasks claimed out of band for the test
        let results = c.wait_all(&[Task { seq: 0 }, Task { seq: 1 }]).unwrap();
        assert_eq!(results, vec![json!("first"), json!("second")]);
    }

    #[test]
    fn wait_all_aggregates_failures() {
        let c = ctx(vec![
            record(0, ActionKind::Call, "run", Some("a--s"), ActionStatus::Failed, None, Some("fr down"), Some(1)),
            record(1, ActionKind::Call, "run", Some("b--s"), ActionStatus::Scheduled, None, None, None),
        ]);
        match c.wait_all(&[Task { seq: 0 }, Task { seq: 1 }]) {
            Err(OrchestrationError::Aggregate(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 0);
                assert_eq!(failures[0].error, "fr down");
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[test]
    fn wait_any_picks_lowest_resolution_stamp() {
        let c = ctx(vec![
            record(0, ActionKind::Timer, "delay", None, ActionStatus::Completed, Some(json!(null)), None, Some(5)),
            record(1, ActionKind::Timer, "delay", None, ActionStatus::Completed, Some(json!(null)), None, Some(3)),
        ]);
        let (index, _) = c.wait_any(&[Task { seq: 0 }, Task { seq: 1 }]).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn wait_any_suspends_until_any_resolution() {
        let c = ctx(vec![
            record(0, ActionKind::Timer, "delay", None, ActionStatus::Scheduled, None, None, None),
        ]);
        assert!(matches!(c.wait_any(&[Task { seq: 0 }]), Err(OrchestrationError::Suspended)));
    }

    #[test]
    fn history_cap_is_enforced() {
        let mut c = OrchestrationContext::new(InstanceId::from_raw("inst_test"), vec![], 2);
        c.wait_event("a").unwrap();
        c.wait_event("b").unwrap();
        assert!(matches!(
            c.wait_event("c"),
            Err(OrchestrationError::HistoryLimit(2))
        ));
    }

    #[test]
    fn derived_session_is_stable_for_a_call_site() {
        let c1 = ctx(vec![]);
        let c2 = ctx(vec![]);
        assert_eq!(c1.derived_session(), c2.derived_session());
        assert_eq!(c1.derived_session().as_str(), "inst_test:0");
    }
}
