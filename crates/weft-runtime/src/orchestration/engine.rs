use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use weft_core::history::{ActionKind, ActionRecord, ActionStatus, InstanceRow, InstanceStatus};
use weft_core::ids::{InstanceId, SessionKey};
use weft_core::WeftError;
use weft_store::history::{EventBufferRepo, HistoryRepo};
use weft_store::instances::InstanceRepo;
use weft_store::{Database, StoreError};

use super::context::{NewAction, OrchestrationContext, OrchestrationError};
use super::registry::OrchestrationRegistry;
use crate::entity::SessionDispatcher;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Capacity of the engine's message queue.
    pub queue_capacity: usize,
    /// Hard cap on history records per instance.
    pub history_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            history_cap: 4096,
        }
    }
}

/// Everything that advances an instance flows through this queue, which is
/// what serializes history appends.
#[derive(Debug)]
pub enum EngineMsg {
    Start {
        instance_id: InstanceId,
    },
    ActionResolved {
        instance_id: InstanceId,
        sequence_no: u32,
        outcome: Result<Value, String>,
    },
    EventRaised {
        instance_id: InstanceId,
        name: String,
        payload: Value,
    },
    Resume {
        instance_id: InstanceId,
    },
}

struct EngineInner {
    instances: InstanceRepo,
    history: HistoryRepo,
    buffer: EventBufferRepo,
    orchestrations: Arc<OrchestrationRegistry>,
    dispatcher: Arc<SessionDispatcher>,
    history_cap: u32,
}

/// Drives orchestration instances: replays the registered function against
/// recorded history, persists newly scheduled actions, and dispatches each
/// of them exactly once per call site.
pub struct Engine {
    inner: Arc<EngineInner>,
    tx: mpsc::Sender<EngineMsg>,
    _loop: tokio::task::JoinHandle<()>,
}

impl Engine {
    pub fn start(
        db: Database,
        orchestrations: Arc<OrchestrationRegistry>,
        dispatcher: Arc<SessionDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            instances: InstanceRepo::new(db.clone()),
            history: HistoryRepo::new(db.clone()),
            buffer: EventBufferRepo::new(db),
            orchestrations,
            dispatcher,
            history_cap: config.history_cap,
        });

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let loop_inner = Arc::clone(&inner);
        let loop_tx = tx.clone();
        let handle = tokio::spawn(engine_loop(loop_inner, loop_tx, rx));

        Self {
            inner,
            tx,
            _loop: handle,
        }
    }

    /// Create and start a new top-level instance. Returns immediately with
    /// its id; progress is observed via `instance()`.
    #[instrument(skip(self, input), fields(orchestration))]
    pub async fn start_instance(
        &self,
        orchestration: &str,
        input: Value,
    ) -> Result<InstanceId, WeftError> {
        if !self.inner.orchestrations.contains(orchestration) {
            return Err(WeftError::UnknownOrchestration(orchestration.to_owned()));
        }

        let id = InstanceId::new();
        self.inner.instances.create(&id, orchestration, &input, None)?;
        self.tx
            .send(EngineMsg::Start {
                instance_id: id.clone(),
            })
            .await
            .map_err(|_| WeftError::Transient("engine stopped".into()))?;
        Ok(id)
    }

    pub fn instance(&self, id: &InstanceId) -> Result<InstanceRow, WeftError> {
        self.inner.instances.get(id).map_err(|e| match e {
            StoreError::NotFound(_) => WeftError::UnknownInstance(id.to_string()),
            other => other.into(),
        })
    }

    /// Sender for raising external events; the event bus holds one.
    pub fn sender(&self) -> mpsc::Sender<EngineMsg> {
        self.tx.clone()
    }

    /// Re-drive every non-terminal instance after a restart. Outstanding
    /// work is re-dispatched, so completions are at-least-once across a
    /// crash; the scheduled→resolved transition stays exactly-once.
    pub async fn resume(&self) -> Result<usize, WeftError> {
        let open = self.inner.instances.list_non_terminal()?;
        let count = open.len();
        for row in open {
            self.tx
                .send(EngineMsg::Resume {
                    instance_id: row.id,
                })
                .await
                .map_err(|_| WeftError::Transient("engine stopped".into()))?;
        }
        if count > 0 {
            info!(count, "resumed instances");
        }
        Ok(count)
    }
}

async fn engine_loop(
    inner: Arc<EngineInner>,
    tx: mpsc::Sender<EngineMsg>,
    mut rx: mpsc::Receiver<EngineMsg>,
) {
    info!("orchestration engine started");
    while let Some(msg) = rx.recv().await {
        if let Err(e) = handle_msg(&inner, &tx, msg) {
            warn!(error = %e, "engine message failed");
        }
    }
    info!("orchestration engine stopped");
}

fn handle_msg(
    inner: &Arc<EngineInner>,
    tx: &mpsc::Sender<EngineMsg>,
    msg: EngineMsg,
) -> Result<(), WeftError> {
    match msg {
        EngineMsg::Start { instance_id } => run_turn(inner, tx, &instance_id),

        EngineMsg::ActionResolved {
            instance_id,
            sequence_no,
            outcome,
        } => {
            let row = match load_instance(inner, &instance_id) {
                Ok(row) => row,
                Err(WeftError::UnknownInstance(_)) => {
                    warn!(instance_id = %instance_id, "resolution for unknown instance dropped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if row.status.is_terminal() {
                return Ok(());
            }

            let order = inner.instances.next_resolution_order(&instance_id)?;
            let applied = match &outcome {
                Ok(value) => inner.history.resolve(
                    &instance_id,
                    sequence_no,
                    ActionStatus::Completed,
                    Some(value),
                    None,
                    order,
                )?,
                Err(error) => inner.history.resolve(
                    &instance_id,
                    sequence_no,
                    ActionStatus::Failed,
                    None,
                    Some(error),
                    order,
                )?,
            };

            // Duplicate resolutions (resume re-dispatch) are no-ops
            if applied {
                run_turn(inner, tx, &instance_id)?;
            }
            Ok(())
        }

        EngineMsg::EventRaised {
            instance_id,
            name,
            payload,
        } => {
            let row = match load_instance(inner, &instance_id) {
                Ok(row) => row,
                Err(WeftError::UnknownInstance(_)) => {
                    warn!(instance_id = %instance_id, name, "event for unknown instance dropped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if row.status.is_terminal() {
                warn!(instance_id = %instance_id, name, "event for finished instance dropped");
                return Ok(());
            }

            match inner.history.oldest_unmatched_wait(&instance_id, &name)? {
                Some(sequence_no) => {
                    let order = inner.instances.next_resolution_order(&instance_id)?;
                    let applied = inner.history.resolve(
                        &instance_id,
                        sequence_no,
                        ActionStatus::Completed,
                        Some(&payload),
                        None,
                        order,
                    )?;
                    if applied {
                        run_turn(inner, tx, &instance_id)?;
                    }
                }
                None => {
                    debug!(instance_id = %instance_id, name, "event buffered ahead of wait");
                    inner.buffer.push(&instance_id, &name, &payload)?;
                }
            }
            Ok(())
        }

        EngineMsg::Resume { instance_id } => resume_instance(inner, tx, &instance_id),
    }
}

#[instrument(skip(inner, tx), fields(instance_id = %instance_id))]
fn run_turn(
    inner: &Arc<EngineInner>,
    tx: &mpsc::Sender<EngineMsg>,
    instance_id: &InstanceId,
) -> Result<(), WeftError> {
    let row = load_instance(inner, instance_id)?;
    if row.status.is_terminal() {
        return Ok(());
    }

    let orchestration = inner
        .orchestrations
        .get(&row.orchestration)
        .ok_or_else(|| WeftError::UnknownOrchestration(row.orchestration.clone()))?;

    let records = inner.history.load(instance_id)?;
    let mut ctx = OrchestrationContext::new(instance_id.clone(), records, inner.history_cap);
    let outcome = orchestration.execute(&mut ctx, &row.input);
    let (new_actions, custom_status) = ctx.into_parts();

    if let Some(status) = custom_status {
        inner.instances.set_custom_status(instance_id, &status)?;
    }

    match outcome {
        Ok(output) => {
            inner.instances.complete(instance_id, &output)?;
            info!(orchestration = row.orchestration, "instance completed");
            notify_parent(tx, &row, Ok(output));
            Ok(())
        }
        Err(OrchestrationError::Suspended) => {
            // Persist before dispatching: the scheduled record is what
            // guards against running a side effect twice.
            for action in new_actions {
                persist_and_dispatch(inner, tx, instance_id, action)?;
            }

            let open = inner.history.scheduled(instance_id)?;
            let next = if !open.is_empty()
                && open.iter().all(|r| r.kind == ActionKind::ExternalEvent)
            {
                InstanceStatus::Pending
            } else {
                InstanceStatus::Running
            };
            if next != row.status {
                inner.instances.set_status(instance_id, next)?;
            }
            Ok(())
        }
        Err(err) => {
            let message = err.to_string();
            warn!(orchestration = row.orchestration, error = %message, "instance failed");
            inner.instances.fail(instance_id, &message)?;
            notify_parent(tx, &row, Err(message));
            Ok(())
        }
    }
}

fn persist_and_dispatch(
    inner: &Arc<EngineInner>,
    tx: &mpsc::Sender<EngineMsg>,
    instance_id: &InstanceId,
    action: NewAction,
) -> Result<(), WeftError> {
    let record = inner.history.insert_scheduled(
        instance_id,
        action.sequence_no,
        action.kind,
        &action.name,
        action.target.as_deref(),
        action.input.as_ref(),
    )?;
    dispatch(inner, tx, instance_id, &record)
}

fn dispatch(
    inner: &Arc<EngineInner>,
    tx: &mpsc::Sender<EngineMsg>,
    instance_id: &InstanceId,
    record: &ActionRecord,
) -> Result<(), WeftError> {
    match record.kind {
        ActionKind::Call => {
            let target = record
                .target
                .clone()
                .ok_or_else(|| WeftError::Internal("call record without target".into()))?;
            let key: SessionKey = target
                .parse()
                .map_err(|e: String| WeftError::Internal(e))?;
            let input = record.input.clone().unwrap_or(Value::Null);
            let dispatcher = Arc::clone(&inner.dispatcher);
            let tx = tx.clone();
            let id = instance_id.clone();
            let sequence_no = record.sequence_no;
            tokio::spawn(async move {
                let outcome = dispatcher
                    .run(&key, input)
                    .await
                    .map(Value::String)
                    .map_err(|e| e.to_string());
                let _ = tx
                    .send(EngineMsg::ActionResolved {
                        instance_id: id,
                        sequence_no,
                        outcome,
                    })
                    .await;
            });
            Ok(())
        }

        ActionKind::Timer => {
            let millis = record.input.as_ref().and_then(Value::as_u64).unwrap_or(0);
            let tx = tx.clone();
            let id = instance_id.clone();
            let sequence_no = record.sequence_no;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let _ = tx
                    .send(EngineMsg::ActionResolved {
                        instance_id: id,
                        sequence_no,
                        outcome: Ok(Value::Null),
                    })
                    .await;
            });
            Ok(())
        }

        ActionKind::SubOrchestration => {
            let child = InstanceId::from_raw(record.target.clone().ok_or_else(|| {
                WeftError::Internal("sub-orchestration record without target".into())
            })?);
            if !inner.orchestrations.contains(&record.name) {
                let tx = tx.clone();
                let id = instance_id.clone();
                let sequence_no = record.sequence_no;
                let error = WeftError::UnknownOrchestration(record.name.clone()).to_string();
                tokio::spawn(async move {
                    let _ = tx
                        .send(EngineMsg::ActionResolved {
                            instance_id: id,
                            sequence_no,
                            outcome: Err(error),
                        })
                        .await;
                });
                return Ok(());
            }

            let input = record.input.clone().unwrap_or(Value::Null);
            match inner.instances.create(
                &child,
                &record.name,
                &input,
                Some((instance_id, record.sequence_no)),
            ) {
                Ok(_) => {}
                // Already created on a previous dispatch of this record
                Err(StoreError::Database(msg)) if msg.contains("UNIQUE") => {}
                Err(e) => return Err(e.into()),
            }

            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(EngineMsg::Start { instance_id: child }).await;
            });
            Ok(())
        }

        ActionKind::ExternalEvent => {
            // An event may already be waiting in the buffer
            if let Some(payload) = inner.buffer.pop_oldest(instance_id, &record.name)? {
                let tx = tx.clone();
                let id = instance_id.clone();
                let sequence_no = record.sequence_no;
                tokio::spawn(async move {
                    let _ = tx
                        .send(EngineMsg::ActionResolved {
                            instance_id: id,
                            sequence_no,
                            outcome: Ok(payload),
                        })
                        .await;
                });
            }
            Ok(())
        }
    }
}

/// Re-dispatch outstanding work for one instance after a restart.
fn resume_instance(
    inner: &Arc<EngineInner>,
    tx: &mpsc::Sender<EngineMsg>,
    instance_id: &InstanceId,
) -> Result<(), WeftError> {
    let row = load_instance(inner, instance_id)?;
    if row.status.is_terminal() {
        return Ok(());
    }

    let open = inner.history.scheduled(instance_id)?;
    if open.is_empty() {
        // Crashed between the last resolution and the follow-up turn
        return run_turn(inner, tx, instance_id);
    }

    for record in open {
        match record.kind {
            ActionKind::SubOrchestration => {
                let child = InstanceId::from_raw(record.target.clone().ok_or_else(|| {
                    WeftError::Internal("sub-orchestration record without target".into())
                })?);
                match inner.instances.get(&child) {
                    // Child finished but the parent never heard about it
                    Ok(child_row) if child_row.status.is_terminal() => {
                        let outcome = match child_row.status {
                            InstanceStatus::Completed => {
                                Ok(child_row.output.unwrap_or(Value::Null))
                            }
                            _ => Err(child_row
                                .error
                                .unwrap_or_else(|| "child instance failed".into())),
                        };
                        let tx = tx.clone();
                        let id = instance_id.clone();
                        let sequence_no = record.sequence_no;
                        tokio::spawn(async move {
                            let _ = tx
                                .send(EngineMsg::ActionResolved {
                                    instance_id: id,
                                    sequence_no,
                                    outcome,
                                })
                                .await;
                        });
                    }
                    // Child is non-terminal and resumes on its own
                    Ok(_) => {}
                    // Crashed before the child row was created
                    Err(StoreError::NotFound(_)) => dispatch(inner, tx, instance_id, &record)?,
                    Err(e) => return Err(e.into()),
                }
            }
            _ => dispatch(inner, tx, instance_id, &record)?,
        }
    }
    Ok(())
}

fn notify_parent(tx: &mpsc::Sender<EngineMsg>, row: &InstanceRow, outcome: Result<Value, String>) {
    if let (Some(parent), Some(sequence_no)) =
        (row.parent_instance_id.clone(), row.parent_sequence_no)
    {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(EngineMsg::ActionResolved {
                    instance_id: parent,
                    sequence_no,
                    outcome,
                })
                .await;
        });
    }
}

fn load_instance(inner: &Arc<EngineInner>, id: &InstanceId) -> Result<InstanceRow, WeftError> {
    inner.instances.get(id).map_err(|e| match e {
        StoreError::NotFound(_) => WeftError::UnknownInstance(id.to_string()),
        other => other.into(),
    })
}
