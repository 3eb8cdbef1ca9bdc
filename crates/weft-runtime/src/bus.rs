use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use weft_core::ids::InstanceId;
use weft_core::WeftError;
use weft_store::instances::InstanceRepo;
use weft_store::{Database, StoreError};

use crate::orchestration::EngineMsg;

/// Whether a raised event was handed to the engine or quietly discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaiseAck {
    Accepted,
    Dropped,
}

/// Entry point for external events. A mismatched target — unknown instance
/// or one that already finished — is logged and dropped, never an error:
/// raisers are fire-and-forget.
pub struct EventBus {
    instances: InstanceRepo,
    tx: mpsc::Sender<EngineMsg>,
}

impl EventBus {
    pub fn new(db: Database, tx: mpsc::Sender<EngineMsg>) -> Self {
        Self {
            instances: InstanceRepo::new(db),
            tx,
        }
    }

    #[instrument(skip(self, payload), fields(instance_id = %instance_id, name))]
    pub async fn raise(
        &self,
        instance_id: &InstanceId,
        name: &str,
        payload: Value,
    ) -> Result<RaiseAck, WeftError> {
        match self.instances.get(instance_id) {
            Ok(row) if !row.status.is_terminal() => {
                self.tx
                    .send(EngineMsg::EventRaised {
                        instance_id: instance_id.clone(),
                        name: name.to_owned(),
                        payload,
                    })
                    .await
                    .map_err(|_| WeftError::Transient("engine stopped".into()))?;
                Ok(RaiseAck::Accepted)
            }
            Ok(row) => {
                warn!(status = %row.status, "event dropped: instance already finished");
                Ok(RaiseAck::Dropped)
            }
            Err(StoreError::NotFound(_)) => {
                warn!("event dropped: unknown instance");
                Ok(RaiseAck::Dropped)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (EventBus, InstanceRepo, mpsc::Receiver<EngineMsg>) {
        let db = Database::in_memory().unwrap();
        let (tx, rx) = mpsc::channel(8);
        (
            EventBus::new(db.clone(), tx),
            InstanceRepo::new(db),
            rx,
        )
    }

    #[tokio::test]
    async fn unknown_instance_is_dropped() {
        let (bus, _, mut rx) = setup();
        let ack = bus
            .raise(&InstanceId::from_raw("inst_ghost"), "approval_event", json!("approved"))
            .await
            .unwrap();
        assert_eq!(ack, RaiseAck::Dropped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_instance_is_dropped() {
        let (bus, instances, mut rx) = setup();
        let id = InstanceId::new();
        instances.create(&id, "travel_planner", &json!({}), None).unwrap();
        instances.complete(&id, &json!(null)).unwrap();

        let ack = bus
            .raise(&id, "approval_event", json!("approved"))
            .await
            .unwrap();
        assert_eq!(ack, RaiseAck::Dropped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_instance_forwards_to_engine() {
        let (bus, instances, mut rx) = setup();
        let id = InstanceId::new();
        instances.create(&id, "travel_planner", &json!({}), None).unwrap();

        let ack = bus
            .raise(&id, "approval_event", json!("approved"))
            .await
            .unwrap();
        assert_eq!(ack, RaiseAck::Accepted);

        match rx.recv().await.unwrap() {
            EngineMsg::EventRaised {
                instance_id,
                name,
                payload,
            } => {
                assert_eq!(instance_id, id);
                assert_eq!(name, "approval_event");
                assert_eq!(payload, json!("approved"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
