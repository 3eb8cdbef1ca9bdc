//! Sample orchestrations shipped with the runtime. They exercise every
//! coordination primitive and double as living documentation for writing
//! workflow functions.

use serde_json::{json, Value};

use weft_core::ids::{AgentName, SessionId, SessionKey};

use crate::orchestration::{OrchestrationContext, OrchestrationError, OrchestrationRegistry};

pub const WRITER_AGENT: &str = "writer_agent";
pub const FRENCH_TRANSLATOR_AGENT: &str = "french_translator_agent";
pub const SPANISH_TRANSLATOR_AGENT: &str = "spanish_translator_agent";
pub const DESTINATION_EXPERT_AGENT: &str = "destination_expert_agent";
pub const ITINERARY_PLANNER_AGENT: &str = "itinerary_planner_agent";
pub const LOCAL_RECOMMENDATIONS_AGENT: &str = "local_recommendations_agent";
pub const BOOKING_AGENT: &str = "booking_agent";

/// All agent names the sample workflows call.
pub const SAMPLE_AGENTS: &[&str] = &[
    WRITER_AGENT,
    FRENCH_TRANSLATOR_AGENT,
    SPANISH_TRANSLATOR_AGENT,
    DESTINATION_EXPERT_AGENT,
    ITINERARY_PLANNER_AGENT,
    LOCAL_RECOMMENDATIONS_AGENT,
    BOOKING_AGENT,
];

pub fn register_samples(registry: &mut OrchestrationRegistry) {
    registry.register_fn("agent_run", agent_run);
    registry.register_fn("multilingual_writer", multilingual_writer);
    registry.register_fn("travel_planner", travel_planner);
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, OrchestrationError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestrationError::InputMissing(field.to_owned()))
}

fn session_for(ctx: &OrchestrationContext, input: &Value) -> SessionId {
    match input.get("sessionId").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => SessionId::from_raw(s),
        _ => ctx.derived_session(),
    }
}

/// Generic single-agent workflow: run one operation against one session and
/// return the output.
fn agent_run(
    ctx: &mut OrchestrationContext,
    input: &Value,
) -> Result<Value, OrchestrationError> {
    let agent = require_str(input, "agentName")?;
    let session = session_for(ctx, input);
    let operation_input = input.get("operationInput").cloned().unwrap_or(Value::Null);

    let key = SessionKey::new(AgentName::new(agent), session);
    let task = ctx.call_agent(&key, operation_input)?;
    let output = ctx.result(task)?;
    Ok(json!({ "output": output }))
}

/// Write once in English, then translate to French and Spanish in parallel.
fn multilingual_writer(
    ctx: &mut OrchestrationContext,
    input: &Value,
) -> Result<Value, OrchestrationError> {
    let prompt = require_str(input, "prompt")?;

    let writer_key = SessionKey::new(AgentName::new(WRITER_AGENT), session_for(ctx, input));
    let writer = ctx.call_agent(&writer_key, json!(prompt))?;
    let english = ctx.result(writer)?;

    let french_key =
        SessionKey::new(AgentName::new(FRENCH_TRANSLATOR_AGENT), ctx.derived_session());
    let french = ctx.call_agent(&french_key, english.clone())?;
    let spanish_key =
        SessionKey::new(AgentName::new(SPANISH_TRANSLATOR_AGENT), ctx.derived_session());
    let spanish = ctx.call_agent(&spanish_key, english.clone())?;

    let translations = ctx.wait_all(&[french, spanish])?;
    Ok(json!({
        "english": english,
        "french": translations[0],
        "spanish": translations[1],
    }))
}

/// Three experts in sequence, then a human approval gate, then booking.
fn travel_planner(
    ctx: &mut OrchestrationContext,
    input: &Value,
) -> Result<Value, OrchestrationError> {
    let request = require_str(input, "request")?;

    let expert_key =
        SessionKey::new(AgentName::new(DESTINATION_EXPERT_AGENT), ctx.derived_session());
    let destination = {
        let task = ctx.call_agent(&expert_key, json!(request))?;
        ctx.result(task)?
    };

    let planner_key =
        SessionKey::new(AgentName::new(ITINERARY_PLANNER_AGENT), ctx.derived_session());
    let itinerary = {
        let task = ctx.call_agent(&planner_key, destination.clone())?;
        ctx.result(task)?
    };

    let local_key = SessionKey::new(
        AgentName::new(LOCAL_RECOMMENDATIONS_AGENT),
        ctx.derived_session(),
    );
    let recommendations = {
        let task = ctx.call_agent(&local_key, itinerary.clone())?;
        ctx.result(task)?
    };

    let mut response = json!({
        "destination": destination,
        "itinerary": itinerary,
        "recommendations": recommendations,
        "approval_status": "pending",
    });
    ctx.set_custom_status(response.clone());

    let approval = ctx.wait_event("approval_event")?;
    let decision = ctx.result(approval)?;

    if decision.as_str() == Some("approved") {
        let booking_key =
            SessionKey::new(AgentName::new(BOOKING_AGENT), ctx.derived_session());
        let task = ctx.call_agent(&booking_key, itinerary)?;
        let booking = ctx.result(task)?;

        response["approval_status"] = json!("approved");
        response["booking"] = booking;
        ctx.set_custom_status(response.clone());
        Ok(response)
    } else {
        response["approval_status"] = json!("rejected");
        ctx.set_custom_status(response.clone());
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ids::InstanceId;

    fn fresh_ctx() -> OrchestrationContext {
        OrchestrationContext::new(InstanceId::from_raw("inst_test"), vec![], 4096)
    }

    #[test]
    fn agent_run_requires_agent_name() {
        let mut ctx = fresh_ctx();
        let err = agent_run(&mut ctx, &json!({ "operationInput": "hi" })).unwrap_err();
        assert!(matches!(err, OrchestrationError::InputMissing(field) if field == "agentName"));
    }

    #[test]
    fn agent_run_first_turn_schedules_one_call() {
        let mut ctx = fresh_ctx();
        let outcome = agent_run(
            &mut ctx,
            &json!({ "agentName": "writer_agent", "operationInput": "hi" }),
        );
        assert!(matches!(outcome, Err(OrchestrationError::Suspended)));

        let (actions, _) = ctx.into_parts();
        assert_eq!(actions.len(), 1);
        // No session id given: the call site derives one
        assert_eq!(actions[0].target.as_deref(), Some("writer_agent--inst_test:0"));
    }

    #[test]
    fn agent_run_honors_explicit_session() {
        let mut ctx = fresh_ctx();
        let _ = agent_run(
            &mut ctx,
            &json!({ "agentName": "writer_agent", "sessionId": "sess_mine", "operationInput": "hi" }),
        );
        let (actions, _) = ctx.into_parts();
        assert_eq!(actions[0].target.as_deref(), Some("writer_agent--sess_mine"));
    }

    #[test]
    fn multilingual_writer_requires_prompt() {
        let mut ctx = fresh_ctx();
        let err = multilingual_writer(&mut ctx, &json!({})).unwrap_err();
        assert!(matches!(err, OrchestrationError::InputMissing(field) if field == "prompt"));
    }

    #[test]
    fn multilingual_writer_first_turn_only_schedules_writer() {
        let mut ctx = fresh_ctx();
        let outcome = multilingual_writer(&mut ctx, &json!({ "prompt": "write about looms" }));
        assert!(matches!(outcome, Err(OrchestrationError::Suspended)));

        // Translators must not dispatch until the writer's output exists
        let (actions, _) = ctx.into_parts();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].target.as_deref().unwrap().starts_with("writer_agent--"));
    }

    #[test]
    fn travel_planner_sets_pending_status_at_approval_gate() {
        use weft_core::history::{ActionKind, ActionRecord, ActionStatus};

        fn completed_call(seq: u32, target: &str, result: &str) -> ActionRecord {
            ActionRecord {
                instance_id: InstanceId::from_raw("inst_test"),
                sequence_no: seq,
                kind: ActionKind::Call,
                name: "run".into(),
                target: Some(target.to_owned()),
                input: None,
                status: ActionStatus::Completed,
                result: Some(json!(result)),
                error: None,
                resolved_order: Some(seq + 1),
                created_at: "2026-01-01T00:00:00Z".into(),
                updated_at: "2026-01-01T00:00:00Z".into(),
            }
        }

        // Replay with all three expert calls recorded: the turn should
        // suspend at the approval wait with the plan as custom status.
        let records = vec![
            completed_call(0, "destination_expert_agent--inst_test:0", "Lisbon"),
            completed_call(1, "itinerary_planner_agent--inst_test:1", "3 days in Alfama"),
            completed_call(2, "local_recommendations_agent--inst_test:2", "fado and pastéis"),
        ];
        let mut ctx = OrchestrationContext::new(InstanceId::from_raw("inst_test"), records, 4096);
        let outcome = travel_planner(&mut ctx, &json!({ "request": "somewhere sunny" }));
        assert!(matches!(outcome, Err(OrchestrationError::Suspended)));

        let (actions, custom_status) = ctx.into_parts();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::ExternalEvent);
        assert_eq!(actions[0].name, "approval_event");

        let status = custom_status.unwrap();
        assert_eq!(status["approval_status"], "pending");
        assert_eq!(status["destination"], "Lisbon");
    }
}
