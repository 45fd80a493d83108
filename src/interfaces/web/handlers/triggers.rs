use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use tracing::warn;

use super::super::AppState;
use crate::core::triggers::{Trigger, TriggerConfig, TriggerKind};

fn trigger_json(trigger: &Trigger) -> Value {
    let config = trigger.config.to_value().unwrap_or(Value::Null);
    json!({
        "id": trigger.id,
        "agent_id": trigger.agent_id,
        "kind": trigger.kind.as_str(),
        "enabled": trigger.enabled,
        "config": config,
        "created_at": trigger.created_at,
        "updated_at": trigger.updated_at,
    })
}

pub async fn get_triggers(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.triggers.triggers_for_agent(&agent_id).await {
        Ok(triggers) => {
            let triggers: Vec<Value> = triggers.iter().map(trigger_json).collect();
            Json(json!({ "success": true, "triggers": triggers }))
        }
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct UpsertTriggerRequest {
    id: Option<String>,
    kind: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    config: Value,
}

fn default_enabled() -> bool {
    true
}

pub async fn upsert_trigger(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<UpsertTriggerRequest>,
) -> Json<Value> {
    let Some(kind) = TriggerKind::parse(&payload.kind) else {
        return Json(json!({ "success": false, "error": format!("unknown trigger kind '{}'", payload.kind) }));
    };
    let config = match TriggerConfig::parse(kind, &payload.config) {
        Ok(config) => config,
        Err(e) => return Json(json!({ "success": false, "error": e.to_string() })),
    };

    let id = match state
        .triggers
        .upsert(payload.id.as_deref(), &agent_id, kind, payload.enabled, &config)
        .await
    {
        Ok(id) => id,
        Err(e) => return Json(json!({ "success": false, "error": e.to_string() })),
    };

    // Keep the running scheduler in step with the stored trigger.
    if kind == TriggerKind::Scheduled {
        let result = if payload.enabled {
            state.engine.add_trigger(&id).await
        } else {
            state.engine.remove_trigger(&id).await
        };
        if let Err(e) = result {
            warn!("trigger {} saved but scheduler sync failed: {}", id, e);
            return Json(json!({
                "success": true,
                "id": id,
                "warning": format!("saved, but scheduling failed: {e}"),
            }));
        }
    }

    Json(json!({ "success": true, "id": id }))
}

pub async fn delete_trigger(Path(id): Path<String>, State(state): State<AppState>) -> Json<Value> {
    if let Err(e) = state.engine.remove_trigger(&id).await {
        warn!("could not unschedule trigger {}: {}", id, e);
    }
    match state.triggers.delete(&id).await {
        Ok(true) => Json(json!({ "success": true, "message": "Trigger removed" })),
        Ok(false) => Json(json!({ "success": false, "error": format!("trigger '{id}' not found") })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}
