use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use tracing::warn;

use super::super::AppState;

pub async fn get_secret_keys(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.vault.list_keys(&agent_id).await {
        Ok(keys) => Json(json!({ "success": true, "keys": keys })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct SetSecretRequest {
    key: String,
    value: String,
}

pub async fn set_secret(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SetSecretRequest>,
) -> Json<Value> {
    match state.vault.set_secret(&agent_id, &payload.key, &payload.value).await {
        Ok(()) => {
            push_live_secrets(&state, &agent_id).await;
            Json(json!({ "success": true, "message": "Secret updated" }))
        }
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn delete_secret(
    Path((agent_id, key)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.vault.remove_secret(&agent_id, &key).await {
        Ok(()) => {
            push_live_secrets(&state, &agent_id).await;
            Json(json!({ "success": true, "message": "Secret removed" }))
        }
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

/// Best effort: running bots pick the new values up immediately, stopped
/// bots read the vault on their next start anyway.
async fn push_live_secrets(state: &AppState, agent_id: &str) {
    for manager in state.managers.values() {
        if let Err(e) = manager.update_live_secrets(agent_id).await {
            warn!(
                "could not push updated secrets to running {} bot for {}: {}",
                manager.kind(),
                agent_id,
                e
            );
        }
    }
}
