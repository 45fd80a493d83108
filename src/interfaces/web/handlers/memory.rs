use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;

pub async fn get_memory_block(
    Path((agent_id, label)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state.letta.read_memory_block(&agent_id, &label).await {
        Ok(Some(value)) => Json(json!({ "success": true, "label": label, "value": value })),
        Ok(None) => Json(json!({ "success": false, "error": format!("memory block '{label}' not found") })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct MemoryBlockRequest {
    value: String,
}

pub async fn set_memory_block(
    Path((agent_id, label)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(payload): Json<MemoryBlockRequest>,
) -> Json<Value> {
    match state
        .letta
        .write_memory_block(&agent_id, &label, &payload.value)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "message": "Memory block updated" })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}
