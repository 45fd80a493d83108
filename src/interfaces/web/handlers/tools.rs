use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;

#[derive(serde::Deserialize)]
pub struct ToolRequest {
    tool: String,
}

pub async fn attach_tool(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ToolRequest>,
) -> Json<Value> {
    match state.tools.attach(&agent_id, &payload.tool).await {
        Ok(true) => Json(json!({ "success": true, "message": "Tool attached" })),
        Ok(false) => Json(json!({ "success": true, "message": "Tool already attached" })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn detach_tool(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ToolRequest>,
) -> Json<Value> {
    match state.tools.detach(&agent_id, &payload.tool).await {
        Ok(()) => Json(json!({ "success": true, "message": "Tool detached" })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}
