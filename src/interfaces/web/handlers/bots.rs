use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use crate::core::channel::BotKind;
use crate::core::manager::{BotManager, StartOutcome};
use crate::core::status::BotRecord;
use std::sync::Arc;

fn manager_for(state: &AppState, kind: &str) -> Result<(BotKind, Arc<BotManager>), Json<Value>> {
    let Some(kind) = BotKind::parse(kind) else {
        return Err(Json(json!({ "success": false, "error": format!("unknown channel '{kind}'") })));
    };
    match state.managers.get(&kind) {
        Some(manager) => Ok((kind, manager.clone())),
        None => Err(Json(json!({ "success": false, "error": format!("channel '{kind}' is not configured") }))),
    }
}

pub async fn start_bot(
    Path((kind, agent_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<Value> {
    let (_, manager) = match manager_for(&state, &kind) {
        Ok(found) => found,
        Err(response) => return response,
    };
    let outcome = manager.start(&agent_id).await;
    if outcome.is_active() {
        let message = match outcome {
            StartOutcome::Started => "Bot started",
            _ => "Bot already running",
        };
        Json(json!({ "success": true, "status": "running", "message": message }))
    } else {
        let error = outcome.error().unwrap_or("start failed");
        Json(json!({ "success": false, "error": error }))
    }
}

pub async fn stop_bot(
    Path((kind, agent_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<Value> {
    let (_, manager) = match manager_for(&state, &kind) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match manager.stop(&agent_id).await {
        Ok(was_running) => Json(json!({
            "success": true,
            "status": "stopped",
            "was_running": was_running,
        })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn get_bot_status(
    Path((kind, agent_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Json<Value> {
    let (bot_kind, manager) = match manager_for(&state, &kind) {
        Ok(found) => found,
        Err(response) => return response,
    };
    let running = match manager.is_running(&agent_id).await {
        Ok(running) => running,
        Err(e) => return Json(json!({ "success": false, "error": e.to_string() })),
    };
    match state.statuses.get(&agent_id, bot_kind).await {
        Ok(record) => {
            let record = record.as_ref().map(record_json);
            Json(json!({ "success": true, "running": running, "record": record }))
        }
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

fn record_json(record: &BotRecord) -> Value {
    json!({
        "status": record.status.as_str(),
        "last_started": record.last_started,
        "last_stopped": record.last_stopped,
        "error_message": record.error_message,
        "updated_at": record.updated_at,
    })
}

pub async fn get_active_bots(Path(kind): Path<String>, State(state): State<AppState>) -> Json<Value> {
    let (_, manager) = match manager_for(&state, &kind) {
        Ok(found) => found,
        Err(response) => return response,
    };
    let agent_ids = manager.get_active_agent_ids().await;
    Json(json!({ "success": true, "agent_ids": agent_ids }))
}

#[derive(serde::Deserialize)]
pub struct SendMessageRequest {
    agent_id: String,
    bot_type: String,
    message: String,
}

/// Push a message out through an agent's running bot, to the destination its
/// scheduled trigger names.
pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> Json<Value> {
    let (_, manager) = match manager_for(&state, &payload.bot_type) {
        Ok(found) => found,
        Err(response) => return response,
    };
    match manager
        .send_message_to_channel(&payload.agent_id, &payload.message)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "message": "Message sent" })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

/// One agent's bot state across every configured channel.
pub async fn get_agent_statuses(
    Path(agent_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    let mut statuses = serde_json::Map::new();
    for (kind, manager) in state.managers.iter() {
        let running = match manager.is_running(&agent_id).await {
            Ok(running) => running,
            Err(e) => return Json(json!({ "success": false, "error": e.to_string() })),
        };
        let record = match state.statuses.get(&agent_id, *kind).await {
            Ok(record) => record.as_ref().map(record_json),
            Err(e) => return Json(json!({ "success": false, "error": e.to_string() })),
        };
        statuses.insert(
            kind.as_str().to_string(),
            json!({ "running": running, "record": record }),
        );
    }
    Json(json!({ "success": true, "statuses": statuses }))
}
