mod handlers;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::core::channel::BotKind;
use crate::core::letta::LettaClient;
use crate::core::manager::BotManager;
use crate::core::scheduler::ScheduleEngine;
use crate::core::status::BotStatusRepo;
use crate::core::tools::ToolAttachmentManager;
use crate::core::triggers::TriggerRepo;
use crate::core::vault::SecretsVault;

use handlers::{bots, memory, secrets, tools, triggers};

#[derive(Clone)]
pub struct AppState {
    pub managers: Arc<HashMap<BotKind, Arc<BotManager>>>,
    pub triggers: TriggerRepo,
    pub statuses: BotStatusRepo,
    pub vault: SecretsVault,
    pub engine: Arc<ScheduleEngine>,
    pub tools: Arc<ToolAttachmentManager>,
    pub letta: Arc<LettaClient>,
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/bots/send", post(bots::send_message))
        .route("/api/bots/{kind}", get(bots::get_active_bots))
        .route("/api/bots/{kind}/{agent_id}/start", post(bots::start_bot))
        .route("/api/bots/{kind}/{agent_id}/stop", post(bots::stop_bot))
        .route("/api/bots/{kind}/{agent_id}/status", get(bots::get_bot_status))
        .route("/api/agents/{agent_id}/statuses", get(bots::get_agent_statuses))
        .route(
            "/api/agents/{agent_id}/triggers",
            get(triggers::get_triggers).post(triggers::upsert_trigger),
        )
        .route(
            "/api/triggers/{id}",
            axum::routing::delete(triggers::delete_trigger),
        )
        .route(
            "/api/agents/{agent_id}/secrets",
            get(secrets::get_secret_keys).post(secrets::set_secret),
        )
        .route(
            "/api/agents/{agent_id}/secrets/{key}",
            axum::routing::delete(secrets::delete_secret),
        )
        .route("/api/agents/{agent_id}/tools/attach", post(tools::attach_tool))
        .route("/api/agents/{agent_id}/tools/detach", post(tools::detach_tool))
        .route(
            "/api/agents/{agent_id}/memory/{label}",
            get(memory::get_memory_block).post(memory::set_memory_block),
        )
        .layer(build_cors())
        .with_state(state)
}
