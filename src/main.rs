use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use perch::config::Config;
use perch::core::channel::BotKind;
use perch::core::letta::{LettaClient, MessageGenerator};
use perch::core::manager::BotManager;
use perch::core::scheduler::ScheduleEngine;
use perch::core::status::BotStatusRepo;
use perch::core::tools::ToolAttachmentManager;
use perch::core::triggers::TriggerRepo;
use perch::core::vault::SecretsVault;
use perch::interfaces::discord::DiscordAdapterFactory;
use perch::interfaces::telegram::TelegramAdapterFactory;
use perch::interfaces::web::{AppState, build_api_router};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    if let Err(e) = run().await {
        error!("perch failed to start: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    let db = Arc::new(Mutex::new(Connection::open(&config.database_path)?));
    let vault = SecretsVault::new(db.clone(), config.vault_master_key);
    vault.initialize().await?;
    let triggers = TriggerRepo::new(db.clone());
    triggers.initialize().await?;
    let statuses = BotStatusRepo::new(db);
    statuses.initialize().await?;

    let letta = Arc::new(LettaClient::new(&config.letta_base_url, config.letta_token.clone()));
    let generator: Arc<dyn MessageGenerator> = letta.clone();

    let telegram = Arc::new(BotManager::new(
        BotKind::Telegram,
        Arc::new(TelegramAdapterFactory::new(
            triggers.clone(),
            vault.clone(),
            generator.clone(),
        )),
        statuses.clone(),
        triggers.clone(),
        vault.clone(),
    ));
    let discord = Arc::new(BotManager::new(
        BotKind::Discord,
        Arc::new(DiscordAdapterFactory::new(
            triggers.clone(),
            vault.clone(),
            generator.clone(),
        )),
        statuses.clone(),
        triggers.clone(),
        vault.clone(),
    ));

    // Bring previously running bots back before accepting requests.
    telegram.recover().await?;
    discord.recover().await?;

    let engine = Arc::new(ScheduleEngine::new(telegram.clone(), generator, triggers.clone()).await?);
    engine.load_all().await?;
    engine.start().await?;

    let tools = Arc::new(ToolAttachmentManager::new(letta.clone()));

    let mut managers = HashMap::new();
    managers.insert(BotKind::Telegram, telegram);
    managers.insert(BotKind::Discord, discord);

    let state = AppState {
        managers: Arc::new(managers),
        triggers,
        statuses,
        vault,
        engine,
        tools,
        letta,
    };
    let app = build_api_router(state);

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("perch API listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
