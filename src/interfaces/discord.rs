use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serenity::Client;
use serenity::all::{ChannelId, Context, EventHandler, GatewayIntents, Message, Ready, UserId};
use serenity::gateway::ShardManager;
use serenity::http::Http;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::channel::{
    AdapterFactory, BotKind, ChannelAdapter, ChannelError, classify_connect_failure,
};
use crate::core::letta::MessageGenerator;
use crate::core::secrets::resolve_trigger_secrets;
use crate::core::triggers::{TriggerKind, TriggerRepo};
use crate::core::vault::SecretsVault;

const TOKEN_SECRET: &str = "DISCORD_BOT_TOKEN";
const DM_OPT_IN_SECRET: &str = "DISCORD_RESPOND_TO_DMS";
const CONNECT_WINDOW: Duration = Duration::from_secs(3);
const HISTORY_CAP: usize = 10;

pub struct DiscordAdapterFactory {
    triggers: TriggerRepo,
    vault: SecretsVault,
    generator: Arc<dyn MessageGenerator>,
}

impl DiscordAdapterFactory {
    pub fn new(triggers: TriggerRepo, vault: SecretsVault, generator: Arc<dyn MessageGenerator>) -> Self {
        Self { triggers, vault, generator }
    }
}

impl AdapterFactory for DiscordAdapterFactory {
    fn create(&self) -> Arc<dyn ChannelAdapter> {
        Arc::new(DiscordAdapter {
            shared: Arc::new(DiscordShared {
                triggers: self.triggers.clone(),
                vault: self.vault.clone(),
                generator: self.generator.clone(),
                secrets: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                self_id: AtomicU64::new(0),
            }),
            runtime: Mutex::new(None),
        })
    }
}

struct DiscordShared {
    triggers: TriggerRepo,
    vault: SecretsVault,
    generator: Arc<dyn MessageGenerator>,
    secrets: Mutex<HashMap<String, String>>,
    history: Mutex<HashMap<u64, VecDeque<String>>>,
    running: AtomicBool,
    self_id: AtomicU64,
}

struct DiscordRuntime {
    http: Arc<Http>,
    shard_manager: Arc<ShardManager>,
    run_task: JoinHandle<()>,
}

/// Gateway-connected Discord presence for one agent.
pub struct DiscordAdapter {
    shared: Arc<DiscordShared>,
    runtime: Mutex<Option<DiscordRuntime>>,
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn kind(&self) -> BotKind {
        BotKind::Discord
    }

    async fn connect(&self, agent_id: &str) -> Result<oneshot::Receiver<ChannelError>, ChannelError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(ChannelError::Other(anyhow!("discord adapter already connected")));
        }

        let trigger = self
            .shared
            .triggers
            .find_for_agent(agent_id, TriggerKind::Discord)
            .await?
            .ok_or(ChannelError::MissingTrigger(BotKind::Discord))?;
        let resolved = resolve_trigger_secrets(&self.shared.vault, &trigger).await?;
        let token = resolved
            .get(TOKEN_SECRET)
            .cloned()
            .ok_or_else(|| ChannelError::MissingSecret(TOKEN_SECRET.to_string()))?;
        *self.shared.secrets.lock().await = resolved;

        // Validate the token upfront; the gateway would surface a bad token
        // slowly and less legibly.
        let http = Arc::new(Http::new(&token));
        let current = http
            .get_current_user()
            .await
            .map_err(|e| classify_connect_failure(&e.to_string()))?;
        self.shared.self_id.store(current.id.get(), Ordering::SeqCst);
        info!("[{}] discord token validated for {}", agent_id, current.name);

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let handler = Handler {
            shared: self.shared.clone(),
            agent_id: agent_id.to_string(),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        };

        let mut client = Client::builder(&token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| classify_connect_failure(&e.to_string()))?;
        let shard_manager = client.shard_manager.clone();

        let (fatal_tx, mut fatal_rx) = oneshot::channel();
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let run_agent = agent_id.to_string();
        let run_task = tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!("[{}] discord client stopped: {}", run_agent, e);
                let _ = fatal_tx.send(classify_connect_failure(&e.to_string()));
            }
            shared.running.store(false, Ordering::SeqCst);
        });

        match tokio::time::timeout(CONNECT_WINDOW, &mut fatal_rx).await {
            Err(_elapsed) => {
                *self.runtime.lock().await = Some(DiscordRuntime {
                    http,
                    shard_manager,
                    run_task,
                });
                Ok(fatal_rx)
            }
            Ok(Ok(err)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                run_task.abort();
                Err(err)
            }
            Ok(Err(_)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                run_task.abort();
                Err(ChannelError::Transport(
                    "discord gateway task ended before connecting".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.shard_manager.shutdown_all().await;
            runtime.run_task.abort();
        }
        // A later reconnect must start from a clean slate.
        self.shared.secrets.lock().await.clear();
        self.shared.history.lock().await.clear();
        Ok(())
    }

    async fn send_direct_message(&self, destination: &str, text: &str) -> Result<()> {
        let http = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|r| r.http.clone())
            .ok_or_else(|| anyhow!("discord adapter is not connected"))?;
        let channel_id: u64 = destination
            .parse()
            .map_err(|_| anyhow!("'{destination}' is not a valid discord channel id"))?;
        ChannelId::new(channel_id).say(&http, text).await?;
        Ok(())
    }

    async fn update_secrets(&self, secrets: HashMap<String, String>) {
        *self.shared.secrets.lock().await = secrets;
    }

    fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

struct Handler {
    shared: Arc<DiscordShared>,
    agent_id: String,
    started_at: i64,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot || msg.content.trim().is_empty() {
            return;
        }
        if msg.timestamp.unix_timestamp() < self.started_at {
            return;
        }

        let trigger = match self
            .shared
            .triggers
            .find_for_agent(&self.agent_id, TriggerKind::Discord)
            .await
        {
            Ok(Some(t)) if t.enabled => t,
            Ok(_) => return,
            Err(e) => {
                warn!("[{}] could not load discord trigger: {}", self.agent_id, e);
                return;
            }
        };

        if !self.should_respond(&trigger, &msg).await {
            return;
        }

        let channel = msg.channel_id.get();
        let sender = msg.author.name.clone();
        info!("[{}] discord message from {} in channel {}", self.agent_id, sender, channel);

        let context = {
            let history = self.shared.history.lock().await;
            history
                .get(&channel)
                .map(|entries| entries.iter().cloned().collect::<Vec<_>>().join("\n"))
                .unwrap_or_default()
        };
        self.push_history(channel, format!("{}: {}", sender, msg.content)).await;

        let mut content = format!("[Discord message from {}]: {}", sender, msg.content);
        if !context.is_empty() {
            content = format!("Recent conversation:\n{context}\n\n{content}");
        }

        let _ = msg.channel_id.broadcast_typing(&ctx.http).await;

        match self.shared.generator.generate(&self.agent_id, &content).await {
            Ok(reply) => {
                self.push_history(channel, format!("assistant: {reply}")).await;
                if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
                    error!("[{}] failed to send discord reply: {}", self.agent_id, e);
                }
            }
            Err(e) => {
                error!("[{}] agent failed to answer discord message: {}", self.agent_id, e);
            }
        }
    }

    async fn ready(&self, _: Context, ready: Ready) {
        self.shared.self_id.store(ready.user.id.get(), Ordering::SeqCst);
        info!("[{}] discord bot connected as {}", self.agent_id, ready.user.name);
    }
}

impl Handler {
    /// Same gating as the other channels: DMs need an opt-in secret, guild
    /// messages answer mentions and replies, and anything else runs through
    /// the trigger's should-answer rule.
    async fn should_respond(&self, trigger: &crate::core::triggers::Trigger, msg: &Message) -> bool {
        if msg.guild_id.is_none() {
            return self
                .shared
                .secrets
                .lock()
                .await
                .get(DM_OPT_IN_SECRET)
                .is_some_and(|v| v == "true");
        }

        let self_id = self.shared.self_id.load(Ordering::SeqCst);
        if self_id != 0 {
            if msg.mentions_user_id(UserId::new(self_id)) {
                return true;
            }
            if msg
                .referenced_message
                .as_ref()
                .is_some_and(|m| m.author.id.get() == self_id)
            {
                return true;
            }
        }

        let Some(rule) = trigger
            .channel_config()
            .and_then(|c| c.should_answer.as_ref())
            .filter(|r| r.enabled)
        else {
            return false;
        };

        let prompt = format!(
            "{}\n\nMessage: {}\n\nShould you answer this message? Reply with exactly YES or NO.",
            rule.instruction, msg.content
        );
        match self.shared.generator.generate(&self.agent_id, &prompt).await {
            Ok(verdict) => verdict.to_uppercase().contains("YES"),
            Err(e) => {
                warn!("[{}] should-answer check failed, staying quiet: {}", self.agent_id, e);
                false
            }
        }
    }

    async fn push_history(&self, channel: u64, entry: String) {
        let mut history = self.shared.history.lock().await;
        let buffer = history.entry(channel).or_default();
        buffer.push_back(entry);
        while buffer.len() > HISTORY_CAP {
            buffer.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    struct NullGenerator;

    #[async_trait]
    impl MessageGenerator for NullGenerator {
        async fn generate(&self, _agent_id: &str, _content: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn generate_system(&self, _agent_id: &str, _content: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn adapter() -> DiscordAdapter {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        DiscordAdapter {
            shared: Arc::new(DiscordShared {
                triggers: TriggerRepo::new(db.clone()),
                vault: SecretsVault::new(db, Some([7u8; 32])),
                generator: Arc::new(NullGenerator),
                secrets: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                self_id: AtomicU64::new(0),
            }),
            runtime: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn disconnect_drops_cached_secrets_and_history() {
        let adapter = adapter();
        adapter
            .update_secrets(HashMap::from([(TOKEN_SECRET.to_string(), "tok".to_string())]))
            .await;
        adapter
            .shared
            .history
            .lock()
            .await
            .entry(99)
            .or_default()
            .push_back("user: hello".to_string());
        adapter.shared.running.store(true, Ordering::SeqCst);

        adapter.disconnect().await.unwrap();

        assert!(!adapter.is_connected());
        assert!(adapter.shared.secrets.lock().await.is_empty());
        assert!(adapter.shared.history.lock().await.is_empty());
    }
}
