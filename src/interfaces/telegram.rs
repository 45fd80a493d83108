use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, Me, UpdateKind};
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

const TOKEN_SECRET: &str = "TELEGRAM_BOT_TOKEN";
const DM_OPT_IN_SECRET: &str = "TELEGRAM_RESPOND_TO_DMS";
/// How long a connect attempt waits for the poll loop to die before
/// declaring the bot up. Long polling never "finishes", so surviving the
/// window is the success signal.
const CONNECT_WINDOW: Duration = Duration::from_secs(3);
const MAX_TRANSPORT_FAILURES: u32 = 5;
const HISTORY_CAP: usize = 10;

pub struct TelegramAdapterFactory {
    triggers: TriggerRepo,
    vault: SecretsVault,
    generator: Arc<dyn MessageGenerator>,
}

impl TelegramAdapterFactory {
    pub fn new(triggers: TriggerRepo, vault: SecretsVault, generator: Arc<dyn MessageGenerator>) -> Self {
        Self { triggers, vault, generator }
    }
}

impl AdapterFactory for TelegramAdapterFactory {
    fn create(&self) -> Arc<dyn ChannelAdapter> {
        Arc::new(TelegramAdapter {
            shared: Arc::new(TelegramShared {
                triggers: self.triggers.clone(),
                vault: self.vault.clone(),
                generator: self.generator.clone(),
                secrets: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        })
    }
}

struct TelegramShared {
    triggers: TriggerRepo,
    vault: SecretsVault,
    generator: Arc<dyn MessageGenerator>,
    /// Resolved trigger secrets, swappable at runtime without a reconnect.
    secrets: Mutex<HashMap<String, String>>,
    /// Short per-chat conversation buffer handed to the agent as context.
    history: Mutex<HashMap<i64, VecDeque<String>>>,
    running: AtomicBool,
}

struct TelegramRuntime {
    bot: Bot,
    poll_task: JoinHandle<()>,
}

/// Long-polling Telegram connection for one agent.
pub struct TelegramAdapter {
    shared: Arc<TelegramShared>,
    runtime: Mutex<Option<TelegramRuntime>>,
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn kind(&self) -> BotKind {
        BotKind::Telegram
    }

    async fn connect(&self, agent_id: &str) -> Result<oneshot::Receiver<ChannelError>, ChannelError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(ChannelError::Other(anyhow!("telegram adapter already connected")));
        }

        let trigger = self
            .shared
            .triggers
            .find_for_agent(agent_id, TriggerKind::Telegram)
            .await?
            .ok_or(ChannelError::MissingTrigger(BotKind::Telegram))?;
        let resolved = resolve_trigger_secrets(&self.shared.vault, &trigger).await?;
        let token = resolved
            .get(TOKEN_SECRET)
            .cloned()
            .ok_or_else(|| ChannelError::MissingSecret(TOKEN_SECRET.to_string()))?;
        *self.shared.secrets.lock().await = resolved;

        let bot = Bot::new(&token);
        let (fatal_tx, mut fatal_rx) = oneshot::channel();

        self.shared.running.store(true, Ordering::SeqCst);
        let poll_task = tokio::spawn(poll_loop(
            self.shared.clone(),
            bot.clone(),
            agent_id.to_string(),
            fatal_tx,
        ));

        // Race the poll loop against the connect window: a token problem
        // surfaces within the window, while a healthy loop just keeps
        // polling and lets the timeout fire.
        match tokio::time::timeout(CONNECT_WINDOW, &mut fatal_rx).await {
            Err(_elapsed) => {
                *self.runtime.lock().await = Some(TelegramRuntime { bot, poll_task });
                Ok(fatal_rx)
            }
            Ok(Ok(err)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                poll_task.abort();
                Err(err)
            }
            Ok(Err(_)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                poll_task.abort();
                Err(ChannelError::Transport(
                    "telegram poll loop ended before connecting".to_string(),
                ))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.poll_task.abort();
        }
        // A later reconnect must start from a clean slate.
        self.shared.secrets.lock().await.clear();
        self.shared.history.lock().await.clear();
        Ok(())
    }

    async fn send_direct_message(&self, destination: &str, text: &str) -> Result<()> {
        let bot = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|r| r.bot.clone())
            .ok_or_else(|| anyhow!("telegram adapter is not connected"))?;
        let chat_id: i64 = destination
            .parse()
            .map_err(|_| anyhow!("'{destination}' is not a valid telegram chat id"))?;
        bot.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }

    async fn update_secrets(&self, secrets: HashMap<String, String>) {
        *self.shared.secrets.lock().await = secrets;
    }

    fn is_connected(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

async fn poll_loop(
    shared: Arc<TelegramShared>,
    bot: Bot,
    agent_id: String,
    fatal_tx: oneshot::Sender<ChannelError>,
) {
    let me = match bot.get_me().await {
        Ok(me) => me,
        Err(e) => {
            let _ = fatal_tx.send(classify_connect_failure(&e.to_string()));
            return;
        }
    };
    info!("[{}] telegram bot connected as @{}", agent_id, me.username());

    let started_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut fatal_tx = Some(fatal_tx);
    let mut offset: i64 = 0;
    let mut failures: u32 = 0;

    while shared.running.load(Ordering::SeqCst) {
        match bot.get_updates().offset(request_offset(offset)).timeout(25).await {
            Ok(updates) => {
                failures = 0;
                for update in updates {
                    offset = i64::from(update.id.0) + 1;
                    if let UpdateKind::Message(msg) = update.kind {
                        handle_message(&shared, &bot, &me, &agent_id, msg, started_at).await;
                    }
                }
            }
            Err(e) => {
                let classified = classify_connect_failure(&e.to_string());
                if classified.is_fatal() {
                    error!("[{}] telegram polling hit a fatal error: {}", agent_id, classified);
                    if let Some(tx) = fatal_tx.take() {
                        let _ = tx.send(classified);
                    }
                    break;
                }
                failures += 1;
                if failures >= MAX_TRANSPORT_FAILURES {
                    error!("[{}] telegram polling failed {} times in a row", agent_id, failures);
                    if let Some(tx) = fatal_tx.take() {
                        let _ = tx.send(ChannelError::Transport(format!(
                            "{failures} consecutive polling failures, last: {e}"
                        )));
                    }
                    break;
                }
                warn!("[{}] telegram polling error ({}/{}): {}", agent_id, failures, MAX_TRANSPORT_FAILURES, e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

/// Update ids are unsigned on the wire but the long-poll offset parameter is
/// a signed 32-bit integer; saturate rather than wrap negative.
fn request_offset(offset: i64) -> i32 {
    offset.try_into().unwrap_or(i32::MAX)
}

async fn handle_message(
    shared: &TelegramShared,
    bot: &Bot,
    me: &Me,
    agent_id: &str,
    msg: Message,
    started_at: i64,
) {
    // Updates queued before this bot started belong to a previous life.
    if msg.date.timestamp() < started_at {
        return;
    }
    let Some(text) = msg.text().map(str::to_string) else {
        return;
    };
    let Some(from) = msg.from.clone() else {
        return;
    };
    if from.is_bot {
        return;
    }

    // The trigger is re-read on every message so a disable or rule change
    // takes effect without a restart.
    let trigger = match shared.triggers.find_for_agent(agent_id, TriggerKind::Telegram).await {
        Ok(Some(t)) if t.enabled => t,
        Ok(_) => return,
        Err(e) => {
            warn!("[{}] could not load telegram trigger: {}", agent_id, e);
            return;
        }
    };

    if !should_respond(shared, me, &trigger, &msg, &text, agent_id).await {
        return;
    }

    let chat_id = msg.chat.id.0;
    let sender = from.full_name();
    info!("[{}] telegram message from {} in chat {}", agent_id, sender, chat_id);

    let context = {
        let history = shared.history.lock().await;
        history
            .get(&chat_id)
            .map(|entries| entries.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    };
    push_history(shared, chat_id, format!("{sender}: {text}")).await;

    let mut content = format!("[Telegram message from {sender}]: {text}");
    if !context.is_empty() {
        content = format!("Recent conversation:\n{context}\n\n{content}");
    }

    let _ = bot.send_chat_action(msg.chat.id, ChatAction::Typing).await;

    match shared.generator.generate(agent_id, &content).await {
        Ok(reply) => {
            push_history(shared, chat_id, format!("assistant: {reply}")).await;
            if let Err(e) = bot.send_message(msg.chat.id, reply).await {
                error!("[{}] failed to send telegram reply: {}", agent_id, e);
            }
        }
        Err(e) => {
            error!("[{}] agent failed to answer telegram message: {}", agent_id, e);
        }
    }
}

/// Group chats answer mentions and replies to the bot unconditionally;
/// anything else goes through the trigger's optional should-answer rule.
/// Direct messages require an explicit opt-in secret.
async fn should_respond(
    shared: &TelegramShared,
    me: &Me,
    trigger: &crate::core::triggers::Trigger,
    msg: &Message,
    text: &str,
    agent_id: &str,
) -> bool {
    if msg.chat.is_private() {
        let dms_enabled = shared
            .secrets
            .lock()
            .await
            .get(DM_OPT_IN_SECRET)
            .is_some_and(|v| v == "true");
        return dms_enabled;
    }

    let mention = format!("@{}", me.username());
    if text.contains(&mention) {
        return true;
    }
    if msg
        .reply_to_message()
        .and_then(|m| m.from.as_ref())
        .is_some_and(|u| u.id == me.user.id)
    {
        return true;
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
        rule.instruction, text
    );
    match shared.generator.generate(agent_id, &prompt).await {
        Ok(verdict) => verdict.to_uppercase().contains("YES"),
        Err(e) => {
            warn!("[{}] should-answer check failed, staying quiet: {}", agent_id, e);
            false
        }
    }
}

async fn push_history(shared: &TelegramShared, chat_id: i64, entry: String) {
    let mut history = shared.history.lock().await;
    let buffer = history.entry(chat_id).or_default();
    buffer.push_back(entry);
    while buffer.len() > HISTORY_CAP {
        buffer.pop_front();
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

    fn adapter() -> TelegramAdapter {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        TelegramAdapter {
            shared: Arc::new(TelegramShared {
                triggers: TriggerRepo::new(db.clone()),
                vault: SecretsVault::new(db, Some([7u8; 32])),
                generator: Arc::new(NullGenerator),
                secrets: Mutex::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn disconnect_drops_cached_secrets_and_history() {
        let adapter = adapter();
        adapter
            .update_secrets(HashMap::from([(TOKEN_SECRET.to_string(), "123:abc".to_string())]))
            .await;
        push_history(&adapter.shared, 42, "user: hi".to_string()).await;
        adapter.shared.running.store(true, Ordering::SeqCst);

        adapter.disconnect().await.unwrap();

        assert!(!adapter.is_connected());
        assert!(adapter.shared.secrets.lock().await.is_empty());
        assert!(adapter.shared.history.lock().await.is_empty());
    }

    #[test]
    fn poll_offset_does_not_wrap_on_large_update_ids() {
        let next = i64::from(u32::MAX) + 1;
        assert!(next > 0);
        assert_eq!(request_offset(next), i32::MAX);
        assert_eq!(request_offset(42), 42);
    }
}
