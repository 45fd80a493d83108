use crate::core::letta::MessageGenerator;
use crate::core::manager::BotManager;
use crate::core::triggers::{TriggerKind, TriggerRepo};
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cron-driven trigger engine. Each enabled scheduled trigger becomes one
/// job; on fire the trigger is re-read so disable/delete take effect without
/// touching the scheduler.
pub struct ScheduleEngine {
    scheduler: Mutex<JobScheduler>,
    /// trigger id -> scheduled job id, for remove-then-add updates.
    jobs: Mutex<HashMap<String, Uuid>>,
    manager: Arc<BotManager>,
    generator: Arc<dyn MessageGenerator>,
    triggers: TriggerRepo,
}

/// Accept node-style five-field cron expressions by prepending a seconds
/// column; six-field expressions pass through untouched.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        n => Err(anyhow!("cron expression '{trimmed}' has {n} fields, expected 5 or 6")),
    }
}

impl ScheduleEngine {
    pub async fn new(
        manager: Arc<BotManager>,
        generator: Arc<dyn MessageGenerator>,
        triggers: TriggerRepo,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            jobs: Mutex::new(HashMap::new()),
            manager,
            generator,
            triggers,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    /// Register jobs for every enabled scheduled trigger. One bad trigger
    /// does not block the rest.
    pub async fn load_all(&self) -> Result<()> {
        let triggers = self.triggers.list_enabled(TriggerKind::Scheduled).await?;
        info!("loading {} scheduled trigger(s)", triggers.len());
        for trigger in &triggers {
            if let Err(e) = self.add_trigger(&trigger.id).await {
                warn!("could not schedule trigger {}: {}", trigger.id, e);
            }
        }
        Ok(())
    }

    /// Schedule (or reschedule) one trigger by id. Updates are expressed as
    /// remove-then-add so a changed cron expression takes effect cleanly.
    pub async fn add_trigger(&self, trigger_id: &str) -> Result<()> {
        let trigger = self
            .triggers
            .get(trigger_id)
            .await?
            .ok_or_else(|| anyhow!("trigger {trigger_id} not found"))?;
        let config = trigger
            .scheduled_config()
            .ok_or_else(|| anyhow!("trigger {trigger_id} is not a scheduled trigger"))?;

        self.remove_trigger(trigger_id).await?;

        let cron = normalize_cron(&config.schedule)?;
        let timezone: chrono_tz::Tz = config.timezone.parse().unwrap_or_else(|_| {
            warn!(
                "unknown timezone '{}' on trigger {}, falling back to UTC",
                config.timezone, trigger.id
            );
            chrono_tz::UTC
        });

        let manager = self.manager.clone();
        let generator = self.generator.clone();
        let triggers = self.triggers.clone();
        let id_for_job = trigger.id.clone();
        let job = Job::new_async_tz(cron.as_str(), timezone, move |_uuid, _lock| {
            let manager = manager.clone();
            let generator = generator.clone();
            let triggers = triggers.clone();
            let trigger_id = id_for_job.clone();
            Box::pin(async move {
                fire_trigger(&manager, generator.as_ref(), &triggers, &trigger_id).await;
            })
        })?;

        let job_id = self.scheduler.lock().await.add(job).await?;
        self.jobs.lock().await.insert(trigger.id.clone(), job_id);
        info!(
            "scheduled trigger {} for agent {} ({} {})",
            trigger.id, trigger.agent_id, cron, timezone
        );
        Ok(())
    }

    pub async fn remove_trigger(&self, trigger_id: &str) -> Result<()> {
        let Some(job_id) = self.jobs.lock().await.remove(trigger_id) else {
            return Ok(());
        };
        self.scheduler.lock().await.remove(&job_id).await?;
        debug!("unscheduled trigger {}", trigger_id);
        Ok(())
    }

    pub async fn scheduled_trigger_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// One scheduled fire. Every failure path logs and returns; a broken fire
/// must never take the scheduler or other triggers down with it.
async fn fire_trigger(
    manager: &BotManager,
    generator: &dyn MessageGenerator,
    triggers: &TriggerRepo,
    trigger_id: &str,
) {
    let trigger = match triggers.get(trigger_id).await {
        Ok(Some(t)) if t.enabled => t,
        Ok(_) => {
            debug!("trigger {} disabled or deleted, skipping fire", trigger_id);
            return;
        }
        Err(e) => {
            warn!("could not load trigger {} at fire time: {}", trigger_id, e);
            return;
        }
    };
    let Some(config) = trigger.scheduled_config() else {
        warn!("trigger {} is no longer a scheduled trigger", trigger_id);
        return;
    };

    match manager.is_running(&trigger.agent_id).await {
        Ok(true) => {}
        Ok(false) => {
            info!(
                "skipping scheduled fire for agent {}: {} bot not running",
                trigger.agent_id,
                manager.kind()
            );
            return;
        }
        Err(e) => {
            warn!("could not check bot state for agent {}: {}", trigger.agent_id, e);
            return;
        }
    }

    let reply = match generator.generate_system(&trigger.agent_id, &config.message).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("scheduled generation failed for agent {}: {}", trigger.agent_id, e);
            return;
        }
    };

    if let Err(e) = manager.send_message_to_channel(&trigger.agent_id, &reply).await {
        warn!("scheduled delivery failed for agent {}: {}", trigger.agent_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{AdapterFactory, BotKind, ChannelAdapter, ChannelError};
    use crate::core::status::BotStatusRepo;
    use crate::core::triggers::TriggerConfig;
    use crate::core::vault::SecretsVault;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn five_field_cron_gains_a_seconds_column() {
        assert_eq!(normalize_cron("0 9 * * *").unwrap(), "0 0 9 * * *");
        assert_eq!(normalize_cron("  */5 * * * *  ").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(normalize_cron("30 0 9 * * *").unwrap(), "30 0 9 * * *");
    }

    #[test]
    fn wrong_field_counts_are_rejected() {
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("").is_err());
    }

    struct StubAdapter {
        sent: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelAdapter for StubAdapter {
        fn kind(&self) -> BotKind {
            BotKind::Telegram
        }
        async fn connect(&self, _agent_id: &str) -> Result<oneshot::Receiver<ChannelError>, ChannelError> {
            let (tx, rx) = oneshot::channel();
            std::mem::forget(tx);
            Ok(rx)
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn send_direct_message(&self, destination: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), text.to_string()));
            Ok(())
        }
        async fn update_secrets(&self, _secrets: HashMap<String, String>) {}
        fn is_connected(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct StubFactory {
        created: std::sync::Mutex<Vec<Arc<StubAdapter>>>,
    }

    impl AdapterFactory for StubFactory {
        fn create(&self) -> Arc<dyn ChannelAdapter> {
            let adapter = Arc::new(StubAdapter {
                sent: std::sync::Mutex::new(Vec::new()),
            });
            self.created.lock().unwrap().push(adapter.clone());
            adapter
        }
    }

    struct StubGenerator {
        user_calls: AtomicUsize,
        system_calls: AtomicUsize,
        reply: Result<String, String>,
    }

    impl StubGenerator {
        fn new(reply: Result<String, String>) -> Self {
            Self {
                user_calls: AtomicUsize::new(0),
                system_calls: AtomicUsize::new(0),
                reply,
            }
        }

        fn answer(&self) -> Result<String> {
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(msg) => Err(anyhow!("{msg}")),
            }
        }
    }

    #[async_trait]
    impl MessageGenerator for StubGenerator {
        async fn generate(&self, _agent_id: &str, _content: &str) -> Result<String> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            self.answer()
        }

        async fn generate_system(&self, _agent_id: &str, _content: &str) -> Result<String> {
            self.system_calls.fetch_add(1, Ordering::SeqCst);
            self.answer()
        }
    }

    struct Fixture {
        manager: Arc<BotManager>,
        factory: Arc<StubFactory>,
        triggers: TriggerRepo,
        vault: SecretsVault,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().expect("db")));
        let statuses = BotStatusRepo::new(db.clone());
        statuses.initialize().await.unwrap();
        let triggers = TriggerRepo::new(db.clone());
        triggers.initialize().await.unwrap();
        let vault = SecretsVault::new(db, Some([9u8; 32]));
        vault.initialize().await.unwrap();

        let factory = Arc::new(StubFactory::default());
        let manager = Arc::new(BotManager::new(
            BotKind::Telegram,
            factory.clone(),
            statuses,
            triggers.clone(),
            vault.clone(),
        ));
        Fixture { manager, factory, triggers, vault }
    }

    async fn insert_scheduled(fx: &Fixture, agent_id: &str, enabled: bool) -> String {
        let config = TriggerConfig::parse(
            TriggerKind::Scheduled,
            &json!({
                "schedule": "0 9 * * *",
                "message": "what is on today?",
                "destination_secret": "TELEGRAM_MAIN_CHAT_ID",
                "secrets": { "TELEGRAM_MAIN_CHAT_ID": "TELEGRAM_MAIN_CHAT_ID" }
            }),
        )
        .unwrap();
        fx.triggers
            .upsert(None, agent_id, TriggerKind::Scheduled, enabled, &config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fire_skips_when_bot_is_not_running() {
        let fx = fixture().await;
        let id = insert_scheduled(&fx, "agent-1", true).await;
        let generator = StubGenerator::new(Ok("hello".to_string()));

        fire_trigger(&fx.manager, &generator, &fx.triggers, &id).await;
        assert_eq!(generator.system_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fire_rechecks_enabled_flag_at_fire_time() {
        let fx = fixture().await;
        let id = insert_scheduled(&fx, "agent-1", false).await;
        fx.manager.start("agent-1").await;
        let generator = StubGenerator::new(Ok("hello".to_string()));

        fire_trigger(&fx.manager, &generator, &fx.triggers, &id).await;
        assert_eq!(generator.system_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fire_generates_and_delivers() {
        let fx = fixture().await;
        let id = insert_scheduled(&fx, "agent-1", true).await;
        fx.vault
            .set_secret("agent-1", "TELEGRAM_MAIN_CHAT_ID", "-100555")
            .await
            .unwrap();
        fx.manager.start("agent-1").await;
        let generator = StubGenerator::new(Ok("today: standup at 9".to_string()));

        fire_trigger(&fx.manager, &generator, &fx.triggers, &id).await;

        // Scheduled prompts go to the agent as system messages, never as
        // user input.
        assert_eq!(generator.system_calls.load(Ordering::SeqCst), 1);
        assert_eq!(generator.user_calls.load(Ordering::SeqCst), 0);
        let adapter = fx.factory.created.lock().unwrap()[0].clone();
        let sent = adapter.sent.lock().unwrap();
        assert_eq!(
            sent.as_slice(),
            &[("-100555".to_string(), "today: standup at 9".to_string())]
        );
    }

    #[tokio::test]
    async fn generation_failure_is_contained() {
        let fx = fixture().await;
        let id = insert_scheduled(&fx, "agent-1", true).await;
        fx.manager.start("agent-1").await;
        let generator = StubGenerator::new(Err("model offline".to_string()));

        // Must not panic or propagate; nothing gets delivered.
        fire_trigger(&fx.manager, &generator, &fx.triggers, &id).await;
        let adapter = fx.factory.created.lock().unwrap()[0].clone();
        assert!(adapter.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_trigger_replaces_existing_job() {
        let fx = fixture().await;
        let id = insert_scheduled(&fx, "agent-1", true).await;
        let generator = Arc::new(StubGenerator::new(Ok("hi".to_string())));
        let engine = ScheduleEngine::new(fx.manager.clone(), generator, fx.triggers.clone())
            .await
            .unwrap();

        engine.add_trigger(&id).await.unwrap();
        engine.add_trigger(&id).await.unwrap();
        assert_eq!(engine.scheduled_trigger_ids().await, vec![id.clone()]);

        engine.remove_trigger(&id).await.unwrap();
        assert!(engine.scheduled_trigger_ids().await.is_empty());
    }
}
