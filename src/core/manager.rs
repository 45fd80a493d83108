use crate::core::channel::{AdapterFactory, BotKind, ChannelAdapter};
use crate::core::recovery::plan_recovery;
use crate::core::secrets::resolve_trigger_secrets;
use crate::core::status::{BotStatus, BotStatusRepo};
use crate::core::triggers::{TriggerKind, TriggerRepo};
use crate::core::vault::SecretsVault;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::{error, info, warn};

/// Result of a start attempt. Start never propagates an error to the
/// caller; failures are folded into the outcome so HTTP handlers can
/// report them without a 500.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Failed(String),
}

impl StartOutcome {
    pub fn is_active(&self) -> bool {
        matches!(self, StartOutcome::Started | StartOutcome::AlreadyRunning)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StartOutcome::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Lifecycle owner for all bots on one channel.
///
/// Truth about "running" is split in two: the in-memory adapter map (live
/// connections) and the durable status table (crash-surviving intent). A bot
/// counts as running only when both agree; every mutation updates the map
/// first and the table second.
pub struct BotManager {
    kind: BotKind,
    factory: Arc<dyn AdapterFactory>,
    adapters: Arc<Mutex<HashMap<String, Arc<dyn ChannelAdapter>>>>,
    /// One async mutex per agent serializes check-and-start so two
    /// concurrent requests cannot both connect.
    agent_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    statuses: BotStatusRepo,
    triggers: TriggerRepo,
    vault: SecretsVault,
}

impl BotManager {
    pub fn new(
        kind: BotKind,
        factory: Arc<dyn AdapterFactory>,
        statuses: BotStatusRepo,
        triggers: TriggerRepo,
        vault: SecretsVault,
    ) -> Self {
        Self {
            kind,
            factory,
            adapters: Arc::new(Mutex::new(HashMap::new())),
            agent_locks: Mutex::new(HashMap::new()),
            statuses,
            triggers,
            vault,
        }
    }

    pub fn kind(&self) -> BotKind {
        self.kind
    }

    async fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.agent_locks.lock().await;
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn start(&self, agent_id: &str) -> StartOutcome {
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        if self.adapters.lock().await.contains_key(agent_id) {
            return StartOutcome::AlreadyRunning;
        }

        let adapter = self.factory.create();
        let fatal_rx = match adapter.connect(agent_id).await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = adapter.disconnect().await;
                let message = e.to_string();
                if let Err(db_err) = self.statuses.mark_error(agent_id, self.kind, &message).await {
                    error!("failed to record error status for {}: {}", agent_id, db_err);
                }
                warn!("could not start {} bot for {}: {}", self.kind, agent_id, message);
                return StartOutcome::Failed(message);
            }
        };

        // Map first, table second. A crash between the two leaves the bot
        // running-but-unrecorded, which reconciliation treats as stopped.
        self.adapters
            .lock()
            .await
            .insert(agent_id.to_string(), adapter.clone());

        if let Err(db_err) = self.statuses.mark_running(agent_id, self.kind).await {
            self.adapters.lock().await.remove(agent_id);
            let _ = adapter.disconnect().await;
            let message = format!("could not persist running status: {db_err}");
            if let Err(e) = self.statuses.mark_error(agent_id, self.kind, &message).await {
                error!("failed to record error status for {}: {}", agent_id, e);
            }
            return StartOutcome::Failed(message);
        }

        self.spawn_failure_watchdog(agent_id.to_string(), adapter, fatal_rx);
        info!("started {} bot for agent {}", self.kind, agent_id);
        StartOutcome::Started
    }

    /// Adapters report post-connect death through a one-shot channel; on a
    /// fatal signal we tear the bot down and record the error. A dropped
    /// offer (clean disconnect) ends the task silently.
    fn spawn_failure_watchdog(
        &self,
        agent_id: String,
        adapter: Arc<dyn ChannelAdapter>,
        rx: oneshot::Receiver<crate::core::channel::ChannelError>,
    ) {
        let adapters = self.adapters.clone();
        let statuses = self.statuses.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            let Ok(err) = rx.await else { return };
            warn!("{} bot for agent {} died: {}", kind, agent_id, err);

            let mut map = adapters.lock().await;
            // Only evict the adapter we were watching; a newer start may
            // have replaced it already.
            if map
                .get(&agent_id)
                .is_some_and(|current| Arc::ptr_eq(current, &adapter))
            {
                map.remove(&agent_id);
            }
            drop(map);

            let _ = adapter.disconnect().await;
            if let Err(db_err) = statuses.mark_error(&agent_id, kind, &err.to_string()).await {
                error!("failed to record error status for {}: {}", agent_id, db_err);
            }
        });
    }

    /// Returns whether a live bot was actually torn down. The durable status
    /// moves to stopped regardless, keeping a stale running record from
    /// surviving an explicit stop.
    pub async fn stop(&self, agent_id: &str) -> Result<bool> {
        let lock = self.agent_lock(agent_id).await;
        let _guard = lock.lock().await;

        let removed = self.adapters.lock().await.remove(agent_id);
        let was_running = removed.is_some();

        let mut disconnect_err = None;
        if let Some(adapter) = removed {
            if let Err(e) = adapter.disconnect().await {
                disconnect_err = Some(e);
            }
        }

        if let Err(e) = self.statuses.mark_stopped(agent_id, self.kind).await {
            warn!("failed to persist stopped status for {}: {}", agent_id, e);
            if disconnect_err.is_none() {
                disconnect_err = Some(e);
            }
        }

        match disconnect_err {
            Some(e) => Err(e),
            None => {
                info!("stopped {} bot for agent {}", self.kind, agent_id);
                Ok(was_running)
            }
        }
    }

    /// Running means both halves agree. Disagreement is logged and reported
    /// as not running, so a half-dead bot never looks healthy.
    pub async fn is_running(&self, agent_id: &str) -> Result<bool> {
        let live = self.adapters.lock().await.contains_key(agent_id);
        let recorded = self
            .statuses
            .get(agent_id, self.kind)
            .await?
            .is_some_and(|r| r.status == BotStatus::Running);

        if live != recorded {
            warn!(
                "{} bot state mismatch for agent {}: live={} recorded={}",
                self.kind, agent_id, live, recorded
            );
        }
        Ok(live && recorded)
    }

    pub async fn get_active_agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deliver text to the agent's configured outbound destination. Used by
    /// the schedule engine after the agent has produced a message.
    pub async fn send_message_to_channel(&self, agent_id: &str, text: &str) -> Result<()> {
        if !self.is_running(agent_id).await? {
            return Err(anyhow!("no active {} bot for agent {}", self.kind, agent_id));
        }

        let trigger = self
            .triggers
            .find_for_agent(agent_id, TriggerKind::Scheduled)
            .await?
            .filter(|t| t.enabled)
            .ok_or_else(|| anyhow!("agent {agent_id} has no enabled scheduled trigger"))?;

        let destination_name = trigger
            .scheduled_config()
            .and_then(|c| c.destination_secret.clone())
            .ok_or_else(|| {
                anyhow!("scheduled trigger for agent {agent_id} has no delivery destination configured")
            })?;

        let resolved = resolve_trigger_secrets(&self.vault, &trigger).await?;
        let destination = resolved
            .get(&destination_name)
            .ok_or_else(|| anyhow!("missing required secret '{destination_name}' for agent {agent_id}"))?;

        let adapter = self
            .adapters
            .lock()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| anyhow!("{} bot for agent {} vanished mid-send", self.kind, agent_id))?;

        adapter.send_direct_message(destination, text).await
    }

    /// Push freshly resolved secrets into a live adapter. No-op when the bot
    /// is not running or has no channel trigger; the next start picks the
    /// new values up from the vault anyway.
    pub async fn update_live_secrets(&self, agent_id: &str) -> Result<()> {
        let Some(adapter) = self.adapters.lock().await.get(agent_id).cloned() else {
            return Ok(());
        };
        let Some(trigger) = self
            .triggers
            .find_for_agent(agent_id, self.kind.trigger_kind())
            .await?
        else {
            return Ok(());
        };
        let resolved = resolve_trigger_secrets(&self.vault, &trigger).await?;
        adapter.update_secrets(resolved).await;
        Ok(())
    }

    /// Startup reconciliation: every durable running record is first forced
    /// to stopped, then the ones whose channel trigger is still enabled are
    /// started fresh. Individual start failures are logged, not propagated.
    pub async fn recover(&self) -> Result<()> {
        let believed = self
            .statuses
            .list_by_status(BotStatus::Running, self.kind)
            .await?;
        for record in &believed {
            if let Err(e) = self.statuses.mark_stopped(&record.agent_id, self.kind).await {
                warn!(
                    "could not reset stale status for {} bot {} during recovery: {}",
                    self.kind, record.agent_id, e
                );
            }
        }

        let enabled = self.triggers.list_enabled(self.kind.trigger_kind()).await?;
        let plan = plan_recovery(&believed, &enabled);
        if plan.is_empty() {
            info!("no {} bots to recover", self.kind);
            return Ok(());
        }

        info!("recovering {} {} bot(s)", plan.len(), self.kind);
        for agent_id in plan {
            if let StartOutcome::Failed(msg) = self.start(&agent_id).await {
                warn!("recovery could not restart {} bot for {}: {}", self.kind, agent_id, msg);
            }
        }
        Ok(())
    }
}
