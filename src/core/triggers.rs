use anyhow::{Result, anyhow};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// What a trigger reacts to: an inbound chat channel or a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Telegram,
    Discord,
    Scheduled,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Telegram => "telegram",
            TriggerKind::Discord => "discord",
            TriggerKind::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(TriggerKind::Telegram),
            "discord" => Some(TriggerKind::Discord),
            "scheduled" => Some(TriggerKind::Scheduled),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional LLM-evaluated gate for generic group messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShouldAnswerRule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub instruction: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelTriggerConfig {
    /// Logical secret name -> vault key. By convention the two are often the
    /// same string.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_answer: Option<ShouldAnswerRule>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTriggerConfig {
    /// Cron expression, node-style five fields or six with a seconds column.
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Message sent to the agent on each fire; the agent's reply is what gets
    /// delivered to the channel.
    pub message: String,
    /// Logical secret name holding the delivery destination (chat/channel id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_secret: Option<String>,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Trigger configuration, parsed once at the repository boundary instead of
/// re-validated at every consumption site.
#[derive(Debug, Clone)]
pub enum TriggerConfig {
    Channel(ChannelTriggerConfig),
    Scheduled(ScheduledTriggerConfig),
}

impl TriggerConfig {
    pub fn parse(kind: TriggerKind, raw: &serde_json::Value) -> Result<Self> {
        match kind {
            TriggerKind::Telegram | TriggerKind::Discord => {
                let config: ChannelTriggerConfig = serde_json::from_value(raw.clone())
                    .map_err(|e| anyhow!("invalid {kind} trigger config: {e}"))?;
                Ok(TriggerConfig::Channel(config))
            }
            TriggerKind::Scheduled => {
                let config: ScheduledTriggerConfig = serde_json::from_value(raw.clone())
                    .map_err(|e| anyhow!("invalid scheduled trigger config: {e}"))?;
                if config.schedule.trim().is_empty() {
                    return Err(anyhow!("scheduled trigger config has an empty schedule"));
                }
                Ok(TriggerConfig::Scheduled(config))
            }
        }
    }

    pub fn secrets(&self) -> &HashMap<String, String> {
        match self {
            TriggerConfig::Channel(c) => &c.secrets,
            TriggerConfig::Scheduled(c) => &c.secrets,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            TriggerConfig::Channel(c) => serde_json::to_value(c)?,
            TriggerConfig::Scheduled(c) => serde_json::to_value(c)?,
        };
        Ok(value)
    }

    fn to_json(&self) -> Result<String> {
        Ok(self.to_value()?.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: String,
    pub agent_id: String,
    pub kind: TriggerKind,
    pub enabled: bool,
    pub config: TriggerConfig,
    pub created_at: String,
    pub updated_at: String,
}

impl Trigger {
    pub fn channel_config(&self) -> Option<&ChannelTriggerConfig> {
        match &self.config {
            TriggerConfig::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn scheduled_config(&self) -> Option<&ScheduledTriggerConfig> {
        match &self.config {
            TriggerConfig::Scheduled(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct TriggerRepo {
    db: Arc<Mutex<Connection>>,
}

impl TriggerRepo {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;
        Ok(())
    }

    /// Update-in-place when an id is given, otherwise insert with a fresh id.
    /// Returns the trigger id either way.
    pub async fn upsert(
        &self,
        id: Option<&str>,
        agent_id: &str,
        kind: TriggerKind,
        enabled: bool,
        config: &TriggerConfig,
    ) -> Result<String> {
        let config_json = config.to_json()?;
        let db = self.db.lock().await;
        match id {
            Some(id) => {
                let updated = db.execute(
                    "UPDATE triggers SET agent_id = ?1, kind = ?2, enabled = ?3, config = ?4,
                     updated_at = datetime('now') WHERE id = ?5",
                    params![agent_id, kind.as_str(), enabled, config_json, id],
                )?;
                if updated == 0 {
                    return Err(anyhow!("trigger {id} not found"));
                }
                Ok(id.to_string())
            }
            None => {
                let id = Uuid::new_v4().to_string();
                db.execute(
                    "INSERT INTO triggers (id, agent_id, kind, enabled, config) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, agent_id, kind.as_str(), enabled, config_json],
                )?;
                Ok(id)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Trigger>> {
        let rows = self
            .query_rows("SELECT id, agent_id, kind, enabled, config, created_at, updated_at
                         FROM triggers WHERE id = ?1", &[id])
            .await?;
        Ok(parse_rows(rows).into_iter().next())
    }

    pub async fn triggers_for_agent(&self, agent_id: &str) -> Result<Vec<Trigger>> {
        let rows = self
            .query_rows(
                "SELECT id, agent_id, kind, enabled, config, created_at, updated_at
                 FROM triggers WHERE agent_id = ?1 ORDER BY created_at",
                &[agent_id],
            )
            .await?;
        Ok(parse_rows(rows))
    }

    /// First matching trigger of the given kind for an agent. Uniqueness per
    /// (agent, kind) is a caller convention, not a schema constraint.
    pub async fn find_for_agent(&self, agent_id: &str, kind: TriggerKind) -> Result<Option<Trigger>> {
        let rows = self
            .query_rows(
                "SELECT id, agent_id, kind, enabled, config, created_at, updated_at
                 FROM triggers WHERE agent_id = ?1 AND kind = ?2 ORDER BY created_at LIMIT 1",
                &[agent_id, kind.as_str()],
            )
            .await?;
        Ok(parse_rows(rows).into_iter().next())
    }

    pub async fn list_enabled(&self, kind: TriggerKind) -> Result<Vec<Trigger>> {
        let rows = self
            .query_rows(
                "SELECT id, agent_id, kind, enabled, config, created_at, updated_at
                 FROM triggers WHERE kind = ?1 AND enabled = 1 ORDER BY created_at",
                &[kind.as_str()],
            )
            .await?;
        Ok(parse_rows(rows))
    }

    pub async fn list_all(&self, kind: TriggerKind) -> Result<Vec<Trigger>> {
        let rows = self
            .query_rows(
                "SELECT id, agent_id, kind, enabled, config, created_at, updated_at
                 FROM triggers WHERE kind = ?1 ORDER BY created_at",
                &[kind.as_str()],
            )
            .await?;
        Ok(parse_rows(rows))
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM triggers WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    async fn query_rows(&self, sql: &str, args: &[&str]) -> Result<Vec<RawTriggerRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
            Ok(RawTriggerRow {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                kind: row.get(2)?,
                enabled: row.get(3)?,
                config: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

struct RawTriggerRow {
    id: String,
    agent_id: String,
    kind: String,
    enabled: bool,
    config: String,
    created_at: String,
    updated_at: String,
}

/// Rows that fail kind/config validation are skipped with a warning so one
/// bad record cannot poison every listing.
fn parse_rows(rows: Vec<RawTriggerRow>) -> Vec<Trigger> {
    let mut out = Vec::new();
    for row in rows {
        let Some(kind) = TriggerKind::parse(&row.kind) else {
            warn!("skipping trigger {} with unknown kind '{}'", row.id, row.kind);
            continue;
        };
        let raw = match serde_json::from_str::<serde_json::Value>(&row.config) {
            Ok(value) => value,
            Err(e) => {
                warn!("skipping trigger {} with unreadable config: {}", row.id, e);
                continue;
            }
        };
        let config = match TriggerConfig::parse(kind, &raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("skipping trigger {}: {}", row.id, e);
                continue;
            }
        };
        out.push(Trigger {
            id: row.id,
            agent_id: row.agent_id,
            kind,
            enabled: row.enabled,
            config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_repo() -> TriggerRepo {
        let db = Connection::open_in_memory().expect("in-memory db");
        let repo = TriggerRepo::new(Arc::new(Mutex::new(db)));
        repo.initialize().await.expect("init trigger tables");
        repo
    }

    fn telegram_config() -> TriggerConfig {
        TriggerConfig::parse(
            TriggerKind::Telegram,
            &json!({ "secrets": { "TELEGRAM_BOT_TOKEN": "TELEGRAM_BOT_TOKEN" } }),
        )
        .unwrap()
    }

    fn scheduled_config() -> TriggerConfig {
        TriggerConfig::parse(
            TriggerKind::Scheduled,
            &json!({
                "schedule": "0 9 * * *",
                "timezone": "Europe/Paris",
                "message": "good morning",
                "destination_secret": "TELEGRAM_MAIN_CHAT_ID",
                "secrets": { "TELEGRAM_MAIN_CHAT_ID": "TELEGRAM_MAIN_CHAT_ID" }
            }),
        )
        .unwrap()
    }

    #[test]
    fn scheduled_config_requires_schedule() {
        let err = TriggerConfig::parse(
            TriggerKind::Scheduled,
            &json!({ "schedule": "  ", "message": "hi" }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn scheduled_config_defaults_timezone_to_utc() {
        let config = TriggerConfig::parse(
            TriggerKind::Scheduled,
            &json!({ "schedule": "0 9 * * *", "message": "hi" }),
        )
        .unwrap();
        match config {
            TriggerConfig::Scheduled(c) => assert_eq!(c.timezone, "UTC"),
            _ => panic!("expected scheduled config"),
        }
    }

    #[test]
    fn channel_config_rejects_wrong_shape() {
        let err = TriggerConfig::parse(TriggerKind::Telegram, &json!({ "secrets": "nope" }));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_in_place() {
        let repo = test_repo().await;
        let id = repo
            .upsert(None, "agent-1", TriggerKind::Telegram, true, &telegram_config())
            .await
            .unwrap();

        let same_id = repo
            .upsert(Some(&id), "agent-1", TriggerKind::Telegram, false, &telegram_config())
            .await
            .unwrap();
        assert_eq!(id, same_id);

        let trigger = repo.get(&id).await.unwrap().unwrap();
        assert!(!trigger.enabled);
    }

    #[tokio::test]
    async fn upsert_with_unknown_id_fails() {
        let repo = test_repo().await;
        let err = repo
            .upsert(Some("missing"), "agent-1", TriggerKind::Telegram, true, &telegram_config())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn find_for_agent_returns_first_match() {
        let repo = test_repo().await;
        repo.upsert(None, "agent-1", TriggerKind::Telegram, true, &telegram_config())
            .await
            .unwrap();
        repo.upsert(None, "agent-1", TriggerKind::Scheduled, true, &scheduled_config())
            .await
            .unwrap();

        let found = repo
            .find_for_agent("agent-1", TriggerKind::Scheduled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.kind, TriggerKind::Scheduled);
        assert!(found.scheduled_config().is_some());

        assert!(
            repo.find_for_agent("agent-2", TriggerKind::Telegram)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_enabled_filters_disabled_triggers() {
        let repo = test_repo().await;
        repo.upsert(None, "agent-1", TriggerKind::Scheduled, true, &scheduled_config())
            .await
            .unwrap();
        repo.upsert(None, "agent-2", TriggerKind::Scheduled, false, &scheduled_config())
            .await
            .unwrap();

        let enabled = repo.list_enabled(TriggerKind::Scheduled).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].agent_id, "agent-1");

        let all = repo.list_all(TriggerKind::Scheduled).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_config_rows_are_skipped_on_read() {
        let repo = test_repo().await;
        repo.upsert(None, "agent-1", TriggerKind::Telegram, true, &telegram_config())
            .await
            .unwrap();
        {
            let db = repo.db.lock().await;
            db.execute(
                "INSERT INTO triggers (id, agent_id, kind, enabled, config)
                 VALUES ('bad', 'agent-1', 'scheduled', 1, 'not json')",
                [],
            )
            .unwrap();
        }

        let triggers = repo.triggers_for_agent("agent-1").await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].kind, TriggerKind::Telegram);
    }

    #[tokio::test]
    async fn delete_removes_trigger() {
        let repo = test_repo().await;
        let id = repo
            .upsert(None, "agent-1", TriggerKind::Telegram, true, &telegram_config())
            .await
            .unwrap();
        assert!(repo.delete(&id).await.unwrap());
        assert!(!repo.delete(&id).await.unwrap());
        assert!(repo.get(&id).await.unwrap().is_none());
    }
}
