use crate::core::channel::BotKind;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Durable lifecycle state for one (agent, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Running,
    Stopped,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Running => "running",
            BotStatus::Stopped => "stopped",
            BotStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BotStatus::Running),
            "stopped" => Some(BotStatus::Stopped),
            "error" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BotRecord {
    pub agent_id: String,
    pub kind: BotKind,
    pub status: BotStatus,
    pub last_started: Option<String>,
    pub last_stopped: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: String,
}

/// Crash-surviving record of which bots were running, keyed by
/// (agent_id, kind). The in-memory adapter map is the other half of the
/// truth; the manager reconciles the two.
#[derive(Clone)]
pub struct BotStatusRepo {
    db: Arc<Mutex<Connection>>,
}

impl BotStatusRepo {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn initialize(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS bots (
                agent_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                last_started TEXT,
                last_stopped TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (agent_id, kind)
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn mark_running(&self, agent_id: &str, kind: BotKind) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO bots (agent_id, kind, status, last_started, error_message)
             VALUES (?1, ?2, 'running', datetime('now'), NULL)
             ON CONFLICT(agent_id, kind) DO UPDATE SET
                status = 'running',
                last_started = datetime('now'),
                error_message = NULL,
                updated_at = datetime('now')",
            params![agent_id, kind.as_str()],
        )?;
        Ok(())
    }

    pub async fn mark_stopped(&self, agent_id: &str, kind: BotKind) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO bots (agent_id, kind, status, last_stopped)
             VALUES (?1, ?2, 'stopped', datetime('now'))
             ON CONFLICT(agent_id, kind) DO UPDATE SET
                status = 'stopped',
                last_stopped = datetime('now'),
                updated_at = datetime('now')",
            params![agent_id, kind.as_str()],
        )?;
        Ok(())
    }

    pub async fn mark_error(&self, agent_id: &str, kind: BotKind, message: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO bots (agent_id, kind, status, error_message)
             VALUES (?1, ?2, 'error', ?3)
             ON CONFLICT(agent_id, kind) DO UPDATE SET
                status = 'error',
                error_message = ?3,
                updated_at = datetime('now')",
            params![agent_id, kind.as_str(), message],
        )?;
        Ok(())
    }

    pub async fn get(&self, agent_id: &str, kind: BotKind) -> Result<Option<BotRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                "SELECT agent_id, kind, status, last_started, last_stopped, error_message, updated_at
                 FROM bots WHERE agent_id = ?1 AND kind = ?2",
                params![agent_id, kind.as_str()],
                row_to_record,
            )
            .optional()?;
        Ok(record.flatten())
    }

    pub async fn list_by_status(&self, status: BotStatus, kind: BotKind) -> Result<Vec<BotRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_id, kind, status, last_started, last_stopped, error_message, updated_at
             FROM bots WHERE status = ?1 AND kind = ?2 ORDER BY agent_id",
        )?;
        let rows = stmt.query_map(params![status.as_str(), kind.as_str()], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(record) = row? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<BotRecord>> {
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let (Some(kind), Some(status)) = (BotKind::parse(&kind), BotStatus::parse(&status)) else {
        return Ok(None);
    };
    Ok(Some(BotRecord {
        agent_id: row.get(0)?,
        kind,
        status,
        last_started: row.get(3)?,
        last_stopped: row.get(4)?,
        error_message: row.get(5)?,
        updated_at: row.get(6)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> BotStatusRepo {
        let db = Connection::open_in_memory().expect("in-memory db");
        let repo = BotStatusRepo::new(Arc::new(Mutex::new(db)));
        repo.initialize().await.expect("init bot tables");
        repo
    }

    #[tokio::test]
    async fn mark_running_upserts_and_clears_error() {
        let repo = test_repo().await;
        repo.mark_error("agent-1", BotKind::Telegram, "token revoked")
            .await
            .unwrap();
        repo.mark_running("agent-1", BotKind::Telegram).await.unwrap();

        let record = repo.get("agent-1", BotKind::Telegram).await.unwrap().unwrap();
        assert_eq!(record.status, BotStatus::Running);
        assert!(record.error_message.is_none());
        assert!(record.last_started.is_some());
    }

    #[tokio::test]
    async fn mark_stopped_keeps_last_started() {
        let repo = test_repo().await;
        repo.mark_running("agent-1", BotKind::Telegram).await.unwrap();
        repo.mark_stopped("agent-1", BotKind::Telegram).await.unwrap();

        let record = repo.get("agent-1", BotKind::Telegram).await.unwrap().unwrap();
        assert_eq!(record.status, BotStatus::Stopped);
        assert!(record.last_started.is_some());
        assert!(record.last_stopped.is_some());
    }

    #[tokio::test]
    async fn error_message_survives_until_next_run() {
        let repo = test_repo().await;
        repo.mark_error("agent-1", BotKind::Discord, "409 conflict")
            .await
            .unwrap();
        let record = repo.get("agent-1", BotKind::Discord).await.unwrap().unwrap();
        assert_eq!(record.status, BotStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("409 conflict"));
    }

    #[tokio::test]
    async fn list_by_status_filters_on_kind_too() {
        let repo = test_repo().await;
        repo.mark_running("agent-1", BotKind::Telegram).await.unwrap();
        repo.mark_running("agent-2", BotKind::Telegram).await.unwrap();
        repo.mark_running("agent-3", BotKind::Discord).await.unwrap();
        repo.mark_stopped("agent-2", BotKind::Telegram).await.unwrap();

        let running = repo
            .list_by_status(BotStatus::Running, BotKind::Telegram)
            .await
            .unwrap();
        let ids: Vec<_> = running.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["agent-1"]);
    }

    #[tokio::test]
    async fn records_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.db");
        {
            let repo = BotStatusRepo::new(Arc::new(Mutex::new(Connection::open(&path).unwrap())));
            repo.initialize().await.unwrap();
            repo.mark_running("agent-1", BotKind::Telegram).await.unwrap();
        }

        let repo = BotStatusRepo::new(Arc::new(Mutex::new(Connection::open(&path).unwrap())));
        repo.initialize().await.unwrap();
        let record = repo.get("agent-1", BotKind::Telegram).await.unwrap().unwrap();
        assert_eq!(record.status, BotStatus::Running);
    }

    #[tokio::test]
    async fn records_are_scoped_per_kind() {
        let repo = test_repo().await;
        repo.mark_running("agent-1", BotKind::Telegram).await.unwrap();
        assert!(repo.get("agent-1", BotKind::Discord).await.unwrap().is_none());
    }
}
