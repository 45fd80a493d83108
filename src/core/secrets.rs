use crate::core::triggers::Trigger;
use crate::core::vault::SecretsVault;
use anyhow::Result;
use std::collections::HashMap;
use tracing::warn;

/// Resolve a trigger's declared secrets against the vault, keyed by the
/// logical name the trigger uses.
///
/// Missing vault entries are tolerated here: callers decide which names are
/// required and fail on absence themselves, so one unset optional secret
/// does not block a bot whose token is present.
pub async fn resolve_trigger_secrets(
    vault: &SecretsVault,
    trigger: &Trigger,
) -> Result<HashMap<String, String>> {
    let mut resolved = HashMap::new();
    for (name, vault_key) in trigger.config.secrets() {
        match vault.get_secret(&trigger.agent_id, vault_key).await? {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => {
                warn!(
                    "secret '{}' (vault key '{}') not set for agent {}",
                    name, vault_key, trigger.agent_id
                );
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triggers::{TriggerConfig, TriggerKind, TriggerRepo};
    use rusqlite::Connection;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    async fn fixtures() -> (SecretsVault, TriggerRepo) {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().expect("db")));
        let vault = SecretsVault::new(db.clone(), Some([7u8; 32]));
        vault.initialize().await.expect("vault init");
        let triggers = TriggerRepo::new(db);
        triggers.initialize().await.expect("trigger init");
        (vault, triggers)
    }

    async fn insert_trigger(triggers: &TriggerRepo, agent_id: &str) -> Trigger {
        let config = TriggerConfig::parse(
            TriggerKind::Telegram,
            &json!({
                "secrets": {
                    "TELEGRAM_BOT_TOKEN": "TELEGRAM_BOT_TOKEN",
                    "TELEGRAM_MAIN_CHAT_ID": "TELEGRAM_MAIN_CHAT_ID"
                }
            }),
        )
        .unwrap();
        let id = triggers
            .upsert(None, agent_id, TriggerKind::Telegram, true, &config)
            .await
            .unwrap();
        triggers.get(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn resolves_present_secrets_and_skips_missing() {
        let (vault, triggers) = fixtures().await;
        vault
            .set_secret("agent-1", "TELEGRAM_BOT_TOKEN", "123:abc")
            .await
            .unwrap();
        let trigger = insert_trigger(&triggers, "agent-1").await;

        let resolved = resolve_trigger_secrets(&vault, &trigger).await.unwrap();
        assert_eq!(resolved.get("TELEGRAM_BOT_TOKEN").map(String::as_str), Some("123:abc"));
        assert!(!resolved.contains_key("TELEGRAM_MAIN_CHAT_ID"));
    }

    #[tokio::test]
    async fn does_not_leak_other_agents_secrets() {
        let (vault, triggers) = fixtures().await;
        vault
            .set_secret("agent-2", "TELEGRAM_BOT_TOKEN", "456:def")
            .await
            .unwrap();
        let trigger = insert_trigger(&triggers, "agent-1").await;

        let resolved = resolve_trigger_secrets(&vault, &trigger).await.unwrap();
        assert!(resolved.is_empty());
    }
}
