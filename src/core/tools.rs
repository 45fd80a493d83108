use crate::core::letta::LettaClient;
use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Tracks which server-side tools have been attached to which agents, so
/// repeat attach requests become cheap no-ops instead of redundant API
/// round trips.
pub struct ToolAttachmentManager {
    letta: Arc<LettaClient>,
    attached: Mutex<HashSet<(String, String)>>,
}

impl ToolAttachmentManager {
    pub fn new(letta: Arc<LettaClient>) -> Self {
        Self {
            letta,
            attached: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a tool by name. Returns true when an attach call was actually
    /// made, false when the pair was already attached in this process.
    pub async fn attach(&self, agent_id: &str, tool_name: &str) -> Result<bool> {
        let key = (agent_id.to_string(), tool_name.to_string());
        if self.attached.lock().await.contains(&key) {
            return Ok(false);
        }

        let tool_id = self
            .letta
            .find_tool_id(tool_name)
            .await?
            .ok_or_else(|| anyhow!("tool '{tool_name}' not found on the agent server"))?;
        self.letta.attach_tool(agent_id, &tool_id).await?;

        self.attached.lock().await.insert(key);
        info!("attached tool '{}' to agent {}", tool_name, agent_id);
        Ok(true)
    }

    pub async fn detach(&self, agent_id: &str, tool_name: &str) -> Result<()> {
        let tool_id = self
            .letta
            .find_tool_id(tool_name)
            .await?
            .ok_or_else(|| anyhow!("tool '{tool_name}' not found on the agent server"))?;
        self.letta.detach_tool(agent_id, &tool_id).await?;

        self.attached
            .lock()
            .await
            .remove(&(agent_id.to_string(), tool_name.to_string()));
        info!("detached tool '{}' from agent {}", tool_name, agent_id);
        Ok(())
    }

    /// True when this process has successfully attached the tool and not
    /// detached it since.
    pub async fn is_attached(&self, agent_id: &str, tool_name: &str) -> bool {
        self.attached
            .lock()
            .await
            .contains(&(agent_id.to_string(), tool_name.to_string()))
    }
}
