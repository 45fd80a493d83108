use crate::core::status::BotRecord;
use crate::core::triggers::Trigger;
use std::collections::HashSet;

/// Pick which agents to restart after a crash or restart.
///
/// The durable status table remembers who was running, but a record alone is
/// not enough: the trigger may have been disabled or deleted in the meantime.
/// Restart only the intersection of believed-running agents and currently
/// enabled triggers, preserving the order of the status records.
pub fn plan_recovery(believed_running: &[BotRecord], enabled: &[Trigger]) -> Vec<String> {
    let enabled_agents: HashSet<&str> = enabled.iter().map(|t| t.agent_id.as_str()).collect();
    let mut seen = HashSet::new();
    believed_running
        .iter()
        .filter(|r| enabled_agents.contains(r.agent_id.as_str()))
        .filter(|r| seen.insert(r.agent_id.clone()))
        .map(|r| r.agent_id.clone())
        .collect()
}
