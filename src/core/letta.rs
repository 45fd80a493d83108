use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

/// Produces an agent reply for a piece of inbound text. Channel adapters and
/// the schedule engine talk to this trait so tests can swap in a canned
/// generator.
#[async_trait]
pub trait MessageGenerator: Send + Sync {
    /// Generate a reply to a user message.
    async fn generate(&self, agent_id: &str, content: &str) -> Result<String>;
    /// Generate a reply to a system-originated prompt, such as a scheduled
    /// trigger firing. The agent sees this as a system message, not user input.
    async fn generate_system(&self, agent_id: &str, content: &str) -> Result<String>;
}

/// HTTP client for the Letta agent server. Messages go through the streaming
/// endpoint; the assistant text is assembled from the SSE events.
pub struct LettaClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl LettaClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Send a user message to an agent and return the concatenated assistant
    /// reply.
    pub async fn send_message(&self, agent_id: &str, content: &str) -> Result<String> {
        self.send_with_role(agent_id, "user", content).await
    }

    /// Send a system message. Scheduled prompts use this so the agent can
    /// distinguish them from real user input.
    pub async fn send_system_message(&self, agent_id: &str, content: &str) -> Result<String> {
        self.send_with_role(agent_id, "system", content).await
    }

    async fn send_with_role(&self, agent_id: &str, role: &str, content: &str) -> Result<String> {
        let body = message_body(role, content);

        let mut response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/agents/{agent_id}/messages/stream"),
            )
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .context("could not reach agent server")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("agent server returned {status}: {detail}"));
        }

        let mut sse = SseBuffer::default();
        let mut reply = String::new();
        while let Some(chunk) = response.chunk().await? {
            for event in sse.push(&chunk) {
                if let Some(text) = assistant_text(&event) {
                    reply.push_str(&text);
                }
            }
        }
        for event in sse.finish() {
            if let Some(text) = assistant_text(&event) {
                reply.push_str(&text);
            }
        }

        debug!("agent {} replied with {} chars", agent_id, reply.len());
        if reply.is_empty() {
            return Err(anyhow!("agent {agent_id} produced no assistant message"));
        }
        Ok(reply)
    }

    pub async fn read_memory_block(&self, agent_id: &str, label: &str) -> Result<Option<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/agents/{agent_id}/core-memory/blocks/{label}"),
            )
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("memory block read failed: {}", response.status()));
        }
        let body: Value = response.json().await?;
        Ok(body.get("value").and_then(Value::as_str).map(String::from))
    }

    pub async fn write_memory_block(&self, agent_id: &str, label: &str, value: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/v1/agents/{agent_id}/core-memory/blocks/{label}"),
            )
            .json(&json!({ "value": value }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("memory block write failed: {}", response.status()));
        }
        Ok(())
    }

    pub async fn find_tool_id(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/tools/?name={name}"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("tool lookup failed: {}", response.status()));
        }
        let tools: Vec<Value> = response.json().await?;
        Ok(tools
            .iter()
            .find(|t| t.get("name").and_then(Value::as_str) == Some(name))
            .and_then(|t| t.get("id").and_then(Value::as_str))
            .map(String::from))
    }

    pub async fn attach_tool(&self, agent_id: &str, tool_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/v1/agents/{agent_id}/tools/attach/{tool_id}"),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("tool attach failed: {}", response.status()));
        }
        Ok(())
    }

    pub async fn detach_tool(&self, agent_id: &str, tool_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/v1/agents/{agent_id}/tools/detach/{tool_id}"),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("tool detach failed: {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageGenerator for LettaClient {
    async fn generate(&self, agent_id: &str, content: &str) -> Result<String> {
        self.send_message(agent_id, content).await
    }

    async fn generate_system(&self, agent_id: &str, content: &str) -> Result<String> {
        self.send_system_message(agent_id, content).await
    }
}

fn message_body(role: &str, content: &str) -> Value {
    json!({
        "messages": [{ "role": role, "content": content }],
        "stream_tokens": false,
    })
}

/// Incremental SSE decoder. Network chunks can split lines anywhere, so
/// bytes are buffered until a newline and only complete `data:` lines yield
/// events.
#[derive(Default)]
struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            if let Some(event) = parse_data_line(line.trim_end()) {
                events.push(event);
            }
        }
        events
    }

    fn finish(self) -> Vec<Value> {
        parse_data_line(self.pending.trim_end()).into_iter().collect()
    }
}

fn parse_data_line(line: &str) -> Option<Value> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    serde_json::from_str(payload).ok()
}

/// Pull assistant-visible text out of one stream event. Content arrives
/// either as a plain string or as a list of typed parts.
fn assistant_text(event: &Value) -> Option<String> {
    if event.get("message_type").and_then(Value::as_str) != Some("assistant_message") {
        return None;
    }
    match event.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() { None } else { Some(text) }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_body_carries_the_requested_role() {
        let user = message_body("user", "hello");
        assert_eq!(user["messages"][0]["role"], "user");
        assert_eq!(user["messages"][0]["content"], "hello");
        let system = message_body("system", "fire the morning report");
        assert_eq!(system["messages"][0]["role"], "system");
        assert_eq!(system["stream_tokens"], false);
    }

    #[test]
    fn data_lines_yield_events_and_done_is_skipped() {
        assert!(parse_data_line("data: [DONE]").is_none());
        assert!(parse_data_line(": keep-alive comment").is_none());
        let event = parse_data_line(r#"data: {"message_type":"assistant_message","content":"hi"}"#)
            .expect("event");
        assert_eq!(assistant_text(&event).as_deref(), Some("hi"));
    }

    #[test]
    fn non_assistant_events_produce_no_text() {
        let event: Value = serde_json::from_str(
            r#"{"message_type":"reasoning_message","reasoning":"thinking"}"#,
        )
        .unwrap();
        assert!(assistant_text(&event).is_none());
    }

    #[test]
    fn content_part_lists_are_concatenated() {
        let event: Value = serde_json::from_str(
            r#"{"message_type":"assistant_message","content":[
                {"type":"text","text":"hello "},
                {"type":"text","text":"world"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(assistant_text(&event).as_deref(), Some("hello world"));
    }

    #[test]
    fn buffer_reassembles_lines_split_across_chunks() {
        let mut sse = SseBuffer::default();
        let first = sse.push(b"data: {\"message_type\":\"assistant_mes");
        assert!(first.is_empty());
        let second = sse.push(b"sage\",\"content\":\"split\"}\n\ndata: {\"message_type\":\"assistant_message\",\"content\":\"whole\"}\n");
        let texts: Vec<_> = second.iter().filter_map(assistant_text).collect();
        assert_eq!(texts, vec!["split", "whole"]);
    }

    #[test]
    fn finish_flushes_a_trailing_unterminated_line() {
        let mut sse = SseBuffer::default();
        sse.push(b"data: {\"message_type\":\"assistant_message\",\"content\":\"tail\"}");
        let events = sse.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(assistant_text(&events[0]).as_deref(), Some("tail"));
    }
}
