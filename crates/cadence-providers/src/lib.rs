use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cadence_types::RunStatus;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub assistant_id: Option<String>,
    pub default_model: Option<String>,
}

/// Output of one resolved tool call, echoed back to unblock a run that
/// reached `requires_action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// The remote collaborator the poller drives. Implementations own the
/// wire protocol; callers treat every operation as an opaque async call
/// that can fail transiently.
#[async_trait]
pub trait RunBackend: Send + Sync {
    async fn create_thread(&self) -> anyhow::Result<String>;
    async fn add_message(&self, thread_id: &str, content: &str) -> anyhow::Result<String>;
    async fn create_run(
        &self,
        thread_id: &str,
        model_override: Option<&str>,
    ) -> anyhow::Result<String>;
    async fn run_status(&self, thread_id: &str, run_id: &str) -> anyhow::Result<RunStatus>;
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<()>;
    async fn latest_assistant_message(&self, thread_id: &str) -> anyhow::Result<String>;
}

pub type SharedBackend = Arc<dyn RunBackend>;

/// OpenAI-compatible assistants v2 backend.
pub struct AssistantBackend {
    base_url: String,
    api_key: Option<String>,
    assistant_id: String,
    default_model: Option<String>,
    client: Client,
}

impl AssistantBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let assistant_id = config
            .assistant_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .or_else(|| env_value("CADENCE_ASSISTANT_ID"))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "assistant_id is not configured. Set it in config.json or export CADENCE_ASSISTANT_ID."
                )
            })?;

        let api_key = config
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
            .map(|key| key.to_string())
            .or_else(|| env_value("OPENAI_API_KEY"));

        Ok(Self {
            base_url: normalize_base(config.url.as_deref().unwrap_or("https://api.openai.com/v1")),
            api_key,
            assistant_id,
            default_model: config.default_model.clone(),
            client: Client::new(),
        })
    }

    fn post(&self, path: &str, body: &Value) -> reqwest::RequestBuilder {
        self.decorate(self.client.post(format!("{}{path}", self.base_url)))
            .json(body)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.decorate(self.client.get(format!("{}{path}", self.base_url)))
    }

    fn decorate(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req.header("OpenAI-Beta", "assistants=v2");
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> anyhow::Result<Value> {
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_api_error(&value)
                .unwrap_or_else(|| format!("{what} request failed with status {status}"));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_api_error(&value) {
            anyhow::bail!(detail);
        }
        Ok(value)
    }
}

#[async_trait]
impl RunBackend for AssistantBackend {
    async fn create_thread(&self) -> anyhow::Result<String> {
        let value = self.send(self.post("/threads", &json!({})), "thread creation").await?;
        require_id(&value, "thread")
    }

    async fn add_message(&self, thread_id: &str, content: &str) -> anyhow::Result<String> {
        let body = json!({ "role": "user", "content": content });
        let value = self
            .send(
                self.post(&format!("/threads/{thread_id}/messages"), &body),
                "message submission",
            )
            .await?;
        require_id(&value, "message")
    }

    async fn create_run(
        &self,
        thread_id: &str,
        model_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or(self.default_model.as_deref());
        let mut body = json!({ "assistant_id": self.assistant_id });
        if let Some(model) = model {
            body["model"] = json!(model);
        }
        let value = self
            .send(
                self.post(&format!("/threads/{thread_id}/runs"), &body),
                "run creation",
            )
            .await?;
        require_id(&value, "run")
    }

    async fn run_status(&self, thread_id: &str, run_id: &str) -> anyhow::Result<RunStatus> {
        let value = self
            .send(
                self.get(&format!("/threads/{thread_id}/runs/{run_id}")),
                "run status",
            )
            .await?;
        Ok(decode_run_status(&value))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<()> {
        let body = json!({ "tool_outputs": outputs });
        self.send(
            self.post(
                &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                &body,
            ),
            "tool output submission",
        )
        .await?;
        Ok(())
    }

    async fn latest_assistant_message(&self, thread_id: &str) -> anyhow::Result<String> {
        let value = self
            .send(
                self.get(&format!("/threads/{thread_id}/messages?order=desc&limit=10")),
                "message retrieval",
            )
            .await?;
        extract_assistant_text(&value).ok_or_else(|| {
            anyhow::anyhow!(
                "no assistant message found on thread `{}` (response: {})",
                thread_id,
                truncate_for_error(&value.to_string(), 500)
            )
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn require_id(value: &Value, what: &str) -> anyhow::Result<String> {
    value
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "backend returned no {what} id (response: {})",
                truncate_for_error(&value.to_string(), 500)
            )
        })
}

fn decode_run_status(value: &Value) -> RunStatus {
    value
        .get("status")
        .and_then(|v| v.as_str())
        .map(RunStatus::parse)
        .unwrap_or(RunStatus::Unknown)
}

fn extract_api_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Pulls the text of the newest assistant message out of a
/// list-messages response. Content blocks other than `text` are skipped.
fn extract_assistant_text(value: &Value) -> Option<String> {
    let data = value.get("data")?.as_array()?;
    let message = data
        .iter()
        .find(|m| m.get("role").and_then(|v| v.as_str()) == Some("assistant"))?;
    let blocks = message.get("content")?.as_array()?;

    let mut out = String::new();
    for block in blocks {
        if block.get("type").and_then(|v| v.as_str()) != Some("text") {
            continue;
        }
        if let Some(text) = block
            .get("text")
            .and_then(|v| v.get("value"))
            .and_then(|v| v.as_str())
        {
            out.push_str(text);
        }
    }
    if out.trim().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_appends_v1_once() {
        assert_eq!(normalize_base("https://api.openai.com/v1"), "https://api.openai.com/v1");
        assert_eq!(normalize_base("https://api.openai.com/"), "https://api.openai.com/v1");
        assert_eq!(normalize_base("http://localhost:8080"), "http://localhost:8080/v1");
    }

    #[test]
    fn placeholder_api_keys_are_rejected() {
        assert!(is_placeholder_api_key(""));
        assert!(is_placeholder_api_key("  "));
        assert!(is_placeholder_api_key("x"));
        assert!(is_placeholder_api_key("PLACEHOLDER"));
        assert!(!is_placeholder_api_key("sk-real-key"));
    }

    #[test]
    fn decode_run_status_reads_status_field() {
        let value = json!({ "id": "run_1", "status": "in_progress" });
        assert_eq!(decode_run_status(&value), RunStatus::InProgress);
        let value = json!({ "id": "run_1", "status": "cancelling" });
        assert_eq!(decode_run_status(&value), RunStatus::Unknown);
        let value = json!({ "id": "run_1" });
        assert_eq!(decode_run_status(&value), RunStatus::Unknown);
    }

    #[test]
    fn extract_api_error_reads_nested_message() {
        let value = json!({ "error": { "message": "rate limited", "type": "rate_limit" } });
        assert_eq!(extract_api_error(&value).as_deref(), Some("rate limited"));
        assert_eq!(extract_api_error(&json!({ "id": "x" })), None);
    }

    #[test]
    fn extract_assistant_text_joins_text_blocks_and_skips_other_roles() {
        let value = json!({
            "data": [
                { "role": "user", "content": [ { "type": "text", "text": { "value": "hi" } } ] },
                {
                    "role": "assistant",
                    "content": [
                        { "type": "text", "text": { "value": "Hello " } },
                        { "type": "image_file", "image_file": { "file_id": "f1" } },
                        { "type": "text", "text": { "value": "there." } }
                    ]
                }
            ]
        });
        // data is newest-first; the first assistant entry wins
        assert_eq!(extract_assistant_text(&value).as_deref(), Some("Hello there."));
    }

    #[test]
    fn extract_assistant_text_returns_none_without_assistant_message() {
        let value = json!({ "data": [ { "role": "user", "content": [] } ] });
        assert_eq!(extract_assistant_text(&value), None);
    }

    #[test]
    fn backend_requires_assistant_id() {
        let config = BackendConfig {
            api_key: Some("sk-test".to_string()),
            ..BackendConfig::default()
        };
        // guard against ambient configuration leaking into the test
        if std::env::var("CADENCE_ASSISTANT_ID").is_ok() {
            return;
        }
        let err = AssistantBackend::new(&config).err().expect("expected error");
        assert!(err.to_string().contains("assistant_id is not configured"));
    }
}
