//! Gemini HTTP client: deep-research interactions and structured reformatting.

use async_trait::async_trait;
use leadscout_shared::{GeminiConfig, LeadScoutError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{InteractionStatus, Reformatter, RemoteState, ResearchService};

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("LeadScout/", env!("CARGO_PKG_VERSION"));

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Longest slice of an error body kept in error messages.
const ERROR_BODY_PREVIEW: usize = 300;

/// Instructions for the reformatting model. `{text_output}` is replaced by
/// the unparseable research text.
const REFORMAT_PROMPT: &str = "\
The following text contains research results about potential leads for an event promotion platform.
Extract all the leads mentioned in the text and structure them according to the provided schema.

For each lead, extract:
- name (required)
- company (if different from name)
- record_type (e.g., Collective, Venue, Promoter, Organization, Individual, etc.)
- email (if publicly available)
- phone (with international prefix if available)
- instagram (handle without @)
- telegram (username or handle, not the link)
- website (full URL)
- notes (current registration method, event frequency, size, pain points, why they're a good fit)
- temperature (hot/warm/cold based on fit and complexity of their needs)
- tags (relevant keywords)

Research text:
{text_output}

Return all leads as JSON of the form {\"records\": [...]}.";

/// Client for the Gemini API.
pub struct GeminiClient {
    http: Client,
    base: Url,
    api_key: String,
    research_agent: String,
    fallback_model: String,
}

impl GeminiClient {
    /// Build a client from config and an API key.
    pub fn new(config: &GeminiConfig, api_key: impl Into<String>) -> Result<Self> {
        let mut base_str = config.base_url.trim().to_string();
        if !base_str.ends_with('/') {
            base_str.push('/');
        }
        let base = Url::parse(&base_str).map_err(|e| {
            LeadScoutError::config(format!("invalid gemini base_url '{}': {e}", config.base_url))
        })?;

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LeadScoutError::RemoteCall(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            api_key: api_key.into(),
            research_agent: config.research_agent.clone(),
            fallback_model: config.fallback_model.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| LeadScoutError::config(format!("invalid endpoint '{path}': {e}")))
    }

    /// Send a request and decode a JSON body, mapping every failure to
    /// [`LeadScoutError::RemoteCall`].
    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| LeadScoutError::RemoteCall(format!("{what}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LeadScoutError::RemoteCall(format!(
                "{what}: HTTP {status}: {}",
                preview(&body, ERROR_BODY_PREVIEW)
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LeadScoutError::RemoteCall(format!("{what}: invalid response body: {e}")))
    }
}

#[async_trait]
impl ResearchService for GeminiClient {
    #[instrument(skip_all, fields(agent = %self.research_agent))]
    async fn submit(&self, prompt: &str, schema: &serde_json::Value) -> Result<String> {
        let url = self.endpoint("v1beta/interactions")?;
        let body = json!({
            "input": prompt,
            "agent": self.research_agent,
            "background": true,
            "response_format": schema,
        });

        let interaction: InteractionResponse = self
            .send_json(self.http.post(url).json(&body), "create interaction")
            .await?;

        if interaction.id.trim().is_empty() {
            return Err(LeadScoutError::RemoteCall(
                "create interaction: response has no interaction id".into(),
            ));
        }
        info!(interaction_id = %interaction.id, "research interaction created");
        Ok(interaction.id)
    }

    #[instrument(skip(self))]
    async fn get_status(&self, interaction_id: &str) -> Result<InteractionStatus> {
        let url = self.endpoint(&format!("v1beta/interactions/{interaction_id}"))?;
        let interaction: InteractionResponse = self
            .send_json(self.http.get(url), "get interaction")
            .await?;

        let state = RemoteState::from_remote(interaction.status.as_deref().unwrap_or_default());
        debug!(status = state.as_str(), "interaction status");

        // The final answer is the last output carrying text.
        let payload = interaction
            .outputs
            .iter()
            .rev()
            .find_map(|o| o.text.clone());

        Ok(InteractionStatus {
            state,
            payload,
            error: interaction.error.as_ref().and_then(error_message),
        })
    }
}

#[async_trait]
impl Reformatter for GeminiClient {
    #[instrument(skip_all, fields(model = %self.fallback_model, chars = raw_text.len()))]
    async fn reformat(&self, raw_text: &str, schema: &serde_json::Value) -> Result<String> {
        let url = self.endpoint(&format!(
            "v1beta/models/{}:generateContent",
            self.fallback_model
        ))?;
        let body = json!({
            "contents": [{
                "parts": [{ "text": REFORMAT_PROMPT.replace("{text_output}", raw_text) }],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            },
        });

        let response: GenerateContentResponse = self
            .send_json(self.http.post(url).json(&body), "generate content")
            .await?;

        let text: String = response
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            warn!("reformatter returned no text");
            return Err(LeadScoutError::RemoteCall(
                "generate content: empty response".into(),
            ));
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InteractionResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    outputs: Vec<InteractionOutput>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InteractionOutput {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// Pull a human-readable message out of an error that may be a string or
/// an object with a `message` field.
fn error_message(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

/// First `max` characters of `s`, on a char boundary.
fn preview(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GeminiClient {
        let config = GeminiConfig {
            base_url: server.uri(),
            research_agent: "deep-research-test".into(),
            fallback_model: "flash-test".into(),
            request_timeout_secs: 5,
            ..GeminiConfig::default()
        };
        GeminiClient::new(&config, "test-key").unwrap()
    }

    #[tokio::test]
    async fn submit_returns_interaction_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/interactions"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "agent": "deep-research-test",
                "background": true,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "int-123", "status": "in_progress"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let id = client
            .submit("research Berlin", &json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(id, "int-123");
    }

    #[tokio::test]
    async fn submit_quota_error_is_remote_call() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/interactions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exhausted"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.submit("p", &json!({})).await.unwrap_err();
        match err {
            LeadScoutError::RemoteCall(msg) => {
                assert!(msg.contains("429"), "{msg}");
                assert!(msg.contains("quota exhausted"), "{msg}");
            }
            other => panic!("expected RemoteCall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_status_returns_last_text_output() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1beta/interactions/int-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "int-9",
                "status": "completed",
                "outputs": [
                    {"text": "thinking..."},
                    {"text": "{\"records\": []}"},
                    {"type": "image"}
                ]
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).get_status("int-9").await.unwrap();
        assert_eq!(status.state, RemoteState::Completed);
        assert_eq!(status.payload.as_deref(), Some("{\"records\": []}"));
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn failed_status_carries_error_message() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1beta/interactions/int-5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "int-5",
                "status": "failed",
                "error": {"code": 500, "message": "agent crashed"}
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).get_status("int-5").await.unwrap();
        assert_eq!(status.state, RemoteState::Failed);
        assert_eq!(status.error.as_deref(), Some("agent crashed"));
        assert!(status.payload.is_none());
    }

    #[tokio::test]
    async fn status_server_error_is_remote_call() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1beta/interactions/int-5"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).get_status("int-5").await.unwrap_err();
        assert!(matches!(err, LeadScoutError::RemoteCall(_)));
    }

    #[tokio::test]
    async fn reformat_joins_candidate_parts() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/models/flash-test:generateContent"))
            .and(body_partial_json(json!({
                "generationConfig": {"responseMimeType": "application/json"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"parts": [
                        {"text": "{\"records\": "},
                        {"text": "[{\"name\": \"Foo\"}]}"}
                    ]}
                }]
            })))
            .mount(&server)
            .await;

        let text = client_for(&server)
            .reformat("Foo is a venue", &json!({"type": "object"}))
            .await
            .unwrap();
        assert_eq!(text, "{\"records\": [{\"name\": \"Foo\"}]}");
    }

    #[tokio::test]
    async fn reformat_empty_answer_is_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1beta/models/flash-test:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .reformat("text", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LeadScoutError::RemoteCall(_)));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = GeminiConfig {
            base_url: "not a url".into(),
            ..GeminiConfig::default()
        };
        assert!(matches!(
            GeminiClient::new(&config, "k"),
            Err(LeadScoutError::Config { .. })
        ));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("hi", 10), "hi");
    }
}
