use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;

use crate::error::EngineError;

/// The loopback address the engine is told to bind.
pub const ENGINE_PORT: u16 = 8188;

/// The client id attached to every submitted prompt.
const CLIENT_ID: &str = "runpod_handler";

/// A terminal history entry for a submitted prompt.
#[derive(Debug, Clone)]
pub enum PromptOutcome {
    /// The engine reported success; carries the outputs map.
    Success(Value),
    /// The engine reported a workflow-level error.
    Failed(String),
}

/// Thin client over the engine's local HTTP control surface.
#[derive(Debug, Clone)]
pub struct EngineClient {
    base: Url,
    client: reqwest::Client,
}

impl EngineClient {
    /// A client for the conventional loopback endpoint.
    pub fn local() -> Self {
        let base = Url::parse(&format!("http://127.0.0.1:{ENGINE_PORT}/"))
            .expect("loopback url is valid");
        Self::new(base)
    }

    pub fn new(base: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client.");
        Self { base, client }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// A single readiness probe: `GET /`, then `GET /queue`.
    ///
    /// Any 200 means the engine is serving.
    pub async fn is_ready(&self) -> bool {
        for path in ["", "queue"] {
            let Ok(url) = self.base.join(path) else {
                continue;
            };
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(response) => trace!("engine probe /{path}: HTTP {}", response.status()),
                Err(err) => trace!("engine probe /{path}: {err}"),
            }
        }
        false
    }

    /// Submit a workflow graph; returns the engine's prompt id.
    pub async fn submit(&self, workflow: &Value) -> Result<String, EngineError> {
        let url = self.base.join("prompt").expect("prompt url is valid");
        let body = json!({
            "prompt": workflow,
            "client_id": CLIENT_ID,
        });
        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::Protocol {
                endpoint: url.to_string(),
                message: err.to_string(),
            })?;
        let status = response.status();
        let payload: Value = response.json().await.map_err(|err| EngineError::Protocol {
            endpoint: url.to_string(),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(EngineError::Workflow(format!(
                "engine rejected the workflow (HTTP {status}): {payload}"
            )));
        }
        let prompt_id = payload
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol {
                endpoint: url.to_string(),
                message: format!("no prompt_id in response: {payload}"),
            })?;
        debug!("workflow submitted, prompt_id={prompt_id}");
        Ok(prompt_id.to_string())
    }

    /// One history poll for `prompt_id`.
    ///
    /// `Ok(None)` covers both "still running" and transient transport noise
    /// (connection reset, partial JSON): the caller keeps polling until its
    /// deadline.
    pub async fn poll_history(&self, prompt_id: &str) -> Result<Option<PromptOutcome>, EngineError> {
        let url = self
            .base
            .join(&format!("history/{prompt_id}"))
            .expect("history url is valid");
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                trace!("history poll failed: {err}");
                return Ok(None);
            }
        };
        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                trace!("history payload unreadable: {err}");
                return Ok(None);
            }
        };
        let Some(entry) = payload.get(prompt_id) else {
            return Ok(None);
        };
        let status = entry.get("status").cloned().unwrap_or(Value::Null);
        match status.get("status_str").and_then(Value::as_str) {
            Some("success") => {
                // The outputs map lives either on the entry or inside status,
                // depending on the engine build.
                let outputs = entry
                    .get("outputs")
                    .or_else(|| status.get("outputs"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(Some(PromptOutcome::Success(outputs)))
            }
            Some("error") => {
                let message = status
                    .get("status_message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                Ok(Some(PromptOutcome::Failed(message)))
            }
            other => {
                trace!("prompt {prompt_id} still pending (status {other:?})");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> EngineClient {
        EngineClient::new(Url::parse(&server.uri()).unwrap())
    }

    #[tokio::test]
    async fn readiness_needs_a_200() {
        let server = MockServer::start().await;
        let client = client(&server);
        assert!(!client.is_ready().await);

        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(client.is_ready().await);
    }

    #[tokio::test]
    async fn submit_parses_prompt_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"prompt_id": "abc-123"})),
            )
            .mount(&server)
            .await;
        let client = client(&server);
        let prompt_id = client.submit(&serde_json::json!({"graph": {}})).await.unwrap();
        assert_eq!(prompt_id, "abc-123");
    }

    #[tokio::test]
    async fn submit_without_prompt_id_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        let client = client(&server);
        let err = client.submit(&serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[tokio::test]
    async fn history_terminal_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": {
                    "status": {"status_str": "success"},
                    "outputs": {"9": {"images": [{"filename": "a.png"}]}}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bad": {
                    "status": {"status_str": "error", "status_message": "node 3 exploded"}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/history/pending"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(matches!(
            client.poll_history("ok").await.unwrap(),
            Some(PromptOutcome::Success(_))
        ));
        match client.poll_history("bad").await.unwrap() {
            Some(PromptOutcome::Failed(message)) => assert_eq!(message, "node 3 exploded"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(client.poll_history("pending").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_noise_reads_as_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/x"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;
        let client = client(&server);
        assert!(client.poll_history("x").await.unwrap().is_none());
    }
}
