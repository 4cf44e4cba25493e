use super::{ChatStreamProvider, DeltaStream, StreamRequest};
use crate::config::{self, ApiKeyRef};
use crate::storage::KeyValueStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MISSING_KEY_MESSAGE: &str = "Missing Gemini API key. Add it in Settings.";

// Content types answered with newline-delimited JSON chunks
const STREAMING_CONTENT_TYPES: [&str; 2] = ["application/json+stream", "application/x-ndjson"];

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<RequestContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct RequestContent {
    role: String,
    parts: Vec<RequestPart>,
}

#[derive(Serialize, Debug)]
struct RequestPart {
    text: String,
}

#[derive(Serialize, Debug)]
struct GenerationConfig {
    temperature: f32,
}

impl From<&StreamRequest> for GenerateContentRequest {
    fn from(request: &StreamRequest) -> Self {
        GenerateContentRequest {
            contents: vec![RequestContent {
                role: "user".to_string(),
                parts: vec![RequestPart {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
            },
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the first candidate, all parts joined.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

/// Splits a byte stream into complete lines. A UTF-8 sequence cut by a chunk
/// boundary is only decoded once its line is complete.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }
}

// Malformed lines are dropped; the stream carries on
fn line_text(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<GenerateContentResponse>(line) {
        Ok(chunk) => Some(chunk.text()).filter(|text| !text.is_empty()),
        Err(e) => {
            log::debug!("Discarding malformed stream line: {} - Data: {}", e, line);
            None
        }
    }
}

/// Calls the generation API straight from the client with a locally stored key.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    key_ref: ApiKeyRef,
    store: Arc<dyn KeyValueStore>,
}

impl GeminiProvider {
    pub fn new(base_url: String, key_ref: ApiKeyRef, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_ref,
            store,
        }
    }
}

#[async_trait]
impl ChatStreamProvider for GeminiProvider {
    async fn stream(&self, request: &StreamRequest) -> Result<DeltaStream> {
        let api_key = config::get_api_key(&self.key_ref, self.store.as_ref())
            .await?
            .ok_or_else(|| anyhow::anyhow!(MISSING_KEY_MESSAGE))?;

        let request_url = format!("{}/models/{}:streamGenerateContent", self.base_url, request.model);
        log::info!("Sending generation request to {} using model: {}", request_url, request.model);

        let response = self
            .client
            .post(&request_url)
            .query(&[("key", api_key.as_str())])
            .json(&GenerateContentRequest::from(request))
            .send()
            .await
            .context("Failed to send generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Generation request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "Generation request failed with status {}: {}",
                status,
                error_body
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if !STREAMING_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
            // No streaming support on this path: read the whole body once
            log::debug!("Response content type '{}' is not streamed, reading full body", content_type);
            let body: GenerateContentResponse = response
                .json()
                .await
                .context("Failed to parse generation response")?;
            return Ok(Box::pin(stream::once(async move { Ok(body.text()) })));
        }

        let deltas = response
            .bytes_stream()
            .scan(LineBuffer::default(), |lines, chunk| {
                let items: Vec<Result<String>> = match chunk {
                    Ok(bytes) => lines
                        .push(&bytes)
                        .iter()
                        .filter_map(|line| line_text(line))
                        .map(Ok)
                        .collect(),
                    Err(e) => {
                        log::error!("Error reading generation stream: {:?}", e);
                        vec![Err(anyhow::Error::from(e).context("Error reading generation stream"))]
                    }
                };
                futures::future::ready(Some(items))
            })
            .flat_map(stream::iter);

        Ok(Box::pin(deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server::{self, RawResponse};
    use crate::storage::{MemoryKeyValueStore, GEMINI_KEY};
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ENDPOINT: &str = "/models/gemini-test:streamGenerateContent";

    fn request() -> StreamRequest {
        StreamRequest {
            prompt: "Say hello".into(),
            model: "gemini-test".into(),
            temperature: 0.5,
        }
    }

    async fn provider_with_key(server: &MockServer) -> GeminiProvider {
        let store = MemoryKeyValueStore::new();
        store.set(GEMINI_KEY, "test-key").await.unwrap();
        GeminiProvider::new(server.uri(), ApiKeyRef::Store, Arc::new(store))
    }

    fn chunk(text: &str) -> String {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}}]}).to_string()
    }

    #[test]
    fn line_buffer_joins_split_lines_and_utf8() {
        let mut buffer = LineBuffer::default();
        let bytes = "héllo\nwor".as_bytes();
        // Split inside the two-byte 'é'
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..]), vec!["héllo".to_string()]);
        assert_eq!(buffer.push(b"ld\n\n"), vec!["world".to_string(), String::new()]);
    }

    #[test]
    fn text_joins_parts_of_first_candidate_only() {
        let parsed: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [
                {"content": {"parts": [{"text": "a"}, {"text": "b"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        }))
        .unwrap();
        assert_eq!(parsed.text(), "ab");
        assert_eq!(GenerateContentResponse::default().text(), "");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let server = MockServer::start().await;
        let provider = GeminiProvider::new(server.uri(), ApiKeyRef::Store, Arc::new(MemoryKeyValueStore::new()));

        let err = provider.stream(&request()).await.err().unwrap();
        assert_eq!(err.to_string(), MISSING_KEY_MESSAGE);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_lines_become_deltas_and_garbage_is_skipped() {
        let server = MockServer::start().await;
        let body = format!("{}\nnot json at all\n\n{}\n{}\n", chunk("Hel"), chunk(""), chunk("lo"));
        Mock::given(method("POST"))
            .and(path(ENDPOINT))
            .and(query_param("key", "test-key"))
            .and(body_json(json!({
                "contents": [{"role": "user", "parts": [{"text": "Say hello"}]}],
                "generationConfig": {"temperature": 0.5}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json+stream"))
            .mount(&server)
            .await;

        let provider = provider_with_key(&server).await;
        let deltas: Vec<String> = provider.stream(&request()).await.unwrap().try_collect().await.unwrap();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_dropped() {
        let server = MockServer::start().await;
        let body = format!("{}\n{}", chunk("kept"), chunk("lost"));
        Mock::given(method("POST"))
            .and(path(ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let provider = provider_with_key(&server).await;
        let deltas: Vec<String> = provider.stream(&request()).await.unwrap().try_collect().await.unwrap();
        assert_eq!(deltas, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn plain_json_response_yields_one_fragment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "Hello "}, {"text": "there"}]}}]
            })))
            .mount(&server)
            .await;

        let provider = provider_with_key(&server).await;
        let deltas: Vec<String> = provider.stream(&request()).await.unwrap().try_collect().await.unwrap();
        assert_eq!(deltas, vec!["Hello there".to_string()]);
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT))
            .respond_with(ResponseTemplate::new(403).set_body_string("key revoked"))
            .mount(&server)
            .await;

        let provider = provider_with_key(&server).await;
        let err = provider.stream(&request()).await.err().unwrap();
        let message = err.to_string();
        assert!(message.contains("403"), "{}", message);
        assert!(message.contains("key revoked"), "{}", message);
    }

    #[tokio::test]
    async fn body_cut_off_mid_stream_yields_an_error() {
        let body = format!("{}\n{{\"candi", chunk("Hel"));
        let base = test_server::serve(vec![(ENDPOINT, RawResponse::truncated("application/x-ndjson", &body))]).await;
        let store = MemoryKeyValueStore::new();
        store.set(GEMINI_KEY, "test-key").await.unwrap();
        let provider = GeminiProvider::new(base, ApiKeyRef::Store, Arc::new(store));

        let items: Vec<Result<String>> = provider.stream(&request()).await.unwrap().collect().await;
        let deltas: Vec<&String> = items.iter().filter_map(|item| item.as_ref().ok()).collect();
        assert_eq!(deltas, vec!["Hel"]);
        let err = items.last().unwrap().as_ref().unwrap_err();
        assert!(err.to_string().contains("Error reading generation stream"), "{}", err);
    }
}
