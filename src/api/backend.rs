use super::{ChatStreamProvider, DeltaStream, StreamRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long the consumer sleeps when no delta is queued yet.
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Deserialize, Debug)]
struct CreateChatResponse {
    id: String,
}

#[derive(Deserialize, Debug)]
struct DeltaPayload {
    #[serde(default)]
    delta: Option<String>,
}

// Filled by the event reader, drained by the consumer
#[derive(Default)]
struct DeltaQueue {
    pending: VecDeque<String>,
    done: bool,
    failure: Option<String>,
}

enum Next {
    Ready(Result<String>),
    Finished,
    Empty,
}

impl DeltaQueue {
    fn next(&mut self) -> Next {
        if let Some(delta) = self.pending.pop_front() {
            return Next::Ready(Ok(delta));
        }
        if self.done {
            return Next::Finished;
        }
        match self.failure.take() {
            Some(reason) => {
                self.done = true;
                Next::Ready(Err(anyhow::anyhow!(reason)))
            }
            None => Next::Empty,
        }
    }
}

// Stops the event reader once nobody is consuming its deltas
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Consumer {
    queue: Arc<Mutex<DeltaQueue>>,
    _reader: AbortOnDrop,
    poll_interval: Duration,
}

/// Runs the chat job on the DAISY backend and follows its event stream.
pub struct BackendProvider {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl BackendProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: STREAM_POLL_INTERVAL,
        }
    }

    /// Creates the server-side job and returns its id.
    async fn create_chat(&self, request: &StreamRequest) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        log::info!("Creating chat job at {} using model: {}", url, request.model);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Server error creating chat")?;

        if !response.status().is_success() {
            log::error!("Chat job creation failed with status {}", response.status());
            return Err(anyhow::anyhow!("Server error creating chat"));
        }

        let created: CreateChatResponse = response
            .json()
            .await
            .context("Failed to parse chat job response")?;
        Ok(created.id)
    }
}

#[async_trait]
impl ChatStreamProvider for BackendProvider {
    async fn stream(&self, request: &StreamRequest) -> Result<DeltaStream> {
        let job_id = self.create_chat(request).await?;

        let url = format!("{}/api/stream/{}", self.base_url, job_id);
        log::info!("Opening event stream for chat job {}", job_id);

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("Failed to open event stream")?;

        if !response.status().is_success() {
            let status = response.status();
            log::error!("Event stream for job {} failed with status {}", job_id, status);
            return Err(anyhow::anyhow!("Event stream request failed with status {}", status));
        }

        let queue = Arc::new(Mutex::new(DeltaQueue::default()));
        let reader_queue = queue.clone();
        let mut events = response.bytes_stream().eventsource();

        let reader = tokio::spawn(async move {
            while let Some(event_result) = events.next().await {
                let event = match event_result {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("Error reading event stream for job {}: {}", job_id, e);
                        reader_queue.lock().await.failure = Some(format!("Error reading event stream: {}", e));
                        return;
                    }
                };

                match event.event.as_str() {
                    "delta" => match serde_json::from_str::<DeltaPayload>(&event.data) {
                        Ok(DeltaPayload { delta: Some(delta) }) if !delta.is_empty() => {
                            reader_queue.lock().await.pending.push_back(delta);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("Ignoring malformed delta payload: {} - Data: {}", e, event.data);
                        }
                    },
                    "done" => {
                        log::info!("Chat job {} finished", job_id);
                        // Returning drops the event stream and closes the connection
                        reader_queue.lock().await.done = true;
                        return;
                    }
                    other => log::debug!("Ignoring '{}' event for job {}", other, job_id),
                }
            }
            log::warn!("Event stream for job {} ended without a done event", job_id);
            reader_queue.lock().await.failure = Some("Event stream closed before completion".to_string());
        });

        Ok(follow_queue(queue, reader, self.poll_interval))
    }
}

// Yields queued deltas, sleeping between polls; dropping the stream stops `reader`
fn follow_queue(queue: Arc<Mutex<DeltaQueue>>, reader: JoinHandle<()>, poll_interval: Duration) -> DeltaStream {
    let consumer = Consumer {
        queue,
        _reader: AbortOnDrop(reader),
        poll_interval,
    };

    let deltas = stream::unfold(consumer, |consumer| async move {
        loop {
            let next = consumer.queue.lock().await.next();
            match next {
                Next::Ready(item) => return Some((item, consumer)),
                Next::Finished => return None,
                Next::Empty => tokio::time::sleep(consumer.poll_interval).await,
            }
        }
    });

    Box::pin(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_server::{self, RawResponse};
    use futures::TryStreamExt;
    use serde_json::json;
    use tokio::sync::oneshot;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> StreamRequest {
        StreamRequest {
            prompt: "hi".into(),
            model: "gemini-test".into(),
            temperature: 0.5,
        }
    }

    async fn mount_job(server: &MockServer, events: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_json(json!({"prompt": "hi", "model": "gemini-test", "temperature": 0.5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "job-1"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/stream/job-1"))
            .and(header("accept", "text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(events.to_string(), "text/event-stream"))
            .mount(server)
            .await;
    }

    #[test]
    fn queue_drains_before_reporting_failure() {
        let mut queue = DeltaQueue::default();
        queue.pending.push_back("a".into());
        queue.failure = Some("gone".into());

        assert!(matches!(queue.next(), Next::Ready(Ok(ref d)) if d == "a"));
        assert!(matches!(queue.next(), Next::Ready(Err(_))));
        assert!(matches!(queue.next(), Next::Finished));
    }

    #[test]
    fn queue_waits_while_nothing_is_known() {
        let mut queue = DeltaQueue::default();
        assert!(matches!(queue.next(), Next::Empty));
        queue.done = true;
        assert!(matches!(queue.next(), Next::Finished));
    }

    #[tokio::test]
    async fn deltas_arrive_in_order_until_done() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            "event: delta\ndata: {\"delta\":\"Hel\"}\n\n\
             event: delta\ndata: not-json\n\n\
             event: delta\ndata: {\"delta\":\"\"}\n\n\
             event: ping\ndata: {}\n\n\
             event: delta\ndata: {\"delta\":\"lo\"}\n\n\
             event: done\ndata: {}\n\n\
             event: delta\ndata: {\"delta\":\"after done\"}\n\n",
        )
        .await;

        let provider = BackendProvider::new(server.uri());
        let deltas: Vec<String> = provider.stream(&request()).await.unwrap().try_collect().await.unwrap();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn creation_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = BackendProvider::new(server.uri());
        let err = provider.stream(&request()).await.err().unwrap();
        assert_eq!(err.to_string(), "Server error creating chat");
    }

    #[tokio::test]
    async fn stream_closing_early_yields_partial_then_error() {
        let server = MockServer::start().await;
        mount_job(&server, "event: delta\ndata: {\"delta\":\"Hel\"}\n\n").await;

        let provider = BackendProvider::new(server.uri());
        let items: Vec<Result<String>> = provider.stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        assert_eq!(
            items[1].as_ref().unwrap_err().to_string(),
            "Event stream closed before completion"
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_reader() {
        let queue = Arc::new(Mutex::new(DeltaQueue::default()));
        queue.lock().await.pending.push_back("Hel".into());
        let (alive, stopped) = oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            let _alive = alive;
            futures::future::pending::<()>().await;
        });

        let mut deltas = follow_queue(queue, reader, Duration::from_millis(5));
        assert_eq!(deltas.next().await.unwrap().unwrap(), "Hel");
        drop(deltas);

        let closed = tokio::time::timeout(Duration::from_secs(2), stopped).await;
        assert!(matches!(closed, Ok(Err(_))), "reader task kept running");
    }

    #[tokio::test]
    async fn transport_failure_before_done_is_reported_after_deltas() {
        let base = test_server::serve(vec![
            ("/api/chat", RawResponse::complete("application/json", r#"{"id":"job-1"}"#)),
            (
                "/api/stream/job-1",
                RawResponse::truncated("text/event-stream", "event: delta\ndata: {\"delta\":\"Hel\"}\n\n"),
            ),
        ])
        .await;

        let provider = BackendProvider::new(base);
        let items: Vec<Result<String>> = provider.stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        let message = items[1].as_ref().unwrap_err().to_string();
        assert!(message.starts_with("Error reading event stream"), "{}", message);
    }
}
