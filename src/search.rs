use crate::context::WebResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

pub type SearchResult = WebResult;

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Never fails; an unreachable backend just produces no results.
    async fn search(&self, query: &str) -> Vec<SearchResult>;
}

/// Canned results for when no search backend is configured.
pub struct StubSearch;

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, query: &str) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        vec![
            SearchResult {
                title: format!("Result for \"{}\" - Example.org", query.trim()),
                url: "https://example.org".to_string(),
                snippet: "This is a placeholder search result. Configure a real provider in settings.".to_string(),
            },
            SearchResult {
                title: "Algorand Developer Portal".to_string(),
                url: "https://developer.algorand.org".to_string(),
                snippet: "Docs, SDKs and Algokit for building on Algorand.".to_string(),
            },
        ]
    }
}

#[derive(Serialize)]
struct QueryBody<'a> {
    prompt: &'a str,
}

pub struct ApiSearch {
    client: Client,
    base_url: String,
}

impl ApiSearch {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = format!("{}/post-query", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&QueryBody { prompt: query })
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Search request failed with status {}", response.status()));
        }

        response
            .json::<Vec<SearchResult>>()
            .await
            .context("Failed to parse search results")
    }
}

#[async_trait]
impl SearchProvider for ApiSearch {
    async fn search(&self, query: &str) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        match self.fetch(query.trim()).await {
            Ok(results) => {
                log::info!("Search for '{}' returned {} results", query.trim(), results.len());
                results
            }
            Err(e) => {
                log::error!("Search failed: {:?}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn stub_returns_placeholders_for_real_queries_only() {
        assert!(StubSearch.search("  ").await.is_empty());
        let results = StubSearch.search("algorand fees").await;
        assert_eq!(results.len(), 2);
        assert!(results[0].title.contains("algorand fees"));
    }

    #[tokio::test]
    async fn api_search_parses_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/post-query"))
            .and(body_json(json!({"prompt": "rust"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"title": "Rust", "url": "https://rust-lang.org", "snippet": "Fast"}
            ])))
            .mount(&server)
            .await;

        let results = ApiSearch::new(server.uri()).search(" rust ").await;
        assert_eq!(
            results,
            vec![SearchResult {
                title: "Rust".into(),
                url: "https://rust-lang.org".into(),
                snippet: "Fast".into(),
            }]
        );
    }

    #[tokio::test]
    async fn api_search_failures_become_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/post-query"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        assert!(ApiSearch::new(server.uri()).search("rust").await.is_empty());
        assert!(ApiSearch::new(server.uri()).search("").await.is_empty());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}
