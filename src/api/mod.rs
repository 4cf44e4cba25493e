use crate::config::{ProviderMode, Settings};
use crate::storage::KeyValueStore;
use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

pub mod backend;
pub mod gemini;
#[cfg(test)]
mod test_server;

pub use backend::BackendProvider;
pub use gemini::GeminiProvider;

// Alias for the stream type providers return
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// What a provider needs to generate one reply.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
}

// Trait defining the interface for streaming reply providers
#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    // Returns a finite stream of content deltas.
    async fn stream(&self, request: &StreamRequest) -> Result<DeltaStream>;
}

/// Picks the provider for the configured mode. Chosen once; there is no failover between modes.
pub fn provider_for(settings: &Settings, store: Arc<dyn KeyValueStore>) -> Arc<dyn ChatStreamProvider> {
    match settings.mode {
        ProviderMode::Client => {
            log::info!("Using client-direct provider at {}", settings.gemini_url);
            Arc::new(GeminiProvider::new(
                settings.gemini_url.clone(),
                settings.api_key_ref.clone(),
                store,
            ))
        }
        ProviderMode::Server => {
            log::info!("Using backend provider at {}", settings.server_url);
            Arc::new(BackendProvider::new(settings.server_url.clone()))
        }
    }
}
