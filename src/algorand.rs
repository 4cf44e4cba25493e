use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Serialize;

#[derive(Serialize)]
struct SignedTxBody {
    stx: String,
}

/// Blockchain helpers exposed by the DAISY backend.
#[derive(Clone)]
pub struct AlgorandClient {
    client: Client,
    base_url: String,
}

impl AlgorandClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Suggested transaction parameters for the current network.
    pub async fn suggested_params(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/algorand/params", self.base_url);
        log::debug!("Fetching network params from {}", url);
        let response = self.client.get(&url).send().await.context("Failed to fetch params")?;
        if !response.status().is_success() {
            log::error!("Network params request failed with status {}", response.status());
            return Err(anyhow::anyhow!("Failed to fetch params"));
        }
        response.json().await.context("Failed to parse network params")
    }

    /// Broadcasts an already signed transaction.
    pub async fn send_signed_tx(&self, signed: &[u8]) -> Result<serde_json::Value> {
        let url = format!("{}/api/algorand/sendtx", self.base_url);
        log::info!("Broadcasting signed transaction ({} bytes)", signed.len());
        let response = self
            .client
            .post(&url)
            .json(&SignedTxBody {
                stx: STANDARD.encode(signed),
            })
            .send()
            .await
            .context("Broadcast failed")?;
        if !response.status().is_success() {
            log::error!("Broadcast failed with status {}", response.status());
            return Err(anyhow::anyhow!("Broadcast failed"));
        }
        response.json().await.context("Failed to parse broadcast result")
    }
}
