use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::sync::Arc;

/// One unsigned transaction handed to the wallet, base64 encoded.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct WalletTransaction {
    pub txn: String,
}

/// Wallets answer with either raw bytes or base64 text.
#[derive(Clone, Debug, PartialEq)]
pub enum SignedTransaction {
    Bytes(Vec<u8>),
    Base64(String),
}

impl SignedTransaction {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            SignedTransaction::Bytes(bytes) => Ok(bytes),
            SignedTransaction::Base64(text) => STANDARD
                .decode(text.as_bytes())
                .context("Wallet returned an invalid base64 signature"),
        }
    }
}

/// The external wallet-connect integration.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    /// Returns the accounts the user approved.
    async fn connect(&self) -> Result<Vec<String>>;
    async fn disconnect(&self) -> Result<()>;
    async fn sign_transaction(&self, groups: Vec<Vec<WalletTransaction>>) -> Result<Vec<Vec<SignedTransaction>>>;
}

#[async_trait]
impl<T: WalletConnector + ?Sized> WalletConnector for Arc<T> {
    async fn connect(&self) -> Result<Vec<String>> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn sign_transaction(&self, groups: Vec<Vec<WalletTransaction>>) -> Result<Vec<Vec<SignedTransaction>>> {
        (**self).sign_transaction(groups).await
    }
}

pub struct Wallet<C> {
    connector: C,
    address: Option<String>,
}

impl<C: WalletConnector> Wallet<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            address: None,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.address.is_some()
    }

    /// Connects and adopts the first approved account.
    pub async fn connect(&mut self) -> Result<&str> {
        let accounts = self.connector.connect().await.context("Wallet connection failed")?;
        let address = accounts
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Wallet returned no accounts"))?;
        log::info!("Wallet connected: {}", address);
        Ok(self.address.insert(address).as_str())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.connector.disconnect().await.context("Wallet disconnect failed")?;
        self.handle_remote_disconnect();
        Ok(())
    }

    /// Forgets the session after the wallet side dropped it.
    pub fn handle_remote_disconnect(&mut self) {
        if let Some(address) = self.address.take() {
            log::info!("Wallet disconnected: {}", address);
        }
    }

    /// Signs `txns` as one group and returns the signed bytes in the same order.
    pub async fn sign_transactions(&self, txns: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if !self.is_connected() {
            return Err(anyhow::anyhow!("Wallet is not connected"));
        }
        let group: Vec<WalletTransaction> = txns
            .iter()
            .map(|txn| WalletTransaction {
                txn: STANDARD.encode(txn),
            })
            .collect();

        let signed_groups = self.connector.sign_transaction(vec![group]).await?;
        let signed = signed_groups
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Wallet returned no signed group"))?;
        signed.into_iter().map(SignedTransaction::into_bytes).collect()
    }

    /// Whether the send button is enabled for `text`.
    pub fn can_send(&self, text: &str) -> bool {
        self.is_connected() && !text.trim().is_empty()
    }
}
