use crate::algorand::AlgorandClient;
use crate::api::{self, ChatStreamProvider};
use crate::config::Settings;
use crate::context::ContextState;
use crate::search::{ApiSearch, SearchProvider, StubSearch};
use crate::session::SessionManager;
use crate::storage::{ConversationStore, KeyValueStore, SqliteKeyValueStore};
use crate::wallet::{Wallet, WalletConnector};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedWallet = Arc<Mutex<Wallet<Arc<dyn WalletConnector>>>>;

// Core application state shared by the command handlers
#[derive(Clone)] // Allow cloning for background tasks
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn KeyValueStore>,
    pub session: SessionManager,
    pub context: Arc<Mutex<ContextState>>,
    pub search: Arc<dyn SearchProvider>,
    pub algorand: AlgorandClient,
    // Sends are only gated when a wallet integration is attached
    pub wallet: Option<SharedWallet>,
}

impl AppState {
    /// Opens the database named in `settings` and assembles everything on top of it.
    pub async fn initialize(settings: Settings) -> Result<Self> {
        let store = SqliteKeyValueStore::open(&settings.db_path).await?;
        Self::assemble(settings, Arc::new(store)).await
    }

    /// Uses the provider selected by the configured mode.
    pub async fn assemble(settings: Settings, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let provider = api::provider_for(&settings, store.clone());
        Self::with_provider(settings, store, provider).await
    }

    pub async fn with_provider(
        settings: Settings,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn ChatStreamProvider>,
    ) -> Result<Self> {
        let persistence = ConversationStore::new(store.clone());
        let session = SessionManager::load(persistence, provider, settings.params.clone()).await?;

        let search: Arc<dyn SearchProvider> = match &settings.search_url {
            Some(url) => Arc::new(ApiSearch::new(url.clone())),
            None => Arc::new(StubSearch),
        };
        let algorand = AlgorandClient::new(settings.server_url.clone());

        Ok(Self {
            settings: Arc::new(settings),
            store,
            session,
            context: Arc::new(Mutex::new(ContextState::default())),
            search,
            algorand,
            wallet: None,
        })
    }

    /// Attaches a wallet integration; from then on sending requires a connected account.
    pub fn with_wallet(mut self, connector: Arc<dyn WalletConnector>) -> Self {
        self.wallet = Some(Arc::new(Mutex::new(Wallet::new(connector))));
        self
    }
}
