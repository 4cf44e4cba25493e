use anyhow::Context;
use async_trait::async_trait;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::Conversation;

pub const CONVERSATIONS_KEY: &str = "daisy:conversations:v1";
pub const GEMINI_KEY: &str = "daisy:gemini:key";
pub const THEME_KEY: &str = "daisy:theme";

// Single key-value table; every persisted value is a string under a fixed key
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Durable string key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    pool: SqlitePool,
}

impl SqliteKeyValueStore {
    /// Opens (creating if needed) the database at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        log::debug!("Reading key {} from database", key);
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read key '{}' from database", key))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        log::debug!("Writing key {} ({} bytes) to database", key, value.len());
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write key '{}' to database", key))?;
        Ok(())
    }
}

/// In-memory store for tests and throwaway sessions.
#[derive(Clone, Default)]
pub struct MemoryKeyValueStore {
    values: Arc<RwLock<HashMap<String, String>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Persists the complete conversation list under one key.
#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns `None` when nothing has been saved yet.
    pub async fn load_all(&self) -> anyhow::Result<Option<Vec<Conversation>>> {
        let Some(raw) = self.store.get(CONVERSATIONS_KEY).await? else {
            log::info!("No persisted conversations found");
            return Ok(None);
        };
        let conversations: Vec<Conversation> =
            serde_json::from_str(&raw).context("Failed to parse persisted conversations")?;
        log::info!("Loaded {} conversations", conversations.len());
        Ok(Some(conversations))
    }

    /// Overwrites whatever list was stored before.
    pub async fn save_all(&self, conversations: &[Conversation]) -> anyhow::Result<()> {
        let raw = serde_json::to_string(conversations).context("Failed to serialize conversations")?;
        self.store.set(CONVERSATIONS_KEY, &raw).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Theme::Dark => f.write_str("dark"),
            Theme::Light => f.write_str("light"),
        }
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "dark" => Ok(Theme::Dark),
            "light" => Ok(Theme::Light),
            other => Err(anyhow::anyhow!("Unknown theme: {}", other)),
        }
    }
}

/// Reads the theme preference, falling back to dark for missing or unknown values.
pub async fn load_theme(store: &dyn KeyValueStore) -> anyhow::Result<Theme> {
    let theme = store
        .get(THEME_KEY)
        .await?
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();
    Ok(theme)
}

pub async fn save_theme(store: &dyn KeyValueStore, theme: Theme) -> anyhow::Result<()> {
    store.set(THEME_KEY, &theme.to_string()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn sample_conversations() -> Vec<Conversation> {
        let mut first = Conversation::new();
        first.title = "Rust questions".into();
        first.messages.push(Message::user("What is a lifetime?"));
        let mut reply = Message::assistant_placeholder();
        reply.content = "A lifetime is a **region**.".into();
        first.messages.push(reply);
        vec![first, Conversation::new()]
    }

    #[tokio::test]
    async fn sqlite_store_upserts_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteKeyValueStore::open(&dir.path().join("nested/daisy.sqlite"))
            .await
            .unwrap();

        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("k", "one").await.unwrap();
        store.set("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daisy.sqlite");
        {
            let store = SqliteKeyValueStore::open(&path).await.unwrap();
            store.set(GEMINI_KEY, "secret").await.unwrap();
        }
        let reopened = SqliteKeyValueStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(GEMINI_KEY).await.unwrap().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn load_all_reports_absence() {
        let store = ConversationStore::new(Arc::new(MemoryKeyValueStore::new()));
        assert!(store.load_all().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_equal_list() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKeyValueStore::open(&dir.path().join("daisy.sqlite"))
            .await
            .unwrap();
        let store = ConversationStore::new(Arc::new(kv));
        let conversations = sample_conversations();

        store.save_all(&conversations).await.unwrap();
        let loaded = store.load_all().await.unwrap().unwrap();
        assert_eq!(loaded, conversations);
    }

    #[tokio::test]
    async fn save_all_overwrites_previous_list() {
        let store = ConversationStore::new(Arc::new(MemoryKeyValueStore::new()));
        store.save_all(&sample_conversations()).await.unwrap();
        store.save_all(&[]).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn corrupt_payload_is_an_error() {
        let kv = MemoryKeyValueStore::new();
        kv.set(CONVERSATIONS_KEY, "{not json").await.unwrap();
        let store = ConversationStore::new(Arc::new(kv));
        assert!(store.load_all().await.is_err());
    }

    #[tokio::test]
    async fn theme_defaults_to_dark_and_round_trips() {
        let kv = MemoryKeyValueStore::new();
        assert_eq!(load_theme(&kv).await.unwrap(), Theme::Dark);

        save_theme(&kv, Theme::Light).await.unwrap();
        assert_eq!(kv.get(THEME_KEY).await.unwrap().as_deref(), Some("light"));
        assert_eq!(load_theme(&kv).await.unwrap(), Theme::Light);

        kv.set(THEME_KEY, "sepia").await.unwrap();
        assert_eq!(load_theme(&kv).await.unwrap(), Theme::Dark);
    }
}
