use crate::models::{ModelParams, DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use crate::storage::{KeyValueStore, GEMINI_KEY};
use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8787";
pub const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const KEYRING_SERVICE: &str = "daisy_api_key";
const KEYRING_USER: &str = "gemini";

/// Which streaming provider answers chat messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderMode {
    /// Call the generation API directly with a locally stored key.
    Client,
    /// Let the DAISY backend run the job and stream deltas back.
    Server,
}

impl FromStr for ProviderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(ProviderMode::Client),
            "server" => Ok(ProviderMode::Server),
            other => Err(anyhow::anyhow!("Unsupported DAISY_MODE: {}", other)),
        }
    }
}

/// Where the generation API key lives: the local store, an env var, or the OS keyring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiKeyRef {
    Store,
    Env(String),
    Keyring,
}

impl FromStr for ApiKeyRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "store" => Ok(ApiKeyRef::Store),
            "keyring" => Ok(ApiKeyRef::Keyring),
            ref_str if ref_str.starts_with("env:") => {
                let name = ref_str.trim_start_matches("env:");
                if name.is_empty() {
                    return Err(anyhow::anyhow!("Empty environment variable name in api key ref"));
                }
                Ok(ApiKeyRef::Env(name.to_string()))
            }
            other => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: ProviderMode,
    pub server_url: String,
    pub gemini_url: String,
    pub search_url: Option<String>,
    pub db_path: PathBuf,
    pub api_key_ref: ApiKeyRef,
    pub params: ModelParams,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from any variable source; missing values take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mode = match var("DAISY_MODE") {
            Some(raw) => raw.parse()?,
            None => ProviderMode::Server,
        };
        let api_key_ref = match var("DAISY_API_KEY_REF") {
            Some(raw) => raw.parse()?,
            None => ApiKeyRef::Store,
        };
        let temperature = match var("DAISY_TEMPERATURE") {
            Some(raw) => raw
                .trim()
                .parse::<f32>()
                .with_context(|| format!("Invalid DAISY_TEMPERATURE '{}'", raw))?,
            None => DEFAULT_TEMPERATURE,
        };
        let db_path = match var("DAISY_DB_PATH") {
            Some(raw) => PathBuf::from(raw),
            None => default_db_path()?,
        };

        Ok(Self {
            mode,
            server_url: trim_base(var("DAISY_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.into())),
            gemini_url: trim_base(var("DAISY_GEMINI_URL").unwrap_or_else(|| DEFAULT_GEMINI_URL.into())),
            search_url: var("DAISY_SEARCH_URL").map(trim_base),
            db_path,
            api_key_ref,
            params: ModelParams {
                model: var("DAISY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
                temperature,
            },
        })
    }
}

fn trim_base(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Could not determine local data directory")?;
    Ok(base.join("daisy").join("daisy.sqlite"))
}

/// Looks up the API key. `Ok(None)` means no key has been configured.
pub async fn get_api_key(key_ref: &ApiKeyRef, store: &dyn KeyValueStore) -> Result<Option<String>> {
    let key = match key_ref {
        ApiKeyRef::Store => {
            log::debug!("Retrieving API key from local store");
            store.get(GEMINI_KEY).await?
        }
        ApiKeyRef::Env(name) => {
            log::debug!("Retrieving API key from environment variable: {}", name);
            std::env::var(name).ok()
        }
        ApiKeyRef::Keyring => {
            log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER).context("Failed to create keyring entry")?;
            match entry.get_password() {
                Ok(key) => Some(key),
                Err(keyring::Error::NoEntry) => None,
                Err(e) => return Err(anyhow::Error::from(e).context("Failed to get API key from keyring")),
            }
        }
    };
    Ok(key.filter(|k| !k.trim().is_empty()))
}

/// Stores the API key wherever `key_ref` points.
pub async fn set_api_key(key_ref: &ApiKeyRef, store: &dyn KeyValueStore, api_key: &str) -> Result<()> {
    match key_ref {
        ApiKeyRef::Store => {
            log::info!("Saving API key to local store");
            store.set(GEMINI_KEY, api_key.trim()).await
        }
        ApiKeyRef::Keyring => {
            log::info!("Setting API key in keyring for service: {}", KEYRING_SERVICE);
            let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
                .context("Failed to create keyring entry for setting password")?;
            entry
                .set_password(api_key.trim())
                .context("Failed to set API key in keyring")
        }
        ApiKeyRef::Env(name) => Err(anyhow::anyhow!(
            "API key comes from environment variable '{}' and cannot be changed here",
            name
        )),
    }
}
