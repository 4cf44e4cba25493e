// Declare the modules
pub mod algorand;
pub mod api;
pub mod commands;
pub mod config;
pub mod context;
pub mod models;
pub mod search;
pub mod session;
pub mod state;
pub mod storage;
pub mod wallet;

use anyhow::Result;
use config::Settings;
use state::AppState;
use std::io::Write;
use tokio::io::BufReader;

pub async fn run() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let settings = Settings::from_env()?;
    log::info!(
        "Starting in {:?} mode, database at {}",
        settings.mode,
        settings.db_path.display()
    );
    let state = AppState::initialize(settings).await?;

    let mut out = std::io::stdout();
    writeln!(out, "DAISY ready. Type /help for commands.")?;
    // Once a send has listened for Ctrl-C the default handler is gone, so the prompt listens too
    commands::repl(&state, BufReader::new(tokio::io::stdin()), &mut out, tokio::signal::ctrl_c).await
}
