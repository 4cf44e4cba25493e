// Terminal commands driving the session

use crate::config;
use crate::models::ModelParamsUpdate;
use crate::session::{SessionEvent, StreamStatus};
use crate::state::{AppState, SharedWallet};
use crate::storage::{self, Theme};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

pub const HELP: &str = "\
/new                 start a new conversation
/list                list conversations (* marks the current one)
/use <n|id>          switch to a conversation by list number or id
/rename <title>      rename the current conversation
/model <name>        set the model for the next messages
/temp <value>        set the temperature for the next messages
/key <api key>       store the generation API key
/theme [dark|light]  show or set the theme preference
/search <query>      search and add results to the context panel
/params              show network params from the backend
/connect             connect the wallet
/disconnect          disconnect the wallet
/broadcast <txn>     sign a base64 transaction with the wallet and broadcast it
/help                show this help
/quit                exit
Anything else is sent as a message. Ctrl-C stops a reply in progress and quits at the prompt.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New,
    List,
    Use(String),
    Rename(String),
    Model(String),
    Temperature(f32),
    Key(String),
    Theme(Option<Theme>),
    Search(String),
    Params,
    Connect,
    Disconnect,
    Broadcast(String),
    Help,
    Quit,
    Send(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

fn required<'a>(arg: &'a str, usage: &str) -> Result<&'a str> {
    if arg.is_empty() {
        return Err(anyhow::anyhow!("Usage: {}", usage));
    }
    Ok(arg)
}

pub fn parse(line: &str) -> Result<Command> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "new" => Command::New,
        "list" => Command::List,
        "use" => Command::Use(required(arg, "/use <n|id>")?.to_string()),
        "rename" => Command::Rename(required(arg, "/rename <title>")?.to_string()),
        "model" => Command::Model(required(arg, "/model <name>")?.to_string()),
        "temp" => {
            let raw = required(arg, "/temp <value>")?;
            Command::Temperature(raw.parse().with_context(|| format!("Invalid temperature '{}'", raw))?)
        }
        "key" => Command::Key(required(arg, "/key <api key>")?.to_string()),
        "theme" if arg.is_empty() => Command::Theme(None),
        "theme" => Command::Theme(Some(arg.parse()?)),
        "search" => Command::Search(required(arg, "/search <query>")?.to_string()),
        "params" => Command::Params,
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "broadcast" => Command::Broadcast(required(arg, "/broadcast <base64 txn>")?.to_string()),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(anyhow::anyhow!("Unknown command /{} (try /help)", other)),
    };
    Ok(command)
}

async fn resolve_conversation(state: &AppState, target: &str) -> Result<Uuid> {
    if let Ok(index) = target.parse::<usize>() {
        let conversations = state.session.conversations().await;
        return index
            .checked_sub(1)
            .and_then(|i| conversations.get(i))
            .map(|c| c.id)
            .ok_or_else(|| anyhow::anyhow!("No conversation number {}", index));
    }
    Uuid::parse_str(target).with_context(|| format!("Invalid conversation ID format: {}", target))
}

pub async fn execute<W: Write>(state: &AppState, command: Command, out: &mut W) -> Result<Flow> {
    match command {
        Command::New => {
            let id = state.session.create_conversation().await?;
            writeln!(out, "Started conversation {}", id)?;
        }
        Command::List => {
            let current = state.session.current_id().await;
            for (i, conversation) in state.session.conversations().await.iter().enumerate() {
                let marker = if conversation.id == current { '*' } else { ' ' };
                writeln!(
                    out,
                    "{} {}. {} ({} messages) [{}]",
                    marker,
                    i + 1,
                    conversation.title,
                    conversation.messages.len(),
                    conversation.id
                )?;
            }
        }
        Command::Use(target) => {
            let id = resolve_conversation(state, &target).await?;
            state.session.set_current(id).await?;
            let conversation = state.session.current().await;
            writeln!(out, "Now in \"{}\"", conversation.title)?;
            for message in &conversation.messages {
                writeln!(out, "[{:?}] {}", message.role, message.content)?;
            }
        }
        Command::Rename(title) => {
            let id = state.session.current_id().await;
            state.session.rename_conversation(id, &title).await?;
            writeln!(out, "Renamed to \"{}\"", title)?;
        }
        Command::Model(model) => {
            state
                .session
                .set_params(ModelParamsUpdate {
                    model: Some(model),
                    temperature: None,
                })
                .await;
        }
        Command::Temperature(temperature) => {
            state
                .session
                .set_params(ModelParamsUpdate {
                    model: None,
                    temperature: Some(temperature),
                })
                .await;
        }
        Command::Key(key) => {
            config::set_api_key(&state.settings.api_key_ref, state.store.as_ref(), &key).await?;
            writeln!(out, "API key saved")?;
        }
        Command::Theme(Some(theme)) => {
            storage::save_theme(state.store.as_ref(), theme).await?;
            writeln!(out, "Theme set to {}", theme)?;
        }
        Command::Theme(None) => {
            let theme = storage::load_theme(state.store.as_ref()).await?;
            writeln!(out, "Theme: {}", theme)?;
        }
        Command::Search(query) => {
            let results = state.search.search(&query).await;
            for result in &results {
                writeln!(out, "- {} <{}>\n  {}", result.title, result.url, result.snippet)?;
            }
            if results.is_empty() {
                writeln!(out, "No results")?;
            }
            state.context.lock().await.add_web_results(results);
        }
        Command::Params => {
            let params = state.algorand.suggested_params().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&params)?)?;
        }
        Command::Connect => {
            let wallet = configured_wallet(state)?;
            let mut wallet = wallet.lock().await;
            let address = wallet.connect().await?;
            writeln!(out, "Wallet connected: {}", address)?;
        }
        Command::Disconnect => {
            configured_wallet(state)?.lock().await.disconnect().await?;
            writeln!(out, "Wallet disconnected")?;
        }
        Command::Broadcast(txn) => {
            let unsigned = STANDARD
                .decode(txn.trim())
                .context("Transaction is not valid base64")?;
            let signed = configured_wallet(state)?
                .lock()
                .await
                .sign_transactions(&[unsigned])
                .await?;
            for stx in signed {
                let result = state.algorand.send_signed_tx(&stx).await?;
                writeln!(out, "{}", result)?;
            }
        }
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Quit => return Ok(Flow::Quit),
        Command::Send(text) => send(state, text, out).await?,
    }
    Ok(Flow::Continue)
}

fn configured_wallet(state: &AppState) -> Result<&SharedWallet> {
    state
        .wallet
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No wallet integration is configured"))
}

// Streams the reply to `out` as chunks arrive
async fn send<W: Write>(state: &AppState, text: String, out: &mut W) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    if let Some(wallet) = &state.wallet {
        if !wallet.lock().await.can_send(&text) {
            writeln!(out, "Connect a wallet with /connect before sending")?;
            return Ok(());
        }
    }
    if state.settings.search_url.is_some() {
        // The query backend sees every prompt before the reply is requested
        let results = state.search.search(&text).await;
        state.context.lock().await.add_web_results(results);
    }

    let conversation_id = state.session.current_id().await;
    let mut events = state.session.subscribe();
    let session = state.session.clone();
    let mut sending = tokio::spawn(async move { session.send_message(&text).await });

    let outcome = loop {
        tokio::select! {
            joined = &mut sending => break joined.context("Send task failed")??,
            event = events.recv() => match event {
                Ok(SessionEvent::MessageChunk { conversation_id: id, delta, .. }) if id == conversation_id => {
                    write!(out, "{}", delta)?;
                    out.flush()?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => log::warn!("Display skipped {} session events", skipped),
                Err(RecvError::Closed) => break (&mut sending).await.context("Send task failed")??,
            },
            _ = tokio::signal::ctrl_c() => {
                state.session.cancel(conversation_id);
            }
        }
    };

    // Chunks published just before the task finished
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::MessageChunk { conversation_id: id, delta, .. } = event {
            if id == conversation_id {
                write!(out, "{}", delta)?;
            }
        }
    }

    match outcome.map(|o| o.status) {
        Some(StreamStatus::Completed) => writeln!(out)?,
        Some(StreamStatus::Cancelled) => writeln!(out, "\n[stopped]")?,
        Some(StreamStatus::Failed(reason)) => writeln!(out, "\nError: {}", reason)?,
        None => {}
    }
    Ok(())
}

/// Reads and runs lines from `input` until `/quit`, end of input, or `interrupt`
/// resolving while waiting at the prompt.
pub async fn repl<R, W, I, F>(state: &AppState, input: R, out: &mut W, mut interrupt: I) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
    I: FnMut() -> F,
    F: Future,
{
    let mut lines = input.lines();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = interrupt() => {
                writeln!(out)?;
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                writeln!(out, "{}", e)?;
                continue;
            }
        };
        match execute(state, command, out).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(e) => {
                log::error!("Command failed: {:?}", e);
                writeln!(out, "Error: {:#}", e)?;
            }
        }
    }
    Ok(())
}
