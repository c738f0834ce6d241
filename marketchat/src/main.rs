//! `MarketChat`: direct messages between farmers and buyers.
//!
//! Reads commands and messages from stdin and prints the open
//! conversation whenever it changes. Configuration via CLI flags,
//! environment variables, or config file (`~/.config/marketchat/config.toml`).
//!
//! ```bash
//! cargo run --bin marketchat -- --api-url http://127.0.0.1:5000 \
//!     --user-id 3 --role buyer --token "$TOKEN" --contact 7
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use futures_util::StreamExt;
use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::stream::FuturesUnordered;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use marketchat::app::{self, Command, HELP, Renderer};
use marketchat::chat::snapshot::Snapshot;
use marketchat::chat::{ConversationEngine, EngineError, LoadOlderOutcome};
use marketchat::config::{CliArgs, ClientConfig};
use marketchat::gateway::rest::RestGateway;
use marketchat_proto::message::{LocalId, UserId};

type Engine = ConversationEngine<RestGateway>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    // Logs go to a file; stdout belongs to the conversation view.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let session = match config.session() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let gateway = match config
        .rest_config()
        .map_err(|e| e.to_string())
        .and_then(|rest| RestGateway::new(rest).map_err(|e| e.to_string()))
    {
        Ok(g) => g,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    tracing::info!(user = %session.user_id, role = %session.role, "marketchat starting");
    let engine = ConversationEngine::new(gateway, session, &config.engine_config());
    let renderer = Renderer::new(session.user_id, config.timestamp_format.clone());

    let result = run(&engine, &renderer, cli.contact.map(UserId::new)).await;

    tracing::info!("marketchat exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("input error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Sends tracing output to `--log-file` (default `marketchat.log` in the
/// temp dir) so it never interleaves with the conversation printed on
/// stdout. `RUST_LOG`, when set, overrides `--log-level`.
///
/// Returns `None`, leaving logging off, if the file cannot be placed.
/// The returned guard flushes buffered entries when dropped.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let log_path = log_path(file_path);
    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?;
    std::fs::create_dir_all(log_dir).ok()?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .init();

    Some(guard)
}

fn log_path(file_path: Option<&Path>) -> PathBuf {
    file_path.map_or_else(
        || std::env::temp_dir().join("marketchat.log"),
        Path::to_path_buf,
    )
}

/// Input loop.
///
/// Engine operations run concurrently in `in_flight` so a slow page load
/// never blocks typing or sending.
async fn run(engine: &Engine, renderer: &Renderer, contact: Option<UserId>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = engine.subscribe();
    let mut in_flight: FuturesUnordered<LocalBoxFuture<'_, Option<String>>> =
        FuturesUnordered::new();

    in_flight.push(startup(engine, contact).boxed_local());
    print_lines(HELP.iter().copied());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match app::parse_command(&line) {
                    Ok(Command::Quit) => return Ok(()),
                    Ok(Command::Help) => print_lines(HELP.iter().copied()),
                    Ok(Command::Contacts) => {
                        print_lines(renderer.contacts(&engine.snapshot()));
                        in_flight.push(reload_contacts(engine).boxed_local());
                    }
                    Ok(command) => in_flight.push(dispatch(engine, command).boxed_local()),
                    Err(e) => println!("{e}"),
                }
            }
            Some(notice) = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(notice) = notice {
                    println!("{notice}");
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = snapshots.borrow_and_update().clone();
                render(renderer, &snapshot);
            }
        }
    }
}

/// Loads contacts, then opens the deep-linked conversation if any.
async fn startup(engine: &Engine, contact: Option<UserId>) -> Option<String> {
    if let Err(e) = engine.load_contacts().await {
        return Some(e.to_string());
    }
    let id = contact?;
    engine.select_contact_by_id(id).await.err().map(|e| e.to_string())
}

async fn reload_contacts(engine: &Engine) -> Option<String> {
    engine.load_contacts().await.err().map(|e| e.to_string())
}

async fn dispatch(engine: &Engine, command: Command) -> Option<String> {
    let result: Result<Option<String>, EngineError> = match command {
        Command::Open(id) => engine.select_contact_by_id(id).await.map(|()| None),
        Command::Older => engine.load_older().await.map(|outcome| match outcome {
            LoadOlderOutcome::AlreadyComplete => Some("no older messages".to_string()),
            LoadOlderOutcome::NotReady => Some("still loading".to_string()),
            LoadOlderOutcome::Loaded { .. } => None,
        }),
        Command::Retry => engine
            .retry()
            .await
            .map(|retried| (!retried).then(|| "nothing to retry".to_string())),
        Command::Resend(n) => match nth_failed(engine, n) {
            Some(local) => engine.retry_send(local).await.map(|_| None),
            None => Ok(Some(format!("no failed message {n}"))),
        },
        Command::Discard(n) => match nth_failed(engine, n) {
            Some(local) => engine.discard_failed(local).map(|()| None),
            None => Ok(Some(format!("no failed message {n}"))),
        },
        Command::Dismiss => {
            engine.dismiss_error();
            Ok(None)
        }
        Command::Send(text) => engine.send(&text).await.map(|_| None),
        Command::Contacts | Command::Help | Command::Quit => Ok(None),
    };
    // Fetch and send failures are already shown in the conversation view.
    match result {
        Ok(notice) => notice,
        Err(EngineError::Fetch(_) | EngineError::Send(_)) => None,
        Err(e) => Some(e.to_string()),
    }
}

fn nth_failed(engine: &Engine, n: usize) -> Option<LocalId> {
    app::failed_messages(&engine.snapshot())
        .get(n.checked_sub(1)?)
        .copied()
}

fn render(renderer: &Renderer, snapshot: &Snapshot) {
    if snapshot.active.is_none() {
        if !snapshot.contacts_loading {
            print_lines(renderer.contacts(snapshot));
        }
        return;
    }
    println!();
    print_lines(renderer.conversation(snapshot));
}

fn print_lines<S: AsRef<str>>(lines: impl IntoIterator<Item = S>) {
    for line in lines {
        println!("{}", line.as_ref());
    }
}
