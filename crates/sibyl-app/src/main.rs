//! Sibyl application binary - composition root.
//!
//! Ties the Sibyl crates into a single executable:
//! 1. Load configuration from TOML (with CLI/env overrides)
//! 2. Select and open the storage backend (embedded or partitioned)
//! 3. Either serve the persistence REST API, or run one streaming query
//!    against the configured answer producer and persist the turn.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;

use sibyl_api::AppState;
use sibyl_core::config::SibylConfig;
use sibyl_core::types::{Message, User};
use sibyl_storage::{global_storage, Storage};
use sibyl_stream::{
    HttpTransport, SessionOptions, SessionOutcome, SessionUpdate, StreamSession,
};

mod cli;
use cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Tracing.
    let default_level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level)),
        )
        .init();

    tracing::info!("Starting Sibyl v{}", env!("CARGO_PKG_VERSION"));

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = SibylConfig::load_or_default(&config_file);
    config.server.port = args.resolve_port(config.server.port);

    // Storage: backend selected once per process, cached.
    let data_dir = args.resolve_data_dir(&config.general.data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let storage = global_storage(&config.storage, &data_dir)?.clone();
    tracing::info!(backend = ?storage.backend, dir = %data_dir.display(), "Storage ready");

    match args.command {
        None | Some(Command::Serve) => {
            let state = AppState::new(config, storage);
            sibyl_api::start_server(state).await?;
        }
        Some(Command::Ask {
            email,
            chat_id,
            query,
        }) => {
            run_query(&config, storage, &email, chat_id, &query).await?;
        }
    }

    Ok(())
}

/// Run one streaming query end to end: resolve the chat, stream the answer
/// to stdout as it arrives, persist the finalized message.
async fn run_query(
    config: &SibylConfig,
    storage: Storage,
    email: &str,
    chat_id: Option<String>,
    query: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Idempotent registration; repeat runs reuse the stored record.
    let user = storage.users.create_user(&User::new(email, ""))?;

    // Continue an existing chat, or open a new one seeded with this query.
    let (chat_id, history, seeded) = match chat_id {
        Some(id) => {
            let history = storage.chats.get_messages(&id)?;
            (id, history, false)
        }
        None => {
            let chat = storage.chats.create_chat("", &Message::user(query))?;
            storage.users.add_chat_to_user(&user.email, &chat.id)?;
            println!("chat: {}", chat.id);
            let history = chat.messages.clone();
            (chat.id, history, true)
        }
    };

    let transport = Arc::new(HttpTransport::new(config.query.endpoint.clone()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = StreamSession::new(
        transport,
        storage.chats.clone(),
        &chat_id,
        SessionOptions::from_config(&config.query, &user.email),
    )
    .with_history(history)
    .with_updates(tx);

    // Ctrl-C aborts the stream cooperatively; the partial answer is shown
    // but never persisted.
    let abort = session.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                SessionUpdate::Token(fragment) => {
                    print!("{}", fragment);
                    let _ = std::io::stdout().flush();
                }
                SessionUpdate::Status(status) => {
                    tracing::info!(status = %status, "Producer progress");
                }
                SessionUpdate::Completed(_) => {}
                SessionUpdate::Closed(_) => break,
            }
        }
    });

    let outcome = if seeded {
        session.answer_pending().await
    } else {
        session.submit(query).await
    };
    // Dropping the session closes the update channel so the printer task
    // drains and exits even when no terminal update was emitted.
    drop(session);
    let _ = printer.await;

    match outcome? {
        SessionOutcome::Completed(message) => {
            println!();
            if let Some(references) = message.source_docs {
                println!();
                for reference in references {
                    match reference.pages {
                        Some(pages) => {
                            println!("{}: {} (pages {})", reference.title, reference.url, pages)
                        }
                        None => println!("{}: {}", reference.title, reference.url),
                    }
                }
            }
        }
        SessionOutcome::Aborted => {
            println!();
            tracing::warn!("Stream aborted; partial answer not persisted");
        }
    }

    Ok(())
}
