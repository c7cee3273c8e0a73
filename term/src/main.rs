//! Mallu terminal client
//!
//! Chat with a match and place voice calls from the terminal.

mod config;
mod ui;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mallu_core::{
    ApiClient, ChatSession, CredentialStore, Credentials, SessionContext, SessionDeps, UserId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::ui::{Input, Renderer, TerminalRedirect};

/// Mallu terminal client
#[derive(Parser)]
#[command(name = "mallu")]
#[command(about = "Chat and call your matches from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory (defaults to the platform config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the access token issued by the login flow
    Login {
        /// JWT access token
        #[arg(long)]
        token: String,

        /// Refresh token, if the server issued one
        #[arg(long)]
        refresh: Option<String>,
    },

    /// Forget the stored credentials
    Logout,

    /// Open the chat with a match
    Chat {
        /// User id of the match
        partner: UserId,
    },

    /// Write the effective configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the chat.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mallu_term=info,mallu_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config_dir = cli
        .config_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("mallu")))
        .unwrap_or_else(|| PathBuf::from("."));
    let data_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mallu");
    let config = AppConfig::load(&config_dir)
        .with_context(|| format!("reading config in {}", config_dir.display()))?;

    tracing::debug!("Config directory: {:?}, data directory: {:?}", config_dir, data_dir);

    match cli.command {
        Commands::Login { token, refresh } => {
            let mut session = SessionContext::from_access_token(&token)?;
            session.refresh_token = refresh;
            CredentialStore::open(&data_dir)?.save(&session)?;
            println!("Logged in as user {}", session.user_id);
        }
        Commands::Logout => {
            CredentialStore::open(&data_dir)?.clear()?;
            println!("Logged out");
        }
        Commands::Chat { partner } => {
            run_chat(&config, &data_dir, partner).await?;
        }
        Commands::InitConfig => {
            config.save(&config_dir)?;
            println!("Wrote {}", config_dir.join("config.json").display());
        }
    }

    Ok(())
}

async fn run_chat(
    config: &AppConfig,
    data_dir: &std::path::Path,
    partner: UserId,
) -> anyhow::Result<()> {
    let store = Arc::new(CredentialStore::open(data_dir)?);
    let session = store
        .load()?
        .context("not logged in, run `mallu login --token <access token>` first")?;
    if session.user_id == partner {
        anyhow::bail!("cannot chat with yourself");
    }

    let redirect = Arc::new(TerminalRedirect::default());
    let credentials = Credentials::new(Some(session.clone()))
        .with_store(store)
        .with_redirect(redirect.clone());
    let client_config = config.client_config();
    let api = Arc::new(ApiClient::new(&client_config, Arc::new(credentials))?);

    tracing::info!("Opening chat with {} at {}", partner, client_config.api_base_url);
    let handle = ChatSession::open(SessionDeps::new(client_config, session, api), partner);
    let mut snapshots = handle.subscribe();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut renderer = Renderer::default();
    println!("Type a message and press enter. /help lists commands.");

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                for line in renderer.render(&snapshot, chrono::Utc::now()) {
                    println!("{}", line);
                }
                if snapshot.closed {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ui::parse_line(&line) {
                    Input::Commands(commands) => {
                        for command in commands {
                            handle.command(command)?;
                        }
                    }
                    Input::Help => println!("{}", ui::HELP),
                    Input::Quit => break,
                    Input::Invalid(reason) => println!("! {}", reason),
                    Input::Empty => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.close().await;
    if redirect.expired() {
        eprintln!("Your session expired. Log in again with `mallu login --token <access token>`.");
    }
    Ok(())
}
