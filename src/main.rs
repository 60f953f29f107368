use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley_core::security::Credential;
use parley_server::settings::{self, Settings};
use parley_store::{ChatService, Database};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "parley", about = "Live topic-scoped chat delivery over WebSocket")]
struct Cli {
    /// Settings file; defaults to ~/.parley/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Manage accounts directly against the store.
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create an account and print its api key.
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        description: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => settings::load_settings_from_path(path),
        None => settings::load_settings(),
    }
    .context("failed to load settings")?;

    parley_telemetry::init_telemetry(settings.logging.telemetry_config()?)
        .context("failed to initialise logging")?;

    let db = open_database(Path::new(&settings.store.db_path))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&settings, db).await,
        Command::User {
            action:
                UserAction::Add {
                    username,
                    password,
                    description,
                },
        } => {
            let (events, _) = broadcast::channel(1);
            let service = ChatService::new(db, events);
            let created = service
                .create_user(&username, &Credential::new(password), &description)
                .await
                .with_context(|| format!("failed to create user {username}"))?;
            println!("{}", created.api_key);
            Ok(())
        }
    }
}

fn open_database(path: &Path) -> anyhow::Result<Database> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let db = Database::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    tracing::info!(path = %path.display(), "database opened");
    Ok(db)
}

async fn serve(settings: &Settings, db: Database) -> anyhow::Result<()> {
    let handle = parley_server::start(&settings.server, db)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
