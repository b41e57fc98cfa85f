use std::path::PathBuf;

use authgate::hub::ConnectionStatus;
use authgate::{AuthConfig, AuthMode, AuthSession, HubEvent, RefreshOptions};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config: {0}")]
    Config(#[from] authgate::ConfigError),
    #[error("session: {0}")]
    Session(#[from] authgate::SessionError),
    #[error("api: {0}")]
    Api(#[from] authgate::ApiError),
    #[error("not signed in; run `authgate login` first")]
    NotAuthenticated,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "authgate", about = "Auth session CLI: identity, mode, login, and channels")]
struct Cli {
    #[arg(long, env = "AUTHGATE_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "AUTHGATE_AUTH_MODE")]
    auth_mode: Option<AuthMode>,

    #[arg(long, env = "AUTHGATE_TOKEN_STORE")]
    token_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one identity check and print the committed state.
    Whoami,
    /// Print the resolved transport and the rule that chose it.
    Mode,
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "AUTHGATE_PASSWORD")]
        password: String,
    },
    Logout,
    /// Open channels and print their events until every one closes.
    Listen {
        #[arg(long = "channel", required = true)]
        channels: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AuthConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_owned();
    }
    if cli.auth_mode.is_some() {
        config.forced_mode = cli.auth_mode;
    }
    if cli.token_store.is_some() {
        config.token_store_path = cli.token_store;
    }

    let session = AuthSession::create(config).await?;
    let result = match cli.command {
        Command::Whoami => run_whoami(&session).await,
        Command::Mode => run_mode(&session).await,
        Command::Login { email, password } => run_login(&session, &email, &password).await,
        Command::Logout => run_logout(&session).await,
        Command::Listen { channels } => run_listen(&session, channels).await,
    };
    session.dispose();
    result
}

async fn run_whoami(session: &AuthSession) -> Result<(), CliError> {
    let state = session.orchestrator().refresh_auth(RefreshOptions::default()).await;
    print_json(&*state)
}

async fn run_mode(session: &AuthSession) -> Result<(), CliError> {
    let resolution = session.resolution().await;
    print_json(&json!({
        "mode": resolution.mode,
        "source": resolution.source,
        "base_url": session.config().base_url,
    }))
}

async fn run_login(session: &AuthSession, email: &str, password: &str) -> Result<(), CliError> {
    let state = session.login(email, password).await?;
    print_json(&*state)
}

async fn run_logout(session: &AuthSession) -> Result<(), CliError> {
    let outcome = session.logout().await;
    print_json(&json!({
        "state": &*outcome.state,
        "backend_error": outcome.backend_error.as_ref().map(ToString::to_string),
    }))
}

async fn run_listen(session: &AuthSession, channels: Vec<String>) -> Result<(), CliError> {
    let state = session.orchestrator().refresh_auth(RefreshOptions::default()).await;
    if !state.is_ready() {
        return Err(CliError::NotAuthenticated);
    }

    let hub = session.hub();
    let mut events = hub.events();
    hub.start(channels.iter().map(|name| (name.clone(), true)));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_json(&event)?;
                    if matches!(event, HubEvent::ConnectionFailed { .. } | HubEvent::Disconnected { .. })
                        && channels.iter().all(|name| is_closed(hub.get_connection_status(name)))
                    {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                hub.stop_all();
                return Ok(());
            }
        }
    }
}

fn is_closed(status: ConnectionStatus) -> bool {
    matches!(status, ConnectionStatus::Failed | ConnectionStatus::Disconnected)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
