use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_settings_from, ApiClient, ChatError, ChatSession, ClientSettings,
    DispatchOutcome, FileSessionBackend, LogMutation, SessionEvent, SessionStore,
    WebSocketTransport,
};
use shared::protocol::ChatMessage;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; missing is fine.
    #[arg(long, default_value = client_core::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `server_url` from the settings file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        display_name: String,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    /// Interactive chat. `/retry` reloads history, `/resend` retries the last
    /// unsent line, `/logout` signs out, `/quit` leaves.
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config, |name| std::env::var(name).ok())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
        settings.validate()?;
    }
    let store = Arc::new(
        SessionStore::open(FileSessionBackend::new(settings.session_file.clone()))
            .context("failed to open session file")?,
    );
    let api = ApiClient::new(settings.server_url.clone());

    match cli.command {
        Command::Register {
            email,
            password,
            display_name,
        } => {
            let registered = api.register(&email, &password, &display_name).await?;
            println!("registered user_id={}", registered.id);
        }
        Command::Login { email, password } => {
            let login = api.login(&email, &password).await?;
            store.set_session(login.token, login.display_name.clone())?;
            println!("signed in as {}", login.display_name);
        }
        Command::Logout => {
            store.clear_session()?;
            println!("signed out");
        }
        Command::Whoami => {
            let Some(token) = store.current_token() else {
                bail!("not signed in");
            };
            match api.me(&token).await {
                Ok(profile) => println!(
                    "{} <{}> user_id={}",
                    profile.display_name, profile.email, profile.id
                ),
                Err(err) if err.requires_reauth() => {
                    store.clear_session()?;
                    bail!("stored session was rejected; sign in again");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::Chat => run_chat(store, api, &settings).await?,
    }
    Ok(())
}

async fn run_chat(store: Arc<SessionStore>, api: ApiClient, settings: &ClientSettings) -> Result<()> {
    let transport = WebSocketTransport::new(settings.ws_url()?, settings.token_placement)
        .with_keepalive(settings.keepalive_interval());
    let (session, mut events) =
        ChatSession::start(store, Arc::new(api), Arc::new(transport), settings)?;

    session
        .subscribe_log(|mutation, messages| match mutation {
            LogMutation::Seeded { .. } => messages.iter().for_each(print_message),
            LogMutation::Inserted { index, .. } => {
                if let Some(message) = messages.get(index) {
                    print_message(message);
                }
            }
            LogMutation::Cleared => {}
        })
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut draft = String::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::ConnectionChanged(state)) => info!(?state, "connection"),
                Ok(SessionEvent::HistoryFailed(reason)) => {
                    eprintln!("history unavailable ({reason}); type /retry to load it again");
                }
                Ok(SessionEvent::AuthRejected) => {
                    eprintln!("the server rejected this session; sign in again");
                }
                Ok(SessionEvent::Ended) | Err(RecvError::Closed) => break,
                Ok(SessionEvent::CaughtUp { added }) if added > 0 => {
                    info!(added, "recovered messages sent while disconnected");
                }
                Ok(SessionEvent::HistoryLoaded { .. } | SessionEvent::CaughtUp { .. })
                | Err(RecvError::Lagged(_)) => {}
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/logout" => {
                        session.logout().await?;
                        println!("signed out");
                        return Ok(());
                    }
                    "/retry" => session.retry_history()?,
                    "/resend" => send(&session, &mut draft),
                    _ => {
                        draft.clone_from(&line);
                        send(&session, &mut draft);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn send(session: &ChatSession, draft: &mut String) {
    match session.dispatcher().send_draft(draft) {
        Ok(DispatchOutcome::Sent | DispatchOutcome::Suppressed) => {}
        Err(ChatError::ConnectionUnavailable) => {
            eprintln!("not connected; message kept, /resend once the connection is back");
        }
        Err(err) => eprintln!("message not sent: {err}"),
    }
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.display_name,
        message.content
    );
}
