use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use finchat::config::terminal_settings_path;
use finchat::{ensure_signed_in, load_terminal_settings, save_terminal_settings, TerminalObserver, TerminalSettings};
use finchat_core::identity::PrincipalCallback;
use finchat_core::session::{SessionId, SessionUpdate};
use finchat_core::{
    abort_pair, telemetry, AuthEvent, ChatPhase, ChatTransport, ClientSettings,
    IdentityAuthority, PasswordAuthority,
};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "finchat", version, about = "Chat with the Finchat advisor from a terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Continue the session used last time instead of starting a new one.
    #[arg(long, global = true)]
    resume: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one message and stream the reply. Ctrl-C stops the reply.
    Chat { message: Vec<String> },
    /// Read messages from stdin, one per line.
    Repl,
    /// List your chat sessions.
    Sessions,
    /// Print the messages of a session (default: the last one used).
    History { session: Option<String> },
    /// Print the server's summary of a session (default: the last one used).
    Summary { session: Option<String> },
    /// Give a session a new title.
    Rename { session: String, title: String },
    /// Close a session to further messages without deleting it.
    Deactivate { session: String },
    /// Delete a session.
    Delete { session: String },
    /// Forget the stored credential and session.
    SignOut,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::env_filter("warn"))?;
    let cli = Cli::parse();

    let runtime = Runtime::new()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = ClientSettings::load().map_err(|err| anyhow!(err.user_message()))?;
    let http = reqwest::Client::builder()
        .connect_timeout(settings.request_timeout)
        .timeout(settings.request_timeout)
        .build()
        .context("failed to build identity client")?;
    let authority = Arc::new(PasswordAuthority::new(settings.identity.clone(), http));
    let transport = ChatTransport::connect(&settings, authority.clone())?;

    let settings_path = terminal_settings_path();
    let mut terminal = load_terminal_settings(&settings_path).await?;

    if let Command::SignOut = cli.command {
        authority.sign_out();
        transport.sign_out("signed out from the command line");
        terminal.last_session = None;
        save_terminal_settings(&settings_path, &terminal).await?;
        println!("Signed out.");
        return Ok(());
    }

    let can_sign_in = settings.identity.email.is_some() && settings.identity.password.is_some();
    ensure_signed_in(authority.as_ref(), transport.tokens().store(), can_sign_in).await?;
    let watcher = transport.clone();
    let on_change: PrincipalCallback = Arc::new(move |principal| {
        if principal.is_none() {
            watcher.sign_out("identity provider ended the sign-in");
        }
    });
    let _subscription = authority.on_principal_changed(on_change);

    if cli.resume {
        if let Some(id) = terminal.last_session.clone() {
            transport.sessions().adopt(SessionId::new(id));
        }
    }

    match cli.command {
        Command::Chat { message } => {
            let text = message.join(" ");
            if text.trim().is_empty() {
                bail!("nothing to send");
            }
            let phase = chat_once(&transport, &text, &terminal).await;
            remember_session(&transport, &mut terminal, &settings_path).await?;
            if phase == ChatPhase::Failed {
                bail!("the message was not answered");
            }
        }
        Command::Repl => {
            repl(&transport, &terminal).await?;
            remember_session(&transport, &mut terminal, &settings_path).await?;
        }
        Command::Sessions => {
            let sessions = transport.sessions().list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions yet.");
            }
            for session in sessions {
                println!(
                    "{}\t{}\t{} messages",
                    session.id,
                    session.title.as_deref().unwrap_or("(untitled)"),
                    session.message_count.unwrap_or_default()
                );
            }
        }
        Command::History { session } => {
            let id = session_or_last(session, &terminal)?;
            let messages = transport.sessions().session_messages(&id).await?;
            for message in messages {
                println!("{}: {}", message.role, message.content);
            }
        }
        Command::Summary { session } => {
            let id = session_or_last(session, &terminal)?;
            let summary = transport.sessions().session_summary(&id).await?;
            println!("{}", summary.summary.as_deref().unwrap_or("(no summary yet)"));
        }
        Command::Rename { session, title } => {
            let update = SessionUpdate {
                title: Some(title),
                description: None,
            };
            let record = transport
                .sessions()
                .update_session(&SessionId::new(session), &update)
                .await?;
            println!("{}\t{}", record.id, record.title.as_deref().unwrap_or("(untitled)"));
        }
        Command::Deactivate { session } => {
            let id = SessionId::new(session);
            transport.sessions().deactivate_session(&id).await?;
            forget_last_session(&mut terminal, &id, &settings_path).await?;
            println!("Deactivated {id}.");
        }
        Command::Delete { session } => {
            let id = SessionId::new(session);
            transport.sessions().delete_session(&id).await?;
            forget_last_session(&mut terminal, &id, &settings_path).await?;
            println!("Deleted {id}.");
        }
        Command::SignOut => {}
    }
    Ok(())
}

async fn chat_once(transport: &ChatTransport, text: &str, terminal: &TerminalSettings) -> ChatPhase {
    let (abort, signal) = abort_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });
    let mut observer = TerminalObserver::new(io::stdout(), terminal.show_tool_results);
    let phase = transport.send_message(text, &mut observer, signal).await;
    interrupt.abort();
    if phase == ChatPhase::Canceled {
        println!("\n[stopped]");
    }
    phase
}

async fn repl(transport: &ChatTransport, terminal: &TerminalSettings) -> Result<()> {
    let mut auth_events = transport.auth_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type a message and press Enter. /quit leaves.");
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }
        chat_once(transport, text, terminal).await;
        if let Ok(AuthEvent::SignedOut { reason }) = auth_events.try_recv() {
            println!("Signed out ({reason}). Restart finchat to sign in again.");
            break;
        }
    }
    Ok(())
}

fn session_or_last(session: Option<String>, terminal: &TerminalSettings) -> Result<SessionId> {
    session
        .or_else(|| terminal.last_session.clone())
        .map(SessionId::new)
        .ok_or_else(|| anyhow!("no session given and none used before"))
}

async fn forget_last_session(
    terminal: &mut TerminalSettings,
    id: &SessionId,
    path: &std::path::Path,
) -> Result<()> {
    if terminal.last_session.as_deref() == Some(id.as_str()) {
        terminal.last_session = None;
        save_terminal_settings(path, terminal).await?;
    }
    Ok(())
}

async fn remember_session(
    transport: &ChatTransport,
    terminal: &mut TerminalSettings,
    path: &std::path::Path,
) -> Result<()> {
    let current = transport.sessions().current().map(|id| id.to_string());
    if current.is_some() && current != terminal.last_session {
        terminal.last_session = current;
        save_terminal_settings(path, terminal).await?;
    }
    Ok(())
}
