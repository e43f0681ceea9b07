use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use finchat_core::http::Method;
use finchat_core::testkit::{FakeAuthority, RecordingObserver, ScriptedBackend, ScriptedResponse};
use finchat_core::{
    telemetry, AbortSignal, ChatPhase, ChatTransport, CredentialFile, CredentialStore,
    TransportConfig,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Finchat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one chat round trip against in-process fakes.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let store = Arc::new(CredentialStore::persistent(CredentialFile::new(
        temp_dir.path().join("credential.json"),
    )));

    let backend = Arc::new(ScriptedBackend::new());
    backend.respond(
        Method::POST,
        "/sessions",
        ScriptedResponse::json(200, json!({ "id": "smoke" })),
    );
    backend.respond(
        Method::POST,
        "/sessions/smoke/chat",
        ScriptedResponse::frames(&[r#"{"delta":"pong"}"#, r#"{"done":true}"#]).0,
    );

    let config = TransportConfig::new("http://smoke.invalid/".parse()?);
    let transport = ChatTransport::new(
        Arc::new(FakeAuthority::signed_in("smoke-user")),
        backend.clone(),
        store,
        config,
    );
    let mut observer = RecordingObserver::default();
    let phase = runtime.block_on(transport.send_message(
        "ping from xtask",
        &mut observer,
        AbortSignal::never(),
    ));

    if phase != ChatPhase::Completed || observer.text() != "pong" {
        bail!("smoke chat ended in {phase:?} with {observer:?}");
    }
    info!(
        requests = backend.requests().len(),
        reply = %observer.text(),
        "smoke chat completed"
    );
    Ok(())
}
