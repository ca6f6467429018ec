use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use artifact_chat::orchestrator::ExchangeEvent;
use artifact_chat::settings::{
    Credentials, GlobalDefaults, RequestOverrides, StoredSettings, default_settings_path, resolve_effective_settings,
};
use artifact_chat::{ChatApiClient, ChatOrchestrator, ConversationStore, SandboxRunner};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "artifact-chat")]
#[command(about = "Terminal chat client that pulls code artifacts out of streamed replies", long_about = None)]
struct Cli {
    /// Backend base URL
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Preferred programming language, sent as a hint with each message
    #[arg(long, global = true)]
    language: Option<String>,
    /// Request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[arg(long, global = true)]
    gemini_key: Option<String>,
    #[arg(long, global = true)]
    e2b_key: Option<String>,
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive session
    Chat,
    /// Send one message and print the reply
    Send { message: String },
    /// Execute a file in the remote sandbox
    Run {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "python")]
        language: String,
    },
    /// Check that the backend is reachable
    Health,
    /// Persist the given global flags into the settings file
    Configure,
}

impl Cli {
    fn overrides(&self) -> RequestOverrides {
        let credentials = (self.gemini_key.is_some() || self.e2b_key.is_some())
            .then(|| Credentials { gemini_api_key: self.gemini_key.clone(), e2b_api_key: self.e2b_key.clone() });
        RequestOverrides {
            api_base_url: self.api_url.clone(),
            credentials,
            language: self.language.clone(),
            timeout_secs: self.timeout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let stored = StoredSettings::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;
    let overrides = cli.overrides();

    let settings = resolve_effective_settings(&GlobalDefaults::from_env(), &stored, &overrides);

    match cli.command {
        Commands::Configure => {
            let updated = StoredSettings {
                api_base_url: overrides.api_base_url.or(stored.api_base_url),
                credentials: overrides.credentials.or(stored.credentials),
                language: overrides.language.or(stored.language),
                timeout_secs: overrides.timeout_secs.or(stored.timeout_secs),
            };
            updated.save(&config_path)?;
            println!("saved {}", config_path.display());
        }
        Commands::Health => {
            let client = ChatApiClient::new(&settings)?;
            let status = client.health_check().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Run { file, language } => {
            let code = tokio::fs::read_to_string(&file).await.with_context(|| format!("reading {}", file.display()))?;
            let runner = SandboxRunner::new(ChatApiClient::new(&settings)?);
            let result = runner.run(&code, &language, uuid::Uuid::new_v4()).await?;
            print_result(&result);
        }
        Commands::Send { message } => {
            let orch = ChatOrchestrator::new(ChatApiClient::new(&settings)?, ConversationStore::new());
            orch.store().set_selected_language(settings.language.clone()).await;
            let printer = tokio::spawn(print_events(orch.subscribe()));
            let outcome = send_cancellable(&orch, &message).await;
            let artifacts = orch.store().snapshot().await.artifacts;
            // Dropping the orchestrator closes the event channel; the printer drains what is queued, then exits.
            drop(orch);
            printer.await?;
            outcome?;
            for artifact in artifacts {
                println!("\n--- {} ({}) ---\n{}", artifact.title, artifact.language, artifact.code);
            }
        }
        Commands::Chat => {
            let client = ChatApiClient::new(&settings)?;
            let store = ConversationStore::new();
            store.set_selected_language(settings.language.clone()).await;
            let orch = ChatOrchestrator::new(client.clone(), store);
            let runner = SandboxRunner::new(client);
            let printer = tokio::spawn(print_events(orch.subscribe()));
            let outcome = repl(&orch, &runner).await;
            drop(orch);
            printer.await?;
            outcome?;
        }
    }
    Ok(())
}

async fn send_cancellable(orch: &ChatOrchestrator<ChatApiClient>, message: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = orch.send_with_cancel(message, cancel).await;
    watcher.abort();
    let summary = outcome?;
    if !summary.completed {
        eprintln!("(reply ended early)");
    }
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ExchangeEvent>) {
    loop {
        match events.recv().await {
            Ok(ExchangeEvent::Delta { text, .. }) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            Ok(ExchangeEvent::Artifact { artifact }) => {
                print!("[artifact: {} ({})]", artifact.title, artifact.language);
                let _ = std::io::stdout().flush();
            }
            Ok(ExchangeEvent::Completed { .. }) => println!(),
            Ok(ExchangeEvent::Failed { error, .. }) => eprintln!("\nerror: {error}"),
            Ok(ExchangeEvent::Started { .. }) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => eprintln!("\n(skipped {n} events)"),
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_result(result: &artifact_chat::ExecutionResult) {
    if !result.output.is_empty() {
        println!("{}", result.output);
    }
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }
    if let Some(url) = &result.preview_url {
        println!("preview: {url}");
    }
    match result.execution_time_ms {
        Some(ms) => println!("[{} in {ms:.0} ms]", if result.success { "ok" } else { "failed" }),
        None => println!("[{}]", if result.success { "ok" } else { "failed" }),
    }
}

async fn repl(orch: &ChatOrchestrator<ChatApiClient>, runner: &SandboxRunner<ChatApiClient>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("/history /artifacts /show <n> /run [n] /lang [name] /clear /quit");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, Some(a.trim())),
            None => (line, None),
        };
        match command {
            "/quit" | "/exit" => break,
            "/clear" => {
                orch.clear_conversation().await;
                println!("conversation cleared");
            }
            "/lang" => {
                orch.store().set_selected_language(arg.map(ToString::to_string)).await;
                println!("language: {}", arg.unwrap_or("any"));
            }
            "/artifacts" => {
                let state = orch.store().snapshot().await;
                for (i, a) in state.artifacts.iter().enumerate() {
                    let marker = if state.active_artifact.as_deref() == Some(a.id.as_str()) { "*" } else { " " };
                    println!("{marker}{}. {} ({})", i + 1, a.title, a.language);
                }
            }
            "/history" => {
                let state = orch.store().snapshot().await;
                for (i, m) in state.messages.iter().enumerate() {
                    let linked = state.artifact_for_message(i).map(|a| format!(" [{}]", a.title)).unwrap_or_default();
                    println!("{} {}: {}{linked}", m.timestamp.format("%H:%M:%S"), m.role.as_str(), m.content);
                }
            }
            "/show" | "/run" => {
                let state = orch.store().snapshot().await;
                let picked = match arg.map(str::parse::<usize>) {
                    Some(Ok(n)) if n >= 1 => state.artifacts.get(n - 1),
                    Some(_) => None,
                    None => state.active_artifact(),
                };
                let Some(artifact) = picked.cloned() else {
                    eprintln!("no such artifact");
                    continue;
                };
                orch.store().set_active_artifact(Some(&artifact.id)).await?;
                if command == "/show" {
                    println!("--- {} ({}) ---\n{}", artifact.title, artifact.language, artifact.code);
                    continue;
                }
                let session_id = orch.store().begin_session().await;
                match runner.run(&artifact.code, &artifact.language, session_id).await {
                    Ok(result) => print_result(&result),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            _ if command.starts_with('/') => eprintln!("unknown command {command}"),
            _ => {
                if let Err(e) = send_cancellable(orch, line).await {
                    tracing::debug!(error = %e, "exchange ended with error");
                }
            }
        }
    }
    Ok(())
}
