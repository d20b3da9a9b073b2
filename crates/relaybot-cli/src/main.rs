//! relaybot CLI: HTTP gateway, interactive chat, model catalog and history.
//!
//! Usage:
//!   relaybot serve           Start the HTTP gateway
//!   relaybot chat            Start an interactive chat session
//!   relaybot models          Show the model catalog
//!   relaybot history <id>    Print a saved transcript
//!   relaybot onboard         Create a default configuration
//!   relaybot status          Show current configuration and health

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use relaybot_core::agent::{ChatOrchestrator, OrchestratorConfig};
use relaybot_core::config::Config;
use relaybot_core::engine::{EngineConfig, FallbackEngine, StreamEvent};
use relaybot_core::gateway::{self, AppState};
use relaybot_core::history::{HistoryStore, JsonlHistoryStore};
use relaybot_core::models::{ModelCatalog, ModelDescriptor};
use relaybot_core::provider::openai::OpenRouterProvider;
use relaybot_core::provider::types::Role;
use relaybot_core::session::MemorySessionStore;
use relaybot_core::tools::builtin_registry;

#[derive(Parser)]
#[command(
    name = "relaybot",
    version,
    about = "Chat backend with model fallback and tool calling over OpenRouter"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Start an interactive chat session
    Chat {
        /// Resume a saved session by id
        #[arg(short, long)]
        session: Option<String>,

        /// Do not offer tools to the model
        #[arg(long)]
        no_tools: bool,
    },

    /// Show the model catalog
    Models,

    /// Print the saved transcript of a session
    History {
        /// Session id
        session: String,

        /// Maximum number of exchanges to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Create or reset the default configuration
    Onboard,

    /// Show configuration status and health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { host, port }) => cmd_serve(host, port).await?,
        Some(Commands::Chat { session, no_tools }) => cmd_chat(session.as_deref(), !no_tools).await?,
        Some(Commands::Models) => cmd_models()?,
        Some(Commands::History { session, limit }) => cmd_history(&session, limit).await?,
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status()?,
        None => cmd_chat(None, true).await?,
    }

    Ok(())
}

// ── Shared Setup ────────────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<()> {
    if let Err(errors) = config.validate() {
        eprintln!("\n  \x1b[31m❌ Configuration errors:\x1b[0m");
        for e in &errors {
            eprintln!("     • {}", e);
        }
        eprintln!();
        anyhow::bail!("Fix the above {} error(s) in config.json", errors.len());
    }
    Ok(())
}

/// Everything a command needs to talk to models.
struct Runtime {
    orchestrator: ChatOrchestrator,
    sessions: Arc<MemorySessionStore>,
    history: Arc<JsonlHistoryStore>,
}

fn setup_runtime(config: &Config) -> Result<Runtime> {
    let client = reqwest::Client::builder()
        .timeout(config.provider.timeout())
        .build()?;

    let provider = OpenRouterProvider::new(
        &config.provider.api_key,
        Some(config.provider.api_base.as_str()),
        &config.provider.referer,
        &config.provider.title,
        client.clone(),
    );
    let catalog = ModelCatalog::new(config.models.0.clone())?;
    let tools = builtin_registry(&config.tools, client);

    let engine = FallbackEngine::new(
        Arc::new(provider),
        Arc::new(catalog),
        Arc::new(tools),
        EngineConfig {
            temperature: config.completion.temperature,
            max_tokens: config.completion.max_tokens,
            call_timeout: config.provider.timeout(),
        },
    );

    let sessions = Arc::new(MemorySessionStore::new(
        std::time::Duration::from_secs(config.session.ttl_seconds),
        config.session.max_messages,
    ));
    let history = Arc::new(JsonlHistoryStore::new(config.history_dir()));

    let orchestrator = ChatOrchestrator::new(
        engine,
        sessions.clone(),
        history.clone(),
        OrchestratorConfig::from_config(config),
    );

    Ok(Runtime {
        orchestrator,
        sessions,
        history,
    })
}

// ── Serve Command ───────────────────────────────────────────────────

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;

    let runtime = setup_runtime(&config)?;
    let state = AppState {
        orchestrator: runtime.orchestrator,
        default_use_tools: config.completion.use_tools,
        free_only: config.completion.free_only,
    };
    let host = host.unwrap_or_else(|| config.gateway.host.clone());
    let port = port.unwrap_or(config.gateway.port);

    println!("  🛰️  relaybot gateway on http://{}:{}", host, port);
    println!("  Press Ctrl+C for graceful shutdown.");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, shutting down gracefully");
        }
        on_signal.cancel();
    });

    gateway::serve(&host, port, state, shutdown).await?;
    println!("  ✅ Shutdown complete.");
    Ok(())
}

// ── Chat Command ────────────────────────────────────────────────────

async fn cmd_chat(resume: Option<&str>, use_tools: bool) -> Result<()> {
    let config = Config::load()?;
    validate_config(&config)?;
    let runtime = setup_runtime(&config)?;

    let session_id = match resume {
        Some(id) => {
            let records = runtime.history.query(id, config.session.max_messages).await?;
            let turns: Vec<(Role, String)> = records
                .into_iter()
                .flat_map(|r| [(Role::User, r.user_message), (Role::Assistant, r.assistant_message)])
                .collect();
            println!("  Resuming {} ({} earlier messages)", id, turns.len());
            runtime.sessions.resume(id, turns).await;
            id.to_string()
        }
        None => runtime.orchestrator.create_session().await,
    };

    println!();
    println!("  🛰️  relaybot v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Models: {} | Tools: {} | Free only: {}",
        config.models.0.len(),
        if use_tools { "on" } else { "off" },
        config.completion.free_only
    );
    println!("  Session: {}", session_id);
    println!();
    println!("  Type your message, /models for model health, or /quit to exit.");
    println!("  ─────────────────────────────────────");
    println!();

    let stdin = io::stdin();
    loop {
        print!("  \x1b[36m>\x1b[0m ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" | "/q" => {
                println!("  Goodbye! 👋");
                break;
            }
            "/models" => {
                print_models(&runtime.orchestrator.engine().catalog().snapshot());
                continue;
            }
            _ => {}
        }

        println!();
        let mut events = match runtime
            .orchestrator
            .process_stream(&session_id, input, use_tools)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                eprintln!("  \x1b[31mError: {}\x1b[0m\n", e);
                continue;
            }
        };

        print!("  \x1b[32m");
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Token { content } => {
                    print!("{}", content);
                    io::stdout().flush()?;
                }
                StreamEvent::ToolCall { tool, args } => {
                    println!("\x1b[0m  🔧 {} {}\x1b[32m", tool, args);
                }
                StreamEvent::ToolResult { tool, result } => {
                    println!("\x1b[0m  ↳ {}: {}\x1b[32m", tool, result);
                }
                StreamEvent::Done { model_used, usage, .. } => {
                    println!(
                        "\x1b[0m\n  \x1b[2m[{} · {} tokens]\x1b[0m\n",
                        model_used, usage.total_tokens
                    );
                }
                StreamEvent::Error { error, .. } => {
                    println!("\x1b[0m");
                    eprintln!("  \x1b[31mError: {}\x1b[0m\n", error);
                }
            }
        }
    }

    Ok(())
}

// ── Models Command ──────────────────────────────────────────────────

fn cmd_models() -> Result<()> {
    let config = Config::load()?;
    let catalog = ModelCatalog::new(config.models.0.clone())?;
    print_models(&catalog.snapshot());
    Ok(())
}

fn print_models(models: &[ModelDescriptor]) {
    println!();
    println!(
        "  {:<4} {:<48} {:<6} {:<5} {:<13} {}",
        "PRIO", "MODEL", "TOOLS", "FREE", "STATUS", "ERRORS"
    );
    for m in models {
        println!(
            "  {:<4} {:<48} {:<6} {:<5} {:<13} {}",
            m.priority,
            m.id,
            if m.supports_tools { "yes" } else { "no" },
            if m.is_free { "yes" } else { "no" },
            m.status.as_str(),
            m.consecutive_errors
        );
    }
    println!();
}

// ── History Command ─────────────────────────────────────────────────

async fn cmd_history(session_id: &str, limit: usize) -> Result<()> {
    let config = Config::load()?;
    let store = JsonlHistoryStore::new(config.history_dir());
    let records = store.query(session_id, limit).await?;

    if records.is_empty() {
        println!("  No history for session {}.", session_id);
        return Ok(());
    }

    println!();
    for record in records {
        println!("  \x1b[2m{} · {}\x1b[0m", record.created_at, record.model_used);
        println!("  \x1b[36m>\x1b[0m {}", record.user_message);
        for tool in &record.tools_used {
            println!("  🔧 {} {}", tool.tool, serde_json::to_string(&tool.args)?);
        }
        println!("  \x1b[32m{}\x1b[0m", record.assistant_message);
        println!();
    }
    Ok(())
}

// ── Onboard Command ─────────────────────────────────────────────────

fn cmd_onboard() -> Result<()> {
    let path = Config::write_default_template()?;
    println!();
    println!("  ✅ Configuration created at:");
    println!("     {}", path.display());
    println!();
    println!("  Next steps:");
    println!("  1. Add your OpenRouter API key (or set OPENROUTER_API_KEY)");
    println!("  2. Run `relaybot chat` or `relaybot serve`");
    println!();
    Ok(())
}

// ── Status Command ──────────────────────────────────────────────────

fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load()?;

    println!();
    println!("  🛰️  relaybot status");
    println!("  ─────────────────────────────────────");

    if config_path.exists() {
        println!("  Config:    {}", config_path.display());
    } else {
        println!("  Config:    ⚠️  Not found, using defaults (run `relaybot onboard`)");
    }

    if config.provider.has_real_key() {
        println!("  Provider:  ✅ {}", config.provider.api_base);
    } else {
        println!("  Provider:  ❌ No API key configured");
    }

    match ModelCatalog::new(config.models.0.clone()) {
        Ok(catalog) => {
            let tool_capable = catalog.list_candidates(true, config.completion.free_only).len();
            println!(
                "  Models:    {} in catalog, {} eligible for tool calls",
                catalog.len(),
                tool_capable
            );
        }
        Err(e) => println!("  Models:    ❌ {}", e),
    }

    let history_dir = config.history_dir();
    println!(
        "  History:   {} {}",
        history_dir.display(),
        if history_dir.exists() { "✅" } else { "⚠️  (will be created)" }
    );
    println!("  Gateway:   {}:{}", config.gateway.host, config.gateway.port);

    if let Err(errors) = config.validate() {
        println!();
        for e in errors {
            println!("  ⚠️  {}", e);
        }
    }

    println!();
    Ok(())
}
