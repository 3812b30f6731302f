use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use parley_auth::srp;
use parley_core::security::ApiKey;
use parley_llm::provider::DEFAULT_BASE_URL;
use parley_llm::{OpenAiBackend, OpenAiConfig};
use parley_store::{Database, UserRepo};
use parley_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "parley", version, about = "Streaming chat backend with password-proof login")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// SQLite database holding users and sessions.
    #[arg(long, env = "PARLEY_DB", global = true)]
    db: Option<PathBuf>,

    #[arg(long, env = "PARLEY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: Level,

    /// Emit JSON log lines.
    #[arg(long, env = "PARLEY_LOG_JSON", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP and chat socket server (default).
    Serve(ServeArgs),
    /// Register a user with a password verifier.
    AddUser {
        #[arg(long)]
        name: String,
        #[arg(long, env = "PARLEY_PASSWORD", hide_env_values = true)]
        password: String,
        /// Upstream key for this user's chats when a request brings none.
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[derive(Args, Clone)]
struct ServeArgs {
    #[arg(long, env = "PARLEY_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "PARLEY_PORT", default_value_t = 8080)]
    port: u16,

    /// Base URL of the OpenAI-compatible completion API.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    upstream_url: String,

    /// Key used when a chat request carries none.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// HuggingFace tokenizer.json for prompt accounting.
    #[arg(long, env = "PARLEY_TOKENIZER")]
    tokenizer: Option<PathBuf>,

    /// Mark session cookies Secure.
    #[arg(long, env = "PARLEY_SECURE_COOKIES")]
    secure_cookies: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| parley_telemetry::data_dir().join("parley.db"));

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..TelemetryConfig::default()
    });

    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Serve(args) => serve(db, args).await,
        Command::AddUser {
            name,
            password,
            api_key,
        } => add_user(db, &name, &password, api_key.as_deref()),
    }
}

async fn serve(db: Database, args: ServeArgs) -> anyhow::Result<()> {
    let tokenizer = parley_llm::tokenizer::load(args.tokenizer.as_deref())?;
    let backend = OpenAiBackend::new(OpenAiConfig {
        base_url: args.upstream_url,
        default_api_key: ApiKey::non_empty(args.api_key.as_deref()),
        ..OpenAiConfig::default()
    })
    .context("building upstream client")?;

    let config = parley_server::ServerConfig {
        bind: args.bind,
        port: args.port,
        secure_cookies: args.secure_cookies,
        ..Default::default()
    };
    let handle = parley_server::start(config, db, Arc::new(backend), tokenizer)
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn add_user(db: Database, name: &str, password: &str, api_key: Option<&str>) -> anyhow::Result<()> {
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "user name must not be empty");
    anyhow::ensure!(!password.is_empty(), "password must not be empty");

    let (salt, verifier) = srp::generate_verifier(name, password);
    let users = UserRepo::new(db);
    let user = users
        .create(name, Some(&salt), Some(&verifier))
        .with_context(|| format!("creating user {name}"))?;
    if api_key.is_some() {
        users
            .set_default_api_key(&user.id, api_key)
            .with_context(|| format!("storing API key for {name}"))?;
    }
    tracing::info!(user_id = %user.id, name = %user.name, "user created");
    println!("{}", user.id);
    Ok(())
}
