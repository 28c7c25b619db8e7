use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use tabula_registry::tools::{self, TOOL_IDS};
use tabula_registry::{RegistryConfig, ViewCatalog, Workspace};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "tabula", version, about = "Per-conversation view registry over SQLite")]
struct Cli {
    #[command(flatten)]
    scope: ScopeArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ScopeArgs {
    /// Workspace root holding one directory per conversation
    #[arg(long, global = true, env = "TABULA_WORKSPACE")]
    workspace: Option<PathBuf>,
    /// Conversation id (directory name under the workspace)
    #[arg(long, short = 'c', global = true)]
    conversation: Option<String>,
    /// TOML file with registry settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Pretty-print JSON
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether the conversation database is reachable
    Test,
    /// Register one or more sources (CSV/TSV paths, sqlite://file#table, URLs)
    Register {
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// List registered views
    List,
    /// Describe one view or every table and view
    Schema {
        #[arg(long)]
        view: Option<String>,
    },
    /// Run a read-only SQL query
    Query { sql: String },
    /// Rename a view
    Rename { from: String, to: String },
    /// Delete views from the engine and the registry
    Delete {
        #[arg(required = true)]
        views: Vec<String>,
    },
    /// Print the tool ids understood by `call`
    Tools,
    /// Invoke a tool by id with a raw JSON input
    Call {
        id: String,
        /// JSON object passed as the tool input
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

impl Commands {
    fn tool_call(self) -> Result<(String, JsonValue)> {
        Ok(match self {
            Commands::Test => (tools::TOOL_TEST_CONNECTION.into(), json!({})),
            Commands::Register { sources } => {
                (tools::TOOL_REGISTER.into(), json!({"sources": sources}))
            }
            Commands::List => (tools::TOOL_LIST.into(), json!({})),
            Commands::Schema { view } => (
                tools::TOOL_SCHEMA.into(),
                view.map(|v| json!({"viewName": v})).unwrap_or_else(|| json!({})),
            ),
            Commands::Query { sql } => (tools::TOOL_QUERY.into(), json!({"sql": sql})),
            Commands::Rename { from, to } => {
                (tools::TOOL_RENAME.into(), json!({"from": from, "to": to}))
            }
            Commands::Delete { views } => (tools::TOOL_DELETE.into(), json!({"viewNames": views})),
            Commands::Call { id, input } => {
                let input: JsonValue =
                    serde_json::from_str(&input).context("--input must be valid JSON")?;
                (id, input)
            }
            Commands::Tools => return Err(anyhow!("tools is not a tool call")),
        })
    }
}

fn print_json(value: &JsonValue, pretty: bool) {
    if pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}

fn load_config(scope: &ScopeArgs) -> Result<RegistryConfig> {
    let mut cfg = match scope.config.as_deref() {
        Some(path) => RegistryConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RegistryConfig::default(),
    };
    if let Some(root) = scope.workspace.clone() {
        cfg = cfg.with_workspace_root(root);
    }
    Ok(cfg)
}

async fn run(cli: Cli) -> Result<()> {
    let scope = cli.scope;
    if matches!(cli.command, Commands::Tools) {
        print_json(&json!(TOOL_IDS), scope.pretty);
        return Ok(());
    }
    let cfg = load_config(&scope)?;
    let workspace = Workspace::from_config(&cfg)
        .context("set --workspace, TABULA_WORKSPACE or workspace_root in --config")?;
    let conversation = scope
        .conversation
        .as_deref()
        .ok_or_else(|| anyhow!("--conversation is required"))?;
    let ctx = workspace.context(conversation)?;
    let catalog = ViewCatalog::new(cfg)?;

    let (id, input) = cli.command.tool_call()?;
    tracing::debug!(tool = %id, conversation, "running tool");
    match tools::run_tool(&catalog, &ctx, &id, input).await {
        Ok(out) => {
            print_json(&out, scope.pretty);
            Ok(())
        }
        Err(err) => {
            print_json(&json!({"error": err.detail()}), scope.pretty);
            Err(anyhow!(err))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
