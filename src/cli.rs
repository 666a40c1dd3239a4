use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    Rules,
    Model,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List registered agents with their routing descriptions")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum ToolCommands {
    #[command(about = "List the tool definitions exposed for every registered agent")]
    List,
    #[command(about = "Invoke one agent directly by its tool name")]
    Call {
        #[arg(long)]
        name: String,
        #[arg(long)]
        query: String,
        #[arg(long)]
        file: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  enso-hub ask \"What's the weather in Oslo and any asteroids near Earth today?\"\n\
  enso-hub --session-id demo ask \"rag: what does the uploaded contract say about renewal?\"\n\
  enso-hub ask --agent sql \"How many orders shipped to Germany?\"\n\
  enso-hub ask --file report.pdf \"Summarize the key findings\"\n\
  enso-hub serve --host 127.0.0.1 --port 8000\n\
  enso-hub agents list\n\
  enso-hub tools list\n\
  enso-hub tools call --name general_assistant --query \"Hello there\"\n\
  enso-hub telemetry report --limit 2000\n\
\n\
Routing behavior:\n\
  - Classification is rule-based by default; --classifier model delegates to a wired routing model.\n\
  - Use --agent <id> on ask (or the request body) to pin a single agent and skip classification.";

#[derive(Debug, Parser)]
#[command(name = "enso-hub")]
#[command(about = "Multi-agent orchestration hub: classify, fan out, combine, evaluate")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "ENSO_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "ENSO_CONFIG", default_value = ".enso/config.toml")]
    pub config_path: String,

    #[arg(long, env = "ENSO_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "ENSO_DEFAULT_AGENT")]
    pub default_agent: Option<String>,

    #[arg(long, env = "ENSO_CLASSIFIER", value_enum)]
    pub classifier: Option<ClassifierMode>,

    #[arg(long, env = "ENSO_AGENT_TIMEOUT_SECS")]
    pub agent_timeout_secs: Option<u64>,

    #[arg(long, env = "ENSO_SCORER_TIMEOUT_SECS")]
    pub scorer_timeout_secs: Option<u64>,

    #[arg(long, env = "ENSO_HISTORY_MAX_TURNS")]
    pub history_max_turns: Option<usize>,

    #[arg(long, env = "ENSO_HISTORY_MAX_CHARS")]
    pub history_max_chars: Option<usize>,

    #[arg(long, env = "ENSO_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "ENSO_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run one chat turn and print the combined reply with its scorecard")]
    Ask {
        #[arg(required = true)]
        message: Vec<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        file: Option<String>,
    },
    #[command(about = "Run the HTTP server exposing chat, tools, and health endpoints")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    #[command(about = "Inspect the agent registry")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Inspect and invoke the tool surface")]
    Tools {
        #[command(subcommand)]
        command: ToolCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Agents { command } => match command {
            AgentCommands::List => "agents.list".to_string(),
        },
        Commands::Tools { command } => match command {
            ToolCommands::List => "tools.list".to_string(),
            ToolCommands::Call { .. } => "tools.call".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
