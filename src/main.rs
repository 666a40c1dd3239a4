use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;

use enso_hub::classifier::Classifier;
use enso_hub::cli::{
    AgentCommands, Cli, ClassifierMode, Commands, TelemetryCommands, ToolCommands, command_label,
};
use enso_hub::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use enso_hub::dispatch::Dispatcher;
use enso_hub::engine::{ChatRequest, OrchestrationEngine};
use enso_hub::error::{categorize_error, format_cli_error};
use enso_hub::evaluate::{Evaluator, heuristic_scorers};
use enso_hub::registry::{AgentInvocation, builtin_registry};
use enso_hub::server::run_server;
use enso_hub::session::SessionStore;
use enso_hub::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let telemetry = TelemetrySink::new(&cfg, command_label(&cli.command));

    match cli.command {
        Commands::Ask {
            message,
            agent,
            file,
        } => {
            let engine = build_engine(&cfg, &telemetry)?;
            let message = message.join(" ");
            if message.trim().is_empty() {
                return Err(anyhow::anyhow!("message cannot be empty for ask"));
            }

            let mut request = ChatRequest::new(message, cfg.session_id.clone());
            request.agent = agent;
            request.file_path = file;

            let response = engine.chat(request).await;
            println!("{}", response.reply);
            println!();
            println!(
                "agents: {} | tokens: {} (${:.6})",
                response.agents_called.join(", "),
                response.metadata.token_usage.total_tokens,
                response.metadata.token_usage.estimated_cost
            );
            match response.metadata.evaluation_scores.overall_score {
                Some(overall) => println!(
                    "quality: {} ({})",
                    overall, response.metadata.evaluation_scores.overall_result
                ),
                None => println!("quality: unavailable (all scorers errored)"),
            }
        }
        Commands::Serve { host, port } => {
            let engine = build_engine(&cfg, &telemetry)?;
            run_server(cfg, engine, host, port, &telemetry).await?;
        }
        Commands::Agents { command } => match command {
            AgentCommands::List => run_agents_list(&cfg)?,
        },
        Commands::Tools { command } => match command {
            ToolCommands::List => run_tools_list(&cfg)?,
            ToolCommands::Call { name, query, file } => {
                run_tools_call(&cfg, &name, &query, file).await?
            }
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit)?,
        },
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn build_engine(cfg: &RuntimeConfig, telemetry: &TelemetrySink) -> Result<Arc<OrchestrationEngine>> {
    let registry = Arc::new(builtin_registry(&cfg.default_agent)?);

    let classifier = match cfg.classifier {
        ClassifierMode::Rules => Classifier::rules(),
        ClassifierMode::Model => {
            // No routing model ships with the binary; embedders wire a
            // ReasoningModel through Classifier::model.
            return Err(anyhow::anyhow!(
                "classifier mode 'model' requires a routing model; embed the engine and wire one \
                 via Classifier::model, or use --classifier rules"
            ));
        }
    };

    let dispatcher = Dispatcher::new(
        registry.clone(),
        Duration::from_secs(cfg.agent_timeout_secs),
    );
    let evaluator = Evaluator::new(
        heuristic_scorers(),
        Duration::from_secs(cfg.scorer_timeout_secs),
    );

    Ok(Arc::new(OrchestrationEngine::new(
        registry,
        Arc::new(SessionStore::new()),
        classifier,
        dispatcher,
        evaluator,
        telemetry.clone(),
        cfg.history_max_turns,
        cfg.history_max_chars,
    )))
}

fn run_agents_list(cfg: &RuntimeConfig) -> Result<()> {
    let registry = builtin_registry(&cfg.default_agent)?;
    println!("Registered agents (default='{}'):", registry.default_id());
    for descriptor in registry.descriptors() {
        let marker = if descriptor.id == registry.default_id() {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {} (tool: {})\n    {}",
            descriptor.id, descriptor.tool_name, descriptor.description
        );
    }
    Ok(())
}

fn run_tools_list(cfg: &RuntimeConfig) -> Result<()> {
    let registry = builtin_registry(&cfg.default_agent)?;
    let rendered = serde_json::to_string_pretty(&registry.tool_definitions())
        .context("failed to render tool definitions")?;
    println!("{rendered}");
    Ok(())
}

async fn run_tools_call(
    cfg: &RuntimeConfig,
    name: &str,
    query: &str,
    file: Option<String>,
) -> Result<()> {
    let registry = builtin_registry(&cfg.default_agent)?;
    let (descriptor, handler) = registry.resolve_tool(name).ok_or_else(|| {
        let names = registry
            .tool_definitions()
            .into_iter()
            .map(|tool| tool.name)
            .collect::<Vec<String>>();
        anyhow::anyhow!("unknown tool '{}'. Available tools: {}", name, names.join(", "))
    })?;

    let invocation = AgentInvocation {
        query: query.to_string(),
        file_path: file,
        history: String::new(),
        extra: serde_json::Map::new(),
    };

    let reply = handler
        .invoke(&invocation)
        .await
        .with_context(|| format!("tool '{}' (agent '{}') failed", name, descriptor.id))?;
    println!("{}", reply.text);
    Ok(())
}
