mod cli_args;
mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;

use tarsy_core::clock::{Clock, SystemClock};
use tarsy_core::events::{EventBus, InMemoryEventStore, NotifyEventBus};
use tarsy_core::history::{HistoryStore, SqliteHistoryStore};
use tarsy_core::model::{AlertSession, ChainContext, ProcessingAlert, SessionStatus};
use tarsy_core::pipeline::InteractionPipeline;
use tarsy_core::state_machine::{validate_session_transition, CancellationRegistry, PauseRegistry};

use tarsy_runtime::llm::http_client::HttpLlmClient;
use tarsy_runtime::llm::LlmClient;
use tarsy_runtime::scheduler::{LlmProvider, Scheduler, SessionOutcome};
use tarsy_runtime::tool::masking::Masker;
use tarsy_runtime::tool::mcp_client::McpToolClient;
use tarsy_runtime::tool::ToolClient;

use cli_args::{CliArgs, Commands};
use config::RuntimeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tarsy_utils::telemetry::setup_logging("tarsy-cli");
    let args = CliArgs::parse();

    match args.command {
        Commands::Run { config, alert, author } => run(&config, &alert, &author).await,
        Commands::Retention { config, older_than_days } => retention(&config, older_than_days).await,
    }
}

async fn run(config_path: &std::path::Path, alert_path: &std::path::Path, author: &str) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;
    let raw_alert = std::fs::read_to_string(alert_path)
        .with_context(|| format!("failed to read alert at {}", alert_path.display()))?;
    let alert: ProcessingAlert = serde_json::from_str(&raw_alert)?;
    alert.validate().map_err(|e| anyhow!(e))?;

    let chain_def = config
        .find_chain(&alert.alert_type)
        .ok_or_else(|| anyhow!("no chain registered for alert_type `{}`", alert.alert_type))?
        .clone();
    tracing::info!(alert_type = %alert.alert_type, chain_id = %chain_def.chain_id, "matched chain for alert");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let event_store = Arc::new(InMemoryEventStore::new(clock.clone()));
    let events: Arc<dyn EventBus> = Arc::new(NotifyEventBus::new(event_store, clock.clone()));
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(&config.database_url).await?);
    let cancellation = Arc::new(CancellationRegistry::new(clock.clone()));
    let pause_registry = Arc::new(PauseRegistry::new());
    let pipeline = Arc::new(InteractionPipeline::new(clock.clone()));

    let masker = Masker::new(config.masking_library.patterns.clone(), config.masking_library.pattern_groups.clone());
    let client_info = rmcp::model::Implementation {
        name: "tarsy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let tools: Arc<dyn ToolClient> = Arc::new(McpToolClient::new(config.tool_servers.clone(), masker, client_info)?);

    let mut llm_providers = HashMap::new();
    for (name, provider_cfg) in &config.llm_providers {
        let client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(provider_cfg.resolve())?);
        llm_providers.insert(
            name.clone(),
            LlmProvider { client, model_name: provider_cfg.model.clone() },
        );
    }
    if !llm_providers.contains_key(&config.default_llm_provider) {
        return Err(anyhow!(
            "default_llm_provider `{}` is not defined under llm_providers",
            config.default_llm_provider
        ));
    }

    let session_id = clock.new_id();
    let cancel = cancellation.register(&session_id);

    let agent_type = chain_def
        .stages
        .first()
        .map(|s| match &s.parallelism {
            tarsy_core::model::ParallelismKind::Single { agent_name } => agent_name.clone(),
            tarsy_core::model::ParallelismKind::MultiAgent { .. } => chain_def.chain_id.clone(),
            tarsy_core::model::ParallelismKind::Replica { agent_name, .. } => agent_name.clone(),
        })
        .unwrap_or_else(|| chain_def.chain_id.clone());

    let mut session = AlertSession {
        session_id: session_id.clone(),
        chain_id: chain_def.chain_id.clone(),
        alert_type: alert.alert_type.clone(),
        agent_type,
        status: SessionStatus::Pending,
        author: author.to_string(),
        started_at_us: clock.now_us(),
        completed_at_us: None,
        final_analysis: None,
        final_analysis_summary: None,
        error_message: None,
        alert_data: alert.alert_data.clone(),
        slack_message_fingerprint: alert.slack_message_fingerprint.clone(),
    };
    history.create_session(&session).await?;

    validate_session_transition(session.status, SessionStatus::InProgress)?;
    session.status = SessionStatus::InProgress;
    history.update_session(&session).await?;

    let runbook_content = alert.runbook_url.as_ref().map(|url| format!("runbook reference: {url}"));
    let mut chain = ChainContext::new(&alert, session_id.clone(), chain_def.chain_id.clone(), runbook_content);

    let scheduler = Scheduler {
        agents: config.agents.clone(),
        llm_providers,
        default_llm_provider: config.default_llm_provider.clone(),
        tools,
        pipeline,
        clock: clock.clone(),
        events,
        history: history.clone(),
        pause_registry,
        max_summary_tokens: config.max_summary_tokens,
    };

    tracing::info!(session_id = %session_id, "starting chain execution");
    let outcome = scheduler.execute(&chain_def, &mut chain, session_id.clone(), cancel).await;
    cancellation.forget(&session_id);

    match outcome {
        SessionOutcome::Completed { final_analysis, final_analysis_summary } => {
            session.status = SessionStatus::Completed;
            session.final_analysis = final_analysis;
            session.final_analysis_summary = final_analysis_summary;
            println!("{}", "session completed".green().bold());
        }
        SessionOutcome::Failed { error_message } => {
            session.status = SessionStatus::Failed;
            session.error_message = Some(error_message.clone());
            println!("{} {error_message}", "session failed:".red().bold());
        }
        SessionOutcome::Cancelled => {
            session.status = SessionStatus::Cancelled;
            println!("{}", "session cancelled".yellow().bold());
        }
        SessionOutcome::Paused { stage_execution_id } => {
            session.status = SessionStatus::Paused;
            println!("{} {stage_execution_id}", "session paused at stage:".yellow().bold());
        }
    }
    session.completed_at_us = Some(clock.now_us());
    history.update_session(&session).await?;

    if let Some(analysis) = &session.final_analysis {
        println!("\n{}\n{analysis}", "final analysis:".bold());
    }
    Ok(())
}

async fn retention(config_path: &std::path::Path, older_than_days: i64) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;
    let history = SqliteHistoryStore::new(&config.database_url).await?;
    let clock = SystemClock;
    let cutoff_us = clock.now_us() - older_than_days * 24 * 60 * 60 * 1_000_000;
    let deleted = history.delete_sessions_older_than(cutoff_us).await?;
    println!("deleted {deleted} session(s) older than {older_than_days} day(s)");
    Ok(())
}
