// foreman CLI

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use foreman::models::ExecutionPlan;
use foreman::orchestrator::{Engine, EngineConfig, LogStatusReporter, RestStatusReporter};
use foreman::state::{estimate_remaining_ms, format_duration, format_relative_time, StateStore};
use foreman::validation::{SmokeConfig, ValidationConfig};
use foreman::AgentStatus;

#[derive(Parser)]
#[command(name = "foreman", version, about = "Multi-agent orchestration over git branches")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a plan from the beginning
    Start(RunArgs),
    /// Continue an interrupted run, skipping completed items
    Resume(RunArgs),
    /// Show the active run
    Status,
    /// List recently archived runs
    Recent,
    /// Mark the active run's agents as paused
    Pause,
}

#[derive(Args)]
struct RunArgs {
    /// Execution plan (JSON)
    #[arg(long)]
    plan: PathBuf,

    /// Git repository the agents work in
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Branch agent work is merged into
    #[arg(long, default_value = "main")]
    target_branch: String,

    #[arg(long, default_value_t = 3)]
    max_agents: usize,

    /// Attempts per item before it fails permanently
    #[arg(long, default_value_t = 2)]
    max_attempts: u32,

    /// Agent binary spoken to over stdio
    #[arg(long, env = "FOREMAN_AGENT")]
    agent: String,

    /// Extra argument passed to the agent (repeatable)
    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,

    /// Decline agent permission requests instead of auto-approving
    #[arg(long)]
    manual_permissions: bool,

    /// Build command run during validation (repeatable)
    #[arg(long = "build-cmd")]
    build_cmds: Vec<String>,

    /// Test command run during validation (repeatable)
    #[arg(long = "test-cmd")]
    test_cmds: Vec<String>,

    /// Smoke stage configuration (JSON)
    #[arg(long)]
    smoke_config: Option<PathBuf>,

    /// Endpoint receiving run state as JSON after every transition
    #[arg(long, env = "FOREMAN_STATUS_URL")]
    status_url: Option<String>,

    #[arg(long, default_value_t = 120_000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let store = StateStore::open_default();

    match cli.command {
        Command::Start(args) => run(args, store, false).await,
        Command::Resume(args) => run(args, store, true).await,
        Command::Status => status(store),
        Command::Recent => recent(store),
        Command::Pause => pause(store),
    }
}

async fn run(args: RunArgs, store: StateStore, resume: bool) -> anyhow::Result<()> {
    let agent_binary = which::which(&args.agent)
        .with_context(|| format!("agent binary '{}' not found", args.agent))?;

    let raw = std::fs::read_to_string(&args.plan)
        .with_context(|| format!("reading plan {}", args.plan.display()))?;
    let mut plan: ExecutionPlan =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", args.plan.display()))?;
    if plan.id.is_empty() {
        plan.id = uuid::Uuid::new_v4().to_string();
    }
    plan.validate()?;

    let smoke: Option<SmokeConfig> = match &args.smoke_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading smoke config {}", path.display()))?;
            Some(serde_json::from_str(&raw)?)
        }
        None => None,
    };

    let config = EngineConfig {
        repo_path: args.repo.clone(),
        target_branch: args.target_branch,
        max_agents: args.max_agents,
        max_attempts: args.max_attempts,
        agent: foreman::acp::ProtocolClientConfig {
            binary: agent_binary.to_string_lossy().to_string(),
            args: args.agent_args,
            working_dir: Some(args.repo),
            request_timeout_ms: args.request_timeout_ms,
            auto_approve_permissions: !args.manual_permissions,
            ..Default::default()
        },
        validation: ValidationConfig {
            build_commands: args.build_cmds,
            test_commands: args.test_cmds,
            smoke,
            ..Default::default()
        },
    };

    if resume {
        let info = store.resume_info()?;
        if info.can_resume {
            log::info!(
                "[CLI] Resuming: {} paused and {} running agent(s) on record",
                info.paused_agents,
                info.running_agents
            );
        } else {
            log::warn!("[CLI] No interrupted run on record, starting fresh");
        }
    }

    let mut engine = Engine::new(config, store);
    engine.add_reporter(Box::new(LogStatusReporter));
    if let Some(url) = args.status_url {
        engine.add_reporter(Box::new(RestStatusReporter::new(url)));
    }

    let outcome = engine.run(&plan, resume).await?;
    log::info!("[CLI] Run outcome: {:?}", outcome);
    Ok(())
}

fn status(store: StateStore) -> anyhow::Result<()> {
    let Some(state) = store.active_state()? else {
        println!("No active run.");
        return Ok(());
    };

    println!("Plan: {} ({})", state.plan_name, state.plan_id);
    println!(
        "Progress: {}% ({}/{} completed, {} failed), phase {}/{}",
        state.progress,
        state.completed.len(),
        state.total_items,
        state.failed.len(),
        state.current_phase,
        state.total_phases
    );
    match estimate_remaining_ms(&state) {
        Some(ms) => println!("Estimated remaining: {}", format_duration(ms)),
        None => println!("Estimated remaining: unknown"),
    }
    for agent in &state.active_agents {
        println!(
            "  {} [{:?}] {}% {}",
            agent.work_item_id,
            agent.status,
            agent.progress,
            agent.current_activity.as_deref().unwrap_or("")
        );
    }
    if let Some(up_next) = &state.up_next {
        println!("Up next: {}", up_next.join(", "));
    }
    if let Some(blocked) = &state.blocked_by {
        println!("Blocked: {}", blocked);
    }
    let info = store.resume_info()?;
    if info.can_resume {
        println!(
            "Resumable: yes ({} paused, {} running). Continue with `foreman resume`.",
            info.paused_agents, info.running_agents
        );
    }
    Ok(())
}

fn recent(store: StateStore) -> anyhow::Result<()> {
    let runs = store.recent_runs()?;
    if runs.is_empty() {
        println!("No archived runs.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {} ({}% | {}/{} completed, {} failed)",
            format_relative_time(&run.archived_at),
            run.state.plan_name,
            run.state.progress,
            run.state.completed.len(),
            run.state.total_items,
            run.state.failed.len()
        );
    }
    Ok(())
}

fn pause(store: StateStore) -> anyhow::Result<()> {
    let Some(mut state) = store.active_state()? else {
        bail!("no active run to pause");
    };
    for agent in &mut state.active_agents {
        agent.status = AgentStatus::Paused;
    }
    let paused = state.active_agents.len();
    store.set_active_state(state)?;
    println!("Marked {} agent(s) paused. Resume with `foreman resume`.", paused);
    Ok(())
}
