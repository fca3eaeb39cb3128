//! keel CLI entrypoint.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use keel::cli::{
    Cli, Commands, LogFormat, OutputFormatter, PromptApproval, StateCommands, WatchInput,
    ask_cancellable, confirm_cancellable,
};
use keel::config::{
    ApprovalMode, ConfigParser, ConfigValidator, DesiredConfiguration, Fingerprinter, KeelConfig,
    find_config_file,
};
use keel::error::{ConfigError, KeelError, Result};
use keel::graph::ResourceGraph;
use keel::pipeline::{
    ApprovalGate, ApprovalHandle, AutoApprove, BranchRouter, ConfigSource, EnvironmentPipeline,
    FileConfigSource, PipelineDispatcher, SourceEvent, gate_for,
};
use keel::provision::ProvisionerRegistry;
use keel::reconciler::{PreparedCycle, ReconcileSettings, Reconciler};
use keel::state::{STATE_DIR, generate_holder_id, open_store};

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli));
    // a prompt abandoned on Ctrl-C may still be blocked reading stdin
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Installs the tracing subscriber. `-v` flags override `RUST_LOG`.
fn init_logging(verbose: u8, format: LogFormat) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph { env } => cmd_graph(&Workspace::load(config)?, env.as_deref(), &formatter),
        Commands::Plan { env } => cmd_plan(&Workspace::load(config)?, &env, &formatter).await,
        Commands::Apply { env, yes } => {
            cmd_apply(&Workspace::load(config)?, &env, yes, &formatter).await
        }
        Commands::Destroy { env, yes } => {
            cmd_destroy(&Workspace::load(config)?, &env, yes, &formatter).await
        }
        Commands::Trigger {
            branch,
            commit,
            yes,
        } => cmd_trigger(&Workspace::load(config)?, &branch, &commit, yes, &formatter).await,
        Commands::Watch => cmd_watch(&Workspace::load(config)?, formatter).await,
        Commands::State { env, command } => {
            cmd_state(&Workspace::load(config)?, &env, command, &formatter).await
        }
    }
}

/// Writes command output to stdout. Logs and prompts go to stderr.
fn emit(text: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", text.trim_end())?;
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing keel project in: {}", path.display());

    let config_path = path.join("keel.yaml");
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(path)?;
    std::fs::write(&config_path, include_str!("../templates/keel.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let gitignore_path = path.join(".gitignore");
    let state_entry = format!("{STATE_DIR}/");
    let existing = if gitignore_path.exists() {
        std::fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };
    let missing: Vec<&str> = [".env", state_entry.as_str()]
        .into_iter()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if !missing.is_empty() {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&gitignore_path)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        for entry in missing {
            writeln!(file, "{entry}")?;
        }
        eprintln!("Updated: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized. Next steps:");
    eprintln!("  1. Edit keel.yaml with your modules and environments");
    eprintln!("  2. Run 'keel validate' to check it");
    eprintln!("  3. Run 'keel plan --env <name>' to see what would change");
    Ok(())
}

fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", path.display());

    let parser = ConfigParser::new().with_base_path(project_dir(&path));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&path)?;

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&result, &config, show_warnings))?;

    if result.errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::validation_general(format!(
            "{} problem(s) found",
            result.errors.len()
        ))
        .into())
    }
}

fn cmd_graph(ws: &Workspace, env: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let graph = match env {
        Some(env) => {
            ResourceGraph::from_desired(&DesiredConfiguration::for_environment(&ws.config, env)?)
        }
        None => {
            let mut graph = ResourceGraph::new();
            for module in &ws.config.modules {
                graph.add_module(module.name.clone(), module.effective_dependencies());
            }
            graph
        }
    };
    let order = graph.build()?;
    emit(&formatter.format_graph(&graph, &order))
}

async fn cmd_plan(ws: &Workspace, env: &str, formatter: &OutputFormatter) -> Result<()> {
    let prepared = ws.prepare(env).await?;
    let shown = emit(&formatter.format_plan(prepared.plan()));
    prepared.abandon().await;
    shown
}

async fn cmd_apply(ws: &Workspace, env: &str, yes: bool, formatter: &OutputFormatter) -> Result<()> {
    let prepared = ws.prepare(env).await?;
    if let Err(err) = emit(&formatter.format_plan(prepared.plan())) {
        prepared.abandon().await;
        return Err(err);
    }

    let cancel = cancel_on_ctrl_c();
    if !yes && prepared.plan().has_changes() {
        let answer = confirm_cancellable("Do you want to apply this plan?", &cancel).await;
        if !matches!(answer, Ok(true)) {
            prepared.abandon().await;
            eprintln!("Apply cancelled.");
            return answer.map(|_| ());
        }
    }

    finish(prepared, formatter, &cancel).await
}

async fn cmd_destroy(
    ws: &Workspace,
    env: &str,
    yes: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let prepared = ws.reconciler(env).await?.prepare_teardown().await?;
    if !prepared.plan().has_changes() {
        prepared.abandon().await;
        eprintln!("Nothing recorded for '{env}'.");
        return Ok(());
    }
    if let Err(err) = emit(&formatter.format_plan(prepared.plan())) {
        prepared.abandon().await;
        return Err(err);
    }

    let cancel = cancel_on_ctrl_c();
    if !yes {
        let question = "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ";
        let answer = ask_cancellable(question, &cancel).await;
        if !matches!(&answer, Ok(Some(typed)) if typed == "destroy") {
            prepared.abandon().await;
            eprintln!("Destruction cancelled.");
            return answer.map(|_| ());
        }
    }

    finish(prepared, formatter, &cancel).await
}

async fn cmd_trigger(
    ws: &Workspace,
    branch: &str,
    commit: &str,
    yes: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let router = BranchRouter::from_config(&ws.config)?;
    let Some(env) = router.route(branch) else {
        eprintln!("No environment is triggered by branch '{branch}'.");
        return Ok(());
    };
    let env_config = ws.environment(env)?;

    let gate: Arc<dyn ApprovalGate> = if yes || env_config.approval == ApprovalMode::Auto {
        Arc::new(AutoApprove)
    } else {
        Arc::new(PromptApproval)
    };
    let pipeline = EnvironmentPipeline::new(
        ws.reconciler(env).await?,
        gate,
        Arc::new(FileConfigSource::new(&ws.path)),
    );

    let report = pipeline
        .run(SourceEvent::new(branch, commit), &cancel_on_ctrl_c())
        .await;
    emit(&formatter.format_report(&report))?;
    if let Some(partial) = &report.partial {
        emit(&formatter.format_partial(partial))?;
    }

    if report.succeeded() {
        Ok(())
    } else {
        Err(KeelError::internal(format!(
            "cycle for '{env}' ended in state {}",
            report.state
        )))
    }
}

async fn cmd_watch(ws: &Workspace, formatter: OutputFormatter) -> Result<()> {
    let router = BranchRouter::from_config(&ws.config)?;
    let source: Arc<dyn ConfigSource> = Arc::new(FileConfigSource::new(&ws.path));
    let (mut dispatcher, mut reports) = PipelineDispatcher::new(router);
    let mut approvals: BTreeMap<String, ApprovalHandle> = BTreeMap::new();

    for env in &ws.config.environments {
        let (gate, handle) = gate_for(env);
        if let Some(handle) = handle {
            approvals.insert(env.name.clone(), handle);
        }
        dispatcher.spawn(EnvironmentPipeline::new(
            ws.reconciler(&env.name).await?,
            gate,
            Arc::clone(&source),
        ));
    }

    let printer = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            if let Err(err) = emit(&formatter.format_report(&report)) {
                warn!("Could not write report: {err}");
            }
        }
    });

    info!(
        environments = ?ws.config.environment_names(),
        "Reading events from stdin"
    );
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break false,
            Err(err) => {
                error!("Could not read stdin: {err}");
                break false;
            }
        };

        match WatchInput::parse_line(&line) {
            Ok(None) => {}
            Ok(Some(WatchInput::Event(event))) => {
                let dispatch = dispatcher.dispatch(event).await;
                info!("{}", formatter.format_dispatch(&dispatch));
            }
            Ok(Some(WatchInput::Approve { approve })) => {
                send_decision(&approvals, &approve, None).await;
            }
            Ok(Some(WatchInput::Reject { reject, reason })) => {
                let reason = reason.unwrap_or_else(|| String::from("rejected by operator"));
                send_decision(&approvals, &reject, Some(reason)).await;
            }
            Err(err) => warn!("Ignoring malformed input line: {err}"),
        }
    };

    if interrupted {
        info!("Interrupt received, stopping pipelines");
        dispatcher.shutdown().await;
    } else {
        info!("Input closed, finishing pending cycles");
        dispatcher.drain().await;
    }
    if let Err(err) = printer.await {
        warn!("Report printer ended abnormally: {err}");
    }
    Ok(())
}

async fn send_decision(
    approvals: &BTreeMap<String, ApprovalHandle>,
    environment: &str,
    rejection: Option<String>,
) {
    let Some(handle) = approvals.get(environment) else {
        warn!(environment, "Environment has no manual approval gate");
        return;
    };
    let sent = match rejection {
        Some(reason) => handle.reject(reason).await,
        None => handle.approve().await,
    };
    if let Err(err) = sent {
        warn!(environment, "Could not deliver decision: {err}");
    }
}

async fn cmd_state(
    ws: &Workspace,
    env: &str,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    ws.environment(env)?;
    let store = open_store(&ws.config.state, env, &ws.dir).await?;
    debug!(backend = store.backend_type(), "Opened state store");

    match command {
        StateCommands::Show => {
            let snapshot = store.load_snapshot().await?;
            let lock = store.lock_info().await?;
            emit(&formatter.format_state(&snapshot, lock.as_ref()))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { stale, force } => {
            if !stale && !force {
                eprintln!("Use --stale to remove an expired lock or --force to remove any lock.");
                return Ok(());
            }
            match store.break_lock(force).await? {
                Some(lock) => eprintln!("Removed lock {} held by {}.", lock.lock_id, lock.holder),
                None => eprintln!("State is not locked."),
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded configuration and where it came from.
struct Workspace {
    path: PathBuf,
    dir: PathBuf,
    config: KeelConfig,
}

impl Workspace {
    /// Loads `.env` and the configuration, failing on validation errors.
    fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let path = resolve_config_path(config_path)?;
        let dir = project_dir(&path);
        debug!("Loading configuration from: {}", path.display());

        let parser = ConfigParser::new().with_base_path(dir.clone());
        parser.load_dotenv()?;
        let config = parser.load_with_env(&path)?;

        let validation = ConfigValidator::new().validate(&config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        Ok(Self { path, dir, config })
    }

    fn environment(&self, name: &str) -> Result<&keel::config::EnvironmentConfig> {
        self.config.environment(name).ok_or_else(|| {
            KeelError::Config(ConfigError::UnknownEnvironment {
                name: name.to_string(),
            })
        })
    }

    async fn reconciler(&self, environment: &str) -> Result<Reconciler> {
        self.environment(environment)?;
        let store = open_store(&self.config.state, environment, &self.dir).await?;
        let registry = ProvisionerRegistry::from_config(&self.config.provisioners)?;
        Ok(Reconciler::new(store, registry)
            .with_settings(ReconcileSettings::from_config(&self.config)))
    }

    /// Locks the environment's state and plans against it.
    async fn prepare(&self, environment: &str) -> Result<PreparedCycle> {
        let desired = DesiredConfiguration::for_environment(&self.config, environment)?;
        let prepared = self.reconciler(environment).await?.prepare(&desired).await?;
        Ok(prepared.with_config_hash(Fingerprinter::new().hash_config(&self.config)))
    }
}

/// Applies a prepared cycle, cancelling between steps on Ctrl-C.
async fn finish(
    prepared: PreparedCycle,
    formatter: &OutputFormatter,
    cancel: &CancellationToken,
) -> Result<()> {
    match prepared.apply(cancel, None).await {
        Ok(outcome) => emit(&formatter.format_outcome(&outcome)),
        Err(err) => {
            if let Some(partial) = err.partial_apply() {
                emit(&formatter.format_partial(partial))?;
            }
            Err(err)
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });
    token
}

fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn project_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}
