//! CLI subcommands — build, destroy, diff, info, graph, dump.

use clap::{Args, Subcommand};
use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::blueprint::BlueprintRegistry;
use crate::core::context::{self, Context};
use crate::core::executor::{
    Approval, ApprovalSource, AutoApprove, ExecOptions, Executor,
};
use crate::core::parser;
use crate::core::persist::DirStore;
use crate::core::planner::{build_plan, Plan, PlanRequest};
use crate::core::types::{ActionKind, Config, HookPhase};
use crate::events::{ConsoleReporter, EventBus, JsonlReporter};
use crate::hooks::{self, HookRegistry};
use crate::lookups::LookupRegistry;
use crate::provider::memory::MemoryProvider;
use crate::provider::{ChangeSetSummary, Provider};

const EXIT_OK: i32 = 0;
const EXIT_STEP_FAILED: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

/// Flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the config file
    #[arg(short = 'f', long, default_value = "apilar.yaml")]
    pub file: PathBuf,

    /// Environment file substituted into the config
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Extra environment values, overriding the environment file
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Provider region
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// Provider credential profile
    #[arg(short = 'p', long)]
    pub profile: Option<String>,

    /// Increase output (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Limit the run to these stacks (plus their dependencies)
    #[arg(long = "stacks", value_name = "NAME")]
    pub stacks: Vec<String>,

    /// With --stacks: skip the dependency closure
    #[arg(long)]
    pub only: bool,

    /// Force an update of a locked stack (repeatable)
    #[arg(long = "force", value_name = "NAME")]
    pub force: Vec<String>,

    /// Parallel workers; 0 derives from the workload
    #[arg(short = 'j', long = "jobs", default_value_t = 0)]
    pub jobs: usize,

    /// Attach provider event-log lines to step events
    #[arg(short = 't', long)]
    pub tail: bool,

    /// Object-store directory (persistent graph, artifacts)
    #[arg(long, default_value = ".apilar")]
    pub store_dir: PathBuf,

    /// Append step events as JSON lines to this file
    #[arg(long)]
    pub events_log: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or update every stack in the config
    Build {
        #[command(flatten)]
        common: CommonArgs,

        /// Prompt before applying each change set
        #[arg(short = 'i', long)]
        interactive: bool,

        /// Auto-approve change sets without replacements
        #[arg(long)]
        replacements_only: bool,

        /// Destroy and re-create stacks stuck in a failed state
        #[arg(long)]
        recreate_failed: bool,
    },

    /// Destroy every stack, dependents first
    Destroy {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show what build would change, without touching anything
    Diff {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print live stack status and outputs
    Info {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Print the dependency graph
    Graph {
        #[command(flatten)]
        common: CommonArgs,

        /// Output format
        #[arg(long, default_value = "dot", value_parser = ["dot", "json"])]
        format: String,

        /// Collapse redundant edges first
        #[arg(long)]
        reduce: bool,
    },

    /// Write rendered templates to a directory
    Dump {
        #[command(flatten)]
        common: CommonArgs,

        /// Output directory
        #[arg(value_name = "OUTDIR")]
        directory: PathBuf,
    },
}

/// Dispatch a CLI command, returning the process exit code.
pub fn dispatch(command: Commands) -> i32 {
    context::install_signal_handlers();
    let code = match command {
        Commands::Build {
            common,
            interactive,
            replacements_only,
            recreate_failed,
        } => cmd_build(&common, interactive, replacements_only, recreate_failed),
        Commands::Destroy { common } => cmd_destroy(&common),
        Commands::Diff { common } => cmd_execute_simple(&common, ActionKind::Diff, None),
        Commands::Info { common } => cmd_info(&common),
        Commands::Graph {
            common,
            format,
            reduce,
        } => cmd_graph(&common, &format, reduce),
        Commands::Dump { common, directory } => {
            cmd_execute_simple(&common, ActionKind::Dump, Some(directory))
        }
    };
    if context::was_interrupted() {
        return EXIT_INTERRUPTED;
    }
    code
}

/// Everything a command needs once the config is loaded.
struct Invocation {
    config: Config,
    ctx: Context,
    lookups: LookupRegistry,
    store: DirStore,
    provider: MemoryProvider,
    bus: EventBus,
}

fn load_invocation(common: &CommonArgs) -> Result<Invocation, i32> {
    let mut environment = match &common.env_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                eprintln!("error: cannot read {}: {}", path.display(), e);
                EXIT_CONFIG_ERROR
            })?;
            parser::parse_environment(&raw).map_err(|e| {
                eprintln!("error: {}", e);
                EXIT_CONFIG_ERROR
            })?
        }
        None => IndexMap::new(),
    };
    for pair in &common.env {
        match pair.split_once('=') {
            Some((key, value)) => {
                environment.insert(
                    key.to_string(),
                    serde_yaml_ng::Value::String(value.to_string()),
                );
            }
            None => {
                eprintln!("error: -e expects KEY=VALUE, got '{}'", pair);
                return Err(EXIT_CONFIG_ERROR);
            }
        }
    }

    let config = parser::parse_config_file(&common.file, &environment).map_err(|e| {
        eprintln!("error: {}", e);
        EXIT_CONFIG_ERROR
    })?;

    let errors = parser::validate_config(&config);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  ERROR: {}", error);
        }
        eprintln!("error: {} validation error(s)", errors.len());
        return Err(EXIT_CONFIG_ERROR);
    }
    for key in parser::unknown_top_level_keys(&config) {
        eprintln!("warning: unknown top-level key '{}'", key);
    }

    // Context environment: scalar view of the substitution values
    let mut scalar_env = IndexMap::new();
    for (key, value) in &environment {
        let text = match value {
            serde_yaml_ng::Value::String(s) => s.clone(),
            serde_yaml_ng::Value::Number(n) => n.to_string(),
            serde_yaml_ng::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        scalar_env.insert(key.clone(), text);
    }

    let config_dir = common
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let ctx = Context::new(&config, scalar_env, &config_dir);

    let mut lookups = LookupRegistry::with_builtins();
    lookups.register_from_config(&config.lookups).map_err(|e| {
        eprintln!("error: {}", e);
        EXIT_CONFIG_ERROR
    })?;

    let region = common
        .region
        .clone()
        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
        .unwrap_or_else(|| "us-east-1".to_string());

    let bus = EventBus::new();
    bus.subscribe(Box::new(ConsoleReporter { verbose: common.verbose > 0 }));
    if let Some(path) = &common.events_log {
        bus.subscribe(Box::new(JsonlReporter::new(path)));
    }

    Ok(Invocation {
        config,
        ctx,
        lookups,
        store: DirStore::new(&common.store_dir),
        provider: MemoryProvider::new(&region),
        bus,
    })
}

fn plan_or_exit(
    invocation: &Invocation,
    request: &PlanRequest,
) -> Result<Plan, i32> {
    let blueprints = BlueprintRegistry::new();
    build_plan(
        &invocation.config,
        &invocation.ctx,
        &blueprints,
        request,
        Some(&invocation.store),
    )
    .map_err(|e| {
        eprintln!("error: {}", e);
        EXIT_CONFIG_ERROR
    })
}

fn run_phase(invocation: &Invocation, phase: HookPhase, hooks: &[crate::core::types::HookDef]) -> Result<(), i32> {
    let registry = HookRegistry::with_builtins();
    hooks::run_hooks(
        phase,
        hooks,
        &registry,
        &invocation.lookups,
        &invocation.ctx,
        &invocation.provider,
    )
    .map(|_| ())
    .map_err(|e| {
        eprintln!("error: {}", e);
        EXIT_STEP_FAILED
    })
}

/// Free the persistent-graph lock when bailing out before execution.
fn release_plan_lock(invocation: &Invocation, plan: &Plan) {
    use crate::core::persist::ObjectStore;
    if let Some(token) = &plan.lock {
        let _ = invocation.store.release(token);
    }
}

fn exec_options(common: &CommonArgs) -> ExecOptions {
    ExecOptions {
        concurrency: common.jobs,
        tail: common.tail,
        ..Default::default()
    }
}

fn execute_plan(
    invocation: &Invocation,
    plan: &Plan,
    options: ExecOptions,
    approval: &dyn ApprovalSource,
) -> i32 {
    let artifacts = invocation.config.artifact_bucket.as_ref().map(|_| {
        &invocation.store as &dyn crate::core::persist::ArtifactStore
    });
    let executor = Executor {
        ctx: &invocation.ctx,
        provider: &invocation.provider,
        lookups: &invocation.lookups,
        bus: &invocation.bus,
        approval,
        options,
        artifacts,
    };
    match executor.execute(plan, Some(&invocation.store)) {
        Ok(report) => {
            let failed = report.failed();
            let canceled = report.canceled();
            if failed.is_empty() && canceled.is_empty() {
                println!("Done: {} step(s).", report.outcomes.len());
            } else {
                println!(
                    "Completed with problems: {} failed ({}), {} canceled ({}).",
                    failed.len(),
                    failed.join(", "),
                    canceled.len(),
                    canceled.join(", ")
                );
            }
            report.exit_code()
        }
        Err(error) => {
            eprintln!("error: {}", error);
            EXIT_STEP_FAILED
        }
    }
}

fn cmd_build(
    common: &CommonArgs,
    interactive: bool,
    replacements_only: bool,
    recreate_failed: bool,
) -> i32 {
    let invocation = match load_invocation(common) {
        Ok(invocation) => invocation,
        Err(code) => return code,
    };
    let request = PlanRequest {
        action: ActionKind::Build,
        targets: common.stacks.clone(),
        only: common.only,
        force: common.force.clone(),
    };
    let plan = match plan_or_exit(&invocation, &request) {
        Ok(plan) => plan,
        Err(code) => return code,
    };
    if common.verbose > 0 {
        print!("{}", plan.outline());
    }

    let pre = invocation.config.pre_build.clone();
    if let Err(code) = run_phase(&invocation, HookPhase::PreBuild, &pre) {
        release_plan_lock(&invocation, &plan);
        return code;
    }

    let mut options = exec_options(common);
    options.interactive = interactive;
    options.replacements_only = replacements_only;
    options.recreate_failed = recreate_failed;

    let prompt = PromptApproval;
    let auto = AutoApprove;
    let approval: &dyn ApprovalSource = if interactive || has_protected(&plan) {
        &prompt
    } else {
        &auto
    };

    let code = execute_plan(&invocation, &plan, options, approval);

    let post = invocation.config.post_build.clone();
    if let Err(hook_code) = run_phase(&invocation, HookPhase::PostBuild, &post) {
        return hook_code.max(code);
    }
    code
}

fn has_protected(plan: &Plan) -> bool {
    plan.steps.values().any(|s| s.stack.protected)
}

fn cmd_destroy(common: &CommonArgs) -> i32 {
    let invocation = match load_invocation(common) {
        Ok(invocation) => invocation,
        Err(code) => return code,
    };
    let request = PlanRequest {
        action: ActionKind::Destroy,
        targets: common.stacks.clone(),
        only: common.only,
        force: common.force.clone(),
    };
    let plan = match plan_or_exit(&invocation, &request) {
        Ok(plan) => plan,
        Err(code) => return code,
    };

    let pre = invocation.config.pre_destroy.clone();
    if let Err(code) = run_phase(&invocation, HookPhase::PreDestroy, &pre) {
        release_plan_lock(&invocation, &plan);
        return code;
    }

    let code = execute_plan(&invocation, &plan, exec_options(common), &AutoApprove);

    let post = invocation.config.post_destroy.clone();
    if let Err(hook_code) = run_phase(&invocation, HookPhase::PostDestroy, &post) {
        return hook_code.max(code);
    }
    code
}

/// Diff and dump share a plain plan-then-execute shape with no hooks.
fn cmd_execute_simple(
    common: &CommonArgs,
    action: ActionKind,
    dump_dir: Option<PathBuf>,
) -> i32 {
    let invocation = match load_invocation(common) {
        Ok(invocation) => invocation,
        Err(code) => return code,
    };
    let request = PlanRequest {
        action,
        targets: common.stacks.clone(),
        only: common.only,
        force: common.force.clone(),
    };
    let plan = match plan_or_exit(&invocation, &request) {
        Ok(plan) => plan,
        Err(code) => return code,
    };
    let mut options = exec_options(common);
    options.dump_dir = dump_dir;
    execute_plan(&invocation, &plan, options, &AutoApprove)
}

fn cmd_info(common: &CommonArgs) -> i32 {
    let invocation = match load_invocation(common) {
        Ok(invocation) => invocation,
        Err(code) => return code,
    };
    let request = PlanRequest {
        action: ActionKind::Info,
        targets: common.stacks.clone(),
        only: common.only,
        force: Vec::new(),
    };
    let plan = match plan_or_exit(&invocation, &request) {
        Ok(plan) => plan,
        Err(code) => return code,
    };

    for name in plan.execution_order() {
        let step = &plan.steps[&name];
        match invocation.provider.describe(&step.stack.fqn) {
            Ok(Some(description)) => {
                println!("{} ({:?})", step.stack.fqn, description.status);
                for (key, value) in &description.outputs {
                    println!("  {}: {}", key, value);
                }
            }
            Ok(None) => println!("{} (not created)", step.stack.fqn),
            Err(error) => println!("{} (error: {})", step.stack.fqn, error),
        }
    }
    EXIT_OK
}

fn cmd_graph(common: &CommonArgs, format: &str, reduce: bool) -> i32 {
    let invocation = match load_invocation(common) {
        Ok(invocation) => invocation,
        Err(code) => return code,
    };
    let request = PlanRequest {
        action: ActionKind::Graph,
        targets: common.stacks.clone(),
        only: common.only,
        force: Vec::new(),
    };
    let mut plan = match plan_or_exit(&invocation, &request) {
        Ok(plan) => plan,
        Err(code) => return code,
    };

    if reduce {
        plan.graph.transitive_reduction();
    }
    match format {
        "json" => println!("{}", plan.graph.json()),
        _ => print!("{}", plan.graph.dot()),
    }
    EXIT_OK
}

/// Terminal prompt for change-set approval.
struct PromptApproval;

impl ApprovalSource for PromptApproval {
    fn decide(&self, step: &str, summary: &ChangeSetSummary) -> Approval {
        println!("Change set for '{}':", step);
        for change in &summary.additions {
            println!("  + {} ({})", change.logical_id, change.detail);
        }
        for change in &summary.modifications {
            println!("  ~ {} ({})", change.logical_id, change.detail);
        }
        for change in &summary.replacements {
            println!("  ! {} (REPLACEMENT: {})", change.logical_id, change.detail);
        }
        print!("Apply this change set? [y/N] ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return Approval::Decline;
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Approval::Approve,
            _ => Approval::Decline,
        }
    }
}
