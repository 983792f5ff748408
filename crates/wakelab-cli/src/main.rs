use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wakelab_core::{env_snapshot, ContextOverrides, RunContext, TrainProfile};
use wakelab_runner::provision::{
    apt_catalog, compute_apt_plan, pip_install_set, AptPackageManager, ReachableServices,
};
use wakelab_runner::{disk, harvest, probe, supervisor};

#[derive(Parser)]
#[command(name = "wakelab", version, about = "Wake-word training environment bootstrapper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    #[value(name = "tiny")]
    Tiny,
    #[value(name = "medium")]
    Medium,
    #[value(name = "large")]
    Large,
}

impl From<ProfileArg> for TrainProfile {
    fn from(value: ProfileArg) -> Self {
        match value {
            ProfileArg::Tiny => TrainProfile::Tiny,
            ProfileArg::Medium => TrainProfile::Medium,
            ProfileArg::Large => TrainProfile::Large,
        }
    }
}

#[derive(Args, Debug, Default)]
struct ContextArgs {
    /// Workspace root for the repo checkout, venv, runs, and logs
    #[arg(long)]
    base_dir: Option<PathBuf>,
    #[arg(long)]
    repo_dir: Option<PathBuf>,
    #[arg(long)]
    venv_dir: Option<PathBuf>,
    #[arg(long)]
    runs_dir: Option<PathBuf>,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Destination for harvested model artifacts
    #[arg(long)]
    models_dir: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    min_free_disk_gb: Option<u64>,
    /// Demote the free-disk failure to a warning
    #[arg(long)]
    allow_low_disk: bool,
    /// Skip the optional OS package tier
    #[arg(long)]
    skip_optional: bool,
    #[arg(long)]
    wake_phrase: Option<String>,
    #[arg(long, value_enum)]
    profile: Option<ProfileArg>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    piper_host: Option<String>,
    #[arg(long)]
    piper_port: Option<u16>,
    #[arg(long)]
    oww_host: Option<String>,
    #[arg(long)]
    oww_port: Option<u16>,
    #[arg(long)]
    umask: Option<String>,
    /// Comma-separated directories of wake-phrase recordings
    #[arg(long)]
    positive_sources: Option<String>,
    /// Comma-separated directories of non-wake-phrase audio
    #[arg(long)]
    negative_sources: Option<String>,
    #[arg(long)]
    max_positives: Option<u64>,
    #[arg(long)]
    max_negatives: Option<u64>,
    #[arg(long)]
    min_per_source: Option<u64>,
    #[arg(long)]
    dataset_seed: Option<u64>,
}

impl ContextArgs {
    fn into_overrides(self) -> ContextOverrides {
        ContextOverrides {
            base_dir: self.base_dir,
            repo_dir: self.repo_dir,
            venv_dir: self.venv_dir,
            runs_dir: self.runs_dir,
            logs_dir: self.logs_dir,
            models_dir: self.models_dir,
            data_dir: self.data_dir,
            min_free_disk_gb: self.min_free_disk_gb,
            allow_low_disk: self.allow_low_disk.then_some(true),
            install_optional: self.skip_optional.then_some(false),
            wake_phrase: self.wake_phrase,
            profile: self.profile.map(Into::into),
            threads: self.threads,
            piper_host: self.piper_host,
            piper_port: self.piper_port,
            oww_host: self.oww_host,
            oww_port: self.oww_port,
            umask: self.umask,
            positive_sources: self.positive_sources,
            negative_sources: self.negative_sources,
            max_positives: self.max_positives,
            max_negatives: self.max_negatives,
            min_per_source: self.min_per_source,
            dataset_seed: self.dataset_seed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the environment and launch a detached training run
    Run {
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Show what provisioning would do without changing anything
    Plan {
        #[command(flatten)]
        context: ContextArgs,
        #[arg(long)]
        json: bool,
    },
    /// Probe the Wyoming services and the disk gate
    Probe {
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Copy fresh model artifacts out of an existing run
    Harvest {
        #[arg(long)]
        run_dir: PathBuf,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Internal: drive a run from inside its detached session
    #[command(hide = true)]
    Execute {
        #[arg(long)]
        run_dir: PathBuf,
    },
}

fn resolve_context(args: ContextArgs) -> Result<RunContext> {
    RunContext::resolve(&args.into_overrides(), &env_snapshot())
}

fn cmd_run(ctx: &RunContext) -> Result<()> {
    let outcome = wakelab_runner::bootstrap(ctx)?;
    println!();
    println!("=== STARTED ===");
    println!("Wake phrase      : {}", ctx.wake_phrase);
    println!("Model slug       : {}", ctx.model_slug());
    println!("Run dir          : {}", outcome.run_dir.display());
    println!("Log file         : {}", outcome.log_path.display());
    println!("Custom models dir: {}", outcome.models_dir.display());
    println!();
    println!("Attach to training:");
    println!("  {}", outcome.session.attach_hint());
    println!();
    println!("If you already run Wyoming services:");
    println!(
        "  wyoming-piper        detected on {} => {}",
        ctx.piper,
        outcome.probes.piper.any()
    );
    println!(
        "  wyoming-openwakeword detected on {} => {}",
        ctx.oww,
        outcome.probes.oww.any()
    );
    println!("=== END ===");
    Ok(())
}

fn cmd_plan(ctx: &RunContext, json: bool) -> Result<()> {
    let probes = probe::probe_services(ctx);
    let reachable = ReachableServices::from_probes(&probes);
    let mgr = AptPackageManager::new();
    let plan = compute_apt_plan(
        &mgr,
        &apt_catalog(),
        &reachable,
        ctx.install_optional,
        ctx.apt_stamp_path().exists(),
    )?;
    let pip = pip_install_set(&reachable);

    if json {
        let rendered = serde_json::json!({
            "needs_index_refresh": plan.needs_index_refresh,
            "apt": {
                "required_missing": plan.required.missing,
                "optional_missing": plan.optional.missing,
                "best_effort_missing": plan.best_effort.missing,
                "unavailable": {
                    "optional": plan.optional.unavailable,
                    "best_effort": plan.best_effort.unavailable,
                },
            },
            "pip": pip,
            "services": probes,
        });
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }

    println!("apt index refresh needed : {}", plan.needs_index_refresh);
    println!("required missing         : {}", plan.required.missing.join(" "));
    println!("optional missing         : {}", plan.optional.missing.join(" "));
    println!("best-effort missing      : {}", plan.best_effort.missing.join(" "));
    println!("pip install set          : {}", pip.join(" "));
    println!("piper reachable          : {}", probes.piper.any());
    println!("openwakeword reachable   : {}", probes.oww.any());
    Ok(())
}

fn cmd_probe(ctx: &RunContext) -> Result<()> {
    let probes = probe::probe_services(ctx);
    println!(
        "wyoming-piper        {} => advertised {}, loopback {}",
        ctx.piper, probes.piper.advertised, probes.piper.loopback
    );
    println!(
        "wyoming-openwakeword {} => advertised {}, loopback {}",
        ctx.oww, probes.oww.advertised, probes.oww.loopback
    );
    let gate = disk::check(&ctx.base_dir, ctx.min_free_disk_gb, true)?;
    println!("disk gate            => {gate:?} (min {} GiB)", ctx.min_free_disk_gb);
    Ok(())
}

fn cmd_harvest(ctx: &RunContext, run_dir: &PathBuf) -> Result<()> {
    let marker = run_dir.join(wakelab_core::START_MARKER_FILENAME);
    let newer_than = harvest::start_marker_time(&marker)?;
    let roots = vec![run_dir.clone(), ctx.repo_dir.clone()];
    let copied = harvest::harvest(&roots, newer_than, &ctx.models_dir)?;
    for path in &copied {
        println!("{}", path.display());
    }
    println!("harvested {} artifact(s) into {}", copied.len(), ctx.models_dir.display());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { context } => cmd_run(&resolve_context(context)?),
        Commands::Plan { context, json } => cmd_plan(&resolve_context(context)?, json),
        Commands::Probe { context } => cmd_probe(&resolve_context(context)?),
        Commands::Harvest { run_dir, context } => cmd_harvest(&resolve_context(context)?, &run_dir),
        Commands::Execute { run_dir } => supervisor::execute(&run_dir),
    }
}
