//! Orchestration for wake-word training runs: environment probing,
//! provisioning, config synthesis, and supervised execution inside a
//! detached terminal session.

pub mod dataset;
pub mod disk;
pub mod harvest;
pub mod probe;
pub mod provision;
pub mod session;
pub mod supervisor;
pub mod synth;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};
use wakelab_core::{utc_run_stamp, RunContext, TRAINING_CONFIG_FILENAME, TRAINING_LOG_FILENAME};

use crate::dataset::DatasetSpec;
use crate::probe::ProbeReport;
use crate::provision::{
    apply_apt_plan, apt_catalog, compute_apt_plan, pip_install_set, require_commands,
    resolve_tflite_runtime, sync_repo, AptPackageManager, PipProvisioner, ReachableServices,
};
use crate::session::{SessionHandle, TmuxMultiplexer};
use crate::supervisor::{build_record, launch};
use crate::synth::{synthesize, RewriteReport, RunParams};

#[derive(Debug)]
pub struct BootstrapOutcome {
    pub session: SessionHandle,
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    pub models_dir: PathBuf,
    pub probes: ProbeReport,
    pub config_rewrites: RewriteReport,
}

/// Dataset sources for the run, explicit or conventional. Explicit sources
/// are taken verbatim; otherwise the `positives`/`negatives` directories
/// under the data dir are used when at least one of them exists.
pub fn plan_dataset(ctx: &RunContext) -> Option<DatasetSpec> {
    let (positive_raw, negative_raw) = match (&ctx.positive_sources, &ctx.negative_sources) {
        (Some(pos), Some(neg)) => (pos.clone(), neg.clone()),
        _ => {
            let pos_default = ctx.data_dir.join("positives");
            let neg_default = ctx.data_dir.join("negatives");
            if !pos_default.is_dir() && !neg_default.is_dir() {
                return None;
            }
            (
                ctx.positive_sources
                    .clone()
                    .unwrap_or_else(|| pos_default.to_string_lossy().to_string()),
                ctx.negative_sources
                    .clone()
                    .unwrap_or_else(|| neg_default.to_string_lossy().to_string()),
            )
        }
    };
    let positive_sources = dataset::parse_sources(&positive_raw);
    let negative_sources = dataset::parse_sources(&negative_raw);
    if positive_sources.is_empty() || negative_sources.is_empty() {
        return None;
    }
    Some(DatasetSpec {
        wake_phrase: ctx.wake_phrase.clone(),
        positive_sources,
        negative_sources,
        max_positives: ctx.max_positives.map(|n| n as usize),
        max_negatives: ctx.max_negatives.map(|n| n as usize),
        min_per_source: ctx.min_per_source as usize,
        seed: ctx.dataset_seed,
    })
}

/// The full bootstrap: verify the host, provision OS and Python dependencies,
/// synthesize the run config, and hand the run to a detached session.
pub fn bootstrap(ctx: &RunContext) -> Result<BootstrapOutcome> {
    require_commands(&["git", "tmux", "python3"])?;
    ctx.ensure_workspace_dirs()?;
    disk::check(&ctx.base_dir, ctx.min_free_disk_gb, ctx.allow_low_disk)?;

    let probes = probe::probe_services(ctx);
    let reachable = ReachableServices::from_probes(&probes);
    info!(
        piper = probes.piper.any(),
        oww = probes.oww.any(),
        "service probe results"
    );

    let mgr = AptPackageManager::new();
    let stamp = ctx.apt_stamp_path();
    let plan = compute_apt_plan(
        &mgr,
        &apt_catalog(),
        &reachable,
        ctx.install_optional,
        stamp.exists(),
    )?;
    apply_apt_plan(&mgr, &plan, &stamp)?;

    sync_repo(ctx)?;

    let pip = PipProvisioner::new(ctx);
    pip.ensure_venv()?;
    pip.bootstrap()?;
    pip.install(&pip_install_set(&reachable))?;
    resolve_tflite_runtime(&pip, &mgr, &reachable)?;
    pip.ensure_torch();
    pip.install_editable()?;

    let run_id = ctx.run_id(&utc_run_stamp());
    let run_dir = ctx.runs_dir.join(&run_id);
    wakelab_core::ensure_dir(&run_dir)
        .with_context(|| format!("failed to create run dir {}", run_dir.display()))?;

    let dataset_spec = plan_dataset(ctx);
    if dataset_spec.is_none() {
        warn!("no dataset sources configured; the manifest stage will be skipped");
    }

    let config_path = run_dir.join(TRAINING_CONFIG_FILENAME);
    let params = RunParams {
        wake_phrase: ctx.wake_phrase.clone(),
        model_slug: ctx.model_slug(),
        run_dir: run_dir.clone(),
        dataset_manifest: run_dir
            .join("dataset")
            .join(wakelab_core::DATASET_MANIFEST_FILENAME),
        epochs: ctx.profile.epochs(),
    };
    let config_rewrites = synthesize(&ctx.template_config_path(), &config_path, &params)?;

    let record = build_record(ctx, &run_id, &run_dir, dataset_spec);
    let session = launch(&record, &TmuxMultiplexer)?;

    Ok(BootstrapOutcome {
        session,
        run_dir: run_dir.clone(),
        log_path: run_dir.join(TRAINING_LOG_FILENAME),
        models_dir: ctx.models_dir.clone(),
        probes,
        config_rewrites,
    })
}
