use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};
use wakelab_core::{
    ensure_dir, RunContext, COMPLETED_MARKER_FILENAME, RUN_RECORD_FILENAME, RUN_SCRIPT_FILENAME,
    START_MARKER_FILENAME, TRAINING_CONFIG_FILENAME, TRAINING_LOG_FILENAME,
};

use crate::dataset::{self, DatasetSpec};
use crate::harvest;
use crate::session::{LaunchOutcome, SessionHandle, SessionMultiplexer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    ConfigReady,
    DatasetGenerating,
    ClipsGenerated,
    Augmenting,
    Augmented,
    Training,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Planning => "planning",
            RunPhase::ConfigReady => "config_ready",
            RunPhase::DatasetGenerating => "dataset_generating",
            RunPhase::ClipsGenerated => "clips_generated",
            RunPhase::Augmenting => "augmenting",
            RunPhase::Augmented => "augmented",
            RunPhase::Training => "training",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    /// Phases reachable from here. ConfigReady may jump straight to
    /// ClipsGenerated when the dataset manifest stage is skipped.
    pub fn valid_next_phases(&self) -> &'static [RunPhase] {
        match self {
            RunPhase::Planning => &[RunPhase::ConfigReady, RunPhase::Failed],
            RunPhase::ConfigReady => &[
                RunPhase::DatasetGenerating,
                RunPhase::ClipsGenerated,
                RunPhase::Failed,
            ],
            RunPhase::DatasetGenerating => &[RunPhase::ClipsGenerated, RunPhase::Failed],
            RunPhase::ClipsGenerated => &[RunPhase::Augmenting, RunPhase::Failed],
            RunPhase::Augmenting => &[RunPhase::Augmented, RunPhase::Failed],
            RunPhase::Augmented => &[RunPhase::Training, RunPhase::Failed],
            RunPhase::Training => &[RunPhase::Completed, RunPhase::Failed],
            RunPhase::Completed | RunPhase::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        self.valid_next_phases().contains(&next)
    }
}

/// Everything `execute` needs to drive a run, persisted as `run.json` in the
/// run directory so the detached session is self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub repo_dir: PathBuf,
    pub venv_python: PathBuf,
    pub models_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub wake_phrase: String,
    pub threads: usize,
    pub umask: String,
    pub dataset: Option<DatasetSpec>,
    pub phase: RunPhase,
}

impl RunRecord {
    pub fn record_path(run_dir: &Path) -> PathBuf {
        run_dir.join(RUN_RECORD_FILENAME)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::record_path(&self.run_dir);
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        fs::write(&path, rendered)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = Self::record_path(run_dir);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("malformed run record {}", path.display()))
    }

    fn advance(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            bail!(
                "invalid phase transition {} -> {} for run {}",
                self.phase.as_str(),
                next.as_str(),
                self.run_id
            );
        }
        info!(run_id = %self.run_id, from = self.phase.as_str(), to = next.as_str(), "run phase transition");
        self.phase = next;
        self.save()
    }

    fn fail(&mut self, reason: &str) {
        // Failed is reachable from any non-terminal phase.
        if !self.phase.is_terminal() {
            self.phase = RunPhase::Failed;
            if let Err(err) = self.save() {
                warn!(%err, "failed to persist failed phase");
            }
        }
        let _ = append_log(&self.log_path, &format!("FATAL: {reason}"));
    }
}

pub fn append_log(log_path: &Path, message: &str) -> Result<()> {
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    writeln!(file, "[{stamp}] [train] {message}")?;
    Ok(())
}

/// Single-quote a path for bash. Inside single quotes nothing expands, so
/// only embedded quotes need the close-escape-reopen dance.
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn render_run_script(record: &RunRecord) -> Result<String> {
    let exe = std::env::current_exe().context("cannot determine current executable")?;
    Ok(format!(
        "#!/usr/bin/env bash\nset -euo pipefail\numask {}\nexec {} execute --run-dir {}\n",
        record.umask,
        shell_quote(&exe),
        shell_quote(&record.run_dir)
    ))
}

/// Create the run directory, persist the record and launcher script, and
/// start the detached training session. A pre-existing session with the same
/// name is fatal.
pub fn launch(record: &RunRecord, mux: &dyn SessionMultiplexer) -> Result<SessionHandle> {
    ensure_dir(&record.run_dir)?;
    record.save()?;

    let script_path = record.run_dir.join(RUN_SCRIPT_FILENAME);
    fs::write(&script_path, render_run_script(record)?)
        .with_context(|| format!("failed to write {}", script_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to chmod {}", script_path.display()))?;
    }

    let session = SessionHandle::new(format!("wakeword_{}", record.run_id));
    match mux.launch(&session, &script_path)? {
        LaunchOutcome::Launched => Ok(session),
        LaunchOutcome::AlreadyExists => {
            bail!("tmux session already exists: {}", session.name)
        }
    }
}

fn run_training_phase(record: &RunRecord, flag: &str) -> Result<()> {
    append_log(&record.log_path, &format!("running train.py {flag}"))?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&record.log_path)
        .with_context(|| format!("failed to open {}", record.log_path.display()))?;
    let log_err = log_file.try_clone().context("failed to clone log handle")?;
    let status = Command::new(&record.venv_python)
        .arg("openwakeword/train.py")
        .arg("--training_config")
        .arg(&record.config_path)
        .arg(flag)
        .current_dir(&record.repo_dir)
        .env("OMP_NUM_THREADS", record.threads.to_string())
        .env("OPENBLAS_NUM_THREADS", "1")
        .env("MKL_NUM_THREADS", "1")
        .env("NUMEXPR_NUM_THREADS", "1")
        .stdout(log_file)
        .stderr(log_err)
        .status()
        .with_context(|| format!("failed to spawn training phase {flag}"))?;
    if !status.success() {
        bail!("training phase {flag} exited with {status}");
    }
    Ok(())
}

/// Drive a run from inside the detached session: dataset manifest, the three
/// training phases, then the artifact harvest. Any phase failure marks the
/// run Failed and propagates.
pub fn execute(run_dir: &Path) -> Result<()> {
    let mut record = RunRecord::load(run_dir)?;
    match execute_inner(&mut record) {
        Ok(()) => Ok(()),
        Err(err) => {
            record.fail(&format!("{err:#}"));
            Err(err)
        }
    }
}

fn execute_inner(record: &mut RunRecord) -> Result<()> {
    if !record.config_path.exists() {
        bail!(
            "training config missing: {}",
            record.config_path.display()
        );
    }
    record.advance(RunPhase::ConfigReady)?;

    let start_marker = record.run_dir.join(START_MARKER_FILENAME);
    fs::write(&start_marker, b"")
        .with_context(|| format!("failed to touch {}", start_marker.display()))?;
    append_log(&record.log_path, "training start")?;
    append_log(
        &record.log_path,
        &format!("config: {}", record.config_path.display()),
    )?;
    append_log(
        &record.log_path,
        &format!("threads: {}", record.threads),
    )?;

    match record.dataset.clone() {
        Some(spec) => {
            record.advance(RunPhase::DatasetGenerating)?;
            append_log(&record.log_path, "generating diversified dataset manifest")?;
            let manifest = dataset::generate_manifest(&spec, &record.dataset_dir)?;
            append_log(
                &record.log_path,
                &format!(
                    "dataset manifest: {} positives, {} negatives",
                    manifest.summary.selected_positives, manifest.summary.selected_negatives
                ),
            )?;
        }
        None => {
            warn!("no dataset sources available, skipping manifest generation");
            append_log(
                &record.log_path,
                "WARNING: no dataset sources available, skipping manifest generation",
            )?;
        }
    }

    run_training_phase(record, "--generate_clips")?;
    record.advance(RunPhase::ClipsGenerated)?;

    record.advance(RunPhase::Augmenting)?;
    run_training_phase(record, "--augment_clips")?;
    record.advance(RunPhase::Augmented)?;

    record.advance(RunPhase::Training)?;
    run_training_phase(record, "--train_model")?;

    append_log(&record.log_path, "training finished, harvesting artifacts")?;
    let newer_than = harvest::start_marker_time(&start_marker)?;
    let roots = vec![record.run_dir.clone(), record.repo_dir.clone()];
    let copied = harvest::harvest(&roots, newer_than, &record.models_dir)?;
    append_log(
        &record.log_path,
        &format!("harvested {} model artifact(s)", copied.len()),
    )?;

    let completed_marker = record.run_dir.join(COMPLETED_MARKER_FILENAME);
    fs::write(&completed_marker, b"")
        .with_context(|| format!("failed to touch {}", completed_marker.display()))?;
    record.advance(RunPhase::Completed)?;
    append_log(&record.log_path, "done")?;
    Ok(())
}

/// Assemble the run record for a freshly planned run.
pub fn build_record(
    ctx: &RunContext,
    run_id: &str,
    run_dir: &Path,
    dataset: Option<DatasetSpec>,
) -> RunRecord {
    RunRecord {
        run_id: run_id.to_string(),
        run_dir: run_dir.to_path_buf(),
        config_path: run_dir.join(TRAINING_CONFIG_FILENAME),
        log_path: run_dir.join(TRAINING_LOG_FILENAME),
        repo_dir: ctx.repo_dir.clone(),
        venv_python: ctx.venv_python(),
        models_dir: ctx.models_dir.clone(),
        dataset_dir: run_dir.join("dataset"),
        wake_phrase: ctx.wake_phrase.clone(),
        threads: ctx.threads,
        umask: ctx.umask.clone(),
        dataset,
        phase: RunPhase::Planning,
    }
}
