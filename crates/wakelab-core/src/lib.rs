use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_BASE_DIR: &str = "BASE_DIR";
pub const ENV_REPO_DIR: &str = "OWW_REPO_DIR";
pub const ENV_VENV_DIR: &str = "VENV_DIR";
pub const ENV_RUNS_DIR: &str = "RUNS_DIR";
pub const ENV_LOGS_DIR: &str = "LOGS_DIR";
pub const ENV_MODELS_DIR: &str = "CUSTOM_MODELS_DIR";
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_MIN_FREE_DISK_GB: &str = "MIN_FREE_DISK_GB";
pub const ENV_ALLOW_LOW_DISK: &str = "ALLOW_LOW_DISK";
pub const ENV_INSTALL_OPTIONAL: &str = "INSTALL_OPTIONAL_APT";
pub const ENV_WAKE_PHRASE: &str = "WAKE_PHRASE";
pub const ENV_TRAIN_PROFILE: &str = "TRAIN_PROFILE";
pub const ENV_TRAIN_THREADS: &str = "TRAIN_THREADS";
pub const ENV_PIPER_HOST: &str = "WYOMING_PIPER_HOST";
pub const ENV_PIPER_PORT: &str = "WYOMING_PIPER_PORT";
pub const ENV_OWW_HOST: &str = "WYOMING_OPENWAKEWORD_HOST";
pub const ENV_OWW_PORT: &str = "WYOMING_OPENWAKEWORD_PORT";
pub const ENV_UMASK: &str = "UMASK";
pub const ENV_POSITIVE_SOURCES: &str = "POSITIVE_SOURCES";
pub const ENV_NEGATIVE_SOURCES: &str = "NEGATIVE_SOURCES";
pub const ENV_MAX_POSITIVES: &str = "MAX_POSITIVE_SAMPLES";
pub const ENV_MAX_NEGATIVES: &str = "MAX_NEGATIVE_SAMPLES";
pub const ENV_MIN_PER_SOURCE: &str = "MIN_PER_SOURCE";
pub const ENV_DATASET_SEED: &str = "DATASET_SEED";

pub const DEFAULT_PIPER_PORT: u16 = 10200;
pub const DEFAULT_OWW_PORT: u16 = 10400;
pub const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";
pub const DEFAULT_MIN_FREE_DISK_GB: u64 = 8;
pub const DEFAULT_WAKE_PHRASE: &str = "hey assistant";
pub const DEFAULT_UMASK: &str = "022";
pub const DEFAULT_DATASET_SEED: u64 = 42;

pub const OWW_REPO_URL: &str = "https://github.com/dscripka/openWakeWord.git";
pub const TEMPLATE_CONFIG_RELPATH: &str = "examples/custom_model.yml";
pub const TRAINING_CONFIG_FILENAME: &str = "training_config.yml";
pub const TRAINING_LOG_FILENAME: &str = "training.log";
pub const RUN_RECORD_FILENAME: &str = "run.json";
pub const RUN_SCRIPT_FILENAME: &str = "run.sh";
pub const START_MARKER_FILENAME: &str = ".start_time";
pub const COMPLETED_MARKER_FILENAME: &str = ".completed";
pub const APT_STAMP_FILENAME: &str = ".apt_updated";
pub const DATASET_MANIFEST_FILENAME: &str = "dataset.json";

/// Model interchange formats the harvester recognizes.
pub const MODEL_ARTIFACT_EXTENSIONS: &[&str] = &["tflite", "onnx"];

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(())
}

/// Lowercase, alnum kept, everything else collapsed to single underscores.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_sep = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// UTC timestamp used to name one training attempt, e.g. `20240131T235959Z`.
pub fn utc_run_stamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainProfile {
    Tiny,
    Medium,
    Large,
}

impl TrainProfile {
    pub fn epochs(self) -> u64 {
        match self {
            TrainProfile::Tiny => 10,
            TrainProfile::Medium => 25,
            TrainProfile::Large => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrainProfile::Tiny => "tiny",
            TrainProfile::Medium => "medium",
            TrainProfile::Large => "large",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "tiny" => Ok(TrainProfile::Tiny),
            "medium" => Ok(TrainProfile::Medium),
            "large" => Ok(TrainProfile::Large),
            other => Err(anyhow!(
                "invalid training profile: '{}' (allowed: tiny, medium, large)",
                other
            )),
        }
    }
}

/// CLI-provided overrides. Every field here has an environment-variable
/// equivalent; a `Some` always wins over the environment.
#[derive(Debug, Clone, Default)]
pub struct ContextOverrides {
    pub base_dir: Option<PathBuf>,
    pub repo_dir: Option<PathBuf>,
    pub venv_dir: Option<PathBuf>,
    pub runs_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub min_free_disk_gb: Option<u64>,
    pub allow_low_disk: Option<bool>,
    pub install_optional: Option<bool>,
    pub wake_phrase: Option<String>,
    pub profile: Option<TrainProfile>,
    pub threads: Option<usize>,
    pub piper_host: Option<String>,
    pub piper_port: Option<u16>,
    pub oww_host: Option<String>,
    pub oww_port: Option<u16>,
    pub umask: Option<String>,
    pub positive_sources: Option<String>,
    pub negative_sources: Option<String>,
    pub max_positives: Option<u64>,
    pub max_negatives: Option<u64>,
    pub min_per_source: Option<u64>,
    pub dataset_seed: Option<u64>,
}

/// Everything the orchestration needs, resolved once at startup and immutable
/// afterwards. Precedence per field: CLI flag > environment > built-in default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub base_dir: PathBuf,
    pub repo_dir: PathBuf,
    pub venv_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
    pub data_dir: PathBuf,
    pub min_free_disk_gb: u64,
    pub allow_low_disk: bool,
    pub install_optional: bool,
    pub wake_phrase: String,
    pub profile: TrainProfile,
    pub threads: usize,
    pub piper: ServiceEndpoint,
    pub oww: ServiceEndpoint,
    pub umask: String,
    pub positive_sources: Option<String>,
    pub negative_sources: Option<String>,
    pub max_positives: Option<u64>,
    pub max_negatives: Option<u64>,
    pub min_per_source: u64,
    pub dataset_seed: u64,
}

impl RunContext {
    /// Merge defaults, then the environment snapshot, then CLI overrides, and
    /// validate the result. The snapshot is passed in explicitly so tests can
    /// exercise precedence without mutating process state.
    pub fn resolve(
        overrides: &ContextOverrides,
        env: &BTreeMap<String, String>,
    ) -> Result<RunContext> {
        let home = env
            .get("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));

        let base_dir = pick_path(&overrides.base_dir, env, ENV_BASE_DIR)
            .unwrap_or_else(|| home.join("wakeword_lab"));
        validate_base_dir(&base_dir)?;

        let repo_dir = pick_path(&overrides.repo_dir, env, ENV_REPO_DIR)
            .unwrap_or_else(|| base_dir.join("openWakeWord"));
        let venv_dir = pick_path(&overrides.venv_dir, env, ENV_VENV_DIR)
            .unwrap_or_else(|| base_dir.join("venv"));
        let runs_dir = pick_path(&overrides.runs_dir, env, ENV_RUNS_DIR)
            .unwrap_or_else(|| base_dir.join("training_runs"));
        let logs_dir = pick_path(&overrides.logs_dir, env, ENV_LOGS_DIR)
            .unwrap_or_else(|| base_dir.join("logs"));
        let models_dir = pick_path(&overrides.models_dir, env, ENV_MODELS_DIR)
            .unwrap_or_else(|| base_dir.join("custom_models"));
        let data_dir = pick_path(&overrides.data_dir, env, ENV_DATA_DIR)
            .unwrap_or_else(|| base_dir.join("data"));

        let min_free_disk_gb = match overrides.min_free_disk_gb {
            Some(v) => v,
            None => pick_parsed(env, ENV_MIN_FREE_DISK_GB)?.unwrap_or(DEFAULT_MIN_FREE_DISK_GB),
        };
        let allow_low_disk = match overrides.allow_low_disk {
            Some(v) => v,
            None => env_flag(env, ENV_ALLOW_LOW_DISK).unwrap_or(false),
        };
        let install_optional = match overrides.install_optional {
            Some(v) => v,
            None => env_flag(env, ENV_INSTALL_OPTIONAL).unwrap_or(true),
        };

        let wake_phrase = overrides
            .wake_phrase
            .clone()
            .or_else(|| env.get(ENV_WAKE_PHRASE).cloned())
            .unwrap_or_else(|| DEFAULT_WAKE_PHRASE.to_string())
            .trim()
            .to_string();
        if wake_phrase.is_empty() {
            bail!("wake phrase must not be empty");
        }
        if slugify(&wake_phrase).is_empty() {
            bail!("wake phrase '{}' yields an empty model slug", wake_phrase);
        }

        let profile = match overrides.profile {
            Some(p) => p,
            None => match env.get(ENV_TRAIN_PROFILE) {
                Some(raw) => TrainProfile::parse(raw)?,
                None => TrainProfile::Medium,
            },
        };

        let threads = match overrides.threads {
            Some(v) => v,
            None => match pick_parsed::<usize>(env, ENV_TRAIN_THREADS)? {
                Some(v) => v,
                None => default_thread_count(),
            },
        };
        if threads == 0 {
            bail!("thread count must be >= 1");
        }

        let piper = ServiceEndpoint::new(
            overrides
                .piper_host
                .clone()
                .or_else(|| env.get(ENV_PIPER_HOST).cloned())
                .unwrap_or_else(|| DEFAULT_SERVICE_HOST.to_string()),
            match overrides.piper_port {
                Some(p) => p,
                None => pick_parsed(env, ENV_PIPER_PORT)?.unwrap_or(DEFAULT_PIPER_PORT),
            },
        );
        let oww = ServiceEndpoint::new(
            overrides
                .oww_host
                .clone()
                .or_else(|| env.get(ENV_OWW_HOST).cloned())
                .unwrap_or_else(|| DEFAULT_SERVICE_HOST.to_string()),
            match overrides.oww_port {
                Some(p) => p,
                None => pick_parsed(env, ENV_OWW_PORT)?.unwrap_or(DEFAULT_OWW_PORT),
            },
        );

        let umask = overrides
            .umask
            .clone()
            .or_else(|| env.get(ENV_UMASK).cloned())
            .unwrap_or_else(|| DEFAULT_UMASK.to_string());
        validate_umask(&umask)?;

        let positive_sources = overrides
            .positive_sources
            .clone()
            .or_else(|| env.get(ENV_POSITIVE_SOURCES).cloned());
        let negative_sources = overrides
            .negative_sources
            .clone()
            .or_else(|| env.get(ENV_NEGATIVE_SOURCES).cloned());
        let max_positives = match overrides.max_positives {
            Some(v) => Some(v),
            None => pick_parsed(env, ENV_MAX_POSITIVES)?,
        };
        let max_negatives = match overrides.max_negatives {
            Some(v) => Some(v),
            None => pick_parsed(env, ENV_MAX_NEGATIVES)?,
        };
        let min_per_source = match overrides.min_per_source {
            Some(v) => v,
            None => pick_parsed(env, ENV_MIN_PER_SOURCE)?.unwrap_or(0),
        };
        let dataset_seed = match overrides.dataset_seed {
            Some(v) => v,
            None => pick_parsed(env, ENV_DATASET_SEED)?.unwrap_or(DEFAULT_DATASET_SEED),
        };

        Ok(RunContext {
            base_dir,
            repo_dir,
            venv_dir,
            runs_dir,
            logs_dir,
            models_dir,
            data_dir,
            min_free_disk_gb,
            allow_low_disk,
            install_optional,
            wake_phrase,
            profile,
            threads,
            piper,
            oww,
            umask,
            positive_sources,
            negative_sources,
            max_positives,
            max_negatives,
            min_per_source,
            dataset_seed,
        })
    }

    pub fn model_slug(&self) -> String {
        slugify(&self.wake_phrase)
    }

    /// `{model_slug}_{utc_timestamp}` for a fixed timestamp, so a simulated
    /// clock can reproduce a collision.
    pub fn run_id(&self, stamp: &str) -> String {
        format!("{}_{}", self.model_slug(), stamp)
    }

    pub fn apt_stamp_path(&self) -> PathBuf {
        self.logs_dir.join(APT_STAMP_FILENAME)
    }

    pub fn template_config_path(&self) -> PathBuf {
        self.repo_dir.join(TEMPLATE_CONFIG_RELPATH)
    }

    pub fn venv_python(&self) -> PathBuf {
        self.venv_dir.join("bin").join("python")
    }

    /// Directories that must exist before provisioning starts.
    pub fn ensure_workspace_dirs(&self) -> Result<()> {
        for dir in [
            &self.base_dir,
            &self.runs_dir,
            &self.logs_dir,
            &self.models_dir,
            &self.data_dir,
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn validate_base_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        bail!("base directory must not be empty");
    }
    if dir == Path::new("/") {
        bail!("base directory must not be '/'; set it to a safe path");
    }
    Ok(())
}

fn validate_umask(umask: &str) -> Result<()> {
    if umask.is_empty() || umask.len() > 4 || !umask.chars().all(|c| ('0'..='7').contains(&c)) {
        bail!("umask must be an octal string like '022', got '{}'", umask);
    }
    Ok(())
}

fn pick_path(
    flag: &Option<PathBuf>,
    env: &BTreeMap<String, String>,
    key: &str,
) -> Option<PathBuf> {
    flag.clone().or_else(|| env.get(key).map(PathBuf::from))
}

fn pick_parsed<T: std::str::FromStr>(
    env: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    match env.get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a valid value (got: {})", key, raw)),
        _ => Ok(None),
    }
}

fn env_flag(env: &BTreeMap<String, String>, key: &str) -> Option<bool> {
    env.get(key).map(|raw| raw.trim() == "1")
}

/// Snapshot of the process environment, taken once at startup.
pub fn env_snapshot() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn slugify_collapses_and_lowercases() {
        assert_eq!(slugify("Hey Assistant"), "hey_assistant");
        assert_eq!(slugify("  ok -- computer!! "), "ok_computer");
        assert_eq!(slugify("___"), "");
        assert_eq!(slugify("A1 b2"), "a1_b2");
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let ctx = RunContext::resolve(
            &ContextOverrides::default(),
            &env_of(&[("HOME", "/home/pi")]),
        )
        .expect("resolve");
        assert_eq!(ctx.base_dir, PathBuf::from("/home/pi/wakeword_lab"));
        assert_eq!(ctx.runs_dir, PathBuf::from("/home/pi/wakeword_lab/training_runs"));
        assert_eq!(ctx.min_free_disk_gb, DEFAULT_MIN_FREE_DISK_GB);
        assert_eq!(ctx.profile, TrainProfile::Medium);
        assert_eq!(ctx.piper.port, DEFAULT_PIPER_PORT);
        assert_eq!(ctx.oww.port, DEFAULT_OWW_PORT);
        assert!(ctx.install_optional);
        assert!(!ctx.allow_low_disk);
        assert_eq!(ctx.umask, "022");
    }

    #[test]
    fn environment_beats_defaults() {
        let env = env_of(&[
            ("HOME", "/home/pi"),
            (ENV_BASE_DIR, "/srv/lab"),
            (ENV_TRAIN_PROFILE, "tiny"),
            (ENV_MIN_FREE_DISK_GB, "32"),
            (ENV_PIPER_PORT, "11200"),
            (ENV_ALLOW_LOW_DISK, "1"),
        ]);
        let ctx = RunContext::resolve(&ContextOverrides::default(), &env).expect("resolve");
        assert_eq!(ctx.base_dir, PathBuf::from("/srv/lab"));
        assert_eq!(ctx.repo_dir, PathBuf::from("/srv/lab/openWakeWord"));
        assert_eq!(ctx.profile, TrainProfile::Tiny);
        assert_eq!(ctx.min_free_disk_gb, 32);
        assert_eq!(ctx.piper.port, 11200);
        assert!(ctx.allow_low_disk);
    }

    #[test]
    fn flags_beat_environment() {
        let env = env_of(&[
            ("HOME", "/home/pi"),
            (ENV_BASE_DIR, "/srv/lab"),
            (ENV_TRAIN_PROFILE, "tiny"),
            (ENV_TRAIN_THREADS, "2"),
        ]);
        let overrides = ContextOverrides {
            base_dir: Some(PathBuf::from("/mnt/fast")),
            profile: Some(TrainProfile::Large),
            threads: Some(8),
            ..Default::default()
        };
        let ctx = RunContext::resolve(&overrides, &env).expect("resolve");
        assert_eq!(ctx.base_dir, PathBuf::from("/mnt/fast"));
        assert_eq!(ctx.profile, TrainProfile::Large);
        assert_eq!(ctx.threads, 8);
    }

    #[test]
    fn rejects_root_base_dir() {
        let overrides = ContextOverrides {
            base_dir: Some(PathBuf::from("/")),
            ..Default::default()
        };
        assert!(RunContext::resolve(&overrides, &BTreeMap::new()).is_err());
    }

    #[test]
    fn rejects_empty_wake_phrase() {
        let overrides = ContextOverrides {
            wake_phrase: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(RunContext::resolve(&overrides, &BTreeMap::new()).is_err());
    }

    #[test]
    fn rejects_unknown_profile_from_env() {
        let env = env_of(&[(ENV_TRAIN_PROFILE, "gigantic")]);
        let err = RunContext::resolve(&ContextOverrides::default(), &env)
            .expect_err("unknown profile must be rejected");
        assert!(err.to_string().contains("gigantic"));
    }

    #[test]
    fn rejects_bad_umask() {
        let overrides = ContextOverrides {
            umask: Some("089".to_string()),
            ..Default::default()
        };
        assert!(RunContext::resolve(&overrides, &BTreeMap::new()).is_err());
    }

    #[test]
    fn rejects_zero_threads() {
        let overrides = ContextOverrides {
            threads: Some(0),
            ..Default::default()
        };
        assert!(RunContext::resolve(&overrides, &BTreeMap::new()).is_err());
    }

    #[test]
    fn profile_epoch_table() {
        assert_eq!(TrainProfile::Tiny.epochs(), 10);
        assert_eq!(TrainProfile::Medium.epochs(), 25);
        assert_eq!(TrainProfile::Large.epochs(), 50);
    }

    #[test]
    fn run_id_combines_slug_and_stamp() {
        let overrides = ContextOverrides {
            wake_phrase: Some("Hey Assistant".to_string()),
            ..Default::default()
        };
        let ctx = RunContext::resolve(&overrides, &env_of(&[("HOME", "/home/pi")])).unwrap();
        assert_eq!(ctx.run_id("20240101T000000Z"), "hey_assistant_20240101T000000Z");
    }
}
