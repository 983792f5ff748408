use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};
use wakelab_core::RunContext;

use crate::probe::{dns_resolves, ProbeReport};

/// Function a reachable collaborator service can stand in for. A package
/// whose role is already served over the network is left out of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    SpeechSynthesis,
    WakewordServing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReachableServices {
    pub speech_synthesis: bool,
    pub wakeword_serving: bool,
}

impl ReachableServices {
    pub fn from_probes(probes: &ProbeReport) -> Self {
        Self {
            speech_synthesis: probes.piper.any(),
            wakeword_serving: probes.oww.any(),
        }
    }

    fn serves(&self, role: ServiceRole) -> bool {
        match role {
            ServiceRole::SpeechSynthesis => self.speech_synthesis,
            ServiceRole::WakewordServing => self.wakeword_serving,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Required,
    Optional,
    BestEffort,
}

#[derive(Debug, Clone, Copy)]
pub struct PackageSpec {
    pub name: &'static str,
    pub tier: Tier,
    pub stand_in: Option<ServiceRole>,
}

const fn pkg(name: &'static str, tier: Tier) -> PackageSpec {
    PackageSpec {
        name,
        tier,
        stand_in: None,
    }
}

/// OS packages for the training toolchain, straight from the target platform
/// (Debian/Raspberry Pi OS).
pub fn apt_catalog() -> Vec<PackageSpec> {
    vec![
        pkg("ca-certificates", Tier::Required),
        pkg("curl", Tier::Required),
        pkg("git", Tier::Required),
        pkg("tmux", Tier::Required),
        pkg("build-essential", Tier::Required),
        pkg("pkg-config", Tier::Required),
        pkg("python3-venv", Tier::Required),
        pkg("python3-pip", Tier::Required),
        pkg("python3-dev", Tier::Required),
        pkg("ffmpeg", Tier::Required),
        pkg("sox", Tier::Required),
        pkg("libsndfile1", Tier::Required),
        pkg("libsndfile1-dev", Tier::Required),
        pkg("libasound2-dev", Tier::Required),
        pkg("libffi-dev", Tier::Required),
        pkg("libssl-dev", Tier::Required),
        pkg("jq", Tier::Required),
        // Distro-built python packages: faster than pip builds on a Pi.
        pkg("python3-numpy", Tier::Optional),
        pkg("python3-scipy", Tier::Optional),
        pkg("python3-yaml", Tier::Optional),
        pkg("python3-soundfile", Tier::Optional),
        // May or may not exist in the configured repos.
        pkg("libspeexdsp-dev", Tier::BestEffort),
        pkg("python3-torch", Tier::BestEffort),
        pkg("python3-torchaudio", Tier::BestEffort),
        pkg("python3-onnxruntime", Tier::BestEffort),
    ]
}

pub const PIP_BASELINE: &[PackageSpec] = &[
    pkg("pyyaml", Tier::Required),
    pkg("numpy", Tier::Required),
    pkg("scipy", Tier::Required),
    pkg("soundfile", Tier::Required),
    pkg("resampy", Tier::Required),
    pkg("tqdm", Tier::Required),
    pkg("matplotlib", Tier::Required),
    pkg("scikit-learn", Tier::Required),
    pkg("onnx", Tier::Required),
    pkg("onnxruntime", Tier::Required),
    pkg("datasets", Tier::Required),
    pkg("speechbrain", Tier::Required),
    PackageSpec {
        name: "piper-tts",
        tier: Tier::Required,
        stand_in: Some(ServiceRole::SpeechSynthesis),
    },
];

/// Pip install set after probe-driven exclusions.
pub fn pip_install_set(reachable: &ReachableServices) -> Vec<&'static str> {
    PIP_BASELINE
        .iter()
        .filter(|spec| match spec.stand_in {
            Some(role) => !reachable.serves(role),
            None => true,
        })
        .map(|spec| spec.name)
        .collect()
}

/// Abstraction over the system package index and installer so the planner
/// can be exercised against an in-memory state.
pub trait PackageManager {
    fn installed(&self, name: &str) -> Result<bool>;
    fn available(&self, name: &str) -> Result<bool>;
    fn install_batch(&self, names: &[String]) -> Result<()>;
    fn refresh_index(&self) -> Result<()>;
}

pub struct AptPackageManager {
    use_sudo: bool,
}

impl AptPackageManager {
    pub fn new() -> Self {
        Self {
            use_sudo: !running_as_root(),
        }
    }

    fn apt_get(&self, args: &[&str]) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("apt-get").args(args);
            cmd
        } else {
            let mut cmd = Command::new("apt-get");
            cmd.args(args);
            cmd
        }
    }
}

impl Default for AptPackageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageManager for AptPackageManager {
    fn installed(&self, name: &str) -> Result<bool> {
        let status = Command::new("dpkg")
            .args(["-s", name])
            .output()
            .context("failed to run dpkg")?
            .status;
        Ok(status.success())
    }

    fn available(&self, name: &str) -> Result<bool> {
        let status = Command::new("apt-cache")
            .args(["show", name])
            .output()
            .context("failed to run apt-cache")?
            .status;
        Ok(status.success())
    }

    fn install_batch(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut cmd = self.apt_get(&["install", "-y", "--no-install-recommends"]);
        cmd.args(names);
        let status = cmd.status().context("failed to run apt-get install")?;
        if !status.success() {
            bail!("apt-get install failed for: {}", names.join(" "));
        }
        Ok(())
    }

    fn refresh_index(&self) -> Result<()> {
        let status = self
            .apt_get(&["update", "-y"])
            .status()
            .context("failed to run apt-get update")?;
        if !status.success() {
            bail!("apt-get update failed");
        }
        Ok(())
    }
}

fn running_as_root() -> bool {
    Command::new("id")
        .arg("-u")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default)]
pub struct TierDelta {
    pub missing: Vec<String>,
    pub satisfied: Vec<String>,
    pub unavailable: Vec<String>,
    pub skipped_for_service: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionPlan {
    pub required: TierDelta,
    pub optional: TierDelta,
    pub best_effort: TierDelta,
    pub needs_index_refresh: bool,
}

impl ProvisionPlan {
    pub fn is_noop(&self) -> bool {
        self.required.missing.is_empty()
            && self.optional.missing.is_empty()
            && self.best_effort.missing.is_empty()
    }
}

/// Compute the idempotent delta without applying anything. Required packages
/// only need an installed check; optional tiers additionally need the index
/// to advertise them.
pub fn compute_apt_plan(
    mgr: &dyn PackageManager,
    catalog: &[PackageSpec],
    reachable: &ReachableServices,
    install_optional: bool,
    index_refreshed: bool,
) -> Result<ProvisionPlan> {
    let mut plan = ProvisionPlan::default();
    for spec in catalog {
        let delta = match spec.tier {
            Tier::Required => &mut plan.required,
            Tier::Optional => &mut plan.optional,
            Tier::BestEffort => &mut plan.best_effort,
        };
        if let Some(role) = spec.stand_in {
            if reachable.serves(role) {
                delta.skipped_for_service.push(spec.name.to_string());
                continue;
            }
        }
        if spec.tier != Tier::Required && !install_optional {
            continue;
        }
        if mgr.installed(spec.name)? {
            delta.satisfied.push(spec.name.to_string());
            continue;
        }
        if spec.tier == Tier::Required {
            delta.missing.push(spec.name.to_string());
        } else if mgr.available(spec.name)? {
            delta.missing.push(spec.name.to_string());
        } else {
            delta.unavailable.push(spec.name.to_string());
        }
    }
    // A stale index makes the unavailable verdicts provisional: a package the
    // index has never seen still reads unavailable. Flag the refresh so apply
    // can reclassify those after the index is fetched.
    let has_unclassified =
        !plan.optional.unavailable.is_empty() || !plan.best_effort.unavailable.is_empty();
    plan.needs_index_refresh = !index_refreshed && (!plan.is_noop() || has_unclassified);
    Ok(plan)
}

/// Refresh the package index at most once per workspace lifetime, gated by a
/// persisted stamp file. A stale index only risks a redundant install
/// attempt, never incorrect state.
fn ensure_index_fresh(mgr: &dyn PackageManager, stamp: &Path) -> Result<()> {
    if stamp.exists() {
        return Ok(());
    }
    info!("refreshing package index (first run for this workspace)");
    mgr.refresh_index()?;
    if let Some(parent) = stamp.parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(stamp, "").with_context(|| format!("failed to write {}", stamp.display()))?;
    Ok(())
}

/// Re-query availability for packages the pre-refresh index did not
/// advertise, promoting newly visible ones into the install batch.
fn reclassify_after_refresh(mgr: &dyn PackageManager, delta: &mut TierDelta) -> Result<()> {
    let mut still_unavailable = Vec::new();
    for name in std::mem::take(&mut delta.unavailable) {
        if mgr.available(&name)? {
            delta.missing.push(name);
        } else {
            still_unavailable.push(name);
        }
    }
    delta.unavailable = still_unavailable;
    Ok(())
}

/// Apply the OS-package part of the plan: required missing packages are
/// installed in one batch and any failure is fatal; optional and best-effort
/// batches are attempted and only warned about. The index is refreshed (at
/// most once per workspace) before optional availability is trusted, the
/// same ordering the shell provisioning used.
pub fn apply_apt_plan(
    mgr: &dyn PackageManager,
    plan: &ProvisionPlan,
    stamp: &Path,
) -> Result<()> {
    if plan.is_noop() && !plan.needs_index_refresh {
        info!("all OS packages already installed");
        return Ok(());
    }
    let mut plan = plan.clone();
    if plan.needs_index_refresh {
        ensure_index_fresh(mgr, stamp)?;
        reclassify_after_refresh(mgr, &mut plan.optional)?;
        reclassify_after_refresh(mgr, &mut plan.best_effort)?;
    }
    if plan.is_noop() {
        info!("all OS packages already installed");
        return Ok(());
    }
    if !plan.required.missing.is_empty() {
        info!(
            "installing required OS packages: {}",
            plan.required.missing.join(" ")
        );
        mgr.install_batch(&plan.required.missing)
            .context("required package installation failed")?;
    }
    if !plan.optional.missing.is_empty() {
        info!(
            "installing optional OS packages: {}",
            plan.optional.missing.join(" ")
        );
        if let Err(err) = mgr.install_batch(&plan.optional.missing) {
            warn!("optional package installation failed (continuing): {err:#}");
        }
    }
    if !plan.best_effort.missing.is_empty() {
        info!(
            "installing best-effort OS packages (absence is fine): {}",
            plan.best_effort.missing.join(" ")
        );
        if let Err(err) = mgr.install_batch(&plan.best_effort.missing) {
            info!("best-effort package installation failed (expected on some hosts): {err:#}");
        }
    }
    Ok(())
}

pub fn command_exists(name: &str) -> bool {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn require_commands(names: &[&str]) -> Result<()> {
    for name in names {
        if !command_exists(name) {
            bail!("missing required command: {name}");
        }
    }
    Ok(())
}

/// Clone the training library checkout, or fast-forward it when it already
/// exists. Updates are skipped without DNS; a missing checkout without DNS is
/// fatal since nothing can be trained without it.
pub fn sync_repo(ctx: &RunContext) -> Result<()> {
    if ctx.repo_dir.join(".git").is_dir() {
        info!("training repo already present: {}", ctx.repo_dir.display());
        if !dns_resolves("github.com") {
            info!("no DNS resolution; skipping repo update");
            return Ok(());
        }
        let status = Command::new("git")
            .arg("-C")
            .arg(&ctx.repo_dir)
            .args(["pull", "--ff-only"])
            .status()
            .context("failed to run git pull")?;
        if !status.success() {
            warn!("git pull failed; continuing with existing checkout");
        }
        return Ok(());
    }
    if !dns_resolves("github.com") {
        bail!(
            "no DNS resolution; cannot clone the training repo. Fix networking or pre-clone into {}",
            ctx.repo_dir.display()
        );
    }
    info!("cloning {} into {}", wakelab_core::OWW_REPO_URL, ctx.repo_dir.display());
    let status = Command::new("git")
        .args(["clone", "--depth", "1", wakelab_core::OWW_REPO_URL])
        .arg(&ctx.repo_dir)
        .status()
        .context("failed to run git clone")?;
    if !status.success() {
        bail!("git clone failed");
    }
    Ok(())
}

/// Python-side provisioning inside the workspace venv.
pub struct PipProvisioner<'a> {
    ctx: &'a RunContext,
}

impl<'a> PipProvisioner<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    fn python(&self) -> Command {
        let mut cmd = Command::new(self.ctx.venv_python());
        cmd.env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .env("PIP_NO_INPUT", "1");
        cmd
    }

    pub fn ensure_venv(&self) -> Result<()> {
        if self.ctx.venv_dir.is_dir() {
            info!("venv already exists: {}", self.ctx.venv_dir.display());
            return Ok(());
        }
        info!("creating venv: {}", self.ctx.venv_dir.display());
        // System site packages let apt-installed numpy/scipy shortcut pip
        // builds on the Pi.
        let status = Command::new("python3")
            .args(["-m", "venv", "--system-site-packages"])
            .arg(&self.ctx.venv_dir)
            .status()
            .context("failed to run python3 -m venv")?;
        if !status.success() {
            bail!("venv creation failed at {}", self.ctx.venv_dir.display());
        }
        Ok(())
    }

    pub fn bootstrap(&self) -> Result<()> {
        let status = self
            .python()
            .args(["-m", "pip", "install", "-U", "--no-input"])
            .args(["pip", "setuptools", "wheel"])
            .status()
            .context("failed to run pip bootstrap")?;
        if !status.success() {
            bail!("pip bootstrap/upgrade failed");
        }
        Ok(())
    }

    /// Install with `--prefer-binary` to avoid source builds on the Pi,
    /// retrying once without the preference flag.
    pub fn install(&self, packages: &[&str]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let status = self
            .python()
            .args(["-m", "pip", "install", "--prefer-binary", "--no-input"])
            .args(packages)
            .status()
            .context("failed to run pip install")?;
        if status.success() {
            return Ok(());
        }
        warn!(
            "pip prefer-binary install failed for: {}; retrying without prefer-binary",
            packages.join(" ")
        );
        let status = self
            .python()
            .args(["-m", "pip", "install", "--no-input"])
            .args(packages)
            .status()
            .context("failed to run pip install retry")?;
        if !status.success() {
            bail!("pip install failed for: {}", packages.join(" "));
        }
        Ok(())
    }

    pub fn import_ok(&self, module: &str) -> bool {
        self.python()
            .args(["-c", &format!("import {module}")])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Torch is usually needed for training but regularly fails to install on
    /// 32-bit Pi OS images; treated as best-effort with a loud warning.
    pub fn ensure_torch(&self) {
        if self.import_ok("torch") {
            return;
        }
        info!("torch not importable yet; attempting pip install torch + torchaudio");
        if self.install(&["torch", "torchaudio"]).is_err() {
            warn!(
                "torch install failed; if training requires torch you must resolve it for this host (64-bit strongly recommended)"
            );
        }
    }

    /// Editable install of the training library, retried once without
    /// dependency resolution, then verified by import.
    pub fn install_editable(&self) -> Result<()> {
        let repo = self.ctx.repo_dir.to_string_lossy().to_string();
        info!("installing training library from local repo (editable)");
        let status = self
            .python()
            .args(["-m", "pip", "install", "-e", &repo])
            .status()
            .context("failed to run pip install -e")?;
        if !status.success() {
            warn!("editable install failed; retrying with --no-deps");
            let status = self
                .python()
                .args(["-m", "pip", "install", "--no-deps", "-e", &repo])
                .status()
                .context("failed to run pip install -e --no-deps")?;
            if !status.success() {
                bail!("failed to install the training library from {repo}");
            }
        }
        if !self.import_ok("openwakeword") {
            bail!("openwakeword import check failed after install");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfliteResolution {
    ServedByNetwork,
    AlreadyImportable,
    InstalledViaApt,
    Unavailable,
    InstalledButBroken,
}

/// The tflite runtime is only needed to serve trained models locally; a
/// reachable wake-word service makes it redundant. Resolution order:
/// importable already, then the distro package, then a clean skip.
pub fn resolve_tflite_runtime(
    pip: &PipProvisioner<'_>,
    mgr: &dyn PackageManager,
    reachable: &ReachableServices,
) -> Result<TfliteResolution> {
    if reachable.wakeword_serving {
        info!("wake-word service reachable; skipping local tflite runtime");
        return Ok(TfliteResolution::ServedByNetwork);
    }
    if pip.import_ok("tflite_runtime.interpreter") {
        info!("tflite-runtime already importable; skipping install");
        return Ok(TfliteResolution::AlreadyImportable);
    }
    if mgr.available("python3-tflite-runtime")? {
        if !mgr.installed("python3-tflite-runtime")? {
            info!("installing tflite-runtime via the OS package");
            mgr.install_batch(&["python3-tflite-runtime".to_string()])?;
        }
        if pip.import_ok("tflite_runtime.interpreter") {
            return Ok(TfliteResolution::InstalledViaApt);
        }
        warn!("python3-tflite-runtime installed but not importable");
        return Ok(TfliteResolution::InstalledButBroken);
    }
    info!("tflite-runtime not available for this OS/arch; skipping (fine for training)");
    Ok(TfliteResolution::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct FakePackageManager {
        installed: BTreeSet<String>,
        available: BTreeSet<String>,
        available_after_refresh: BTreeSet<String>,
        install_calls: RefCell<Vec<Vec<String>>>,
        refresh_calls: RefCell<usize>,
        fail_installs: bool,
    }

    impl FakePackageManager {
        fn with_installed(names: &[&str]) -> Self {
            Self {
                installed: names.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl PackageManager for FakePackageManager {
        fn installed(&self, name: &str) -> Result<bool> {
            Ok(self.installed.contains(name))
        }

        fn available(&self, name: &str) -> Result<bool> {
            let refreshed = *self.refresh_calls.borrow() > 0;
            Ok(self.available.contains(name)
                || (refreshed && self.available_after_refresh.contains(name)))
        }

        fn install_batch(&self, names: &[String]) -> Result<()> {
            self.install_calls.borrow_mut().push(names.to_vec());
            if self.fail_installs {
                bail!("simulated install failure");
            }
            Ok(())
        }

        fn refresh_index(&self) -> Result<()> {
            *self.refresh_calls.borrow_mut() += 1;
            Ok(())
        }
    }

    struct TempDirGuard {
        path: std::path::PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                chrono::Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn required_names() -> Vec<&'static str> {
        apt_catalog()
            .iter()
            .filter(|s| s.tier == Tier::Required)
            .map(|s| s.name)
            .collect()
    }

    #[test]
    fn fully_installed_host_is_a_noop() {
        let all: Vec<&str> = apt_catalog().iter().map(|s| s.name).collect();
        let mgr = FakePackageManager::with_installed(&all);
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            true,
            false,
        )
        .expect("plan");
        assert!(plan.is_noop());
        assert!(!plan.needs_index_refresh);

        let tmp = TempDirGuard::new("wakelab_apt_noop");
        apply_apt_plan(&mgr, &plan, &tmp.path.join(".apt_updated")).expect("apply");
        assert!(mgr.install_calls.borrow().is_empty());
        assert_eq!(*mgr.refresh_calls.borrow(), 0);
    }

    #[test]
    fn missing_required_packages_install_in_one_batch_after_refresh() {
        let mut installed = required_names();
        installed.retain(|n| *n != "tmux" && *n != "ffmpeg");
        let mgr = FakePackageManager::with_installed(&installed);
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            false,
            false,
        )
        .expect("plan");
        assert_eq!(plan.required.missing, vec!["tmux", "ffmpeg"]);
        assert!(plan.needs_index_refresh);

        let tmp = TempDirGuard::new("wakelab_apt_req");
        let stamp = tmp.path.join(".apt_updated");
        apply_apt_plan(&mgr, &plan, &stamp).expect("apply");
        assert_eq!(*mgr.refresh_calls.borrow(), 1);
        assert_eq!(
            mgr.install_calls.borrow().as_slice(),
            &[vec!["tmux".to_string(), "ffmpeg".to_string()]]
        );
        assert!(stamp.exists());
    }

    #[test]
    fn existing_stamp_suppresses_index_refresh() {
        let mut installed = required_names();
        installed.retain(|n| *n != "jq");
        let mgr = FakePackageManager::with_installed(&installed);
        let mut plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            false,
            true,
        )
        .expect("plan");
        assert!(!plan.needs_index_refresh);

        // Even a plan computed without stamp knowledge only refreshes when
        // the stamp file is absent.
        plan.needs_index_refresh = true;
        let tmp = TempDirGuard::new("wakelab_apt_stamp");
        let stamp = tmp.path.join(".apt_updated");
        fs::write(&stamp, "").expect("stamp");
        apply_apt_plan(&mgr, &plan, &stamp).expect("apply");
        assert_eq!(*mgr.refresh_calls.borrow(), 0);
    }

    #[test]
    fn optional_packages_require_index_availability() {
        let mgr = FakePackageManager {
            installed: required_names().iter().map(|s| s.to_string()).collect(),
            available: ["python3-numpy", "python3-scipy"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            true,
            false,
        )
        .expect("plan");
        assert!(plan.required.missing.is_empty());
        assert_eq!(plan.optional.missing, vec!["python3-numpy", "python3-scipy"]);
        assert!(plan.optional.unavailable.contains(&"python3-yaml".to_string()));
        assert!(plan
            .best_effort
            .unavailable
            .contains(&"python3-torch".to_string()));
    }

    #[test]
    fn never_fetched_index_still_installs_optional_packages() {
        // The index advertises nothing until the first refresh, so every
        // optional package initially reads unavailable. The plan must still
        // demand a refresh and apply must reclassify afterwards, or the
        // optional tier would be skipped forever.
        let mgr = FakePackageManager {
            installed: required_names().iter().map(|s| s.to_string()).collect(),
            available_after_refresh: ["python3-numpy", "python3-scipy"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            true,
            false,
        )
        .expect("plan");
        assert!(plan.optional.missing.is_empty());
        assert!(plan.needs_index_refresh);

        let tmp = TempDirGuard::new("wakelab_apt_stale_index");
        let stamp = tmp.path.join(".apt_updated");
        apply_apt_plan(&mgr, &plan, &stamp).expect("apply");
        assert_eq!(*mgr.refresh_calls.borrow(), 1);
        let batches = mgr.install_calls.borrow();
        assert!(batches
            .iter()
            .any(|batch| batch.contains(&"python3-numpy".to_string())
                && batch.contains(&"python3-scipy".to_string())));
        assert!(stamp.exists());
    }

    #[test]
    fn optional_toggle_disables_non_required_tiers() {
        let mgr = FakePackageManager {
            installed: required_names().iter().map(|s| s.to_string()).collect(),
            available: ["python3-numpy"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            false,
            false,
        )
        .expect("plan");
        assert!(plan.is_noop());
    }

    #[test]
    fn optional_install_failure_is_not_fatal() {
        let mgr = FakePackageManager {
            installed: required_names().iter().map(|s| s.to_string()).collect(),
            available: ["python3-numpy"].iter().map(|s| s.to_string()).collect(),
            fail_installs: true,
            ..Default::default()
        };
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            true,
            true,
        )
        .expect("plan");
        let tmp = TempDirGuard::new("wakelab_apt_optfail");
        apply_apt_plan(&mgr, &plan, &tmp.path.join(".apt_updated")).expect("optional failure");
    }

    #[test]
    fn required_install_failure_is_fatal() {
        let mgr = FakePackageManager {
            fail_installs: true,
            ..Default::default()
        };
        let plan = compute_apt_plan(
            &mgr,
            &apt_catalog(),
            &ReachableServices::default(),
            false,
            true,
        )
        .expect("plan");
        let tmp = TempDirGuard::new("wakelab_apt_reqfail");
        assert!(apply_apt_plan(&mgr, &plan, &tmp.path.join(".apt_updated")).is_err());
    }

    #[test]
    fn reachable_wakeword_service_skips_tflite_resolution() {
        use std::collections::BTreeMap;
        use wakelab_core::ContextOverrides;

        let tmp = TempDirGuard::new("wakelab_tflite_served");
        let overrides = ContextOverrides {
            base_dir: Some(tmp.path.clone()),
            ..Default::default()
        };
        let ctx = RunContext::resolve(&overrides, &BTreeMap::new()).expect("ctx");
        let pip = PipProvisioner::new(&ctx);
        let mgr = FakePackageManager::default();

        let served = ReachableServices {
            speech_synthesis: false,
            wakeword_serving: true,
        };
        let resolution = resolve_tflite_runtime(&pip, &mgr, &served).expect("resolution");
        assert_eq!(resolution, TfliteResolution::ServedByNetwork);
        assert!(mgr.install_calls.borrow().is_empty());
        assert_eq!(*mgr.refresh_calls.borrow(), 0);

        // Without the service the lookup falls through locally; with nothing
        // importable and nothing in the index, that is a clean skip.
        let resolution = resolve_tflite_runtime(&pip, &mgr, &ReachableServices::default())
            .expect("resolution");
        assert_eq!(resolution, TfliteResolution::Unavailable);
        assert!(mgr.install_calls.borrow().is_empty());
    }

    #[test]
    fn reachable_services_exclude_their_local_stand_ins() {
        let both = ReachableServices {
            speech_synthesis: true,
            wakeword_serving: true,
        };
        let none = ReachableServices::default();

        let with_services = pip_install_set(&both);
        assert!(!with_services.contains(&"piper-tts"));
        let without_services = pip_install_set(&none);
        assert!(without_services.contains(&"piper-tts"));
        // The rest of the superset is unaffected either way.
        assert!(with_services.contains(&"onnxruntime"));
        assert!(without_services.contains(&"speechbrain"));
    }
}
