use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ok,
    Warn,
    Fail,
}

/// Pure gate decision: whole-GiB floor comparison with `>=` semantics; the
/// override demotes `Fail` to `Warn`, never the other way around.
pub fn evaluate(avail_gb: u64, min_gb: u64, allow_low: bool) -> GateOutcome {
    if avail_gb >= min_gb {
        GateOutcome::Ok
    } else if allow_low {
        GateOutcome::Warn
    } else {
        GateOutcome::Fail
    }
}

/// Available space at `path` in whole gigabytes, read from `df -Pk` like the
/// provisioning tooling this replaces.
pub fn available_gb(path: &Path) -> Result<u64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .with_context(|| format!("failed to run df for {}", path.display()))?;
    if !output.status.success() {
        bail!("df failed for {}", path.display());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_available_kb(&stdout)
        .map(|kb| kb / 1024 / 1024)
        .ok_or_else(|| anyhow!("could not determine free disk space at {}", path.display()))
}

fn parse_df_available_kb(df_output: &str) -> Option<u64> {
    // POSIX format: Filesystem 1024-blocks Used Available Capacity Mounted-on
    let line = df_output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields.get(3)?.parse::<u64>().ok()
}

/// Fail-fast check run before any provisioning work.
pub fn check(path: &Path, min_gb: u64, allow_low: bool) -> Result<GateOutcome> {
    let avail_gb = available_gb(path)?;
    match evaluate(avail_gb, min_gb, allow_low) {
        GateOutcome::Ok => Ok(GateOutcome::Ok),
        GateOutcome::Warn => {
            warn!(
                "free disk at {} is {}GB (<{}GB); continuing due to low-disk override",
                path.display(),
                avail_gb,
                min_gb
            );
            Ok(GateOutcome::Warn)
        }
        GateOutcome::Fail => bail!(
            "insufficient free disk at {}: {}GB available, need >= {}GB (override with --allow-low-disk or ALLOW_LOW_DISK=1)",
            path.display(),
            avail_gb,
            min_gb
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_passes_at_or_above_threshold() {
        assert_eq!(evaluate(8, 8, false), GateOutcome::Ok);
        assert_eq!(evaluate(100, 8, false), GateOutcome::Ok);
        assert_eq!(evaluate(8, 8, true), GateOutcome::Ok);
    }

    #[test]
    fn gate_fails_below_threshold_without_override() {
        assert_eq!(evaluate(7, 8, false), GateOutcome::Fail);
        assert_eq!(evaluate(0, 1, false), GateOutcome::Fail);
    }

    #[test]
    fn override_demotes_fail_to_warn() {
        assert_eq!(evaluate(7, 8, true), GateOutcome::Warn);
        assert_eq!(evaluate(0, 64, true), GateOutcome::Warn);
    }

    #[test]
    fn parses_posix_df_output() {
        let out = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                   /dev/root  61608748 20971520 37749184  36% /\n";
        assert_eq!(parse_df_available_kb(out), Some(37_749_184));
    }

    #[test]
    fn rejects_garbled_df_output() {
        assert_eq!(parse_df_available_kb("nonsense"), None);
        assert_eq!(parse_df_available_kb("header only\n/dev/root x y z"), None);
    }
}
