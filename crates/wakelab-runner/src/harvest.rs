use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;
use wakelab_core::{ensure_dir, MODEL_ARTIFACT_EXTENSIONS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub modified: SystemTime,
}

fn is_model_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            MODEL_ARTIFACT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Start-of-run timestamp, read from the marker file the supervisor touches
/// before the first training phase.
pub fn start_marker_time(marker: &Path) -> Result<SystemTime> {
    let meta = fs::metadata(marker)
        .with_context(|| format!("missing run start marker {}", marker.display()))?;
    meta.modified()
        .with_context(|| format!("no mtime available for {}", marker.display()))
}

/// Model files under `roots` modified strictly after `newer_than`, sorted by
/// path for stable ordering.
pub fn find_artifacts(roots: &[PathBuf], newer_than: SystemTime) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            let path = entry.into_path();
            if !is_model_artifact(&path) {
                continue;
            }
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified > newer_than {
                artifacts.push(Artifact { path, modified });
            }
        }
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts
}

/// Copy fresh model artifacts into `dest`. Any single copy failure aborts the
/// harvest; finding nothing is a warning, not an error.
pub fn harvest(roots: &[PathBuf], newer_than: SystemTime, dest: &Path) -> Result<Vec<PathBuf>> {
    ensure_dir(dest)?;
    let artifacts = find_artifacts(roots, newer_than);
    if artifacts.is_empty() {
        warn!("no fresh model artifacts found to harvest");
        return Ok(Vec::new());
    }
    let mut copied = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let file_name = artifact
            .path
            .file_name()
            .with_context(|| format!("artifact has no file name: {}", artifact.path.display()))?;
        let target = dest.join(file_name);
        fs::copy(&artifact.path, &target).with_context(|| {
            format!(
                "failed to copy {} to {}",
                artifact.path.display(),
                target.display()
            )
        })?;
        info!(artifact = %target.display(), "harvested model artifact");
        copied.push(target);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn only_newer_model_files_are_found_sorted() {
        let tmp = TempDirGuard::new("wakelab_harvest_find");
        let root = tmp.path.join("repo");
        ensure_dir(&root).expect("root");
        fs::write(root.join("old.tflite"), b"old").expect("old");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let marker = SystemTime::now();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(root.join("b_new.onnx"), b"new").expect("new");
        fs::write(root.join("a_new.tflite"), b"new").expect("new");
        fs::write(root.join("fresh_but_not_a_model.txt"), b"no").expect("txt");

        let found = find_artifacts(&[root], marker);
        let names: Vec<String> = found
            .iter()
            .map(|a| a.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a_new.tflite", "b_new.onnx"]);
    }

    #[test]
    fn harvest_copies_into_destination() {
        let tmp = TempDirGuard::new("wakelab_harvest_copy");
        let root = tmp.path.join("repo");
        let dest = tmp.path.join("models");
        ensure_dir(&root).expect("root");
        let marker = SystemTime::UNIX_EPOCH;
        fs::write(root.join("model.tflite"), b"weights").expect("model");

        let copied = harvest(&[root], marker, &dest).expect("harvest");
        assert_eq!(copied.len(), 1);
        assert_eq!(fs::read(dest.join("model.tflite")).expect("read"), b"weights");
    }

    #[test]
    fn empty_harvest_is_not_an_error() {
        let tmp = TempDirGuard::new("wakelab_harvest_empty");
        let root = tmp.path.join("repo");
        ensure_dir(&root).expect("root");
        let copied =
            harvest(&[root], SystemTime::now(), &tmp.path.join("models")).expect("harvest");
        assert!(copied.is_empty());
    }

    #[test]
    fn missing_roots_are_skipped() {
        let tmp = TempDirGuard::new("wakelab_harvest_missing");
        let found = find_artifacts(&[tmp.path.join("absent")], SystemTime::UNIX_EPOCH);
        assert!(found.is_empty());
    }
}
