use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use wakelab_core::{ensure_dir, DATASET_MANIFEST_FILENAME};

pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "flac", "mp3", "ogg", "m4a"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub wake_phrase: String,
    pub positive_sources: Vec<String>,
    pub negative_sources: Vec<String>,
    pub max_positives: Option<usize>,
    pub max_negatives: Option<usize>,
    pub min_per_source: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub positive_sources: BTreeMap<String, usize>,
    pub negative_sources: BTreeMap<String, usize>,
    pub selected_positives: usize,
    pub selected_negatives: usize,
    pub min_per_source: usize,
    pub max_positives: Option<usize>,
    pub max_negatives: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub wake_phrase: String,
    pub positives: Vec<String>,
    pub negatives: Vec<String>,
    pub summary: ManifestSummary,
}

pub fn parse_sources(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Collect audio files per source, keeping the caller's source order. Files
/// are sorted before any shuffle so the selection is a pure function of the
/// seed, not of directory iteration order.
fn collect_files(sources: &[String]) -> Vec<(String, Vec<PathBuf>)> {
    let mut collected = Vec::with_capacity(sources.len());
    for source in sources {
        let path = PathBuf::from(source);
        if path.is_file() {
            collected.push((source.clone(), vec![path]));
            continue;
        }
        if !path.exists() {
            collected.push((source.clone(), Vec::new()));
            continue;
        }
        let mut files: Vec<PathBuf> = WalkDir::new(&path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|p| is_audio_file(p))
            .collect();
        files.sort();
        collected.push((source.clone(), files));
    }
    collected
}

/// Diversity-first selection: shuffle each source, take `min_per_source`
/// from every source first, then round-robin the remainder until the cap (or
/// every source) is exhausted.
fn distribute_diverse(
    collected: &[(String, Vec<PathBuf>)],
    max_total: Option<usize>,
    min_per_source: usize,
    rng: &mut StdRng,
) -> Vec<PathBuf> {
    let mut pools: Vec<Vec<PathBuf>> = collected
        .iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(_, files)| {
            let mut files = files.clone();
            files.shuffle(rng);
            files
        })
        .collect();
    if pools.is_empty() {
        return Vec::new();
    }

    let mut selection = Vec::new();
    if min_per_source > 0 {
        for pool in pools.iter_mut() {
            let take = min_per_source.min(pool.len());
            selection.extend(pool.drain(..take));
        }
    }

    let mut remaining = max_total.map(|max| max.saturating_sub(selection.len()));
    loop {
        if remaining == Some(0) {
            break;
        }
        let mut made_progress = false;
        for pool in pools.iter_mut() {
            if remaining == Some(0) {
                break;
            }
            if pool.is_empty() {
                continue;
            }
            selection.push(pool.remove(0));
            made_progress = true;
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
            }
        }
        if !made_progress {
            break;
        }
    }
    selection
}

fn write_list(path: &Path, entries: &[String]) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for entry in entries {
        writeln!(file, "{entry}")?;
    }
    Ok(())
}

fn source_counts(collected: &[(String, Vec<PathBuf>)]) -> BTreeMap<String, usize> {
    collected
        .iter()
        .map(|(source, files)| (source.clone(), files.len()))
        .collect()
}

/// Build the diversified dataset manifest and its companion list files under
/// `out_dir`. Selection is deterministic for a fixed spec.
pub fn generate_manifest(spec: &DatasetSpec, out_dir: &Path) -> Result<DatasetManifest> {
    if spec.positive_sources.is_empty() {
        bail!("no positive sources provided");
    }
    if spec.negative_sources.is_empty() {
        bail!("no negative sources provided");
    }
    ensure_dir(out_dir)?;

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let positive_collected = collect_files(&spec.positive_sources);
    let negative_collected = collect_files(&spec.negative_sources);

    let positives: Vec<String> = distribute_diverse(
        &positive_collected,
        spec.max_positives,
        spec.min_per_source,
        &mut rng,
    )
    .iter()
    .map(|p| p.to_string_lossy().to_string())
    .collect();
    let negatives: Vec<String> = distribute_diverse(
        &negative_collected,
        spec.max_negatives,
        spec.min_per_source,
        &mut rng,
    )
    .iter()
    .map(|p| p.to_string_lossy().to_string())
    .collect();

    let manifest = DatasetManifest {
        wake_phrase: spec.wake_phrase.clone(),
        summary: ManifestSummary {
            positive_sources: source_counts(&positive_collected),
            negative_sources: source_counts(&negative_collected),
            selected_positives: positives.len(),
            selected_negatives: negatives.len(),
            min_per_source: spec.min_per_source,
            max_positives: spec.max_positives,
            max_negatives: spec.max_negatives,
        },
        positives,
        negatives,
    };

    let manifest_path = out_dir.join(DATASET_MANIFEST_FILENAME);
    let mut rendered = serde_json::to_string_pretty(&manifest)?;
    rendered.push('\n');
    fs::write(&manifest_path, rendered)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    write_list(&out_dir.join("positives.txt"), &manifest.positives)?;
    write_list(&out_dir.join("negatives.txt"), &manifest.negatives)?;
    Ok(manifest)
}
