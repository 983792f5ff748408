use anyhow::{bail, Context, Result};
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Historical spellings of each run parameter seen across training-config
/// schemas. The rewrite is best-effort: a template using none of these still
/// synthesizes cleanly.
pub const WAKE_PHRASE_KEYS: &[&str] = &[
    "target_phrase",
    "target_phrases",
    "wake_phrase",
    "wake_phrases",
];
pub const MODEL_NAME_KEYS: &[&str] = &["model_name", "wakeword_name", "wake_word_name"];
pub const OUTPUT_DIR_KEYS: &[&str] = &["output_dir", "model_output_dir", "export_dir"];
pub const DATASET_KEYS: &[&str] = &[
    "dataset_path",
    "dataset_json",
    "custom_dataset_path",
    "custom_dataset",
];
pub const EPOCH_KEYS: &[&str] = &["epochs", "n_epochs", "num_epochs", "max_epochs"];

#[derive(Debug, Clone)]
pub struct RunParams {
    pub wake_phrase: String,
    pub model_slug: String,
    pub run_dir: PathBuf,
    pub dataset_manifest: PathBuf,
    pub epochs: u64,
}

/// How many occurrences each category rewrote. Zero in a category is legal
/// (the schema may not expose that knob) but worth surfacing, since a typo'd
/// alias list would otherwise fail invisibly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub wake_phrase: usize,
    pub model_name: usize,
    pub output_dir: usize,
    pub dataset: usize,
    pub epochs: usize,
}

impl RewriteReport {
    pub fn total(&self) -> usize {
        self.wake_phrase + self.model_name + self.output_dir + self.dataset + self.epochs
    }

    pub fn categories(&self) -> [(&'static str, usize); 5] {
        [
            ("wake_phrase", self.wake_phrase),
            ("model_name", self.model_name),
            ("output_dir", self.output_dir),
            ("dataset", self.dataset),
            ("epochs", self.epochs),
        ]
    }
}

/// Replace the value of `key` wherever it occurs in the tree, at any depth,
/// recursing through mappings and sequences. Values under a matched key are
/// replaced wholesale, not descended into.
fn rewrite_key_everywhere(node: &mut Value, key: &str, value: &Value) -> usize {
    let mut hits = 0;
    match node {
        Value::Mapping(map) => {
            for (k, v) in map.iter_mut() {
                if k.as_str() == Some(key) {
                    *v = value.clone();
                    hits += 1;
                } else {
                    hits += rewrite_key_everywhere(v, key, value);
                }
            }
        }
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                hits += rewrite_key_everywhere(item, key, value);
            }
        }
        _ => {}
    }
    hits
}

/// A plural or `target_*` spelling takes a one-element list; the rest take
/// the bare phrase.
fn wake_phrase_value(key: &str, phrase: &str) -> Value {
    if key.ends_with('s') || key.starts_with("target_") {
        Value::Sequence(vec![Value::String(phrase.to_string())])
    } else {
        Value::String(phrase.to_string())
    }
}

pub fn rewrite_tree(tree: &mut Value, params: &RunParams) -> RewriteReport {
    let mut report = RewriteReport::default();
    for key in WAKE_PHRASE_KEYS {
        let value = wake_phrase_value(key, &params.wake_phrase);
        report.wake_phrase += rewrite_key_everywhere(tree, key, &value);
    }
    let slug = Value::String(params.model_slug.clone());
    for key in MODEL_NAME_KEYS {
        report.model_name += rewrite_key_everywhere(tree, key, &slug);
    }
    let run_dir = Value::String(params.run_dir.to_string_lossy().to_string());
    for key in OUTPUT_DIR_KEYS {
        report.output_dir += rewrite_key_everywhere(tree, key, &run_dir);
    }
    let manifest = Value::String(params.dataset_manifest.to_string_lossy().to_string());
    for key in DATASET_KEYS {
        report.dataset += rewrite_key_everywhere(tree, key, &manifest);
    }
    let epochs = Value::Number(params.epochs.into());
    for key in EPOCH_KEYS {
        report.epochs += rewrite_key_everywhere(tree, key, &epochs);
    }
    report
}

/// Load the template, inject the run parameters wherever their aliases occur,
/// and write the run-specific config next to the run record.
pub fn synthesize(template: &Path, out: &Path, params: &RunParams) -> Result<RewriteReport> {
    if !template.is_file() {
        bail!("expected template config not found: {}", template.display());
    }
    let raw = fs::read_to_string(template)
        .with_context(|| format!("failed to read template: {}", template.display()))?;
    let mut tree: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse template: {}", template.display()))?;
    let report = rewrite_tree(&mut tree, params);
    let rendered =
        serde_yaml::to_string(&tree).context("failed to serialize training config")?;
    fs::write(out, rendered)
        .with_context(|| format!("failed to write config: {}", out.display()))?;

    for (category, hits) in report.categories() {
        if hits == 0 {
            warn!("config template exposes no recognized '{category}' key; value not injected");
        }
    }
    info!(
        "synthesized {} ({} key rewrites)",
        out.display(),
        report.total()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RunParams {
        RunParams {
            wake_phrase: "hey assistant".to_string(),
            model_slug: "hey_assistant".to_string(),
            run_dir: PathBuf::from("/lab/runs/hey_assistant_20240101T000000Z"),
            dataset_manifest: PathBuf::from(
                "/lab/runs/hey_assistant_20240101T000000Z/dataset/dataset.json",
            ),
            epochs: 10,
        }
    }

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).expect("yaml")
    }

    #[test]
    fn rewrites_every_occurrence_at_every_depth() {
        let mut tree = parse(
            r#"
model_name: old
training:
  model_name: older
  stages:
    - model_name: oldest
      inner:
        model_name: fossil
"#,
        );
        let report = rewrite_tree(&mut tree, &params());
        assert_eq!(report.model_name, 4);
        let rendered = serde_yaml::to_string(&tree).unwrap();
        assert!(!rendered.contains("old"));
        assert_eq!(rendered.matches("hey_assistant").count(), 4);
    }

    #[test]
    fn preserves_unrecognized_keys() {
        let mut tree = parse(
            r#"
augmentation:
  noise_snr_db: [5, 10]
  rir_paths: /data/rirs
model_name: placeholder
"#,
        );
        rewrite_tree(&mut tree, &params());
        let map = tree.as_mapping().unwrap();
        let aug = map
            .get(&Value::String("augmentation".into()))
            .unwrap()
            .as_mapping()
            .unwrap();
        assert_eq!(
            aug.get(&Value::String("rir_paths".into())).unwrap(),
            &Value::String("/data/rirs".into())
        );
        assert!(aug.contains_key(&Value::String("noise_snr_db".into())));
    }

    #[test]
    fn alias_free_template_synthesizes_unchanged() {
        let mut tree = parse("unrelated: true\nother: [1, 2, 3]\n");
        let before = tree.clone();
        let report = rewrite_tree(&mut tree, &params());
        assert_eq!(report.total(), 0);
        assert_eq!(tree, before);
    }

    #[test]
    fn plural_and_target_spellings_get_a_list() {
        let mut tree = parse(
            "target_phrase: x\ntarget_phrases: [y]\nwake_phrase: z\nwake_phrases: [w]\n",
        );
        rewrite_tree(&mut tree, &params());
        let map = tree.as_mapping().unwrap();
        let list = Value::Sequence(vec![Value::String("hey assistant".into())]);
        let scalar = Value::String("hey assistant".into());
        assert_eq!(map.get(&Value::String("target_phrase".into())).unwrap(), &list);
        assert_eq!(map.get(&Value::String("target_phrases".into())).unwrap(), &list);
        assert_eq!(map.get(&Value::String("wake_phrase".into())).unwrap(), &scalar);
        assert_eq!(map.get(&Value::String("wake_phrases".into())).unwrap(), &list);
    }

    #[test]
    fn epoch_aliases_all_receive_the_profile_value() {
        let mut tree = parse("epochs: 1\nmodel:\n  n_epochs: 2\n  max_epochs: 3\n");
        let mut p = params();
        p.epochs = 50;
        let report = rewrite_tree(&mut tree, &p);
        assert_eq!(report.epochs, 3);
        let rendered = serde_yaml::to_string(&tree).unwrap();
        assert_eq!(rendered.matches("50").count(), 3);
    }

    #[test]
    fn synthesize_requires_the_template_file() {
        let missing = PathBuf::from("/nonexistent/custom_model.yml");
        let err = synthesize(&missing, &PathBuf::from("/tmp/out.yml"), &params())
            .expect_err("missing template must fail");
        assert!(err.to_string().contains("template"));
    }
}
