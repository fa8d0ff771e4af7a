use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const WEIGHT_CANDIDATES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];
const SENTENCE_BERT_CONFIG: &str = "sentence_bert_config.json";
const POOLING_CONFIG: &str = "1_Pooling/config.json";
const MODULES: &str = "modules.json";

/// `model_type` values whose weights map onto candle's `BertModel`.
const SUPPORTED_MODEL_TYPES: [&str; 1] = ["bert"];
/// Pipeline stages the encoder reproduces, by sentence-transformers class name.
const SUPPORTED_MODULES: [&str; 3] = ["Transformer", "Pooling", "Normalize"];

/// Paths of everything needed to build a sentence encoder.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
    pub sentence_bert_config: Option<PathBuf>,
    pub pooling_config: Option<PathBuf>,
    pub modules: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SentenceBertConfig {
    #[serde(default)]
    pub max_seq_length: Option<usize>,
    #[serde(default)]
    pub do_lower_case: bool,
}

/// Flags as written by sentence-transformers in `1_Pooling/config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolingConfig {
    #[serde(default)]
    pub pooling_mode_cls_token: bool,
    #[serde(default)]
    pub pooling_mode_mean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_max_tokens: bool,
    #[serde(default)]
    pub pooling_mode_mean_sqrt_len_tokens: bool,
    #[serde(default)]
    pub pooling_mode_weightedmean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_lasttoken: bool,
}

#[derive(Debug, Deserialize)]
struct ArchitectureInfo {
    #[serde(default)]
    model_type: Option<String>,
}

/// One entry of `modules.json`.
#[derive(Debug, Deserialize)]
struct ModuleEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: String,
}

/// A local directory wins over a hub lookup of the same name.
pub fn resolve(model: &str, revision: &str) -> Result<ModelFiles> {
    let local = Path::new(model);
    if local.is_dir() {
        info!("loading model files from {}", local.display());
        return resolve_local(local);
    }
    info!("fetching {model}@{revision} from the hub");
    resolve_hub(model, revision)
}

pub fn resolve_local(snapshot: &Path) -> Result<ModelFiles> {
    let config = require(snapshot, "config.json")?;
    let tokenizer = require(snapshot, "tokenizer.json")?;
    let weights = find_model_weights(snapshot)
        .ok_or_else(|| anyhow!("no model weights found under {}", snapshot.display()))?;

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
        sentence_bert_config: optional(snapshot, SENTENCE_BERT_CONFIG),
        pooling_config: optional(snapshot, POOLING_CONFIG),
        modules: optional(snapshot, MODULES),
    })
}

fn resolve_hub(model: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().context("failed to initialize hub client")?;
    let repo = api.repo(Repo::with_revision(
        model.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let fetch = |name: &str| {
        repo.get(name)
            .with_context(|| format!("failed to fetch {name} for {model}"))
    };

    let config = fetch("config.json")?;
    let tokenizer = fetch("tokenizer.json")?;
    let weights = first_available(&WEIGHT_CANDIDATES, |name| repo.get(name))
        .with_context(|| format!("no model weights found in {model}@{revision}"))?;

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
        sentence_bert_config: repo.get(SENTENCE_BERT_CONFIG).ok(),
        pooling_config: repo.get(POOLING_CONFIG).ok(),
        modules: repo.get(MODULES).ok(),
    })
}

/// First candidate that fetches. When all fail, the last error is returned.
fn first_available<T, E, F>(candidates: &[&str], mut fetch: F) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(&str) -> std::result::Result<T, E>,
{
    let mut last_err = None;
    for &name in candidates {
        match fetch(name) {
            Ok(found) => return Ok(found),
            Err(err) => {
                warn!(file = name, error = %err, "candidate not available");
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(anyhow::Error::new(err)),
        None => bail!("no candidates given"),
    }
}

/// Rejects checkpoints whose outputs this encoder cannot reproduce: a non-BERT
/// `model_type`, or a `modules.json` pipeline with stages beyond
/// Transformer, Pooling and Normalize.
pub fn check_architecture(files: &ModelFiles) -> Result<()> {
    let arch: ArchitectureInfo = read_json(&files.config)?;
    if let Some(model_type) = arch.model_type.as_deref() {
        if !SUPPORTED_MODEL_TYPES.contains(&model_type) {
            bail!(
                "{}: unsupported model_type '{model_type}', expected one of {:?}",
                files.config.display(),
                SUPPORTED_MODEL_TYPES
            );
        }
    }

    if let Some(path) = files.modules.as_deref() {
        let modules: Vec<ModuleEntry> = read_json(path)?;
        for module in &modules {
            let class = module.kind.rsplit('.').next().unwrap_or_default();
            if !SUPPORTED_MODULES.contains(&class) {
                bail!(
                    "{}: unsupported module '{}' at '{}', expected only {:?}",
                    path.display(),
                    module.kind,
                    module.path,
                    SUPPORTED_MODULES
                );
            }
        }
    }

    Ok(())
}

fn require(snapshot: &Path, name: &str) -> Result<PathBuf> {
    let path = snapshot.join(name);
    if !path.exists() {
        return Err(anyhow!("{name} not found under {}", snapshot.display()));
    }
    Ok(path)
}

fn optional(snapshot: &Path, name: &str) -> Option<PathBuf> {
    let path = snapshot.join(name);
    path.exists().then_some(path)
}

fn find_model_weights(snapshot: &Path) -> Option<PathBuf> {
    WEIGHT_CANDIDATES
        .iter()
        .map(|candidate| snapshot.join(candidate))
        .find(|path| path.exists())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn build_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ext == "safetensors" {
        let files = vec![path.to_path_buf()];
        // SAFETY: the weights file is not modified while the process runs.
        unsafe {
            VarBuilder::from_mmaped_safetensors(&files, dtype, device)
                .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
        }
    } else {
        VarBuilder::from_pth(path, dtype, device)
            .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ktulhu-embed-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn resolves_local_snapshot_with_optional_files() {
        let dir = scratch_dir("full");
        fs::write(dir.join("config.json"), "{}").unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        fs::write(dir.join("pytorch_model.bin"), b"").unwrap();
        fs::write(dir.join(SENTENCE_BERT_CONFIG), r#"{"max_seq_length": 128}"#).unwrap();
        fs::create_dir_all(dir.join("1_Pooling")).unwrap();
        fs::write(dir.join(POOLING_CONFIG), r#"{"pooling_mode_cls_token": true}"#).unwrap();

        let files = resolve(dir.to_str().unwrap(), "main").unwrap();
        assert!(files.weights.ends_with("pytorch_model.bin"));

        let sbert: SentenceBertConfig = read_json(&files.sentence_bert_config.unwrap()).unwrap();
        assert_eq!(sbert.max_seq_length, Some(128));
        assert!(!sbert.do_lower_case);

        let pooling: PoolingConfig = read_json(&files.pooling_config.unwrap()).unwrap();
        assert!(pooling.pooling_mode_cls_token);
        assert!(!pooling.pooling_mode_mean_tokens);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn prefers_safetensors_over_pth() {
        let dir = scratch_dir("both-weights");
        fs::write(dir.join("config.json"), "{}").unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        fs::write(dir.join("model.safetensors"), b"").unwrap();
        fs::write(dir.join("pytorch_model.bin"), b"").unwrap();

        let files = resolve_local(&dir).unwrap();
        assert!(files.weights.ends_with("model.safetensors"));
        assert!(files.sentence_bert_config.is_none());
        assert!(files.pooling_config.is_none());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_tokenizer_is_reported() {
        let dir = scratch_dir("no-tokenizer");
        fs::write(dir.join("config.json"), "{}").unwrap();

        let err = resolve_local(&dir).unwrap_err();
        assert!(err.to_string().contains("tokenizer.json"));

        fs::remove_dir_all(dir).ok();
    }

    fn files_in(dir: &Path, config: &str, modules: Option<&str>) -> ModelFiles {
        fs::write(dir.join("config.json"), config).unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        fs::write(dir.join("model.safetensors"), b"").unwrap();
        if let Some(modules) = modules {
            fs::write(dir.join(MODULES), modules).unwrap();
        }
        resolve_local(dir).unwrap()
    }

    #[test]
    fn accepts_bert_with_standard_pipeline() {
        let dir = scratch_dir("arch-ok");
        let files = files_in(
            &dir,
            r#"{"model_type": "bert"}"#,
            Some(
                r#"[
                {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
                {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"},
                {"idx": 2, "name": "2", "path": "2_Normalize", "type": "sentence_transformers.models.Normalize"}
            ]"#,
            ),
        );
        check_architecture(&files).unwrap();

        // older configs carry no model_type at all
        let files = files_in(&dir, "{}", None);
        check_architecture(&files).unwrap();

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn rejects_non_bert_model_type() {
        let dir = scratch_dir("arch-xlmr");
        let files = files_in(&dir, r#"{"model_type": "xlm-roberta"}"#, None);
        let msg = check_architecture(&files).unwrap_err().to_string();
        assert!(msg.contains("xlm-roberta"), "{msg}");
        assert!(msg.contains("config.json"), "{msg}");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn rejects_extra_pipeline_modules() {
        let dir = scratch_dir("arch-dense");
        let files = files_in(
            &dir,
            r#"{"model_type": "bert"}"#,
            Some(
                r#"[
                {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
                {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"},
                {"idx": 2, "name": "2", "path": "2_Dense", "type": "sentence_transformers.models.Dense"}
            ]"#,
            ),
        );
        let msg = check_architecture(&files).unwrap_err().to_string();
        assert!(msg.contains("modules.json"), "{msg}");
        assert!(msg.contains("sentence_transformers.models.Dense"), "{msg}");
        assert!(msg.contains("2_Dense"), "{msg}");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn first_available_keeps_the_last_failure() {
        let tried = std::cell::RefCell::new(Vec::new());
        let err = first_available::<PathBuf, _, _>(&WEIGHT_CANDIDATES, |name| {
            tried.borrow_mut().push(name.to_string());
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("401 unauthorized for {name}"),
            ))
        })
        .unwrap_err();
        assert_eq!(*tried.borrow(), vec!["model.safetensors", "pytorch_model.bin"]);
        assert!(err.to_string().contains("401 unauthorized for pytorch_model.bin"));

        let found = first_available(&WEIGHT_CANDIDATES, |name| {
            if name == "pytorch_model.bin" {
                Ok(PathBuf::from(name))
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "404"))
            }
        })
        .unwrap();
        assert_eq!(found, PathBuf::from("pytorch_model.bin"));
    }
}
