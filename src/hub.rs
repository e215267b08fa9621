//! Resolving a model identifier to checkpoint files and loading them.
//!
//! A model identifier is either a HuggingFace Hub repository (`org/name`,
//! optionally pinned to a revision) or a path to a local directory laid out
//! the same way.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::Device;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::config::{GenerationDefaults, ModelConfig, DEFAULT_REVISION};
use crate::error::{PipelineError, Result};
use crate::llm::models::{CausalLm, LlamaModel};
use crate::placement::{select_device, select_dtype, DTypePreference, DevicePreference};
use crate::tokenizer::{load_tokenizer, TextTokenizer};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelId {
    pub repo: String,
    pub revision: String,
}

impl ModelId {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: DEFAULT_REVISION.to_string(),
        }
    }

    pub fn with_revision(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.revision == DEFAULT_REVISION {
            write!(f, "{}", self.repo)
        } else {
            write!(f, "{}@{}", self.repo, self.revision)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub device: DevicePreference,
    pub cuda_ordinal: usize,
    pub dtype: DTypePreference,
    pub trust_remote_code: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            cuda_ordinal: 0,
            dtype: DTypePreference::Auto,
            trust_remote_code: true,
        }
    }
}

/// Source of tokenizers and models for a model identifier.
pub trait CheckpointLoader {
    type Tokenizer: TextTokenizer;
    type Model: CausalLm;

    fn load_tokenizer(&self, model_id: &ModelId) -> Result<Self::Tokenizer>;

    fn load_model(&self, model_id: &ModelId, options: &LoadOptions) -> Result<Self::Model>;

    /// Decoding defaults shipped with the checkpoint, if any.
    fn load_generation_defaults(&self, _model_id: &ModelId) -> Result<Option<GenerationDefaults>> {
        Ok(None)
    }
}

/// Where checkpoint files come from.
enum FileSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl FileSource {
    fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            FileSource::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(PipelineError::MissingFile(path.display().to_string()))
                }
            }
            FileSource::Hub(repo) => Ok(repo.get(file)?),
        }
    }

    /// `Ok(None)` only when the file is absent; other failures propagate.
    fn get_optional(&self, file: &str) -> Result<Option<PathBuf>> {
        match self {
            FileSource::Local(dir) => {
                let path = dir.join(file);
                Ok(path.is_file().then_some(path))
            }
            FileSource::Hub(repo) => match repo.get(file) {
                Ok(path) => Ok(Some(path)),
                Err(fetch_err) => {
                    let listed = repo.info()?.siblings.iter().any(|s| s.rfilename == file);
                    if listed {
                        return Err(fetch_err.into());
                    }
                    tracing::debug!("{} is not part of the repository", file);
                    Ok(None)
                }
            },
        }
    }
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: std::collections::BTreeMap<String, String>,
}

/// Loads checkpoints from the HuggingFace Hub or from local directories.
///
/// Every call resolves its files again; loaded models are never reused.
#[derive(Debug, Clone, Default)]
pub struct HubLoader {
    progress: bool,
    cache_dir: Option<PathBuf>,
}

impl HubLoader {
    pub fn new(progress: bool) -> Self {
        Self {
            progress,
            cache_dir: None,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    fn source(&self, model_id: &ModelId) -> Result<FileSource> {
        let local = Path::new(&model_id.repo);
        if local.is_dir() {
            tracing::debug!("Reading checkpoint from local directory {}", local.display());
            return Ok(FileSource::Local(local.to_path_buf()));
        }

        let mut builder = ApiBuilder::new().with_progress(self.progress);
        if let Some(cache_dir) = &self.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build()?;
        let repo = api.repo(Repo::with_revision(
            model_id.repo.clone(),
            RepoType::Model,
            model_id.revision.clone(),
        ));
        Ok(FileSource::Hub(repo))
    }

    /// Single `model.safetensors`, or the shards listed by its index.
    fn weight_files(source: &FileSource) -> Result<Vec<PathBuf>> {
        match source.get(WEIGHTS_FILE) {
            Ok(path) => Ok(vec![path]),
            Err(single_err) => {
                tracing::debug!("No single weights file ({}); trying sharded index", single_err);
                let index_path = source.get(WEIGHTS_INDEX_FILE)?;
                let index: WeightsIndex = serde_json::from_reader(File::open(&index_path)?)?;

                let mut shards: Vec<&String> = index.weight_map.values().collect();
                shards.sort();
                shards.dedup();
                shards.into_iter().map(|shard| source.get(shard)).collect()
            }
        }
    }
}

impl CheckpointLoader for HubLoader {
    type Tokenizer = Tokenizer;
    type Model = LlamaModel;

    fn load_tokenizer(&self, model_id: &ModelId) -> Result<Tokenizer> {
        let source = self.source(model_id)?;
        let path = source.get(TOKENIZER_FILE)?;
        tracing::info!("Loading tokenizer from {}", path.display());
        load_tokenizer(&path)
    }

    fn load_model(&self, model_id: &ModelId, options: &LoadOptions) -> Result<LlamaModel> {
        let source = self.source(model_id)?;

        let config_path = source.get(CONFIG_FILE)?;
        let cfg: ModelConfig = serde_json::from_reader(File::open(&config_path)?)?;
        tracing::debug!("Model config: {:?}", cfg);
        cfg.check_loadable(&model_id.to_string(), options.trust_remote_code)?;

        let weight_files = Self::weight_files(&source)?;

        let device: Device = select_device(options.device, options.cuda_ordinal)?;
        let dtype = select_dtype(options.dtype, cfg.torch_dtype.as_deref(), &device);
        tracing::info!(
            "Loading {} ({} weight file(s)) on {:?} as {:?}",
            model_id,
            weight_files.len(),
            device,
            dtype
        );

        Ok(LlamaModel::load(&weight_files, &cfg, &device, dtype)?)
    }

    fn load_generation_defaults(&self, model_id: &ModelId) -> Result<Option<GenerationDefaults>> {
        let source = self.source(model_id)?;
        match source.get_optional(GENERATION_CONFIG_FILE)? {
            Some(path) => Ok(Some(serde_json::from_reader(File::open(&path)?)?)),
            None => Ok(None),
        }
    }
}
