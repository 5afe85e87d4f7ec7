//! # Wav2Vec2 Model Loading
//!
//! Downloads an audio-classification checkpoint from HuggingFace Hub and builds a
//! [`Wav2Vec2EmotionClassifier`] on the configured compute device.
//!
//! ## Files Fetched:
//! - `config.json`: architecture and `id2label` (required)
//! - `preprocessor_config.json`: sampling rate and normalization flag (optional)
//! - `model.safetensors`, falling back to `pytorch_model.bin`
//!
//! ## Environment:
//! `HF_TOKEN`, `HF_HUB_CACHE` and `HF_HOME` are honored the same way the
//! `huggingface_hub` Python client honors them.
//!
//! Loading is blocking (sync hf-hub API + file IO). It happens on the first
//! `classify` call through [`LazyClassifier`](crate::classifier::LazyClassifier),
//! which callers already run on a blocking thread.

use crate::classifier::lazy::ClassifierLoader;
use crate::classifier::wav2vec2::{Wav2Vec2Config, Wav2Vec2EmotionClassifier, Wav2Vec2ForAudioClassification};
use crate::config::ModelsConfig;
use crate::device;
use anyhow::{anyhow, Context, Result};
use candle_core::DType;
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// The subset of `preprocessor_config.json` that affects inference.
#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: u32,

    #[serde(default = "default_do_normalize")]
    pub do_normalize: bool,
}

fn default_sampling_rate() -> u32 { 16000 }
fn default_do_normalize() -> bool { true }

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: default_sampling_rate(),
            do_normalize: default_do_normalize(),
        }
    }
}

/// Loads a Wav2Vec2 emotion model from HuggingFace Hub.
#[derive(Debug, Clone)]
pub struct Wav2Vec2Loader {
    model_id: String,
    revision: String,
    device: String,
    top_k: Option<usize>,
}

impl Wav2Vec2Loader {
    pub fn new(model_id: impl Into<String>, revision: impl Into<String>, device: impl Into<String>, top_k: Option<usize>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: revision.into(),
            device: device.into(),
            top_k,
        }
    }

    pub fn from_config(models: &ModelsConfig) -> Self {
        Self::new(
            models.emotion_model.clone(),
            models.revision.clone(),
            models.device.clone(),
            models.top_k,
        )
    }

    /// Build the hf-hub client from the standard HuggingFace environment variables.
    fn build_api() -> Result<Api> {
        let mut builder = ApiBuilder::new().with_progress(false);

        match std::env::var("HF_TOKEN") {
            Ok(token) => {
                debug!(token_len = token.len(), "Using HF token");
                builder = builder.with_token(Some(token));
            }
            Err(_) => builder = builder.with_token(None),
        }

        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(PathBuf::from(cache_dir));
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        builder.build().context("failed to create HuggingFace API client")
    }

    fn fetch(&self, repo: &ApiRepo, file: &str) -> Result<PathBuf> {
        let path = repo
            .get(file)
            .map_err(|e| anyhow!("failed to download {} from {}: {}", file, self.model_id, e))?;
        debug!(file, path = ?path, "Fetched model file");
        Ok(path)
    }

    fn read_preprocessor_config(&self, repo: &ApiRepo) -> PreprocessorConfig {
        let parsed = repo
            .get("preprocessor_config.json")
            .map_err(anyhow::Error::from)
            .and_then(|path| read_json::<PreprocessorConfig>(&path));

        match parsed {
            Ok(config) => config,
            Err(e) => {
                warn!(model = %self.model_id, error = %e, "No usable preprocessor_config.json, assuming 16kHz with normalization");
                PreprocessorConfig::default()
            }
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse {}", path.display()))
}

impl ClassifierLoader for Wav2Vec2Loader {
    type Model = Wav2Vec2EmotionClassifier;

    fn load(&self) -> Result<Wav2Vec2EmotionClassifier> {
        let start_time = Instant::now();
        let device = device::create_device_from_string(&self.device);
        info!(
            model = %self.model_id,
            revision = %self.revision,
            device = %device::device_label(&device),
            "Fetching emotion model"
        );

        let api = Self::build_api()?;
        let repo = api.repo(Repo::with_revision(
            self.model_id.clone(),
            RepoType::Model,
            self.revision.clone(),
        ));

        let config_path = self.fetch(&repo, "config.json")?;
        let config: Wav2Vec2Config = read_json(&config_path)?;
        let preprocessor = self.read_preprocessor_config(&repo);

        let vb = match self.fetch(&repo, "model.safetensors") {
            Ok(weights) => unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? },
            Err(e) => {
                debug!(error = %e, "No safetensors weights, trying pytorch_model.bin");
                let weights = self.fetch(&repo, "pytorch_model.bin")?;
                VarBuilder::from_pth(&weights, DType::F32, &device)?
            }
        };

        let model = Wav2Vec2ForAudioClassification::load(&config, vb)
            .with_context(|| format!("failed to build Wav2Vec2 model from {}", self.model_id))?;
        let classifier = Wav2Vec2EmotionClassifier::new(
            model,
            device,
            preprocessor.sampling_rate,
            preprocessor.do_normalize,
            self.top_k,
        )?;

        info!(
            model = %self.model_id,
            labels = ?classifier.labels(),
            sampling_rate = preprocessor.sampling_rate,
            load_secs = %format!("{:.2}", start_time.elapsed().as_secs_f64()),
            "Emotion model ready"
        );
        Ok(classifier)
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.model_id, self.revision)
    }
}
