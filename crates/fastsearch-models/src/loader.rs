use crate::embedder::EmbedderBackend;
use crate::reranker::RerankerBackend;
use anyhow::{Result, bail};
use fastsearch_core::ModelConfig;
use std::sync::Arc;

/// A live model occupying a slot.
///
/// Cloning is cheap (shared handle); an in-flight inference keeps the
/// backend alive even after the slot is evicted.
#[derive(Clone)]
pub enum ModelHandle {
    Embedder(Arc<dyn EmbedderBackend>),
    Reranker(Arc<dyn RerankerBackend>),
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedder(_) => f.write_str("ModelHandle::Embedder(..)"),
            Self::Reranker(_) => f.write_str("ModelHandle::Reranker(..)"),
        }
    }
}

impl ModelHandle {
    pub fn embedder(&self) -> Result<Arc<dyn EmbedderBackend>> {
        match self {
            Self::Embedder(backend) => Ok(backend.clone()),
            Self::Reranker(_) => bail!("slot does not hold an embedding model"),
        }
    }

    pub fn reranker(&self) -> Result<Arc<dyn RerankerBackend>> {
        match self {
            Self::Reranker(backend) => Ok(backend.clone()),
            Self::Embedder(_) => bail!("slot does not hold a rerank model"),
        }
    }
}

/// Maps a slot name and its configuration to a loaded backend.
///
/// The seam that lets tests and the daemon share one manager while choosing
/// where model weights come from.
pub trait SlotLoader: Send + Sync {
    fn load(&self, slot: &str, config: &ModelConfig) -> Result<ModelHandle>;
}

/// Default loader: Candle models fetched from the Hugging Face hub when the
/// `local-ml` feature is on, hash/overlap backends otherwise.
pub struct DefaultSlotLoader {
    dimension: usize,
}

impl DefaultSlotLoader {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for DefaultSlotLoader {
    fn default() -> Self {
        Self::new(fastsearch_core::DEFAULT_EMBEDDING_DIM)
    }
}

impl SlotLoader for DefaultSlotLoader {
    #[cfg(not(feature = "local-ml"))]
    fn load(&self, slot: &str, config: &ModelConfig) -> Result<ModelHandle> {
        use crate::embedder::HashEmbedder;
        use crate::reranker::OverlapReranker;
        match slot {
            "embedder" => Ok(ModelHandle::Embedder(Arc::new(HashEmbedder::new(
                self.dimension,
                &config.name,
            )))),
            "reranker" => Ok(ModelHandle::Reranker(Arc::new(OverlapReranker::new(
                &config.name,
            )))),
            other => bail!("unknown model slot: {other}"),
        }
    }

    #[cfg(feature = "local-ml")]
    fn load(&self, slot: &str, config: &ModelConfig) -> Result<ModelHandle> {
        let _ = self.dimension;
        match slot {
            "embedder" => {
                let files = local_ml::fetch_model_files(&config.name)?;
                let backend = crate::embedder::candle_backend::CandleEmbedder::load(
                    &files.weights,
                    &files.config,
                    &files.tokenizer,
                    &config.name,
                )?;
                Ok(ModelHandle::Embedder(Arc::new(backend)))
            }
            "reranker" => {
                let files = local_ml::fetch_model_files(&config.name)?;
                let backend = crate::reranker::candle_backend::CandleReranker::load(
                    &files.weights,
                    &files.config,
                    &files.tokenizer,
                    &config.name,
                )?;
                Ok(ModelHandle::Reranker(Arc::new(backend)))
            }
            other => bail!("unknown model slot: {other}"),
        }
    }
}

#[cfg(feature = "local-ml")]
mod local_ml {
    use anyhow::Result;
    use std::path::PathBuf;

    pub struct ModelFiles {
        pub config: PathBuf,
        pub tokenizer: PathBuf,
        pub weights: PathBuf,
    }

    /// Resolve (downloading on first use) the model files from the hub cache.
    pub fn fetch_model_files(name: &str) -> Result<ModelFiles> {
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(name.to_string());
        Ok(ModelFiles {
            config: repo.get("config.json")?,
            tokenizer: repo.get("tokenizer.json")?,
            weights: repo.get("model.safetensors")?,
        })
    }
}
