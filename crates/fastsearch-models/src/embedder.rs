use anyhow::Result;
use sha2::{Digest, Sha256};

/// Backend trait for computing text embeddings.
///
/// Implementations convert a batch of texts into dense fixed-dimension
/// vectors. The batch is all-or-nothing: any failure fails the whole call
/// and no partial output is surfaced. The trait is object-safe so backends
/// can be swapped at runtime (hash-based default, Candle for real models).
pub trait EmbedderBackend: Send + Sync {
    /// Embed a batch of texts. One output vector per input, same order.
    /// Must be deterministic given identical input.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimensionality of the output vectors.
    fn dimension(&self) -> usize;

    /// Model identifier string (e.g. "BAAI/bge-base-en-v1.5").
    fn model_id(&self) -> &str;
}

/// Deterministic feature-hashing embedder.
///
/// Tokenizes on non-alphanumeric boundaries and hashes each token into one
/// of `dimension` signed buckets, then L2-normalizes. Texts that share
/// tokens get genuinely similar vectors, so the retrieval pipeline behaves
/// sensibly end-to-end without model weights.
pub struct HashEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize, model_id: &str) -> Self {
        Self {
            dimension,
            model_id: model_id.to_string(),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in lowered.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(prefix) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl EmbedderBackend for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(feature = "local-ml")]
pub mod candle_backend {
    //! Candle-based embedder using BERT-family models.
    //!
    //! Only compiled with the `local-ml` feature. Runs a forward pass,
    //! mean-pools the token embeddings, and L2-normalizes the result for
    //! consistent cosine behavior.

    use super::EmbedderBackend;
    use anyhow::{Result, anyhow};
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::bert::{BertModel, Config as BertConfig};
    use std::path::Path;
    use tokenizers::Tokenizer;

    pub struct CandleEmbedder {
        model: BertModel,
        tokenizer: Tokenizer,
        device: Device,
        dim: usize,
        model_id: String,
    }

    impl CandleEmbedder {
        pub fn load(
            weights_path: &Path,
            config_path: &Path,
            tokenizer_path: &Path,
            model_id: &str,
        ) -> Result<Self> {
            let device = Device::Cpu;
            let config_data = std::fs::read_to_string(config_path)?;
            let config: BertConfig = serde_json::from_str(&config_data)?;
            let dim = config.hidden_size;

            let vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)?
            };
            let model = BertModel::load(vb, &config)?;
            let tokenizer = Tokenizer::from_file(tokenizer_path)
                .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;

            Ok(Self {
                model,
                tokenizer,
                device,
                dim,
                model_id: model_id.to_string(),
            })
        }

        fn mean_pool(&self, hidden: &Tensor, attention_mask: &Tensor) -> Result<Vec<f32>> {
            // hidden: (1, seq_len, hidden_size); attention_mask: (1, seq_len)
            let mask = attention_mask
                .unsqueeze(2)?
                .to_dtype(DType::F32)?
                .broadcast_as(hidden.shape())?;
            let masked = (hidden * &mask)?;
            let summed = masked.sum(1)?;
            let counts = mask.sum(1)?;
            let pooled = (summed / counts)?.squeeze(0)?;

            let mut vec: Vec<f32> = pooled.to_vec1()?;
            let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vec {
                    *v /= norm;
                }
            }
            Ok(vec)
        }

        fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| anyhow!("tokenization failed: {e}"))?;

            let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
            let attention_mask =
                Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
            let token_type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;

            let hidden = self
                .model
                .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
            self.mean_pool(&hidden, &attention_mask)
        }
    }

    impl EmbedderBackend for CandleEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            texts.iter().map(|t| self.embed_one(t)).collect()
        }

        fn dimension(&self) -> usize {
            self.dim
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }
    }
}
