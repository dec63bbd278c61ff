use anyhow::Result;

/// Backend trait for cross-encoder style reranking.
///
/// Scores `(query, document)` pairs jointly. Higher = more relevant; no
/// bound on sign or magnitude.
pub trait RerankerBackend: Send + Sync {
    /// Score each pair, returning one score per pair in input order.
    fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>>;

    /// Model identifier string.
    fn model_id(&self) -> &str;
}

/// Token-overlap reranker used when no model weights are available.
///
/// Scores a pair by the cosine of the two token sets, so documents that
/// repeat the query's words rank first. Deterministic.
pub struct OverlapReranker {
    model_id: String,
}

impl OverlapReranker {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }

    fn score_pair(query: &str, document: &str) -> f32 {
        let query_tokens = tokens(query);
        let doc_tokens = tokens(document);
        if query_tokens.is_empty() || doc_tokens.is_empty() {
            return 0.0;
        }
        let overlap = query_tokens.iter().filter(|t| doc_tokens.contains(*t)).count();
        overlap as f32 / ((query_tokens.len() * doc_tokens.len()) as f32).sqrt()
    }
}

fn tokens(text: &str) -> std::collections::BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

impl RerankerBackend for OverlapReranker {
    fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
        Ok(pairs
            .iter()
            .map(|(query, document)| Self::score_pair(query, document))
            .collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(feature = "local-ml")]
pub mod candle_backend {
    //! Candle cross-encoder reranker.
    //!
    //! Unlike bi-encoders, cross-encoders process the pair jointly through
    //! the full transformer, producing much more accurate relevance scores.
    //! Only compiled with the `local-ml` feature.

    use super::RerankerBackend;
    use anyhow::{Result, anyhow};
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::bert::{BertModel, Config as BertConfig};
    use std::path::Path;
    use tokenizers::Tokenizer;

    pub struct CandleReranker {
        model: BertModel,
        tokenizer: Tokenizer,
        device: Device,
        model_id: String,
    }

    impl CandleReranker {
        pub fn load(
            weights_path: &Path,
            config_path: &Path,
            tokenizer_path: &Path,
            model_id: &str,
        ) -> Result<Self> {
            let device = Device::Cpu;
            let config_data = std::fs::read_to_string(config_path)?;
            let config: BertConfig = serde_json::from_str(&config_data)?;

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
                model_id: model_id.to_string(),
            })
        }
    }

    impl RerankerBackend for CandleReranker {
        fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
            let mut scores = Vec::with_capacity(pairs.len());
            for (query, document) in pairs {
                let joined = format!("{query} [SEP] {document}");
                let encoding = self
                    .tokenizer
                    .encode(joined, true)
                    .map_err(|e| anyhow!("tokenization failed: {e}"))?;

                let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
                let attention_mask =
                    Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
                let token_type_ids =
                    Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;

                let hidden = self
                    .model
                    .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

                // [CLS] token output carries the relevance score.
                let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?.squeeze(0)?;
                scores.push(cls.to_vec1::<f32>()?[0]);
            }
            Ok(scores)
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_scores_are_in_input_order() {
        let reranker = OverlapReranker::new("overlap-test");
        let pairs = vec![
            ("alpha".to_string(), "no match here".to_string()),
            ("alpha".to_string(), "alpha beta".to_string()),
        ];
        let scores = reranker.predict(&pairs).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let reranker = OverlapReranker::new("overlap-test");
        let scores = reranker
            .predict(&[(String::new(), "content".to_string())])
            .unwrap();
        assert_eq!(scores, vec![0.0]);
    }

    #[test]
    fn empty_pair_list_is_fine() {
        let reranker = OverlapReranker::new("overlap-test");
        assert!(reranker.predict(&[]).unwrap().is_empty());
    }
}
