pub mod embedder;
pub mod loader;
pub mod manager;
pub mod reranker;

pub use embedder::{EmbedderBackend, HashEmbedder};
pub use loader::{DefaultSlotLoader, ModelHandle, SlotLoader};
pub use manager::{
    ManagerStatus, MemoryProbe, ModelLease, ModelManager, ProcessMemoryProbe, SlotStatus,
    estimate_model_memory,
};
pub use reranker::{OverlapReranker, RerankerBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedder_deterministic() {
        let emb = HashEmbedder::new(128, "hash-test");
        let a = emb.embed(&["hello world".to_string()]).unwrap();
        let b = emb.embed(&["hello world".to_string()]).unwrap();
        assert_eq!(a, b, "same input must produce identical vectors");
    }

    #[test]
    fn hash_embedder_correct_dimension() {
        let emb = HashEmbedder::new(384, "hash-test");
        let vectors = emb.embed(&["some text".to_string()]).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 384);
    }

    #[test]
    fn overlap_reranker_prefers_matching_document() {
        let reranker = OverlapReranker::new("overlap-test");
        let pairs = vec![
            ("quick fox".to_string(), "the quick brown fox".to_string()),
            ("quick fox".to_string(), "slow green turtle".to_string()),
        ];
        let scores = reranker.predict(&pairs).unwrap();
        assert!(scores[0] > scores[1]);
    }
}
