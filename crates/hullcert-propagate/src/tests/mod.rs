//! Unit tests for the hull, bound and propagation pipeline.

mod model;

use crate::{ClassifierConfig, EmbeddingLookup, EmbeddingTable};
use ndarray::Array2;

/// Embedding table with one row per slice.
pub(crate) fn table(rows: &[&[f32]]) -> EmbeddingTable {
    let dim = rows[0].len();
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    EmbeddingTable::from_pretrained(Array2::from_shape_vec((rows.len(), dim), flat).unwrap())
        .unwrap()
}

pub(crate) fn frozen(table: EmbeddingTable) -> EmbeddingLookup {
    EmbeddingLookup::new(table, false)
}

/// Small configuration: 4-d embeddings, 10 tokens, width-2 convolution.
pub(crate) fn small_config() -> ClassifierConfig {
    ClassifierConfig {
        embedding_dim: 4,
        num_classes: 3,
        max_len: 4,
        vocab_size: 10,
        num_filters: 5,
        filter_size: 2,
        ..Default::default()
    }
}
