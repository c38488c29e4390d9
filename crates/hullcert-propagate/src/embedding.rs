//! Token embedding lookup and vocabulary remapping.

use hullcert_core::{HullcertError, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::HashMap;
use tracing::{debug, info};

/// An opaque function from token ids to embedding vectors.
///
/// Implemented by [`EmbeddingTable`]; a pretrained backbone can implement it
/// to plug into hull construction without exposing its internals.
pub trait EmbeddingBackbone {
    fn embedding_dim(&self) -> usize;

    /// Embed ids of any shape; the output appends an `embedding_dim` axis.
    fn embed(&self, ids: &ArrayD<u32>) -> Result<ArrayD<f32>>;

    /// Cut gradient flow from `embeddings` back into the backbone.
    ///
    /// Plain arrays carry no gradient tape, so the default passes values
    /// through unchanged.
    fn detach_grad(&self, embeddings: ArrayD<f32>) -> ArrayD<f32> {
        embeddings
    }
}

/// Dense `(vocab_size, embedding_dim)` embedding table.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    weights: Array2<f32>,
}

impl EmbeddingTable {
    /// Table initialised from a standard normal.
    pub fn random<R: Rng + ?Sized>(vocab_size: usize, embedding_dim: usize, rng: &mut R) -> Self {
        let weights = Array2::from_shape_simple_fn((vocab_size, embedding_dim), || {
            StandardNormal.sample(&mut *rng)
        });
        Self { weights }
    }

    /// Wrap pretrained vectors, one row per token id.
    pub fn from_pretrained(weights: Array2<f32>) -> Result<Self> {
        if weights.ncols() == 0 {
            return Err(HullcertError::InvalidConfig(
                "pretrained embeddings have zero width".into(),
            ));
        }
        Ok(Self { weights })
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    /// Build a table indexed by `target`, copying each target token's row
    /// from this table as indexed by `source`.
    ///
    /// Every target token must exist in `source`; a miss is a
    /// [`HullcertError::VocabularyMismatch`].
    pub fn remap(&self, source: &Vocabulary, target: &Vocabulary) -> Result<EmbeddingTable> {
        let mut weights = Array2::zeros((target.len(), self.weights.ncols()));
        for (new_id, token) in target.tokens().enumerate() {
            let old_id = source
                .id(token)
                .ok_or_else(|| HullcertError::VocabularyMismatch {
                    token: token.to_string(),
                    target_id: new_id,
                })?;
            if old_id as usize >= self.vocab_size() {
                return Err(HullcertError::TokenOutOfVocab {
                    token_id: old_id,
                    vocab_size: self.vocab_size(),
                });
            }
            weights
                .row_mut(new_id)
                .assign(&self.weights.row(old_id as usize));
        }
        debug!(
            "Remapped embedding table: {} -> {} rows",
            self.vocab_size(),
            target.len()
        );
        Ok(EmbeddingTable { weights })
    }
}

impl EmbeddingBackbone for EmbeddingTable {
    fn embedding_dim(&self) -> usize {
        self.weights.ncols()
    }

    fn embed(&self, ids: &ArrayD<u32>) -> Result<ArrayD<f32>> {
        let dim = self.embedding_dim();
        let mut out = Array2::zeros((ids.len(), dim));
        for (mut row, &id) in out.outer_iter_mut().zip(ids.iter()) {
            if id as usize >= self.vocab_size() {
                return Err(HullcertError::TokenOutOfVocab {
                    token_id: id,
                    vocab_size: self.vocab_size(),
                });
            }
            row.assign(&self.weights.row(id as usize));
        }
        let mut shape = ids.shape().to_vec();
        shape.push(dim);
        out.into_shape_with_order(IxDyn(&shape))
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))
    }
}

/// Bidirectional token/id mapping for one tokenizer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    id_to_token: Vec<String>,
    token_to_id: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build from tokens in id order.
    pub fn from_tokens<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::default();
        for token in tokens {
            let token = token.into();
            let id = vocab.id_to_token.len() as u32;
            if vocab.token_to_id.insert(token.clone(), id).is_some() {
                return Err(HullcertError::InvalidConfig(format!(
                    "duplicate vocabulary token {token:?}"
                )));
            }
            vocab.id_to_token.push(token);
        }
        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.id_to_token.get(id as usize).map(String::as_str)
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Tokens in id order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.id_to_token.iter().map(String::as_str)
    }
}

/// Embedding lookup that is either trainable or frozen.
#[derive(Debug, Clone)]
pub struct EmbeddingLookup<B: EmbeddingBackbone = EmbeddingTable> {
    backbone: B,
    trainable: bool,
}

impl<B: EmbeddingBackbone> EmbeddingLookup<B> {
    pub fn new(backbone: B, trainable: bool) -> Self {
        info!(
            "Embedding lookup: dim={}, trainable={}",
            backbone.embedding_dim(),
            trainable
        );
        Self {
            backbone,
            trainable,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.backbone.embedding_dim()
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    /// Embed `ids`; frozen lookups detach the result from the backbone.
    pub fn lookup(&self, ids: &ArrayD<u32>) -> Result<ArrayD<f32>> {
        let embeddings = self.backbone.embed(ids)?;
        if self.trainable {
            Ok(embeddings)
        } else {
            Ok(self.backbone.detach_grad(embeddings))
        }
    }
}

impl EmbeddingLookup<EmbeddingTable> {
    /// Replace the table with one indexed by `target` (see [`EmbeddingTable::remap`]).
    pub fn remap(&mut self, source: &Vocabulary, target: &Vocabulary) -> Result<()> {
        self.backbone = self.backbone.remap(source, target)?;
        Ok(())
    }
}
