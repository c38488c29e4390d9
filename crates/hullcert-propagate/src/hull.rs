//! Synonym vertex sets for the convex-hull perturbation region.
//!
//! Each token position owns an ordered list of candidate ids (the original
//! token first) and a validity mask. The hull builder embeds every candidate
//! and zeroes the invalid slots; the hull geometry itself is left to an
//! external [`ConvexHullSampler`].

use crate::embedding::{EmbeddingBackbone, EmbeddingLookup};
use hullcert_core::{ensure_shape, HullcertError, Result};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Ix4};
use tracing::debug;

/// Candidate ids `(batch, seq_len, num_candidates)` and their validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct SynonymCandidates {
    pub ids: Array3<u32>,
    pub valid: Array3<bool>,
}

impl SynonymCandidates {
    pub fn new(ids: Array3<u32>, valid: Array3<bool>) -> Result<Self> {
        ensure_shape(ids.shape(), valid.shape())?;
        if ids.dim().2 == 0 {
            return Err(HullcertError::InvalidRequest(
                "synonym candidate axis is empty".into(),
            ));
        }
        Ok(Self { ids, valid })
    }

    /// `(batch, seq_len, num_candidates)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.ids.dim()
    }

    /// Number of valid candidates per position.
    pub fn valid_counts(&self) -> Array2<usize> {
        self.valid
            .map_axis(Axis(2), |lane| lane.iter().filter(|&&v| v).count())
    }

    /// Every non-padding position must keep at least one valid candidate.
    pub fn check_non_degenerate(&self, token_mask: Option<&Array2<bool>>) -> Result<()> {
        for ((example, position), &count) in self.valid_counts().indexed_iter() {
            let real = token_mask.map_or(true, |m| m[[example, position]]);
            if real && count == 0 {
                return Err(HullcertError::DegenerateHull { example, position });
            }
        }
        Ok(())
    }
}

/// Embedded candidates `(batch, seq_len, num_candidates, dim)` with invalid
/// slots zeroed.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexSet {
    pub embeddings: Array4<f32>,
    pub valid: Array3<bool>,
}

impl VertexSet {
    pub fn embedding_dim(&self) -> usize {
        self.embeddings.dim().3
    }

    /// Flatten batch and sequence axes into one node axis:
    /// `(batch * seq_len, num_candidates, dim)` and `(batch * seq_len, num_candidates)`.
    pub fn nodes(&self) -> Result<(ArrayView3<'_, f32>, ArrayView2<'_, bool>)> {
        let (n, l, s, d) = self.embeddings.dim();
        let nodes = self
            .embeddings
            .view()
            .into_shape_with_order((n * l, s, d))
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;
        let valid = self
            .valid
            .view()
            .into_shape_with_order((n * l, s))
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;
        Ok((nodes, valid))
    }
}

/// External convex-hull geometry: draws interior points of each node's hull.
pub trait ConvexHullSampler {
    /// `nodes` is `(num_nodes, num_candidates, dim)`; returns
    /// `(num_nodes, num_samples, dim)` with `num_samples <= max_sample_num`.
    fn sample(
        &self,
        nodes: ArrayView3<'_, f32>,
        valid: ArrayView2<'_, bool>,
        max_sample_num: usize,
    ) -> Result<Array3<f32>>;
}

/// Embed every candidate in one batched lookup and zero the invalid slots.
pub fn build_convex_hull<B: EmbeddingBackbone>(
    lookup: &EmbeddingLookup<B>,
    candidates: &SynonymCandidates,
) -> Result<VertexSet> {
    let embedded = lookup.lookup(&candidates.ids.clone().into_dyn())?;
    let mut embeddings = embedded
        .into_dimensionality::<Ix4>()
        .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;

    let mask = candidates
        .valid
        .mapv(|v| if v { 1.0f32 } else { 0.0 })
        .insert_axis(Axis(3));
    embeddings *= &mask;

    debug!("Built vertex set with shape {:?}", embeddings.shape());
    Ok(VertexSet {
        embeddings,
        valid: candidates.valid.clone(),
    })
}
