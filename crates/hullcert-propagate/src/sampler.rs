//! Random synonym substitution for consistency training.
//!
//! Independent of the interval path: produces one concrete perturbed
//! sentence by swapping each token for a uniformly chosen valid synonym.

use crate::hull::SynonymCandidates;
use hullcert_core::{ensure_shape, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Draws perturbed token sequences from the synonym candidates.
#[derive(Debug, Clone)]
pub struct PerturbationSampler<R: Rng = StdRng> {
    rng: R,
}

impl PerturbationSampler<StdRng> {
    /// Sampler with a reproducible generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> PerturbationSampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Replace each token that has more than one valid candidate with one
    /// drawn uniformly from its valid candidates (the original included).
    ///
    /// Positions with a single valid candidate are copied unchanged.
    pub fn sample_perturbed(
        &mut self,
        tokens: &Array2<u32>,
        candidates: &SynonymCandidates,
    ) -> Result<Array2<u32>> {
        let (n, l, _) = candidates.dim();
        ensure_shape(&[n, l], tokens.shape())?;

        let mut perturbed = tokens.clone();
        let mut swapped = 0usize;
        for ((i, j), token) in perturbed.indexed_iter_mut() {
            let valid: Vec<usize> = candidates
                .valid
                .slice(ndarray::s![i, j, ..])
                .indexed_iter()
                .filter_map(|(k, &v)| v.then_some(k))
                .collect();
            if valid.len() > 1 {
                let pick = valid[self.rng.random_range(0..valid.len())];
                *token = candidates.ids[[i, j, pick]];
                swapped += usize::from(*token != tokens[[i, j]]);
            }
        }
        trace!("Perturbed {} of {} tokens", swapped, tokens.len());
        Ok(perturbed)
    }
}
