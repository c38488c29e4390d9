//! Axis-aligned interval bounds over synonym vertex sets.
//!
//! For every token position the box `[min_k v_k, max_k v_k]` over the valid
//! candidate embeddings `v_k` encloses the convex hull of those candidates.
//! Slots that are masked out (padding positions or invalid candidates) take
//! the true embedding before the reduction, so they never widen the box and
//! padding positions collapse to zero width. The true embedding is always
//! inside the box.

use hullcert_core::{ensure_shape, HullcertError, Result};
use hullcert_tensor::IntervalBoundedTensor;
use ndarray::{s, Array1, Array2, Array3, ArrayView3, ArrayView4, Zip};
use tracing::debug;

/// Interval input derived from a synonym hull.
#[derive(Debug, Clone)]
pub struct BoundDerivation {
    /// `(batch, seq_len, dim)` interval around the true embeddings.
    pub input: IntervalBoundedTensor,
    /// Per example, the largest distance from a true embedding to one of its
    /// valid synonyms.
    pub max_displacement: Array1<f32>,
    /// Embeddings of a sampled perturbed sentence, when requested.
    pub perturbed: Option<Array3<f32>>,
}

impl BoundDerivation {
    /// Zero-width interval at `true_embeddings`, used when no synonyms exist.
    pub fn concrete(true_embeddings: Array3<f32>) -> Self {
        let batch = true_embeddings.dim().0;
        Self {
            input: IntervalBoundedTensor::concrete(true_embeddings.into_dyn()),
            max_displacement: Array1::zeros(batch),
            perturbed: None,
        }
    }
}

/// Derive the bounding box of each position's vertex set.
///
/// * `vertices`: `(batch, seq_len, num_candidates, dim)`
/// * `valid`: `(batch, seq_len, num_candidates)`
/// * `token_mask`: `(batch, seq_len)`, `None` treats every position as real
/// * `true_embeddings`: `(batch, seq_len, dim)`
/// * `eps`: scales the box around the true embedding; `1.0` leaves it as is
pub fn derive_bounds(
    vertices: ArrayView4<'_, f32>,
    valid: ArrayView3<'_, bool>,
    token_mask: Option<&Array2<bool>>,
    true_embeddings: ArrayView3<'_, f32>,
    eps: f32,
) -> Result<BoundDerivation> {
    let (n, l, c, d) = vertices.dim();
    ensure_shape(&[n, l, c], valid.shape())?;
    ensure_shape(&[n, l, d], true_embeddings.shape())?;
    if let Some(mask) = token_mask {
        ensure_shape(&[n, l], mask.shape())?;
    }
    if !eps.is_finite() || eps < 0.0 {
        return Err(HullcertError::InvalidConfig(format!(
            "eps must be finite and >= 0 (got {eps})"
        )));
    }

    let mut lower = true_embeddings.to_owned();
    let mut upper = true_embeddings.to_owned();
    let mut max_displacement = Array1::<f32>::zeros(n);

    for i in 0..n {
        for j in 0..l {
            let real = token_mask.map_or(true, |m| m[[i, j]]);
            let slot_valid = valid.slice(s![i, j, ..]);
            if real && !slot_valid.iter().any(|&v| v) {
                return Err(HullcertError::DegenerateHull {
                    example: i,
                    position: j,
                });
            }

            let truth = true_embeddings.slice(s![i, j, ..]);
            let mut lo = lower.slice_mut(s![i, j, ..]);
            let mut hi = upper.slice_mut(s![i, j, ..]);
            for k in 0..c {
                if !slot_valid[k] {
                    continue;
                }
                let vertex = vertices.slice(s![i, j, k, ..]);

                // Displacement counts every valid synonym, padding or not.
                let dist = Zip::from(&truth)
                    .and(&vertex)
                    .fold(0.0f32, |acc, &t, &v| acc + (t - v) * (t - v))
                    .sqrt();
                max_displacement[i] = max_displacement[i].max(dist);

                if real {
                    Zip::from(&mut lo)
                        .and(&mut hi)
                        .and(&vertex)
                        .for_each(|lo_k, hi_k, &v| {
                            *lo_k = lo_k.min(v);
                            *hi_k = hi_k.max(v);
                        });
                }
            }
        }
    }

    if eps != 1.0 {
        Zip::from(&mut lower)
            .and(&mut upper)
            .and(&true_embeddings)
            .for_each(|lo, hi, &t| {
                *lo = t - (t - *lo) * eps;
                *hi = t + (*hi - t) * eps;
            });
    }

    let input = IntervalBoundedTensor::new(
        true_embeddings.to_owned().into_dyn(),
        lower.into_dyn(),
        upper.into_dyn(),
    )?;
    debug!(
        "Derived hull bounds: shape {:?}, eps {}, max width {:.4}",
        input.shape(),
        eps,
        input.max_width()
    );
    Ok(BoundDerivation {
        input,
        max_displacement,
        perturbed: None,
    })
}
