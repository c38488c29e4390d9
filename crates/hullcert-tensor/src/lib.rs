//! Interval-bounded tensors.
//!
//! An [`IntervalBoundedTensor`] carries a point value together with an
//! elementwise box `[lower, upper]` that encloses it. Every operation here
//! keeps `lower <= value <= upper`.

use hullcert_core::{ensure_shape, HullcertError, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, Dimension, IxDyn, Zip};

/// A `(value, lower, upper)` triple of identically-shaped arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalBoundedTensor {
    pub value: ArrayD<f32>,
    pub lower: ArrayD<f32>,
    pub upper: ArrayD<f32>,
}

impl IntervalBoundedTensor {
    /// Create a bounded tensor, checking shapes and `lower <= value <= upper`.
    pub fn new(value: ArrayD<f32>, lower: ArrayD<f32>, upper: ArrayD<f32>) -> Result<Self> {
        ensure_shape(value.shape(), lower.shape())?;
        ensure_shape(value.shape(), upper.shape())?;
        let violation = value
            .indexed_iter()
            .zip(lower.iter().zip(upper.iter()))
            .find(|&((_, &v), (&l, &u))| !(l <= v && v <= u))
            .map(|((idx, &v), (&l, &u))| (idx.slice().to_vec(), l, v, u));
        if let Some((idx, l, v, u)) = violation {
            return Err(HullcertError::InvalidBounds(format!(
                "at {idx:?}: lower {l}, value {v}, upper {u}"
            )));
        }
        Ok(Self { value, lower, upper })
    }

    /// Create a bounded tensor without validation.
    ///
    /// The caller guarantees the ordering invariant.
    pub fn new_unchecked(value: ArrayD<f32>, lower: ArrayD<f32>, upper: ArrayD<f32>) -> Self {
        debug_assert_eq!(value.shape(), lower.shape());
        debug_assert_eq!(value.shape(), upper.shape());
        Self { value, lower, upper }
    }

    /// Zero-width tensor `(v, v, v)`.
    pub fn concrete(value: ArrayD<f32>) -> Self {
        Self {
            lower: value.clone(),
            upper: value.clone(),
            value,
        }
    }

    /// Build from arithmetic results, widening the box to contain `value`.
    ///
    /// Absorbs rounding differences between the value path and the bound
    /// paths; the result only grows, so soundness is kept.
    fn enclosing(value: ArrayD<f32>, mut lower: ArrayD<f32>, mut upper: ArrayD<f32>) -> Self {
        Zip::from(&mut lower)
            .and(&mut upper)
            .and(&value)
            .for_each(|l, u, &v| {
                *l = l.min(v);
                *u = u.max(v);
            });
        Self { value, lower, upper }
    }

    /// Shape shared by all three components.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.value.ndim()
    }

    /// Number of elements per component.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// True when the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Elementwise width `upper - lower`.
    pub fn width(&self) -> ArrayD<f32> {
        &self.upper - &self.lower
    }

    /// Largest elementwise width, 0 for an empty tensor.
    pub fn max_width(&self) -> f32 {
        Zip::from(&self.upper)
            .and(&self.lower)
            .fold(0.0f32, |acc, &u, &l| acc.max(u - l))
    }

    /// True when every interval has zero width.
    pub fn is_concrete(&self) -> bool {
        self.lower == self.upper
    }

    /// No infinities or NaNs in any component.
    pub fn is_finite(&self) -> bool {
        self.value.iter().all(|v| v.is_finite())
            && self.lower.iter().all(|v| v.is_finite())
            && self.upper.iter().all(|v| v.is_finite())
    }

    /// Whether `point` lies inside the box (with absolute tolerance `tol`).
    pub fn contains(&self, point: &ArrayD<f32>, tol: f32) -> bool {
        point.shape() == self.shape()
            && Zip::from(point)
                .and(&self.lower)
                .and(&self.upper)
                .all(|&p, &l, &u| l - tol <= p && p <= u + tol)
    }

    /// Apply a shape-only linear rearrangement (reshape, gather, window
    /// unfolding) to all three components.
    ///
    /// `f` must copy elements without combining them; the ordering invariant
    /// then carries over unchanged.
    pub fn map_structural<F>(&self, f: F) -> Result<Self>
    where
        F: Fn(&ArrayD<f32>) -> Result<ArrayD<f32>>,
    {
        Ok(Self::new_unchecked(
            f(&self.value)?,
            f(&self.lower)?,
            f(&self.upper)?,
        ))
    }

    /// Affine map `x @ weight^T + bias` over the last axis.
    ///
    /// `weight` has shape `(out_dim, in_dim)`. Bounds use the sign split of
    /// the weight: positive entries take `lower` to `lower`, negative entries
    /// take `upper` to `lower`.
    pub fn affine(&self, weight: &Array2<f32>, bias: Option<&Array1<f32>>) -> Result<Self> {
        if let Some(b) = bias {
            ensure_shape(&[weight.nrows()], b.shape())?;
        }
        let w_pos = weight.mapv(|w| w.max(0.0));
        let w_neg = weight.mapv(|w| w.min(0.0));

        let mut value = matmul_last_axis(&self.value, weight)?;
        let mut lower = matmul_last_axis(&self.lower, &w_pos)? + matmul_last_axis(&self.upper, &w_neg)?;
        let mut upper = matmul_last_axis(&self.upper, &w_pos)? + matmul_last_axis(&self.lower, &w_neg)?;
        if let Some(b) = bias {
            value += b;
            lower += b;
            upper += b;
        }
        Ok(Self::enclosing(value, lower, upper))
    }

    /// Apply a nondecreasing elementwise function to value and bounds.
    pub fn map_monotone<F>(&self, f: F) -> Self
    where
        F: Fn(f32) -> f32,
    {
        Self::enclosing(
            self.value.mapv(&f),
            self.lower.mapv(&f),
            self.upper.mapv(&f),
        )
    }

    /// Elementwise `max(x, 0)`.
    pub fn relu(&self) -> Self {
        self.map_monotone(|x| x.max(0.0))
    }

    /// Interval sum `[a, b] + [c, d] = [a + c, b + d]`.
    pub fn add(&self, other: &Self) -> Result<Self> {
        ensure_shape(self.shape(), other.shape())?;
        Ok(Self::enclosing(
            &self.value + &other.value,
            &self.lower + &other.lower,
            &self.upper + &other.upper,
        ))
    }

    /// Multiply by a scalar; a negative factor swaps the bounds.
    pub fn scale(&self, c: f32) -> Self {
        let value = self.value.mapv(|x| x * c);
        if c >= 0.0 {
            Self::enclosing(value, self.lower.mapv(|x| x * c), self.upper.mapv(|x| x * c))
        } else {
            Self::enclosing(value, self.upper.mapv(|x| x * c), self.lower.mapv(|x| x * c))
        }
    }

    /// Maximum along `axis`. Max is monotone in every argument, so each
    /// component reduces independently.
    pub fn max_axis(&self, axis: usize) -> Result<Self> {
        if axis >= self.ndim() {
            return Err(HullcertError::InvalidBounds(format!(
                "axis {axis} out of range for {}-d tensor",
                self.ndim()
            )));
        }
        if self.shape()[axis] == 0 {
            return Err(HullcertError::InvalidBounds(format!(
                "max over empty axis {axis}"
            )));
        }
        let reduce = |a: &ArrayD<f32>| {
            a.map_axis(Axis(axis), |lane| {
                lane.iter().copied().fold(f32::NEG_INFINITY, f32::max)
            })
        };
        Ok(Self::new_unchecked(
            reduce(&self.value),
            reduce(&self.lower),
            reduce(&self.upper),
        ))
    }
}

/// `x @ w^T` over the last axis of `x`, for `w` of shape `(out_dim, in_dim)`.
pub fn matmul_last_axis(x: &ArrayD<f32>, w: &Array2<f32>) -> Result<ArrayD<f32>> {
    let shape = x.shape();
    let in_dim = *shape.last().ok_or_else(|| {
        HullcertError::InvalidBounds("cannot apply a linear map to a 0-d tensor".into())
    })?;
    if in_dim != w.ncols() {
        let mut expected = shape.to_vec();
        let last = expected.len() - 1;
        expected[last] = w.ncols();
        return Err(HullcertError::shape_mismatch(&expected, shape));
    }
    let rows = if in_dim == 0 { 0 } else { x.len() / in_dim };
    let flat = x
        .to_shape((rows, in_dim))
        .map_err(|e| HullcertError::InvalidBounds(e.to_string()))?;
    let out = flat.dot(&w.t());

    let mut out_shape = shape.to_vec();
    if let Some(last) = out_shape.last_mut() {
        *last = w.nrows();
    }
    out.into_shape_with_order(IxDyn(&out_shape))
        .map_err(|e| HullcertError::InvalidBounds(e.to_string()))
}
