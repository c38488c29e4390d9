//! Encoder layers with concrete and interval forward passes.

use hullcert_core::{ensure_shape, HullcertError, Result};
use hullcert_tensor::{matmul_last_axis, IntervalBoundedTensor};
use ndarray::{s, Array1, Array2, Array3, ArrayD, Axis, Ix3};
use rand::Rng;

/// A layer that can run on concrete values and on interval bounds.
pub trait BoundPropagation {
    fn name(&self) -> &'static str;

    /// Concrete forward pass.
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    /// Interval forward pass.
    ///
    /// Layers without a sound interval rule keep this default.
    fn propagate_ibp(&self, _input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        Err(HullcertError::UnsupportedBoundPropagation(
            self.name().to_string(),
        ))
    }
}

/// Uniform init in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
fn uniform_init<R: Rng + ?Sized>(shape: (usize, usize), fan_in: usize, rng: &mut R) -> Array2<f32> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array2::from_shape_simple_fn(shape, || rng.random_range(-bound..=bound))
}

/// Fully connected layer `y = x W^T + b` over the last axis.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    /// `(out_dim, in_dim)`
    pub weight: Array2<f32>,
    /// `(out_dim,)`
    pub bias: Array1<f32>,
}

impl LinearLayer {
    /// Wrap an `(out_dim, in_dim)` weight and an `(out_dim,)` bias.
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        ensure_shape(&[weight.nrows()], bias.shape())?;
        Ok(Self { weight, bias })
    }

    /// Uniformly initialised layer, bounded by `1/sqrt(in_dim)`.
    pub fn random<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let weight = uniform_init((out_dim, in_dim), in_dim, rng);
        let bias = uniform_init((1, out_dim), in_dim, rng).row(0).to_owned();
        Self { weight, bias }
    }

    /// Input width.
    pub fn in_dim(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width.
    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }
}

impl BoundPropagation for LinearLayer {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(matmul_last_axis(input, &self.weight)? + &self.bias)
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        input.affine(&self.weight, Some(&self.bias))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReLULayer;

impl BoundPropagation for ReLULayer {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(input.mapv(|x| x.max(0.0)))
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        Ok(input.relu())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TanhLayer;

impl BoundPropagation for TanhLayer {
    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(input.mapv(f32::tanh))
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        Ok(input.map_monotone(f32::tanh))
    }
}

/// 1-D convolution over the sequence axis of `(batch, seq_len, in_dim)`,
/// no padding, stride 1.
///
/// Each output step sees a window of `width` consecutive embeddings; the
/// window is flattened and passed through an affine map, so the interval
/// rule is the affine sign split applied to the unfolded input.
#[derive(Debug, Clone)]
pub struct Conv1dLayer {
    width: usize,
    in_dim: usize,
    /// `(filters, width * in_dim)`, window-major.
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl Conv1dLayer {
    /// `weight` is `(filters, width, in_dim)`.
    pub fn new(weight: Array3<f32>, bias: Array1<f32>) -> Result<Self> {
        let (filters, width, in_dim) = weight.dim();
        ensure_shape(&[filters], bias.shape())?;
        if width == 0 {
            return Err(HullcertError::InvalidConfig(
                "convolution width must be > 0".into(),
            ));
        }
        let kernel = weight
            .into_shape_with_order((filters, width * in_dim))
            .map_err(|e| HullcertError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            width,
            in_dim,
            kernel,
            bias,
        })
    }

    pub fn random<R: Rng + ?Sized>(
        in_dim: usize,
        filters: usize,
        width: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let fan_in = in_dim * width;
        let kernel = uniform_init((filters, fan_in), fan_in, rng);
        let weight = kernel
            .into_shape_with_order((filters, width, in_dim))
            .map_err(|e| HullcertError::InvalidConfig(e.to_string()))?;
        let bias = uniform_init((1, filters), fan_in, rng).row(0).to_owned();
        Self::new(weight, bias)
    }

    pub fn filters(&self) -> usize {
        self.kernel.nrows()
    }

    /// `(batch, seq_len, in_dim)` to `(batch, seq_len - width + 1, width * in_dim)`.
    fn unfold(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let x = input
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| HullcertError::InvalidRequest(format!(
                "Conv1d expects a 3-d input, got shape {:?}",
                input.shape()
            )))?;
        let (n, l, d) = x.dim();
        ensure_shape(&[n, l, self.in_dim], &[n, l, d])?;
        if l < self.width {
            return Err(HullcertError::InvalidRequest(format!(
                "sequence length {l} shorter than convolution width {}",
                self.width
            )));
        }

        let steps = l - self.width + 1;
        let mut out = Array3::zeros((n, steps, self.width * d));
        for t in 0..steps {
            let window = x.slice(s![.., t..t + self.width, ..]);
            let flat = window
                .to_shape((n, self.width * d))
                .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;
            out.slice_mut(s![.., t, ..]).assign(&flat);
        }
        Ok(out.into_dyn())
    }
}

impl BoundPropagation for Conv1dLayer {
    fn name(&self) -> &'static str {
        "Conv1d"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(matmul_last_axis(&self.unfold(input)?, &self.kernel)? + &self.bias)
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        input
            .map_structural(|a| self.unfold(a))?
            .affine(&self.kernel, Some(&self.bias))
    }
}

/// Dropout with inference behaviour.
///
/// Certification runs the encoder deterministically, so both passes are the
/// identity; `p` is kept for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropoutLayer {
    pub p: f32,
}

impl BoundPropagation for DropoutLayer {
    fn name(&self) -> &'static str {
        "Dropout"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(input.clone())
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        Ok(input.clone())
    }
}

/// Max pooling over an entire axis (max over time for `(batch, steps, features)`).
#[derive(Debug, Clone, Copy)]
pub struct MaxOverTimeLayer {
    pub axis: usize,
}

impl Default for MaxOverTimeLayer {
    fn default() -> Self {
        Self { axis: 1 }
    }
}

impl BoundPropagation for MaxOverTimeLayer {
    fn name(&self) -> &'static str {
        "MaxOverTime"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(IntervalBoundedTensor::concrete(input.clone())
            .max_axis(self.axis)?
            .value)
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        input.max_axis(self.axis)
    }
}

/// Layer normalisation over the last axis, without affine parameters.
///
/// The mean and variance couple every feature, so no elementwise interval
/// rule applies and interval propagation is refused.
#[derive(Debug, Clone, Copy)]
pub struct LayerNormLayer {
    pub epsilon: f32,
}

impl Default for LayerNormLayer {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

impl BoundPropagation for LayerNormLayer {
    fn name(&self) -> &'static str {
        "LayerNorm"
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let last = input.ndim().checked_sub(1).ok_or_else(|| {
            HullcertError::InvalidRequest("LayerNorm needs at least one axis".into())
        })?;
        let mut out = input.clone();
        for mut lane in out.lanes_mut(Axis(last)) {
            let n = lane.len().max(1) as f32;
            let mean = lane.sum() / n;
            let var = lane.mapv(|x| (x - mean) * (x - mean)).sum() / n;
            let denom = (var + self.epsilon).sqrt();
            lane.mapv_inplace(|x| (x - mean) / denom);
        }
        Ok(out)
    }
}

/// Layers available to the certifying encoder.
#[derive(Debug, Clone)]
pub enum Layer {
    Linear(LinearLayer),
    ReLU(ReLULayer),
    Tanh(TanhLayer),
    Conv1d(Conv1dLayer),
    MaxOverTime(MaxOverTimeLayer),
    Dropout(DropoutLayer),
    LayerNorm(LayerNormLayer),
}

impl Layer {
    fn inner(&self) -> &dyn BoundPropagation {
        match self {
            Layer::Linear(l) => l,
            Layer::ReLU(l) => l,
            Layer::Tanh(l) => l,
            Layer::Conv1d(l) => l,
            Layer::MaxOverTime(l) => l,
            Layer::Dropout(l) => l,
            Layer::LayerNorm(l) => l,
        }
    }
}

impl BoundPropagation for Layer {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.inner().forward(input)
    }

    fn propagate_ibp(&self, input: &IntervalBoundedTensor) -> Result<IntervalBoundedTensor> {
        self.inner().propagate_ibp(input)
    }
}
