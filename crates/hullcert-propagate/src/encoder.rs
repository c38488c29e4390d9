//! Certifying encoder and the auxiliary noisy encoder.

use crate::layers::{
    BoundPropagation, Conv1dLayer, DropoutLayer, Layer, LinearLayer, MaxOverTimeLayer,
    ReLULayer,
};
use hullcert_core::{ClassifierConfig, HullcertError, Result};
use hullcert_tensor::IntervalBoundedTensor;
use ndarray::{Array2, ArrayD, Ix2};
use rand::Rng;
use rand_distr::{Bernoulli, Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do when a layer has no interval rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropagationMode {
    /// Fail with [`HullcertError::UnsupportedBoundPropagation`].
    #[default]
    Strict,
    /// Continue on the point value only and mark the result uncertified.
    MidpointFallback,
}

/// Interval logits from the certifying encoder.
#[derive(Debug, Clone)]
pub struct EncoderBounds {
    pub logits: IntervalBoundedTensor,
    /// False when any layer fell back to the point value.
    pub certified: bool,
}

/// Stack of bound-propagating layers.
#[derive(Debug, Clone)]
pub struct CertifyingEncoder {
    layers: Vec<Layer>,
    mode: PropagationMode,
}

impl CertifyingEncoder {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            mode: PropagationMode::Strict,
        }
    }

    pub fn with_mode(mut self, mode: PropagationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Text CNN: convolution over the sequence, ReLU, max over time, dropout,
    /// then a linear classifier.
    pub fn cnn_1d<R: Rng + ?Sized>(config: &ClassifierConfig, rng: &mut R) -> Result<Self> {
        let conv = Conv1dLayer::random(
            config.embedding_dim,
            config.num_filters,
            config.filter_size,
            rng,
        )?;
        let fc = LinearLayer::random(config.num_filters, config.num_classes, rng);
        Ok(Self::new(vec![
            Layer::Conv1d(conv),
            Layer::ReLU(ReLULayer),
            Layer::MaxOverTime(MaxOverTimeLayer { axis: 1 }),
            Layer::Dropout(DropoutLayer { p: config.dropout }),
            Layer::Linear(fc),
        ]))
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn mode(&self) -> PropagationMode {
        self.mode
    }

    /// Concrete forward pass.
    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut current = input.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            current = layer
                .forward(&current)
                .map_err(|e| e.in_layer(idx, layer.name()))?;
        }
        Ok(current)
    }

    /// Propagate an interval input to interval logits.
    pub fn propagate(&self, input: &IntervalBoundedTensor) -> Result<EncoderBounds> {
        let mut current = input.clone();
        let mut certified = true;
        for (idx, layer) in self.layers.iter().enumerate() {
            current = match layer.propagate_ibp(&current) {
                Ok(next) => next,
                Err(HullcertError::UnsupportedBoundPropagation(op))
                    if self.mode == PropagationMode::MidpointFallback =>
                {
                    warn!(
                        "Layer {} ({}) has no interval rule; continuing on midpoint, output is not certified",
                        idx, op
                    );
                    certified = false;
                    let value = layer
                        .forward(&current.value)
                        .map_err(|e| e.in_layer(idx, layer.name()))?;
                    IntervalBoundedTensor::concrete(value)
                }
                Err(e) => return Err(e.in_layer(idx, layer.name())),
            };
            debug!(
                "Layer {} ({}): shape {:?}, max width {:.4}",
                idx,
                layer.name(),
                current.shape(),
                current.max_width()
            );
        }
        Ok(EncoderBounds {
            logits: current,
            certified,
        })
    }
}

/// Train/eval switch for the auxiliary encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncoderMode {
    #[default]
    Train,
    Eval,
}

/// Logits and the post-activation feature they were computed from.
#[derive(Debug, Clone)]
pub struct NoisyEncoderOutput {
    pub logits: Array2<f32>,
    pub feature: Array2<f32>,
}

/// Two-layer head `fc2(regularise(relu(fc1(x))))`.
///
/// In training the hidden feature is smoothed with Gaussian noise when a
/// noise scale is given, and dropped out otherwise. Evaluation applies
/// dropout with inference behaviour (identity) and never injects noise.
#[derive(Debug, Clone)]
pub struct NoisyEncoder {
    fc1: LinearLayer,
    fc2: LinearLayer,
    dropout: f32,
    noise_std: f32,
    mode: EncoderMode,
}

impl NoisyEncoder {
    pub fn new<R: Rng + ?Sized>(config: &ClassifierConfig, rng: &mut R) -> Result<Self> {
        let d = config.embedding_dim;
        Self::from_layers(
            LinearLayer::random(d, d, rng),
            LinearLayer::random(d, config.num_classes, rng),
            config.dropout,
        )?
        .with_noise_std(config.noise_std)
    }

    pub fn from_layers(fc1: LinearLayer, fc2: LinearLayer, dropout: f32) -> Result<Self> {
        if fc1.out_dim() != fc2.in_dim() {
            return Err(HullcertError::shape_mismatch(
                &[fc1.out_dim()],
                &[fc2.in_dim()],
            ));
        }
        if !(0.0..1.0).contains(&dropout) {
            return Err(HullcertError::InvalidConfig(format!(
                "dropout must be in [0, 1) (got {dropout})"
            )));
        }
        Ok(Self {
            fc1,
            fc2,
            dropout,
            noise_std: 0.0,
            mode: EncoderMode::Train,
        })
    }

    /// Replace dropout with Gaussian feature noise of this standard
    /// deviation during training. Zero restores dropout.
    pub fn with_noise_std(mut self, noise_std: f32) -> Result<Self> {
        if !noise_std.is_finite() || noise_std < 0.0 {
            return Err(HullcertError::InvalidConfig(format!(
                "noise_std must be finite and >= 0 (got {noise_std})"
            )));
        }
        self.noise_std = noise_std;
        Ok(self)
    }

    pub fn noise_std(&self) -> f32 {
        self.noise_std
    }

    pub fn train(&mut self) {
        self.mode = EncoderMode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = EncoderMode::Eval;
    }

    pub fn mode(&self) -> EncoderMode {
        self.mode
    }

    /// Run the head on `(batch, dim)` features.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &Array2<f32>,
        rng: &mut R,
    ) -> Result<NoisyEncoderOutput> {
        let hidden = self.fc1.forward(&input.clone().into_dyn())?;
        let feature = ReLULayer
            .forward(&hidden)?
            .into_dimensionality::<Ix2>()
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;

        let regularised = match self.mode {
            EncoderMode::Train if self.noise_std != 0.0 => {
                let normal = Normal::new(0.0f32, self.noise_std)
                    .map_err(|e| HullcertError::InvalidConfig(format!("noise_std: {e}")))?;
                &feature + &Array2::from_shape_simple_fn(feature.dim(), || normal.sample(&mut *rng))
            }
            EncoderMode::Train => self.dropout(&feature, rng)?,
            EncoderMode::Eval => feature.clone(),
        };

        let logits = self
            .fc2
            .forward(&regularised.into_dyn())?
            .into_dimensionality::<Ix2>()
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?;
        Ok(NoisyEncoderOutput { logits, feature })
    }

    /// Inverted dropout: keep with probability `1 - p`, rescale by `1 / (1 - p)`.
    fn dropout<R: Rng + ?Sized>(&self, x: &Array2<f32>, rng: &mut R) -> Result<Array2<f32>> {
        if self.dropout == 0.0 {
            return Ok(x.clone());
        }
        let keep = Bernoulli::new(f64::from(1.0 - self.dropout))
            .map_err(|e| HullcertError::InvalidConfig(format!("dropout: {e}")))?;
        let scale = 1.0 / (1.0 - self.dropout);
        Ok(x.mapv(|v| if keep.sample(&mut *rng) { v * scale } else { 0.0 }))
    }
}
