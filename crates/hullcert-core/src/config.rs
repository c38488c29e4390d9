//! Classifier configuration and reported model properties.

use crate::{HullcertError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Configuration for a certified text classifier.
///
/// Owned by the caller and passed at construction; nothing in the workspace
/// keeps global model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Width of each token embedding.
    pub embedding_dim: usize,
    /// Drop probability of the dropout layers.
    pub dropout: f32,
    /// Number of output classes.
    pub num_classes: usize,
    /// Padded sequence length.
    #[serde(alias = "pad_size")]
    pub max_len: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Initialise the embedding table from supplied vectors.
    pub use_pretrained_embed: bool,
    /// Whether gradients flow into the embedding table.
    pub embedding_training: bool,
    /// Rows of the embedding table. Zero skips vocabulary remapping.
    pub vocab_size: usize,
    /// Number of convolution filters in the certifying encoder.
    pub num_filters: usize,
    /// Convolution window width in tokens.
    pub filter_size: usize,
    /// Perturbation strength applied to the hull bounds.
    pub eps: f32,
    /// Standard deviation of feature noise in the auxiliary encoder (0 = dropout).
    pub noise_std: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 768,
            dropout: 0.1,
            num_classes: 2,
            max_len: 32,
            batch_size: 128,
            learning_rate: 1e-3,
            use_pretrained_embed: false,
            embedding_training: false,
            vocab_size: 30522,
            num_filters: 100,
            filter_size: 3,
            eps: 1.0,
            noise_std: 0.0,
        }
    }
}

impl ClassifierConfig {
    /// Parse a configuration from JSON. Missing fields take default values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| HullcertError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading classifier config from {}", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| HullcertError::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Reject configurations no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(HullcertError::InvalidConfig(
                "embedding_dim must be > 0".into(),
            ));
        }
        if self.num_classes < 2 {
            return Err(HullcertError::InvalidConfig(format!(
                "num_classes must be >= 2 (got {})",
                self.num_classes
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(HullcertError::InvalidConfig(format!(
                "dropout must be in [0, 1) (got {})",
                self.dropout
            )));
        }
        if self.num_filters == 0 || self.filter_size == 0 {
            return Err(HullcertError::InvalidConfig(
                "num_filters and filter_size must be > 0".into(),
            ));
        }
        if self.max_len < self.filter_size {
            return Err(HullcertError::InvalidConfig(format!(
                "max_len {} shorter than filter_size {}",
                self.max_len, self.filter_size
            )));
        }
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(HullcertError::InvalidConfig(format!(
                "eps must be finite and >= 0 (got {})",
                self.eps
            )));
        }
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return Err(HullcertError::InvalidConfig(format!(
                "noise_std must be finite and >= 0 (got {})",
                self.noise_std
            )));
        }
        Ok(())
    }
}

/// Summary of a classifier's training-relevant settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProperties {
    pub model_name: String,
    pub embedding_dim: usize,
    pub embedding_training: bool,
    pub max_seq_len: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub dropout: f32,
}

impl ModelProperties {
    pub fn from_config(model_name: &str, config: &ClassifierConfig) -> Self {
        Self {
            model_name: model_name.to_string(),
            embedding_dim: config.embedding_dim,
            embedding_training: config.embedding_training,
            max_seq_len: config.max_len,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            dropout: config.dropout,
        }
    }
}
