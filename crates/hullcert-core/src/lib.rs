//! Core types for synonym-hull certified robustness training.
//!
//! This crate provides the error type shared by the workspace and the
//! classifier configuration that is passed explicitly at construction time.

pub mod config;

pub use config::{ClassifierConfig, ModelProperties};

use thiserror::Error;

/// Error types for hull construction, bound derivation and propagation.
#[derive(Debug, Error)]
pub enum HullcertError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error(
        "Vocabulary mismatch: target token {token:?} (id {target_id}) is missing from the source vocabulary"
    )]
    VocabularyMismatch { token: String, target_id: usize },

    #[error("Degenerate hull: no valid synonym candidate at example {example}, position {position}")]
    DegenerateHull { example: usize, position: usize },

    #[error("No interval rule for {0}; refusing to certify")]
    UnsupportedBoundPropagation(String),

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Token id {token_id} out of vocabulary (size {vocab_size})")]
    TokenOutOfVocab { token_id: u32, vocab_size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration loading failed: {0}")]
    ConfigLoad(String),

    #[error("Layer {layer_index} ({layer_name}) failed: {source}")]
    LayerError {
        layer_index: usize,
        layer_name: String,
        #[source]
        source: Box<HullcertError>,
    },
}

impl HullcertError {
    /// Create a ShapeMismatch error.
    ///
    /// Identical shapes indicate a bug in the caller's comparison.
    #[track_caller]
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        debug_assert_ne!(
            expected,
            got,
            "ShapeMismatch created with identical shapes at {}",
            std::panic::Location::caller()
        );
        HullcertError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Wrap an error with the position of the layer that raised it.
    pub fn in_layer(self, layer_index: usize, layer_name: &str) -> Self {
        HullcertError::LayerError {
            layer_index,
            layer_name: layer_name.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through layer wrappers.
    pub fn root_cause(&self) -> &HullcertError {
        match self {
            HullcertError::LayerError { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, HullcertError>;

/// Check that two shapes agree, producing a ShapeMismatch otherwise.
#[track_caller]
pub fn ensure_shape(expected: &[usize], got: &[usize]) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(HullcertError::shape_mismatch(expected, got))
    }
}
