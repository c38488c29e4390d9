//! Certified robustness to synonym substitution for text classifiers.
//!
//! The pipeline runs leaves first:
//! - [`embedding`]: token ids to vectors, frozen or trainable, with vocabulary remapping
//! - [`hull`]: per-position synonym vertex sets
//! - [`bounds`]: axis-aligned boxes around each vertex set, optionally eps-scaled
//! - [`layers`] and [`encoder`]: interval bound propagation to the logits
//! - [`margin`]: interval logits to a per-example certified margin
//!
//! [`model::CertifiedClassifier`] wires the stages behind a single
//! [`model::ForwardRequest`]. [`sampler`] draws concrete synonym
//! substitutions for consistency training alongside the interval path.

pub mod bounds;
pub mod embedding;
pub mod encoder;
pub mod hull;
pub mod layers;
pub mod margin;
pub mod model;
pub mod sampler;

pub use bounds::{derive_bounds, BoundDerivation};
pub use embedding::{EmbeddingBackbone, EmbeddingLookup, EmbeddingTable, Vocabulary};
pub use encoder::{
    CertifyingEncoder, EncoderBounds, EncoderMode, NoisyEncoder, NoisyEncoderOutput,
    PropagationMode,
};
pub use hull::{build_convex_hull, ConvexHullSampler, SynonymCandidates, VertexSet};
pub use layers::{
    BoundPropagation, Conv1dLayer, DropoutLayer, Layer, LayerNormLayer, LinearLayer,
    MaxOverTimeLayer, ReLULayer, TanhLayer,
};
pub use margin::{max_diff_norm, true_class_margin};
pub use model::{CertifiedClassifier, ForwardOutput, ForwardRequest};
pub use sampler::PerturbationSampler;

pub use hullcert_core::{ClassifierConfig, HullcertError, ModelProperties, Result};
pub use hullcert_tensor::IntervalBoundedTensor;

#[cfg(test)]
mod tests;
