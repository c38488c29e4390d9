//! Certified classifier: hull bounds in, certified margins out.

use crate::bounds::{derive_bounds, BoundDerivation};
use crate::embedding::{EmbeddingBackbone, EmbeddingLookup, EmbeddingTable, Vocabulary};
use crate::encoder::CertifyingEncoder;
use crate::hull::{build_convex_hull, ConvexHullSampler, SynonymCandidates, VertexSet};
use crate::margin::{max_diff_norm, true_class_margin};
use crate::sampler::PerturbationSampler;
use hullcert_core::{ensure_shape, ClassifierConfig, HullcertError, ModelProperties, Result};
use hullcert_tensor::IntervalBoundedTensor;
use ndarray::{Array1, Array2, Array3, Array4, Ix3};
use rand::Rng;
use tracing::{debug, info};

const MODEL_NAME: &str = "CertifiedClassifier";

/// Input to [`CertifiedClassifier::forward`].
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// `(batch, seq_len)` token ids.
    pub sent: Array2<u32>,
    /// Synonym candidates for every position of `sent`; `None` certifies the
    /// unperturbed sentence only.
    pub candidates: Option<SynonymCandidates>,
    /// `(batch, seq_len)`, false at padding positions.
    pub mask: Option<Array2<bool>>,
    /// Interval input from an earlier call, reused instead of rebuilding the hull.
    pub ibp_input: Option<IntervalBoundedTensor>,
    /// Class labels; enables [`ForwardOutput::true_class_margins`].
    pub labels: Option<Array1<usize>>,
}

impl ForwardRequest {
    /// Request over `sent` with its synonym candidates.
    ///
    /// An empty candidate axis means no synonyms were supplied.
    pub fn new(
        sent: Array2<u32>,
        text_like_syn: Array3<u32>,
        text_like_syn_valid: Array3<bool>,
    ) -> Result<Self> {
        let candidates = if text_like_syn.dim().2 == 0 {
            ensure_shape(text_like_syn.shape(), text_like_syn_valid.shape())?;
            ensure_shape(sent.shape(), &text_like_syn.shape()[..2])?;
            None
        } else {
            Some(SynonymCandidates::new(text_like_syn, text_like_syn_valid)?)
        };
        let request = Self {
            sent,
            candidates,
            mask: None,
            ibp_input: None,
            labels: None,
        };
        request.validate()?;
        Ok(request)
    }

    /// Request without synonyms: the interval input is zero width.
    pub fn without_candidates(sent: Array2<u32>) -> Self {
        Self {
            sent,
            candidates: None,
            mask: None,
            ibp_input: None,
            labels: None,
        }
    }

    pub fn with_mask(mut self, mask: Array2<bool>) -> Result<Self> {
        ensure_shape(self.sent.shape(), mask.shape())?;
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn with_ibp_input(mut self, ibp_input: IntervalBoundedTensor) -> Self {
        self.ibp_input = Some(ibp_input);
        self
    }

    pub fn with_labels(mut self, labels: Array1<usize>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.sent.nrows()
    }

    /// Check shapes and the candidate invariants.
    ///
    /// Candidate 0 at each position must be the token itself, and every
    /// non-padding position needs a valid candidate. A candidate set with an
    /// empty candidate axis is rejected; use `None` instead.
    pub fn validate(&self) -> Result<()> {
        let (n, l) = self.sent.dim();
        if let Some(mask) = &self.mask {
            ensure_shape(self.sent.shape(), mask.shape())?;
        }
        if let Some(labels) = &self.labels {
            ensure_shape(&[n], labels.shape())?;
        }
        if let Some(ibp) = &self.ibp_input {
            if ibp.ndim() != 3 || ibp.shape()[..2] != [n, l] {
                return Err(HullcertError::InvalidRequest(format!(
                    "cached ibp_input shape {:?} does not match batch ({n}, {l})",
                    ibp.shape()
                )));
            }
        }
        let Some(candidates) = &self.candidates else {
            return Ok(());
        };
        let (cn, cl, c) = candidates.dim();
        ensure_shape(self.sent.shape(), &[cn, cl])?;
        ensure_shape(candidates.ids.shape(), candidates.valid.shape())?;
        if c == 0 {
            return Err(HullcertError::InvalidRequest(
                "synonym candidate axis is empty".into(),
            ));
        }
        for ((i, j), &token) in self.sent.indexed_iter() {
            let original = candidates.ids[[i, j, 0]];
            if original != token {
                return Err(HullcertError::InvalidRequest(format!(
                    "candidate 0 at ({i}, {j}) is {original}, expected original token {token}"
                )));
            }
        }
        candidates.check_non_degenerate(self.mask.as_ref())
    }
}

/// Result of [`CertifiedClassifier::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Worst-case pairwise logit spread per example.
    pub margins: Array1<f32>,
    /// `lower_y - max_{j != y} upper_j` per example, when labels were given.
    pub true_class_margins: Option<Array1<f32>>,
    /// Largest synonym displacement per example; `None` when a cached
    /// interval input was reused.
    pub max_displacement: Option<Array1<f32>>,
    /// Interval input used; pass back via [`ForwardRequest::with_ibp_input`] to reuse.
    pub ibp_input: IntervalBoundedTensor,
    /// False when the encoder had to fall back to point values.
    pub certified: bool,
}

/// Embedding lookup plus certifying encoder.
#[derive(Debug, Clone)]
pub struct CertifiedClassifier<B: EmbeddingBackbone = EmbeddingTable> {
    config: ClassifierConfig,
    embeddings: EmbeddingLookup<B>,
    encoder: CertifyingEncoder,
}

impl CertifiedClassifier<EmbeddingTable> {
    /// Build a classifier with its own embedding table and a text CNN encoder.
    ///
    /// `pretrained` is required when `use_pretrained_embed` is set and
    /// ignored otherwise.
    pub fn new<R: Rng + ?Sized>(
        config: ClassifierConfig,
        pretrained: Option<Array2<f32>>,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let table = match (config.use_pretrained_embed, pretrained) {
            (true, Some(weights)) => {
                ensure_shape(&[weights.nrows(), config.embedding_dim], weights.shape())?;
                EmbeddingTable::from_pretrained(weights)?
            }
            (true, None) => {
                return Err(HullcertError::InvalidConfig(
                    "use_pretrained_embed is set but no embeddings were supplied".into(),
                ))
            }
            (false, _) => {
                if config.vocab_size == 0 {
                    return Err(HullcertError::InvalidConfig(
                        "vocab_size must be > 0 without pretrained embeddings".into(),
                    ));
                }
                EmbeddingTable::random(config.vocab_size, config.embedding_dim, rng)
            }
        };
        let encoder = CertifyingEncoder::cnn_1d(&config, rng)?;
        Self::with_backbone(config, table, encoder)
    }

    /// Re-index the embedding table from `source` ids to `target` ids.
    ///
    /// Skipped when the configuration has no vocabulary (`vocab_size == 0`).
    pub fn update_embedding(&mut self, source: &Vocabulary, target: &Vocabulary) -> Result<()> {
        if self.config.vocab_size == 0 {
            debug!("vocab_size is 0; keeping embedding table as is");
            return Ok(());
        }
        self.embeddings.remap(source, target)?;
        info!("Embedding table remapped to {} tokens", target.len());
        Ok(())
    }
}

impl<B: EmbeddingBackbone> CertifiedClassifier<B> {
    pub fn with_backbone(
        config: ClassifierConfig,
        backbone: B,
        encoder: CertifyingEncoder,
    ) -> Result<Self> {
        config.validate()?;
        if backbone.embedding_dim() != config.embedding_dim {
            return Err(HullcertError::shape_mismatch(
                &[config.embedding_dim],
                &[backbone.embedding_dim()],
            ));
        }
        let embeddings = EmbeddingLookup::new(backbone, config.embedding_training);
        let classifier = Self {
            config,
            embeddings,
            encoder,
        };
        info!("{:?}", classifier.properties());
        Ok(classifier)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn encoder(&self) -> &CertifyingEncoder {
        &self.encoder
    }

    pub fn embeddings(&self) -> &EmbeddingLookup<B> {
        &self.embeddings
    }

    pub fn properties(&self) -> ModelProperties {
        ModelProperties::from_config(MODEL_NAME, &self.config)
    }

    /// `(batch, seq_len)` ids to `(batch, seq_len, dim)` embeddings.
    pub fn get_emb(&self, tokens: &Array2<u32>) -> Result<Array3<f32>> {
        self.embeddings
            .lookup(&tokens.clone().into_dyn())?
            .into_dimensionality::<Ix3>()
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))
    }

    pub fn build_convex_hull(&self, candidates: &SynonymCandidates) -> Result<VertexSet> {
        build_convex_hull(&self.embeddings, candidates)
    }

    /// Sentences drawn from the hulls: `(batch, samples, seq_len, dim)`.
    pub fn sample_from_convex_hull<S: ConvexHullSampler + ?Sized>(
        &self,
        candidates: &SynonymCandidates,
        sampler: &S,
        max_sample_num: usize,
    ) -> Result<Array4<f32>> {
        let hull = self.build_convex_hull(candidates)?;
        let (nodes, node_valid) = hull.nodes()?;
        let samples = sampler.sample(nodes, node_valid, max_sample_num)?;

        let (n, l, _) = candidates.dim();
        let (num_nodes, num_samples, d) = samples.dim();
        ensure_shape(&[n * l, num_samples, hull.embedding_dim()], &[num_nodes, num_samples, d])?;
        if num_samples > max_sample_num {
            return Err(HullcertError::InvalidRequest(format!(
                "hull sampler returned {num_samples} samples, limit is {max_sample_num}"
            )));
        }
        let sentences = samples
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n, l, num_samples, d))
            .map_err(|e| HullcertError::InvalidRequest(e.to_string()))?
            .permuted_axes([0, 2, 1, 3]);
        Ok(sentences.as_standard_layout().into_owned())
    }

    /// Interval input for `sent`.
    ///
    /// Without candidates the result is the zero-width interval at the true
    /// embeddings.
    pub fn ibp_input_from_convex_hull(
        &self,
        sent: &Array2<u32>,
        candidates: Option<&SynonymCandidates>,
        mask: Option<&Array2<bool>>,
        eps: f32,
    ) -> Result<BoundDerivation> {
        let true_embeddings = self.get_emb(sent)?;
        let Some(candidates) = candidates else {
            debug!("No synonym candidates; using zero-width input bounds");
            return Ok(BoundDerivation::concrete(true_embeddings));
        };
        let (n, l, _) = candidates.dim();
        ensure_shape(&[n, l], sent.shape())?;

        let hull = self.build_convex_hull(candidates)?;
        derive_bounds(
            hull.embeddings.view(),
            hull.valid.view(),
            mask,
            true_embeddings.view(),
            eps,
        )
    }

    /// [`Self::ibp_input_from_convex_hull`] plus the embeddings of one
    /// randomly perturbed sentence.
    pub fn ibp_input_with_perturbation<R: Rng>(
        &self,
        sent: &Array2<u32>,
        candidates: &SynonymCandidates,
        mask: Option<&Array2<bool>>,
        eps: f32,
        sampler: &mut PerturbationSampler<R>,
    ) -> Result<BoundDerivation> {
        let perturbed_sent = sampler.sample_perturbed(sent, candidates)?;
        let mut derivation = self.ibp_input_from_convex_hull(sent, Some(candidates), mask, eps)?;
        derivation.perturbed = Some(self.get_emb(&perturbed_sent)?);
        Ok(derivation)
    }

    /// Certified margins for a batch.
    pub fn forward(&self, request: &ForwardRequest) -> Result<ForwardOutput> {
        request.validate()?;
        let (ibp_input, max_displacement) = match &request.ibp_input {
            Some(cached) => {
                let d = self.embeddings.embedding_dim();
                ensure_shape(&[request.batch_size(), request.sent.ncols(), d], cached.shape())?;
                let checked = IntervalBoundedTensor::new(
                    cached.value.clone(),
                    cached.lower.clone(),
                    cached.upper.clone(),
                )?;
                (checked, None)
            }
            None => {
                let derivation = self.ibp_input_from_convex_hull(
                    &request.sent,
                    request.candidates.as_ref(),
                    request.mask.as_ref(),
                    self.config.eps,
                )?;
                (derivation.input, Some(derivation.max_displacement))
            }
        };

        let bounds = self.encoder.propagate(&ibp_input)?;
        let margins = max_diff_norm(&bounds.logits)?;
        let true_class_margins = request
            .labels
            .as_ref()
            .map(|labels| true_class_margin(&bounds.logits, labels))
            .transpose()?;

        debug!(
            "Forward: batch {}, input width {:.4}, logit width {:.4}, certified {}",
            request.batch_size(),
            ibp_input.max_width(),
            bounds.logits.max_width(),
            bounds.certified
        );
        Ok(ForwardOutput {
            margins,
            true_class_margins,
            max_displacement,
            ibp_input,
            certified: bounds.certified,
        })
    }
}
