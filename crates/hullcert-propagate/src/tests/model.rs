use super::small_config;
use crate::*;
use approx::assert_abs_diff_eq;
use ndarray::{arr1, arr2, s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn classifier() -> CertifiedClassifier {
    let mut rng = StdRng::seed_from_u64(17);
    CertifiedClassifier::new(small_config(), None, &mut rng).unwrap()
}

fn sent() -> Array2<u32> {
    arr2(&[[1u32, 2, 3, 0], [4, 5, 6, 7]])
}

/// Three candidates per position: the token itself, `t + 1` and `t + 2`
/// (mod 10). The third is invalid on example 1.
fn request() -> ForwardRequest {
    let sent = sent();
    let ids = Array3::from_shape_fn((2, 4, 3), |(i, j, k)| (sent[[i, j]] + k as u32) % 10);
    let valid = Array3::from_shape_fn((2, 4, 3), |(i, _, k)| k < 2 || i == 0);
    ForwardRequest::new(sent, ids, valid).unwrap()
}

/// Mean of the valid vertices as the single sample.
struct CentroidSampler;

impl ConvexHullSampler for CentroidSampler {
    fn sample(
        &self,
        nodes: ArrayView3<'_, f32>,
        valid: ArrayView2<'_, bool>,
        _max_sample_num: usize,
    ) -> Result<Array3<f32>> {
        let (num_nodes, _, d) = nodes.dim();
        let mut out = Array3::zeros((num_nodes, 1, d));
        for (node, mut sample) in out.outer_iter_mut().enumerate() {
            let mut count = 0.0f32;
            for (k, &v) in valid.row(node).iter().enumerate() {
                if v {
                    let vertex = nodes.slice(s![node, k, ..]);
                    let mut acc = sample.row_mut(0);
                    acc += &vertex;
                    count += 1.0;
                }
            }
            sample /= count;
        }
        Ok(out)
    }
}

#[test]
fn test_forward_margins_bound_every_substitution() {
    let model = classifier();
    let request = request();
    let out = model.forward(&request).unwrap();
    assert!(out.certified);
    assert_eq!(out.margins.len(), 2);
    assert_eq!(out.ibp_input.shape(), &[2, 4, 4]);

    let bounds = model.encoder().propagate(&out.ibp_input).unwrap().logits;
    let mut sampler = PerturbationSampler::seeded(1);
    for _ in 0..50 {
        let perturbed = sampler
            .sample_perturbed(&request.sent, request.candidates.as_ref().unwrap())
            .unwrap();
        let emb = model.get_emb(&perturbed).unwrap();
        assert!(out.ibp_input.contains(&emb.clone().into_dyn(), 1e-6));

        let logits = model.encoder().forward(&emb.into_dyn()).unwrap();
        assert!(bounds.contains(&logits, 1e-4));

        for (row, margin) in logits.axis_iter(Axis(0)).zip(out.margins.iter()) {
            let hi = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let lo = row.iter().copied().fold(f32::INFINITY, f32::min);
            assert!(hi - lo <= margin + 1e-4);
        }
    }
}

#[test]
fn test_forward_reuses_cached_ibp_input() {
    let model = classifier();
    let first = model.forward(&request()).unwrap();
    let cached = request().with_ibp_input(first.ibp_input.clone());
    let second = model.forward(&cached).unwrap();
    assert_eq!(first.margins, second.margins);
    assert_eq!(first.ibp_input, second.ibp_input);

    let displacement = first.max_displacement.unwrap();
    assert_eq!(displacement.len(), 2);
    assert!(displacement.iter().all(|&d| d > 0.0));
    assert!(second.max_displacement.is_none());
}

#[test]
fn test_forward_rechecks_cached_bound_ordering() {
    let model = classifier();
    let first = model.forward(&request()).unwrap();
    let mut inverted = first.ibp_input;
    std::mem::swap(&mut inverted.lower, &mut inverted.upper);
    inverted.lower[[0, 0, 0]] += 1.0;
    let err = model
        .forward(&request().with_ibp_input(inverted))
        .unwrap_err();
    assert!(matches!(err, HullcertError::InvalidBounds(_)));
}

#[test]
fn test_forward_without_candidates() {
    let model = classifier();
    let sent = sent();
    let logits = model
        .encoder()
        .forward(&model.get_emb(&sent).unwrap().into_dyn())
        .unwrap();
    let clean = max_diff_norm(&IntervalBoundedTensor::concrete(logits)).unwrap();

    let empty_axis = ForwardRequest::new(
        sent.clone(),
        Array3::zeros((2, 4, 0)),
        Array3::from_elem((2, 4, 0), true),
    )
    .unwrap();
    assert!(empty_axis.candidates.is_none());

    let literal = ForwardRequest {
        sent: sent.clone(),
        candidates: None,
        mask: None,
        ibp_input: None,
        labels: None,
    };

    for req in [empty_axis, literal, ForwardRequest::without_candidates(sent.clone())] {
        let out = model.forward(&req).unwrap();
        assert!(out.ibp_input.is_concrete());
        assert_eq!(out.max_displacement, Some(arr1(&[0.0f32, 0.0])));
        for (a, b) in out.margins.iter().zip(clean.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    let err = ForwardRequest::new(
        sent,
        Array3::zeros((1, 4, 0)),
        Array3::from_elem((1, 4, 0), true),
    )
    .unwrap_err();
    assert!(matches!(err, HullcertError::ShapeMismatch { .. }));
}

#[test]
fn test_literal_request_with_empty_candidate_axis_is_rejected() {
    let sent = arr2(&[[1u32, 2]]);
    let request = ForwardRequest {
        sent,
        candidates: Some(SynonymCandidates {
            ids: Array3::zeros((1, 2, 0)),
            valid: Array3::from_elem((1, 2, 0), true),
        }),
        mask: None,
        ibp_input: None,
        labels: None,
    };
    let err = classifier().forward(&request).unwrap_err();
    assert!(matches!(err, HullcertError::InvalidRequest(_)));
}

#[test]
fn test_forward_rejects_cached_input_of_wrong_width() {
    let model = classifier();
    let stale = IntervalBoundedTensor::concrete(Array3::<f32>::zeros((2, 4, 3)).into_dyn());
    let err = model.forward(&request().with_ibp_input(stale)).unwrap_err();
    assert!(matches!(err, HullcertError::ShapeMismatch { .. }));

    let wrong_batch = IntervalBoundedTensor::concrete(Array3::<f32>::zeros((1, 4, 4)).into_dyn());
    let err = model.forward(&request().with_ibp_input(wrong_batch)).unwrap_err();
    assert!(matches!(err, HullcertError::InvalidRequest(_)));
}

#[test]
fn test_no_synonyms_reduces_to_clean_logits() {
    let model = classifier();
    let sent = sent();
    let ids = Array3::from_shape_fn((2, 4, 2), |(i, j, _)| sent[[i, j]]);
    let valid = Array3::from_shape_fn((2, 4, 2), |(_, _, k)| k == 0);
    let request = ForwardRequest::new(sent.clone(), ids, valid)
        .unwrap()
        .with_labels(arr1(&[0, 2]));
    let out = model.forward(&request).unwrap();
    assert!(out.ibp_input.is_concrete());

    let logits = model
        .encoder()
        .forward(&model.get_emb(&sent).unwrap().into_dyn())
        .unwrap();
    let clean = max_diff_norm(&IntervalBoundedTensor::concrete(logits.clone())).unwrap();
    for (a, b) in out.margins.iter().zip(clean.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
    }

    let tcm = out.true_class_margins.unwrap();
    for (i, &y) in [0usize, 2].iter().enumerate() {
        let competitor = (0..3)
            .filter(|&j| j != y)
            .map(|j| logits[[i, j]])
            .fold(f32::NEG_INFINITY, f32::max);
        assert_abs_diff_eq!(tcm[i], logits[[i, y]] - competitor, epsilon = 1e-4);
    }
}

#[test]
fn test_ibp_input_without_candidates_is_concrete() {
    let model = classifier();
    let out = model
        .ibp_input_from_convex_hull(&sent(), None, None, 1.0)
        .unwrap();
    assert!(out.input.is_concrete());
    assert_eq!(out.input.value, model.get_emb(&sent()).unwrap().into_dyn());
    assert_eq!(out.max_displacement, arr1(&[0.0f32, 0.0]));
}

#[test]
fn test_padding_mask_collapses_positions() {
    let model = classifier();
    let mask = arr2(&[[true, true, true, false], [true, true, true, true]]);
    let masked = request().with_mask(mask).unwrap();
    let out = model.forward(&masked).unwrap();
    let width = out.ibp_input.width();
    assert!(width.slice(s![0, 3, ..]).iter().all(|&w| w == 0.0));
    assert!(width.slice(s![0, 0, ..]).iter().any(|&w| w > 0.0));

    let err = request().with_mask(arr2(&[[true, false]])).unwrap_err();
    assert!(matches!(err, HullcertError::ShapeMismatch { .. }));
}

#[test]
fn test_perturbation_lies_in_hull_box() {
    let model = classifier();
    let request = request();
    let mut sampler = PerturbationSampler::seeded(8);
    let out = model
        .ibp_input_with_perturbation(
            &request.sent,
            request.candidates.as_ref().unwrap(),
            None,
            1.0,
            &mut sampler,
        )
        .unwrap();
    let perturbed = out.perturbed.unwrap();
    assert_eq!(perturbed.dim(), (2, 4, 4));
    assert!(out.input.contains(&perturbed.into_dyn(), 1e-6));
    assert!(out.max_displacement.iter().all(|&d| d > 0.0));
}

#[test]
fn test_sample_from_convex_hull_layout() {
    let model = classifier();
    let request = request();
    let samples = model
        .sample_from_convex_hull(request.candidates.as_ref().unwrap(), &CentroidSampler, 4)
        .unwrap();
    assert_eq!(samples.dim(), (2, 1, 4, 4));

    // Example 1, position 2: mean of tokens 6 and 7.
    let emb = model.get_emb(&arr2(&[[6u32, 7]])).unwrap();
    let expected = (&emb.slice(s![0, 0, ..]) + &emb.slice(s![0, 1, ..])) / 2.0;
    for (a, b) in samples.slice(s![1, 0, 2, ..]).iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }

    let err = model
        .sample_from_convex_hull(request.candidates.as_ref().unwrap(), &CentroidSampler, 0)
        .unwrap_err();
    assert!(matches!(err, HullcertError::InvalidRequest(_)));
}

#[test]
fn test_request_validation() {
    let sent = arr2(&[[1u32, 2]]);
    let valid = Array3::from_elem((1, 2, 2), true);

    // Candidate 0 must be the original token.
    let err = ForwardRequest::new(sent.clone(), Array3::from_elem((1, 2, 2), 1u32), valid.clone())
        .unwrap_err();
    assert!(matches!(err, HullcertError::InvalidRequest(_)));

    let err = ForwardRequest::new(sent.clone(), Array3::zeros((2, 2, 2)), Array3::from_elem((2, 2, 2), true))
        .unwrap_err();
    assert!(matches!(err, HullcertError::ShapeMismatch { .. }));

    let ids = Array3::from_shape_fn((1, 2, 2), |(_, j, _)| sent[[0, j]]);
    let mut invalid = valid;
    invalid.slice_mut(s![0, 1, ..]).fill(false);
    let err = ForwardRequest::new(sent, ids, invalid).unwrap_err();
    assert!(matches!(
        err,
        HullcertError::DegenerateHull {
            example: 0,
            position: 1
        }
    ));
}

#[test]
fn test_pretrained_embeddings() {
    let mut rng = StdRng::seed_from_u64(0);
    let config = ClassifierConfig {
        use_pretrained_embed: true,
        ..small_config()
    };
    let weights = Array2::from_shape_fn((10, 4), |(i, _)| i as f32);
    let model = CertifiedClassifier::new(config.clone(), Some(weights), &mut rng).unwrap();
    let emb = model.get_emb(&arr2(&[[3u32, 9]])).unwrap();
    assert_eq!(emb.slice(s![0, 1, ..]), arr1(&[9.0f32; 4]));

    assert!(matches!(
        CertifiedClassifier::new(config.clone(), None, &mut rng),
        Err(HullcertError::InvalidConfig(_))
    ));
    assert!(matches!(
        CertifiedClassifier::new(config, Some(Array2::zeros((10, 3))), &mut rng),
        Err(HullcertError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_update_embedding() {
    let mut rng = StdRng::seed_from_u64(0);
    let config = ClassifierConfig {
        use_pretrained_embed: true,
        ..small_config()
    };
    let weights = Array2::from_shape_fn((10, 4), |(i, _)| i as f32);
    let mut model = CertifiedClassifier::new(config, Some(weights), &mut rng).unwrap();

    let source = Vocabulary::from_tokens((0..10).map(|i| format!("t{i}"))).unwrap();
    let target = Vocabulary::from_tokens(["t3", "t1"]).unwrap();
    model.update_embedding(&source, &target).unwrap();
    let emb = model.get_emb(&arr2(&[[0u32, 1]])).unwrap();
    assert_eq!(emb.slice(s![0, 0, ..]), arr1(&[3.0f32; 4]));
    assert_eq!(emb.slice(s![0, 1, ..]), arr1(&[1.0f32; 4]));

    let missing = Vocabulary::from_tokens(["t1", "unknown"]).unwrap();
    assert!(matches!(
        model.update_embedding(&target, &missing),
        Err(HullcertError::VocabularyMismatch { target_id: 1, .. })
    ));
}

#[test]
fn test_properties() {
    let model = classifier();
    let props = model.properties();
    assert_eq!(props.model_name, "CertifiedClassifier");
    assert_eq!(props.embedding_dim, 4);
    assert_eq!(props.max_seq_len, 4);
    assert!(!props.embedding_training);
    assert!(!model.embeddings().is_trainable());
}
