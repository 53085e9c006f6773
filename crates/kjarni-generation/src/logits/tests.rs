use std::collections::BTreeMap;

use ndarray::{array, Array1, Array2};

use super::*;
use crate::config::{resolve_generation_config, GenerationParams};

fn config(overrides: GenerationParams) -> GenerationConfig {
    resolve_generation_config(&GenerationParams::default(), None, Some(&overrides)).unwrap()
}

fn bounds(prompt_len: usize, min_length: usize, max_length: usize) -> LengthBounds {
    LengthBounds {
        prompt_len,
        min_length,
        max_length,
    }
}

// ============== construction ==============

#[test]
fn test_default_config_builds_empty_pipeline() {
    let pipeline = LogitsPipeline::from_config(&config(GenerationParams::default()), &bounds(3, 0, 20));
    assert!(pipeline.is_empty());
}

#[test]
fn test_stage_order_is_fixed() {
    let config = config(GenerationParams {
        do_sample: Some(true),
        temperature: Some(0.7),
        top_k: Some(50),
        top_p: Some(0.9),
        repetition_penalty: Some(1.2),
        bad_words_ids: Some(vec![vec![3]]),
        no_repeat_ngram_size: Some(3),
        min_length: Some(10),
        eos_token_id: Some(vec![2]),
        forced_decoder_ids: Some(vec![(1, 5)]),
        max_length: Some(30),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(1, 10, 30));

    assert_eq!(
        pipeline.names(),
        vec![
            "forced_tokens",
            "min_length",
            "no_repeat_ngram",
            "bad_words",
            "repetition_penalty",
            "temperature",
            "top_k",
            "top_p",
        ]
    );
}

#[test]
fn test_warpers_only_when_sampling() {
    let config = config(GenerationParams {
        num_beams: Some(4),
        temperature: Some(0.5),
        top_k: Some(10),
        top_p: Some(0.8),
        repetition_penalty: Some(1.3),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(1, 0, 20));
    assert_eq!(pipeline.names(), vec!["repetition_penalty"]);
}

#[test]
fn test_min_length_skipped_without_eos_or_when_satisfied() {
    let no_eos = config(GenerationParams {
        min_length: Some(10),
        max_length: Some(20),
        ..Default::default()
    });
    assert!(LogitsPipeline::from_config(&no_eos, &bounds(1, 10, 20)).is_empty());

    let satisfied = config(GenerationParams {
        min_length: Some(3),
        eos_token_id: Some(vec![2]),
        ..Default::default()
    });
    assert!(LogitsPipeline::from_config(&satisfied, &bounds(5, 3, 20)).is_empty());
}

// ============== forced bos / eos ==============

#[test]
fn test_forced_bos_and_eos_positions() {
    let config = config(GenerationParams {
        forced_bos_token_id: Some(0),
        forced_eos_token_id: Some(2),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(1, 0, 5));

    // position 1 == prompt_len -> bos
    let mut scores = Array1::<f32>::ones(4);
    pipeline.apply(&[2], &mut scores.view_mut());
    assert_eq!(scores[0], 0.0);
    assert_eq!(scores[1], f32::NEG_INFINITY);

    // position 4 == max_length - 1 -> eos
    let mut scores = Array1::<f32>::ones(4);
    pipeline.apply(&[2, 0, 3, 3], &mut scores.view_mut());
    assert_eq!(scores, array![f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY]);

    // anything in between is untouched
    let mut scores = Array1::<f32>::ones(4);
    pipeline.apply(&[2, 0], &mut scores.view_mut());
    assert_eq!(scores, Array1::<f32>::ones(4));
}

#[test]
fn test_forced_decoder_ids_win_over_forced_bos() {
    let config = config(GenerationParams {
        forced_bos_token_id: Some(0),
        forced_decoder_ids: Some(vec![(1, 3)]),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(1, 0, 20));

    let mut scores = Array1::<f32>::zeros(4);
    pipeline.apply(&[2], &mut scores.view_mut());
    assert_eq!(scores[3], 0.0);
    assert_eq!(scores[0], f32::NEG_INFINITY);
}

// ============== composition ==============

#[test]
fn test_bad_words_after_prefix() {
    let config = config(GenerationParams {
        bad_words_ids: Some(vec![vec![7, 9]]),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(2, 0, 20));

    let mut scores = Array1::<f32>::zeros(12);
    scores[9] = 10.0;
    pipeline.apply(&[4, 7], &mut scores.view_mut());
    assert_eq!(scores[9], f32::NEG_INFINITY);
    assert_eq!(crate::common::math::argmax(&scores), Some(0));
}

#[test]
fn test_penalty_then_temperature() {
    let config = config(GenerationParams {
        do_sample: Some(true),
        repetition_penalty: Some(2.0),
        temperature: Some(0.5),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(1, 0, 20));

    let mut scores = array![4.0f32, 1.0];
    pipeline.apply(&[0], &mut scores.view_mut());
    // 4 / 2 (penalty) / 0.5 (temperature)
    assert_eq!(scores, array![4.0, 2.0]);
}

#[test]
fn test_custom_stage() {
    struct BanZero;
    impl LogitsProcessor for BanZero {
        fn name(&self) -> &'static str {
            "ban_zero"
        }
        fn process(&self, _tokens: &[u32], scores: &mut ArrayViewMut1<'_, f32>) {
            scores[0] = f32::NEG_INFINITY;
        }
    }

    let mut pipeline = LogitsPipeline::new();
    pipeline.push(BanZero);
    pipeline.push(ForcedTokensProcessor::new(BTreeMap::new()));
    assert_eq!(pipeline.len(), 2);
    assert_eq!(format!("{:?}", pipeline), r#"["ban_zero", "forced_tokens"]"#);
}

// ============== batch ==============

#[test]
fn test_apply_batch_matches_per_row() {
    let config = config(GenerationParams {
        no_repeat_ngram_size: Some(2),
        repetition_penalty: Some(1.5),
        ..Default::default()
    });
    let pipeline = LogitsPipeline::from_config(&config, &bounds(2, 0, 20));

    let histories: Vec<Vec<u32>> = vec![vec![1, 2, 1], vec![3, 3], vec![0, 4, 2], vec![5]];
    let refs: Vec<&[u32]> = histories.iter().map(Vec::as_slice).collect();
    let mut batch = Array2::from_shape_fn((4, 6), |(i, j)| (i as f32) - (j as f32) * 0.5);
    let mut expected = batch.clone();

    pipeline.apply_batch(&refs, &mut batch).unwrap();
    for (mut row, tokens) in expected.outer_iter_mut().zip(&refs) {
        pipeline.apply(tokens, &mut row);
    }
    assert_eq!(batch, expected);
}

#[test]
fn test_apply_batch_row_mismatch() {
    let pipeline = LogitsPipeline::new();
    let mut batch = Array2::<f32>::zeros((2, 4));
    let err = pipeline.apply_batch(&[&[1u32][..]], &mut batch).unwrap_err();
    assert!(err.is_forward_step());
}

#[test]
fn test_apply_rows_uses_each_rows_pipeline() {
    let config = config(GenerationParams {
        eos_token_id: Some(vec![2]),
        ..Default::default()
    });
    // input 0 still needs tokens before eos, input 1 is past its minimum
    let pipelines = vec![
        LogitsPipeline::from_config(&config, &bounds(1, 4, 20)),
        LogitsPipeline::from_config(&config, &bounds(3, 0, 20)),
    ];
    let histories: Vec<Vec<u32>> = vec![vec![5, 6], vec![5, 6], vec![7, 8, 9]];
    let refs: Vec<&[u32]> = histories.iter().map(Vec::as_slice).collect();
    let mut batch = Array2::<f32>::ones((3, 4));

    apply_rows(&pipelines, &[0, 0, 1], &refs, &mut batch).unwrap();
    assert_eq!(batch[[0, 2]], f32::NEG_INFINITY);
    assert_eq!(batch[[1, 2]], f32::NEG_INFINITY);
    assert_eq!(batch[[2, 2]], 1.0);
}

#[test]
fn test_apply_rows_unknown_owner() {
    let pipelines = vec![LogitsPipeline::new()];
    let mut batch = Array2::<f32>::zeros((1, 4));
    assert!(apply_rows(&pipelines, &[1], &[&[1u32][..]], &mut batch).is_err());
}
