//! Integration tests for the PHASE encoder.
//!
//! Exercises the encoder through its public API only: construction from a
//! config, padded batches, distance traces and the recency weighting.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use phase_core::{collate, PaddingPolicy, PhaseConfig, PhaseError, Sample};
use phase_nn::encoder::{HistoricInput, SequenceEncoder};
use phase_nn::{BatchTensors, PhaseEncoder};

fn encoder(config: &PhaseConfig) -> PhaseEncoder {
    let var_map = VarMap::new();
    PhaseEncoder::new(config, &var_map, 42, &Device::Cpu).unwrap()
}

fn finite(t: &Tensor) -> bool {
    t.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .iter()
        .all(|v| v.is_finite())
}

// --- End-to-end ---

#[test]
fn two_users_with_ragged_histories() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 3, 4));
    let samples = vec![
        Sample {
            label: 1,
            current: vec![0.0; 8],
            history: vec![vec![0.1; 8], vec![-0.2; 8], vec![0.3; 8]],
            intervals: vec![1.0, 2.5, 0.0],
        },
        Sample {
            label: 0,
            current: vec![0.0; 8],
            history: vec![vec![0.5; 8]],
            intervals: vec![0.0],
        },
    ];
    let batch = BatchTensors::from_padded(&collate(&samples).unwrap(), &Device::Cpu).unwrap();

    let encoded = encoder
        .encode(&HistoricInput::from_batch(&batch), false)
        .unwrap();
    assert_eq!(encoded.representation.dims(), &[2, 12]);
    assert!(finite(&encoded.representation));

    let distance = encoded.distance.unwrap();
    assert_eq!(distance.dims(), &[3, 2]);
    assert!(finite(&distance));

    // Same batch without masking: shapes unchanged.
    let (representation, distance) = encoder.run(&batch.history, &batch.intervals).unwrap();
    assert_eq!(representation.dims(), &[2, 12]);
    assert_eq!(distance.dims(), &[3, 2]);
}

#[test]
fn single_step_is_finite() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 3, 4));
    let features = Tensor::full(0.7f32, (4, 1, 8), &Device::Cpu).unwrap();
    let intervals = Tensor::zeros((4, 1), DType::F32, &Device::Cpu).unwrap();
    let (representation, distance) = encoder.run(&features, &intervals).unwrap();
    assert_eq!(representation.dims(), &[4, 12]);
    assert_eq!(distance.dims(), &[1, 4]);
    assert!(finite(&representation) && finite(&distance));
}

#[test]
fn long_history_keeps_trace_per_step() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 3, 4));
    let features = Tensor::randn(0f32, 1.0, (2, 40, 8), &Device::Cpu).unwrap();
    let intervals = Tensor::full(24.0f32, (2, 40), &Device::Cpu).unwrap();
    let output = encoder.forward(&features, &intervals, None, false).unwrap();
    assert_eq!(output.distance.dims(), &[40, 2]);
    assert!(finite(&output.representation));
    let weights = output.recency_weights.to_vec2::<f32>().unwrap();
    for row in weights {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}

// --- Configuration ---

#[test]
fn indivisible_hidden_fails_before_any_forward() {
    let var_map = VarMap::new();
    let err = PhaseEncoder::new(&PhaseConfig::new(8, 14, 3, 4), &var_map, 1, &Device::Cpu).unwrap_err();
    assert!(matches!(err, PhaseError::IndivisibleHidden { hidden_dim: 14, levels: 4 }));
    assert!(var_map.all_vars().is_empty());
}

#[test]
fn single_level_behaves_like_a_gated_recurrence() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 3, 1));
    let features = Tensor::full(0.2f32, (2, 5, 8), &Device::Cpu).unwrap();
    let intervals = Tensor::ones((2, 5), DType::F32, &Device::Cpu).unwrap();
    let output = encoder.forward(&features, &intervals, None, false).unwrap();
    // One level: forget master is always 1, so distance-forget is 0.
    let trace = output.distance.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(trace.iter().all(|d| d.abs() < 1e-6));
    assert!(finite(&output.representation));
}

#[test]
fn window_wider_than_history() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 6, 4));
    let features = Tensor::full(0.2f32, (1, 2, 8), &Device::Cpu).unwrap();
    let intervals = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
    let output = encoder.forward(&features, &intervals, None, false).unwrap();
    assert_eq!(output.recency_weights.dims(), &[1, 6]);
    let weights = output.recency_weights.to_vec2::<f32>().unwrap();
    // The four zero-prefix slots share one weight.
    for w in &weights[0][1..4] {
        assert!((w - weights[0][0]).abs() < 1e-7);
    }
}

// --- Padding policies ---

#[test]
fn masked_and_uniform_agree_without_padding() {
    let mut uniform = PhaseConfig::new(8, 12, 3, 4);
    uniform.padding = PaddingPolicy::Uniform;
    let masked = encoder(&PhaseConfig::new(8, 12, 3, 4));
    let uniform = encoder(&uniform);

    let features = Tensor::randn(0f32, 1.0, (3, 4, 8), &Device::Cpu).unwrap();
    let intervals = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
    let lengths = [4, 4, 4];
    let a = masked.forward(&features, &intervals, Some(&lengths), false).unwrap();
    let b = uniform.forward(&features, &intervals, Some(&lengths), false).unwrap();
    assert_eq!(
        a.representation.to_vec2::<f32>().unwrap(),
        b.representation.to_vec2::<f32>().unwrap()
    );
}

#[test]
fn masked_padding_ignores_padded_content() {
    let encoder = encoder(&PhaseConfig::new(8, 12, 3, 4));
    let lengths = [2, 4];
    let intervals = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();

    let zeros_after = Tensor::cat(
        &[
            Tensor::full(0.3f32, (1, 4, 8), &Device::Cpu).unwrap(),
            Tensor::full(0.6f32, (1, 4, 8), &Device::Cpu).unwrap(),
        ],
        0,
    )
    .unwrap();
    let noise = Tensor::randn(0f32, 5.0, (1, 2, 8), &Device::Cpu).unwrap();
    let head = zeros_after.narrow(0, 0, 1).unwrap().narrow(1, 0, 2).unwrap();
    let first = Tensor::cat(&[&head, &noise], 1).unwrap();
    let garbage_after = Tensor::cat(&[&first, &zeros_after.narrow(0, 1, 1).unwrap()], 0).unwrap();

    let a = encoder.forward(&zeros_after, &intervals, Some(&lengths), false).unwrap();
    let b = encoder.forward(&garbage_after, &intervals, Some(&lengths), false).unwrap();
    let a = a.representation.to_vec2::<f32>().unwrap();
    let b = b.representation.to_vec2::<f32>().unwrap();
    for (x, y) in a[0].iter().zip(&b[0]) {
        assert!((x - y).abs() < 1e-6);
    }
}
