//! Batch risk classification CLI.
//!
//! Reads a model configuration and a JSON list of samples, runs one
//! inference pass, and prints logits, class probabilities, predictions
//! and (for the PHASE encoder) the distance trace as JSON on stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p phase-nn --bin classify -- \
//!   --config model.json \
//!   --samples users.json \
//!   --weights checkpoints/phase.safetensors
//! ```
//!
//! Without `--config` the default configuration is used. Without
//! `--weights` the parameters keep their seeded initialization.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::Device;
use candle_nn::VarMap;
use phase_core::{collate, ModelConfig, Sample};
use phase_nn::{BatchTensors, RiskClassifier};
use serde::Serialize;

#[derive(Serialize)]
struct Report {
    model: &'static str,
    labels: Vec<u32>,
    predictions: Vec<u32>,
    logits: Vec<Vec<f32>>,
    probabilities: Vec<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance: Option<Vec<Vec<f32>>>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    let config = match &cli.config {
        Some(path) => ModelConfig::from_path(path).unwrap_or_else(|e| fail("failed to load config", e)),
        None => ModelConfig::default(),
    };
    tracing::info!(model = config.model.label(), head = ?config.head, "loaded configuration");

    let json = std::fs::read_to_string(&cli.samples)
        .unwrap_or_else(|e| fail(&format!("failed to read {}", cli.samples.display()), e));
    let samples: Vec<Sample> =
        serde_json::from_str(&json).unwrap_or_else(|e| fail("failed to parse samples", e));
    let batch = collate(&samples).unwrap_or_else(|e| fail("failed to collate samples", e));
    tracing::info!(
        samples = batch.batch_size,
        max_len = batch.max_len,
        ragged = batch.is_ragged(),
        "collated batch"
    );

    let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
    let mut var_map = VarMap::new();
    let classifier = RiskClassifier::new(&config, &var_map, &device)
        .unwrap_or_else(|e| fail("failed to build classifier", e));
    if let Some(weights) = &cli.weights {
        var_map
            .load(weights)
            .unwrap_or_else(|e| fail(&format!("failed to load {}", weights.display()), e));
        tracing::info!(path = %weights.display(), "loaded weights");
    }

    let start = Instant::now();
    let tensors = BatchTensors::from_padded(&batch, &device)
        .unwrap_or_else(|e| fail("failed to upload batch", e));
    let output = classifier
        .classify(&tensors)
        .unwrap_or_else(|e| fail("classification failed", e));
    tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "classified batch");

    let report = Report {
        model: config.model.label(),
        labels: batch.labels.clone(),
        predictions: output
            .predictions()
            .unwrap_or_else(|e| fail("failed to read predictions", e)),
        logits: output
            .logits
            .to_vec2()
            .unwrap_or_else(|e| fail("failed to read logits", e)),
        probabilities: output
            .probabilities()
            .unwrap_or_else(|e| fail("failed to compute probabilities", e))
            .to_vec2()
            .unwrap_or_else(|e| fail("failed to read probabilities", e)),
        distance: output
            .distance
            .map(|d| d.to_vec2())
            .transpose()
            .unwrap_or_else(|e| fail("failed to read distance trace", e)),
    };
    let json = serde_json::to_string_pretty(&report).unwrap_or_else(|e| fail("failed to encode report", e));
    println!("{json}");
}

fn fail(what: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("ERROR: {what}: {error}");
    std::process::exit(1);
}

struct CliConfig {
    config: Option<PathBuf>,
    samples: PathBuf,
    weights: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> CliConfig {
    let mut config = None;
    let mut samples = None;
    let mut weights = None;

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i).cloned().unwrap_or_else(|| {
                eprintln!("ERROR: {} needs a value", args[i - 1]);
                std::process::exit(1);
            })
        };
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(value(i)));
            }
            "--samples" => {
                i += 1;
                samples = Some(PathBuf::from(value(i)));
            }
            "--weights" => {
                i += 1;
                weights = Some(PathBuf::from(value(i)));
            }
            "--help" | "-h" => {
                eprintln!("Usage: classify --samples <users.json> [--config <model.json>] [--weights <file.safetensors>]");
                std::process::exit(0);
            }
            other => {
                eprintln!("ERROR: unknown argument '{other}'");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let samples = samples.unwrap_or_else(|| {
        eprintln!("ERROR: --samples is required");
        std::process::exit(1);
    });
    CliConfig {
        config,
        samples,
        weights,
    }
}
