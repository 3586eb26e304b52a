//! # phase-core
//!
//! Shared foundation for the PHASE risk classifier.
//!
//! The classifier reads one user's current post together with their
//! historic posting sequence and predicts a risk class. Everything that
//! does not need a tensor library lives here:
//!
//! - [`PhaseError`]: the single error type used across the workspace
//! - [`ModelConfig`] / [`PhaseConfig`]: construction-time configuration
//! - [`Sample`] / [`PaddedBatch`]: per-user samples and their padded,
//!   collated batch form
//!
//! ## Architecture Rules
//!
//! - No tensor code in this crate (that's `phase-nn`).
//! - Configuration errors are reported by `validate()` before any model
//!   is built.
//! - No async code.

pub mod batch;
pub mod config;
pub mod error;

pub use batch::{collate, intervals_from_timestamps, PaddedBatch, Sample};
pub use config::{EncoderKind, HeadKind, ModelConfig, PaddingPolicy, PhaseConfig};
pub use error::PhaseError;

/// Width of one post embedding produced by the upstream text encoder.
pub const EMBEDDING_DIM: usize = 768;

/// Number of risk classes predicted by the heads (binary risk).
pub const NUM_CLASSES: usize = 2;

/// Width of the small bottleneck layer used by the single-source heads.
pub const HEAD_BOTTLENECK_DIM: usize = 32;
