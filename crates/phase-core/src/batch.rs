//! Per-user samples and their padded batch form.
//!
//! A [`Sample`] is one labelled user: the embedding of their current post
//! plus the ordered embeddings of their historic posts and the elapsed time
//! before each historic post. [`collate`] pads a set of samples to a common
//! history length so they can advance through a recurrent encoder together.
//!
//! Padding is always trailing: real steps of every sequence occupy the
//! first `lengths[b]` positions.

use serde::{Deserialize, Serialize};

use crate::error::PhaseError;

/// One labelled user.
///
/// # Example
///
/// ```
/// use phase_core::Sample;
///
/// let sample = Sample {
///     label: 1,
///     current: vec![0.1; 4],
///     history: vec![vec![0.2; 4], vec![0.3; 4]],
///     intervals: vec![0.0, 1.5],
/// };
/// assert_eq!(sample.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Risk class index.
    #[serde(default)]
    pub label: u32,

    /// Embedding of the current post.
    pub current: Vec<f32>,

    /// Embeddings of historic posts, oldest first.
    #[serde(default)]
    pub history: Vec<Vec<f32>>,

    /// Elapsed time before each historic post. Empty means all zeros.
    #[serde(default)]
    pub intervals: Vec<f32>,
}

impl Sample {
    /// Number of historic posts.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Returns `true` if the sample has no historic posts.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// A collated, zero-padded batch in row-major host buffers.
///
/// # Example
///
/// ```
/// use phase_core::{collate, Sample};
///
/// let samples = vec![
///     Sample { label: 0, current: vec![0.0; 2], history: vec![vec![1.0; 2]; 3], intervals: vec![] },
///     Sample { label: 1, current: vec![0.0; 2], history: vec![vec![1.0; 2]], intervals: vec![] },
/// ];
/// let batch = collate(&samples).unwrap();
/// assert_eq!(batch.max_len, 3);
/// assert_eq!(batch.lengths, vec![3, 1]);
/// assert_eq!(batch.history.len(), 2 * 3 * 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    /// Number of samples.
    pub batch_size: usize,

    /// Padded history length (at least 1).
    pub max_len: usize,

    /// Width of one historic embedding.
    pub embedding_dim: usize,

    /// Width of the current post embedding.
    pub current_dim: usize,

    /// One label per sample.
    pub labels: Vec<u32>,

    /// `[batch_size × current_dim]`.
    pub current: Vec<f32>,

    /// `[batch_size × max_len × embedding_dim]`, zero-padded.
    pub history: Vec<f32>,

    /// `[batch_size × max_len]`, zero-padded.
    pub intervals: Vec<f32>,

    /// Real history length of each sample.
    pub lengths: Vec<usize>,
}

impl PaddedBatch {
    /// Returns `true` if any sample carries fewer steps than `max_len`.
    pub fn is_ragged(&self) -> bool {
        self.lengths.iter().any(|&len| len != self.max_len)
    }
}

/// Pads samples to a common history length.
///
/// # Errors
///
/// Returns [`PhaseError::EmptyInput`] for an empty slice,
/// [`PhaseError::ShapeMismatch`] if embedding widths differ between or
/// within samples, and [`PhaseError::InvalidInput`] if a sample's intervals
/// do not match its history length.
pub fn collate(samples: &[Sample]) -> Result<PaddedBatch, PhaseError> {
    let first = samples.first().ok_or(PhaseError::EmptyInput { context: "collate" })?;
    let current_dim = first.current.len();
    if current_dim == 0 {
        return Err(PhaseError::EmptyInput {
            context: "collate current embedding",
        });
    }
    let embedding_dim = samples
        .iter()
        .find_map(|s| s.history.first().map(Vec::len))
        .unwrap_or(current_dim);
    let max_len = samples.iter().map(Sample::len).max().unwrap_or(0).max(1);
    let batch_size = samples.len();

    let mut labels = Vec::with_capacity(batch_size);
    let mut current = Vec::with_capacity(batch_size * current_dim);
    let mut history = vec![0.0f32; batch_size * max_len * embedding_dim];
    let mut intervals = vec![0.0f32; batch_size * max_len];
    let mut lengths = Vec::with_capacity(batch_size);

    for (b, sample) in samples.iter().enumerate() {
        if sample.current.len() != current_dim {
            return Err(PhaseError::shape(
                "collate current embedding",
                &[current_dim],
                &[sample.current.len()],
            ));
        }
        if !sample.intervals.is_empty() && sample.intervals.len() != sample.len() {
            return Err(PhaseError::InvalidInput {
                message: format!(
                    "sample {b}: {} intervals for {} historic posts",
                    sample.intervals.len(),
                    sample.len()
                ),
            });
        }
        labels.push(sample.label);
        current.extend_from_slice(&sample.current);

        for (t, post) in sample.history.iter().enumerate() {
            if post.len() != embedding_dim {
                return Err(PhaseError::shape(
                    "collate historic embedding",
                    &[embedding_dim],
                    &[post.len()],
                ));
            }
            let offset = (b * max_len + t) * embedding_dim;
            history[offset..offset + embedding_dim].copy_from_slice(post);
        }
        let row = b * max_len;
        intervals[row..row + sample.intervals.len()].copy_from_slice(&sample.intervals);
        lengths.push(sample.len());
    }

    if lengths.iter().all(|&len| len == 0) {
        tracing::warn!(batch_size, "collated batch has no historic posts at all");
    }

    Ok(PaddedBatch {
        batch_size,
        max_len,
        embedding_dim,
        current_dim,
        labels,
        current,
        history,
        intervals,
        lengths,
    })
}

/// Converts absolute post timestamps into elapsed-time intervals.
///
/// The first post has interval 0; every later post gets the time since the
/// previous one divided by `unit_seconds` (e.g. `3600.0` for hours).
///
/// # Errors
///
/// Returns [`PhaseError::InvalidInput`] if `unit_seconds` is not positive or
/// the timestamps are not in non-decreasing order.
///
/// # Example
///
/// ```
/// use phase_core::intervals_from_timestamps;
///
/// let intervals = intervals_from_timestamps(&[0.0, 3600.0, 10800.0], 3600.0).unwrap();
/// assert_eq!(intervals, vec![0.0, 1.0, 2.0]);
/// ```
pub fn intervals_from_timestamps(
    timestamps: &[f64],
    unit_seconds: f64,
) -> Result<Vec<f32>, PhaseError> {
    if unit_seconds.is_nan() || unit_seconds <= 0.0 {
        return Err(PhaseError::InvalidInput {
            message: format!("interval unit must be positive, got {unit_seconds}"),
        });
    }
    let mut intervals = Vec::with_capacity(timestamps.len());
    let mut previous: Option<f64> = None;
    for (i, &ts) in timestamps.iter().enumerate() {
        let delta = match previous {
            None => 0.0,
            Some(prev) if ts >= prev => (ts - prev) / unit_seconds,
            Some(prev) => {
                return Err(PhaseError::InvalidInput {
                    message: format!("timestamp {i} ({ts}) precedes its predecessor ({prev})"),
                })
            }
        };
        intervals.push(delta as f32);
        previous = Some(ts);
    }
    Ok(intervals)
}
