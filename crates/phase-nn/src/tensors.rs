//! Device-resident form of a [`PaddedBatch`].

use candle_core::{Device, Tensor};
use phase_core::{PaddedBatch, PhaseError};

use crate::map_candle;

/// Tensors of one collated batch.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use phase_core::{collate, Sample};
/// use phase_nn::BatchTensors;
///
/// let samples = vec![
///     Sample { label: 1, current: vec![0.5; 3], history: vec![vec![1.0; 4]; 2], intervals: vec![0.0, 2.0] },
///     Sample { label: 0, current: vec![0.1; 3], history: vec![vec![1.0; 4]], intervals: vec![] },
/// ];
/// let batch = collate(&samples).unwrap();
/// let tensors = BatchTensors::from_padded(&batch, &Device::Cpu).unwrap();
/// assert_eq!(tensors.history.dims(), &[2, 2, 4]);
/// assert_eq!(tensors.current.dims(), &[2, 3]);
/// assert_eq!(tensors.lengths, vec![2, 1]);
/// ```
#[derive(Debug, Clone)]
pub struct BatchTensors {
    /// `[B, current_dim]`.
    pub current: Tensor,
    /// `[B, T, embedding_dim]`.
    pub history: Tensor,
    /// `[B, T]`.
    pub intervals: Tensor,
    /// Real history length per sequence.
    pub lengths: Vec<usize>,
    /// `[B]`, `u32`.
    pub labels: Tensor,
}

impl BatchTensors {
    /// Uploads the host buffers of `batch` to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Tensor`] if a buffer does not match its
    /// declared shape.
    pub fn from_padded(batch: &PaddedBatch, device: &Device) -> Result<Self, PhaseError> {
        let map_err = map_candle("batch upload");
        let b = batch.batch_size;
        let t = batch.max_len;
        Ok(Self {
            current: Tensor::from_slice(&batch.current, (b, batch.current_dim), device)
                .map_err(&map_err)?,
            history: Tensor::from_slice(&batch.history, (b, t, batch.embedding_dim), device)
                .map_err(&map_err)?,
            intervals: Tensor::from_slice(&batch.intervals, (b, t), device).map_err(&map_err)?,
            lengths: batch.lengths.clone(),
            labels: Tensor::from_slice(&batch.labels, b, device).map_err(&map_err)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Padded history length.
    pub fn time_steps(&self) -> usize {
        self.intervals.dims().get(1).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phase_core::{collate, Sample};

    #[test]
    fn padded_positions_are_zero() {
        let samples = vec![
            Sample {
                label: 0,
                current: vec![1.0, 2.0],
                history: vec![vec![1.0, 1.0], vec![2.0, 2.0], vec![3.0, 3.0]],
                intervals: vec![0.0, 1.0, 1.0],
            },
            Sample {
                label: 1,
                current: vec![3.0, 4.0],
                history: vec![vec![5.0, 5.0]],
                intervals: vec![],
            },
        ];
        let tensors = BatchTensors::from_padded(&collate(&samples).unwrap(), &Device::Cpu).unwrap();
        assert_eq!(tensors.batch_size(), 2);
        assert_eq!(tensors.time_steps(), 3);
        let history = tensors.history.to_vec3::<f32>().unwrap();
        assert_eq!(history[1], vec![vec![5.0, 5.0], vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(
            tensors.intervals.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0, 1.0], vec![0.0, 0.0, 0.0]]
        );
        assert_eq!(tensors.labels.to_vec1::<u32>().unwrap(), vec![0, 1]);
    }

    #[test]
    fn inconsistent_buffers_rejected() {
        let mut batch = collate(&[Sample {
            label: 0,
            current: vec![1.0],
            history: vec![vec![1.0]],
            intervals: vec![],
        }])
        .unwrap();
        batch.history.push(9.0);
        assert!(matches!(
            BatchTensors::from_padded(&batch, &Device::Cpu),
            Err(PhaseError::Tensor { .. })
        ));
    }
}
