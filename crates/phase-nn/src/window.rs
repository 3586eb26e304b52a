//! Sliding window of recent hidden states and its re-weighted convolution.
//!
//! [`TemporalWindow`] is a fixed-capacity ring buffer written once per time
//! step. It starts zero-filled, so a sequence shorter than the capacity is
//! seen through a zero prefix. [`Reweighter`] turns the final window into
//! the sequence representation:
//!
//! ```text
//! w      = softmax(cumsum(distance))           [B, K], oldest → newest
//! X      = window · w                          [B, H, K]
//! theme  = σ(up(relu(down(mean_K(X)))))        [B, H]
//! repr   = theme · conv1d_K(X)                 [B, H]
//! ```

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv1d, Linear, Module};
use phase_core::{PhaseConfig, PhaseError};

use crate::init::ParamBuilder;
use crate::{blend, map_candle, mask_column};

/// Reduction factor of the recalibration bottleneck.
pub const RECALIBRATION_REDUCTION: usize = 6;

/// Ring buffer of the last `capacity` hidden vectors and distance scalars.
///
/// Slots are addressed by `step % capacity`. With a per-sequence activity
/// mask, inactive sequences keep their slot contents, and their real steps
/// must form a prefix of the traversal (trailing padding).
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use phase_nn::window::TemporalWindow;
///
/// let device = Device::Cpu;
/// let mut window = TemporalWindow::zeros(3, 1, 2, &device).unwrap();
/// let h = Tensor::new(&[[1.0f32, 1.0]], &device).unwrap();
/// let d = Tensor::new(&[0.5f32], &device).unwrap();
/// window.push(&h, &d, None).unwrap();
///
/// let (hidden, distance) = window.ordered().unwrap();
/// assert_eq!(hidden.dims(), &[1, 3, 2]);
/// // Zero prefix, newest last.
/// assert_eq!(distance.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0, 0.5]]);
/// ```
#[derive(Debug, Clone)]
pub struct TemporalWindow {
    hidden: Vec<Tensor>,
    distance: Vec<Tensor>,
    filled: Vec<usize>,
    step: usize,
    hidden_dim: usize,
}

impl TemporalWindow {
    /// Zero-initialized window for `batch` sequences.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidConfig`] if `capacity` is zero.
    pub fn zeros(
        capacity: usize,
        batch: usize,
        hidden_dim: usize,
        device: &Device,
    ) -> Result<Self, PhaseError> {
        if capacity == 0 {
            return Err(PhaseError::InvalidConfig {
                field: "conv_size",
                reason: "window capacity must be greater than zero".to_string(),
            });
        }
        let map_err = map_candle("window init");
        let hidden = Tensor::zeros((batch, hidden_dim), DType::F32, device).map_err(&map_err)?;
        let distance = Tensor::zeros(batch, DType::F32, device).map_err(&map_err)?;
        Ok(Self {
            hidden: vec![hidden; capacity],
            distance: vec![distance; capacity],
            filled: vec![0; batch],
            step: 0,
            hidden_dim,
        })
    }

    pub fn capacity(&self) -> usize {
        self.hidden.len()
    }

    pub fn batch_size(&self) -> usize {
        self.filled.len()
    }

    /// Number of pushes so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Real steps written per sequence.
    pub fn filled(&self) -> &[usize] {
        &self.filled
    }

    /// Appends one step, evicting the oldest.
    ///
    /// `hidden` is `[B, H]`, `distance` is `[B]`. With `active`, only the
    /// marked sequences are written.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::ShapeMismatch`] for mis-shaped inputs and
    /// [`PhaseError::InvalidInput`] if a sequence becomes active again after
    /// an inactive step.
    pub fn push(
        &mut self,
        hidden: &Tensor,
        distance: &Tensor,
        active: Option<&[bool]>,
    ) -> Result<(), PhaseError> {
        let batch = self.batch_size();
        if hidden.dims() != [batch, self.hidden_dim] {
            return Err(PhaseError::shape("window push hidden", &[batch, self.hidden_dim], hidden.dims()));
        }
        if distance.dims() != [batch] {
            return Err(PhaseError::shape("window push distance", &[batch], distance.dims()));
        }
        let slot = self.step % self.capacity();

        match active {
            None => {
                self.hidden[slot] = hidden.clone();
                self.distance[slot] = distance.clone();
                self.filled.iter_mut().for_each(|f| *f += 1);
            }
            Some(active) => {
                if active.len() != batch {
                    return Err(PhaseError::shape("window push mask", &[batch], &[active.len()]));
                }
                if let Some(b) = (0..batch).find(|&b| active[b] && self.filled[b] != self.step) {
                    return Err(PhaseError::InvalidInput {
                        message: format!(
                            "sequence {b} resumed at step {} after padding; real steps must come first",
                            self.step
                        ),
                    });
                }
                let map_err = map_candle("window push");
                let mask = mask_column(active, hidden.device()).map_err(&map_err)?;
                self.hidden[slot] = blend(hidden, &self.hidden[slot], &mask).map_err(&map_err)?;
                let mask = mask.squeeze(1).map_err(&map_err)?;
                self.distance[slot] =
                    blend(distance, &self.distance[slot], &mask).map_err(&map_err)?;
                for (f, &a) in self.filled.iter_mut().zip(active) {
                    if a {
                        *f += 1;
                    }
                }
            }
        }
        self.step += 1;
        Ok(())
    }

    /// Window contents oldest first: hidden `[B, K, H]` and distance `[B, K]`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Tensor`] if stacking fails.
    pub fn ordered(&self) -> Result<(Tensor, Tensor), PhaseError> {
        self.ordered_inner().map_err(map_candle("window order"))
    }

    fn ordered_inner(&self) -> candle_core::Result<(Tensor, Tensor)> {
        let capacity = self.capacity();
        let order = |start: usize| (0..capacity).map(move |j| (start + j) % capacity);

        let first = self.filled.first().copied().unwrap_or(0);
        if self.filled.iter().all(|&f| f == first) {
            let hidden: Vec<&Tensor> = order(first).map(|s| &self.hidden[s]).collect();
            let distance: Vec<&Tensor> = order(first).map(|s| &self.distance[s]).collect();
            return Ok((Tensor::stack(&hidden, 1)?, Tensor::stack(&distance, 1)?));
        }

        let mut hidden_rows = Vec::with_capacity(self.batch_size());
        let mut distance_rows = Vec::with_capacity(self.batch_size());
        for (b, &filled) in self.filled.iter().enumerate() {
            let hidden = order(filled)
                .map(|s| self.hidden[s].narrow(0, b, 1))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let distance = order(filled)
                .map(|s| self.distance[s].narrow(0, b, 1))
                .collect::<candle_core::Result<Vec<_>>>()?;
            hidden_rows.push(Tensor::stack(&hidden, 1)?);
            distance_rows.push(Tensor::stack(&distance, 1)?);
        }
        Ok((Tensor::cat(&hidden_rows, 0)?, Tensor::cat(&distance_rows, 0)?))
    }
}

/// Result of re-weighting one window.
#[derive(Debug, Clone)]
pub struct Reweighted {
    /// `[B, conv_dim]`.
    pub representation: Tensor,
    /// `[B, K]`, each row sums to 1.
    pub weights: Tensor,
}

/// Learned recalibration and temporal convolution over the final window.
#[derive(Debug)]
pub struct Reweighter {
    scale: Linear,
    rescale: Linear,
    conv: Conv1d,
    conv_size: usize,
    hidden_dim: usize,
}

impl Reweighter {
    /// Builds the bottleneck (`H → max(H/6, 1) → H`) and the
    /// `H → H` convolution of width `conv_size`.
    ///
    /// # Errors
    ///
    /// Returns any validation error of [`PhaseConfig::validate`].
    pub fn new(config: &PhaseConfig, params: &mut ParamBuilder<'_>, prefix: &str) -> Result<Self, PhaseError> {
        config.validate()?;
        let hidden = config.hidden_dim;
        let bottleneck = (hidden / RECALIBRATION_REDUCTION).max(1);
        Ok(Self {
            scale: params.linear(&format!("{prefix}.scale"), hidden, bottleneck)?,
            rescale: params.linear(&format!("{prefix}.rescale"), bottleneck, hidden)?,
            conv: params.conv1d(&format!("{prefix}.conv"), hidden, config.conv_dim(), config.conv_size)?,
            conv_size: config.conv_size,
            hidden_dim: hidden,
        })
    }

    /// Softmax of the cumulative distance along the window axis.
    ///
    /// `distance` is `[B, K]` oldest first; every output row sums to 1.
    ///
    /// # Example
    ///
    /// ```
    /// use candle_core::{Device, Tensor};
    /// use phase_nn::window::Reweighter;
    ///
    /// let d = Tensor::new(&[[0.1f32, 0.4, 0.9]], &Device::Cpu).unwrap();
    /// let w = Reweighter::recency_weights(&d).unwrap().to_vec2::<f32>().unwrap();
    /// assert!((w[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    /// assert!(w[0][0] < w[0][2]);
    /// ```
    pub fn recency_weights(distance: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::softmax(&distance.cumsum(D::Minus1)?, D::Minus1)
    }

    /// Collapses the window into the sequence representation.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::ShapeMismatch`] if the window's capacity or
    /// width differs from this reweighter's.
    pub fn finalize(&self, window: &TemporalWindow) -> Result<Reweighted, PhaseError> {
        if window.capacity() != self.conv_size || window.hidden_dim != self.hidden_dim {
            return Err(PhaseError::shape(
                "reweighter window",
                &[self.conv_size, self.hidden_dim],
                &[window.capacity(), window.hidden_dim],
            ));
        }
        let (hidden, distance) = window.ordered()?;
        self.finalize_inner(&hidden, &distance)
            .map_err(map_candle("reweighter finalize"))
    }

    fn finalize_inner(&self, hidden: &Tensor, distance: &Tensor) -> candle_core::Result<Reweighted> {
        let weights = Self::recency_weights(distance)?;
        // [B, K, H] -> [B, H, K], channels first for the convolution.
        let local = hidden
            .transpose(1, 2)?
            .broadcast_mul(&weights.unsqueeze(1)?)?
            .contiguous()?;

        let theme = local.mean(D::Minus1)?;
        let theme = self.scale.forward(&theme)?.relu()?;
        let theme = candle_nn::ops::sigmoid(&self.rescale.forward(&theme)?)?;

        let conv = self.conv.forward(&local)?.squeeze(D::Minus1)?;
        Ok(Reweighted {
            representation: (theme * conv)?,
            weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn push_steps(window: &mut TemporalWindow, values: &[f32], active: Option<&[bool]>) {
        let batch = window.batch_size();
        for &v in values {
            let h = Tensor::full(v, (batch, window.hidden_dim), &Device::Cpu).unwrap();
            let d = Tensor::full(v, batch, &Device::Cpu).unwrap();
            window.push(&h, &d, active).unwrap();
        }
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(TemporalWindow::zeros(0, 2, 4, &Device::Cpu).is_err());
    }

    #[test]
    fn fifo_evicts_oldest() {
        let mut window = TemporalWindow::zeros(3, 2, 2, &Device::Cpu).unwrap();
        push_steps(&mut window, &[1.0, 2.0, 3.0, 4.0, 5.0], None);
        let (hidden, distance) = window.ordered().unwrap();
        assert_eq!(
            distance.to_vec2::<f32>().unwrap(),
            vec![vec![3.0, 4.0, 5.0], vec![3.0, 4.0, 5.0]]
        );
        let hidden = hidden.to_vec3::<f32>().unwrap();
        assert_eq!(hidden[1][0], vec![3.0, 3.0]);
        assert_eq!(hidden[1][2], vec![5.0, 5.0]);
        assert_eq!(window.steps(), 5);
    }

    #[test]
    fn short_sequences_see_zero_prefix() {
        let mut window = TemporalWindow::zeros(4, 1, 1, &Device::Cpu).unwrap();
        push_steps(&mut window, &[7.0], None);
        let (_, distance) = window.ordered().unwrap();
        assert_eq!(distance.to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0, 0.0, 7.0]]);
    }

    #[test]
    fn masked_sequences_keep_their_last_real_steps() {
        let mut window = TemporalWindow::zeros(2, 2, 1, &Device::Cpu).unwrap();
        push_steps(&mut window, &[1.0, 2.0], Some(&[true, true]));
        push_steps(&mut window, &[3.0], Some(&[true, false]));
        assert_eq!(window.filled(), &[3, 2]);
        let (hidden, distance) = window.ordered().unwrap();
        assert_eq!(
            distance.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 3.0], vec![1.0, 2.0]]
        );
        let hidden = hidden.to_vec3::<f32>().unwrap();
        assert_eq!(hidden[1], vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn resuming_after_padding_is_rejected() {
        let mut window = TemporalWindow::zeros(2, 1, 1, &Device::Cpu).unwrap();
        push_steps(&mut window, &[1.0], Some(&[false]));
        let h = Tensor::full(1.0f32, (1, 1), &Device::Cpu).unwrap();
        let d = Tensor::full(1.0f32, 1, &Device::Cpu).unwrap();
        assert!(matches!(
            window.push(&h, &d, Some(&[true])),
            Err(PhaseError::InvalidInput { .. })
        ));
    }

    #[test]
    fn push_rejects_wrong_shapes() {
        let mut window = TemporalWindow::zeros(2, 2, 3, &Device::Cpu).unwrap();
        let h = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(window.push(&h, &d, None).is_err());
        assert_eq!(window.steps(), 0);
    }

    #[test]
    fn recency_weights_sum_to_one() {
        let d = Tensor::new(
            &[[0.0f32, 0.0, 0.0, 0.0], [0.9, 0.1, 0.5, 0.7], [1.0, 1.0, 1.0, 1.0]],
            &Device::Cpu,
        )
        .unwrap();
        let w = Reweighter::recency_weights(&d).unwrap().to_vec2::<f32>().unwrap();
        for row in &w {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        // All-zero distances: uniform weights.
        assert!(w[0].iter().all(|v| (v - 0.25).abs() < 1e-6));
        // Positive distances: later positions weigh more.
        assert!(w[2].windows(2).all(|p| p[0] < p[1]));
    }

    #[test]
    fn finalize_produces_conv_dim_representation() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let config = PhaseConfig::new(8, 12, 3, 4);
        let mut params = ParamBuilder::new(&var_map, &device, 9);
        let reweighter = Reweighter::new(&config, &mut params, "rw").unwrap();

        let mut window = TemporalWindow::zeros(3, 2, 12, &device).unwrap();
        push_steps(&mut window, &[0.3, -0.2], None);
        let out = reweighter.finalize(&window).unwrap();
        assert_eq!(out.representation.dims(), &[2, 12]);
        assert_eq!(out.weights.dims(), &[2, 3]);
        let values = out.representation.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn finalize_rejects_foreign_window() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let mut params = ParamBuilder::new(&var_map, &device, 9);
        let reweighter = Reweighter::new(&PhaseConfig::new(8, 12, 3, 4), &mut params, "rw").unwrap();
        let window = TemporalWindow::zeros(4, 2, 12, &device).unwrap();
        assert!(matches!(
            reweighter.finalize(&window),
            Err(PhaseError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn tiny_hidden_keeps_a_bottleneck_unit() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let mut params = ParamBuilder::new(&var_map, &device, 9);
        let reweighter = Reweighter::new(&PhaseConfig::new(2, 4, 2, 2), &mut params, "rw").unwrap();
        assert_eq!(reweighter.scale.weight().dims(), &[1, 4]);
    }
}
