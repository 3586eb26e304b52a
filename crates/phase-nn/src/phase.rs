//! PHASE sequence encoder.
//!
//! Runs the [`PhaseCell`] over a posting history in strict temporal order,
//! feeds every new hidden state into a [`TemporalWindow`], and collapses
//! the final window with the [`Reweighter`] into one vector per sequence.
//!
//! ## Padding
//!
//! With [`PaddingPolicy::Masked`] and per-sequence lengths, a sequence is
//! frozen once its real steps are exhausted: its state and window stop
//! changing and its distance trace records `0.0`. With
//! [`PaddingPolicy::Uniform`], or without lengths, every sequence runs the
//! full padded length.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use phase_core::{PaddingPolicy, PhaseConfig, PhaseError};

use crate::cell::{CellState, PhaseCell};
use crate::init::ParamBuilder;
use crate::window::{Reweighter, TemporalWindow};
use crate::{blend, map_candle, mask_column};

/// Output of one PHASE forward pass.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    /// `[B, conv_dim]`.
    pub representation: Tensor,
    /// Distance-forget trace `1 − mean(forget_master)`, `[T, B]`.
    pub distance: Tensor,
    /// Distance-input trace `mean(input_master)`, `[T, B]`.
    pub distance_input: Tensor,
    /// Recency weights of the final window, `[B, conv_size]`.
    pub recency_weights: Tensor,
}

/// Time-aware hierarchical sequence encoder.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::VarMap;
/// use phase_core::PhaseConfig;
/// use phase_nn::PhaseEncoder;
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let encoder = PhaseEncoder::new(&PhaseConfig::new(8, 12, 3, 4), &var_map, 42, &device).unwrap();
///
/// let features = Tensor::ones((2, 5, 8), DType::F32, &device).unwrap();
/// let intervals = Tensor::ones((2, 5), DType::F32, &device).unwrap();
/// let (representation, distance) = encoder.run(&features, &intervals).unwrap();
/// assert_eq!(representation.dims(), &[2, 12]);
/// assert_eq!(distance.dims(), &[5, 2]);
/// ```
#[derive(Debug)]
pub struct PhaseEncoder {
    config: PhaseConfig,
    cell: PhaseCell,
    reweighter: Reweighter,
}

impl PhaseEncoder {
    /// Builds an encoder whose parameters are registered in `var_map`
    /// under the `phase.` prefix, initialized from `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IndivisibleHidden`] if `hidden_dim % levels != 0`
    /// or any other validation error of [`PhaseConfig::validate`].
    pub fn new(
        config: &PhaseConfig,
        var_map: &VarMap,
        seed: u64,
        device: &Device,
    ) -> Result<Self, PhaseError> {
        let mut params = ParamBuilder::new(var_map, device, seed);
        Self::with_builder(config, &mut params, "phase")
    }

    /// Builds an encoder from a shared [`ParamBuilder`].
    ///
    /// # Errors
    ///
    /// Same as [`PhaseEncoder::new`].
    pub fn with_builder(
        config: &PhaseConfig,
        params: &mut ParamBuilder<'_>,
        prefix: &str,
    ) -> Result<Self, PhaseError> {
        config.validate()?;
        let cell = PhaseCell::new(config, params, &format!("{prefix}.cell"))?;
        let reweighter = Reweighter::new(config, params, &format!("{prefix}.reweight"))?;
        tracing::debug!(
            input_dim = config.input_dim,
            hidden_dim = config.hidden_dim,
            levels = config.levels,
            conv_size = config.conv_size,
            padding = ?config.padding,
            "built PHASE encoder"
        );
        Ok(Self {
            config: config.clone(),
            cell,
            reweighter,
        })
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    /// Width of the representation.
    pub fn output_dim(&self) -> usize {
        self.config.conv_dim()
    }

    /// Inference pass over the full padded length.
    ///
    /// Returns the representation `[B, conv_dim]` and the distance-forget
    /// trace `[T, B]`.
    ///
    /// # Errors
    ///
    /// Same as [`PhaseEncoder::forward`].
    pub fn run(&self, features: &Tensor, intervals: &Tensor) -> Result<(Tensor, Tensor), PhaseError> {
        let output = self.forward(features, intervals, None, false)?;
        Ok((output.representation, output.distance))
    }

    /// Encodes `features` `[B, T, input_dim]` with elapsed times
    /// `intervals` `[B, T]`.
    ///
    /// `lengths` gives the real length of each sequence; it only changes
    /// the result under [`PaddingPolicy::Masked`].
    ///
    /// # Errors
    ///
    /// - [`PhaseError::EmptyInput`] if the batch or time axis is empty.
    /// - [`PhaseError::ShapeMismatch`] if any input disagrees with the
    ///   configured width or with each other.
    /// - [`PhaseError::InvalidInput`] if a length exceeds `T`.
    pub fn forward(
        &self,
        features: &Tensor,
        intervals: &Tensor,
        lengths: Option<&[usize]>,
        train: bool,
    ) -> Result<PhaseOutput, PhaseError> {
        let (batch, time_steps) = self.check_inputs(features, intervals, lengths)?;
        tracing::trace!(batch, time_steps, train, "PHASE forward");

        let masked_lengths = match (self.config.padding, lengths) {
            (PaddingPolicy::Masked, Some(lengths)) if lengths.iter().any(|&l| l < time_steps) => {
                Some(lengths)
            }
            _ => None,
        };

        let device = features.device();
        let map_err = map_candle("phase forward");
        let mut state = CellState::zeros(batch, self.config.hidden_dim, device)?;
        let mut window =
            TemporalWindow::zeros(self.config.conv_size, batch, self.config.hidden_dim, device)?;
        let mut forget_trace = Vec::with_capacity(time_steps);
        let mut input_trace = Vec::with_capacity(time_steps);

        for t in 0..time_steps {
            let x = features.narrow(1, t, 1).and_then(|x| x.squeeze(1)).map_err(&map_err)?;
            let dt = intervals.narrow(1, t, 1).and_then(|d| d.squeeze(1)).map_err(&map_err)?;
            let step = self.cell.step(&x, &state, &dt, train)?;
            let mut distance = step.distance_forget().map_err(&map_err)?;
            let mut distance_input = step.distance_input().map_err(&map_err)?;

            match masked_lengths {
                None => {
                    window.push(&step.state.hidden, &distance, None)?;
                    state = step.state;
                }
                Some(lengths) => {
                    let active: Vec<bool> = lengths.iter().map(|&l| t < l).collect();
                    let mask = mask_column(&active, device).map_err(&map_err)?;
                    let flat = mask.squeeze(1).map_err(&map_err)?;
                    distance = (distance * &flat).map_err(&map_err)?;
                    distance_input = (distance_input * &flat).map_err(&map_err)?;
                    window.push(&step.state.hidden, &distance, Some(&active))?;
                    state = CellState {
                        cell: blend(&step.state.cell, &state.cell, &mask).map_err(&map_err)?,
                        hidden: blend(&step.state.hidden, &state.hidden, &mask).map_err(&map_err)?,
                    };
                }
            }
            forget_trace.push(distance);
            input_trace.push(distance_input);
        }

        let reweighted = self.reweighter.finalize(&window)?;
        Ok(PhaseOutput {
            representation: reweighted.representation,
            distance: Tensor::stack(&forget_trace, 0).map_err(&map_err)?,
            distance_input: Tensor::stack(&input_trace, 0).map_err(&map_err)?,
            recency_weights: reweighted.weights,
        })
    }

    fn check_inputs(
        &self,
        features: &Tensor,
        intervals: &Tensor,
        lengths: Option<&[usize]>,
    ) -> Result<(usize, usize), PhaseError> {
        let input_dim = self.config.input_dim;
        let (batch, time_steps, width) = features
            .dims3()
            .map_err(|_| PhaseError::shape("phase features", &[0, 0, input_dim], features.dims()))?;
        if batch == 0 {
            return Err(PhaseError::EmptyInput { context: "phase batch" });
        }
        if time_steps == 0 {
            return Err(PhaseError::EmptyInput { context: "phase time steps" });
        }
        if width != input_dim {
            return Err(PhaseError::shape(
                "phase features",
                &[batch, time_steps, input_dim],
                features.dims(),
            ));
        }
        if intervals.dims() != [batch, time_steps] {
            return Err(PhaseError::shape("phase intervals", &[batch, time_steps], intervals.dims()));
        }
        if let Some(lengths) = lengths {
            if lengths.len() != batch {
                return Err(PhaseError::shape("phase lengths", &[batch], &[lengths.len()]));
            }
            if let Some(&len) = lengths.iter().find(|&&l| l > time_steps) {
                return Err(PhaseError::InvalidInput {
                    message: format!("sequence length {len} exceeds {time_steps} time steps"),
                });
            }
            let empty = lengths.iter().filter(|&&l| l == 0).count();
            if empty > 0 {
                tracing::warn!(empty, batch, "sequences with no real steps encode the zero window");
            }
        }
        Ok((batch, time_steps))
    }
}
