//! Length-aware stacked bidirectional LSTM.
//!
//! Gate order is input, forget, candidate, output. With per-sequence
//! lengths, padded steps neither advance the state nor produce output
//! (their output rows are zero), and the backward direction starts at each
//! sequence's last real step.

use candle_core::{DType, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT};
use phase_core::PhaseError;

use crate::init::ParamBuilder;
use crate::{blend, map_candle, mask_column};

/// Output of a [`BiLstm`] pass.
#[derive(Debug, Clone)]
pub struct BiLstmOutput {
    /// `[B, T, 2h]`, forward and backward outputs of the last layer.
    pub outputs: Tensor,
    /// `[B, h]`, forward state after the last real step.
    pub final_forward: Tensor,
    /// `[B, h]`, backward state after the first step.
    pub final_backward: Tensor,
}

#[derive(Debug)]
struct LstmDirection {
    input: Linear,
    recurrent: Linear,
    hidden: usize,
}

impl LstmDirection {
    fn new(params: &mut ParamBuilder<'_>, prefix: &str, input_dim: usize, hidden: usize) -> Result<Self, PhaseError> {
        let bound = 1.0 / (hidden as f32).sqrt();
        Ok(Self {
            input: params.uniform_linear(&format!("{prefix}.ih"), input_dim, 4 * hidden, bound)?,
            recurrent: params.uniform_linear(&format!("{prefix}.hh"), hidden, 4 * hidden, bound)?,
            hidden,
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let n = self.hidden;
        let gates = (self.input.forward(x)? + self.recurrent.forward(h)?)?;
        let i = candle_nn::ops::sigmoid(&gates.narrow(1, 0, n)?)?;
        let f = candle_nn::ops::sigmoid(&gates.narrow(1, n, n)?)?;
        let g = gates.narrow(1, 2 * n, n)?.tanh()?;
        let o = candle_nn::ops::sigmoid(&gates.narrow(1, 3 * n, n)?)?;
        let c = ((f * c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok((h, c))
    }

    /// Runs over `x` `[B, T, D]`; returns per-step outputs in time order
    /// and the final hidden state.
    fn run(
        &self,
        x: &Tensor,
        masks: Option<&[Tensor]>,
        reverse: bool,
    ) -> candle_core::Result<(Vec<Tensor>, Tensor)> {
        let (batch, time_steps, _) = x.dims3()?;
        let mut h = Tensor::zeros((batch, self.hidden), DType::F32, x.device())?;
        let mut c = h.clone();
        let mut outputs = Vec::with_capacity(time_steps);
        for step in 0..time_steps {
            let t = if reverse { time_steps - 1 - step } else { step };
            let xt = x.narrow(1, t, 1)?.squeeze(1)?;
            let (h_new, c_new) = self.step(&xt, &h, &c)?;
            match masks {
                Some(masks) => {
                    let mask = &masks[t];
                    outputs.push(h_new.broadcast_mul(mask)?);
                    h = blend(&h_new, &h, mask)?;
                    c = blend(&c_new, &c, mask)?;
                }
                None => {
                    outputs.push(h_new.clone());
                    h = h_new;
                    c = c_new;
                }
            }
        }
        if reverse {
            outputs.reverse();
        }
        Ok((outputs, h))
    }
}

/// Stacked bidirectional LSTM with `hidden_dim / 2` units per direction.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::VarMap;
/// use phase_nn::init::ParamBuilder;
/// use phase_nn::lstm::BiLstm;
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let mut params = ParamBuilder::new(&var_map, &device, 1);
/// let lstm = BiLstm::new(&mut params, "lstm", 6, 8, 2, 0.0).unwrap();
///
/// let x = Tensor::ones((3, 4, 6), DType::F32, &device).unwrap();
/// let out = lstm.forward(&x, Some(&[4, 2, 1]), false).unwrap();
/// assert_eq!(out.outputs.dims(), &[3, 4, 8]);
/// assert_eq!(out.final_forward.dims(), &[3, 4]);
/// ```
#[derive(Debug)]
pub struct BiLstm {
    layers: Vec<(LstmDirection, LstmDirection)>,
    dropout: Option<Dropout>,
    input_dim: usize,
    direction_dim: usize,
}

impl BiLstm {
    /// Builds `num_layers` bidirectional layers. `dropout` is applied to
    /// the input and between layers in training mode.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidConfig`] if `hidden_dim` is odd or zero,
    /// or `num_layers` or `input_dim` is zero.
    pub fn new(
        params: &mut ParamBuilder<'_>,
        prefix: &str,
        input_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        dropout: f32,
    ) -> Result<Self, PhaseError> {
        if hidden_dim < 2 || hidden_dim % 2 != 0 {
            return Err(PhaseError::InvalidConfig {
                field: "hidden_dim",
                reason: format!("bidirectional encoders need an even hidden_dim >= 2, got {hidden_dim}"),
            });
        }
        if num_layers == 0 || input_dim == 0 {
            return Err(PhaseError::InvalidConfig {
                field: if num_layers == 0 { "num_layers" } else { "embedding_dim" },
                reason: "must be greater than zero".to_string(),
            });
        }
        let direction_dim = hidden_dim / 2;
        let mut layers = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let width = if layer == 0 { input_dim } else { hidden_dim };
            layers.push((
                LstmDirection::new(params, &format!("{prefix}.l{layer}.fwd"), width, direction_dim)?,
                LstmDirection::new(params, &format!("{prefix}.l{layer}.bwd"), width, direction_dim)?,
            ));
        }
        Ok(Self {
            layers,
            dropout: (dropout > 0.0).then(|| Dropout::new(dropout)),
            input_dim,
            direction_dim,
        })
    }

    /// Units per direction.
    pub fn direction_dim(&self) -> usize {
        self.direction_dim
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encodes `features` `[B, T, input_dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::EmptyInput`] for an empty batch or time axis,
    /// [`PhaseError::ShapeMismatch`] for a wrong width or lengths count, and
    /// [`PhaseError::InvalidInput`] if a length exceeds `T`.
    pub fn forward(
        &self,
        features: &Tensor,
        lengths: Option<&[usize]>,
        train: bool,
    ) -> Result<BiLstmOutput, PhaseError> {
        let (batch, time_steps, width) = features
            .dims3()
            .map_err(|_| PhaseError::shape("lstm features", &[0, 0, self.input_dim], features.dims()))?;
        if batch == 0 || time_steps == 0 {
            return Err(PhaseError::EmptyInput { context: "lstm features" });
        }
        if width != self.input_dim {
            return Err(PhaseError::shape(
                "lstm features",
                &[batch, time_steps, self.input_dim],
                features.dims(),
            ));
        }
        if let Some(lengths) = lengths {
            if lengths.len() != batch {
                return Err(PhaseError::shape("lstm lengths", &[batch], &[lengths.len()]));
            }
            if let Some(&len) = lengths.iter().find(|&&l| l > time_steps) {
                return Err(PhaseError::InvalidInput {
                    message: format!("sequence length {len} exceeds {time_steps} time steps"),
                });
            }
        }
        tracing::trace!(batch, time_steps, layers = self.layers.len(), "bilstm forward");
        self.forward_inner(features, lengths, train)
            .map_err(map_candle("lstm forward"))
    }

    fn forward_inner(
        &self,
        features: &Tensor,
        lengths: Option<&[usize]>,
        train: bool,
    ) -> candle_core::Result<BiLstmOutput> {
        let time_steps = features.dim(1)?;
        let masks = match lengths {
            Some(lengths) if lengths.iter().any(|&l| l < time_steps) => Some(
                (0..time_steps)
                    .map(|t| {
                        let active: Vec<bool> = lengths.iter().map(|&l| t < l).collect();
                        mask_column(&active, features.device())
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?,
            ),
            _ => None,
        };

        let mut x = self.apply_dropout(features, train)?;
        let mut finals = None;
        for (index, (forward, backward)) in self.layers.iter().enumerate() {
            if index > 0 {
                x = self.apply_dropout(&x, train)?;
            }
            let (fwd_out, fwd_h) = forward.run(&x, masks.as_deref(), false)?;
            let (bwd_out, bwd_h) = backward.run(&x, masks.as_deref(), true)?;
            let fwd = Tensor::stack(&fwd_out, 1)?;
            let bwd = Tensor::stack(&bwd_out, 1)?;
            x = Tensor::cat(&[&fwd, &bwd], 2)?;
            finals = Some((fwd_h, bwd_h));
        }
        let (final_forward, final_backward) = finals.ok_or_else(|| {
            candle_core::Error::Msg("bidirectional LSTM has no layers".to_string())
        })?;
        Ok(BiLstmOutput {
            outputs: x,
            final_forward,
            final_backward,
        })
    }

    fn apply_dropout(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match &self.dropout {
            Some(dropout) => dropout.forward_t(x, train),
            None => Ok(x.clone()),
        }
    }
}
