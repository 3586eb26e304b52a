//! The PHASE cell: one time-aware, multi-scale recurrent step.
//!
//! ## Step
//!
//! ```text
//! z = kernel([x ‖ Δt]) + recurrent_kernel([h ‖ Δt])       width 4H + 2L
//! fm = ordered_gate(z[0..L], forward)                       forget master
//! im = ordered_gate(z[L..2L], backward)                     input master
//! f, i, o = σ(...), ĉ = tanh(...)                           each (L, H/L)
//! ω  = fm ⊗ im
//! C' = ω·(f·C + i·ĉ) + (fm − ω)·C + (im − ω)·ĉ
//! H' = o · tanh(C')
//! ```
//!
//! The elapsed time `Δt` enters both projections, so every gate can react
//! directly to how long ago the previous post was made.

use candle_core::{Device, Tensor, D};
use candle_nn::{Dropout, Linear, Module, ModuleT};
use phase_core::{PhaseConfig, PhaseError};

use crate::init::ParamBuilder;
use crate::map_candle;
use crate::ordered_gate::{ordered_gate, GateDirection};

/// Cell and hidden state carried from one step to the next, each `[B, H]`.
#[derive(Debug, Clone)]
pub struct CellState {
    pub cell: Tensor,
    pub hidden: Tensor,
}

impl CellState {
    /// All-zero state for `batch` sequences.
    pub fn zeros(batch: usize, hidden_dim: usize, device: &Device) -> Result<Self, PhaseError> {
        let zeros = Tensor::zeros((batch, hidden_dim), candle_core::DType::F32, device)
            .map_err(map_candle("cell state init"))?;
        Ok(Self {
            cell: zeros.clone(),
            hidden: zeros,
        })
    }
}

/// Everything one step produces.
#[derive(Debug, Clone)]
pub struct CellStep {
    /// `[B, H + 2L]`: new hidden state, forget master, input master.
    pub output: Tensor,
    /// New state for the next step.
    pub state: CellState,
    /// `[B, L]`, non-decreasing over levels.
    pub forget_master: Tensor,
    /// `[B, L]`, non-increasing over levels.
    pub input_master: Tensor,
}

impl CellStep {
    /// `1 − mean(forget_master)` per sequence, `[B]`, in `[0, 1]`.
    pub fn distance_forget(&self) -> candle_core::Result<Tensor> {
        self.forget_master.mean(D::Minus1)?.affine(-1.0, 1.0)
    }

    /// `mean(input_master)` per sequence, `[B]`, in `[0, 1]`.
    pub fn distance_input(&self) -> candle_core::Result<Tensor> {
        self.input_master.mean(D::Minus1)
    }
}

/// Single-step PHASE state transition.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_nn::VarMap;
/// use phase_core::PhaseConfig;
/// use phase_nn::cell::{CellState, PhaseCell};
/// use phase_nn::init::ParamBuilder;
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let mut params = ParamBuilder::new(&var_map, &device, 42);
/// let cell = PhaseCell::new(&PhaseConfig::new(8, 12, 3, 4), &mut params, "cell").unwrap();
///
/// let x = Tensor::ones((2, 8), candle_core::DType::F32, &device).unwrap();
/// let dt = Tensor::new(&[1.0f32, 0.0], &device).unwrap();
/// let state = CellState::zeros(2, 12, &device).unwrap();
/// let step = cell.step(&x, &state, &dt, false).unwrap();
/// assert_eq!(step.output.dims(), &[2, 12 + 2 * 4]);
/// assert_eq!(step.state.hidden.dims(), &[2, 12]);
/// ```
#[derive(Debug)]
pub struct PhaseCell {
    kernel: Linear,
    recurrent_kernel: Linear,
    dropconnect: Option<Dropout>,
    input_dim: usize,
    hidden_dim: usize,
    levels: usize,
    chunk_size: usize,
}

impl PhaseCell {
    /// Builds the input and recurrent projections.
    ///
    /// The input projection is Xavier-uniform, the recurrent projection
    /// orthogonal, both biases zero.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IndivisibleHidden`] if `hidden_dim % levels != 0`
    /// or any other validation error of [`PhaseConfig::validate`].
    pub fn new(config: &PhaseConfig, params: &mut ParamBuilder<'_>, prefix: &str) -> Result<Self, PhaseError> {
        config.validate()?;
        let width = config.gate_width();
        let kernel = params.xavier_linear(&format!("{prefix}.kernel"), config.input_dim + 1, width)?;
        let recurrent_kernel =
            params.orthogonal_linear(&format!("{prefix}.recurrent_kernel"), config.hidden_dim + 1, width)?;
        let dropconnect = (config.dropconnect > 0.0).then(|| Dropout::new(config.dropconnect));
        Ok(Self {
            kernel,
            recurrent_kernel,
            dropconnect,
            input_dim: config.input_dim,
            hidden_dim: config.hidden_dim,
            levels: config.levels,
            chunk_size: config.chunk_size(),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Advances every sequence of the batch by one step.
    ///
    /// `inputs` is `[B, input_dim]`, `interval` is `[B]` (non-negative
    /// elapsed time, not validated). `train` enables dropconnect.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::ShapeMismatch`] if any input disagrees with the
    /// configured widths or with the batch size of `inputs`.
    pub fn step(
        &self,
        inputs: &Tensor,
        state: &CellState,
        interval: &Tensor,
        train: bool,
    ) -> Result<CellStep, PhaseError> {
        let (batch, width) = inputs
            .dims2()
            .map_err(|_| PhaseError::shape("phase cell input", &[0, self.input_dim], inputs.dims()))?;
        if width != self.input_dim {
            return Err(PhaseError::shape("phase cell input", &[batch, self.input_dim], &[batch, width]));
        }
        for (context, tensor) in [("phase cell state", &state.cell), ("phase cell hidden", &state.hidden)] {
            if tensor.dims() != [batch, self.hidden_dim] {
                return Err(PhaseError::shape(context, &[batch, self.hidden_dim], tensor.dims()));
            }
        }
        if interval.dims() != [batch] {
            return Err(PhaseError::shape("phase cell interval", &[batch], interval.dims()));
        }
        self.step_inner(inputs, state, interval, train)
            .map_err(map_candle("phase cell step"))
    }

    fn step_inner(
        &self,
        inputs: &Tensor,
        state: &CellState,
        interval: &Tensor,
        train: bool,
    ) -> candle_core::Result<CellStep> {
        let batch = inputs.dim(0)?;
        let levels = self.levels;
        let interval = interval.unsqueeze(1)?;

        let mut x_out = self.kernel.forward(&Tensor::cat(&[inputs, &interval], 1)?)?;
        let mut h_out = self
            .recurrent_kernel
            .forward(&Tensor::cat(&[&state.hidden, &interval], 1)?)?;
        if let Some(dropconnect) = &self.dropconnect {
            x_out = dropconnect.forward_t(&x_out, train)?;
            h_out = dropconnect.forward_t(&h_out, train)?;
        }
        let z = (x_out + h_out)?;

        let forget_master = ordered_gate(&z.narrow(1, 0, levels)?, GateDirection::Forward)?;
        let input_master = ordered_gate(&z.narrow(1, levels, levels)?, GateDirection::Backward)?;

        let gates = z
            .narrow(1, 2 * levels, 4 * self.hidden_dim)?
            .reshape((batch, 4 * levels, self.chunk_size))?;
        let forget_gate = candle_nn::ops::sigmoid(&gates.narrow(1, 0, levels)?)?;
        let input_gate = candle_nn::ops::sigmoid(&gates.narrow(1, levels, levels)?)?;
        let output_gate = candle_nn::ops::sigmoid(&gates.narrow(1, 2 * levels, levels)?)?;
        let candidate = gates.narrow(1, 3 * levels, levels)?.tanh()?;

        let cell_prev = state.cell.reshape((batch, levels, self.chunk_size))?;
        let cell = blend_levels(
            &cell_prev,
            &forget_master.unsqueeze(2)?,
            &input_master.unsqueeze(2)?,
            &forget_gate,
            &input_gate,
            &candidate,
        )?;
        let hidden = (output_gate * cell.tanh()?)?;

        let cell = cell.reshape((batch, self.hidden_dim))?;
        let hidden = hidden.reshape((batch, self.hidden_dim))?;
        let output = Tensor::cat(&[&hidden, &forget_master, &input_master], 1)?;
        Ok(CellStep {
            output,
            state: CellState { cell, hidden },
            forget_master,
            input_master,
        })
    }
}

/// Master-gated cell update over `[B, L, H/L]` chunks.
///
/// `forget_master` and `input_master` are `[B, L, 1]` and broadcast over
/// each level's chunk:
/// `ω·(f·C + i·ĉ) + (fm − ω)·C + (im − ω)·ĉ` with `ω = fm·im`.
/// Where both masters are 1 this is the plain gated update `f·C + i·ĉ`.
pub fn blend_levels(
    cell_prev: &Tensor,
    forget_master: &Tensor,
    input_master: &Tensor,
    forget_gate: &Tensor,
    input_gate: &Tensor,
    candidate: &Tensor,
) -> candle_core::Result<Tensor> {
    let overlap = (forget_master * input_master)?;
    let gated = ((forget_gate * cell_prev)? + (input_gate * candidate)?)?;
    let kept = (forget_master - &overlap)?.broadcast_mul(cell_prev)?;
    let fresh = (input_master - &overlap)?.broadcast_mul(candidate)?;
    overlap.broadcast_mul(&gated)?.add(&kept)?.add(&fresh)
}
