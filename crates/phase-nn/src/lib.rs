//! # phase-nn
//!
//! Neural encoders and risk heads for the PHASE classifier, built on candle.
//!
//! The historic posting sequence of a user is encoded into one fixed-size
//! vector and fused with the embedding of their current post:
//!
//! - **Ordered gates**: cumulative softmax over abstraction levels
//!   ([`ordered_gate`])
//! - **Cell**: one time-aware multi-scale recurrent step ([`cell::PhaseCell`])
//! - **Window**: ring buffer of recent hidden states and distance-weighted
//!   temporal convolution ([`window::TemporalWindow`], [`window::Reweighter`])
//! - **Sequence**: the time loop tying them together ([`phase::PhaseEncoder`])
//!
//! Alternative encoders ([`lstm::BiLstm`] based) and the classification
//! heads ([`head::RiskClassifier`]) share the fixed-size-vector contract of
//! [`encoder::SequenceEncoder`].
//!
//! ## Architecture Rules
//!
//! - Constructors take an explicit [`candle_core::Device`]; forward passes run
//!   on the device of their inputs.
//! - Parameters are registered in a [`candle_nn::VarMap`] so an external
//!   trainer can optimize them; nothing here mutates them.
//! - Configuration errors fail at construction, shape errors fail before any
//!   tensor math.

pub use phase_core;

pub mod cell;
pub mod encoder;
pub mod head;
pub mod init;
pub mod lstm;
pub mod ordered_gate;
pub mod phase;
pub mod tensors;
pub mod window;

pub use cell::{CellState, CellStep, PhaseCell};
pub use encoder::{
    BiLstmAttentionEncoder, BiLstmEncoder, EncodedHistory, HistoricEncoder, HistoricInput,
    SequenceEncoder,
};
pub use head::{Classification, ClassifierHead, RiskClassifier};
pub use init::{ParamBuilder, SimpleRng};
pub use lstm::{BiLstm, BiLstmOutput};
pub use ordered_gate::{ordered_gate, GateDirection};
pub use phase::{PhaseEncoder, PhaseOutput};
pub use tensors::BatchTensors;
pub use window::{Reweighted, Reweighter, TemporalWindow};

use phase_core::PhaseError;

/// Wraps a candle error with the name of the failing operation.
pub(crate) fn map_candle(context: &'static str) -> impl Fn(candle_core::Error) -> PhaseError {
    move |e| PhaseError::Tensor {
        context,
        message: e.to_string(),
    }
}

/// Builds a `[batch, 1]` float mask that is 1 where `active` is set.
pub(crate) fn mask_column(
    active: &[bool],
    device: &candle_core::Device,
) -> candle_core::Result<candle_core::Tensor> {
    let values: Vec<f32> = active.iter().map(|&a| if a { 1.0 } else { 0.0 }).collect();
    candle_core::Tensor::from_vec(values, (active.len(), 1), device)
}

/// `new · mask + old · (1 − mask)` with `mask` broadcast over trailing dims.
pub(crate) fn blend(
    new: &candle_core::Tensor,
    old: &candle_core::Tensor,
    mask: &candle_core::Tensor,
) -> candle_core::Result<candle_core::Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    new.broadcast_mul(mask)?.add(&old.broadcast_mul(&keep)?)
}
