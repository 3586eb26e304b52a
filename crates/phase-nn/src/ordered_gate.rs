//! Ordered master gates.
//!
//! A cumulative softmax over the level axis yields activations in `[0, 1]`
//! that are monotone across levels. Read forward, a level can only be kept
//! at least as strongly as every lower level; read backward, a level can
//! only be written at most as strongly as every lower level. This is what
//! nests the abstraction levels of the PHASE cell inside each other.

use candle_core::{Tensor, D};

/// Reading direction of an ordered gate over the level axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDirection {
    /// Non-decreasing left to right; last level equals 1.
    Forward,
    /// Non-increasing left to right; first level equals 1.
    Backward,
}

/// Applies the ordered-gate transform along the last axis of `scores`.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use phase_nn::{ordered_gate, GateDirection};
///
/// let scores = Tensor::new(&[[0.3f32, -1.0, 2.0, 0.5]], &Device::Cpu).unwrap();
/// let gate = ordered_gate(&scores, GateDirection::Forward).unwrap();
/// let values = gate.to_vec2::<f32>().unwrap();
/// assert!(values[0].windows(2).all(|w| w[0] <= w[1] + 1e-6));
/// assert!((values[0][3] - 1.0).abs() < 1e-5);
/// ```
pub fn ordered_gate(scores: &Tensor, direction: GateDirection) -> candle_core::Result<Tensor> {
    match direction {
        GateDirection::Forward => cumulative_softmax(scores),
        GateDirection::Backward => {
            let reversed = reverse_last(scores)?;
            reverse_last(&cumulative_softmax(&reversed)?)
        }
    }
}

fn cumulative_softmax(scores: &Tensor) -> candle_core::Result<Tensor> {
    candle_nn::ops::softmax(scores, D::Minus1)?.cumsum(D::Minus1)
}

/// Flips the last axis. `index_select` needs a contiguous source, and the
/// cell hands in column slices of a batched pre-activation.
fn reverse_last(t: &Tensor) -> candle_core::Result<Tensor> {
    let last = t.rank() - 1;
    let n = t.dim(last)?;
    let index: Vec<u32> = (0..n as u32).rev().collect();
    let index = Tensor::from_vec(index, n, t.device())?;
    t.contiguous()?.index_select(&index, last)
}
