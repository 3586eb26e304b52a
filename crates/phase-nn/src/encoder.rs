//! Historic encoders behind one fixed-size-vector contract.
//!
//! Every encoder turns a padded history `[B, T, D]` into one vector per
//! sequence. The variant is chosen once, at construction, from
//! [`EncoderKind`].

use candle_core::{Tensor, D};
use phase_core::{EncoderKind, ModelConfig, PhaseError};

use crate::init::ParamBuilder;
use crate::lstm::BiLstm;
use crate::map_candle;
use crate::phase::PhaseEncoder;
use crate::tensors::BatchTensors;

/// Score added to attention logits of padded steps.
const MASKED_SCORE: f32 = -1e9;

/// Borrowed view of a padded history.
#[derive(Debug, Clone, Copy)]
pub struct HistoricInput<'a> {
    /// `[B, T, D]`.
    pub features: &'a Tensor,
    /// `[B, T]` elapsed time before each step.
    pub intervals: &'a Tensor,
    /// Real length of each sequence; `None` means all of `T`.
    pub lengths: Option<&'a [usize]>,
}

impl<'a> HistoricInput<'a> {
    pub fn from_batch(batch: &'a BatchTensors) -> Self {
        Self {
            features: &batch.history,
            intervals: &batch.intervals,
            lengths: Some(&batch.lengths),
        }
    }
}

/// Encoded history.
#[derive(Debug, Clone)]
pub struct EncodedHistory {
    /// `[B, output_dim]`.
    pub representation: Tensor,
    /// `[T, B]` distance-forget trace, PHASE only.
    pub distance: Option<Tensor>,
}

/// Maps a padded history to one vector per sequence.
pub trait SequenceEncoder {
    /// Width of the representation.
    fn output_dim(&self) -> usize;

    /// Encodes `input`. `train` enables the encoder's regularization.
    fn encode(&self, input: &HistoricInput<'_>, train: bool) -> Result<EncodedHistory, PhaseError>;
}

impl SequenceEncoder for PhaseEncoder {
    fn output_dim(&self) -> usize {
        PhaseEncoder::output_dim(self)
    }

    fn encode(&self, input: &HistoricInput<'_>, train: bool) -> Result<EncodedHistory, PhaseError> {
        let output = self.forward(input.features, input.intervals, input.lengths, train)?;
        Ok(EncodedHistory {
            representation: output.representation,
            distance: Some(output.distance),
        })
    }
}

/// Bidirectional LSTM pooled by the mean over real steps. Width `H`.
#[derive(Debug)]
pub struct BiLstmEncoder {
    lstm: BiLstm,
}

impl BiLstmEncoder {
    /// # Errors
    ///
    /// Same as [`BiLstm::new`].
    pub fn new(config: &ModelConfig, params: &mut ParamBuilder<'_>, prefix: &str) -> Result<Self, PhaseError> {
        Ok(Self {
            lstm: BiLstm::new(
                params,
                &format!("{prefix}.lstm"),
                config.embedding_dim,
                config.hidden_dim,
                config.num_layers,
                config.dropout,
            )?,
        })
    }
}

impl SequenceEncoder for BiLstmEncoder {
    fn output_dim(&self) -> usize {
        2 * self.lstm.direction_dim()
    }

    fn encode(&self, input: &HistoricInput<'_>, train: bool) -> Result<EncodedHistory, PhaseError> {
        let output = self.lstm.forward(input.features, input.lengths, train)?;
        let representation = masked_mean(&output.outputs, input.lengths)
            .map_err(map_candle("bilstm pooling"))?;
        Ok(EncodedHistory {
            representation,
            distance: None,
        })
    }
}

/// Mean over the time axis of `[B, T, F]`, counting only real steps.
/// Padded rows are already zero; a zero length yields a zero vector.
fn masked_mean(outputs: &Tensor, lengths: Option<&[usize]>) -> candle_core::Result<Tensor> {
    match lengths {
        None => outputs.mean(1),
        Some(lengths) => {
            let counts: Vec<f32> = lengths.iter().map(|&l| l.max(1) as f32).collect();
            let counts = Tensor::from_vec(counts, (lengths.len(), 1), outputs.device())?;
            outputs.sum(1)?.broadcast_div(&counts)
        }
    }
}

/// Bidirectional LSTM pooled by dot-product attention. Width `H / 2`.
///
/// The forward and backward outputs are summed per step; the summed final
/// states of both directions act as the query.
#[derive(Debug)]
pub struct BiLstmAttentionEncoder {
    lstm: BiLstm,
}

impl BiLstmAttentionEncoder {
    /// # Errors
    ///
    /// Same as [`BiLstm::new`].
    pub fn new(config: &ModelConfig, params: &mut ParamBuilder<'_>, prefix: &str) -> Result<Self, PhaseError> {
        Ok(Self {
            lstm: BiLstm::new(
                params,
                &format!("{prefix}.lstm"),
                config.embedding_dim,
                config.hidden_dim,
                config.num_layers,
                config.dropout,
            )?,
        })
    }

    fn attend(
        &self,
        outputs: &Tensor,
        query: &Tensor,
        lengths: Option<&[usize]>,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let (batch, time_steps, _) = outputs.dims3()?;
        let h = self.lstm.direction_dim();
        let summed = (outputs.narrow(2, 0, h)? + outputs.narrow(2, h, h)?)?;
        let mut scores = summed.matmul(&query.unsqueeze(2)?)?.squeeze(2)?;
        if let Some(lengths) = lengths {
            let bias: Vec<f32> = lengths
                .iter()
                .flat_map(|&l| (0..time_steps).map(move |t| if t < l { 0.0 } else { MASKED_SCORE }))
                .collect();
            scores = (scores + Tensor::from_vec(bias, (batch, time_steps), outputs.device())?)?;
        }
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let pooled = summed
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&weights.unsqueeze(2)?)?
            .squeeze(2)?;
        Ok((pooled, weights))
    }
}

impl SequenceEncoder for BiLstmAttentionEncoder {
    fn output_dim(&self) -> usize {
        self.lstm.direction_dim()
    }

    fn encode(&self, input: &HistoricInput<'_>, train: bool) -> Result<EncodedHistory, PhaseError> {
        let output = self.lstm.forward(input.features, input.lengths, train)?;
        let query = (&output.final_forward + &output.final_backward)
            .map_err(map_candle("bilstm attention query"))?;
        let (representation, _) = self
            .attend(&output.outputs, &query, input.lengths)
            .map_err(map_candle("bilstm attention"))?;
        Ok(EncodedHistory {
            representation,
            distance: None,
        })
    }
}

/// The historic encoder selected by [`EncoderKind`].
#[derive(Debug)]
pub enum HistoricEncoder {
    Phase(PhaseEncoder),
    BiLstm(BiLstmEncoder),
    BiLstmAttention(BiLstmAttentionEncoder),
}

impl HistoricEncoder {
    /// Builds the encoder named by `config.model`.
    ///
    /// # Errors
    ///
    /// Returns the construction error of the selected encoder.
    pub fn from_config(
        config: &ModelConfig,
        params: &mut ParamBuilder<'_>,
        prefix: &str,
    ) -> Result<Self, PhaseError> {
        Ok(match config.model {
            EncoderKind::Phase => {
                Self::Phase(PhaseEncoder::with_builder(&config.phase_config(), params, prefix)?)
            }
            EncoderKind::BiLstm => Self::BiLstm(BiLstmEncoder::new(config, params, prefix)?),
            EncoderKind::BiLstmAttention => {
                Self::BiLstmAttention(BiLstmAttentionEncoder::new(config, params, prefix)?)
            }
        })
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Phase(_) => EncoderKind::Phase,
            Self::BiLstm(_) => EncoderKind::BiLstm,
            Self::BiLstmAttention(_) => EncoderKind::BiLstmAttention,
        }
    }

    fn inner(&self) -> &dyn SequenceEncoder {
        match self {
            Self::Phase(e) => e,
            Self::BiLstm(e) => e,
            Self::BiLstmAttention(e) => e,
        }
    }
}

impl SequenceEncoder for HistoricEncoder {
    fn output_dim(&self) -> usize {
        self.inner().output_dim()
    }

    fn encode(&self, input: &HistoricInput<'_>, train: bool) -> Result<EncodedHistory, PhaseError> {
        self.inner().encode(input, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(model: EncoderKind) -> ModelConfig {
        ModelConfig {
            embedding_dim: 6,
            current_dim: 6,
            hidden_dim: 12,
            levels: 4,
            conv_size: 3,
            dropout: 0.0,
            dropconnect: 0.0,
            model,
            ..ModelConfig::default()
        }
    }

    fn build(model: EncoderKind, var_map: &VarMap) -> HistoricEncoder {
        let mut params = ParamBuilder::new(var_map, &Device::Cpu, 8);
        HistoricEncoder::from_config(&config(model), &mut params, "historic").unwrap()
    }

    fn history() -> (Tensor, Tensor) {
        let values: Vec<f32> = (0..2 * 4 * 6).map(|i| ((i % 5) as f32 - 2.0) * 0.3).collect();
        let features = Tensor::from_vec(values, (2, 4, 6), &Device::Cpu).unwrap();
        let intervals = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        (features, intervals)
    }

    #[test]
    fn output_widths_follow_the_variant() {
        let (features, intervals) = history();
        let input = HistoricInput {
            features: &features,
            intervals: &intervals,
            lengths: Some(&[4, 2]),
        };
        for (model, width) in [
            (EncoderKind::Phase, 12),
            (EncoderKind::BiLstm, 12),
            (EncoderKind::BiLstmAttention, 6),
        ] {
            let var_map = VarMap::new();
            let encoder = build(model, &var_map);
            assert_eq!(encoder.kind(), model);
            assert_eq!(encoder.output_dim(), width);
            let encoded = encoder.encode(&input, false).unwrap();
            assert_eq!(encoded.representation.dims(), &[2, width]);
            assert_eq!(encoded.distance.is_some(), model == EncoderKind::Phase);
        }
    }

    #[test]
    fn masked_mean_ignores_padding() {
        let outputs = Tensor::new(
            &[[[2.0f32], [4.0], [0.0]], [[6.0], [0.0], [0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let pooled = masked_mean(&outputs, Some(&[2, 1])).unwrap();
        assert_eq!(pooled.to_vec2::<f32>().unwrap(), vec![vec![3.0], vec![6.0]]);
        let empty = Tensor::zeros((1, 3, 1), DType::F32, &Device::Cpu).unwrap();
        let zero = masked_mean(&empty, Some(&[0])).unwrap();
        assert_eq!(zero.to_vec2::<f32>().unwrap(), vec![vec![0.0]]);
    }

    #[test]
    fn attention_weights_skip_padded_steps() {
        let var_map = VarMap::new();
        let HistoricEncoder::BiLstmAttention(encoder) = build(EncoderKind::BiLstmAttention, &var_map) else {
            panic!("expected attention encoder");
        };
        let (features, _) = history();
        let lengths = [4, 2];
        let output = encoder.lstm.forward(&features, Some(&lengths), false).unwrap();
        let query = (&output.final_forward + &output.final_backward).unwrap();
        let (_, weights) = encoder.attend(&output.outputs, &query, Some(&lengths)).unwrap();
        let weights = weights.to_vec2::<f32>().unwrap();
        assert!((weights[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((weights[1][0] + weights[1][1] - 1.0).abs() < 1e-5);
        assert!(weights[1][2] < 1e-6 && weights[1][3] < 1e-6);
    }

    #[test]
    fn indivisible_phase_config_fails() {
        let var_map = VarMap::new();
        let mut params = ParamBuilder::new(&var_map, &Device::Cpu, 8);
        let bad = ModelConfig {
            hidden_dim: 10,
            ..config(EncoderKind::Phase)
        };
        assert!(matches!(
            HistoricEncoder::from_config(&bad, &mut params, "historic"),
            Err(PhaseError::IndivisibleHidden { .. })
        ));
    }
}
