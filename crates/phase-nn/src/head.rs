//! Risk classification heads.
//!
//! - [`HeadKind::HistoricCurrent`]: current post projected to the encoder
//!   width, concatenated with the encoded history, then
//!   `dropout → linear → relu → dropout → linear`.
//! - [`HeadKind::Historic`]: final states of a bidirectional LSTM only.
//! - [`HeadKind::Current`]: current post only.

use candle_core::{Device, Tensor, D};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarMap};
use phase_core::{HeadKind, ModelConfig, PhaseError, HEAD_BOTTLENECK_DIM};

use crate::encoder::{HistoricEncoder, HistoricInput, SequenceEncoder};
use crate::init::ParamBuilder;
use crate::lstm::BiLstm;
use crate::map_candle;
use crate::tensors::BatchTensors;

/// Logits of one batch, plus the PHASE distance trace when available.
#[derive(Debug, Clone)]
pub struct Classification {
    /// `[B, num_classes]`.
    pub logits: Tensor,
    /// `[T, B]`.
    pub distance: Option<Tensor>,
}

impl Classification {
    /// Softmax over classes, `[B, num_classes]`.
    pub fn probabilities(&self) -> Result<Tensor, PhaseError> {
        candle_nn::ops::softmax(&self.logits, D::Minus1).map_err(map_candle("probabilities"))
    }

    /// Arg-max class per sequence.
    pub fn predictions(&self) -> Result<Vec<u32>, PhaseError> {
        self.logits
            .argmax(D::Minus1)
            .and_then(|p| p.to_vec1::<u32>())
            .map_err(map_candle("predictions"))
    }
}

fn dropout(p: f32) -> Option<Dropout> {
    (p > 0.0).then(|| Dropout::new(p))
}

fn apply_dropout(dropout: &Option<Dropout>, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
    match dropout {
        Some(d) => d.forward_t(x, train),
        None => Ok(x.clone()),
    }
}

/// Fusion of the current post with the encoded history.
#[derive(Debug)]
pub struct HistoricCurrentHead {
    encoder: HistoricEncoder,
    current: Linear,
    concat: Linear,
    output: Linear,
    dropout: Option<Dropout>,
}

impl HistoricCurrentHead {
    /// # Errors
    ///
    /// Returns the construction error of the selected encoder.
    pub fn new(config: &ModelConfig, params: &mut ParamBuilder<'_>) -> Result<Self, PhaseError> {
        let encoder = HistoricEncoder::from_config(config, params, "historic")?;
        let width = encoder.output_dim();
        Ok(Self {
            current: params.linear("head.current", config.current_dim, width)?,
            concat: params.linear("head.concat", 2 * width, config.hidden_dim)?,
            output: params.linear("head.output", config.hidden_dim, config.num_classes)?,
            dropout: dropout(config.dropout),
            encoder,
        })
    }

    pub fn encoder(&self) -> &HistoricEncoder {
        &self.encoder
    }

    fn forward(&self, batch: &BatchTensors, train: bool) -> Result<Classification, PhaseError> {
        let encoded = self.encoder.encode(&HistoricInput::from_batch(batch), train)?;
        let logits = self
            .fuse(&batch.current, &encoded.representation, train)
            .map_err(map_candle("fusion head"))?;
        Ok(Classification {
            logits,
            distance: encoded.distance,
        })
    }

    fn fuse(&self, current: &Tensor, historic: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let current = self.current.forward(current)?.relu()?;
        let combined = Tensor::cat(&[&current, historic], 1)?;
        let combined = apply_dropout(&self.dropout, &combined, train)?;
        let x = self.concat.forward(&combined)?.relu()?;
        let x = apply_dropout(&self.dropout, &x, train)?;
        self.output.forward(&x)
    }
}

/// History-only head over the final bidirectional LSTM states.
#[derive(Debug)]
pub struct HistoricHead {
    lstm: BiLstm,
    hidden: Linear,
    output: Linear,
}

impl HistoricHead {
    /// # Errors
    ///
    /// Same as [`BiLstm::new`].
    pub fn new(config: &ModelConfig, params: &mut ParamBuilder<'_>) -> Result<Self, PhaseError> {
        Ok(Self {
            lstm: BiLstm::new(
                params,
                "historic.lstm",
                config.embedding_dim,
                config.hidden_dim,
                config.num_layers,
                config.dropout,
            )?,
            hidden: params.linear("head.hidden", config.hidden_dim, HEAD_BOTTLENECK_DIM)?,
            output: params.linear("head.output", HEAD_BOTTLENECK_DIM, config.num_classes)?,
        })
    }

    fn forward(&self, batch: &BatchTensors, train: bool) -> Result<Classification, PhaseError> {
        let output = self.lstm.forward(&batch.history, Some(&batch.lengths), train)?;
        let logits = Tensor::cat(&[&output.final_forward, &output.final_backward], 1)
            .and_then(|h| self.hidden.forward(&h))
            .and_then(|h| h.relu())
            .and_then(|h| self.output.forward(&h))
            .map_err(map_candle("historic head"))?;
        Ok(Classification {
            logits,
            distance: None,
        })
    }
}

/// Current-post-only head.
#[derive(Debug)]
pub struct CurrentHead {
    hidden: Linear,
    bottleneck: Linear,
    output: Linear,
    dropout: Option<Dropout>,
}

impl CurrentHead {
    /// # Errors
    ///
    /// Returns [`PhaseError::Internal`] if a parameter name is taken.
    pub fn new(config: &ModelConfig, params: &mut ParamBuilder<'_>) -> Result<Self, PhaseError> {
        Ok(Self {
            hidden: params.linear("head.hidden", config.current_dim, config.hidden_dim)?,
            bottleneck: params.linear("head.bottleneck", config.hidden_dim, HEAD_BOTTLENECK_DIM)?,
            output: params.linear("head.output", HEAD_BOTTLENECK_DIM, config.num_classes)?,
            dropout: dropout(config.dropout),
        })
    }

    fn forward(&self, batch: &BatchTensors, train: bool) -> Result<Classification, PhaseError> {
        let logits = self
            .forward_inner(&batch.current, train)
            .map_err(map_candle("current head"))?;
        Ok(Classification {
            logits,
            distance: None,
        })
    }

    fn forward_inner(&self, current: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = self.hidden.forward(current)?.relu()?;
        let x = apply_dropout(&self.dropout, &x, train)?;
        let x = self.bottleneck.forward(&x)?.relu()?;
        self.output.forward(&x)
    }
}

/// One of the three heads.
#[derive(Debug)]
pub enum ClassifierHead {
    HistoricCurrent(HistoricCurrentHead),
    Historic(HistoricHead),
    Current(CurrentHead),
}

/// End-to-end risk classifier configured by a [`ModelConfig`].
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use candle_nn::VarMap;
/// use phase_core::{collate, ModelConfig, Sample};
/// use phase_nn::{BatchTensors, RiskClassifier};
///
/// let config = ModelConfig {
///     embedding_dim: 8,
///     current_dim: 8,
///     hidden_dim: 12,
///     conv_size: 3,
///     ..ModelConfig::default()
/// };
/// let var_map = VarMap::new();
/// let classifier = RiskClassifier::new(&config, &var_map, &Device::Cpu).unwrap();
///
/// let samples = vec![Sample {
///     label: 1,
///     current: vec![0.2; 8],
///     history: vec![vec![0.1; 8]; 3],
///     intervals: vec![0.0, 1.0, 4.0],
/// }];
/// let batch = BatchTensors::from_padded(&collate(&samples).unwrap(), &Device::Cpu).unwrap();
/// let out = classifier.classify(&batch).unwrap();
/// assert_eq!(out.logits.dims(), &[1, 2]);
/// assert_eq!(out.distance.unwrap().dims(), &[3, 1]);
/// ```
#[derive(Debug)]
pub struct RiskClassifier {
    config: ModelConfig,
    head: ClassifierHead,
}

impl RiskClassifier {
    /// Validates `config` and builds the selected head, registering every
    /// parameter in `var_map` (seeded by `config.seed`).
    ///
    /// # Errors
    ///
    /// Returns any error of [`ModelConfig::validate`] or of the selected
    /// head's construction.
    pub fn new(config: &ModelConfig, var_map: &VarMap, device: &Device) -> Result<Self, PhaseError> {
        config.validate()?;
        let mut params = ParamBuilder::new(var_map, device, config.seed);
        let head = match config.head {
            HeadKind::HistoricCurrent => {
                ClassifierHead::HistoricCurrent(HistoricCurrentHead::new(config, &mut params)?)
            }
            HeadKind::Historic => ClassifierHead::Historic(HistoricHead::new(config, &mut params)?),
            HeadKind::Current => ClassifierHead::Current(CurrentHead::new(config, &mut params)?),
        };
        tracing::debug!(
            head = ?config.head,
            model = config.model.label(),
            hidden_dim = config.hidden_dim,
            num_classes = config.num_classes,
            "built risk classifier"
        );
        Ok(Self {
            config: config.clone(),
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    /// Classifies one batch. `train` enables dropout and dropconnect.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::ShapeMismatch`] if the batch widths differ from
    /// the configured ones, or any encoder error.
    pub fn forward(&self, batch: &BatchTensors, train: bool) -> Result<Classification, PhaseError> {
        let b = batch.batch_size();
        if batch.current.dims() != [b, self.config.current_dim] {
            return Err(PhaseError::shape(
                "classifier current",
                &[b, self.config.current_dim],
                batch.current.dims(),
            ));
        }
        match &self.head {
            ClassifierHead::HistoricCurrent(head) => head.forward(batch, train),
            ClassifierHead::Historic(head) => head.forward(batch, train),
            ClassifierHead::Current(head) => head.forward(batch, train),
        }
    }

    /// Inference pass.
    ///
    /// # Errors
    ///
    /// Same as [`RiskClassifier::forward`].
    pub fn classify(&self, batch: &BatchTensors) -> Result<Classification, PhaseError> {
        self.forward(batch, false)
    }
}
