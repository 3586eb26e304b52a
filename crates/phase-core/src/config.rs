//! Construction-time configuration for encoders and heads.
//!
//! [`ModelConfig`] is the user-facing configuration (JSON via serde).
//! [`PhaseConfig`] is the narrower view consumed by the PHASE encoder and
//! can also be built directly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PhaseError;
use crate::{EMBEDDING_DIM, NUM_CLASSES};

/// Which historic-sequence encoder to instantiate.
///
/// Selected once at construction; never branched on per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderKind {
    /// Time-aware multi-scale recurrent encoder with windowed re-weighting.
    #[default]
    Phase,
    /// Bidirectional LSTM, mean-pooled over real steps.
    #[serde(rename = "bilstm")]
    BiLstm,
    /// Bidirectional LSTM with dot-product attention pooling.
    #[serde(rename = "bilstm-attention")]
    BiLstmAttention,
}

impl EncoderKind {
    /// Returns the configuration label for this encoder.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Phase => "phase",
            Self::BiLstm => "bilstm",
            Self::BiLstmAttention => "bilstm-attention",
        }
    }
}

/// Which classification head to build on top of the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadKind {
    /// Current post fused with the encoded history.
    #[default]
    HistoricCurrent,
    /// History only (bidirectional LSTM final states).
    Historic,
    /// Current post only.
    Current,
}

/// How the PHASE encoder treats padded time steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaddingPolicy {
    /// Freeze a sequence's state and window once its real length is used up.
    #[default]
    Masked,
    /// Run every step of the padded length for every sequence.
    Uniform,
}

/// Full model configuration.
///
/// # Example
///
/// ```
/// use phase_core::{EncoderKind, ModelConfig};
///
/// let config = ModelConfig::default();
/// assert_eq!(config.model, EncoderKind::Phase);
/// assert_eq!(config.hidden_dim % config.levels, 0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of one historic post embedding (default: 768).
    pub embedding_dim: usize,

    /// Width of the current post embedding (default: 768).
    pub current_dim: usize,

    /// Recurrent state size `H` (default: 256). Must be divisible by `levels`.
    pub hidden_dim: usize,

    /// Stacked layers for the LSTM encoders (default: 1). Ignored by PHASE.
    pub num_layers: usize,

    /// Dropout probability for heads and LSTM encoders (default: 0.3).
    pub dropout: f32,

    /// Dropconnect probability on the PHASE projections (default: 0.3).
    pub dropconnect: f32,

    /// Residual dropout probability (default: 0.3). Kept so configurations
    /// written for the reference PHASE setup still load; it is validated and
    /// carried in [`PhaseConfig`] but no layer applies it.
    pub dropres: f32,

    /// Width of the PHASE re-weighting window (default: 5).
    pub conv_size: usize,

    /// Number of ordered abstraction levels (default: 4).
    pub levels: usize,

    /// Historic encoder variant (default: phase).
    pub model: EncoderKind,

    /// Classification head (default: historic-current).
    pub head: HeadKind,

    /// Padded-step handling for PHASE (default: masked).
    pub padding: PaddingPolicy,

    /// Number of output classes (default: 2).
    pub num_classes: usize,

    /// Seed for parameter initialization.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: EMBEDDING_DIM,
            current_dim: EMBEDDING_DIM,
            hidden_dim: 256,
            num_layers: 1,
            dropout: 0.3,
            dropconnect: 0.3,
            dropres: 0.3,
            conv_size: 5,
            levels: 4,
            model: EncoderKind::Phase,
            head: HeadKind::HistoricCurrent,
            padding: PaddingPolicy::Masked,
            num_classes: NUM_CLASSES,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Checks every field that would otherwise fail later at forward time.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IndivisibleHidden`] if `hidden_dim % levels != 0`
    /// for the PHASE encoder, and [`PhaseError::InvalidConfig`] for any other
    /// unusable field.
    ///
    /// # Example
    ///
    /// ```
    /// use phase_core::{ModelConfig, PhaseError};
    ///
    /// let config = ModelConfig { hidden_dim: 10, levels: 4, ..ModelConfig::default() };
    /// assert!(matches!(config.validate(), Err(PhaseError::IndivisibleHidden { .. })));
    /// ```
    pub fn validate(&self) -> Result<(), PhaseError> {
        positive("embedding_dim", self.embedding_dim)?;
        positive("current_dim", self.current_dim)?;
        positive("num_layers", self.num_layers)?;
        positive("num_classes", self.num_classes)?;
        probability("dropout", self.dropout)?;

        let uses_phase = self.head == HeadKind::HistoricCurrent && self.model == EncoderKind::Phase;
        let uses_lstm = match self.head {
            HeadKind::HistoricCurrent => self.model != EncoderKind::Phase,
            HeadKind::Historic => true,
            HeadKind::Current => false,
        };

        if uses_phase {
            self.phase_config().validate()?;
        } else {
            positive("hidden_dim", self.hidden_dim)?;
        }
        if uses_lstm && (self.hidden_dim < 2 || self.hidden_dim % 2 != 0) {
            return Err(PhaseError::InvalidConfig {
                field: "hidden_dim",
                reason: format!(
                    "bidirectional encoders need an even hidden_dim >= 2, got {}",
                    self.hidden_dim
                ),
            });
        }
        Ok(())
    }

    /// Returns the PHASE encoder view of this configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use phase_core::ModelConfig;
    ///
    /// let phase = ModelConfig::default().phase_config();
    /// assert_eq!(phase.input_dim, 768);
    /// assert_eq!(phase.conv_dim(), phase.hidden_dim);
    /// ```
    pub fn phase_config(&self) -> PhaseConfig {
        PhaseConfig {
            input_dim: self.embedding_dim,
            hidden_dim: self.hidden_dim,
            conv_size: self.conv_size,
            levels: self.levels,
            dropconnect: self.dropconnect,
            dropres: self.dropres,
            padding: self.padding,
        }
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Config`] if the JSON is malformed, or any
    /// validation error from [`ModelConfig::validate`].
    ///
    /// # Example
    ///
    /// ```
    /// use phase_core::{EncoderKind, ModelConfig};
    ///
    /// let config = ModelConfig::from_json_str(r#"{"model": "bilstm-attention", "hidden_dim": 64}"#).unwrap();
    /// assert_eq!(config.model, EncoderKind::BiLstmAttention);
    /// assert_eq!(config.hidden_dim, 64);
    /// assert_eq!(config.levels, 4);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, PhaseError> {
        let config: Self = serde_json::from_str(json).map_err(|e| PhaseError::Config {
            message: format!("failed to parse model config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Config`] if the file cannot be read or parsed.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use phase_core::ModelConfig;
    /// use std::path::Path;
    ///
    /// let config = ModelConfig::from_path(Path::new("model.json")).unwrap();
    /// ```
    pub fn from_path(path: &Path) -> Result<Self, PhaseError> {
        let json = std::fs::read_to_string(path).map_err(|e| PhaseError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Serializes the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::Config`] if serialization fails.
    pub fn to_json(&self) -> Result<String, PhaseError> {
        serde_json::to_string_pretty(self).map_err(|e| PhaseError::Config {
            message: format!("failed to serialize model config: {e}"),
        })
    }
}

/// Configuration of the PHASE encoder.
///
/// # Example
///
/// ```
/// use phase_core::{PhaseConfig, PhaseError};
///
/// let config = PhaseConfig::new(8, 12, 3, 4);
/// assert_eq!(config.chunk_size(), 3);
/// assert!(config.validate().is_ok());
///
/// let bad = PhaseConfig::new(8, 10, 3, 4);
/// assert!(matches!(bad.validate(), Err(PhaseError::IndivisibleHidden { .. })));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Width of one input feature vector.
    pub input_dim: usize,

    /// Recurrent state size `H`.
    pub hidden_dim: usize,

    /// Window width and convolution kernel width.
    pub conv_size: usize,

    /// Number of ordered abstraction levels.
    pub levels: usize,

    /// Dropconnect probability on both projections.
    pub dropconnect: f32,

    /// Residual dropout probability. Validated for compatibility with
    /// existing configurations; the encoder applies none.
    pub dropres: f32,

    /// Padded-step handling.
    pub padding: PaddingPolicy,
}

impl PhaseConfig {
    /// Creates a configuration with regularization disabled and masked padding.
    pub fn new(input_dim: usize, hidden_dim: usize, conv_size: usize, levels: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            conv_size,
            levels,
            dropconnect: 0.0,
            dropres: 0.0,
            padding: PaddingPolicy::Masked,
        }
    }

    /// Size of one abstraction level's chunk of the hidden state.
    pub fn chunk_size(&self) -> usize {
        self.hidden_dim / self.levels
    }

    /// Output width of the temporal convolution (always `hidden_dim`).
    pub fn conv_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Width of the combined pre-activation vector: `4H + 2·levels`.
    pub fn gate_width(&self) -> usize {
        4 * self.hidden_dim + 2 * self.levels
    }

    /// Checks dimensions and probabilities.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::IndivisibleHidden`] if `hidden_dim % levels != 0`,
    /// [`PhaseError::InvalidConfig`] for zero dimensions or probabilities
    /// outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), PhaseError> {
        positive("input_dim", self.input_dim)?;
        positive("hidden_dim", self.hidden_dim)?;
        positive("levels", self.levels)?;
        positive("conv_size", self.conv_size)?;
        if self.hidden_dim % self.levels != 0 {
            return Err(PhaseError::IndivisibleHidden {
                hidden_dim: self.hidden_dim,
                levels: self.levels,
            });
        }
        probability("dropconnect", self.dropconnect)?;
        probability("dropres", self.dropres)?;
        Ok(())
    }
}

fn positive(field: &'static str, value: usize) -> Result<(), PhaseError> {
    if value == 0 {
        return Err(PhaseError::InvalidConfig {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn probability(field: &'static str, value: f32) -> Result<(), PhaseError> {
    if !(0.0..1.0).contains(&value) {
        return Err(PhaseError::InvalidConfig {
            field,
            reason: format!("must be in [0, 1), got {value}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn indivisible_hidden_rejected_for_phase() {
        let config = ModelConfig {
            hidden_dim: 30,
            levels: 4,
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PhaseError::IndivisibleHidden {
                hidden_dim: 30,
                levels: 4
            })
        ));
    }

    #[test]
    fn levels_ignored_for_lstm_encoders() {
        let config = ModelConfig {
            hidden_dim: 30,
            levels: 4,
            model: EncoderKind::BiLstm,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn odd_hidden_rejected_for_bidirectional_encoders() {
        let config = ModelConfig {
            hidden_dim: 7,
            head: HeadKind::Historic,
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PhaseError::InvalidConfig {
                field: "hidden_dim",
                ..
            })
        ));
    }

    #[test]
    fn probability_bounds_enforced() {
        let config = ModelConfig {
            dropout: 1.0,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ModelConfig {
            dropconnect: -0.1,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_conv_size_rejected() {
        let config = PhaseConfig::new(8, 12, 0, 4);
        assert!(matches!(
            config.validate(),
            Err(PhaseError::InvalidConfig {
                field: "conv_size",
                ..
            })
        ));
    }

    #[test]
    fn gate_width_matches_layout() {
        let config = PhaseConfig::new(8, 12, 3, 4);
        assert_eq!(config.gate_width(), 4 * 12 + 2 * 4);
        assert_eq!(config.chunk_size(), 3);
    }

    #[test]
    fn json_round_trip_preserves_enums() {
        let config = ModelConfig {
            model: EncoderKind::BiLstmAttention,
            head: HeadKind::Historic,
            padding: PaddingPolicy::Uniform,
            ..ModelConfig::default()
        };
        let json = config.to_json().unwrap();
        assert!(json.contains("\"bilstm-attention\""));
        assert!(json.contains("\"historic\""));
        assert!(json.contains("\"uniform\""));
        let parsed = ModelConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = ModelConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, PhaseError::Config { .. }));
    }

    #[test]
    fn phase_config_carries_encoder_regularization() {
        let config = ModelConfig {
            dropout: 0.2,
            dropconnect: 0.1,
            dropres: 0.25,
            ..ModelConfig::default()
        };
        let phase = config.phase_config();
        assert_eq!(phase.dropconnect, 0.1);
        assert_eq!(phase.dropres, 0.25);
        assert_eq!(phase.padding, PaddingPolicy::Masked);
    }

    #[test]
    fn phase_config_json_has_no_dropout_key() {
        let json = serde_json::to_string(&ModelConfig::default().phase_config()).unwrap();
        assert!(json.contains("\"dropres\""));
        assert!(!json.contains("\"dropout\""));

        let bad = PhaseConfig {
            dropres: 1.0,
            ..PhaseConfig::new(8, 12, 3, 4)
        };
        assert!(matches!(
            bad.validate(),
            Err(PhaseError::InvalidConfig { field: "dropres", .. })
        ));
    }
}
