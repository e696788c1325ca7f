//! System configuration: unwrapping mode, architecture, objective weights.
//!
//! Loaded from TOML, e.g.
//!
//! ```toml
//! mode = "two_step"
//! max_wrap_count = 12
//! channel_widths = [32, 64, 128, 256]
//! stage_depths = [2, 2, 2, 2]
//! downsample_factor = 16
//! attention_heads = 8
//! skip_fusion = "concatenate"
//! consistency_weight = 0.1
//! ```

use std::fmt;
use std::path::Path;

use phase_map::{Result, UnwrapError, MAX_WRAP_COUNT};
use serde::{Deserialize, Serialize};

use crate::model::decoder::DecoderConfig;
use crate::model::encoder::EncoderConfig;
use crate::model::head::{HeadKind, OutputHeadConfig};
use crate::model::network::PhaseUNetConfig;

/// One-step regression or two-step wrap-count classification + reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwrapMode {
    OneStep,
    TwoStep,
}

impl fmt::Display for UnwrapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneStep => write!(f, "one_step"),
            Self::TwoStep => write!(f, "two_step"),
        }
    }
}

/// How decoder features merge with the encoder skip at the same resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipFusion {
    /// Channel concatenation followed by a 1x1 projection.
    Concatenate,
    /// Element-wise sum.
    Add,
}

impl fmt::Display for SkipFusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concatenate => write!(f, "concatenate"),
            Self::Add => write!(f, "add"),
        }
    }
}

/// Pixel-wise loss of the regression head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionLoss {
    L1,
    Mse,
}

/// Top-level configuration of the unwrapping system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrapConfig {
    #[serde(default = "default_mode")]
    pub mode: UnwrapMode,

    /// Bound K of the wrap-count classes [-K, K]. Required in two-step mode.
    #[serde(default)]
    pub max_wrap_count: Option<u32>,

    /// Wrapped phase plus auxiliary channels.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Channel width per encoder stage, finest first.
    #[serde(default = "default_channel_widths")]
    pub channel_widths: Vec<usize>,

    /// Mixing blocks per stage.
    #[serde(default = "default_stage_depths")]
    pub stage_depths: Vec<usize>,

    /// Total downsampling between input and coarsest stage.
    #[serde(default = "default_downsample_factor")]
    pub downsample_factor: usize,

    /// Hidden expansion of the mixing blocks.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,

    /// Heads of the self-attention blocks in the coarsest stage.
    #[serde(default = "default_attention_heads")]
    pub attention_heads: usize,

    #[serde(default = "default_skip_fusion")]
    pub skip_fusion: SkipFusion,

    #[serde(default = "default_regression_loss")]
    pub regression_loss: RegressionLoss,

    /// Weight of the reconstruction consistency term (two-step only).
    #[serde(default)]
    pub consistency_weight: f64,

    /// Snap one-step predictions onto the input's congruence class.
    #[serde(default = "default_project_to_congruence")]
    pub project_to_congruence: bool,
}

fn default_mode() -> UnwrapMode {
    UnwrapMode::OneStep
}
fn default_in_channels() -> usize {
    1
}
fn default_channel_widths() -> Vec<usize> {
    vec![32, 64, 128, 256]
}
fn default_stage_depths() -> Vec<usize> {
    vec![2, 2, 2, 2]
}
fn default_downsample_factor() -> usize {
    16
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_attention_heads() -> usize {
    4
}
fn default_skip_fusion() -> SkipFusion {
    SkipFusion::Concatenate
}
fn default_regression_loss() -> RegressionLoss {
    RegressionLoss::L1
}
fn default_project_to_congruence() -> bool {
    true
}

impl Default for UnwrapConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_wrap_count: None,
            in_channels: default_in_channels(),
            channel_widths: default_channel_widths(),
            stage_depths: default_stage_depths(),
            downsample_factor: default_downsample_factor(),
            mlp_ratio: default_mlp_ratio(),
            attention_heads: default_attention_heads(),
            skip_fusion: default_skip_fusion(),
            regression_loss: default_regression_loss(),
            consistency_weight: 0.0,
            project_to_congruence: default_project_to_congruence(),
        }
    }
}

impl UnwrapConfig {
    /// One-step regression with default architecture.
    pub fn one_step() -> Self {
        Self::default()
    }

    /// Two-step classification over [-K, K] with default architecture.
    pub fn two_step(max_wrap_count: u32) -> Self {
        Self {
            mode: UnwrapMode::TwoStep,
            max_wrap_count: Some(max_wrap_count),
            ..Self::default()
        }
    }

    /// Replace the backbone shape in one call.
    pub fn with_backbone(
        mut self,
        channel_widths: Vec<usize>,
        stage_depths: Vec<usize>,
        downsample_factor: usize,
    ) -> Self {
        self.channel_widths = channel_widths;
        self.stage_depths = stage_depths;
        self.downsample_factor = downsample_factor;
        self
    }

    /// Number of encoder (and decoder) resolution levels.
    pub fn num_stages(&self) -> usize {
        self.channel_widths.len()
    }

    /// `2^(stages-1)`, `None` when it does not fit in a usize.
    fn halvings(&self) -> Option<usize> {
        let shift = u32::try_from(self.num_stages().saturating_sub(1)).ok()?;
        1usize.checked_shl(shift)
    }

    /// Stride of the first patch embedding: `downsample_factor / 2^(stages-1)`.
    ///
    /// 0 when the stage count overflows; [`validate`](Self::validate) rejects
    /// such configurations.
    pub fn patch_size(&self) -> usize {
        self.halvings().map_or(0, |h| self.downsample_factor / h)
    }

    /// Check every option before any data is processed.
    pub fn validate(&self) -> Result<()> {
        match (self.mode, self.max_wrap_count) {
            (UnwrapMode::TwoStep, None) => {
                return Err(UnwrapError::config(
                    "max_wrap_count",
                    "required in two_step mode",
                ))
            }
            (UnwrapMode::TwoStep, Some(0)) => {
                return Err(UnwrapError::config(
                    "max_wrap_count",
                    "must be at least 1 in two_step mode",
                ))
            }
            (UnwrapMode::TwoStep, Some(k)) if k > MAX_WRAP_COUNT => {
                return Err(UnwrapError::config(
                    "max_wrap_count",
                    format!("{k} exceeds the limit {MAX_WRAP_COUNT}"),
                ))
            }
            (UnwrapMode::OneStep, Some(k)) => {
                tracing::warn!(max_wrap_count = k, "max_wrap_count is ignored in one_step mode");
            }
            _ => {}
        }

        if self.in_channels == 0 {
            return Err(UnwrapError::config("in_channels", "must be at least 1"));
        }
        if self.channel_widths.is_empty() || self.channel_widths.contains(&0) {
            return Err(UnwrapError::config(
                "channel_widths",
                format!("need at least one non-zero width, got {:?}", self.channel_widths),
            ));
        }
        if self.stage_depths.len() != self.channel_widths.len() {
            return Err(UnwrapError::config(
                "stage_depths",
                format!(
                    "expected {} entries (one per channel width), got {}",
                    self.channel_widths.len(),
                    self.stage_depths.len()
                ),
            ));
        }

        let Some(halvings) = self.halvings() else {
            return Err(UnwrapError::config(
                "channel_widths",
                format!("{} stages overflow the downsampling factor", self.num_stages()),
            ));
        };
        if self.downsample_factor == 0 || self.downsample_factor % halvings != 0 {
            return Err(UnwrapError::config(
                "downsample_factor",
                format!(
                    "must be a positive multiple of {halvings} for {} stages, got {}",
                    self.num_stages(),
                    self.downsample_factor
                ),
            ));
        }

        if !(self.mlp_ratio.is_finite() && self.mlp_ratio > 0.0) {
            return Err(UnwrapError::config(
                "mlp_ratio",
                format!("must be positive and finite, got {}", self.mlp_ratio),
            ));
        }

        let bottleneck = self.channel_widths[self.num_stages() - 1];
        if self.attention_heads == 0 || bottleneck % self.attention_heads != 0 {
            return Err(UnwrapError::config(
                "attention_heads",
                format!(
                    "must be positive and divide the coarsest width {bottleneck}, got {}",
                    self.attention_heads
                ),
            ));
        }

        if !(self.consistency_weight.is_finite() && self.consistency_weight >= 0.0) {
            return Err(UnwrapError::config(
                "consistency_weight",
                format!("must be finite and >= 0, got {}", self.consistency_weight),
            ));
        }
        if self.mode == UnwrapMode::OneStep && self.consistency_weight > 0.0 {
            return Err(UnwrapError::config(
                "consistency_weight",
                "the consistency term needs the two_step wrap-count head",
            ));
        }
        Ok(())
    }

    /// Head variant bound to this configuration.
    pub fn head_kind(&self) -> HeadKind {
        match self.mode {
            UnwrapMode::OneStep => HeadKind::Regression,
            UnwrapMode::TwoStep => HeadKind::WrapCount {
                max_wrap_count: self.max_wrap_count.unwrap_or(0),
            },
        }
    }

    /// Validated network configuration.
    pub fn network(&self) -> Result<PhaseUNetConfig> {
        self.validate()?;
        let patch_size = self.patch_size();
        Ok(PhaseUNetConfig::new(
            EncoderConfig::new(
                self.in_channels,
                self.channel_widths.clone(),
                self.stage_depths.clone(),
                patch_size,
            )
            .with_mlp_ratio(self.mlp_ratio)
            .with_attention_heads(self.attention_heads),
            DecoderConfig::new(
                self.channel_widths.clone(),
                self.stage_depths.clone(),
                patch_size,
                self.skip_fusion,
            )
            .with_mlp_ratio(self.mlp_ratio),
            OutputHeadConfig::new(self.channel_widths[0], self.head_kind()),
        ))
    }

    /// Identity of the parameter set this configuration produces.
    pub fn architecture_key(&self) -> ArchitectureKey {
        ArchitectureKey {
            head: self.head_kind(),
            in_channels: self.in_channels,
            channel_widths: self.channel_widths.clone(),
            stage_depths: self.stage_depths.clone(),
            downsample_factor: self.downsample_factor,
            skip_fusion: self.skip_fusion,
            mlp_ratio: self.mlp_ratio,
            attention_heads: self.attention_heads,
        }
    }
}

/// Everything that determines parameter shapes. Persisted blobs are keyed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureKey {
    pub head: HeadKind,
    pub in_channels: usize,
    pub channel_widths: Vec<usize>,
    pub stage_depths: Vec<usize>,
    pub downsample_factor: usize,
    pub skip_fusion: SkipFusion,
    pub mlp_ratio: f64,
    #[serde(default = "default_attention_heads")]
    pub attention_heads: usize,
}

impl ArchitectureKey {
    /// First field where `found` differs from `self`, as `(field, expected, found)`.
    pub fn first_mismatch(&self, found: &ArchitectureKey) -> Option<(&'static str, String, String)> {
        macro_rules! check {
            ($field:ident) => {
                if self.$field != found.$field {
                    return Some((
                        stringify!($field),
                        format!("{:?}", self.$field),
                        format!("{:?}", found.$field),
                    ));
                }
            };
        }
        check!(head);
        check!(in_channels);
        check!(channel_widths);
        check!(stage_depths);
        check!(downsample_factor);
        check!(skip_fusion);
        check!(mlp_ratio);
        check!(attention_heads);
        None
    }
}

/// Load and validate an [`UnwrapConfig`] from a TOML file.
pub fn load_config(path: &Path) -> Result<UnwrapConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: UnwrapConfig = toml::from_str(&contents)
        .map_err(|e| UnwrapError::config("config file", format!("{}: {e}", path.display())))?;
    config.validate()?;
    tracing::info!(path = %path.display(), mode = %config.mode, "Loaded unwrap config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = UnwrapConfig::default();
        assert_eq!(cfg.mode, UnwrapMode::OneStep);
        assert_eq!(cfg.max_wrap_count, None);
        assert_eq!(cfg.channel_widths, vec![32, 64, 128, 256]);
        assert_eq!(cfg.downsample_factor, 16);
        assert_eq!(cfg.patch_size(), 2);
        assert_eq!(cfg.skip_fusion, SkipFusion::Concatenate);
        assert!(cfg.project_to_congruence);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_two_step_without_bound_fails() {
        let cfg = UnwrapConfig {
            mode: UnwrapMode::TwoStep,
            ..UnwrapConfig::default()
        };
        match cfg.validate() {
            Err(UnwrapError::Configuration { option, .. }) => {
                assert_eq!(option, "max_wrap_count")
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
        assert!(cfg.network().is_err());
    }

    #[test]
    fn test_two_step_zero_bound_fails() {
        assert!(UnwrapConfig::two_step(0).validate().is_err());
        assert!(UnwrapConfig::two_step(12).validate().is_ok());
    }

    #[test]
    fn test_consistency_weight_requires_two_step() {
        let cfg = UnwrapConfig {
            consistency_weight: 0.5,
            ..UnwrapConfig::one_step()
        };
        assert!(cfg.validate().is_err());

        let cfg = UnwrapConfig {
            consistency_weight: 0.5,
            ..UnwrapConfig::two_step(3)
        };
        assert!(cfg.validate().is_ok());

        let cfg = UnwrapConfig {
            consistency_weight: f64::NAN,
            ..UnwrapConfig::two_step(3)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_downsample_factor_must_match_stages() {
        let cfg = UnwrapConfig::one_step().with_backbone(vec![8, 16, 32], vec![1, 1, 1], 6);
        assert!(cfg.validate().is_err(), "6 is not a multiple of 4");

        let cfg = UnwrapConfig::one_step().with_backbone(vec![8, 16, 32], vec![1, 1, 1], 16);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.patch_size(), 4);
    }

    #[test]
    fn test_too_many_stages_is_configuration_error() {
        let cfg = UnwrapConfig::one_step().with_backbone(vec![4; 70], vec![1; 70], 16);
        assert_eq!(cfg.patch_size(), 0);
        match cfg.validate() {
            Err(UnwrapError::Configuration { option, .. }) => assert_eq!(option, "channel_widths"),
            other => panic!("expected configuration error, got {other:?}"),
        }
        assert!(cfg.network().is_err());
    }

    #[test]
    fn test_wrap_count_bound_limit() {
        assert!(UnwrapConfig::two_step(MAX_WRAP_COUNT).validate().is_ok());
        match UnwrapConfig::two_step(MAX_WRAP_COUNT + 1).validate() {
            Err(UnwrapError::Configuration { option, .. }) => assert_eq!(option, "max_wrap_count"),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_attention_heads_must_divide_bottleneck() {
        let cfg = UnwrapConfig {
            attention_heads: 3,
            ..UnwrapConfig::one_step().with_backbone(vec![4, 8], vec![1, 1], 4)
        };
        assert!(cfg.validate().is_err());
        let cfg = UnwrapConfig { attention_heads: 0, ..cfg };
        assert!(cfg.validate().is_err());
        let cfg = UnwrapConfig { attention_heads: 2, ..cfg };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_depths_must_match_widths() {
        let cfg = UnwrapConfig::one_step().with_backbone(vec![8, 16], vec![1], 4);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_two_step_toml() {
        let toml_str = r#"
mode = "two_step"
max_wrap_count = 12
channel_widths = [16, 32]
stage_depths = [1, 1]
downsample_factor = 8
skip_fusion = "add"
consistency_weight = 0.1
"#;
        let cfg: UnwrapConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.mode, UnwrapMode::TwoStep);
        assert_eq!(cfg.max_wrap_count, Some(12));
        assert_eq!(cfg.skip_fusion, SkipFusion::Add);
        assert_eq!(cfg.patch_size(), 4);
        assert_eq!(cfg.regression_loss, RegressionLoss::L1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: UnwrapConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, UnwrapConfig::default());
    }

    #[test]
    fn test_architecture_key_mismatch() {
        let a = UnwrapConfig::two_step(4).architecture_key();
        let b = UnwrapConfig::two_step(5).architecture_key();
        let (field, expected, found) = a.first_mismatch(&b).unwrap();
        assert_eq!(field, "head");
        assert!(expected.contains('4'), "{expected}");
        assert!(found.contains('5'), "{found}");
        assert!(a.first_mismatch(&a.clone()).is_none());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("unwrap.toml");
        std::fs::write(&path, "mode = \"two_step\"\nmax_wrap_count = 3\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.max_wrap_count, Some(3));

        std::fs::write(&path, "mode = \"two_step\"\n").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(UnwrapError::Configuration { .. })
        ));
    }
}
