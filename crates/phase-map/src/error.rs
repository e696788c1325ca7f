/// Errors raised anywhere in the unwrapping stack.
///
/// Every variant names the stage, tensor or option that failed together with
/// the expected and the actual value, so a failure can be traced back without
/// a debugger.
#[derive(Debug, thiserror::Error)]
pub enum UnwrapError {
    /// Input dimensions incompatible with the downsampling factor or channel count.
    #[error("shape error in {stage} ({tensor}): expected {expected}, got {actual}")]
    Shape {
        stage: &'static str,
        tensor: &'static str,
        expected: String,
        actual: String,
    },

    /// Persisted parameters incompatible with the current architecture.
    #[error("model load error: {field} expected {expected}, found {found}")]
    ModelLoad {
        field: String,
        expected: String,
        found: String,
    },

    /// Missing or mutually exclusive options.
    #[error("configuration error: {option}: {reason}")]
    Configuration { option: &'static str, reason: String },

    /// Loss or gradients became non-finite. The update was not applied.
    #[error("numeric instability in {stage} at step {step}: {detail}")]
    NumericInstability {
        stage: &'static str,
        step: usize,
        detail: String,
    },

    /// A wrapped phase value outside (-pi, pi] or not finite.
    #[error("wrapped phase out of range at pixel ({row}, {col}): {value}")]
    PhaseRange { row: usize, col: usize, value: f32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UnwrapError {
    /// Shorthand for a [`UnwrapError::Shape`] built from displayable values.
    pub fn shape(
        stage: &'static str,
        tensor: &'static str,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::Shape {
            stage,
            tensor,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Shorthand for a [`UnwrapError::Configuration`].
    pub fn config(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            option,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`UnwrapError::ModelLoad`].
    pub fn model_load(
        field: impl Into<String>,
        expected: impl std::fmt::Display,
        found: impl std::fmt::Display,
    ) -> Self {
        Self::ModelLoad {
            field: field.into(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UnwrapError>;
