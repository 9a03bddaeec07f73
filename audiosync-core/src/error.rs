//! Error taxonomy shared by every pipeline component.
//!
//! One variant per failure kind distinguished by the orchestrator; step
//! context (which step, which operation) is attached once, at the
//! orchestrator boundary, via [`StepError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("required tool not found on PATH: {0}")]
    ToolMissing(String),

    #[error("tool exited with code {code}: {}", tail.join("\n"))]
    ToolExit { code: i32, tail: Vec<String> },

    #[error("tool timed out after {seconds}s")]
    ToolTimeout { seconds: u64 },

    #[error("insufficient accepted chunks: {reason}")]
    InsufficientData { reason: String },

    #[error("drift diagnosed but not correctable: {reason}")]
    DriftUncorrectable { reason: String },

    #[error("invariant violated: {0}")]
    FatalInvariant(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether this kind is a warning the orchestrator may continue past,
    /// rather than a fatal job failure.
    pub fn is_recoverable_warning(&self) -> bool {
        matches!(self, PipelineError::DriftUncorrectable { .. })
    }
}

/// A [`PipelineError`] annotated with the step and operation that produced
/// it. This is the shape surfaced as the final job result (spec's
/// `[FATAL] Job '<name>' → <Step> → <operation>: <detail>` line).
#[derive(Debug, Error)]
#[error("{step} → {operation}: {source}")]
pub struct StepError {
    pub step: String,
    pub operation: String,
    #[source]
    pub source: PipelineError,
}

impl StepError {
    pub fn new(step: impl Into<String>, operation: impl Into<String>, source: PipelineError) -> Self {
        Self { step: step.into(), operation: operation.into(), source }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type StepResult<T> = Result<T, StepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_uncorrectable_is_recoverable() {
        let e = PipelineError::DriftUncorrectable { reason: "no engine".into() };
        assert!(e.is_recoverable_warning());
    }

    #[test]
    fn fatal_invariant_is_not_recoverable() {
        let e = PipelineError::FatalInvariant("slot already published".into());
        assert!(!e.is_recoverable_warning());
    }

    #[test]
    fn step_error_formats_with_context() {
        let e = StepError::new("Analyze", "select_delay", PipelineError::InsufficientData { reason: "0 accepted chunks".into() });
        let msg = format!("{e}");
        assert!(msg.contains("Analyze"));
        assert!(msg.contains("select_delay"));
    }
}
