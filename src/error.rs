use thiserror::Error;

/// Failures raised before any step runs; a task whose plan fails to
/// generate never leaves the Idle state.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("plan backend request failed: {0}")]
    Backend(String),

    #[error("plan response was not usable: {0}")]
    InvalidResponse(String),

    #[error("step {index} is not a valid action: {reason}")]
    InvalidStep { index: usize, reason: String },

    #[error("plan contained no steps")]
    EmptyPlan,
}

/// Failures from the browser layer. Per-step variants are caught at step
/// granularity; `Launch` is fatal to the whole run.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("browser session closed")]
    Closed,
}
