use thiserror::Error;

/// Errors surfaced by the solver core.
///
/// All variants propagate to the orchestrating caller unmodified; the core
/// never retries on its own.
#[derive(Debug, Clone, Error)]
pub enum SolverError {
    /// Invalid configuration: a sensor placed on something that has no
    /// defined terminal semantics for that measurement kind, an unknown
    /// component reference, or an unsupported fault/representation combination.
    /// Detected before any numeric work.
    #[error("invalid configuration: {what}")]
    Config { what: String },

    /// The iteration cap was reached without meeting the tolerance.
    /// Iterating further might still converge; the caller decides.
    #[error(
        "did not converge after {iterations} iterations (max deviation {max_dev:.3e}, tolerance {tolerance:.3e})"
    )]
    Divergence {
        iterations: usize,
        max_dev: f64,
        tolerance: f64,
    },

    /// The system matrix is singular or structurally infeasible, e.g. an
    /// island without any voltage source. No amount of iteration helps.
    #[error("ill-posed system: {what}")]
    IllPosed { what: String },

    /// A solver was invoked against state whose generation does not match the
    /// committed cache status. This is a programming-contract violation.
    #[error("cache consistency violation: {what}")]
    CacheConsistency { what: String },
}

pub type SolverResult<T> = Result<T, SolverError>;
