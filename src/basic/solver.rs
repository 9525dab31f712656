use thiserror::Error;

#[cfg(feature = "faer")]
mod faer;
#[cfg(feature = "faer")]
pub use faer::*;

#[cfg(feature = "rsparse")]
mod rsparse;
#[cfg(feature = "rsparse")]
pub use rsparse::*;

#[cfg(feature = "faer")]
pub type DefaultSolver = FaerSolver;

#[cfg(all(not(feature = "faer"), feature = "rsparse"))]
pub type DefaultSolver = RSparseSolver;

/// Failure modes of a sparse LU backend.
///
/// `Singular` is the signal the iterative solvers translate into the
/// ill-posed-system diagnosis; it is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FactorizeFailure {
    #[error("matrix is singular to working precision")]
    Singular,
    #[error("symbolic analysis failed")]
    Symbolic,
}

#[allow(non_snake_case)]
/// A trait for solving sparse linear systems in CSC form.
///
/// Backends may cache symbolic analysis between calls; the caller must
/// [`reset`](Solve::reset) whenever the sparsity pattern changes.
pub trait Solve {
    /// Factors the matrix and solves in place, leaving the solution in `b`.
    ///
    /// # Parameters
    ///
    /// * `Ap` - Column pointers of the matrix.
    /// * `Ai` - Row indices of the matrix.
    /// * `Ax` - Non-zero values of the matrix.
    /// * `b` - Right-hand side vector, overwritten with the solution.
    /// * `n` - Dimension of the system.
    fn solve(
        &mut self,
        Ap: &mut [usize],
        Ai: &mut [usize],
        Ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), FactorizeFailure>;

    /// Drops any cached symbolic analysis.
    fn reset(&mut self);
}
