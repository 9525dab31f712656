use faer::{
    MatMut,
    linalg::solvers::Solve as FaerSolve,
    sparse::{
        SparseColMatRef, SymbolicSparseColMatRef,
        linalg::solvers::{Lu, SymbolicLu},
    },
};

use super::{FactorizeFailure, Solve};

/// LU backend built on `faer`'s supernodal sparse solver.
#[derive(Default)]
pub struct FaerSolver {
    symbolic: Option<SymbolicLu<usize>>,
}

#[allow(non_snake_case)]
impl Solve for FaerSolver {
    fn solve(
        &mut self,
        Ap: &mut [usize],
        Ai: &mut [usize],
        Ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), FactorizeFailure> {
        let s = unsafe { SymbolicSparseColMatRef::new_unchecked(n, n, Ap, None, Ai) };
        let mat = SparseColMatRef::new(s, Ax);

        if self.symbolic.is_none() {
            self.symbolic =
                Some(SymbolicLu::try_new(s).map_err(|_| FactorizeFailure::Symbolic)?);
        }

        let lu = Lu::try_new_with_symbolic(self.symbolic.as_ref().unwrap().clone(), mat)
            .map_err(|_| FactorizeFailure::Singular)?;
        lu.solve_in_place(MatMut::from_column_major_slice_mut(b, n, 1));
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
    }
}
