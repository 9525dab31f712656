use rsparse::{
    self,
    data::{Numeric, Sprs, Symb},
    lsolve, lu, sqr, usolve,
};

use super::{FactorizeFailure, Solve};

/// LU backend built on the pure-Rust `rsparse` routines.
///
/// The symbolic ordering is computed on the first call and reused until
/// [`reset`](Solve::reset); only the numeric factorization reruns when matrix
/// values change in place.
#[derive(Default)]
pub struct RSparseSolver {
    x: Vec<f64>,
    symbolic: Option<Symb>,
}

#[allow(non_snake_case)]
impl Solve for RSparseSolver {
    fn solve(
        &mut self,
        Ap: &mut [usize],
        Ai: &mut [usize],
        Ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), FactorizeFailure> {
        let a = Sprs {
            m: n,
            n,
            i: Ai.to_vec(),
            p: Ap.iter().map(|&v| v as isize).collect(),
            x: Ax.to_vec(),
            nzmax: Ax.len(),
        };

        let symbolic = self
            .symbolic
            .get_or_insert_with(|| sqr(&a, 1, false));
        self.x.resize(n, 0.0);

        // Numeric LU with partial pivoting; a zero pivot reports as singular.
        let num = lu(&a, symbolic, 1e-6).map_err(|_| FactorizeFailure::Singular)?;

        ipvec(&num.pinv, b, &mut self.x); // x = P*b
        lsolve(&num.l, &mut self.x); // x = L\x
        usolve(&num.u, &mut self.x); // x = U\x
        ipvec(&symbolic.q, &self.x, b); // b = Q*x

        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(perm) => {
            for k in 0..b.len() {
                x[perm[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}
