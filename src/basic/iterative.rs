use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;
use tracing::debug;

use super::error::{SolverError, SolverResult};
use super::solver::Solve;
use super::sparse::{complex_rhs, complex_solution, complex_system_matrix, csc_block};

/// Fixed-point power flow driving injected currents from the specified
/// powers through the factorized admittance matrix.
///
/// Expects the same solver ordering as [`newton_pf`](super::newton_pf): PV
/// nodes, then PQ nodes, then reference nodes. Voltage-controlled nodes are
/// held at their target magnitude by rescaling after every sweep. The
/// admittance block over the non-reference nodes keeps a constant pattern and
/// constant values, so the backend re-factors numerically but reuses its
/// symbolic analysis across iterations.
#[allow(non_snake_case)]
pub fn iterative_current_pf<Solver: Solve>(
    Ybus: &CscMatrix<Complex64>,
    Sbus: &DVector<Complex64>,
    v_init: &DVector<Complex64>,
    npv: usize,
    npq: usize,
    tolerance: f64,
    max_iter: usize,
    solver: &mut Solver,
) -> SolverResult<(DVector<Complex64>, usize)> {
    let n = v_init.len();
    let n_bus = npv + npq;
    let n_ext = n - n_bus;

    let ypp = csc_block(Ybus, (0, 0), (n_bus, n_bus));
    let yps = csc_block(Ybus, (0, n_bus), (n_bus, n_ext));
    let real_sys = complex_system_matrix(&ypp);
    let (mut Ap, mut Ai, mut Ax) = real_sys.disassemble();
    solver.reset();

    let mut v = v_init.clone();
    let vm_target: Vec<f64> = (0..npv).map(|k| v[k].norm()).collect();
    let v_ext = v.rows_range(n_bus..n).clone_owned();
    // Boundary current drawn through the reference nodes, constant per solve.
    let i_ext: DVector<Complex64> = &yps * &v_ext;

    let mut max_dev = f64::MAX;
    for iterations in 1..=max_iter {
        let mut rhs = DVector::zeros(n_bus);
        for k in 0..n_bus {
            rhs[k] = (Sbus[k] / v[k]).conj() - i_ext[k];
        }

        let mut b = complex_rhs(&rhs);
        solver
            .solve(
                Ap.as_mut_slice(),
                Ai.as_mut_slice(),
                Ax.as_mut_slice(),
                b.as_mut_slice(),
                2 * n_bus,
            )
            .map_err(|_| SolverError::IllPosed {
                what: "singular admittance block".into(),
            })?;
        let v_new = complex_solution(&b);

        for k in 0..n_bus {
            v[k] = v_new[k];
        }
        for k in 0..npv {
            let m = v[k].norm();
            if m > 0.0 {
                v[k] *= vm_target[k] / m;
            }
        }

        // Injected-power mismatch at the updated state; voltage-controlled
        // nodes are only held to their active power.
        let s_calc = v.component_mul(&(Ybus * &v).conjugate());
        max_dev = (0..n_bus).fold(0.0f64, |acc, k| {
            let ds = s_calc[k] - Sbus[k];
            acc.max(if k < npv { ds.re.abs() } else { ds.norm() })
        });
        debug!(iterations, max_dev, "current injection sweep");
        if max_dev < tolerance {
            return Ok((v, iterations));
        }
    }

    Err(SolverError::Divergence {
        iterations: max_iter,
        max_dev,
        tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::newton_pf;
    use crate::basic::solver::DefaultSolver;
    use nalgebra_sparse::CooMatrix;

    fn feeder() -> (CscMatrix<Complex64>, DVector<Complex64>, DVector<Complex64>) {
        // Reference - bus - bus chain, two loads.
        let y = Complex64::new(1.0, 0.0) / Complex64::new(0.02, 0.06);
        let mut coo = CooMatrix::new(3, 3);
        // Ordering: two PQ nodes, then the reference.
        for (i, j) in [(0usize, 1usize), (1, 2)] {
            coo.push(i, i, y);
            coo.push(j, j, y);
            coo.push(i, j, -y);
            coo.push(j, i, -y);
        }
        let ybus = CscMatrix::from(&coo);
        let sbus = DVector::from_vec(vec![
            Complex64::new(-0.08, -0.03),
            Complex64::new(-0.05, -0.02),
            Complex64::default(),
        ]);
        let v_init = DVector::from_element(3, Complex64::new(1.0, 0.0));
        (ybus, sbus, v_init)
    }

    /// The fixed-point strategy converges and agrees with Newton-Raphson.
    #[test]
    fn test_matches_newton() {
        let (ybus, sbus, v_init) = feeder();
        let mut solver = DefaultSolver::default();
        let (v_fp, _) =
            iterative_current_pf(&ybus, &sbus, &v_init, 0, 2, 1e-10, 100, &mut solver).unwrap();

        let mut solver2 = DefaultSolver::default();
        let (v_nr, _) = newton_pf(&ybus, &sbus, &v_init, 0, 2, 1e-10, 50, &mut solver2).unwrap();

        for k in 0..3 {
            assert!((v_fp[k] - v_nr[k]).norm() < 1e-7, "node {k} differs");
        }
    }

    /// A node with no connection to the reference makes the block singular.
    #[test]
    fn test_unsupplied_reports_ill_posed() {
        let y = Complex64::new(1.0, -3.0);
        let mut coo = CooMatrix::new(3, 3);
        // Only node 0 ties to the reference at position 2; node 1 floats.
        coo.push(0, 0, y);
        coo.push(2, 2, y);
        coo.push(0, 2, -y);
        coo.push(2, 0, -y);
        coo.push(1, 1, Complex64::default());
        let ybus = CscMatrix::from(&coo);
        let sbus = DVector::from_vec(vec![
            Complex64::new(-0.1, 0.0),
            Complex64::new(-0.1, 0.0),
            Complex64::default(),
        ]);
        let v_init = DVector::from_element(3, Complex64::new(1.0, 0.0));

        let mut solver = DefaultSolver::default();
        let err = iterative_current_pf(&ybus, &sbus, &v_init, 0, 2, 1e-8, 20, &mut solver)
            .unwrap_err();
        assert!(matches!(err, SolverError::IllPosed { .. }));
    }
}
