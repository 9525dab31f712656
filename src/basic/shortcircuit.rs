use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;
use tracing::debug;

use super::error::{SolverError, SolverResult};
use super::solver::Solve;
use super::sparse::{complex_rhs, complex_solution, complex_system_matrix};

/// Fault models per IEC 60909.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FaultType {
    ThreePhase,
    SinglePhaseGround,
    TwoPhase,
    TwoPhaseGround,
}

/// Selects the voltage factor `c` applied to the pre-fault source voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VoltageScaling {
    /// Minimum short-circuit currents, `c = 0.95`.
    Minimum,
    /// Maximum short-circuit currents, `c = 1.10`.
    Maximum,
}

impl VoltageScaling {
    /// Voltage factor for networks above 1 kV (IEC 60909-0 table 1).
    pub fn factor(&self) -> f64 {
        match self {
            VoltageScaling::Minimum => 0.95,
            VoltageScaling::Maximum => 1.10,
        }
    }
}

/// How the fault ties into the nodal equations, in scalar-row terms.
#[derive(Debug, Clone)]
pub enum FaultStamp {
    /// The listed rows are shorted to ground through `z_fault`.
    ToGround { rows: Vec<usize>, z_fault: Complex64 },
    /// The two rows are bridged through `z_fault` without a ground path.
    Bridge { a: usize, b: usize, z_fault: Complex64 },
}

/// Solves the fault-augmented nodal equations in one linear solve.
///
/// `ybus` must already include the source internal admittances on its
/// diagonal, and `i_src` the matching internal current injections scaled by
/// the voltage factor. Bolted faults are enforced exactly by constraint rows;
/// impedance faults add the fault admittance to the matrix.
///
/// Returns the post-fault voltages and the fault current drawn at each
/// faulted row.
pub fn solve_fault<Solver: Solve>(
    ybus: &CscMatrix<Complex64>,
    i_src: &DVector<Complex64>,
    stamp: &FaultStamp,
    solver: &mut Solver,
) -> SolverResult<(DVector<Complex64>, Vec<Complex64>)> {
    let n = i_src.len();
    let mut aug = CooMatrix::new(n, n);
    let mut rhs = i_src.clone();

    match stamp {
        FaultStamp::ToGround { rows, z_fault } => {
            if z_fault.norm() == 0.0 {
                // Exact bolted fault: replace the nodal equation of every
                // faulted row by the constraint V = 0.
                for (r, c, v) in ybus.triplet_iter() {
                    if !rows.contains(&r) {
                        aug.push(r, c, *v);
                    }
                }
                for &r in rows {
                    aug.push(r, r, Complex64::new(1.0, 0.0));
                    rhs[r] = Complex64::default();
                }
            } else {
                let y_f = Complex64::new(1.0, 0.0) / z_fault;
                for (r, c, v) in ybus.triplet_iter() {
                    aug.push(r, c, *v);
                }
                for &r in rows {
                    aug.push(r, r, y_f);
                }
            }
        }
        FaultStamp::Bridge { a, b, z_fault } => {
            let (a, b) = (*a, *b);
            if z_fault.norm() == 0.0 {
                // V_a = V_b, and the two nodal equations merge: the fault
                // current circulates between the bridged rows.
                for (r, c, v) in ybus.triplet_iter() {
                    if r == a || r == b {
                        aug.push(b, c, *v);
                    } else {
                        aug.push(r, c, *v);
                    }
                }
                aug.push(a, a, Complex64::new(1.0, 0.0));
                aug.push(a, b, Complex64::new(-1.0, 0.0));
                rhs[b] = i_src[a] + i_src[b];
                rhs[a] = Complex64::default();
            } else {
                let y_f = Complex64::new(1.0, 0.0) / z_fault;
                for (r, c, v) in ybus.triplet_iter() {
                    aug.push(r, c, *v);
                }
                aug.push(a, a, y_f);
                aug.push(b, b, y_f);
                aug.push(a, b, -y_f);
                aug.push(b, a, -y_f);
            }
        }
    }

    let aug = CscMatrix::from(&aug);
    let real_sys = complex_system_matrix(&aug);
    let (mut ap, mut ai, mut ax) = real_sys.disassemble();
    solver.reset();

    let mut b = complex_rhs(&rhs);
    solver
        .solve(
            ap.as_mut_slice(),
            ai.as_mut_slice(),
            ax.as_mut_slice(),
            b.as_mut_slice(),
            2 * n,
        )
        .map_err(|_| SolverError::IllPosed {
            what: "no source feeds the faulted island".into(),
        })?;
    let v = complex_solution(&b);

    // Fault current: whatever the original nodal balance no longer absorbs.
    let residual = i_src - &(ybus * &v);
    let fault_rows: Vec<usize> = match stamp {
        FaultStamp::ToGround { rows, .. } => rows.clone(),
        FaultStamp::Bridge { a, .. } => vec![*a],
    };
    let i_fault = fault_rows.iter().map(|&r| residual[r]).collect();

    debug!(rows = fault_rows.len(), "fault solved");
    Ok((v, i_fault))
}

/// Converts a per-unit current magnitude into kA at the given rated voltage.
pub fn current_base_ka(sbase_mva: f64, u_rated_kv: f64) -> f64 {
    sbase_mva / (3.0f64.sqrt() * u_rated_kv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::solver::DefaultSolver;

    fn single_source(z_src: Complex64, c: f64) -> (CscMatrix<Complex64>, DVector<Complex64>) {
        let y = Complex64::new(1.0, 0.0) / z_src;
        let mut coo = CooMatrix::new(1, 1);
        coo.push(0, 0, y);
        let ybus = CscMatrix::from(&coo);
        let i_src = DVector::from_vec(vec![y * Complex64::new(c, 0.0)]);
        (ybus, i_src)
    }

    /// Bolted fault on a single source node: the node voltage collapses to
    /// zero and the current equals `c / z_src` in per-unit.
    #[test]
    fn test_bolted_single_node() {
        let z = Complex64::new(0.0, 0.1);
        let c = 1.10;
        let (ybus, i_src) = single_source(z, c);
        let stamp = FaultStamp::ToGround {
            rows: vec![0],
            z_fault: Complex64::default(),
        };
        let mut solver = DefaultSolver::default();
        let (v, i_fault) = solve_fault(&ybus, &i_src, &stamp, &mut solver).unwrap();

        assert!(v[0].norm() < 1e-12);
        let expected = c / z.norm();
        assert!((i_fault[0].norm() - expected).abs() < 1e-9);
    }

    /// With fault impedance, current and retained voltage follow the
    /// two-impedance divider.
    #[test]
    fn test_impedance_fault_divider() {
        let z_src = Complex64::new(0.0, 0.1);
        let z_f = Complex64::new(0.05, 0.0);
        let c = 1.0;
        let (ybus, i_src) = single_source(z_src, c);
        let stamp = FaultStamp::ToGround {
            rows: vec![0],
            z_fault: z_f,
        };
        let mut solver = DefaultSolver::default();
        let (v, i_fault) = solve_fault(&ybus, &i_src, &stamp, &mut solver).unwrap();

        let expected_i = (Complex64::new(c, 0.0) / (z_src + z_f)).norm();
        let expected_v = (Complex64::new(c, 0.0) * z_f / (z_src + z_f)).norm();
        assert!((i_fault[0].norm() - expected_i).abs() < 1e-9);
        assert!((v[0].norm() - expected_v).abs() < 1e-9);
    }

    /// A faulted network with no source admittance is singular.
    #[test]
    fn test_unfed_fault_ill_posed() {
        let mut coo = CooMatrix::new(2, 2);
        let y = Complex64::new(1.0, -3.0);
        coo.push(0, 0, y);
        coo.push(1, 1, y);
        coo.push(0, 1, -y);
        coo.push(1, 0, -y);
        // Pure branch matrix, no source: rank deficient.
        let ybus = CscMatrix::from(&coo);
        let i_src = DVector::from_element(2, Complex64::default());
        let stamp = FaultStamp::ToGround {
            rows: vec![],
            z_fault: Complex64::default(),
        };
        let mut solver = DefaultSolver::default();
        let err = solve_fault(&ybus, &i_src, &stamp, &mut solver).unwrap_err();
        assert!(matches!(err, SolverError::IllPosed { .. }));
    }

    /// Bridged rows end at the same potential and exchange the full current.
    #[test]
    fn test_bridge_equalizes_voltages() {
        // Two source nodes with different strengths, bolted phase bridge.
        let ya = Complex64::new(1.0, 0.0) / Complex64::new(0.0, 0.1);
        let yb = Complex64::new(1.0, 0.0) / Complex64::new(0.0, 0.2);
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, ya);
        coo.push(1, 1, yb);
        let ybus = CscMatrix::from(&coo);
        let i_src = DVector::from_vec(vec![
            ya * Complex64::new(1.0, 0.0),
            yb * Complex64::new(0.5, 0.0),
        ]);

        let stamp = FaultStamp::Bridge {
            a: 0,
            b: 1,
            z_fault: Complex64::default(),
        };
        let mut solver = DefaultSolver::default();
        let (v, i_fault) = solve_fault(&ybus, &i_src, &stamp, &mut solver).unwrap();

        assert!((v[0] - v[1]).norm() < 1e-12);
        // Current into the bridge equals the imbalance the strong source covers.
        assert!(i_fault[0].norm() > 0.0);
    }

    #[test]
    fn test_voltage_factors() {
        assert_eq!(VoltageScaling::Maximum.factor(), 1.10);
        assert_eq!(VoltageScaling::Minimum.factor(), 0.95);
    }

    #[test]
    fn test_current_base() {
        // 100 MVA at 10 kV: 5.7735 kA base.
        let base = current_base_ka(100.0, 10.0);
        assert!((base - 5.773502691896258).abs() < 1e-12);
    }
}
