use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;
use tracing::debug;

use super::error::{SolverError, SolverResult};
use super::solver::Solve;
use super::sparse::{Conjugate, complex_rhs, complex_solution, complex_system_matrix};

/// One measured quantity attached to a node of the solver graph.
#[derive(Debug, Clone)]
pub enum MeasurementKind {
    /// Voltage phasor in per-unit; a NaN angle means magnitude-only, the
    /// estimator then reuses the angle of its current state.
    Voltage { vm_pu: f64, va_rad: f64 },
    /// Injected complex power in per-unit.
    PowerInjection { s: Complex64 },
    /// Injected current phasor in per-unit.
    CurrentInjection { i: Complex64 },
}

#[derive(Debug, Clone)]
pub struct MeasuredValue {
    /// Node position in solver ordering.
    pub node: usize,
    pub kind: MeasurementKind,
    pub variance: f64,
}

/// Weighted-least-squares estimation graph with a fixed measurement matrix.
///
/// Voltage measurements contribute unit rows, power and current measurements
/// contribute the matching admittance row, so the gain matrix `H* W H` is
/// constant across iterations and its factorization pattern is reused. Only
/// the right-hand side moves as power measurements are re-linearized at the
/// latest voltage estimate.
#[derive(Debug)]
pub struct MeasurementGraph {
    node_count: usize,
    measurements: Vec<MeasuredValue>,
    /// `H* W`, applied to the measurement vector each iteration.
    hw: CscMatrix<Complex64>,
    /// `H* W H`, the constant gain matrix.
    gain: CscMatrix<Complex64>,
}

impl MeasurementGraph {
    /// Assembles the estimation graph, rejecting configurations that cannot
    /// be estimated before any numeric work starts.
    pub fn build(
        ybus: &CscMatrix<Complex64>,
        node_count: usize,
        measurements: Vec<MeasuredValue>,
    ) -> SolverResult<Self> {
        if measurements.is_empty() {
            return Err(SolverError::Config {
                what: "no measurements supplied".into(),
            });
        }
        if !measurements
            .iter()
            .any(|m| matches!(m.kind, MeasurementKind::Voltage { .. }))
        {
            return Err(SolverError::Config {
                what: "estimation needs at least one voltage measurement".into(),
            });
        }
        for (idx, m) in measurements.iter().enumerate() {
            if m.node >= node_count {
                return Err(SolverError::Config {
                    what: format!("measurement {idx} references unknown node {}", m.node),
                });
            }
            if !(m.variance > 0.0) {
                return Err(SolverError::Config {
                    what: format!("measurement {idx} has non-positive variance"),
                });
            }
        }

        let m_count = measurements.len();
        let mut h = CooMatrix::new(m_count, node_count);
        for (row, m) in measurements.iter().enumerate() {
            match m.kind {
                MeasurementKind::Voltage { .. } => {
                    h.push(row, m.node, Complex64::new(1.0, 0.0));
                }
                MeasurementKind::PowerInjection { .. } | MeasurementKind::CurrentInjection { .. } => {
                    // Injected current at the node is the admittance row times V.
                    for (r, c, v) in ybus.triplet_iter() {
                        if r == m.node {
                            h.push(row, c, *v);
                        }
                    }
                }
            }
        }
        let h = CscMatrix::from(&h);

        let mut weights: CscMatrix<Complex64> = CscMatrix::identity(m_count);
        for (row, m) in measurements.iter().enumerate() {
            // Identity values are laid out one per column in order.
            weights.values_mut()[row] = Complex64::new(1.0 / m.variance, 0.0);
        }

        let h_conj_t = h.transpose().conjugate();
        let hw = &h_conj_t * &weights;
        let gain = &hw * &h;

        Ok(MeasurementGraph {
            node_count,
            measurements,
            hw,
            gain,
        })
    }

    /// Runs the iterative-linear estimation until the largest state update
    /// falls below the tolerance.
    pub fn solve<Solver: Solve>(
        &self,
        v_init: &DVector<Complex64>,
        tolerance: f64,
        max_iter: usize,
        solver: &mut Solver,
    ) -> SolverResult<(DVector<Complex64>, usize)> {
        let real_sys = complex_system_matrix(&self.gain);
        let (mut ap, mut ai, mut ax) = real_sys.disassemble();
        solver.reset();

        let mut v = v_init.clone();
        let mut max_dev = f64::MAX;
        for iterations in 1..=max_iter {
            let z = DVector::from_iterator(
                self.measurements.len(),
                self.measurements.iter().map(|m| match m.kind {
                    MeasurementKind::Voltage { vm_pu, va_rad } => {
                        if va_rad.is_nan() {
                            let cur = v[m.node];
                            let norm = cur.norm();
                            if norm > 0.0 {
                                cur / norm * vm_pu
                            } else {
                                Complex64::new(vm_pu, 0.0)
                            }
                        } else {
                            Complex64::from_polar(vm_pu, va_rad)
                        }
                    }
                    MeasurementKind::PowerInjection { s } => (s / v[m.node]).conj(),
                    MeasurementKind::CurrentInjection { i } => i,
                }),
            );

            let rhs: DVector<Complex64> = &self.hw * &z;
            let mut b = complex_rhs(&rhs);
            solver
                .solve(
                    ap.as_mut_slice(),
                    ai.as_mut_slice(),
                    ax.as_mut_slice(),
                    b.as_mut_slice(),
                    2 * self.node_count,
                )
                .map_err(|_| SolverError::IllPosed {
                    what: "measurement set does not observe the network".into(),
                })?;
            let v_new = complex_solution(&b);

            max_dev = (0..self.node_count).fold(0.0f64, |acc, k| acc.max((v_new[k] - v[k]).norm()));
            v = v_new;
            debug!(iterations, max_dev, "estimation sweep");
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
}
