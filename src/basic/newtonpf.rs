use std::f64::consts::PI;

use super::error::{SolverError, SolverResult};
use super::solver::{FactorizeFailure, Solve};
use super::sparse::{Conjugate, RealImag, csc_block, csc_columns, csc_hstack, csc_vstack};

use nalgebra::*;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;
use simba::simd::SimdComplexField;
use tracing::debug;

/// Full Newton-Raphson power flow over a permuted admittance matrix.
///
/// `Ybus`, `Sbus` and `v_init` must already be in solver ordering: PV nodes
/// first, then PQ nodes, then reference nodes. Returns the converged voltage
/// vector and the iteration count, or the divergence/ill-posed diagnosis.
#[allow(non_snake_case)]
pub fn newton_pf<Solver: Solve>(
    Ybus: &CscMatrix<Complex64>,
    Sbus: &DVector<Complex64>,
    v_init: &DVector<Complex64>,
    npv: usize,
    npq: usize,
    tolerance: f64,
    max_iter: usize,
    solver: &mut Solver,
) -> SolverResult<(DVector<Complex64>, usize)> {
    let mut v = v_init.clone();
    let mut v_norm = v.map(|e| e.simd_signum());

    let mut mis = &v.component_mul(&(Ybus * &v).conjugate()) - Sbus;

    let n_ext = v.len() - npv - npq;
    let n_bus = npq + npv;
    let num_state = npv + 2 * npq;

    let mut F = DVector::zeros(num_state);
    assemble_f(&mut F, n_bus, &mis, num_state, npv);

    let mut v_m = v.map(|e| e.simd_modulus());
    let mut v_a = v.map(|e| e.simd_argument());

    // The Jacobian pattern is fixed for a given topology; drop whatever
    // symbolic analysis the backend kept from an unrelated system.
    solver.reset();

    let mut max_dev = F.amax();
    for iterations in 1..=max_iter {
        let (dS_dVm, dS_dVa) = ds_dv(Ybus, &v, &v_norm);
        let jacobian = build_jacobian(&dS_dVm, &dS_dVa, npv, n_ext);

        let n = jacobian.nrows();
        let (mut Ap, mut Ai, mut Ax) = jacobian.disassemble();
        solver
            .solve(
                Ap.as_mut_slice(),
                Ai.as_mut_slice(),
                Ax.as_mut_slice(),
                F.as_mut_slice(),
                n,
            )
            .map_err(|e| match e {
                FactorizeFailure::Singular | FactorizeFailure::Symbolic => SolverError::IllPosed {
                    what: "singular power flow Jacobian".into(),
                },
            })?;

        let dx = &F;
        update_v(
            &mut v_a, dx, n_bus, &mut v_m, npv, num_state, &mut v_norm, &mut v,
        );

        v.component_mul(&(Ybus * &v).conjugate())
            .sub_to(Sbus, &mut mis);
        assemble_f(&mut F, n_bus, &mis, num_state, npv);

        max_dev = F.amax();
        debug!(iterations, max_dev, "newton step");
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

/// Packs the active mismatch of all load/generator nodes and the reactive
/// mismatch of load nodes into the residual vector.
#[inline(always)]
fn assemble_f(
    f: &mut DVector<f64>,
    n_bus: usize,
    mis: &DVector<Complex64>,
    num_state: usize,
    npv: usize,
) {
    f.rows_range_mut(0..n_bus)
        .zip_apply(&mis.rows_range(0..n_bus), |a, b| *a = b.simd_real());
    f.rows_range_mut(n_bus..num_state)
        .zip_apply(&mis.rows_range(npv..n_bus), |a, b| {
            *a = b.simd_imaginary()
        });
}

#[inline(always)]
fn update_v(
    v_a: &mut DVector<f64>,
    dx: &DVector<f64>,
    n_bus: usize,
    v_m: &mut DVector<f64>,
    npv: usize,
    num_state: usize,
    v_norm: &mut DVector<Complex64>,
    v: &mut DVector<Complex64>,
) {
    v_a.rows_range_mut(0..n_bus)
        .zip_apply(&dx.rows_range(0..n_bus), |a, b| {
            (*a) -= b;
            *a = a.rem_euclid(2.0 * PI);
        });
    let mut vm_pq = v_m.rows_range_mut(npv..n_bus);
    vm_pq.zip_apply(&dx.rows_range(n_bus..num_state), |a, b| (*a) -= b);

    v_norm.zip_apply(&*v_a, |a, va| *a = Complex64::from_polar(1.0, va));
    v.zip_zip_apply(v_norm, v_m, |a, e, vm| *a = vm * e);
}

/// Partial derivatives of the injected power with respect to voltage
/// magnitude and angle, in complex matrix notation (MATPOWER TN2,
/// R. D. Zimmerman, "AC Power Flows, Generalized OPF Costs and their
/// Derivatives using Complex Matrix Notation").
#[allow(non_snake_case)]
fn ds_dv(
    Ybus: &CscMatrix<Complex64>,
    v: &DVector<Complex64>,
    v_norm: &DVector<Complex64>,
) -> (CscMatrix<Complex64>, CscMatrix<Complex64>) {
    let i_bus = Ybus * v;

    let diag_of = |vec: &DVector<Complex64>| {
        let mut d = CscMatrix::identity(vec.len());
        d.values_mut().copy_from_slice(vec.as_slice());
        d
    };
    let diagV = diag_of(v);
    let diagVnorm = diag_of(v_norm);
    let diagI = diag_of(&i_bus);

    let dS_dVm = &diagV * (Ybus * &diagVnorm).conjugate() + diagI.conjugate() * &diagVnorm;
    let dS_dVa = &diagV * (diagI - Ybus * &diagV).conjugate() * Complex64::i();
    (dS_dVm, dS_dVa)
}

#[allow(non_snake_case)]
#[inline(always)]
fn build_jacobian(
    ds_dvm: &CscMatrix<Complex64>,
    ds_dva: &CscMatrix<Complex64>,
    npv: usize,
    n_ext: usize,
) -> CscMatrix<f64> {
    let (real, imag) = csc_block(
        ds_dva,
        (0, 0),
        (ds_dva.nrows() - n_ext, ds_dva.ncols() - n_ext),
    )
    .real_imag();
    let (real2, imag2) = csc_block(
        ds_dvm,
        (0, 0),
        (ds_dvm.nrows() - n_ext, ds_dvm.ncols() - n_ext),
    )
    .real_imag();

    let J11 = real;
    let J12 = csc_columns(&real2, npv, real2.ncols());
    let J21 = csc_block(&imag, (npv, 0), (imag.nrows() - npv, imag.ncols()));
    let J22 = csc_block(&imag2, (npv, npv), (imag2.nrows() - npv, imag2.ncols() - npv));

    csc_vstack(&[&csc_hstack(&[&J11, &J12]), &csc_hstack(&[&J21, &J22])])
}
