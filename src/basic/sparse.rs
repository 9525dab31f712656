use nalgebra::{Complex, DVector, Scalar};
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

/// Rebuilds a matrix with the same sparsity pattern and mapped values.
#[inline]
pub(crate) fn csc_map<T, U, F>(mat: &CscMatrix<T>, f: F) -> CscMatrix<U>
where
    T: Scalar,
    U: Scalar,
    F: Fn(&T) -> U,
{
    let values = mat.values().iter().map(f).collect();
    CscMatrix::try_from_pattern_and_values(mat.pattern().clone(), values)
        .expect("pattern and mapped values always agree")
}

/// Trait for computing the element-wise conjugate of a sparse matrix.
pub(crate) trait Conjugate {
    fn conjugate(&self) -> Self;
}

impl Conjugate for CscMatrix<Complex64> {
    fn conjugate(&self) -> Self {
        csc_map(self, |v| v.conj())
    }
}

/// Trait for splitting a complex sparse matrix into real and imaginary parts.
pub(crate) trait RealImag {
    type Real;

    fn real(&self) -> Self::Real;
    fn imag(&self) -> Self::Real;
    fn real_imag(&self) -> (Self::Real, Self::Real);
}

impl RealImag for CscMatrix<Complex64> {
    type Real = CscMatrix<f64>;

    fn real(&self) -> Self::Real {
        csc_map(self, |v| v.re)
    }

    fn imag(&self) -> Self::Real {
        csc_map(self, |v| v.im)
    }

    fn real_imag(&self) -> (Self::Real, Self::Real) {
        (self.real(), self.imag())
    }
}

/// Extracts the column range `[start_col, end_col)` keeping all rows.
#[inline]
pub(crate) fn csc_columns<T: Clone>(
    mat: &CscMatrix<T>,
    start_col: usize,
    end_col: usize,
) -> CscMatrix<T> {
    assert!(start_col <= end_col && end_col <= mat.ncols(), "illegal column range");
    let lo = mat.col_offsets()[start_col];
    let hi = mat.col_offsets()[end_col];

    let values = mat.values()[lo..hi].to_vec();
    let rows = mat.row_indices()[lo..hi].to_vec();
    let offsets: Vec<_> = mat.col_offsets()[start_col..=end_col]
        .iter()
        .map(|&o| o - lo)
        .collect();

    CscMatrix::try_from_csc_data(mat.nrows(), end_col - start_col, offsets, rows, values)
        .expect("column slice preserves csc invariants")
}

/// Extracts the dense block starting at `start_pos` with the given `shape`.
#[inline]
pub(crate) fn csc_block<T: Clone>(
    mat: &CscMatrix<T>,
    start_pos: (usize, usize),
    shape: (usize, usize),
) -> CscMatrix<T> {
    let (row0, col0) = start_pos;
    let (nrows, ncols) = shape;

    let mut offsets = Vec::with_capacity(ncols + 1);
    let mut rows = Vec::new();
    let mut values = Vec::new();
    offsets.push(0);

    for col in col0..(col0 + ncols) {
        let lo = mat.col_offsets()[col];
        let hi = mat.col_offsets()[col + 1];
        for k in lo..hi {
            let r = mat.row_indices()[k];
            if r >= row0 && r < row0 + nrows {
                rows.push(r - row0);
                values.push(mat.values()[k].clone());
            }
        }
        offsets.push(rows.len());
    }

    CscMatrix::try_from_csc_data(nrows, ncols, offsets, rows, values)
        .expect("block slice preserves csc invariants")
}

/// Stacks matrices left to right. All inputs must share the row count.
pub(crate) fn csc_hstack<T: Clone>(mats: &[&CscMatrix<T>]) -> CscMatrix<T> {
    let nrows = mats[0].nrows();
    let ncols: usize = mats.iter().map(|m| m.ncols()).sum();
    let nnz: usize = mats.iter().map(|m| m.nnz()).sum();

    let mut offsets = Vec::with_capacity(ncols + 1);
    let mut rows = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    offsets.push(0);

    for m in mats {
        assert_eq!(m.nrows(), nrows, "hstack inputs must share the row count");
        let base = values.len();
        rows.extend_from_slice(m.row_indices());
        values.extend(m.values().iter().cloned());
        offsets.extend(m.col_offsets()[1..].iter().map(|&o| o + base));
    }

    CscMatrix::try_from_csc_data(nrows, ncols, offsets, rows, values)
        .expect("hstack preserves csc invariants")
}

/// Stacks matrices top to bottom. All inputs must share the column count.
pub(crate) fn csc_vstack<T: Clone>(mats: &[&CscMatrix<T>]) -> CscMatrix<T> {
    let ncols = mats[0].ncols();
    let nrows: usize = mats.iter().map(|m| m.nrows()).sum();
    let nnz: usize = mats.iter().map(|m| m.nnz()).sum();

    let mut offsets = Vec::with_capacity(ncols + 1);
    let mut rows = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    offsets.push(0);

    for col in 0..ncols {
        let mut row_base = 0;
        for m in mats {
            assert_eq!(m.ncols(), ncols, "vstack inputs must share the column count");
            let lo = m.col_offsets()[col];
            let hi = m.col_offsets()[col + 1];
            for k in lo..hi {
                rows.push(m.row_indices()[k] + row_base);
                values.push(m.values()[k].clone());
            }
            row_base += m.nrows();
        }
        offsets.push(rows.len());
    }

    CscMatrix::try_from_csc_data(nrows, ncols, offsets, rows, values)
        .expect("vstack preserves csc invariants")
}

/// Expands a complex linear system `Y x = b` into its real-valued equivalent
///
/// ```text
/// [ G  -B ] [re(x)]   [re(b)]
/// [ B   G ] [im(x)] = [im(b)]
/// ```
///
/// so the real LU backends can factor it directly.
pub(crate) fn complex_system_matrix(y: &CscMatrix<Complex64>) -> CscMatrix<f64> {
    let (g, b) = y.real_imag();
    let b_neg = csc_map(&b, |v| -v);
    csc_vstack(&[&csc_hstack(&[&g, &b_neg]), &csc_hstack(&[&b, &g])])
}

/// Splits a complex vector into the stacked `[re; im]` layout.
pub(crate) fn complex_rhs(b: &DVector<Complex64>) -> DVector<f64> {
    let n = b.len();
    DVector::from_fn(2 * n, |i, _| if i < n { b[i].re } else { b[i - n].im })
}

/// Reassembles a complex vector from the stacked `[re; im]` layout.
pub(crate) fn complex_solution(x: &DVector<f64>) -> DVector<Complex64> {
    let n = x.len() / 2;
    DVector::from_fn(n, |i, _| Complex::new(x[i], x[i + n]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use nalgebra_sparse::CooMatrix;

    fn sample() -> CscMatrix<Complex64> {
        let mut coo = CooMatrix::new(3, 3);
        coo.push(0, 0, Complex::new(2.0, -1.0));
        coo.push(1, 0, Complex::new(0.5, 0.0));
        coo.push(1, 1, Complex::new(3.0, 2.0));
        coo.push(2, 2, Complex::new(1.0, 1.0));
        CscMatrix::from(&coo)
    }

    #[test]
    fn test_conjugate() {
        let a = sample();
        let c = a.conjugate();
        for ((_, _, x), (_, _, y)) in a.triplet_iter().zip(c.triplet_iter()) {
            assert_eq!(x.conj(), *y);
        }
    }

    #[test]
    fn test_real_imag_split() {
        let a = sample();
        let (g, b) = a.real_imag();
        let dense = DMatrix::from(&a);
        assert_eq!(DMatrix::from(&g), dense.map(|v| v.re));
        assert_eq!(DMatrix::from(&b), dense.map(|v| v.im));
    }

    #[test]
    fn test_hstack_vstack_shapes() {
        let a = sample().real();
        let h = csc_hstack(&[&a, &a]);
        assert_eq!((h.nrows(), h.ncols()), (3, 6));
        let v = csc_vstack(&[&a, &a]);
        assert_eq!((v.nrows(), v.ncols()), (6, 3));

        let dense = DMatrix::from(&a);
        let hd = DMatrix::from(&h);
        assert_eq!(hd.view((0, 0), (3, 3)), dense.view((0, 0), (3, 3)));
        assert_eq!(hd.view((0, 3), (3, 3)), dense.view((0, 0), (3, 3)));
    }

    #[test]
    fn test_block_and_columns() {
        let a = sample().real();
        let block = csc_block(&a, (1, 0), (2, 2));
        let dense = DMatrix::from(&a);
        assert_eq!(DMatrix::from(&block), dense.view((1, 0), (2, 2)).clone_owned());

        let cols = csc_columns(&a, 1, 3);
        assert_eq!(DMatrix::from(&cols), dense.view((0, 1), (3, 2)).clone_owned());
    }

    #[test]
    fn test_complex_expansion_round_trip() {
        let y = sample();
        let x = DVector::from_vec(vec![
            Complex::new(1.0, 2.0),
            Complex::new(-0.5, 0.25),
            Complex::new(0.0, -1.0),
        ]);
        let b_dense: DVector<Complex64> = DMatrix::from(&y) * &x;

        let real_sys = complex_system_matrix(&y);
        let rhs = complex_rhs(&b_dense);
        let expanded = DMatrix::from(&real_sys) * complex_rhs(&x);

        // The expanded operator applied to [re; im] of x matches [re; im] of Y x.
        for i in 0..rhs.len() {
            assert!((expanded[i] - rhs[i]).abs() < 1e-12);
        }

        let back = complex_solution(&complex_rhs(&x));
        assert_eq!(back, x);
    }
}
