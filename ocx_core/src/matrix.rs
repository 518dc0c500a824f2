//! Rank-revealing Moore-Penrose pseudo-inverse and eigenvalue-based
//! projection onto the positive semi-definite cone.

use nalgebra::DMatrix;
use tracing::warn;

/// Rank-revealing Moore-Penrose pseudo-inverse.
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    /// Minimum-norm right inverse, `cols x rows` of the input.
    pub pinv: DMatrix<f64>,
    /// Numerical rank at the given tolerance.
    pub rank: usize,
    /// Rows beyond the numerical rank (linearly dependent constraints).
    pub dropped_rows: usize,
}

/// Compute `D†` via SVD, truncating singular values below
/// `rank_tol * sigma_max`. Rank-deficient rows are dropped from the inverse
/// with a diagnostic; the identities `D D† D = D` and `D† D D† = D†` hold on
/// the retained range.
pub fn pseudo_inverse(m: &DMatrix<f64>, rank_tol: f64) -> PseudoInverse {
    let (rows, cols) = m.shape();
    if rows == 0 || cols == 0 {
        return PseudoInverse { pinv: DMatrix::zeros(cols, rows), rank: 0, dropped_rows: 0 };
    }
    let svd = m.clone().svd(true, true);
    let sigma_max = svd.singular_values.max();
    let cutoff = rank_tol * sigma_max.max(1.0e-300);
    let rank = svd.singular_values.iter().filter(|&&s| s > cutoff).count();
    if rank < rows.min(cols) || rank < rows {
        warn!(rows, cols, rank, "rank-deficient constraint matrix, dropping dependent rows");
    }

    let u = svd.u.as_ref().expect("svd with u requested");
    let v_t = svd.v_t.as_ref().expect("svd with v_t requested");
    let mut pinv = DMatrix::zeros(cols, rows);
    for k in 0..rank {
        let sigma = svd.singular_values[k];
        let vk = v_t.row(k).transpose();
        let uk = u.column(k);
        // pinv += v_k * u_k' / sigma
        for i in 0..cols {
            for j in 0..rows {
                pinv[(i, j)] += vk[i] * uk[j] / sigma;
            }
        }
    }
    PseudoInverse { pinv, rank, dropped_rows: rows.saturating_sub(rank) }
}

/// Symmetrize in place: `m := 0.5 (m + m')`.
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// Project a symmetric matrix onto the PSD cone by clipping eigenvalues
/// below `floor` to zero and reconstructing. Returns the number of clipped
/// eigenvalues. The input is symmetrized first.
pub fn project_psd(m: &mut DMatrix<f64>, floor: f64) -> usize {
    symmetrize(m);
    let eig = m.clone().symmetric_eigen();
    let mut clipped = 0;
    let mut values = eig.eigenvalues.clone();
    for v in values.iter_mut() {
        if *v < floor {
            *v = 0.0;
            clipped += 1;
        }
    }
    if clipped > 0 {
        let q = &eig.eigenvectors;
        *m = q * DMatrix::from_diagonal(&values) * q.transpose();
        symmetrize(m);
    }
    clipped
}

/// True when every entry is finite.
pub fn all_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TOL: f64 = 1e-9;

    #[test]
    fn full_rank_right_inverse() {
        let d = DMatrix::from_row_slice(1, 2, &[3.0, 4.0]);
        let p = pseudo_inverse(&d, 1e-9);
        assert_eq!(p.rank, 1);
        assert_eq!(p.dropped_rows, 0);
        let dd = &d * &p.pinv;
        assert_relative_eq!(dd[(0, 0)], 1.0, epsilon = TOL);
    }

    #[test]
    fn penrose_identities_under_rank_deficiency() {
        // Second row is a multiple of the first.
        let d = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 0.0, 2.0, 4.0, 0.0]);
        let p = pseudo_inverse(&d, 1e-9);
        assert_eq!(p.rank, 1);
        assert_eq!(p.dropped_rows, 1);
        let d_dag = &p.pinv;
        let lhs = &d * d_dag * &d;
        for (a, b) in lhs.iter().zip(d.iter()) {
            assert_relative_eq!(a, b, epsilon = TOL);
        }
        let lhs = d_dag * &d * d_dag;
        for (a, b) in lhs.iter().zip(d_dag.iter()) {
            assert_relative_eq!(a, b, epsilon = TOL);
        }
    }

    #[test]
    fn projector_is_idempotent() {
        let d = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let p = pseudo_inverse(&d, 1e-9);
        let proj = DMatrix::identity(2, 2) - &p.pinv * &d;
        let pp = &proj * &proj;
        for (a, b) in pp.iter().zip(proj.iter()) {
            assert_relative_eq!(a, b, epsilon = TOL);
        }
    }

    #[test]
    fn psd_projection_clips_negative_eigenvalues() {
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -2.0]);
        let clipped = project_psd(&mut m, 0.0);
        assert_eq!(clipped, 1);
        let eig = m.clone().symmetric_eigen();
        assert!(eig.eigenvalues.iter().all(|&v| v >= -TOL));
        assert_relative_eq!(m[(0, 0)], 1.0, epsilon = TOL);
        assert_relative_eq!(m[(1, 1)], 0.0, epsilon = TOL);
    }

    #[test]
    fn psd_projection_keeps_psd_input() {
        let mut m = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let before = m.clone();
        assert_eq!(project_psd(&mut m, 1e-12), 0);
        for (a, b) in m.iter().zip(before.iter()) {
            assert_relative_eq!(a, b, epsilon = TOL);
        }
    }
}
