//! Matrix-free iterative solvers for the local problems of a sweep.
//!
//! Both solvers only see the local operator through a closure computing
//! `H|v⟩`, and work on flat vectors over the symmetry-allowed entries of a site
//! tensor:
//! * [`davidson`]: lowest eigenpairs of a real symmetric operator, with the
//!   diagonal as preconditioner and several roots for state averaging;
//! * [`minres`]: preconditioned MINRES for symmetric (possibly indefinite)
//!   linear systems.
//!
//! Both report non-convergence through their return values, never as an
//! error: hitting the iteration cap returns the best available result.

use nalgebra as na;
use tracing::trace;

/// Convergence control shared by the iterative solvers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverControl {
    /// Threshold on the squared residual norm.
    pub conv: f64,
    /// Hard iteration cap.
    pub max_iter: usize,
    /// Iteration count after which the solve stops as soon as the squared
    /// residual is below `LOOSE_FACTOR * conv`.
    pub soft_max_iter: Option<usize>,
}

impl SolverControl {
    /// Factor applied to `conv` after the soft iteration cap.
    pub const LOOSE_FACTOR: f64 = 100.0;

    pub fn new(conv: f64, max_iter: usize, soft_max_iter: Option<usize>) -> Self {
        Self { conv, max_iter, soft_max_iter }
    }

    fn should_stop(&self, iter: usize, res: f64) -> bool {
        if res < self.conv { return true; }
        match self.soft_max_iter {
            Some(soft) => iter >= soft && res < self.conv * Self::LOOSE_FACTOR,
            None => false,
        }
    }
}

/// Result of [`davidson`].
#[derive(Clone, Debug)]
pub struct Eigs {
    /// Ritz values in ascending order.
    pub values: Vec<f64>,
    /// Normalized Ritz vectors.
    pub vectors: Vec<na::DVector<f64>>,
    /// Squared residual norms.
    pub residuals: Vec<f64>,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Number of operator applications.
    pub matvecs: usize,
    /// Whether all residuals met the threshold.
    pub converged: bool,
}

// problems at most this large are diagonalized densely
const DENSE_LIMIT: usize = 24;
// maximum subspace size per root before a restart
const SPACE_PER_ROOT: usize = 16;
const MIN_SPACE: usize = 24;
const DENOM_FLOOR: f64 = 1e-10;

fn orthonormalize_against(
    v: &mut na::DVector<f64>,
    basis: &[na::DVector<f64>],
) -> f64
{
    for _ in 0..2 {
        for b in basis.iter() {
            let ov = b.dot(v);
            v.axpy(-ov, b, 1.0);
        }
    }
    let norm = v.norm();
    if norm > 0.0 { v.scale_mut(1.0 / norm); }
    norm
}

fn sorted_eigen(mat: na::DMatrix<f64>) -> (Vec<f64>, na::DMatrix<f64>) {
    let sym = (&mat + mat.transpose()) * 0.5;
    let eig = sym.symmetric_eigen();
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|a, b| eig.eigenvalues[*a].total_cmp(&eig.eigenvalues[*b]));
    let values = order.iter().map(|k| eig.eigenvalues[*k]).collect();
    let vectors = eig.eigenvectors.select_columns(order.iter());
    (values, vectors)
}

fn dense_eigs<F>(matvec: &mut F, n: usize, k: usize) -> Eigs
where F: FnMut(&na::DVector<f64>) -> na::DVector<f64>
{
    let mut mat = na::DMatrix::zeros(n, n);
    for j in 0..n {
        let mut e = na::DVector::zeros(n);
        e[j] = 1.0;
        mat.set_column(j, &matvec(&e));
    }
    let (values, vectors) = sorted_eigen(mat);
    Eigs {
        values: values.into_iter().take(k).collect(),
        vectors: (0..k).map(|j| vectors.column(j).into_owned()).collect(),
        residuals: vec![0.0; k],
        iterations: 1,
        matvecs: n,
        converged: true,
    }
}

/// Find the `guesses.len()` lowest eigenpairs of the symmetric operator
/// `matvec` with a Davidson iteration.
///
/// `diag` is the diagonal of the operator, used as preconditioner. Guesses that
/// are linearly dependent (or zero) are replaced by unit vectors on the
/// smallest diagonal entries.
pub fn davidson<F>(
    mut matvec: F,
    diag: &na::DVector<f64>,
    guesses: Vec<na::DVector<f64>>,
    ctrl: &SolverControl,
) -> Eigs
where F: FnMut(&na::DVector<f64>) -> na::DVector<f64>
{
    let n = diag.len();
    let k = guesses.len().max(1).min(n);
    if n == 0 {
        return Eigs {
            values: Vec::new(),
            vectors: Vec::new(),
            residuals: Vec::new(),
            iterations: 0,
            matvecs: 0,
            converged: true,
        };
    }
    if n <= DENSE_LIMIT { return dense_eigs(&mut matvec, n, k); }

    let mut basis: Vec<na::DVector<f64>> = Vec::new();
    for mut g in guesses.into_iter().take(k) {
        if orthonormalize_against(&mut g, &basis) > 1e-8 { basis.push(g); }
    }
    let mut by_diag: Vec<usize> = (0..n).collect();
    by_diag.sort_by(|a, b| diag[*a].total_cmp(&diag[*b]));
    let mut fill = by_diag.into_iter();
    while basis.len() < k {
        let Some(j) = fill.next() else { break; };
        let mut e = na::DVector::zeros(n);
        e[j] = 1.0;
        if orthonormalize_against(&mut e, &basis) > 1e-8 { basis.push(e); }
    }
    let mut sigma: Vec<na::DVector<f64>> = basis.iter().map(&mut matvec).collect();
    let mut matvecs = sigma.len();
    let max_space = (SPACE_PER_ROOT * k).max(MIN_SPACE).min(n);

    let mut iterations: usize = 0;
    loop {
        iterations += 1;
        let m = basis.len();
        let sub = na::DMatrix::from_fn(m, m, |i, j| basis[i].dot(&sigma[j]));
        let (theta, y) = sorted_eigen(sub);
        let mut ritz = Vec::with_capacity(k);
        let mut hritz = Vec::with_capacity(k);
        let mut residuals = Vec::with_capacity(k);
        for j in 0..k {
            let mut x = na::DVector::zeros(n);
            let mut hx = na::DVector::zeros(n);
            for i in 0..m {
                x.axpy(y[(i, j)], &basis[i], 1.0);
                hx.axpy(y[(i, j)], &sigma[i], 1.0);
            }
            let r = &hx - &x * theta[j];
            residuals.push(r.norm_squared());
            ritz.push(x);
            hritz.push(hx);
        }
        let worst = residuals.iter().copied().fold(0.0, f64::max);
        trace!("davidson iter {iterations}: e = {:.12} res = {:.3e}", theta[0], worst);
        let done = ctrl.should_stop(iterations, worst);
        if done || iterations >= ctrl.max_iter {
            let values = theta.into_iter().take(k).collect();
            let vectors =
                ritz.into_iter()
                .map(|x| { let nrm = x.norm(); x / nrm })
                .collect();
            return Eigs {
                values,
                vectors,
                converged: worst < ctrl.conv,
                residuals,
                iterations,
                matvecs,
            };
        }

        let mut corrections = Vec::new();
        for j in 0..k {
            if residuals[j] < ctrl.conv { continue; }
            let r = &hritz[j] - &ritz[j] * theta[j];
            let t =
                na::DVector::from_fn(n, |i, _| {
                    let denom = theta[j] - diag[i];
                    let denom =
                        if denom.abs() < DENOM_FLOOR {
                            DENOM_FLOOR.copysign(denom)
                        } else {
                            denom
                        };
                    r[i] / denom
                });
            corrections.push(t);
        }
        if basis.len() + corrections.len() > max_space {
            // restart from the current Ritz vectors
            basis.clear();
            sigma.clear();
            for (x, hx) in ritz.iter().zip(hritz.iter()) {
                let nrm = x.norm();
                if nrm > 1e-12 {
                    basis.push(x / nrm);
                    sigma.push(hx / nrm);
                }
            }
        }
        let mut added: usize = 0;
        for mut t in corrections.into_iter() {
            if orthonormalize_against(&mut t, &basis) > 1e-10 {
                sigma.push(matvec(&t));
                basis.push(t);
                matvecs += 1;
                added += 1;
            }
        }
        if added == 0 {
            // no new directions
            let values = theta.into_iter().take(k).collect();
            let vectors =
                ritz.into_iter()
                .map(|x| { let nrm = x.norm(); x / nrm })
                .collect();
            return Eigs {
                values,
                vectors,
                converged: worst < ctrl.conv,
                residuals,
                iterations,
                matvecs,
            };
        }
    }
}

/// Result of [`minres`].
#[derive(Clone, Debug)]
pub struct LinearSolve {
    /// The solution.
    pub x: na::DVector<f64>,
    /// Estimated squared (preconditioned) residual norm.
    pub residual: f64,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Whether the residual met the threshold.
    pub converged: bool,
}

/// Solve the symmetric system `A x = b` with preconditioned MINRES, starting
/// from `x0`.
///
/// `precond` applies the inverse of a symmetric positive-definite
/// preconditioner.
pub fn minres<F, P>(
    mut matvec: F,
    mut precond: P,
    b: &na::DVector<f64>,
    x0: na::DVector<f64>,
    ctrl: &SolverControl,
) -> LinearSolve
where
    F: FnMut(&na::DVector<f64>) -> na::DVector<f64>,
    P: FnMut(&na::DVector<f64>) -> na::DVector<f64>,
{
    let n = b.len();
    let mut x = x0;
    let mut r1 = b - matvec(&x);
    let mut y = precond(&r1);
    let beta1_sq = r1.dot(&y);
    if beta1_sq <= 0.0 || beta1_sq < ctrl.conv * 1e-6 {
        return LinearSolve {
            x,
            residual: beta1_sq.max(0.0),
            iterations: 0,
            converged: true,
        };
    }
    let beta1 = beta1_sq.sqrt();
    let mut r2 = r1.clone();
    let mut oldb: f64 = 0.0;
    let mut beta = beta1;
    let mut dbar: f64 = 0.0;
    let mut epsln: f64 = 0.0;
    let mut phibar = beta1;
    let mut cs: f64 = -1.0;
    let mut sn: f64 = 0.0;
    let mut w = na::DVector::zeros(n);
    let mut w2 = na::DVector::zeros(n);

    let mut iterations: usize = 0;
    loop {
        iterations += 1;
        let v = &y / beta;
        y = matvec(&v);
        if iterations >= 2 { y.axpy(-beta / oldb, &r1, 1.0); }
        let alfa = v.dot(&y);
        y.axpy(-alfa / beta, &r2, 1.0);
        r1 = r2;
        r2 = y.clone();
        y = precond(&r2);
        oldb = beta;
        let beta_sq = r2.dot(&y);
        beta = beta_sq.max(0.0).sqrt();

        // apply the previous rotation, then compute the next one
        let oldeps = epsln;
        let delta = cs * dbar + sn * alfa;
        let gbar = sn * dbar - cs * alfa;
        epsln = sn * beta;
        dbar = -cs * beta;
        let gamma = gbar.hypot(beta).max(f64::EPSILON);
        cs = gbar / gamma;
        sn = beta / gamma;
        let phi = cs * phibar;
        phibar *= sn;

        let w1 = std::mem::replace(&mut w2, w);
        w = (&v - &w1 * oldeps - &w2 * delta) / gamma;
        x.axpy(phi, &w, 1.0);

        let residual = phibar * phibar;
        trace!("minres iter {iterations}: res = {residual:.3e}");
        let invariant = beta < f64::EPSILON * beta1;
        if ctrl.should_stop(iterations, residual) || invariant {
            return LinearSolve {
                x,
                residual,
                iterations,
                converged: residual < ctrl.conv || invariant,
            };
        }
        if iterations >= ctrl.max_iter {
            return LinearSolve { x, residual, iterations, converged: false };
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use super::*;

    fn random_symmetric(n: usize, seed: u64) -> na::DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let a = na::DMatrix::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
        let mut h = &a + a.transpose();
        for i in 0..n { h[(i, i)] += i as f64 * 0.5; }
        h
    }

    #[test]
    fn davidson_matches_dense() {
        let n = 60;
        let h = random_symmetric(n, 1);
        let diag = h.diagonal();
        let (exact, _) = sorted_eigen(h.clone());
        let ctrl = SolverControl::new(1e-12, 500, None);
        let guesses = vec![na::DVector::from_element(n, 1.0), na::DVector::from_fn(n, |i, _| i as f64)];
        let eigs = davidson(|v| &h * v, &diag, guesses, &ctrl);
        assert!(eigs.converged);
        assert!((eigs.values[0] - exact[0]).abs() < 1e-9);
        assert!((eigs.values[1] - exact[1]).abs() < 1e-9);
        let r = &h * &eigs.vectors[0] - &eigs.vectors[0] * eigs.values[0];
        assert!(r.norm() < 1e-5);
    }

    #[test]
    fn davidson_small_problem_is_dense() {
        let h = random_symmetric(5, 2);
        let diag = h.diagonal();
        let ctrl = SolverControl::new(1e-12, 10, None);
        let eigs = davidson(|v| &h * v, &diag, vec![na::DVector::from_element(5, 1.0)], &ctrl);
        let (exact, _) = sorted_eigen(h.clone());
        assert_eq!(eigs.matvecs, 5);
        assert!((eigs.values[0] - exact[0]).abs() < 1e-12);
    }

    #[test]
    fn davidson_hard_cap_returns_best_vector() {
        let n = 80;
        let h = random_symmetric(n, 3);
        let diag = h.diagonal();
        let ctrl = SolverControl::new(1e-30, 2, None);
        let eigs = davidson(|v| &h * v, &diag, vec![na::DVector::from_element(n, 1.0)], &ctrl);
        assert!(!eigs.converged);
        assert_eq!(eigs.iterations, 2);
        assert!((eigs.vectors[0].norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn davidson_without_new_directions_keeps_the_residual_test() {
        // a hopping chain on the first four coordinates, decoupled from the rest
        let n = 40;
        let h =
            na::DMatrix::from_fn(n, n, |i, j| {
                if i < 4 && j < 4 && i.abs_diff(j) == 1 {
                    1.0
                } else if i == j && i >= 4 {
                    10.0 + i as f64
                } else {
                    0.0
                }
            });
        let diag = h.diagonal();
        let guess = na::DVector::from_fn(n, |i, _| if i < 4 { 0.5_f64.powi(i as i32) } else { 0.0 });
        let ctrl = SolverControl::new(0.0, 100, None);
        let eigs = davidson(|v| &h * v, &diag, vec![guess], &ctrl);
        assert!(!eigs.converged);
        assert!(eigs.iterations < 100);
        assert!(eigs.matvecs <= 4);
        let golden = (1.0 + 5.0_f64.sqrt()) / 2.0;
        assert!((eigs.values[0] + golden).abs() < 1e-10, "{}", eigs.values[0]);
    }

    #[test]
    fn minres_solves_indefinite_system() {
        let n = 40;
        let h = random_symmetric(n, 4);
        let b = na::DVector::from_fn(n, |i, _| (i as f64).sin());
        let diag = h.diagonal();
        let ctrl = SolverControl::new(1e-20, 1000, None);
        let sol =
            minres(
                |v| &h * v,
                |r| r.component_div(&diag.map(|d| d.abs().max(1e-2))),
                &b,
                na::DVector::zeros(n),
                &ctrl,
            );
        let r = &h * &sol.x - &b;
        assert!(r.norm() < 1e-6, "residual {}", r.norm());
    }
}
