//! The local effective operator of a sweep window.
//!
//! An [`EffectiveHamiltonian`] borrows the left and right blocks of a
//! [`MovingEnvironment`] and holds the (fused) MPO window between them. It is
//! never built as a matrix: applying it to a window tensor `ψ[u, s, v]` is
//! ```text
//!  (Hψ)_{s'} = Σ_{terms (a, b, O)} Σ_s O[s', s] · L[a] · ψ_s · R[b]ᵀ
//! ```
//! over the `m × n` physical slices `ψ_s`. Iterative solves run on the
//! vectors of symmetry-allowed entries only.

use std::time::{ Duration, Instant };
use nalgebra as na;
use tracing::warn;
use crate::{
    comm::ParallelRule,
    decompose::SplitMatrix,
    environment::{ EnvBlock, EnvError, EnvResult, MovingEnvironment },
    mpo::MpoSite,
    quantum::Sector,
    solver::{ SolverControl, davidson, minres },
    mps::Wavefunction,
    tensor::{ FuseSide, SiteTensor },
};

// floor on preconditioner denominators
const PRECOND_FLOOR: f64 = 1e-8;

/// Result of [`EffectiveHamiltonian::eigs`].
#[derive(Clone, Debug)]
pub struct EigsOutput {
    /// One energy per state, ascending.
    pub energies: Vec<f64>,
    /// Number of Davidson iterations.
    pub ndav: usize,
    /// Approximate number of floating-point operations.
    pub nflop: usize,
    pub time: Duration,
}

/// Result of [`EffectiveHamiltonian::inverse_multiply`].
#[derive(Clone, Debug)]
pub struct SolveOutput {
    /// `⟨x|b⟩`.
    pub value: f64,
    pub iterations: usize,
    pub nflop: usize,
    pub time: Duration,
}

/// Result of [`EffectiveHamiltonian::greens_function`].
#[derive(Clone, Debug)]
pub struct GreensOutput {
    /// `(⟨b|x_r⟩, ⟨b|x_i⟩)`.
    pub value: (f64, f64),
    pub iterations: usize,
    pub nflop: usize,
    pub time: Duration,
}

/// The effective operator of the current window of a [`MovingEnvironment`].
#[derive(Debug)]
pub struct EffectiveHamiltonian<'a> {
    left: &'a EnvBlock,
    right: &'a EnvBlock,
    op: MpoSite,
    first: &'a MpoSite,
    last: &'a MpoSite,
    dot: usize,
    const_e: f64,
    fuse: FuseSide,
    forward: bool,
    rule: Option<&'a ParallelRule>,
    bra: SiteTensor,
    ket: SiteTensor,
    diag: Option<na::DVector<f64>>,
    flops: usize,
}

impl MovingEnvironment {
    /// Build the effective operator of the current window for the given bra
    /// and ket window tensors.
    ///
    /// For one-site windows, the ket must be fused on `fuse`. The tensors'
    /// bond dimensions must match the blocks and their physical labels must
    /// match the window of the operator.
    pub fn eff_ham(
        &self,
        fuse: FuseSide,
        forward: bool,
        compute_diagonal: bool,
        bra: &SiteTensor,
        ket: &SiteTensor,
    ) -> EnvResult<EffectiveHamiltonian<'_>>
    {
        let i = self.center;
        if self.dot == 1 && ket.fuse_side() != fuse {
            return Err(EnvError::FuseMismatch { expected: fuse, found: ket.fuse_side() });
        }
        let op = self.mpo().window(i, self.dot)?;
        let left = self.left_block(i)?;
        let right = self.right_block(i + self.dot)?;
        let (mb, _, nb) = bra.dims();
        let (mk, _, nk) = ket.dims();
        if bra.phys_labels() != op.phys.as_slice() || ket.phys_labels() != op.phys.as_slice() {
            return Err(EnvError::SectorMismatch(
                format!("window tensors at site {i} do not carry the operator's physical labels")));
        }
        if left.len() != op.left_dim || left.dims() != (mb, mk) {
            return Err(EnvError::SectorMismatch(
                format!("left block {:?} does not fit tensors {:?}", left.dims(), (mb, mk))));
        }
        if right.len() != op.right_dim || right.dims() != (nb, nk) {
            return Err(EnvError::SectorMismatch(
                format!("right block {:?} does not fit tensors {:?}", right.dims(), (nb, nk))));
        }
        let d = op.phys.len();
        let nnz: usize =
            op.terms.iter()
            .map(|t| t.op.iter().filter(|x| **x != 0.0).count())
            .sum();
        let flops =
            2 * op.terms.len() * d * mb * mk * nk
            + 2 * nnz * mb * nk
            + 2 * op.terms.len() * d * mb * nk * nb;
        let mut h =
            EffectiveHamiltonian {
                left,
                right,
                first: self.mpo().site(i),
                last: self.mpo().site(i + self.dot - 1),
                op,
                dot: self.dot,
                const_e: if self.same_space() { self.mpo().const_e } else { 0.0 },
                fuse,
                forward,
                rule: self.rule(),
                bra: bra.zeros_like(),
                ket: ket.zeros_like(),
                diag: None,
                flops,
            };
        if compute_diagonal { h.diag = Some(h.diagonal()?); }
        Ok(h)
    }
}

// allowed linear indices of a tensor
fn allowed(t: &SiteTensor) -> Vec<usize> {
    let (m, d, n) = t.dims();
    let mut idx = Vec::new();
    for v in 0..n {
        for s in 0..d {
            for u in 0..m {
                if t.is_allowed(u, s, v) { idx.push(u + m * (s + d * v)); }
            }
        }
    }
    idx
}

fn compress(t: &SiteTensor, mask: &[usize]) -> na::DVector<f64> {
    let data = t.as_slice();
    na::DVector::from_iterator(mask.len(), mask.iter().map(|k| data[*k]))
}

fn expand(template: &SiteTensor, mask: &[usize], v: &na::DVector<f64>) -> SiteTensor {
    let mut t = template.zeros_like();
    let data = t.as_mut_slice();
    mask.iter().zip(v.iter()).for_each(|(k, x)| { data[*k] = *x; });
    t
}

fn allreduce_vec(rule: Option<&ParallelRule>, data: &mut [f64]) -> EnvResult<()> {
    if let Some(rule) = rule { rule.comm.allreduce_sum(data)?; }
    Ok(())
}

impl<'a> EffectiveHamiltonian<'a> {
    /// Return `true` for a forward (left-to-right) step.
    pub fn is_forward(&self) -> bool { self.forward }

    /// The fused side the window was built for.
    pub fn fuse_side(&self) -> FuseSide { self.fuse }

    /// Approximate floating-point operations per application.
    pub fn flops_per_apply(&self) -> usize { self.flops }

    /// Constant added on the diagonal.
    pub fn const_e(&self) -> f64 { self.const_e }

    fn owns(&self, t: usize) -> bool { self.rule.map(|r| r.owns(t)).unwrap_or(true) }

    /// Diagonal of the operator over the bra tensor's entries, including the
    /// constant shift.
    pub fn diagonal(&self) -> EnvResult<na::DVector<f64>> {
        let (m, d, n) = self.bra.dims();
        let mut diag = na::DVector::zeros(m * d * n);
        for (t, term) in self.op.terms.iter().enumerate() {
            if !self.owns(t) { continue; }
            let l = &self.left.mats[term.left];
            let r = &self.right.mats[term.right];
            if l.nrows() != l.ncols() || r.nrows() != r.ncols() { continue; }
            for v in 0..n {
                let rv = r[(v, v)];
                if rv == 0.0 { continue; }
                for s in 0..d {
                    let o = term.op[(s, s)] * rv;
                    if o == 0.0 { continue; }
                    for u in 0..m {
                        diag[u + m * (s + d * v)] += o * l[(u, u)];
                    }
                }
            }
        }
        allreduce_vec(self.rule, diag.as_mut_slice())?;
        diag.add_scalar_mut(self.const_e);
        Ok(diag)
    }

    /// Apply the operator to a ket-shaped tensor, giving a bra-shaped tensor
    /// (fused like the bra template).
    fn apply(&self, ket: &SiteTensor) -> EnvResult<SiteTensor> {
        if !ket.same_space(&self.ket) {
            return Err(EnvError::SectorMismatch(
                "ket does not match the window it was built for".into()));
        }
        let ket_s = ket.phys_slices();
        let (mb, d, nb) = self.bra.dims();
        let mut out = vec![na::DMatrix::zeros(mb, nb); d];
        let mut cache: Vec<Option<Vec<na::DMatrix<f64>>>> = vec![None; self.op.left_dim];
        for (t, term) in self.op.terms.iter().enumerate() {
            if !self.owns(t) { continue; }
            let l = &self.left.mats[term.left];
            let lpsi =
                cache[term.left].get_or_insert_with(|| {
                    ket_s.iter().map(|a| l * a).collect()
                });
            let r = &self.right.mats[term.right];
            for (sp, o) in out.iter_mut().enumerate() {
                let mut mixed = na::DMatrix::zeros(mb, ket_s[0].ncols());
                let mut any = false;
                for (s, lp) in lpsi.iter().enumerate() {
                    let c = term.op[(sp, s)];
                    if c != 0.0 {
                        mixed += lp * c;
                        any = true;
                    }
                }
                if any { o.gemm(1.0, &mixed, &r.transpose(), 1.0); }
            }
        }
        let mut res =
            SiteTensor::from_phys_slices(
                self.bra.left_labels().to_vec(),
                self.bra.phys_labels().to_vec(),
                self.bra.right_labels().to_vec(),
                &out,
                self.bra.fuse_side(),
            );
        allreduce_vec(self.rule, res.as_mut_slice())?;
        if self.const_e != 0.0 && ket.same_space(&self.bra) {
            let shaped =
                ket.as_slice().iter().copied().collect::<Vec<f64>>();
            res.as_mut_slice().iter_mut().zip(shaped)
                .for_each(|(y, x)| { *y += self.const_e * x; });
        }
        Ok(res)
    }

    /// Apply the operator once, returning `H|ket⟩` and its norm.
    pub fn multiply(&self, ket: &SiteTensor) -> EnvResult<(SiteTensor, f64)> {
        let out = self.apply(ket)?;
        let nrm = out.norm();
        Ok((out, nrm))
    }

    /// `⟨bra|H|ket⟩`.
    pub fn expect(&self, bra: &SiteTensor, ket: &SiteTensor) -> EnvResult<f64> {
        Ok(self.apply(ket)?.dot(bra))
    }

    /// Lowest eigenpairs for all states of `wfn`, which also serve as initial
    /// guesses and are overwritten by the eigenvectors.
    ///
    /// With `soft_max_iter == Some(0)` the states are only evaluated, not
    /// solved for.
    pub fn eigs(&self, wfn: &mut Wavefunction, ctrl: &SolverControl)
        -> EnvResult<EigsOutput>
    {
        let start = Instant::now();
        let template = wfn.primary().clone();
        let mask = allowed(&template);
        if ctrl.soft_max_iter == Some(0) {
            let mut energies = Vec::with_capacity(wfn.roots.len());
            for root in wfn.roots.iter() {
                let nrm2 = root.dot(root);
                let e = self.apply(root)?.dot(root);
                energies.push(if nrm2 > 0.0 { e / nrm2 } else { e });
            }
            return Ok(EigsOutput {
                energies,
                ndav: 0,
                nflop: self.flops * wfn.roots.len(),
                time: start.elapsed(),
            });
        }
        let diag_full =
            match &self.diag {
                Some(diag) => diag.clone(),
                None => self.diagonal()?,
            };
        let diag =
            na::DVector::from_iterator(mask.len(), mask.iter().map(|k| diag_full[*k]));
        let guesses: Vec<na::DVector<f64>> =
            wfn.roots.iter().map(|t| compress(t, &mask)).collect();
        let mut fault: Option<EnvError> = None;
        let matvec = |v: &na::DVector<f64>| -> na::DVector<f64> {
            let x = expand(&template, &mask, v);
            match self.apply(&x) {
                Ok(y) => compress(&y, &mask),
                Err(err) => {
                    fault.get_or_insert(err);
                    na::DVector::zeros(v.len())
                },
            }
        };
        let res = davidson(matvec, &diag, guesses, ctrl);
        if let Some(err) = fault { return Err(err); }
        if !res.converged {
            warn!(
                "davidson: not converged after {} iterations (residual {:.3e})",
                res.iterations,
                res.residuals.iter().copied().fold(0.0, f64::max),
            );
        }
        for (root, v) in wfn.roots.iter_mut().zip(res.vectors.iter()) {
            *root = expand(&template, &mask, v);
        }
        Ok(EigsOutput {
            energies: res.values,
            ndav: res.iterations,
            nflop: self.flops * res.matvecs,
            time: start.elapsed(),
        })
    }

    /// Solve `(H + shift) x = b` with preconditioned MINRES, using the
    /// current `x` as the initial guess. Returns `⟨x|b⟩`.
    pub fn inverse_multiply(
        &self,
        shift: f64,
        b: &SiteTensor,
        x: &mut SiteTensor,
        ctrl: &SolverControl,
    ) -> EnvResult<SolveOutput>
    {
        let start = Instant::now();
        let mask = allowed(&self.bra);
        let diag_full =
            match &self.diag {
                Some(diag) => diag.clone(),
                None => self.diagonal()?,
            };
        let pre: na::DVector<f64> =
            na::DVector::from_iterator(
                mask.len(),
                mask.iter().map(|k| 1.0 / (diag_full[*k] + shift).abs().max(PRECOND_FLOOR)),
            );
        let bv = compress(b, &mask);
        let x0 = compress(x, &mask);
        let template = self.bra.clone();
        let mut fault: Option<EnvError> = None;
        let mut nmv: usize = 0;
        let res = {
            let matvec = |v: &na::DVector<f64>| -> na::DVector<f64> {
                nmv += 1;
                match self.apply(&expand(&template, &mask, v)) {
                    Ok(y) => compress(&y, &mask) + v * shift,
                    Err(err) => {
                        fault.get_or_insert(err);
                        na::DVector::zeros(v.len())
                    },
                }
            };
            minres(matvec, |r| r.component_mul(&pre), &bv, x0, ctrl)
        };
        if let Some(err) = fault { return Err(err); }
        if !res.converged {
            warn!(
                "minres: not converged after {} iterations (residual {:.3e})",
                res.iterations, res.residual,
            );
        }
        *x = expand(x, &mask, &res.x);
        Ok(SolveOutput {
            value: res.x.dot(&bv),
            iterations: res.iterations,
            nflop: self.flops * nmv,
            time: start.elapsed(),
        })
    }

    /// Solve `(H + shift - omega + iη) (x_r + i x_i) = b` for real `b`,
    /// through the positive-definite system `(A² + η²) x_i = -η b` with
    /// `A = H + shift - omega`, followed by `x_r = -A x_i / η`.
    ///
    /// The current `x_i` is the initial guess. Returns
    /// `(⟨b|x_r⟩, ⟨b|x_i⟩)`.
    #[allow(clippy::too_many_arguments)]
    pub fn greens_function(
        &self,
        omega: f64,
        eta: f64,
        shift: f64,
        b: &SiteTensor,
        xr: &mut SiteTensor,
        xi: &mut SiteTensor,
        ctrl: &SolverControl,
    ) -> EnvResult<GreensOutput>
    {
        let start = Instant::now();
        let mask = allowed(&self.bra);
        let diag_full =
            match &self.diag {
                Some(diag) => diag.clone(),
                None => self.diagonal()?,
            };
        let pre: na::DVector<f64> =
            na::DVector::from_iterator(
                mask.len(),
                mask.iter().map(|k| {
                    let a = diag_full[*k] + shift - omega;
                    1.0 / (a * a + eta * eta).max(PRECOND_FLOOR)
                }),
            );
        let bv = compress(b, &mask);
        let template = self.bra.clone();
        let mut fault: Option<EnvError> = None;
        let mut nmv: usize = 0;
        let mut apply_a = |v: &na::DVector<f64>| -> na::DVector<f64> {
            nmv += 1;
            match self.apply(&expand(&template, &mask, v)) {
                Ok(y) => compress(&y, &mask) + v * (shift - omega),
                Err(err) => {
                    fault.get_or_insert(err);
                    na::DVector::zeros(v.len())
                },
            }
        };
        let rhs = &bv * (-eta);
        let x0 = compress(xi, &mask);
        let res = {
            let matvec = |v: &na::DVector<f64>| -> na::DVector<f64> {
                let av = apply_a(v);
                apply_a(&av) + v * (eta * eta)
            };
            minres(matvec, |r| r.component_mul(&pre), &rhs, x0, ctrl)
        };
        let xr_v = apply_a(&res.x) * (-1.0 / eta);
        if let Some(err) = fault { return Err(err); }
        if !res.converged {
            warn!(
                "greens_function: not converged after {} iterations (residual {:.3e})",
                res.iterations, res.residual,
            );
        }
        *xr = expand(xr, &mask, &xr_v);
        *xi = expand(xi, &mask, &res.x);
        Ok(GreensOutput {
            value: (xr_v.dot(&bv), res.x.dot(&bv)),
            iterations: res.iterations,
            nflop: self.flops * nmv,
            time: start.elapsed(),
        })
    }

    /// The perturbations `P_c`, one per MPO bond index `c` across the bond
    /// being split, as split matrices.
    ///
    /// For a forward split, `P_c` applies the left block and the first site's
    /// operator to `ket`, leaving bond `c` open; rows are `(u', s1')` of the
    /// bra side. For a backward split, the right block and the last site's
    /// operator are applied instead; columns are `(s2', v')`. With a parallel
    /// rule, only the owned bonds are built unless `all_terms` is set.
    pub fn perturbative_noise(&self, ket: &SiteTensor, all_terms: bool)
        -> EnvResult<Vec<SplitMatrix>>
    {
        let (m, dd, n) = ket.dims();
        let data = ket.as_slice();
        let vacuum = vec![Sector::VACUUM];
        let mut out = Vec::new();
        if self.forward {
            let site = self.first;
            let p1 = &site.phys;
            let d1 = p1.len();
            let p2: Vec<Sector> =
                if self.dot == 1 { vacuum } else { self.last.phys.clone() };
            let d2 = dd / d1;
            let w = d2 * n;
            let xs: Vec<na::DMatrix<f64>> =
                (0..d1)
                .map(|s1| na::DMatrix::from_fn(m, w, |u, c| data[u + m * (s1 + d1 * c)]))
                .collect();
            let mb = self.bra.dims().0;
            let rows: Vec<Sector> =
                p1.iter()
                .flat_map(|p| self.bra.left_labels().iter().map(move |l| *l + *p))
                .collect();
            let cols: Vec<Sector> =
                ket.right_labels().iter()
                .flat_map(|r| p2.iter().map(move |p| *r - *p))
                .collect();
            for c in 0..site.right_dim {
                if !all_terms && !self.owns(c) { continue; }
                let terms: Vec<_> = site.terms.iter().filter(|t| t.right == c).collect();
                if terms.is_empty() { continue; }
                let mut mat = na::DMatrix::zeros(mb * d1, w);
                for term in terms.into_iter() {
                    let l = &self.left.mats[term.left];
                    let lx: Vec<na::DMatrix<f64>> = xs.iter().map(|x| l * x).collect();
                    for s1p in 0..d1 {
                        let mut rows_mut = mat.rows_mut(mb * s1p, mb);
                        for (s1, lxs) in lx.iter().enumerate() {
                            let o = term.op[(s1p, s1)];
                            if o != 0.0 { rows_mut += lxs * o; }
                        }
                    }
                }
                out.push(SplitMatrix { mat, rows: rows.clone(), cols: cols.clone() });
            }
        } else {
            let site = self.last;
            let p2 = &site.phys;
            let d2 = p2.len();
            let p1: Vec<Sector> =
                if self.dot == 1 { vacuum } else { self.first.phys.clone() };
            let d1 = dd / d2;
            let h = m * d1;
            let zs: Vec<na::DMatrix<f64>> =
                (0..d2)
                .map(|s2| na::DMatrix::from_fn(h, n, |r, v| data[r + h * (s2 + d2 * v)]))
                .collect();
            let nb = self.bra.dims().2;
            let rows: Vec<Sector> =
                p1.iter()
                .flat_map(|p| ket.left_labels().iter().map(move |l| *l + *p))
                .collect();
            let cols: Vec<Sector> =
                self.bra.right_labels().iter()
                .flat_map(|r| p2.iter().map(move |p| *r - *p))
                .collect();
            for c in 0..site.left_dim {
                if !all_terms && !self.owns(c) { continue; }
                let terms: Vec<_> = site.terms.iter().filter(|t| t.left == c).collect();
                if terms.is_empty() { continue; }
                // columns s2' + d2·v' of the (h × d2·nb) result
                let mut slices = vec![na::DMatrix::zeros(h, nb); d2];
                for term in terms.into_iter() {
                    let r = &self.right.mats[term.right];
                    let zr: Vec<na::DMatrix<f64>> =
                        zs.iter().map(|z| z * r.transpose()).collect();
                    for (s2p, slice) in slices.iter_mut().enumerate() {
                        for (s2, zrs) in zr.iter().enumerate() {
                            let o = term.op[(s2p, s2)];
                            if o != 0.0 { *slice += zrs * o; }
                        }
                    }
                }
                let mat =
                    na::DMatrix::from_fn(h, d2 * nb, |r, col| {
                        slices[col % d2][(r, col / d2)]
                    });
                out.push(SplitMatrix { mat, rows: rows.clone(), cols: cols.clone() });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        mpo::Mpo,
        mps::{ Mps, MpsArena, MpsKind },
        store::MemoryStore,
    };
    use super::*;

    fn setup(n: usize, dot: usize, seed: u64)
        -> (Arc<Mpo>, MemoryStore, MpsArena, crate::mps::MpsId)
    {
        let mpo = Arc::new(Mpo::heisenberg(n, 1.0, 1.0, 0.0).with_const(0.25));
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let mps =
            Mps::random(
                "psi", mpo.bases(), Sector(0), 16, dot, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        let mut arena = MpsArena::new();
        let id = arena.insert(mps);
        (mpo, store, arena, id)
    }

    #[test]
    fn expectation_matches_dense() {
        let (mpo, store, arena, id) = setup(4, 2, 50);
        let psi = arena.get(id).to_dense(0, &store).unwrap();
        let exact = psi.dot(&(mpo.dense_matrix() * &psi));
        let mut env = MovingEnvironment::new(mpo.clone(), id, id, 0, 2, None).unwrap();
        env.prepare(&arena, &store).unwrap();
        let mps = arena.get(id);
        let a = mps.site_tensor(0, &store).unwrap();
        let b = mps.site_tensor(1, &store).unwrap();
        let wfn = SiteTensor::contract_pair(&a, &b).unwrap();
        let h = env.eff_ham(FuseSide::Left, true, true, &wfn, &wfn).unwrap();
        assert!((h.expect(&wfn, &wfn).unwrap() - exact).abs() < 1e-10);
        // the diagonal is consistent with unit vectors
        let diag = h.diagonal().unwrap();
        let mask = allowed(&wfn);
        for k in mask.iter().take(5) {
            let mut e = wfn.zeros_like();
            e.as_mut_slice()[*k] = 1.0;
            let he = h.multiply(&e).unwrap().0;
            assert!((he.as_slice()[*k] - diag[*k]).abs() < 1e-12);
        }
    }

    #[test]
    fn local_ground_state_is_global_for_two_sites() {
        let (mpo, store, arena, id) = setup(2, 2, 51);
        let mut env = MovingEnvironment::new(mpo.clone(), id, id, 0, 2, None).unwrap();
        env.prepare(&arena, &store).unwrap();
        let mps = arena.get(id);
        let a = mps.site_tensor(0, &store).unwrap();
        let b = mps.site_tensor(1, &store).unwrap();
        let wfn = SiteTensor::contract_pair(&a, &b).unwrap();
        let h = env.eff_ham(FuseSide::Left, true, true, &wfn, &wfn).unwrap();
        let mut state = Wavefunction::single(wfn);
        let ctrl = SolverControl::new(1e-12, 100, None);
        let res = h.eigs(&mut state, &ctrl).unwrap();
        // singlet of the Heisenberg dimer, plus the shift
        assert!((res.energies[0] - (-0.75 + 0.25)).abs() < 1e-9);
        assert!((state.primary().norm() - 1.0).abs() < 1e-10);
        assert!(state.primary().leakage() < 1e-20);
    }

    #[test]
    fn linear_solves_match_dense() {
        let (mpo, store, arena, id) = setup(4, 2, 52);
        let mut env = MovingEnvironment::new(mpo.clone(), id, id, 0, 2, None).unwrap();
        env.prepare(&arena, &store).unwrap();
        let mps = arena.get(id);
        let a = mps.site_tensor(0, &store).unwrap();
        let b = mps.site_tensor(1, &store).unwrap();
        let wfn = SiteTensor::contract_pair(&a, &b).unwrap();
        let h = env.eff_ham(FuseSide::Left, true, true, &wfn, &wfn).unwrap();
        let mask = allowed(&wfn);
        let dim = mask.len();
        let columns: Vec<na::DVector<f64>> =
            (0..dim)
            .map(|c| {
                let mut e = na::DVector::zeros(dim);
                e[c] = 1.0;
                let he = h.multiply(&expand(&wfn, &mask, &e)).unwrap().0;
                compress(&he, &mask)
            })
            .collect();
        let dense = na::DMatrix::from_columns(&columns);
        let bvec = compress(&wfn, &mask);
        let ctrl = SolverControl::new(1e-20, 500, None);

        let shift = 2.0;
        let mut x = wfn.zeros_like();
        let out = h.inverse_multiply(shift, &wfn, &mut x, &ctrl).unwrap();
        let shifted = &dense + na::DMatrix::identity(dim, dim) * shift;
        let exact = shifted.lu().solve(&bvec).unwrap();
        assert!((compress(&x, &mask) - &exact).norm() < 1e-7);
        assert!((out.value - exact.dot(&bvec)).abs() < 1e-7);

        let (omega, eta) = (-0.4, 0.1);
        let mut xr = wfn.zeros_like();
        let mut xi = wfn.zeros_like();
        let out = h.greens_function(omega, eta, 0.0, &wfn, &mut xr, &mut xi, &ctrl).unwrap();
        let amat = &dense - na::DMatrix::identity(dim, dim) * omega;
        let big = &amat * &amat + na::DMatrix::identity(dim, dim) * (eta * eta);
        let exact_i = big.lu().solve(&(&bvec * (-eta))).unwrap();
        let exact_r = &amat * &exact_i * (-1.0 / eta);
        assert!((compress(&xi, &mask) - &exact_i).norm() < 1e-6);
        assert!((compress(&xr, &mask) - &exact_r).norm() < 1e-6);
        assert!((out.value.0 - exact_r.dot(&bvec)).abs() < 1e-6);
        // the complex residual vanishes
        let res_re = &amat * &exact_r - &exact_i * eta - &bvec;
        assert!(res_re.norm() < 1e-8);
    }

    #[test]
    fn perturbation_shapes() {
        let (mpo, store, arena, id) = setup(4, 2, 53);
        let mut env = MovingEnvironment::new(mpo.clone(), id, id, 1, 2, None).unwrap();
        env.prepare(&arena, &store).unwrap();
        let mps = arena.get(id);
        let a = mps.site_tensor(1, &store).unwrap();
        let b = mps.site_tensor(2, &store).unwrap();
        let wfn = SiteTensor::contract_pair(&a, &b).unwrap();
        let (m, _, n) = wfn.dims();
        for forward in [true, false] {
            let h = env.eff_ham(FuseSide::Left, forward, false, &wfn, &wfn).unwrap();
            let ps = h.perturbative_noise(&wfn, true).unwrap();
            assert_eq!(ps.len(), mpo.site(1).right_dim);
            for p in ps.iter() {
                assert_eq!(p.mat.shape(), (m * 2, 2 * n));
                assert_eq!(p.rows.len(), m * 2);
                assert_eq!(p.cols.len(), 2 * n);
            }
        }
        assert!(matches!(
            env.eff_ham(FuseSide::Left, true, false, &a, &a),
            Err(EnvError::SectorMismatch(_))
        ));
    }
}
