//! Multi-center sweeps over a chain cut into segments.
//!
//! The chain is cut at connection bonds `c_1 < c_2 < ...` into segments
//! `[0, c_1), [c_1, c_2), ...`. At every connection the Schmidt values `Λ_c`
//! of the bond are kept next to the MPS, and the state is
//! ```text
//!  ψ = X_0 Λ_{c_1}⁻¹ X_1 Λ_{c_2}⁻¹ X_2 ...
//! ```
//! where every segment `X_s` is an ordinary mixed-canonical chunk that carries
//! the Schmidt values of both of its end bonds. Segments are therefore swept
//! independently, each with fixed boundary blocks at its ends; neighboring
//! segments sweep in opposite directions so that after every round half of
//! the connections have both segment centers next to them. Those connections
//! are merged: the two-site window across the connection is re-optimized with
//! the inverse Schmidt values inserted, split again, and the connection is
//! moved toward the faster segment if the segments' timings differ.
//!
//! Boundary blocks and Schmidt values live in the store under
//! `{tag}.env.L.{bond}`, `{tag}.env.R.{bond}` and `{tag}.conn.{bond}`, so that
//! every process can pick up the segments it owns.

use std::{
    sync::Arc,
    time::Instant,
};
use nalgebra as na;
use tracing::{ debug, info, warn };
use crate::{
    canonical::{ CanonicalForm, CanonicalForms },
    comm::{ Communicator, ParallelRule },
    config::DmrgConfig,
    context::SweepContext,
    decompose::{ NoiseKind, check_noise },
    dmrg::{ Dmrg, perturbations },
    environment::{ EnvBlock, MovingEnvironment, extend_left, extend_right },
    mpo::Mpo,
    mps::{ MpsError, MpsId, Wavefunction, split_exact },
    solver::SolverControl,
    store::{ self, TensorStore },
    sweep::{ Factors, Truncation, split_matrices, truncate_single, window_shape },
    tensor::{ FuseSide, SiteTensor },
    SweepError,
    SweepResult,
};

/// Schmidt values below this are treated as zero when inverted.
pub const SCHMIDT_FLOOR: f64 = 1e-12;

fn conn_key(tag: &str, c: usize) -> String { format!("{tag}.conn.{c}") }

fn left_key(tag: &str, k: usize) -> String { format!("{tag}.env.L.{k}") }

fn right_key(tag: &str, k: usize) -> String { format!("{tag}.env.R.{k}") }

fn pseudo_inverse(x: f64) -> f64 { if x > SCHMIDT_FLOOR { 1.0 / x } else { 0.0 } }

fn column_norms(m: &na::DMatrix<f64>) -> Vec<f64> {
    m.column_iter().map(|c| c.norm()).collect()
}

fn row_norms(m: &na::DMatrix<f64>) -> Vec<f64> {
    m.row_iter().map(|r| r.norm()).collect()
}

// U from U·Λ
fn unscale_columns(mut m: na::DMatrix<f64>, lambda: &[f64]) -> na::DMatrix<f64> {
    m.column_iter_mut().zip(lambda)
        .for_each(|(mut c, l)| { c.scale_mut(pseudo_inverse(*l)); });
    m
}

// Vᵀ from Λ·Vᵀ
fn unscale_rows(mut m: na::DMatrix<f64>, lambda: &[f64]) -> na::DMatrix<f64> {
    m.row_iter_mut().zip(lambda)
        .for_each(|(mut r, l)| { r.scale_mut(pseudo_inverse(*l)); });
    m
}

/// New position of connection `j` after a round in which the update at site
/// `i` took `site_times[i]` seconds.
///
/// A segment's time is the sum over the windows it starts. The connection
/// moves toward the slower neighbor one site at a time, at most `step` sites,
/// for as long as a move shrinks the timing difference; both neighbors keep at
/// least two sites.
pub fn shifted_connection(
    conns: &[usize],
    j: usize,
    n_sites: usize,
    site_times: &[f64],
    step: usize,
) -> usize
{
    let c = conns[j];
    let a = if j == 0 { 0 } else { conns[j - 1] };
    let b = conns.get(j + 1).copied().unwrap_or(n_sites);
    let (lo, hi) = (a + 2, b - 2);
    let segment_time = |p: usize, q: usize| -> f64 { site_times[p..q - 1].iter().sum() };
    let (tl, tr) = (segment_time(a, c), segment_time(c, b));
    let mut diff = (tl - tr).abs();
    let mut cc = c;
    for _ in 0..step {
        // the site changing hands and where the connection lands
        let (k, next) =
            if tr > tl && cc < hi {
                (cc, cc + 1)
            } else if tl > tr && cc > lo {
                (cc - 2, cc - 1)
            } else {
                break;
            };
        let t = 2.0 * site_times[k];
        if t <= diff {
            diff -= t;
            cc = next;
        } else {
            if t - diff < diff { cc = next; }
            break;
        }
    }
    cc
}

/// Outcome of one segment's partial sweep.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PartialSweep {
    pub energy: f64,
    pub error: f64,
    /// Wall time in seconds.
    pub time: f64,
    /// Site holding the segment's center afterwards.
    pub center: usize,
    pub aborted: bool,
}

/// An MPS cut into independently swept segments.
#[derive(Debug)]
pub struct ParallelMps {
    pub mps: MpsId,
    mpo: Arc<Mpo>,
    pub config: DmrgConfig,
    /// Connection bonds, increasing.
    pub conns: Vec<usize>,
    // center site of every segment
    centers: Vec<usize>,
    // direction of the even segments in the next round
    forward: bool,
    rule: Option<ParallelRule>,
    /// Lowest energy of each round.
    pub sweep_energies: Vec<f64>,
    /// Largest discarded weight of each round.
    pub sweep_discarded_weights: Vec<f64>,
    /// Wall time of each round in seconds.
    pub sweep_time: Vec<f64>,
    /// Wall time of the last update at every site.
    pub site_times: Vec<f64>,
    pub converged: bool,
    pub aborted: bool,
}

impl ParallelMps {
    /// Cut the single-state MPS `mps` at the connection bonds `conns`.
    ///
    /// The root brings the state into the segment form and stores the
    /// Schmidt values and boundary blocks of every connection; segment `s` is
    /// owned by the process of rank `s % size`.
    pub fn new(
        mpo: Arc<Mpo>,
        mps: MpsId,
        ctx: &mut SweepContext,
        config: DmrgConfig,
        conns: Vec<usize>,
        rule: Option<ParallelRule>,
    ) -> SweepResult<Self>
    {
        check_noise(config.noise_type, config.decomp_type)?;
        if config.dot != 2 {
            return Err(SweepError::UnsupportedMode(
                format!("multi-center sweeps with {}-site windows", config.dot)));
        }
        let state = ctx.arena.get(mps);
        if state.is_multi() {
            return Err(SweepError::UnsupportedMode(
                "multi-center sweeps of a multi-state MPS".into()));
        }
        let n = state.n_sites();
        if n != mpo.n_sites() {
            return Err(MpsError::SiteCount(n, mpo.n_sites()).into());
        }
        let bounds: Vec<usize> =
            std::iter::once(0).chain(conns.iter().copied()).chain(std::iter::once(n))
            .collect();
        if conns.is_empty() || bounds.windows(2).any(|w| w[1] < w[0] + 2) {
            return Err(SweepError::UnsupportedMode(
                format!("connections {conns:?} on {n} sites")));
        }
        let nseg = conns.len() + 1;
        let centers: Vec<usize> =
            (0..nseg)
            .map(|s| if s % 2 == 0 { bounds[s] } else { bounds[s + 1] - 1 })
            .collect();
        let mut new =
            Self {
                mps,
                mpo,
                config,
                conns,
                centers,
                forward: true,
                rule,
                sweep_energies: Vec::new(),
                sweep_discarded_weights: Vec::new(),
                sweep_time: Vec::new(),
                site_times: vec![0.0; n],
                converged: false,
                aborted: false,
            };
        if new.is_root() { new.cut(ctx)?; }
        new.sync(ctx)?;
        Ok(new)
    }

    fn is_root(&self) -> bool { self.rule.as_ref().map_or(true, |r| r.is_root()) }

    fn owns(&self, s: usize) -> bool { self.rule.as_ref().map_or(true, |r| r.owns(s)) }

    fn comm(&self) -> Option<&dyn Communicator> {
        self.rule.as_ref().map(|r| r.comm.as_ref())
    }

    fn n_sites(&self) -> usize { self.mpo.n_sites() }

    /// Number of segments.
    pub fn n_segments(&self) -> usize { self.conns.len() + 1 }

    /// Sites `[a, b)` of segment `s`.
    pub fn segment(&self, s: usize) -> (usize, usize) {
        let a = if s == 0 { 0 } else { self.conns[s - 1] };
        let b = self.conns.get(s).copied().unwrap_or(self.n_sites());
        (a, b)
    }

    /// Site holding the center of segment `s`.
    pub fn center(&self, s: usize) -> usize { self.centers[s] }

    /// Schmidt values kept at connection bond `c`.
    pub fn schmidt_values(&self, c: usize, ctx: &SweepContext) -> SweepResult<Vec<f64>> {
        let tag = &ctx.arena.get(self.mps).tag;
        Ok(store::load_bin(ctx.store(), &conn_key(tag, c))?)
    }

    // tags implied by the segment centers
    fn forms(&self) -> CanonicalForms {
        let n = self.n_sites();
        let mut forms = CanonicalForms::with_center(n, 0, false);
        for s in 0..self.n_segments() {
            let (a, b) = self.segment(s);
            let c = self.centers[s];
            for k in a..b {
                let tag =
                    if k < c {
                        CanonicalForm::Left
                    } else if k == c {
                        CanonicalForm::Center
                    } else {
                        CanonicalForm::Right
                    };
                forms.set(k, tag);
            }
        }
        forms
    }

    // everybody waits for the writers, then drops its cached tensors and
    // re-reads the bookkeeping the writers changed
    fn sync(&self, ctx: &mut SweepContext) -> SweepResult<()> {
        if let Some(comm) = self.comm() { comm.barrier()?; }
        let store = Arc::clone(&ctx.store);
        let forms = self.forms();
        let mps = ctx.arena.get_mut(self.mps);
        mps.unload_all();
        mps.forms = forms;
        mps.dot = 2;
        mps.refresh_bond_dims(store.as_ref())?;
        Ok(())
    }

    // bring a mixed-canonical state into the segment form
    fn cut(&mut self, ctx: &mut SweepContext) -> SweepResult<()> {
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let mpo = Arc::clone(&self.mpo);
        let n = self.n_sites();
        let mps = ctx.arena.get_mut(self.mps);
        let tag = mps.tag.clone();
        let center =
            mps.forms.as_slice().iter()
            .position(|t| !t.is_normalized())
            .unwrap_or(0);
        mps.shift_center(center, n - 1, store)?;

        // left blocks from the left-canonical state, in its bond bases
        let mut lefts: Vec<(usize, EnvBlock)> = Vec::with_capacity(self.conns.len());
        let mut block = EnvBlock::boundary(mpo.site(0).left_dim);
        store::save_bin(store, &left_key(&tag, 0), &block)?;
        let last = self.conns.last().copied().unwrap_or(0);
        for k in 0..last {
            let t = mps.site_tensor(k, store)?;
            block = extend_left(&block, mpo.site(k), &t, &t, None)?;
            if self.conns.contains(&(k + 1)) { lefts.push((k + 1, block.clone())); }
        }

        // right-canonicalize, reading off the Schmidt values at the connections
        let mut block = EnvBlock::boundary(mpo.site(n - 1).right_dim);
        store::save_bin(store, &right_key(&tag, n), &block)?;
        for k in (1..n).rev() {
            let t = mps.site_tensor(k, store)?.into_owned();
            let (r, rest, bond) = split_exact(&t, false)?;
            let prev = mps.site_tensor(k - 1, store)?.into_owned();
            if self.conns.contains(&k) {
                block = extend_right(&block, mpo.site(k), &r, &r, None)?;
                let lambda = column_norms(&rest);
                let u = unscale_columns(rest.clone(), &lambda);
                if let Some((_, left)) = lefts.iter().find(|(c, _)| *c == k) {
                    let mats = left.mats.iter().map(|m| u.transpose() * m * &u).collect();
                    store::save_bin(store, &left_key(&tag, k), &EnvBlock { mats })?;
                }
                store::save_bin(store, &right_key(&tag, k), &block)?;
                store::save_bin(store, &conn_key(&tag, k), &lambda)?;
            } else if k > self.conns[0] {
                block = extend_right(&block, mpo.site(k), &r, &r, None)?;
            }
            mps.info.set_bond_dim(k, bond.len());
            mps.put_tensor(k, r, store)?;
            mps.put_tensor(k - 1, prev.absorb_right(&rest, bond)?, store)?;
        }

        // Λ·B at every segment start; odd segments take their center to the
        // right end
        for s in 0..self.n_segments() {
            let (a, b) = self.segment(s);
            if a > 0 {
                let lambda: Vec<f64> = store::load_bin(store, &conn_key(&tag, a))?;
                let mut t = mps.site_tensor(a, store)?.into_owned();
                t.scale_left(lambda);
                mps.put_tensor(a, t, store)?;
            }
            if s % 2 == 1 { mps.shift_center(a, b - 1, store)?; }
        }
        mps.center = 0;
        mps.dot = 2;
        mps.forms = self.forms();
        mps.save_data(store)?;
        Ok(())
    }

    /// Sweep segment `s` once in direction `forward`, starting from its
    /// center at the opposite end.
    ///
    /// Only the owner of the segment calls this; no collectives are involved.
    pub fn partial_sweep(
        &mut self,
        ctx: &mut SweepContext,
        s: usize,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<PartialSweep>
    {
        let start = Instant::now();
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let n = self.n_sites();
        let (a, b) = self.segment(s);
        let tag = ctx.arena.get(self.mps).tag.clone();
        let left: EnvBlock = store::load_bin(store, &left_key(&tag, a))?;
        let right: EnvBlock = store::load_bin(store, &right_key(&tag, b))?;
        {
            let mps = ctx.arena.get_mut(self.mps);
            mps.dot = 2;
            mps.center = if forward { a } else { b - 2 };
        }
        let mut dmrg =
            Dmrg::on_segment(
                Arc::clone(&self.mpo), self.mps, ctx, self.config.clone(), (a, b), left, right,
            )?;
        let (energies, error) = dmrg.sweep(ctx, forward, bond_dim, noise, conv)?;
        for it in dmrg.sweep_iterations.last().into_iter().flatten() {
            self.site_times[it.site] = it.time.as_secs_f64();
        }
        let mps = ctx.arena.get(self.mps);
        let center =
            mps.forms.as_slice()[a..b].iter()
            .position(|t| t.is_center())
            .map_or(a, |k| a + k);
        // the block facing the connection the center now sits at
        if forward && center == b - 1 && b < n {
            let t = mps.site_tensor(b - 2, store)?;
            let block = extend_left(dmrg.env.left_block(b - 2)?, self.mpo.site(b - 2), &t, &t, None)?;
            store::save_bin(store, &left_key(&tag, b - 1), &block)?;
        } else if !forward && center == a && a > 0 {
            let t = mps.site_tensor(a + 1, store)?;
            let block = extend_right(dmrg.env.right_block(a + 2)?, self.mpo.site(a + 1), &t, &t, None)?;
            store::save_bin(store, &right_key(&tag, a + 1), &block)?;
        }
        let out =
            PartialSweep {
                energy: energies.first().copied().unwrap_or(f64::INFINITY),
                error,
                time: start.elapsed().as_secs_f64(),
                center,
                aborted: dmrg.aborted,
            };
        if self.config.iprint >= 2 {
            debug!(
                "segment {} [{}, {}) {} | E = {:.12} | DW = {:.3e} | time = {:.3} s",
                s, a, b, if forward { "->" } else { "<-" }, out.energy, out.error, out.time,
            );
        }
        Ok(out)
    }

    /// Merge every connection `j` with `j % 2 == 0` (forward rounds) or
    /// `j % 2 == 1` (backward rounds) whose two segment centers meet, moving
    /// it according to the last segment timings. Returns the lowest energy
    /// and largest discarded weight of the merges done by this process.
    pub fn connection_sweep(
        &mut self,
        ctx: &mut SweepContext,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<(f64, f64)>
    {
        let n = self.n_sites();
        let mut energy = f64::INFINITY;
        let mut error: f64 = 0.0;
        for j in 0..self.conns.len() {
            if (j % 2 == 0) != forward { continue; }
            let c = self.conns[j];
            if self.centers[j] + 1 != c || self.centers[j + 1] != c { continue; }
            let target =
                shifted_connection(
                    &self.conns, j, n, &self.site_times, self.config.conn_adjust_step);
            if self.owns(j) {
                let (e, w) = self.merge(ctx, j, target, bond_dim, noise, conv)?;
                energy = energy.min(e);
                error = error.max(w);
            }
            if target != c && self.config.iprint >= 2 {
                debug!("connection {} moved {} -> {}", j, c, target);
            }
            self.conns[j] = target;
            self.centers[j] = target - 1;
            self.centers[j + 1] = target;
        }
        self.sync(ctx)?;
        Ok((energy, error))
    }

    // re-optimize the window across connection j and put the connection at
    // bond `target`
    fn merge(
        &mut self,
        ctx: &mut SweepContext,
        j: usize,
        target: usize,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<(f64, f64)>
    {
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let mpo = Arc::clone(&self.mpo);
        let c = self.conns[j];
        let tag = ctx.arena.get(self.mps).tag.clone();
        let lambda: Vec<f64> = store::load_bin(store, &conn_key(&tag, c))?;
        let left_block: EnvBlock = store::load_bin(store, &left_key(&tag, c - 1))?;
        let right_block: EnvBlock = store::load_bin(store, &right_key(&tag, c + 1))?;

        // ψ = C_{c-1} Λ⁻¹ C_c
        let t = Instant::now();
        let psi = {
            let mps = ctx.arena.get(self.mps);
            let mut lhs = mps.site_tensor(c - 1, store)?.into_owned();
            lhs.scale_right(lambda.iter().map(|l| pseudo_inverse(*l)));
            let rhs = mps.site_tensor(c, store)?;
            SiteTensor::contract_pair(&lhs, &rhs)?
        };
        let mut env = MovingEnvironment::new(Arc::clone(&mpo), self.mps, self.mps, c - 1, 2, None)?;
        env.set_left_block(c - 1, left_block.clone());
        env.set_right_block(c + 1, right_block.clone());
        ctx.timers.env += t.elapsed();

        let mut wfn = Wavefunction::single(psi);
        let ctrl =
            SolverControl::new(
                conv, self.config.davidson_max_iter, self.config.davidson_soft_max_iter);
        let (out, perts) = {
            let h = env.eff_ham(FuseSide::Left, true, true, wfn.primary(), wfn.primary())?;
            let out = h.eigs(&mut wfn, &ctrl)?;
            let perts =
                if self.config.noise_type.kind == NoiseKind::Perturbative && noise > 0.0 {
                    perturbations(&h, &wfn, true)?
                } else {
                    Vec::new()
                };
            (out, perts)
        };
        ctx.timers.solve += out.time;

        let t = Instant::now();
        let shape = window_shape(ctx.arena.get(self.mps), &wfn, c - 1, 2, true)?;
        let xs = split_matrices(&shape, &wfn)?;
        let trunc =
            Truncation {
                forward: true,
                bond_dim,
                cutoff: self.config.cutoff,
                trunc_type: self.config.trunc_type,
                decomp_type: self.config.decomp_type,
                noise_type: self.config.noise_type,
                noise,
                normalize: true,
                weight: 1.0,
                extra: &[],
                perturbations: &perts,
                rule: None,
            };
        let Some(factors) = truncate_single(&xs, &wfn.weights, &trunc, &mut ctx.rng)? else {
            return Err(SweepError::UnsupportedMode("merge without a writer".into()));
        };
        let Factors { normalized, mut wfns, bond, error } = factors;
        let u = shape.left_tensor(bond.clone(), normalized)?;
        let w = shape.right_tensor(bond, wfns.swap_remove(0))?;
        // w = U₂ Λ Vᵀ puts the new Schmidt values on the bond
        let (v, rest, bond) = split_exact(&w, false)?;
        let lambda = column_norms(&rest);
        let a = u.absorb_right(&unscale_columns(rest, &lambda), bond)?;

        let mps = ctx.arena.get_mut(self.mps);
        if target == c {
            let new_left = extend_left(&left_block, mpo.site(c - 1), &a, &a, None)?;
            let new_right = extend_right(&right_block, mpo.site(c), &v, &v, None)?;
            let mut lt = a;
            lt.scale_right(lambda.iter().copied());
            let mut rt = v;
            rt.scale_left(lambda.iter().copied());
            mps.put_tensor(c - 1, lt, store)?;
            mps.put_tensor(c, rt, store)?;
            store::save_bin(store, &conn_key(&tag, c), &lambda)?;
            store::save_bin(store, &left_key(&tag, c), &new_left)?;
            store::save_bin(store, &right_key(&tag, c), &new_right)?;
        } else if target > c {
            // sites c..target join the left segment
            let mut block = extend_left(&left_block, mpo.site(c - 1), &a, &a, None)?;
            mps.put_tensor(c - 1, a, store)?;
            let mut rt = v;
            rt.scale_left(lambda.iter().copied());
            mps.put_tensor(c, rt, store)?;
            mps.shift_center(c, target - 1, store)?;
            for k in c..target - 1 {
                let t = mps.site_tensor(k, store)?;
                block = extend_left(&block, mpo.site(k), &t, &t, None)?;
            }
            let last = mps.site_tensor(target - 1, store)?.into_owned();
            let (u3, rest3, bond3) = split_exact(&last, true)?;
            let lambda3 = row_norms(&rest3);
            let next = mps.site_tensor(target, store)?.into_owned();
            let b3 = next.absorb_left(&unscale_rows(rest3, &lambda3), bond3)?;
            let new_left = extend_left(&block, mpo.site(target - 1), &u3, &u3, None)?;
            let end = self.conns.get(j + 1).copied().unwrap_or(self.mpo.n_sites());
            let mut new_right: EnvBlock = store::load_bin(store, &right_key(&tag, end))?;
            for k in (target + 1..end).rev() {
                let t = mps.site_tensor(k, store)?;
                new_right = extend_right(&new_right, mpo.site(k), &t, &t, None)?;
            }
            new_right = extend_right(&new_right, mpo.site(target), &b3, &b3, None)?;
            let mut lt = u3;
            lt.scale_right(lambda3.iter().copied());
            let mut rt = b3;
            rt.scale_left(lambda3.iter().copied());
            mps.put_tensor(target - 1, lt, store)?;
            mps.put_tensor(target, rt, store)?;
            store.remove(&conn_key(&tag, c))?;
            store::save_bin(store, &conn_key(&tag, target), &lambda3)?;
            store::save_bin(store, &left_key(&tag, target), &new_left)?;
            store::save_bin(store, &right_key(&tag, target), &new_right)?;
        } else {
            // sites target..c join the right segment
            let mut block = extend_right(&right_block, mpo.site(c), &v, &v, None)?;
            mps.put_tensor(c, v, store)?;
            let mut lt = a;
            lt.scale_right(lambda.iter().copied());
            mps.put_tensor(c - 1, lt, store)?;
            mps.shift_center(c - 1, target, store)?;
            for k in (target + 1..c).rev() {
                let t = mps.site_tensor(k, store)?;
                block = extend_right(&block, mpo.site(k), &t, &t, None)?;
            }
            let first = mps.site_tensor(target, store)?.into_owned();
            let (v3, rest3, bond3) = split_exact(&first, false)?;
            let lambda3 = column_norms(&rest3);
            let prev = mps.site_tensor(target - 1, store)?.into_owned();
            let a3 = prev.absorb_right(&unscale_columns(rest3, &lambda3), bond3)?;
            let new_right = extend_right(&block, mpo.site(target), &v3, &v3, None)?;
            let start = if j == 0 { 0 } else { self.conns[j - 1] };
            let mut new_left: EnvBlock = store::load_bin(store, &left_key(&tag, start))?;
            for k in start..target - 1 {
                let t = mps.site_tensor(k, store)?;
                new_left = extend_left(&new_left, mpo.site(k), &t, &t, None)?;
            }
            new_left = extend_left(&new_left, mpo.site(target - 1), &a3, &a3, None)?;
            let mut lt = a3;
            lt.scale_right(lambda3.iter().copied());
            let mut rt = v3;
            rt.scale_left(lambda3.iter().copied());
            mps.put_tensor(target - 1, lt, store)?;
            mps.put_tensor(target, rt, store)?;
            store.remove(&conn_key(&tag, c))?;
            store::save_bin(store, &conn_key(&tag, target), &lambda3)?;
            store::save_bin(store, &left_key(&tag, target), &new_left)?;
            store::save_bin(store, &right_key(&tag, target), &new_right)?;
        }
        ctx.timers.decomp += t.elapsed();
        let energy = out.energies.first().copied().unwrap_or(f64::INFINITY);
        if self.config.iprint >= 2 {
            debug!(
                "merge at {} | E = {:.12} | error = {:.3e} | ndav = {}",
                target, energy, error, out.ndav,
            );
        }
        Ok((energy, error))
    }

    /// One round: a partial sweep of every owned segment, even segments in
    /// the current direction and odd ones against it, followed by the
    /// connection sweep. Returns the lowest energy and the largest discarded
    /// weight over all processes.
    pub fn unordered_sweep(
        &mut self,
        ctx: &mut SweepContext,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<(f64, f64)>
    {
        let forward = self.forward;
        let comm = self.rule.as_ref().map(|r| r.comm.clone());
        if ctx.should_abort(comm.as_deref())? {
            self.aborted = true;
            return Ok((f64::NAN, 0.0));
        }
        let nseg = self.n_segments();
        self.site_times.iter_mut().for_each(|t| *t = 0.0);
        let mut centers = vec![0.0; nseg];
        let mut flags = [f64::INFINITY, 0.0, 0.0];
        for s in 0..nseg {
            if !self.owns(s) { continue; }
            let part = self.partial_sweep(ctx, s, forward == (s % 2 == 0), bond_dim, noise, conv)?;
            centers[s] = part.center as f64;
            flags[0] = flags[0].min(part.energy);
            flags[1] = flags[1].max(part.error);
            if part.aborted { flags[2] = 1.0; }
        }
        let mut energy = [flags[0]];
        let mut rest = [flags[1], flags[2]];
        if let Some(comm) = comm.as_deref() {
            comm.allreduce_max(&mut self.site_times)?;
            comm.allreduce_max(&mut centers)?;
            comm.allreduce_min(&mut energy)?;
            comm.allreduce_max(&mut rest)?;
        }
        self.centers = centers.iter().map(|c| *c as usize).collect();
        self.sync(ctx)?;
        if rest[1] > 0.0 {
            self.aborted = true;
            return Ok((energy[0], rest[0]));
        }

        let (e, w) = self.connection_sweep(ctx, forward, bond_dim, noise, conv)?;
        let mut merged = [e.min(energy[0]), w.max(rest[0])];
        if let Some(comm) = comm.as_deref() {
            comm.allreduce_min(&mut merged[..1])?;
            comm.allreduce_max(&mut merged[1..])?;
        }
        self.forward = !forward;
        Ok((merged[0], merged[1]))
    }

    /// Run up to `n_sweeps` rounds and return the lowest energy of the last
    /// one.
    ///
    /// Converges like [`Dmrg::solve`]: at least two rounds, an energy change
    /// below `tol`, and the final bond dimension and noise of the schedule.
    pub fn solve(
        &mut self,
        ctx: &mut SweepContext,
        n_sweeps: usize,
        tol: f64,
    ) -> SweepResult<f64>
    {
        self.converged = false;
        self.aborted = false;
        let schedule = self.config.schedule.clone();
        for k in 0..n_sweeps {
            let bond_dim = schedule.bond_dim(k);
            let noise = schedule.noise(k);
            let conv = schedule.solver_conv(k, tol);
            let forward = self.forward;
            let t = Instant::now();
            let (energy, error) = self.unordered_sweep(ctx, bond_dim, noise, conv)?;
            if self.aborted {
                info!("round {} aborted", k);
                break;
            }
            let elapsed = t.elapsed().as_secs_f64();
            self.sweep_energies.push(energy);
            self.sweep_discarded_weights.push(error);
            self.sweep_time.push(elapsed);
            if self.config.iprint >= 1 {
                info!(
                    "round {:>3} {} | M = {:>5} | noise = {:.2e} | E = {:.12} | DW = {:.3e} \
                    | conns = {:?} | time = {:.3} s",
                    k, if forward { "->" } else { "<-" }, bond_dim, noise, energy, error,
                    self.conns, elapsed,
                );
            }
            let change =
                match self.sweep_energies.as_slice() {
                    [.., prev, last] => (prev - last).abs(),
                    _ => f64::INFINITY,
                };
            self.converged =
                self.sweep_energies.len() >= self.config.min_sweeps.max(2)
                && change < tol
                && schedule.is_final(k);
            if self.converged { break; }
        }
        if !self.converged && !self.aborted && tol > 0.0 {
            warn!("multi-center: not converged to {:.2e} after {} rounds", tol, self.sweep_energies.len());
        }
        Ok(self.sweep_energies.last().copied().unwrap_or(f64::NAN))
    }

    /// Put the inverse Schmidt values back into the chain and return the
    /// right-canonical, normalized single-center MPS (center at site 0).
    pub fn into_mps(self, ctx: &mut SweepContext) -> SweepResult<MpsId> {
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let n = self.n_sites();
        if self.is_root() {
            let mps = ctx.arena.get_mut(self.mps);
            let tag = mps.tag.clone();
            for c in self.conns.iter() {
                let lambda: Vec<f64> = store::load_bin(store, &conn_key(&tag, *c))?;
                let mut t = mps.site_tensor(*c, store)?.into_owned();
                t.scale_left(lambda.iter().map(|l| pseudo_inverse(*l)));
                mps.put_tensor(*c, t, store)?;
            }
            mps.shift_center(0, n - 1, store)?;
            mps.shift_center(n - 1, 0, store)?;
            let mut t = mps.site_tensor(0, store)?.into_owned();
            let nrm = t.norm();
            if nrm > 0.0 { t.scale(1.0 / nrm); }
            mps.put_tensor(0, t, store)?;
            mps.center = 0;
            mps.forms = CanonicalForms::with_center(n, 0, false);
            mps.save_data(store)?;
            let prefixes = [format!("{tag}.conn."), format!("{tag}.env.")];
            for key in store.keys()?.into_iter() {
                if prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                    store.remove(&key)?;
                }
            }
        }
        if let Some(comm) = self.comm() { comm.barrier()?; }
        let mps = ctx.arena.get_mut(self.mps);
        mps.unload_all();
        mps.center = 0;
        mps.forms = CanonicalForms::with_center(n, 0, false);
        mps.refresh_bond_dims(store)?;
        Ok(self.mps)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::SweepSchedule,
        decompose::NoiseType,
        mps::{ Mps, MpsKind },
        quantum::Sector,
        store::MemoryStore,
    };
    use super::*;

    fn context() -> SweepContext { SweepContext::new(Arc::new(MemoryStore::new()), 11, 0) }

    fn state(ctx: &mut SweepContext, mpo: &Mpo, bond_dim: usize) -> MpsId {
        let store = Arc::clone(&ctx.store);
        let mps =
            Mps::random(
                "psi", mpo.bases(), Sector(0), bond_dim, 2, MpsKind::Single,
                store.as_ref(), &mut ctx.rng,
            ).unwrap();
        ctx.arena.insert(mps)
    }

    fn config() -> DmrgConfig {
        DmrgConfig {
            schedule: SweepSchedule::new([16], [1e-5, 0.0]),
            noise_type: NoiseType::NONE,
            iprint: 0,
            ..DmrgConfig::default()
        }
    }

    // per-site times on 12 sites: `slow` on sites [a, b), 1 elsewhere
    fn times(a: usize, b: usize, slow: f64) -> Vec<f64> {
        (0..12).map(|i| if (a..b).contains(&i) { slow } else { 1.0 }).collect()
    }

    #[test]
    fn connections_move_toward_the_faster_segment() {
        let conns = [4, 8];
        // left neighbor slower by 6 s: one site of 3 s evens it out
        assert_eq!(shifted_connection(&conns, 0, 12, &times(0, 4, 3.0), 2), 3);
        assert_eq!(shifted_connection(&conns, 0, 12, &times(0, 4, 3.0), 5), 3);
        // right neighbor slower
        assert_eq!(shifted_connection(&conns, 0, 12, &times(4, 8, 3.0), 5), 5);
        assert_eq!(shifted_connection(&conns, 1, 12, &times(8, 12, 10.0), 5), 9);
        // a move that overshoots but still shrinks the difference is taken
        assert_eq!(shifted_connection(&conns, 0, 12, &times(0, 4, 2.0), 2), 3);
        // both neighbors keep two sites
        assert_eq!(shifted_connection(&conns, 0, 12, &times(6, 7, 100.0), 5), 6);
        assert_eq!(shifted_connection(&conns, 0, 12, &times(6, 7, 100.0), 1), 5);
        // nothing to gain
        assert_eq!(shifted_connection(&conns, 0, 12, &times(0, 12, 0.0), 2), 4);
        assert_eq!(shifted_connection(&conns, 0, 12, &times(0, 12, 1.0), 2), 4);
    }

    #[test]
    fn small_imbalance_keeps_the_connection() {
        let conns = [4, 8];
        let mut t = times(0, 12, 1.0);
        t[0] = 1.1;
        assert_eq!(shifted_connection(&conns, 0, 12, &t, 2), 4);
        t[0] = 1.0;
        t[5] = 1.9;
        assert_eq!(shifted_connection(&conns, 0, 12, &t, 2), 4);
        assert_eq!(shifted_connection(&conns, 1, 12, &t, 2), 8);
    }

    #[test]
    fn cutting_and_joining_keeps_the_state() {
        let mpo = Arc::new(Mpo::heisenberg(8, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = state(&mut ctx, &mpo, 6);
        let before = ctx.arena.get(id).to_dense(0, ctx.store()).unwrap();
        let pm = ParallelMps::new(mpo, id, &mut ctx, config(), vec![3, 6], None).unwrap();
        assert_eq!(pm.n_segments(), 3);
        assert_eq!(pm.segment(1), (3, 6));
        assert_eq!(ctx.arena.get(id).forms.to_string(), "CRRLLCCR");
        let lambda = pm.schmidt_values(3, &ctx).unwrap();
        let weight: f64 = lambda.iter().map(|l| l * l).sum();
        assert!((weight - before.norm_squared()).abs() < 1e-10);
        let id = pm.into_mps(&mut ctx).unwrap();
        let after = ctx.arena.get(id).to_dense(0, ctx.store()).unwrap();
        let overlap = before.dot(&after) / before.norm();
        assert!((overlap.abs() - 1.0).abs() < 1e-10);
        assert!(!ctx.store().keys().unwrap().iter().any(|k| k.starts_with("psi.conn.")));
    }

    #[test]
    fn segments_need_two_sites_and_two_site_windows() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = state(&mut ctx, &mpo, 4);
        assert!(matches!(
            ParallelMps::new(mpo.clone(), id, &mut ctx, config(), vec![1, 4], None),
            Err(SweepError::UnsupportedMode(_)),
        ));
        let cfg = DmrgConfig { dot: 1, ..config() };
        assert!(matches!(
            ParallelMps::new(mpo, id, &mut ctx, cfg, vec![3], None),
            Err(SweepError::UnsupportedMode(_)),
        ));
    }

    #[test]
    fn rounds_reach_the_serial_ground_state() {
        let mpo = Arc::new(Mpo::heisenberg(8, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = state(&mut ctx, &mpo, 8);
        let mut pm = ParallelMps::new(mpo.clone(), id, &mut ctx, config(), vec![3, 6], None).unwrap();
        pm.solve(&mut ctx, 30, 1e-10).unwrap();
        let id = pm.into_mps(&mut ctx).unwrap();

        let mut serial_ctx = context();
        let sid = state(&mut serial_ctx, &mpo, 8);
        let mut dmrg = Dmrg::new(mpo.clone(), sid, &mut serial_ctx, config(), None).unwrap();
        let e0 = dmrg.solve(&mut serial_ctx, 10, true, 1e-10).unwrap();

        // evaluate the joined state without changing it
        let cfg =
            DmrgConfig {
                davidson_soft_max_iter: Some(0),
                schedule: SweepSchedule::new([usize::MAX], [0.0]),
                ..config()
            };
        let mut check = Dmrg::new(mpo, id, &mut ctx, cfg, None).unwrap();
        let (energies, _) = check.sweep(&mut ctx, true, usize::MAX, 0.0, 1e-10).unwrap();
        assert!((energies[0] - e0).abs() < 1e-6, "{} vs {}", energies[0], e0);
    }
}
