//! Sweeps solving linear equations for an MPS.
//!
//! A [`Linear`] driver optimizes the bra `|x⟩` of one of
//! ```text
//! (H + shift) |x⟩ = O |r⟩               Normal, with a left-hand operator H
//! |x⟩ = O |r⟩                           Normal without H, or PerturbativeCompression
//! (H + shift - ω + iη) |x⟩ = O |r⟩      GreensFunction, with x = x_r + i x_i
//! ```
//! window by window. Three environments move together: `lme` (`H` between
//! `x` and itself), `rme` (`O` between `x` and the source `|r⟩`), and an
//! optional `tme` (some operator between a target state `|t⟩` and `x`) that
//! evaluates the reported scalar. The source and target states are re-split
//! along with the bra, with their own bond dimensions and no noise.
//!
//! For Green's functions the bra is a two-state MPS holding `x_r` and `x_i`
//! in a shared basis; its density matrix mixes the two parts with
//! `complex_weights`.

use std::{
    fmt,
    sync::Arc,
    time::{ Duration, Instant },
};
use itertools::Itertools;
use tracing::{ debug, info, warn };
use crate::{
    comm::ParallelRule,
    config::{ EquationType, LinearConfig },
    context::{ ResumeCursor, SweepContext },
    decompose::{ DecompositionType, NoiseKind, SplitMatrix, check_noise },
    dmrg::perturbations,
    environment::MovingEnvironment,
    mpo::Mpo,
    mps::{ MpsError, MpsId, MpsKind, Wavefunction },
    solver::SolverControl,
    store::TensorStore,
    sweep::{
        Step,
        TruncateFn,
        Truncation,
        one_dot_window,
        split_and_advance,
        truncate_multi,
        truncate_single,
        two_dot_window,
        window_shape,
    },
    SweepError,
    SweepResult,
};

/// Statistics of one site update.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearIteration {
    /// First site of the window.
    pub site: usize,
    pub forward: bool,
    /// Target values: one for most equations, `(re, im)` for Green's
    /// functions.
    pub targets: Vec<f64>,
    /// Discarded weight of the bra.
    pub error: f64,
    /// Bond dimension of the bra after truncation.
    pub mmps: usize,
    /// Matrix-vector products of the solve.
    pub nmult: usize,
    pub nflop: usize,
    pub tmult: Duration,
}

impl fmt::Display for LinearIteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.tmult.as_secs_f64();
        write!(
            f,
            "{} site {:>4} | F = [{}] | error = {:.3e} | M = {} | nmult = {} | {:.1} Mflop/s",
            if self.forward { "->" } else { "<-" },
            self.site,
            self.targets.iter().map(|x| format!("{x:.12}")).join(", "),
            self.error,
            self.mmps,
            self.nmult,
            if secs > 0.0 { self.nflop as f64 / secs / 1e6 } else { 0.0 },
        )
    }
}

/// Sweep driver for linear equations, compression and Green's functions.
#[derive(Debug)]
pub struct Linear {
    /// The solution `|x⟩`.
    pub bra: MpsId,
    /// The source `|r⟩`.
    pub ket: MpsId,
    /// The bra of the target environment, if any.
    pub target: Option<MpsId>,
    pub lme: Option<MovingEnvironment>,
    pub rme: MovingEnvironment,
    pub tme: Option<MovingEnvironment>,
    pub config: LinearConfig,
    /// Targets of the site with the lowest first target, per sweep.
    pub sweep_targets: Vec<Vec<f64>>,
    /// Largest discarded weight of each sweep.
    pub sweep_discarded_weights: Vec<f64>,
    /// Wall time of each sweep in seconds.
    pub sweep_time: Vec<f64>,
    pub sweep_iterations: Vec<Vec<LinearIteration>>,
    pub converged: bool,
    pub aborted: bool,
    rule: Option<ParallelRule>,
}

fn prepared(
    mpo: Arc<Mpo>,
    bra: MpsId,
    ket: MpsId,
    ctx: &mut SweepContext,
    center: usize,
    dot: usize,
    rule: Option<ParallelRule>,
) -> SweepResult<MovingEnvironment>
{
    let mut env = MovingEnvironment::new(mpo, bra, ket, center, dot, rule)?;
    let t = Instant::now();
    env.prepare(&ctx.arena, ctx.store())?;
    ctx.timers.env += t.elapsed();
    Ok(env)
}

impl Linear {
    /// Set up a driver for the bra `bra` and source `ket` of `ctx.arena`,
    /// with left-hand operator `lhs` (`None` for compression) and right-hand
    /// operator `rhs`.
    ///
    /// Both MPSs must have their centers on the same site. For Green's
    /// functions the bra must be a two-state MPS; its state weights are set
    /// to `config.complex_weights`.
    pub fn new(
        lhs: Option<Arc<Mpo>>,
        rhs: Arc<Mpo>,
        bra: MpsId,
        ket: MpsId,
        ctx: &mut SweepContext,
        config: LinearConfig,
        rule: Option<ParallelRule>,
    ) -> SweepResult<Self>
    {
        check_noise(config.noise_type, config.decomp_type)?;
        if !(1..=2).contains(&config.dot) {
            return Err(SweepError::UnsupportedMode(
                format!("{}-site windows", config.dot)));
        }
        if !(0.0..=1.0).contains(&config.right_weight) {
            return Err(SweepError::UnsupportedMode(
                format!("right weight {} outside of [0, 1]", config.right_weight)));
        }
        if bra == ket {
            return Err(SweepError::UnsupportedMode(
                "the solution and the source must be different states".into()));
        }
        let gf = config.eq_type == EquationType::GreensFunction;
        if lhs.is_none() && (gf || config.eq_type == EquationType::PerturbativeCompression) {
            return Err(SweepError::UnsupportedMode(
                format!("{:?} needs a left-hand operator", config.eq_type)));
        }
        if lhs.is_none() && config.noise_type.kind == NoiseKind::Perturbative {
            return Err(SweepError::UnsupportedMode(
                "perturbative noise needs a left-hand operator".into()));
        }
        let n = rhs.n_sites();
        if let Some(lhs) = &lhs {
            if lhs.n_sites() != n { return Err(MpsError::SiteCount(lhs.n_sites(), n).into()); }
        }
        if ctx.arena.get(ket).is_multi() {
            return Err(SweepError::UnsupportedMode("multi-state source".into()));
        }
        let center = ctx.arena.get(bra).center.min(n.saturating_sub(config.dot));
        {
            let x = ctx.arena.get_mut(bra);
            match (x.is_multi(), x.kind.nroots(), gf) {
                (true, 2, true) => {
                    if config.decomp_type != DecompositionType::DensityMatrix {
                        return Err(SweepError::UnsupportedMode(
                            "Green's functions are split through their density matrix".into()));
                    }
                    x.kind =
                        MpsKind::MultiState {
                            nroots: 2,
                            weights: config.complex_weights.to_vec(),
                        };
                },
                (_, _, true) => {
                    return Err(SweepError::UnsupportedMode(
                        "Green's functions need a two-state bra".into()));
                },
                (true, _, false) => {
                    return Err(SweepError::UnsupportedMode(
                        "multi-state bra outside of Green's functions".into()));
                },
                (false, _, false) => { },
            }
        }
        for id in [bra, ket] {
            let mps = ctx.arena.get_mut(id);
            if mps.n_sites() != n { return Err(MpsError::SiteCount(mps.n_sites(), n).into()); }
            if n < config.dot {
                return Err(SweepError::UnsupportedMode(
                    format!("{}-site windows on {} sites", config.dot, n)));
            }
            if mps.center.min(n - config.dot) != center {
                return Err(SweepError::UnsupportedMode(
                    format!("centers at sites {} and {center}", mps.center)));
            }
            mps.dot = config.dot;
            mps.center = center;
        }
        let lme =
            match lhs {
                Some(lhs) =>
                    Some(prepared(lhs, bra, bra, ctx, center, config.dot, rule.clone())?),
                None => None,
            };
        let rme = prepared(rhs, bra, ket, ctx, center, config.dot, rule.clone())?;
        Ok(Self {
            bra,
            ket,
            target: None,
            lme,
            rme,
            tme: None,
            config,
            sweep_targets: Vec::new(),
            sweep_discarded_weights: Vec::new(),
            sweep_time: Vec::new(),
            sweep_iterations: Vec::new(),
            converged: false,
            aborted: false,
            rule,
        })
    }

    /// Report `⟨t|tmpo|x⟩` as the target instead of the solver's value.
    ///
    /// `target` may be the source; it must sit at the same center as the
    /// bra.
    pub fn with_target(
        mut self,
        tmpo: Arc<Mpo>,
        target: MpsId,
        ctx: &mut SweepContext,
    ) -> SweepResult<Self>
    {
        if target == self.bra {
            return Err(SweepError::UnsupportedMode(
                "the target environment cannot use the solution as its bra".into()));
        }
        let dot = self.config.dot;
        let center = self.rme.center;
        let n = self.rme.n_sites();
        let t = ctx.arena.get_mut(target);
        if t.n_sites() != n { return Err(MpsError::SiteCount(t.n_sites(), n).into()); }
        if t.is_multi() {
            return Err(SweepError::UnsupportedMode("multi-state target".into()));
        }
        if t.center.min(n - dot) != center {
            return Err(SweepError::UnsupportedMode(
                format!("centers at sites {} and {center}", t.center)));
        }
        t.dot = dot;
        t.center = center;
        self.tme = Some(prepared(tmpo, target, self.bra, ctx, center, dot, self.rule.clone())?);
        self.target = Some(target);
        Ok(self)
    }

    fn is_root(&self) -> bool { self.rule.as_ref().map_or(true, |r| r.is_root()) }

    /// Run up to `n_sweeps` sweeps, starting in direction `forward`, and
    /// return the first target of the last sweep.
    ///
    /// Stops early once the first target changes by less than `tol` between
    /// sweeps at the final bond dimension and noise. Resumes from a cursor
    /// in the restart directory like [`Dmrg::solve`][crate::dmrg::Dmrg::solve].
    pub fn solve(
        &mut self,
        ctx: &mut SweepContext,
        n_sweeps: usize,
        forward: bool,
        tol: f64,
    ) -> SweepResult<f64>
    {
        let tag = ctx.arena.get(self.bra).tag.clone();
        let mut forward = forward;
        let mut start: usize = 0;
        if let Some(cursor) = ctx.load_resume(&tag)? {
            info!("resuming '{}' at sweep {}", tag, cursor.sweep);
            start = cursor.sweep;
            forward = cursor.forward;
            self.sweep_targets = cursor.energies;
        }
        self.converged = false;
        self.aborted = false;
        let schedule = self.config.schedule.clone();
        for k in start..n_sweeps {
            let bond_dim = schedule.bond_dim(k);
            let noise = schedule.noise(k);
            let conv = schedule.solver_conv(k, tol);
            let t = Instant::now();
            let (targets, error) = self.sweep(ctx, forward, bond_dim, noise, conv)?;
            let elapsed = t.elapsed().as_secs_f64();
            if self.aborted {
                info!("sweep {} aborted", k);
                self.save_cursor(ctx, ResumeCursor {
                    sweep: k,
                    forward,
                    energies: self.sweep_targets.clone(),
                })?;
                break;
            }
            self.sweep_targets.push(targets);
            self.sweep_discarded_weights.push(error);
            self.sweep_time.push(elapsed);
            if self.config.iprint >= 1 {
                info!(
                    "sweep {:>3} {} | M = {:>5} | noise = {:.2e} | minres thrd = {:.2e} \
                    | F = [{}] | DW = {:.3e} | time = {:.3} s",
                    k,
                    if forward { "->" } else { "<-" },
                    bond_dim,
                    noise,
                    conv,
                    self.sweep_targets.last().into_iter().flatten()
                        .map(|x| format!("{x:.12}")).join(", "),
                    error,
                    elapsed,
                );
            }
            forward = !forward;
            self.converged =
                self.sweep_targets.len() >= self.config.min_sweeps.max(2)
                && self.target_change() < tol
                && schedule.is_final(k);
            self.save_cursor(ctx, ResumeCursor {
                sweep: k + 1,
                forward,
                energies: self.sweep_targets.clone(),
            })?;
            if self.converged { break; }
        }
        if !self.converged && !self.aborted && tol > 0.0 {
            warn!(
                "not converged to {:.2e} after {} sweeps (last change {:.3e})",
                tol, self.sweep_targets.len(), self.target_change(),
            );
        }
        Ok(self.value().unwrap_or(f64::NAN))
    }

    /// First target of the last completed sweep.
    pub fn value(&self) -> Option<f64> {
        self.sweep_targets.last().and_then(|x| x.first()).copied()
    }

    fn target_change(&self) -> f64 {
        match self.sweep_targets.as_slice() {
            [.., prev, last] =>
                match (prev.first(), last.first()) {
                    (Some(a), Some(b)) => (a - b).abs(),
                    _ => f64::INFINITY,
                },
            _ => f64::INFINITY,
        }
    }

    fn save_cursor(&self, ctx: &SweepContext, cursor: ResumeCursor) -> SweepResult<()> {
        if !self.is_root() { return Ok(()); }
        ctx.save_restart(ctx.arena.get(self.bra), &cursor)?;
        Ok(())
    }

    /// Run one sweep from the current center to the chain end in direction
    /// `forward`. Returns the targets of the site whose first target is
    /// lowest, and the largest discarded weight.
    pub fn sweep(
        &mut self,
        ctx: &mut SweepContext,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<(Vec<f64>, f64)>
    {
        let center = self.rme.center;
        let n = self.rme.n_sites();
        let dot = self.config.dot;
        let sites: Vec<usize> =
            if forward { (center..=n - dot).collect() } else { (0..=center).rev().collect() };
        let comm = self.rule.as_ref().map(|r| r.comm.clone());
        let mut iterations: Vec<LinearIteration> = Vec::with_capacity(sites.len());
        for i in sites.into_iter() {
            if ctx.should_abort(comm.as_deref())? {
                self.aborted = true;
                break;
            }
            let step = Step { site: i, forward, bond_dim, noise, conv };
            let it = self.update(ctx, step)?;
            if self.config.iprint >= 2 { debug!("{}", it); }
            iterations.push(it);
        }
        let targets =
            iterations.iter()
            .filter(|it| !it.targets.is_empty())
            .min_by(|a, b| a.targets[0].total_cmp(&b.targets[0]))
            .map(|it| it.targets.clone())
            .unwrap_or_default();
        let error = iterations.iter().map(|it| it.error).fold(0.0, f64::max);
        self.sweep_iterations.push(iterations);
        Ok((targets, error))
    }

    fn envs_mut(&mut self) -> impl Iterator<Item = &mut MovingEnvironment> {
        self.lme.iter_mut()
            .chain(std::iter::once(&mut self.rme))
            .chain(self.tme.iter_mut())
    }

    // the target state, if it has to be moved on its own
    fn separate_target(&self) -> Option<MpsId> {
        self.target.filter(|t| *t != self.ket)
    }

    fn window(
        &self,
        ctx: &mut SweepContext,
        id: MpsId,
        i: usize,
        fuse_left: bool,
        store: &dyn TensorStore,
    ) -> SweepResult<Wavefunction>
    {
        if self.config.dot == 1 {
            one_dot_window(ctx.arena.get_mut(id), i, fuse_left, store)
        } else {
            two_dot_window(ctx.arena.get(id), i, store)
        }
    }

    fn solver_control(&self, conv: f64) -> SolverControl {
        SolverControl::new(
            conv, self.config.minres_max_iter, self.config.minres_soft_max_iter)
    }

    fn collected(&self) -> bool {
        self.config.noise_type.collected && self.rule.is_some()
    }

    fn wants_perturbations(&self, step: Step, splitting: bool) -> bool {
        splitting
            && self.config.noise_type.kind == NoiseKind::Perturbative
            && step.noise > 0.0
            && (self.is_root() || self.collected())
    }

    fn shared_error(&self, error: f64) -> SweepResult<f64> {
        let Some(rule) = &self.rule else { return Ok(error); };
        let mut buf = [error];
        rule.comm.broadcast(&mut buf)?;
        Ok(buf[0])
    }

    fn update(&mut self, ctx: &mut SweepContext, step: Step) -> SweepResult<LinearIteration> {
        let Step { site: i, forward, .. } = step;
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let n = self.rme.n_sites();
        let dot = self.config.dot;
        let fuse_left = i <= (n - 1) / 2;
        let t = Instant::now();
        let mut x = self.window(ctx, self.bra, i, fuse_left, store)?;
        let r = self.window(ctx, self.ket, i, fuse_left, store)?;
        let tw =
            match self.separate_target() {
                Some(id) => Some(self.window(ctx, id, i, fuse_left, store)?),
                None => None,
            };
        for env in self.envs_mut() { env.move_to(i, &ctx.arena, store)?; }
        ctx.timers.env += t.elapsed();

        let keep = dot == 1 && step.at_end(n) && !self.config.decomp_last_site;
        let splitting = !keep;
        let fuse = x.fuse_side();
        let ctrl = self.solver_control(step.conv);
        let cfg = &self.config;
        let (b, _) =
            self.rme.eff_ham(fuse, forward, false, x.primary(), r.primary())?
            .multiply(r.primary())?;
        let mut terms: Vec<SplitMatrix> = Vec::new();
        let (values, nmult, nflop, tmult) =
            match (cfg.eq_type, &self.lme) {
                (EquationType::GreensFunction, Some(lme)) => {
                    let h = lme.eff_ham(fuse, forward, true, x.primary(), x.primary())?;
                    let (re, im) = x.roots.split_at_mut(1);
                    let out =
                        h.greens_function(
                            cfg.gf_omega, cfg.gf_eta, cfg.shift, &b, &mut re[0], &mut im[0],
                            &ctrl,
                        )?;
                    if self.wants_perturbations(step, splitting) {
                        terms = perturbations(&h, &x, !self.collected())?;
                    }
                    (vec![out.value.0, out.value.1], out.iterations, out.nflop, out.time)
                },
                (EquationType::Normal, Some(lme)) => {
                    let h = lme.eff_ham(fuse, forward, true, x.primary(), x.primary())?;
                    let out = h.inverse_multiply(cfg.shift, &b, &mut x.roots[0], &ctrl)?;
                    if self.wants_perturbations(step, splitting) {
                        terms = perturbations(&h, &x, !self.collected())?;
                    }
                    (vec![out.value], out.iterations, out.nflop, out.time)
                },
                (_, lme) => {
                    let start = Instant::now();
                    x.roots[0] = b.clone();
                    let norm = b.norm();
                    if let Some(lme) = lme.as_ref().filter(|_| self.wants_perturbations(step, splitting)) {
                        let h = lme.eff_ham(fuse, forward, false, x.primary(), x.primary())?;
                        terms = perturbations(&h, &x, !self.collected())?;
                    }
                    (vec![norm], 1, 0, start.elapsed())
                },
            };
        ctx.timers.solve += tmult;

        let targets =
            match &self.tme {
                Some(tme) => {
                    let bra = tw.as_ref().unwrap_or(&r).primary();
                    let h = tme.eff_ham(fuse, forward, false, bra, x.primary())?;
                    x.roots.iter()
                        .map(|root| h.expect(bra, root))
                        .collect::<Result<Vec<f64>, _>>()?
                },
                None => values,
            };

        let t = Instant::now();
        let segment = (0, n);
        let extra: Vec<(f64, SplitMatrix)> =
            if splitting && cfg.right_weight > 0.0 {
                let shape = window_shape(ctx.arena.get(self.bra), &x, i, dot, forward)?;
                vec![(cfg.right_weight, shape.matrix(&b)?)]
            } else {
                Vec::new()
            };
        let truncate: TruncateFn = if x.is_multi() { truncate_multi } else { truncate_single };
        let trunc =
            Truncation {
                forward,
                bond_dim: step.bond_dim,
                cutoff: cfg.cutoff,
                trunc_type: cfg.trunc_type,
                decomp_type: cfg.decomp_type,
                noise_type: cfg.noise_type,
                noise: step.noise,
                normalize: false,
                weight: 1.0 - cfg.right_weight,
                extra: &extra,
                perturbations: &terms,
                rule: self.rule.as_ref(),
            };
        let (error, mmps) =
            split_and_advance(
                ctx.arena.get_mut(self.bra), x, step, segment, keep, &trunc, truncate,
                &mut ctx.rng, store,
            )?;
        let followers =
            std::iter::once((self.ket, r, cfg.ket_bond_dim))
            .chain(tw.map(|w| (self.target.unwrap_or(self.ket), w, cfg.target_bond_dim)));
        for (id, wfn, bond_dim) in followers {
            let trunc =
                Truncation {
                    rule: self.rule.as_ref(),
                    ..Truncation::follower(forward, bond_dim, cfg.trunc_type)
                };
            split_and_advance(
                ctx.arena.get_mut(id), wfn, step, segment, keep, &trunc, truncate_single,
                &mut ctx.rng, store,
            )?;
        }
        ctx.timers.decomp += t.elapsed();
        Ok(LinearIteration {
            site: i,
            forward,
            targets,
            error: self.shared_error(error)?,
            mmps,
            nmult,
            nflop,
            tmult,
        })
    }
}

#[cfg(test)]
mod tests {
    use nalgebra as na;
    use crate::{
        config::SweepSchedule,
        decompose::NoiseType,
        mps::Mps,
        quantum::Sector,
        store::MemoryStore,
    };
    use super::*;

    fn context() -> SweepContext { SweepContext::new(Arc::new(MemoryStore::new()), 11, 0) }

    fn random_state(
        ctx: &mut SweepContext,
        tag: &str,
        mpo: &Mpo,
        bond_dim: usize,
        kind: MpsKind,
    ) -> MpsId
    {
        let store = Arc::clone(&ctx.store);
        let mps =
            Mps::random(
                tag, mpo.bases(), Sector(0), bond_dim, 2, kind, store.as_ref(), &mut ctx.rng,
            ).unwrap();
        ctx.arena.insert(mps)
    }

    fn config(eq_type: EquationType) -> LinearConfig {
        LinearConfig {
            eq_type,
            schedule: SweepSchedule { solver_convs: vec![1e-18], ..SweepSchedule::new([32], [0.0]) },
            cutoff: 1e-20,
            noise_type: NoiseType::NONE,
            iprint: 0,
            ..LinearConfig::default()
        }
    }

    fn dense(ctx: &SweepContext, id: MpsId, root: usize) -> na::DVector<f64> {
        ctx.arena.get(id).to_dense(root, ctx.store()).unwrap()
    }

    #[test]
    fn compression_applies_the_operator() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 2, MpsKind::Single);
        let rv = dense(&ctx, r, 0);
        let hr = mpo.dense_matrix() * &rv;
        let mut linear =
            Linear::new(None, mpo.clone(), x, r, &mut ctx, config(EquationType::Normal), None)
            .unwrap();
        let norm = linear.solve(&mut ctx, 6, true, 0.0).unwrap();
        assert!((norm - hr.norm()).abs() < 1e-8, "{norm} vs {}", hr.norm());
        assert!((dense(&ctx, x, 0) - &hr).norm() < 1e-8);
        // the source only changes gauge
        assert!((dense(&ctx, r, 0) - &rv).norm() < 1e-10);
    }

    #[test]
    fn shifted_inverse_matches_dense_solve() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
        let ident = Arc::new(Mpo::identity(&mpo.bases()));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 8, MpsKind::Single);
        let rv = dense(&ctx, r, 0);
        let cfg = LinearConfig { shift: 5.0, ..config(EquationType::Normal) };
        let mut linear =
            Linear::new(Some(mpo.clone()), ident.clone(), x, r, &mut ctx, cfg, None)
            .unwrap()
            .with_target(ident, r, &mut ctx)
            .unwrap();
        let value = linear.solve(&mut ctx, 8, true, 1e-8).unwrap();
        let dim = rv.len();
        let a = mpo.dense_matrix() + na::DMatrix::identity(dim, dim) * 5.0;
        let exact = a.lu().solve(&rv).unwrap();
        assert!((dense(&ctx, x, 0) - &exact).norm() < 1e-6);
        assert!((value - exact.dot(&rv)).abs() < 1e-7);
        assert!(linear.converged);
    }

    #[test]
    fn sweep_reports_the_lowest_target() {
        let mpo = Arc::new(Mpo::heisenberg(8, 1.0, 1.0, 0.0));
        let ident = Arc::new(Mpo::identity(&mpo.bases()));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 2, MpsKind::Single);
        let cfg =
            LinearConfig {
                shift: 5.0,
                schedule:
                    SweepSchedule { solver_convs: vec![1e-18], ..SweepSchedule::new([2], [0.0]) },
                ..config(EquationType::Normal)
            };
        let mut linear = Linear::new(Some(mpo), ident, x, r, &mut ctx, cfg, None).unwrap();
        let value = linear.solve(&mut ctx, 1, true, 0.0).unwrap();
        let lowest =
            linear.sweep_iterations[0].iter()
            .map(|it| it.targets[0])
            .fold(f64::INFINITY, f64::min);
        assert_eq!(linear.sweep_iterations[0].len(), 7);
        assert_eq!(value, lowest);
        assert_eq!(linear.sweep_targets[0][0], lowest);
    }

    #[test]
    fn greens_function_matches_dense_solve() {
        let mpo = Arc::new(Mpo::heisenberg(4, 1.0, 1.0, 0.0));
        let ident = Arc::new(Mpo::identity(&mpo.bases()));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 4, MpsKind::multi(2));
        let rv = dense(&ctx, r, 0);
        let (omega, eta) = (-1.0, 0.2);
        let cfg =
            LinearConfig {
                gf_omega: omega,
                gf_eta: eta,
                ..config(EquationType::GreensFunction)
            };
        let mut linear =
            Linear::new(Some(mpo.clone()), ident, x, r, &mut ctx, cfg, None).unwrap();
        linear.solve(&mut ctx, 8, true, 1e-8).unwrap();
        let dim = rv.len();
        let a = mpo.dense_matrix() - na::DMatrix::identity(dim, dim) * omega;
        let big = &a * &a + na::DMatrix::identity(dim, dim) * (eta * eta);
        let xi = big.lu().solve(&(&rv * (-eta))).unwrap();
        let xr = &a * &xi * (-1.0 / eta);
        assert!((dense(&ctx, x, 0) - &xr).norm() < 1e-5);
        assert!((dense(&ctx, x, 1) - &xi).norm() < 1e-5);
        let last = linear.sweep_targets.last().unwrap();
        assert_eq!(last.len(), 2);
        assert!((last[0] - xr.dot(&rv)).abs() < 1e-5);
        assert!((last[1] - xi.dot(&rv)).abs() < 1e-5);
    }

    #[test]
    fn one_site_compression_with_right_weight() {
        let mpo = Arc::new(Mpo::heisenberg(5, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 8, MpsKind::Single);
        let hr = mpo.dense_matrix() * dense(&ctx, r, 0);
        let cfg = LinearConfig { dot: 1, right_weight: 0.2, ..config(EquationType::Normal) };
        let mut linear = Linear::new(None, mpo.clone(), x, r, &mut ctx, cfg, None).unwrap();
        linear.solve(&mut ctx, 6, true, 0.0).unwrap();
        assert!((dense(&ctx, x, 0) - &hr).norm() < 1e-8);
        assert_eq!(linear.sweep_iterations[0].len(), 5);
    }

    #[test]
    fn rejected_settings() {
        let mpo = Arc::new(Mpo::heisenberg(4, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let r = random_state(&mut ctx, "r", &mpo, 4, MpsKind::Single);
        let x = random_state(&mut ctx, "x", &mpo, 4, MpsKind::Single);
        let gf = config(EquationType::GreensFunction);
        assert!(matches!(
            Linear::new(None, mpo.clone(), x, r, &mut ctx, gf.clone(), None),
            Err(SweepError::UnsupportedMode(_)),
        ));
        assert!(matches!(
            Linear::new(Some(mpo.clone()), mpo.clone(), x, r, &mut ctx, gf, None),
            Err(SweepError::UnsupportedMode(_)),
        ));
        let heavy = LinearConfig { right_weight: 1.5, ..config(EquationType::Normal) };
        assert!(matches!(
            Linear::new(None, mpo.clone(), x, r, &mut ctx, heavy, None),
            Err(SweepError::UnsupportedMode(_)),
        ));
        let pert =
            LinearConfig {
                noise_type: NoiseType::PERTURBATIVE,
                ..config(EquationType::Normal)
            };
        assert!(matches!(
            Linear::new(None, mpo.clone(), x, r, &mut ctx, pert, None),
            Err(SweepError::UnsupportedMode(_)),
        ));
        assert!(matches!(
            Linear::new(None, mpo, x, x, &mut ctx, config(EquationType::Normal), None),
            Err(SweepError::UnsupportedMode(_)),
        ));
    }
}
