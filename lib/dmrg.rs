//! Ground-state optimization by sweeping one- or two-site windows across the
//! chain.
//!
//! Each step of a [`Dmrg`] sweep
//! 1. loads the window wavefunction and slides the environment to it;
//! 2. solves for the lowest eigenstate(s) of the effective Hamiltonian with
//!    Davidson;
//! 3. truncates the result (with noise) back to the scheduled bond dimension;
//! 4. writes the factors back and advances the canonical-form tags.
//!
//! The step function is picked once per sweep from the window width, and the
//! truncation from whether the MPS holds one state or a group of them.

use std::{
    fmt,
    sync::Arc,
    time::{ Duration, Instant },
};
use itertools::Itertools;
use tracing::{ debug, info, warn };
use crate::{
    comm::ParallelRule,
    config::DmrgConfig,
    context::{ ResumeCursor, SweepContext },
    decompose::{ DecompositionType, NoiseKind, SplitMatrix, check_noise },
    eff_ham::{ EffectiveHamiltonian, EigsOutput },
    environment::{ EnvBlock, MovingEnvironment },
    mpo::Mpo,
    mps::{ MpsError, MpsId, Wavefunction },
    solver::SolverControl,
    sweep::{
        Step,
        TruncateFn,
        Truncation,
        one_dot_window,
        split_and_advance,
        truncate_multi,
        truncate_single,
        two_dot_window,
    },
    tensor::FuseSide,
    SweepError,
    SweepResult,
};

/// Statistics of one site update.
#[derive(Clone, Debug, PartialEq)]
pub struct Iteration {
    /// First site of the window.
    pub site: usize,
    pub forward: bool,
    /// Energies of all states, lowest first.
    pub energies: Vec<f64>,
    /// Discarded weight.
    pub error: f64,
    /// Bond dimension after truncation.
    pub mmps: usize,
    /// Davidson matrix-vector products.
    pub ndav: usize,
    /// Floating-point operations of the solve.
    pub nflop: usize,
    /// Time spent in the solve.
    pub tdav: Duration,
    /// Wall time of the whole update.
    pub time: Duration,
}

impl fmt::Display for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.tdav.as_secs_f64();
        write!(
            f,
            "{} site {:>4} | E = [{}] | error = {:.3e} | M = {} | ndav = {} | {:.1} Mflop/s",
            if self.forward { "->" } else { "<-" },
            self.site,
            self.energies.iter().map(|e| format!("{e:.12}")).join(", "),
            self.error,
            self.mmps,
            self.ndav,
            if secs > 0.0 { self.nflop as f64 / secs / 1e6 } else { 0.0 },
        )
    }
}

type UpdateFn = fn(&mut Dmrg, &mut SweepContext, Step, TruncateFn) -> SweepResult<Iteration>;

/// Sweep driver for ground states and state-averaged excited states.
#[derive(Debug)]
pub struct Dmrg {
    pub mps: MpsId,
    pub env: MovingEnvironment,
    pub config: DmrgConfig,
    /// Lowest energies of each sweep, one per state.
    pub sweep_energies: Vec<Vec<f64>>,
    /// Largest discarded weight of each sweep.
    pub sweep_discarded_weights: Vec<f64>,
    /// Wall time of each sweep in seconds.
    pub sweep_time: Vec<f64>,
    /// Per-site statistics of each sweep.
    pub sweep_iterations: Vec<Vec<Iteration>>,
    pub converged: bool,
    /// Set when the abort file or signal ended the schedule.
    pub aborted: bool,
    // sites `[a, b)` swept over
    segment: (usize, usize),
}

impl Dmrg {
    /// Set up a driver for the MPS `mps` of `ctx.arena` and build its
    /// environment.
    ///
    /// With a parallel rule, every process must hold its own copy of the MPS
    /// bookkeeping over a shared store.
    pub fn new(
        mpo: Arc<Mpo>,
        mps: MpsId,
        ctx: &mut SweepContext,
        config: DmrgConfig,
        rule: Option<ParallelRule>,
    ) -> SweepResult<Self>
    {
        check_noise(config.noise_type, config.decomp_type)?;
        if !(1..=2).contains(&config.dot) {
            return Err(SweepError::UnsupportedMode(
                format!("{}-site windows", config.dot)));
        }
        let state = ctx.arena.get_mut(mps);
        let n = state.n_sites();
        if n != mpo.n_sites() {
            return Err(MpsError::SiteCount(n, mpo.n_sites()).into());
        }
        if n < config.dot {
            return Err(SweepError::UnsupportedMode(
                format!("{}-site windows on {} sites", config.dot, n)));
        }
        if state.is_multi() && config.decomp_type != DecompositionType::DensityMatrix {
            return Err(SweepError::UnsupportedMode(
                "multi-state MPSs are split through their density matrix".into()));
        }
        state.dot = config.dot;
        state.center = state.center.min(n - config.dot);
        let center = state.center;
        let mut env = MovingEnvironment::new(mpo, mps, mps, center, config.dot, rule)?;
        let t = Instant::now();
        env.prepare(&ctx.arena, ctx.store())?;
        ctx.timers.env += t.elapsed();
        Ok(Self {
            mps,
            env,
            config,
            sweep_energies: Vec::new(),
            sweep_discarded_weights: Vec::new(),
            sweep_time: Vec::new(),
            sweep_iterations: Vec::new(),
            converged: false,
            aborted: false,
            segment: (0, n),
        })
    }

    /// Set up a driver confined to the sites `[a, b)` of a chain cut into
    /// segments, with fixed boundary blocks at bonds `a` and `b`. The MPS
    /// center must already sit at an end of the segment.
    pub(crate) fn on_segment(
        mpo: Arc<Mpo>,
        mps: MpsId,
        ctx: &mut SweepContext,
        config: DmrgConfig,
        (a, b): (usize, usize),
        left: EnvBlock,
        right: EnvBlock,
    ) -> SweepResult<Self>
    {
        let center = ctx.arena.get(mps).center;
        let mut env = MovingEnvironment::new(mpo, mps, mps, center, config.dot, None)?;
        let t = Instant::now();
        env.partial_prepare(a, b, left, right, &ctx.arena, ctx.store())?;
        ctx.timers.env += t.elapsed();
        Ok(Self {
            mps,
            env,
            config,
            sweep_energies: Vec::new(),
            sweep_discarded_weights: Vec::new(),
            sweep_time: Vec::new(),
            sweep_iterations: Vec::new(),
            converged: false,
            aborted: false,
            segment: (a, b),
        })
    }

    fn is_root(&self) -> bool { self.env.rule().map_or(true, |r| r.is_root()) }

    /// Run up to `n_sweeps` sweeps, starting in direction `forward`, and
    /// return the lowest energy of the last sweep.
    ///
    /// Stops early once the energy changes by less than `tol` between sweeps
    /// at the final bond dimension and noise. If the context has a restart
    /// directory holding a resume cursor for this MPS, the schedule picks up
    /// where the cursor left off.
    pub fn solve(
        &mut self,
        ctx: &mut SweepContext,
        n_sweeps: usize,
        forward: bool,
        tol: f64,
    ) -> SweepResult<f64>
    {
        let tag = ctx.arena.get(self.mps).tag.clone();
        let mut forward = forward;
        let mut start: usize = 0;
        if let Some(cursor) = ctx.load_resume(&tag)? {
            info!("resuming '{}' at sweep {}", tag, cursor.sweep);
            start = cursor.sweep;
            forward = cursor.forward;
            self.sweep_energies = cursor.energies;
        }
        self.converged = false;
        self.aborted = false;
        let schedule = self.config.schedule.clone();
        for k in start..n_sweeps {
            let bond_dim = schedule.bond_dim(k);
            let noise = schedule.noise(k);
            let conv = schedule.solver_conv(k, tol);
            let t = Instant::now();
            let (energies, error) = self.sweep(ctx, forward, bond_dim, noise, conv)?;
            let elapsed = t.elapsed().as_secs_f64();
            if self.aborted {
                info!("sweep {} aborted", k);
                self.save_cursor(ctx, ResumeCursor {
                    sweep: k,
                    forward,
                    energies: self.sweep_energies.clone(),
                })?;
                break;
            }
            self.sweep_energies.push(energies);
            self.sweep_discarded_weights.push(error);
            self.sweep_time.push(elapsed);
            if self.config.iprint >= 1 {
                info!(
                    "sweep {:>3} {} | M = {:>5} | noise = {:.2e} | dav thrd = {:.2e} \
                    | E = [{}] | DW = {:.3e} | time = {:.3} s",
                    k,
                    if forward { "->" } else { "<-" },
                    bond_dim,
                    noise,
                    conv,
                    self.sweep_energies.last().into_iter().flatten()
                        .map(|e| format!("{e:.12}")).join(", "),
                    error,
                    elapsed,
                );
            }
            forward = !forward;
            self.converged =
                self.sweep_energies.len() >= self.config.min_sweeps.max(2)
                && self.energy_change() < tol
                && schedule.is_final(k);
            self.save_cursor(ctx, ResumeCursor {
                sweep: k + 1,
                forward,
                energies: self.sweep_energies.clone(),
            })?;
            if self.converged { break; }
        }
        if !self.converged && !self.aborted && tol > 0.0 {
            warn!(
                "not converged to {:.2e} after {} sweeps (last change {:.3e})",
                tol, self.sweep_energies.len(), self.energy_change(),
            );
        }
        Ok(self.energy().unwrap_or(f64::NAN))
    }

    /// Lowest energy of the last completed sweep.
    pub fn energy(&self) -> Option<f64> {
        self.sweep_energies.last().and_then(|e| e.first()).copied()
    }

    // largest change of any state's energy over the last two sweeps
    fn energy_change(&self) -> f64 {
        match self.sweep_energies.as_slice() {
            [.., prev, last] =>
                prev.iter().zip(last.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
            _ => f64::INFINITY,
        }
    }

    fn save_cursor(&self, ctx: &SweepContext, cursor: ResumeCursor) -> SweepResult<()> {
        if !self.is_root() { return Ok(()); }
        let mps = ctx.arena.get(self.mps);
        ctx.save_restart(mps, &cursor)?;
        Ok(())
    }

    /// Run one sweep from the current center to the chain end in direction
    /// `forward`. Returns the lowest energies seen and the largest discarded
    /// weight.
    pub fn sweep(
        &mut self,
        ctx: &mut SweepContext,
        forward: bool,
        bond_dim: usize,
        noise: f64,
        conv: f64,
    ) -> SweepResult<(Vec<f64>, f64)>
    {
        let (center, multi) = {
            let mps = ctx.arena.get(self.mps);
            (mps.center, mps.is_multi())
        };
        let dot = self.config.dot;
        let (a, b) = self.segment;
        let sites: Vec<usize> =
            if forward {
                (center..=b - dot).collect()
            } else {
                (a..=center).rev().collect()
            };
        let update: UpdateFn =
            if dot == 1 { Self::update_one_dot } else { Self::update_two_dot };
        let truncate: TruncateFn = if multi { truncate_multi } else { truncate_single };
        let comm = self.env.rule().map(|r| r.comm.clone());
        let mut iterations: Vec<Iteration> = Vec::with_capacity(sites.len());
        for i in sites.into_iter() {
            if ctx.should_abort(comm.as_deref())? {
                self.aborted = true;
                break;
            }
            let step = Step { site: i, forward, bond_dim, noise, conv };
            let t = Instant::now();
            let mut it = update(self, ctx, step, truncate)?;
            it.time = t.elapsed();
            if self.config.iprint >= 2 { debug!("{}", it); }
            iterations.push(it);
        }
        let energies =
            iterations.iter()
            .filter(|it| !it.energies.is_empty())
            .min_by(|a, b| a.energies[0].total_cmp(&b.energies[0]))
            .map(|it| it.energies.clone())
            .unwrap_or_default();
        let error = iterations.iter().map(|it| it.error).fold(0.0, f64::max);
        self.sweep_iterations.push(iterations);
        Ok((energies, error))
    }

    fn solver_control(&self, conv: f64) -> SolverControl {
        SolverControl::new(
            conv, self.config.davidson_max_iter, self.config.davidson_soft_max_iter)
    }

    fn collected(&self) -> bool {
        self.config.noise_type.collected && self.env.rule().is_some()
    }

    // Davidson on the window, plus the perturbative-noise terms if the window
    // is about to be split with them
    fn solve_window(
        &self,
        wfn: &mut Wavefunction,
        fuse: FuseSide,
        step: Step,
        splitting: bool,
    ) -> SweepResult<(EigsOutput, Vec<SplitMatrix>)>
    {
        let h = self.env.eff_ham(fuse, step.forward, true, wfn.primary(), wfn.primary())?;
        let out = h.eigs(wfn, &self.solver_control(step.conv))?;
        let wants_terms =
            splitting
            && self.config.noise_type.kind == NoiseKind::Perturbative
            && step.noise > 0.0
            && (self.is_root() || self.collected());
        let perturbations =
            if wants_terms {
                perturbations(&h, wfn, !self.collected())?
            } else {
                Vec::new()
            };
        Ok((out, perturbations))
    }

    fn truncation<'a>(&'a self, step: Step, perturbations: &'a [SplitMatrix])
        -> Truncation<'a>
    {
        Truncation {
            forward: step.forward,
            bond_dim: step.bond_dim,
            cutoff: self.config.cutoff,
            trunc_type: self.config.trunc_type,
            decomp_type: self.config.decomp_type,
            noise_type: self.config.noise_type,
            noise: step.noise,
            normalize: true,
            weight: 1.0,
            extra: &[],
            perturbations,
            rule: self.env.rule(),
        }
    }

    // the root's discarded weight, on every process
    fn shared_error(&self, error: f64) -> SweepResult<f64> {
        let Some(rule) = self.env.rule() else { return Ok(error); };
        let mut buf = [error];
        rule.comm.broadcast(&mut buf)?;
        Ok(buf[0])
    }

    fn update_one_dot(
        &mut self,
        ctx: &mut SweepContext,
        step: Step,
        truncate: TruncateFn,
    ) -> SweepResult<Iteration>
    {
        let Step { site: i, forward, .. } = step;
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let n = self.env.n_sites();
        let t = Instant::now();
        let mut wfn = {
            let mps = ctx.arena.get_mut(self.mps);
            one_dot_window(mps, i, i <= (n - 1) / 2, store)?
        };
        self.env.move_to(i, &ctx.arena, store)?;
        ctx.timers.env += t.elapsed();

        let keep = step.at_end(n) && !self.config.decomp_last_site;
        let fuse = wfn.fuse_side();
        let (out, perturbations) = self.solve_window(&mut wfn, fuse, step, !keep)?;
        ctx.timers.solve += out.time;

        let t = Instant::now();
        let mps = ctx.arena.get_mut(self.mps);
        let trunc = self.truncation(step, &perturbations);
        let (error, mmps) =
            split_and_advance(
                mps, wfn, step, self.segment, keep, &trunc, truncate, &mut ctx.rng, store)?;
        ctx.timers.decomp += t.elapsed();
        Ok(Iteration {
            site: i,
            forward,
            energies: out.energies,
            error: self.shared_error(error)?,
            mmps,
            ndav: out.ndav,
            nflop: out.nflop,
            tdav: out.time,
            time: Duration::ZERO,
        })
    }

    fn update_two_dot(
        &mut self,
        ctx: &mut SweepContext,
        step: Step,
        truncate: TruncateFn,
    ) -> SweepResult<Iteration>
    {
        let Step { site: i, forward, .. } = step;
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let t = Instant::now();
        let mut wfn = two_dot_window(ctx.arena.get(self.mps), i, store)?;
        self.env.move_to(i, &ctx.arena, store)?;
        ctx.timers.env += t.elapsed();

        let (out, perturbations) = self.solve_window(&mut wfn, FuseSide::Left, step, true)?;
        ctx.timers.solve += out.time;

        let t = Instant::now();
        let mps = ctx.arena.get_mut(self.mps);
        let trunc = self.truncation(step, &perturbations);
        let (error, mmps) =
            split_and_advance(
                mps, wfn, step, self.segment, false, &trunc, truncate, &mut ctx.rng, store)?;
        ctx.timers.decomp += t.elapsed();
        Ok(Iteration {
            site: i,
            forward,
            energies: out.energies,
            error: self.shared_error(error)?,
            mmps,
            ndav: out.ndav,
            nflop: out.nflop,
            tdav: out.time,
            time: Duration::ZERO,
        })
    }
}

/// Perturbative-noise terms of every state of `wfn`, scaled by the square
/// roots of the state weights.
pub(crate) fn perturbations(
    h: &EffectiveHamiltonian<'_>,
    wfn: &Wavefunction,
    all_terms: bool,
) -> SweepResult<Vec<SplitMatrix>>
{
    let mut out = Vec::new();
    for (k, root) in wfn.roots.iter().enumerate() {
        let w = if wfn.is_multi() { wfn.weights.get(k).copied().unwrap_or(0.0) } else { 1.0 };
        if w <= 0.0 { continue; }
        let scale = w.sqrt();
        out.extend(
            h.perturbative_noise(root, all_terms)?.into_iter()
            .map(|mut p| { p.mat.scale_mut(scale); p }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use nalgebra as na;
    use crate::{
        config::SweepSchedule,
        decompose::NoiseType,
        mps::{ Mps, MpsKind },
        quantum::Sector,
        store::MemoryStore,
    };
    use super::*;

    // lowest eigenvalues of the dense operator restricted to `target`
    fn exact(mpo: &Mpo, target: Sector, count: usize) -> Vec<f64> {
        let bases = mpo.bases();
        let dims: Vec<usize> = bases.iter().map(|b| b.len()).collect();
        let total: usize = dims.iter().product();
        let keep: Vec<usize> =
            (0..total)
            .filter(|idx| {
                let mut rem = *idx;
                let mut label = Sector::VACUUM;
                for (b, d) in bases.iter().zip(dims.iter()) {
                    label = label + b[rem % d];
                    rem /= d;
                }
                label == target
            })
            .collect();
        let h = mpo.dense_matrix();
        let sub = na::DMatrix::from_fn(keep.len(), keep.len(), |a, b| h[(keep[a], keep[b])]);
        let mut evals: Vec<f64> = sub.symmetric_eigen().eigenvalues.iter().copied().collect();
        evals.sort_by(f64::total_cmp);
        evals.truncate(count);
        evals
    }

    fn context() -> SweepContext { SweepContext::new(Arc::new(MemoryStore::new()), 7, 0) }

    fn random_state(
        ctx: &mut SweepContext,
        mpo: &Mpo,
        target: Sector,
        bond_dim: usize,
        dot: usize,
        kind: MpsKind,
    ) -> MpsId
    {
        let store = Arc::clone(&ctx.store);
        let mps =
            Mps::random(
                "psi", mpo.bases(), target, bond_dim, dot, kind, store.as_ref(), &mut ctx.rng,
            ).unwrap();
        ctx.arena.insert(mps)
    }

    fn config(dot: usize, noise_type: NoiseType) -> DmrgConfig {
        DmrgConfig {
            dot,
            schedule: SweepSchedule::new([8, 16], [1e-4, 1e-6, 0.0]),
            noise_type,
            iprint: 0,
            ..DmrgConfig::default()
        }
    }

    #[test]
    fn two_site_heisenberg_matches_exact() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2, MpsKind::Single);
        let mut dmrg =
            Dmrg::new(mpo.clone(), id, &mut ctx, config(2, NoiseType::DENSITY_MATRIX), None)
            .unwrap();
        let e = dmrg.solve(&mut ctx, 10, true, 1e-9).unwrap();
        let e0 = exact(&mpo, Sector(0), 1)[0];
        assert!((e - e0).abs() < 1e-7, "{e} vs {e0}");
        assert!(dmrg.converged);
        assert!(dmrg.sweep_discarded_weights.iter().all(|w| *w >= 0.0));
    }

    #[test]
    fn one_site_hubbard_with_perturbative_noise() {
        let mpo = Arc::new(Mpo::hubbard(4, 1.0, 4.0, 0.0));
        let mut ctx = context();
        let id = random_state(&mut ctx, &mpo, Sector(4), 8, 1, MpsKind::Single);
        let mut cfg = config(1, NoiseType::PERTURBATIVE);
        cfg.schedule = SweepSchedule::new([16, 32], [1e-3, 1e-5, 0.0]);
        let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, cfg, None).unwrap();
        let e = dmrg.solve(&mut ctx, 16, true, 1e-9).unwrap();
        let e0 = exact(&mpo, Sector(4), 1)[0];
        assert!((e - e0).abs() < 1e-6, "{e} vs {e0}");
        let mps = ctx.arena.get(id);
        let psi = mps.to_dense(0, ctx.store()).unwrap();
        assert!((psi.norm() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn two_site_visit_order() {
        let mpo = Arc::new(Mpo::heisenberg(4, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2, MpsKind::Single);
        let mut dmrg =
            Dmrg::new(mpo, id, &mut ctx, config(2, NoiseType::NONE), None).unwrap();
        dmrg.solve(&mut ctx, 2, true, 0.0).unwrap();
        let order: Vec<Vec<usize>> =
            dmrg.sweep_iterations.iter()
            .map(|sweep| sweep.iter().map(|it| it.site).collect())
            .collect();
        assert_eq!(order, vec![vec![0, 1, 2], vec![2, 1, 0]]);
        assert_eq!(ctx.arena.get(id).forms.to_string(), "CRRR");
    }

    #[test]
    fn state_averaged_two_roots() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = random_state(&mut ctx, &mpo, Sector(0), 8, 2, MpsKind::multi(2));
        let mut cfg = config(2, NoiseType::DENSITY_MATRIX);
        cfg.schedule = SweepSchedule::new([16, 32], [1e-4, 0.0]);
        let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, cfg, None).unwrap();
        dmrg.solve(&mut ctx, 12, true, 1e-9).unwrap();
        let exact2 = exact(&mpo, Sector(0), 2);
        let last = dmrg.sweep_energies.last().unwrap();
        assert_eq!(last.len(), 2);
        assert!((last[0] - exact2[0]).abs() < 1e-6);
        assert!((last[1] - exact2[1]).abs() < 1e-6);
    }

    #[test]
    fn multi_state_needs_density_matrix_split() {
        let mpo = Arc::new(Mpo::heisenberg(4, 1.0, 1.0, 0.0));
        let mut ctx = context();
        let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2, MpsKind::multi(2));
        let cfg =
            DmrgConfig {
                decomp_type: DecompositionType::Svd,
                noise_type: NoiseType::NONE,
                ..config(2, NoiseType::NONE)
            };
        assert!(matches!(
            Dmrg::new(mpo, id, &mut ctx, cfg, None),
            Err(SweepError::UnsupportedMode(_)),
        ));
    }

    #[test]
    fn signal_aborts_before_the_first_site() {
        let mpo = Arc::new(Mpo::heisenberg(4, 1.0, 1.0, 0.0));
        let mut ctx =
            SweepContext::new(Arc::new(MemoryStore::new()), 7, 0).with_signal(|| true);
        let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2, MpsKind::Single);
        let mut dmrg =
            Dmrg::new(mpo, id, &mut ctx, config(2, NoiseType::NONE), None).unwrap();
        let e = dmrg.solve(&mut ctx, 4, true, 1e-8).unwrap();
        assert!(dmrg.aborted);
        assert!(!dmrg.converged);
        assert!(e.is_nan());
        assert!(dmrg.sweep_energies.is_empty());
    }

    #[test]
    fn iteration_display() {
        let it =
            Iteration {
                site: 3,
                forward: true,
                energies: vec![-1.5],
                error: 0.0,
                mmps: 4,
                ndav: 7,
                nflop: 0,
                tdav: Duration::ZERO,
                time: Duration::ZERO,
            };
        let line = it.to_string();
        assert!(line.starts_with("-> site    3"));
        assert!(line.contains("M = 4"));
    }
}
