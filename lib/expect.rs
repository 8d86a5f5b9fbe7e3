//! Expectation values and reduced density matrices.
//!
//! An [`Expect`] sweep visits every window of `⟨bra|H|ket⟩` and records the
//! value there; with `propagate` set, the bra and ket are re-split exactly
//! (up to their configured bond dimensions) as the window moves, otherwise
//! only the current window is evaluated.
//!
//! Observables are product operators with names. Each one is evaluated at
//! the window covering its last non-identity site, where everything to its
//! right is right-normalized and everything to its left is left-normalized:
//! ```text
//!   first        i    i+1
//!  ┌──A──A──A──[ ψ  ψ ]──┐
//!  I  │  │  │    │  │    I
//!  │  O  1  O    O  1    │
//!  └──A──A──A──[ ψ  ψ ]──┘
//! ```
//! so only the sites from the first factor to the window are contracted.
//! Density matrices are read back from the named values with
//! [`get_1pdm`][Expect::get_1pdm] and friends, which fill in the entries
//! related by [`PdmRule`].

use std::{
    fmt,
    sync::Arc,
    time::Instant,
};
use itertools::Itertools;
use nalgebra as na;
use ndarray as nd;
use rustc_hash::FxHashMap as HashMap;
use tracing::{ debug, info };
use crate::{
    comm::ParallelRule,
    config::ExpectConfig,
    context::SweepContext,
    environment::{ EnvBlock, MovingEnvironment, extend_left },
    mpo::{ Mpo, MpoSite, MpoTerm },
    mps::{ Mps, MpsError, MpsId, Wavefunction },
    ops::{ Ladder, ProductOp, number },
    quantum::Sector,
    rule::{ OpElement, OpNames, OpRule, PdmRule, SiteIndex },
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
    },
    tensor::SiteTensor,
    SweepError,
    SweepResult,
};

/// A named observable.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectTerm {
    pub name: OpElement,
    pub op: ProductOp,
}

impl ExpectTerm {
    pub fn new(name: OpElement, op: ProductOp) -> Self { Self { name, op } }
}

// spin orbitals of a chain, `(site, spin)` in ascending order
fn spin_orbitals(n_sites: usize) -> Vec<(u16, u8)> {
    (0..n_sites as u16).flat_map(|i| [(i, 0), (i, 1)]).collect()
}

/// The canonical one-particle density matrix terms `c†_p c_q`, `p ≤ q`, of
/// a spinful fermion chain.
pub fn pdm1_terms(n_sites: usize) -> Vec<ExpectTerm> {
    let orbs = spin_orbitals(n_sites);
    orbs.iter().enumerate()
        .flat_map(|(a, p)| orbs[a..].iter().map(move |q| (*p, *q)))
        .map(|(p, q)| {
            let name = OpElement::new(OpNames::PDM1, SiteIndex::new([p, q]), Sector(0));
            let op =
                ProductOp::fermionic(&[
                    Ladder::create(p.0 as usize, p.1),
                    Ladder::annihilate(q.0 as usize, q.1),
                ]);
            ExpectTerm::new(name, op)
        })
        .collect()
}

/// The canonical two-particle density matrix terms `c†_p c†_q c_r c_s`,
/// `p < q`, `r < s`, of a spinful fermion chain.
pub fn pdm2_terms(n_sites: usize) -> Vec<ExpectTerm> {
    let orbs = spin_orbitals(n_sites);
    let pairs: Vec<((u16, u8), (u16, u8))> =
        orbs.iter().tuple_combinations().map(|(p, q)| (*p, *q)).collect();
    pairs.iter().cartesian_product(pairs.iter())
        .map(|((p, q), (r, s))| {
            let name =
                OpElement::new(OpNames::PDM2, SiteIndex::new([*p, *q, *r, *s]), Sector(0));
            let op =
                ProductOp::fermionic(&[
                    Ladder::create(p.0 as usize, p.1),
                    Ladder::create(q.0 as usize, q.1),
                    Ladder::annihilate(r.0 as usize, r.1),
                    Ladder::annihilate(s.0 as usize, s.1),
                ]);
            ExpectTerm::new(name, op)
        })
        .collect()
}

/// The canonical number correlation terms `n_p n_q`, `p ≤ q`, of a spinful
/// fermion chain.
pub fn npc1_terms(n_sites: usize) -> Vec<ExpectTerm> {
    let orbs = spin_orbitals(n_sites);
    orbs.iter().enumerate()
        .flat_map(|(a, p)| orbs[a..].iter().map(move |q| (*p, *q)))
        .map(|(p, q)| {
            let name = OpElement::new(OpNames::NPC1, SiteIndex::new([p, q]), Sector(0));
            let op =
                ProductOp::local([
                    (p.0 as usize, number(p.1)),
                    (q.0 as usize, number(q.1)),
                ]);
            ExpectTerm::new(name, op)
        })
        .collect()
}

/// Boltzmann weights `w_i ∝ mult_i exp(-β (E_i - E_0))`, normalized, where
/// `E_0` is the lowest energy.
pub fn thermal_weights(energies: &[f64], mults: &[f64], beta: f64) -> Vec<f64> {
    let e0 = energies.iter().copied().fold(f64::INFINITY, f64::min);
    let raw: Vec<f64> =
        energies.iter().zip(mults)
        .map(|(e, m)| m * (-beta * (e - e0)).exp())
        .collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 { raw.into_iter().map(|w| w / total).collect() } else { raw }
}

// the single-channel operator of `op` on site `k`
fn local_site(op: &ProductOp, k: usize, phys: &[Sector]) -> MpoSite {
    let d = phys.len();
    MpoSite {
        phys: phys.to_vec(),
        left_dim: 1,
        right_dim: 1,
        terms: vec![MpoTerm {
            left: 0,
            right: 0,
            op: op.factor(k).cloned().unwrap_or_else(|| na::DMatrix::identity(d, d)),
        }],
    }
}

// ⟨ψ|op|ψ⟩ for a window wavefunction at sites `[i, i + dot)` of `mps`, with
// every factor of `op` at or left of the window
fn window_observable(
    op: &ProductOp,
    wfn: &SiteTensor,
    mps: &Mps,
    i: usize,
    dot: usize,
    store: &dyn TensorStore,
) -> SweepResult<f64>
{
    let basis = &mps.info.basis;
    let start = op.support().map_or(i, |(first, _)| first.min(i));
    let left_dim =
        if start < i { mps.site_tensor(start, store)?.dims().0 } else { wfn.dims().0 };
    let mut block = EnvBlock { mats: vec![na::DMatrix::identity(left_dim, left_dim)] };
    for k in start..i {
        let a = mps.site_tensor(k, store)?;
        block = extend_left(&block, &local_site(op, k, &basis[k]), &a, &a, None)?;
    }
    let window =
        (i + 1..i + dot)
        .fold(local_site(op, i, &basis[i]), |acc, k| acc.fuse(&local_site(op, k, &basis[k])));
    block = extend_left(&block, &window, wfn, wfn, None)?;
    Ok(block.mats[0].trace())
}

/// Statistics of one window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExpectIteration {
    /// First site of the window.
    pub site: usize,
    pub forward: bool,
    /// `⟨bra|H|ket⟩`, weighted over the states of the ket.
    pub value: f64,
    /// Discarded weights of the bra and the ket when propagating.
    pub bra_error: f64,
    pub ket_error: f64,
}

impl fmt::Display for ExpectIteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} site {:>4} | value = {:.12} | bra error = {:.3e} | ket error = {:.3e}",
            if self.forward { "->" } else { "<-" },
            self.site,
            self.value,
            self.bra_error,
            self.ket_error,
        )
    }
}

/// Sweep driver for expectation values.
#[derive(Debug)]
pub struct Expect {
    pub bra: MpsId,
    pub ket: MpsId,
    pub env: MovingEnvironment,
    pub config: ExpectConfig,
    terms: Vec<ExpectTerm>,
    /// Observable values of the last call to [`solve`][Self::solve].
    pub expectations: Vec<(OpElement, f64)>,
    /// Every window of the last call to [`solve`][Self::solve].
    pub iterations: Vec<ExpectIteration>,
    /// Weights of the states of a multi-state ket.
    pub partition_weights: Vec<f64>,
    /// Direction of the next sweep.
    pub forward: bool,
    pub aborted: bool,
}

impl Expect {
    /// Set up a driver for `⟨bra|mpo|ket⟩` over MPSs of `ctx.arena`.
    ///
    /// The window width is taken from the ket. Distinct bra and ket must
    /// have their centers on the same site, and only a bra equal to the ket
    /// may hold several states.
    pub fn new(
        mpo: Arc<Mpo>,
        bra: MpsId,
        ket: MpsId,
        ctx: &mut SweepContext,
        config: ExpectConfig,
        rule: Option<ParallelRule>,
    ) -> SweepResult<Self>
    {
        let n = mpo.n_sites();
        let (dot, center, weights) = {
            let k = ctx.arena.get(ket);
            (k.dot.clamp(1, 2), k.center, k.kind.weights())
        };
        if n < dot {
            return Err(SweepError::UnsupportedMode(
                format!("{dot}-site windows on {n} sites")));
        }
        let center = center.min(n - dot);
        for id in [bra, ket] {
            let mps = ctx.arena.get_mut(id);
            if mps.n_sites() != n { return Err(MpsError::SiteCount(mps.n_sites(), n).into()); }
            if bra != ket && mps.is_multi() {
                return Err(SweepError::UnsupportedMode(
                    "multi-state MPSs only as both bra and ket".into()));
            }
            if mps.center.min(n - dot) != center {
                return Err(SweepError::UnsupportedMode(
                    format!("centers at sites {} and {center}", mps.center)));
            }
            mps.dot = dot;
            mps.center = center;
        }
        let mut env = MovingEnvironment::new(mpo, bra, ket, center, dot, rule)?;
        let t = Instant::now();
        env.prepare(&ctx.arena, ctx.store())?;
        ctx.timers.env += t.elapsed();
        Ok(Self {
            bra,
            ket,
            env,
            config,
            terms: Vec::new(),
            expectations: Vec::new(),
            iterations: Vec::new(),
            partition_weights: weights,
            forward: center == 0,
            aborted: false,
        })
    }

    /// Also evaluate `terms`. Only for `⟨ψ|·|ψ⟩`.
    pub fn with_terms(mut self, terms: Vec<ExpectTerm>, ctx: &SweepContext)
        -> SweepResult<Self>
    {
        if self.bra != self.ket {
            return Err(SweepError::UnsupportedMode(
                "observables need the same bra and ket".into()));
        }
        let mps = ctx.arena.get(self.ket);
        for term in terms.iter() {
            for (k, f) in term.op.factors().iter() {
                let d = mps.info.basis.get(*k).map(|b| b.len());
                if d != Some(f.nrows()) || f.nrows() != f.ncols() {
                    return Err(SweepError::SectorMismatch(
                        format!("factor of {} does not fit site {k}", term.name)));
                }
            }
        }
        self.terms.extend(terms);
        Ok(self)
    }

    /// Weight the states of a multi-state ket thermally, with one energy and
    /// multiplicity per state.
    pub fn with_thermal(mut self, beta: f64, energies: &[f64], mults: &[f64])
        -> SweepResult<Self>
    {
        let nroots = self.partition_weights.len();
        if energies.len() != nroots || mults.len() != nroots {
            return Err(SweepError::UnsupportedMode(
                format!("{} energies for {nroots} states", energies.len())));
        }
        self.partition_weights = thermal_weights(energies, mults, beta);
        Ok(self)
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
        if self.env.dot == 1 {
            one_dot_window(ctx.arena.get_mut(id), i, fuse_left, store)
        } else {
            two_dot_window(ctx.arena.get(id), i, store)
        }
    }

    // window evaluating an observable: the one covering its last site
    fn term_window(&self, term: &ExpectTerm) -> usize {
        let n = self.env.n_sites();
        let dot = self.env.dot;
        let last = term.op.support().map_or(0, |(_, last)| last);
        last.saturating_sub(dot - 1).min(n - dot)
    }

    /// Evaluate the expectation values.
    ///
    /// With `propagate` set in the settings, sweeps once across the chain in
    /// the current direction and flips it; otherwise only the window at the
    /// center is evaluated, along with the observables belonging to it.
    /// Returns `⟨bra|H|ket⟩` at the last window.
    pub fn solve(&mut self, ctx: &mut SweepContext) -> SweepResult<f64> {
        self.expectations.clear();
        self.iterations.clear();
        self.aborted = false;
        let t = Instant::now();
        if !self.config.propagate {
            let i = self.env.center;
            let it = self.update(ctx, i, self.forward, false)?;
            self.iterations.push(it);
            return Ok(it.value);
        }
        let forward = self.forward;
        if self.config.iprint >= 1 {
            info!(
                "expectation {} | bra M = {} | ket M = {} | weights = [{}]",
                if forward { "->" } else { "<-" },
                self.config.bra_bond_dim,
                self.config.ket_bond_dim,
                self.partition_weights.iter().map(|w| format!("{w:.5}")).join(", "),
            );
        }
        let n = self.env.n_sites();
        let dot = self.env.dot;
        let center = self.env.center;
        let sites: Vec<usize> =
            if forward { (center..=n - dot).collect() } else { (0..=center).rev().collect() };
        let comm = self.env.rule().map(|r| r.comm.clone());
        for i in sites.into_iter() {
            if ctx.should_abort(comm.as_deref())? {
                self.aborted = true;
                break;
            }
            let it = self.update(ctx, i, forward, true)?;
            if self.config.iprint >= 2 { debug!("{}", it); }
            self.iterations.push(it);
        }
        if !self.aborted { self.forward = !forward; }
        if self.config.iprint >= 1 {
            info!(
                "expectation done: {} observables | time = {:.3} s",
                self.expectations.len(),
                t.elapsed().as_secs_f64(),
            );
        }
        Ok(self.iterations.last().map_or(f64::NAN, |it| it.value))
    }

    fn update(
        &mut self,
        ctx: &mut SweepContext,
        i: usize,
        forward: bool,
        propagate: bool,
    ) -> SweepResult<ExpectIteration>
    {
        let store = Arc::clone(&ctx.store);
        let store = store.as_ref();
        let n = self.env.n_sites();
        let dot = self.env.dot;
        let fuse_left = i <= (n - 1) / 2;
        let t = Instant::now();
        let ket = self.window(ctx, self.ket, i, fuse_left, store)?;
        let bra =
            if self.bra == self.ket {
                None
            } else {
                Some(self.window(ctx, self.bra, i, fuse_left, store)?)
            };
        self.env.move_to(i, &ctx.arena, store)?;
        ctx.timers.env += t.elapsed();

        let t = Instant::now();
        let bra_w = bra.as_ref().unwrap_or(&ket);
        let weights: Vec<f64> =
            if ket.is_multi() { self.partition_weights.clone() } else { vec![1.0] };
        let h = self.env.eff_ham(ket.fuse_side(), forward, false, bra_w.primary(), ket.primary())?;
        let mut value = 0.0;
        for ((b, k), w) in bra_w.roots.iter().zip(ket.roots.iter()).zip(weights.iter()) {
            value += w * h.expect(b, k)?;
        }
        let mps = ctx.arena.get(self.ket);
        let mut found: Vec<(OpElement, f64)> = Vec::new();
        for term in self.terms.iter().filter(|term| self.term_window(term) == i) {
            let mut v = 0.0;
            for (root, w) in ket.roots.iter().zip(weights.iter()) {
                v += w * window_observable(&term.op, root, mps, i, dot, store)?;
            }
            found.push((term.name.clone(), v));
        }
        self.expectations.extend(found);
        ctx.timers.solve += t.elapsed();

        let mut errors = [0.0, 0.0];
        if propagate {
            let t = Instant::now();
            let step = Step { site: i, forward, bond_dim: 0, noise: 0.0, conv: 0.0 };
            let keep = dot == 1 && step.at_end(n);
            let states =
                std::iter::once((1, self.ket, ket, self.config.ket_bond_dim))
                .chain(bra.map(|b| (0, self.bra, b, self.config.bra_bond_dim)));
            for (slot, id, wfn, bond_dim) in states {
                let truncate: TruncateFn =
                    if wfn.is_multi() { truncate_multi } else { truncate_single };
                let trunc =
                    Truncation {
                        rule: self.env.rule(),
                        ..Truncation::follower(forward, bond_dim, self.config.trunc_type)
                    };
                let (error, _) =
                    split_and_advance(
                        ctx.arena.get_mut(id), wfn, Step { bond_dim, ..step }, (0, n), keep,
                        &trunc, truncate, &mut ctx.rng, store,
                    )?;
                errors[slot] = error;
            }
            if self.bra == self.ket { errors[0] = errors[1]; }
            if let Some(rule) = self.env.rule() { rule.comm.broadcast(&mut errors)?; }
            ctx.timers.decomp += t.elapsed();
        }
        Ok(ExpectIteration { site: i, forward, value, bra_error: errors[0], ket_error: errors[1] })
    }

    // the named values, keyed for lookup
    fn values(&self, name: OpNames) -> HashMap<SiteIndex, f64> {
        self.expectations.iter()
            .filter(|(op, _)| op.name == name)
            .map(|(op, v)| (op.site_index.clone(), *v))
            .collect()
    }

    // the value of `op`, through its canonical equivalent
    fn lookup(values: &HashMap<SiteIndex, f64>, op: &OpElement) -> f64 {
        let r = PdmRule.canonical(op);
        values.get(&r.op.site_index).map_or(0.0, |v| r.factor * v)
    }

    /// One-particle density matrix `⟨c†_p c_q⟩` over spin orbitals
    /// `p = 2 i + σ`.
    pub fn get_1pdm(&self, n_sites: usize) -> nd::Array2<f64> {
        let values = self.values(OpNames::PDM1);
        let orbs = spin_orbitals(n_sites);
        nd::Array2::from_shape_fn((orbs.len(), orbs.len()), |(a, b)| {
            let op =
                OpElement::new(
                    OpNames::PDM1, SiteIndex::new([orbs[a], orbs[b]]), Sector(0));
            Self::lookup(&values, &op)
        })
    }

    /// Spin-summed one-particle density matrix `Σ_σ ⟨c†_iσ c_jσ⟩`.
    pub fn get_1pdm_spatial(&self, n_sites: usize) -> nd::Array2<f64> {
        let full = self.get_1pdm(n_sites);
        nd::Array2::from_shape_fn((n_sites, n_sites), |(i, j)| {
            full[[2 * i, 2 * j]] + full[[2 * i + 1, 2 * j + 1]]
        })
    }

    /// Two-particle density matrix `⟨c†_p c†_q c_r c_s⟩` over spin
    /// orbitals.
    pub fn get_2pdm(&self, n_sites: usize) -> nd::Array4<f64> {
        let values = self.values(OpNames::PDM2);
        let orbs = spin_orbitals(n_sites);
        let m = orbs.len();
        nd::Array4::from_shape_fn((m, m, m, m), |(p, q, r, s)| {
            if p == q || r == s { return 0.0; }
            let op =
                OpElement::new(
                    OpNames::PDM2,
                    SiteIndex::new([orbs[p], orbs[q], orbs[r], orbs[s]]),
                    Sector(0),
                );
            Self::lookup(&values, &op)
        })
    }

    /// Spin-summed two-particle density matrix
    /// `Σ_στ ⟨c†_iσ c†_jτ c_kτ c_lσ⟩`.
    pub fn get_2pdm_spatial(&self, n_sites: usize) -> nd::Array4<f64> {
        let full = self.get_2pdm(n_sites);
        let n = n_sites;
        nd::Array4::from_shape_fn((n, n, n, n), |(i, j, k, l)| {
            (0..2).cartesian_product(0..2)
                .map(|(s, t)| full[[2 * i + s, 2 * j + t, 2 * k + t, 2 * l + s]])
                .sum()
        })
    }

    /// Number correlations `⟨n_p n_q⟩` over spin orbitals.
    pub fn get_1npc(&self, n_sites: usize) -> nd::Array2<f64> {
        let values = self.values(OpNames::NPC1);
        let orbs = spin_orbitals(n_sites);
        nd::Array2::from_shape_fn((orbs.len(), orbs.len()), |(a, b)| {
            let op =
                OpElement::new(
                    OpNames::NPC1, SiteIndex::new([orbs[a], orbs[b]]), Sector(0));
            Self::lookup(&values, &op)
        })
    }

    /// Spin-summed number correlations `Σ_στ ⟨n_iσ n_jτ⟩`.
    pub fn get_1npc_spatial(&self, n_sites: usize) -> nd::Array2<f64> {
        let full = self.get_1npc(n_sites);
        nd::Array2::from_shape_fn((n_sites, n_sites), |(i, j)| {
            (0..2).cartesian_product(0..2)
                .map(|(s, t)| full[[2 * i + s, 2 * j + t]])
                .sum()
        })
    }
}
