//! Pieces shared by the sweep drivers.
//!
//! Every driver step has the same shape around its local solve:
//! ```text
//!  window wavefunction ──> solve ──> split matrix ──> truncate ──> write back
//!   (one_dot_window,                  (SplitShape)     (Truncation)  (write_one_dot,
//!    two_dot_window)                                                   write_two_dot)
//! ```
//! The helpers here cover everything but the solve.

use nalgebra as na;
use rand::Rng;
use crate::{
    comm::ParallelRule,
    decompose::{
        DecompositionType,
        DensityMatrix,
        MultiSplit,
        NoiseKind,
        NoiseType,
        Split,
        SplitMatrix,
        SplitShape,
        TruncationType,
        add_perturbative_noise,
        density_matrix,
        multi_split_density_matrix,
        split_density_matrix,
        split_wavefunction_svd,
        wavefunction_noise,
    },
    mps::{ Mps, Wavefunction },
    quantum::Sector,
    store::TensorStore,
    tensor::{ FuseSide, SiteTensor },
    SweepResult,
};

/// One step of a sweep.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Step {
    pub site: usize,
    pub forward: bool,
    pub bond_dim: usize,
    pub noise: f64,
    pub conv: f64,
}

impl Step {
    /// Return `true` if a one-site step sits on the chain end it is moving
    /// toward.
    pub fn at_end(&self, n_sites: usize) -> bool {
        (self.forward && self.site + 1 == n_sites) || (!self.forward && self.site == 0)
    }

    /// First site of the window after this step, staying inside the segment
    /// `[a, b)`.
    pub fn next_center(&self, (a, b): (usize, usize), dot: usize) -> usize {
        if self.forward {
            (self.site + 1).min(b - dot)
        } else {
            self.site.saturating_sub(1).max(a)
        }
    }
}

/// The factors of a split: the normalized side, and one wavefunction factor
/// per state.
///
/// For a forward split `normalized` is `rows × K` and the wavefunction
/// factors are `K × cols`; the other way around for a backward split.
#[derive(Clone, Debug)]
pub(crate) struct Factors {
    pub normalized: na::DMatrix<f64>,
    pub wfns: Vec<na::DMatrix<f64>>,
    pub bond: Vec<Sector>,
    pub error: f64,
}

impl Factors {
    fn from_split(split: Split, forward: bool) -> Self {
        let Split { left, right, bond, error } = split;
        if forward {
            Self { normalized: left, wfns: vec![right], bond, error }
        } else {
            Self { normalized: right, wfns: vec![left], bond, error }
        }
    }

    fn from_multi(split: MultiSplit) -> Self {
        let MultiSplit { normalized, wavefunctions, bond, error } = split;
        Self { normalized, wfns: wavefunctions, bond, error }
    }
}

/// Settings of one truncation.
#[derive(Clone, Debug)]
pub(crate) struct Truncation<'a> {
    pub forward: bool,
    pub bond_dim: usize,
    pub cutoff: f64,
    pub trunc_type: TruncationType,
    pub decomp_type: DecompositionType,
    pub noise_type: NoiseType,
    pub noise: f64,
    pub normalize: bool,
    /// Weight of the split states in the density matrix. The SVD keeps them
    /// at unit weight.
    pub weight: f64,
    /// Weighted states mixed into the density matrix (or the SVD).
    pub extra: &'a [(f64, SplitMatrix)],
    /// Perturbative-noise terms, owned by this process when collected.
    pub perturbations: &'a [SplitMatrix],
    pub rule: Option<&'a ParallelRule>,
}

impl<'a> Truncation<'a> {
    /// An exact re-split of a state that only follows the others around:
    /// no noise, no cutoff, no renormalization.
    pub fn follower(forward: bool, bond_dim: usize, trunc_type: TruncationType) -> Self {
        Self {
            forward,
            bond_dim,
            cutoff: 0.0,
            trunc_type,
            decomp_type: DecompositionType::Svd,
            noise_type: NoiseType::NONE,
            noise: 0.0,
            normalize: false,
            weight: 1.0,
            extra: &[],
            perturbations: &[],
            rule: None,
        }
    }

    fn is_root(&self) -> bool { self.rule.map_or(true, |r| r.is_root()) }

    fn collecting(&self) -> bool {
        self.noise_type.collected
            && self.rule.is_some()
            && self.noise_type.is_active(self.noise)
    }
}

/// Truncation of a group of states sharing their normalized factor.
pub(crate) type TruncateFn =
    fn(&[SplitMatrix], &[f64], &Truncation<'_>, &mut dyn rand::RngCore)
        -> SweepResult<Option<Factors>>;

// ρ = weight·ψψᵀ + extra + noise; with collected noise, every process builds
// its share and the root receives the sum
fn noisy_density_matrix<R>(
    x: &SplitMatrix,
    weight: f64,
    t: &Truncation<'_>,
    rng: &mut R,
) -> SweepResult<DensityMatrix>
where R: Rng + ?Sized
{
    let kind = t.noise_type.kind;
    let collect = t.collecting();
    let comm = t.rule.map(|r| r.comm.as_ref());
    let (share, weight, extra) =
        match comm {
            Some(comm) if collect => {
                if t.is_root() {
                    (t.noise / comm.size() as f64, weight, t.extra)
                } else {
                    (t.noise / comm.size() as f64, 0.0, &[][..])
                }
            },
            _ => (t.noise, weight, t.extra),
        };
    let dm_kind = if kind == NoiseKind::Perturbative { NoiseKind::None } else { kind };
    let mut dm =
        density_matrix(Sector::VACUUM, x, t.forward, share, dm_kind, weight, extra, rng)?;
    if kind == NoiseKind::Perturbative && t.noise > 0.0 {
        let mut norm2 = [t.perturbations.iter().map(|p| p.mat.norm_squared()).sum::<f64>()];
        if let Some(comm) = comm.filter(|_| collect) { comm.allreduce_sum(&mut norm2)?; }
        add_perturbative_noise(&mut dm, t.noise, t.perturbations, Some(norm2[0]))?;
    }
    if let Some(comm) = comm.filter(|_| collect) { dm.reduce_sum(comm)?; }
    Ok(dm)
}

/// Truncate a single state. Returns `None` on every process but the root.
pub(crate) fn truncate_single(
    xs: &[SplitMatrix],
    _weights: &[f64],
    t: &Truncation<'_>,
    rng: &mut dyn rand::RngCore,
) -> SweepResult<Option<Factors>>
{
    let x = &xs[0];
    if !t.is_root() && !t.collecting() { return Ok(None); }
    let split =
        match t.decomp_type {
            DecompositionType::DensityMatrix => {
                let dm = noisy_density_matrix(x, t.weight, t, rng)?;
                if !t.is_root() { return Ok(None); }
                split_density_matrix(
                    &dm, x, t.bond_dim, t.forward, t.normalize, t.cutoff, t.trunc_type)?
            },
            DecompositionType::Svd | DecompositionType::PureSvd => {
                if !t.is_root() { return Ok(None); }
                let mut extra = t.extra.to_vec();
                if t.noise_type.is_active(t.noise) {
                    match t.noise_type.kind {
                        NoiseKind::Wavefunction => {
                            extra.push((1.0, wavefunction_noise(x, t.noise, rng)));
                        },
                        NoiseKind::Perturbative => {
                            let norm2: f64 =
                                t.perturbations.iter().map(|p| p.mat.norm_squared()).sum();
                            if norm2 > 0.0 {
                                extra.extend(
                                    t.perturbations.iter()
                                    .map(|p| (t.noise / norm2, p.clone())));
                            }
                        },
                        NoiseKind::None | NoiseKind::DensityMatrix => { },
                    }
                }
                split_wavefunction_svd(
                    x, &extra, t.bond_dim, t.forward, t.normalize, t.cutoff,
                    t.trunc_type, t.decomp_type,
                )?
            },
        };
    Ok(Some(Factors::from_split(split, t.forward)))
}

/// Truncate a group of states with their weighted density matrix. Returns
/// `None` on every process but the root.
pub(crate) fn truncate_multi(
    xs: &[SplitMatrix],
    weights: &[f64],
    t: &Truncation<'_>,
    rng: &mut dyn rand::RngCore,
) -> SweepResult<Option<Factors>>
{
    if !t.is_root() && !t.collecting() { return Ok(None); }
    let noise_dm = noisy_density_matrix(&xs[0], 0.0, t, rng)?;
    if !t.is_root() { return Ok(None); }
    let weights: Vec<f64> = weights.iter().map(|w| w * t.weight).collect();
    let split =
        multi_split_density_matrix(
            Some(&noise_dm), xs, &weights, t.bond_dim, t.forward, t.normalize,
            t.cutoff, t.trunc_type,
        )?;
    Ok(Some(Factors::from_multi(split)))
}

/// Load the wavefunction of a one-site window at `i`, fused on the side
/// given by `fuse_left`, and update the tag accordingly.
pub(crate) fn one_dot_window(
    mps: &mut Mps,
    i: usize,
    fuse_left: bool,
    store: &dyn TensorStore,
) -> SweepResult<Wavefunction>
{
    let multi = mps.is_multi();
    let side = mps.forms.prepare_one_dot(i, multi)?;
    let want = if fuse_left { FuseSide::Left } else { FuseSide::Right };
    let mut wfn = mps.load_wavefunction(i, store)?;
    wfn.make_fused(want);
    if side != want { mps.forms.swap_fused(i, want)?; }
    Ok(wfn)
}

/// Load the wavefunction of the two-site window `(i, i + 1)`, contracting
/// the center with its normalized partner.
pub(crate) fn two_dot_window(
    mps: &Mps,
    i: usize,
    store: &dyn TensorStore,
) -> SweepResult<Wavefunction>
{
    let offset = mps.forms.prepare_two_dot(i, mps.is_multi())?;
    let group = mps.load_wavefunction(i + offset, store)?;
    let other = mps.site_tensor(i + 1 - offset, store)?;
    let roots =
        group.roots.iter()
        .map(|t| {
            if offset == 0 {
                SiteTensor::contract_pair(t, &other)
            } else {
                SiteTensor::contract_pair(&other, t)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Wavefunction { roots, weights: group.weights })
}

/// Split shape of a window wavefunction.
pub(crate) fn window_shape(
    mps: &Mps,
    wfn: &Wavefunction,
    i: usize,
    dot: usize,
    forward: bool,
) -> SweepResult<SplitShape>
{
    let t = wfn.primary();
    if dot == 1 {
        Ok(SplitShape::one_site(t, forward))
    } else {
        let basis = &mps.info.basis;
        Ok(SplitShape::two_site(t, &basis[i], &basis[i + 1])?)
    }
}

/// Split matrices of every state of a window wavefunction.
pub(crate) fn split_matrices(shape: &SplitShape, wfn: &Wavefunction)
    -> SweepResult<Vec<SplitMatrix>>
{
    Ok(wfn.roots.iter().map(|t| shape.matrix(t)).collect::<Result<Vec<_>, _>>()?)
}

// write a group (or a single state) of center tensors at site i
fn write_center(
    mps: &mut Mps,
    i: usize,
    roots: Vec<SiteTensor>,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    let weights = mps.kind.weights();
    mps.save_wavefunction(i, &Wavefunction { roots, weights }, store)?;
    Ok(())
}

// write a normalized tensor at site i, dropping a stale group there
fn write_normalized(
    mps: &mut Mps,
    i: usize,
    t: SiteTensor,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    if mps.is_multi() && mps.forms.get(i).is_multi() {
        mps.remove_wavefunction(i, store)?;
    }
    mps.put_tensor(i, t, store)?;
    Ok(())
}

/// Write the factors of a one-site split at site `i` back into `mps`: the
/// normalized factor stays at `i` and the wavefunction moves to the
/// neighbor, except at the chain ends, where both are contracted back into a
/// fused wavefunction at `i`. Bond dimensions are updated; tags are not.
pub(crate) fn write_one_dot(
    mps: &mut Mps,
    i: usize,
    forward: bool,
    shape: &SplitShape,
    factors: Factors,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    let n = mps.n_sites();
    let Factors { normalized, wfns, bond, .. } = factors;
    if forward {
        let l = shape.left_tensor(bond.clone(), normalized)?;
        if i + 1 < n {
            let next = mps.site_tensor(i + 1, store)?.into_owned();
            let roots =
                wfns.iter()
                .map(|w| next.clone().absorb_left(w, bond.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            mps.info.set_bond_dim(i + 1, bond.len());
            write_normalized(mps, i, l, store)?;
            write_center(mps, i + 1, roots, store)
        } else {
            let roots =
                wfns.iter()
                .map(|w| l.clone().absorb_right(w, shape.right.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            write_center(mps, i, roots, store)
        }
    } else {
        let r = shape.right_tensor(bond.clone(), normalized)?;
        if i > 0 {
            let prev = mps.site_tensor(i - 1, store)?.into_owned();
            let roots =
                wfns.iter()
                .map(|w| prev.clone().absorb_right(w, bond.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            mps.info.set_bond_dim(i, bond.len());
            write_normalized(mps, i, r, store)?;
            write_center(mps, i - 1, roots, store)
        } else {
            let roots =
                wfns.iter()
                .map(|w| r.clone().absorb_left(w, shape.left.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            write_center(mps, i, roots, store)
        }
    }
}

/// Write the factors of a two-site split of `(i, i + 1)` back into `mps`:
/// `(L, C)` for a forward split, `(C, R)` for a backward one. Bond dimensions
/// are updated; tags are not.
pub(crate) fn write_two_dot(
    mps: &mut Mps,
    i: usize,
    forward: bool,
    shape: &SplitShape,
    factors: Factors,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    let Factors { normalized, wfns, bond, .. } = factors;
    mps.info.set_bond_dim(i + 1, bond.len());
    if forward {
        let l = shape.left_tensor(bond.clone(), normalized)?;
        let roots =
            wfns.into_iter()
            .map(|w| shape.right_tensor(bond.clone(), w))
            .collect::<Result<Vec<_>, _>>()?;
        write_normalized(mps, i, l, store)?;
        write_center(mps, i + 1, roots, store)
    } else {
        let r = shape.right_tensor(bond.clone(), normalized)?;
        let roots =
            wfns.into_iter()
            .map(|w| shape.left_tensor(bond.clone(), w))
            .collect::<Result<Vec<_>, _>>()?;
        write_normalized(mps, i + 1, r, store)?;
        write_center(mps, i, roots, store)
    }
}

/// Keep a one-site wavefunction at a chain end without splitting it,
/// re-fused toward the sweep direction.
pub(crate) fn keep_one_dot(
    mps: &mut Mps,
    i: usize,
    forward: bool,
    mut wfn: Wavefunction,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    wfn.make_fused(if forward { FuseSide::Left } else { FuseSide::Right });
    mps.save_wavefunction(i, &wfn, store)?;
    Ok(())
}

/// Split the window wavefunction `wfn` of `mps` at `step`, write the factors
/// back, and advance the tags and the center within `segment`.
///
/// One-site windows at a chain end are kept whole when `keep` is set.
/// Returns the discarded weight (zero on non-root processes) and the
/// dimension of the bond that was cut.
#[allow(clippy::too_many_arguments)]
pub(crate) fn split_and_advance(
    mps: &mut Mps,
    wfn: Wavefunction,
    step: Step,
    segment: (usize, usize),
    keep: bool,
    trunc: &Truncation<'_>,
    truncate: TruncateFn,
    rng: &mut dyn rand::RngCore,
    store: &dyn TensorStore,
) -> SweepResult<(f64, usize)>
{
    let Step { site: i, forward, .. } = step;
    let n = mps.n_sites();
    let dot = mps.dot;
    let multi = mps.is_multi();
    let mut error = 0.0;
    let (touched, bond): (Vec<usize>, Option<usize>) =
        if dot == 1 && keep {
            if trunc.is_root() { keep_one_dot(mps, i, forward, wfn, store)?; }
            (vec![i], None)
        } else {
            let shape = window_shape(mps, &wfn, i, dot, forward)?;
            let xs = split_matrices(&shape, &wfn)?;
            if let Some(factors) = truncate(&xs, &wfn.weights, trunc, rng)? {
                error = factors.error;
                if dot == 1 {
                    write_one_dot(mps, i, forward, &shape, factors, store)?;
                } else {
                    write_two_dot(mps, i, forward, &shape, factors, store)?;
                }
            }
            match (dot, step.at_end(n), forward) {
                (2, _, _) => (vec![i, i + 1], Some(i + 1)),
                (_, true, _) => (vec![i], None),
                (_, false, true) => (vec![i, i + 1], Some(i + 1)),
                (_, false, false) => (vec![i - 1, i], Some(i)),
            }
        };
    mps.forms.advance(i, forward, dot, multi)?;
    mps.center = step.next_center(segment, dot);
    sync_after_write(trunc.rule, mps, &touched, bond, store)?;
    Ok((error, bond.map_or(0, |b| mps.info.bond_dims[b])))
}

/// Bring the processes of a parallel rule back in step after the root has
/// written a step's tensors: everybody waits at a barrier, then non-roots
/// drop the touched tensors from memory and re-read the bond dimension of
/// bond `bond`. Tags must already be advanced.
pub(crate) fn sync_after_write(
    rule: Option<&ParallelRule>,
    mps: &mut Mps,
    touched: &[usize],
    bond: Option<usize>,
    store: &dyn TensorStore,
) -> SweepResult<()>
{
    let Some(rule) = rule else { return Ok(()); };
    rule.comm.barrier()?;
    if rule.is_root() { return Ok(()); }
    for k in touched.iter() { mps.unload_tensor(*k); }
    if let Some(b) = bond.filter(|b| *b > 0) {
        let site = b - 1;
        let dims =
            if mps.is_multi() && mps.forms.get(site).is_multi() {
                mps.load_wavefunction(site, store)?.primary().dims()
            } else {
                mps.site_tensor(site, store)?.dims()
            };
        mps.info.set_bond_dim(b, dims.2);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::tensor::fuse_phys;
    use super::*;

    fn spin() -> Vec<Sector> { vec![Sector(1), Sector(-1)] }

    // two unnormalized two-site states of equal shape
    fn states(rng: &mut StdRng) -> (SplitMatrix, SplitMatrix) {
        let left = vec![Sector(1), Sector(-1), Sector(3)];
        let right = vec![Sector(0), Sector(2), Sector(-2)];
        let phys = fuse_phys(&spin(), &spin());
        let mut x = SiteTensor::random(left.clone(), phys.clone(), right.clone(), rng);
        x.scale(0.5);
        let mut b = SiteTensor::random(left, phys, right, rng);
        b.scale(3.0);
        let shape = SplitShape::two_site(&x, &spin(), &spin()).unwrap();
        (shape.matrix(&x).unwrap(), shape.matrix(&b).unwrap())
    }

    #[test]
    fn right_weight_mixes_convexly() {
        let mut rng = StdRng::seed_from_u64(5);
        let (x, b) = states(&mut rng);
        let (nx, nb) = (x.mat.norm_squared(), b.mat.norm_squared());
        assert!((nx - nb).abs() > 1.0);
        for rw in [0.0, 0.25, 1.0] {
            let extra = [(rw, b.clone())];
            for forward in [true, false] {
                let t =
                    Truncation {
                        decomp_type: DecompositionType::DensityMatrix,
                        weight: 1.0 - rw,
                        extra: &extra,
                        ..Truncation::follower(forward, usize::MAX, TruncationType::Physical)
                    };
                let dm = noisy_density_matrix(&x, t.weight, &t, &mut rng).unwrap();
                let expected = (1.0 - rw) * nx + rw * nb;
                assert!((dm.trace() - expected).abs() < 1e-10, "{} vs {expected}", dm.trace());
            }
        }
    }
}
