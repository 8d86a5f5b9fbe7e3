//! Matrix-product states held in a [`TensorStore`], and the arena that owns
//! them during a sweep.
//!
//! An [`Mps`] keeps its mutable bookkeeping (sector labels, bond dimensions,
//! canonical-form tags, center position) in memory and pages its site tensors
//! in and out of a store:
//! ```text
//!  "{tag}.info"     JSON: MpsInfo, center, dot, tags, kind
//!  "{tag}.{i}"      bincode: SiteTensor of site i
//!  "{tag}.{i}.{k}"  bincode: root k of a multi-state center at site i
//! ```
//! A multi-state MPS shares all of its site tensors between its states except
//! the center, which holds one tensor per state.

use std::borrow::Cow;
use nalgebra as na;
use rand::Rng;
use rustc_hash::FxHashMap as HashMap;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    canonical::{ CanonicalError, CanonicalForm, CanonicalForms },
    decompose::{
        DecomposeError,
        DecompositionType,
        SplitShape,
        TruncationType,
        split_wavefunction_svd,
    },
    quantum::Sector,
    store::{ self, StoreError, TensorStore },
    tensor::{ FuseSide, SiteTensor, TensorError },
};

#[derive(Debug, Error)]
pub enum MpsError {
    /// Returned when no sector connects the vacuum to the target at some bond.
    #[error("error in Mps::random: no sector connects the vacuum to target {target} at bond {bond}")]
    EmptySector { bond: usize, target: Sector },

    /// Returned when an operation needs a single- or multi-state MPS and
    /// gets the other kind.
    #[error("error in Mps: operation requires a {0} MPS")]
    StateKind(&'static str),

    /// Returned when inputs disagree on the number of sites.
    #[error("error in Mps: got {0} sites, expected {1}")]
    SiteCount(usize, usize),

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),

    #[error("canonical form error: {0}")]
    CanonicalError(#[from] CanonicalError),

    #[error("decomposition error: {0}")]
    DecomposeError(#[from] DecomposeError),
}
use MpsError::*;
pub type MpsResult<T> = Result<T, MpsError>;

// singular values below this are dropped by exact canonicalization
const CANONICAL_CUTOFF: f64 = 1e-24;

/// Size and sector information of an MPS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MpsInfo {
    pub n_sites: usize,
    /// Physical labels of every site.
    pub basis: Vec<Vec<Sector>>,
    /// Label of the whole state.
    pub target: Sector,
    /// Largest bond dimension seen so far.
    pub bond_dim: usize,
    /// Current dimension of every bond, `0..=n_sites`.
    pub bond_dims: Vec<usize>,
}

impl MpsInfo {
    /// Record the dimension of bond `k`.
    pub fn set_bond_dim(&mut self, k: usize, dim: usize) {
        self.bond_dims[k] = dim;
        self.bond_dim = self.bond_dim.max(dim);
    }
}

/// Single- or multi-state MPS.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MpsKind {
    Single,
    /// `nroots` states sharing all tensors but the center, with the weights
    /// used to average their density matrices.
    MultiState { nroots: usize, weights: Vec<f64> },
}

impl MpsKind {
    /// Equal weights over `nroots` states.
    pub fn multi(nroots: usize) -> Self {
        Self::MultiState { nroots, weights: vec![1.0 / nroots as f64; nroots] }
    }

    /// Return `true` for multi-state MPSs.
    pub fn is_multi(&self) -> bool { matches!(self, Self::MultiState { .. }) }

    /// Number of states.
    pub fn nroots(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::MultiState { nroots, .. } => *nroots,
        }
    }

    /// Density-matrix weights of the states.
    pub fn weights(&self) -> Vec<f64> {
        match self {
            Self::Single => vec![1.0],
            Self::MultiState { weights, .. } => weights.clone(),
        }
    }
}

/// The wavefunction of the active site(s): one tensor per state.
#[derive(Clone, Debug, PartialEq)]
pub struct Wavefunction {
    pub roots: Vec<SiteTensor>,
    pub weights: Vec<f64>,
}

impl Wavefunction {
    /// A single-state wavefunction.
    pub fn single(t: SiteTensor) -> Self {
        Self { roots: vec![t], weights: vec![1.0] }
    }

    /// Return `true` if there is more than one state.
    pub fn is_multi(&self) -> bool { self.roots.len() > 1 }

    /// The first state.
    pub fn primary(&self) -> &SiteTensor { &self.roots[0] }

    /// Re-fuse every state.
    pub fn make_fused(&mut self, side: FuseSide) {
        self.roots.iter_mut().for_each(|t| t.make_fused(side));
    }

    /// Fused side of the first state.
    pub fn fuse_side(&self) -> FuseSide { self.roots[0].fuse_side() }
}

#[derive(Serialize, Deserialize)]
struct MpsData {
    info: MpsInfo,
    center: usize,
    dot: usize,
    forms: String,
    kind: MpsKind,
}

/// A matrix-product state.
#[derive(Clone, Debug)]
pub struct Mps {
    /// Prefix of every stored key.
    pub tag: String,
    pub info: MpsInfo,
    /// First site of the active window.
    pub center: usize,
    /// Width of the active window.
    pub dot: usize,
    pub forms: CanonicalForms,
    pub kind: MpsKind,
    tensors: Vec<Option<SiteTensor>>,
}

// per-bond label counts, saturating
type Counts = HashMap<Sector, f64>;

fn label_counts(basis: &[Vec<Sector>], target: Sector) -> (Vec<Counts>, Vec<Counts>) {
    let n = basis.len();
    let mut left: Vec<Counts> = vec![Counts::default(); n + 1];
    left[0].insert(Sector::VACUUM, 1.0);
    for k in 0..n {
        let mut next = Counts::default();
        for (q, c) in left[k].iter() {
            for p in basis[k].iter() {
                *next.entry(*q + *p).or_insert(0.0) += c;
            }
        }
        left[k + 1] = next;
    }
    let mut right: Vec<Counts> = vec![Counts::default(); n + 1];
    right[n].insert(target, 1.0);
    for k in (0..n).rev() {
        let mut next = Counts::default();
        for (q, c) in right[k + 1].iter() {
            for p in basis[k].iter() {
                *next.entry(*q - *p).or_insert(0.0) += c;
            }
        }
        right[k] = next;
    }
    (left, right)
}

impl Mps {
    fn key(&self, i: usize) -> String { format!("{}.{}", self.tag, i) }

    fn root_key(&self, i: usize, k: usize) -> String {
        format!("{}.{}.{}", self.tag, i, k)
    }

    fn info_key(tag: &str) -> String { format!("{tag}.info") }

    /// Create a random MPS whose bonds carry every sector connecting the
    /// vacuum to `target`, right-canonicalized with its center at site 0.
    ///
    /// Each sector of a bond gets `bond_dim / (number of sectors)` states
    /// (at least one, at most the exact number of product states on either
    /// side), so bond dimensions may exceed `bond_dim` where the sector
    /// structure forces it.
    #[allow(clippy::too_many_arguments)]
    pub fn random<R>(
        tag: &str,
        basis: Vec<Vec<Sector>>,
        target: Sector,
        bond_dim: usize,
        dot: usize,
        kind: MpsKind,
        store: &dyn TensorStore,
        rng: &mut R,
    ) -> MpsResult<Self>
    where R: Rng + ?Sized
    {
        let n = basis.len();
        let (lc, rc) = label_counts(&basis, target);
        let mut bonds: Vec<Vec<Sector>> = Vec::with_capacity(n + 1);
        for k in 0..=n {
            let mut labels: Vec<(Sector, f64, f64)> =
                lc[k].iter()
                .filter_map(|(q, l)| rc[k].get(q).map(|r| (*q, *l, *r)))
                .collect();
            if labels.is_empty() { return Err(EmptySector { bond: k, target }); }
            labels.sort_by_key(|(q, _, _)| *q);
            let share = (bond_dim / labels.len()).max(1) as f64;
            let bond: Vec<Sector> =
                labels.into_iter()
                .flat_map(|(q, l, r)| {
                    let dim = l.min(r).min(share) as usize;
                    std::iter::repeat(q).take(dim)
                })
                .collect();
            bonds.push(bond);
        }
        let mut tensors: Vec<SiteTensor> =
            (0..n)
            .map(|k| {
                SiteTensor::random(
                    bonds[k].clone(), basis[k].clone(), bonds[k + 1].clone(), rng)
            })
            .collect();
        for k in (1..n).rev() {
            let (r, rest, bond) = split_exact(&tensors[k], false)?;
            tensors[k] = r;
            let prev = tensors[k - 1].clone();
            tensors[k - 1] = prev.absorb_right(&rest, bond)?;
        }
        if let Some(t0) = tensors.first_mut() {
            let nrm = t0.norm();
            if nrm > 0.0 { t0.scale(1.0 / nrm); }
        }

        let multi = kind.is_multi();
        let mut mps =
            Self {
                tag: tag.to_string(),
                info: MpsInfo {
                    n_sites: n,
                    bond_dim: 0,
                    bond_dims: vec![0; n + 1],
                    basis,
                    target,
                },
                center: 0,
                dot,
                forms: CanonicalForms::with_center(n, 0, multi),
                kind,
                tensors: vec![None; n],
            };
        mps.refresh_bond_dims_from(&tensors);
        if multi {
            let mut roots: Vec<SiteTensor> = vec![tensors[0].clone()];
            while roots.len() < mps.kind.nroots() {
                let (l, p, r) = {
                    let t = &tensors[0];
                    (t.left_labels().to_vec(), t.phys_labels().to_vec(),
                        t.right_labels().to_vec())
                };
                let mut next = SiteTensor::random(l, p, r, rng);
                for prev in roots.iter() {
                    let ov = prev.dot(&next);
                    next.axpy(-ov, prev);
                }
                let nrm = next.norm();
                if nrm < 1e-12 { continue; }
                next.scale(1.0 / nrm);
                roots.push(next);
            }
            for (k, root) in roots.iter().enumerate() {
                store::save_bin(store, &mps.root_key(0, k), root)?;
            }
        }
        for (k, t) in tensors.into_iter().enumerate() {
            if multi && k == 0 { continue; }
            store::save_bin(store, &mps.key(k), &t)?;
        }
        mps.save_data(store)?;
        Ok(mps)
    }

    /// Create a product state with site `k` in basis state `occupation[k]`,
    /// with its center at site 0.
    pub fn product(
        tag: &str,
        basis: Vec<Vec<Sector>>,
        occupation: &[usize],
        dot: usize,
        store: &dyn TensorStore,
    ) -> MpsResult<Self>
    {
        let n = basis.len();
        if occupation.len() != n { return Err(SiteCount(occupation.len(), n)); }
        let mut label = Sector::VACUUM;
        let mut mps =
            Self {
                tag: tag.to_string(),
                info: MpsInfo {
                    n_sites: n,
                    basis: basis.clone(),
                    target: Sector::VACUUM,
                    bond_dim: 1,
                    bond_dims: vec![1; n + 1],
                },
                center: 0,
                dot,
                forms: CanonicalForms::with_center(n, 0, false),
                kind: MpsKind::Single,
                tensors: vec![None; n],
            };
        for (k, (phys, s)) in basis.into_iter().zip(occupation).enumerate() {
            let next = label + phys[*s];
            let mut t = SiteTensor::zeros(vec![label], phys, vec![next], FuseSide::Right);
            t.as_mut_slice()[*s] = 1.0;
            store::save_bin(store, &mps.key(k), &t)?;
            label = next;
        }
        mps.info.target = label;
        mps.save_data(store)?;
        Ok(mps)
    }

    /// Load an MPS saved with [`save_data`][Self::save_data]. Site tensors
    /// are loaded lazily.
    pub fn load(tag: &str, store: &dyn TensorStore) -> MpsResult<Self> {
        let data: MpsData = store::load_json(store, &Self::info_key(tag))?;
        let forms: CanonicalForms = data.forms.parse()?;
        Ok(Self {
            tag: tag.to_string(),
            tensors: vec![None; data.info.n_sites],
            info: data.info,
            center: data.center,
            dot: data.dot,
            forms,
            kind: data.kind,
        })
    }

    /// Save the mutable bookkeeping (sector info, center, tags).
    pub fn save_data(&self, store: &dyn TensorStore) -> MpsResult<()> {
        let data =
            MpsData {
                info: self.info.clone(),
                center: self.center,
                dot: self.dot,
                forms: self.forms.to_string(),
                kind: self.kind.clone(),
            };
        store::save_json(store, &Self::info_key(&self.tag), &data)?;
        Ok(())
    }

    /// Number of sites.
    pub fn n_sites(&self) -> usize { self.info.n_sites }

    /// Return `true` for multi-state MPSs.
    pub fn is_multi(&self) -> bool { self.kind.is_multi() }

    /// Load the tensor of site `i` into memory.
    pub fn load_tensor(&mut self, i: usize, store: &dyn TensorStore)
        -> MpsResult<&SiteTensor>
    {
        if self.tensors[i].is_none() {
            self.tensors[i] = Some(store::load_bin(store, &self.key(i))?);
        }
        self.tensors[i].as_ref().ok_or(StateKind("loaded"))
    }

    /// Write the in-memory tensor of site `i` back to the store. Does
    /// nothing if it is not loaded.
    pub fn save_tensor(&self, i: usize, store: &dyn TensorStore) -> MpsResult<()> {
        if let Some(t) = &self.tensors[i] {
            store::save_bin(store, &self.key(i), t)?;
        }
        Ok(())
    }

    /// Drop the in-memory tensor of site `i`.
    pub fn unload_tensor(&mut self, i: usize) { self.tensors[i] = None; }

    /// Drop all in-memory tensors.
    pub fn unload_all(&mut self) { self.tensors.iter_mut().for_each(|t| { *t = None; }); }

    /// Replace the tensor of site `i` in memory and in the store.
    pub fn put_tensor(&mut self, i: usize, t: SiteTensor, store: &dyn TensorStore)
        -> MpsResult<()>
    {
        store::save_bin(store, &self.key(i), &t)?;
        self.tensors[i] = Some(t);
        Ok(())
    }

    /// The tensor of site `i`, from memory if loaded, otherwise read from the
    /// store without caching it.
    pub fn site_tensor(&self, i: usize, store: &dyn TensorStore)
        -> MpsResult<Cow<'_, SiteTensor>>
    {
        match &self.tensors[i] {
            Some(t) => Ok(Cow::Borrowed(t)),
            None => Ok(Cow::Owned(store::load_bin(store, &self.key(i))?)),
        }
    }

    /// Read the wavefunction stored at site `i`: the site tensor for a
    /// single-state MPS, or the group of state tensors for a multi-state one.
    pub fn load_wavefunction(&self, i: usize, store: &dyn TensorStore)
        -> MpsResult<Wavefunction>
    {
        match &self.kind {
            MpsKind::Single => {
                Ok(Wavefunction::single(self.site_tensor(i, store)?.into_owned()))
            },
            MpsKind::MultiState { nroots, weights } => {
                let roots =
                    (0..*nroots)
                    .map(|k| store::load_bin(store, &self.root_key(i, k)))
                    .collect::<Result<Vec<SiteTensor>, StoreError>>()?;
                Ok(Wavefunction { roots, weights: weights.clone() })
            },
        }
    }

    /// Store the wavefunction of site `i`.
    pub fn save_wavefunction(
        &mut self,
        i: usize,
        wfn: &Wavefunction,
        store: &dyn TensorStore,
    ) -> MpsResult<()>
    {
        match self.kind {
            MpsKind::Single => self.put_tensor(i, wfn.primary().clone(), store),
            MpsKind::MultiState { nroots, .. } => {
                if wfn.roots.len() != nroots { return Err(StateKind("matching")); }
                for (k, t) in wfn.roots.iter().enumerate() {
                    store::save_bin(store, &self.root_key(i, k), t)?;
                }
                self.tensors[i] = None;
                Ok(())
            },
        }
    }

    /// Remove the state tensors of a multi-state center at site `i`.
    pub fn remove_wavefunction(&self, i: usize, store: &dyn TensorStore)
        -> MpsResult<()>
    {
        for k in 0..self.kind.nroots() {
            store.remove(&self.root_key(i, k))?;
        }
        Ok(())
    }

    fn refresh_bond_dims_from(&mut self, tensors: &[SiteTensor]) {
        if let Some(t0) = tensors.first() {
            self.info.set_bond_dim(0, t0.dims().0);
        }
        for (k, t) in tensors.iter().enumerate() {
            self.info.set_bond_dim(k + 1, t.dims().2);
        }
    }

    /// Re-read every bond dimension from the stored tensors.
    pub fn refresh_bond_dims(&mut self, store: &dyn TensorStore) -> MpsResult<()> {
        for k in 0..self.n_sites() {
            let dims =
                if self.is_multi() && self.forms.get(k).is_multi() {
                    self.load_wavefunction(k, store)?.primary().dims()
                } else {
                    self.site_tensor(k, store)?.dims()
                };
            if k == 0 { self.info.set_bond_dim(0, dims.0); }
            self.info.set_bond_dim(k + 1, dims.2);
        }
        Ok(())
    }

    /// Copy every stored tensor and the bookkeeping under a new tag.
    pub fn deep_copy(&self, tag: &str, store: &dyn TensorStore) -> MpsResult<Self> {
        let mut new = self.clone();
        new.tag = tag.to_string();
        new.unload_all();
        let prefix = format!("{}.", self.tag);
        for key in store.keys()?.into_iter() {
            let Some(rest) = key.strip_prefix(&prefix) else { continue; };
            if rest == "info" || rest.starts_with("env.") { continue; }
            store.write(&format!("{tag}.{rest}"), store.read(&key)?)?;
        }
        new.save_data(store)?;
        Ok(new)
    }

    /// Move the orthogonality center of a single-state MPS from site `from`
    /// to site `to` by exact SVD shifts, tagging `to` as `C`.
    ///
    /// Tags outside of `from..=to` are left untouched, so this also works
    /// within a segment of a chain.
    pub fn shift_center(&mut self, from: usize, to: usize, store: &dyn TensorStore)
        -> MpsResult<()>
    {
        if self.is_multi() { return Err(StateKind("single-state")); }
        let mut k = from;
        while k < to {
            let t = self.site_tensor(k, store)?.into_owned();
            let (l, rest, bond) = split_exact(&t, true)?;
            let next = self.site_tensor(k + 1, store)?.into_owned();
            self.info.set_bond_dim(k + 1, bond.len());
            self.put_tensor(k, l, store)?;
            self.put_tensor(k + 1, next.absorb_left(&rest, bond)?, store)?;
            self.forms.set(k, CanonicalForm::Left);
            k += 1;
        }
        while k > to {
            let t = self.site_tensor(k, store)?.into_owned();
            let (r, rest, bond) = split_exact(&t, false)?;
            let prev = self.site_tensor(k - 1, store)?.into_owned();
            self.info.set_bond_dim(k, bond.len());
            self.put_tensor(k, r, store)?;
            self.put_tensor(k - 1, prev.absorb_right(&rest, bond)?, store)?;
            self.forms.set(k, CanonicalForm::Right);
            k -= 1;
        }
        self.forms.set(to, CanonicalForm::Center);
        Ok(())
    }

    /// Contract the whole state (state `root` of a multi-state MPS) into a
    /// dense vector over the product basis, with index `Σ_k s_k d^k`.
    ///
    /// *Only for small chains.*
    pub fn to_dense(&self, root: usize, store: &dyn TensorStore)
        -> MpsResult<na::DVector<f64>>
    {
        let mut acc = na::DMatrix::from_element(1, 1, 1.0);
        for k in 0..self.n_sites() {
            let t =
                if self.is_multi() && self.forms.get(k).is_multi() {
                    self.load_wavefunction(k, store)?.roots.swap_remove(root)
                } else {
                    self.site_tensor(k, store)?.into_owned()
                };
            let (m, d, n) = t.dims();
            let p = acc.nrows();
            let prod = acc * t.reshaped(m, d * n);
            acc = prod.reshape_generic(na::Dyn(p * d), na::Dyn(n));
        }
        let len = acc.len();
        Ok(acc.reshape_generic(na::Dyn(len), na::Const::<1>))
    }
}

/// Exact one-site split: returns the normalized tensor, the remainder to be
/// absorbed by the neighbor (`K × n` forward, `m × K` backward), and the new
/// bond labels.
pub(crate) fn split_exact(t: &SiteTensor, forward: bool)
    -> MpsResult<(SiteTensor, na::DMatrix<f64>, Vec<Sector>)>
{
    let shape = SplitShape::one_site(t, forward);
    let x = shape.matrix(t)?;
    let split =
        split_wavefunction_svd(
            &x, &[], usize::MAX, forward, false, CANONICAL_CUTOFF,
            TruncationType::Physical, DecompositionType::Svd,
        )?;
    if forward {
        let l = shape.left_tensor(split.bond.clone(), split.left)?;
        Ok((l, split.right, split.bond))
    } else {
        let r = shape.right_tensor(split.bond.clone(), split.right)?;
        Ok((r, split.left, split.bond))
    }
}

/// Index of an [`Mps`] in an [`MpsArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MpsId(usize);

/// Owner of the MPSs taking part in a sweep; environments and drivers refer
/// to them by [`MpsId`].
#[derive(Clone, Debug, Default)]
pub struct MpsArena {
    mpss: Vec<Mps>,
}

impl MpsArena {
    pub fn new() -> Self { Self::default() }

    /// Add an MPS, returning its id.
    pub fn insert(&mut self, mps: Mps) -> MpsId {
        self.mpss.push(mps);
        MpsId(self.mpss.len() - 1)
    }

    pub fn get(&self, id: MpsId) -> &Mps { &self.mpss[id.0] }

    pub fn get_mut(&mut self, id: MpsId) -> &mut Mps { &mut self.mpss[id.0] }
}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ ops, store::MemoryStore };
    use super::*;

    fn spins(n: usize) -> Vec<Vec<Sector>> { vec![ops::spin_half_basis(); n] }

    #[test]
    fn random_mps_is_normalized_and_in_sector() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(30);
        let mps =
            Mps::random(
                "psi", spins(6), Sector(0), 4, 2, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        assert_eq!(mps.forms.to_string(), "CRRRRR");
        let psi = mps.to_dense(0, &store).unwrap();
        assert!((psi.norm() - 1.0).abs() < 1e-12);
        let basis = ops::spin_half_basis();
        for (idx, amp) in psi.iter().enumerate() {
            let label: i32 = (0..6).map(|k| basis[(idx >> k) & 1].0).sum();
            if label != 0 { assert_eq!(*amp, 0.0); }
        }
        // right-normalized tensors
        for k in 1..6 {
            let t = mps.site_tensor(k, &store).unwrap().into_owned();
            let m = t.dims().0;
            let r = t.into_rfused();
            assert!((&r * r.transpose() - na::DMatrix::identity(m, m)).norm() < 1e-10);
        }
        assert_eq!(mps.info.bond_dims[0], 1);
        assert_eq!(mps.info.bond_dims[6], 1);
    }

    #[test]
    fn forced_dimensions_may_exceed_target() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(31);
        let mps =
            Mps::random(
                "psi", spins(6), Sector(0), 1, 2, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        // bond 3 has sectors -3, -1, 1, 3 available, one state each at most
        assert!(mps.info.bond_dims[3] >= 1);
        assert!(mps.info.bond_dim >= 1);
        let unreachable =
            Mps::random(
                "bad", spins(3), Sector(0), 4, 2, MpsKind::Single, &store, &mut rng,
            );
        assert!(matches!(unreachable, Err(EmptySector { .. })));
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(32);
        let mps =
            Mps::random(
                "psi", spins(4), Sector(0), 4, 1, MpsKind::multi(2), &store, &mut rng,
            ).unwrap();
        assert_eq!(mps.forms.to_string(), "MRRR");
        let back = Mps::load("psi", &store).unwrap();
        assert_eq!(back.forms, mps.forms);
        assert_eq!(back.info, mps.info);
        let wfn = back.load_wavefunction(0, &store).unwrap();
        assert_eq!(wfn.roots.len(), 2);
        assert!(wfn.roots[0].dot(&wfn.roots[1]).abs() < 1e-12);
        let a = back.to_dense(0, &store).unwrap();
        let b = back.to_dense(1, &store).unwrap();
        assert!(a.dot(&b).abs() < 1e-10);
        let copy = back.deep_copy("phi", &store).unwrap();
        assert_eq!(copy.forms, back.forms);
        assert_eq!(copy.to_dense(1, &store).unwrap(), b);
        assert!(store.contains("phi.info"));
    }

    #[test]
    fn shifting_the_center_keeps_the_state() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(33);
        let mut mps =
            Mps::random(
                "psi", spins(5), Sector(1), 8, 2, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        let before = mps.to_dense(0, &store).unwrap();
        mps.shift_center(0, 3, &store).unwrap();
        assert_eq!(mps.forms.to_string(), "LLLCR");
        let after = mps.to_dense(0, &store).unwrap();
        assert!((before - &after).norm() < 1e-10);
        mps.shift_center(3, 1, &store).unwrap();
        assert_eq!(mps.forms.to_string(), "LCRRR");
        assert!((mps.to_dense(0, &store).unwrap() - after).norm() < 1e-10);
    }

    #[test]
    fn product_state_is_a_basis_vector() {
        let store = MemoryStore::new();
        let mps = Mps::product("p", spins(3), &[0, 1, 1], 2, &store).unwrap();
        assert_eq!(mps.info.target, Sector(-1));
        let psi = mps.to_dense(0, &store).unwrap();
        assert_eq!(psi[0b110], 1.0);
        assert!((psi.norm() - 1.0).abs() < 1e-14);
    }
}
