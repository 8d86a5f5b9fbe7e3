//! Partially contracted operator blocks around the active window of a sweep.
//!
//! For a bra MPS `⟨B|`, an MPO `W` and a ket MPS `|A⟩`, the left block at bond
//! `k` is the contraction of sites `0..k`, and the right block at bond `k` is
//! the contraction of sites `k..n`:
//! ```text
//!  .-- B'_0 -- ... -- B'_{k-1} --        -- B'_k -- ... -- B'_{n-1} --.
//!  |    |               |        a      a     |                |      |
//!  |-- W_0  -- ... -- W_{k-1}  --        -- W_k  -- ... -- W_{n-1}  --|
//!  |    |               |                     |                |      |
//!  '-- A_0  -- ... -- A_{k-1}  --        -- A_k  -- ... -- A_{n-1}  --'
//! ```
//! Each block is stored as one `bra × ket` matrix per MPO bond index `a` (see
//! [`EnvBlock`]). A [`MovingEnvironment`] keeps the blocks for bonds left of
//! and right of its window `[center, center + dot - 1]` and updates them one
//! site at a time as the window slides ([`MovingEnvironment::move_to`]).

use std::sync::Arc;
use nalgebra as na;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::trace;
use crate::{
    comm::{ CommError, ParallelRule },
    mpo::{ Mpo, MpoError, MpoSite },
    mps::{ MpsArena, MpsError, MpsId },
    store::{ StoreError, TensorStore },
    tensor::{ FuseSide, SiteTensor },
};

#[derive(Debug, Error)]
pub enum EnvError {
    /// Returned when a block needed by an operation has not been computed.
    #[error("error in MovingEnvironment: missing {0} block at bond {1}")]
    MissingBlock(&'static str, usize),

    /// Returned when a one-site wavefunction is fused on the wrong side for
    /// the requested operation.
    #[error("error in MovingEnvironment::eff_ham: expected {expected:?}-fused wavefunction, got {found:?}")]
    FuseMismatch { expected: FuseSide, found: FuseSide },

    /// Returned when a tensor does not fit the window's blocks or operator.
    #[error("error in MovingEnvironment: sector mismatch: {0}")]
    SectorMismatch(String),

    /// Returned when a window is moved past the end of the chain.
    #[error("error in MovingEnvironment::move_to: window at {0} with width {1} exceeds {2} sites")]
    OutOfRange(usize, usize, usize),

    #[error("MPO error: {0}")]
    MpoError(#[from] MpoError),

    #[error("MPS error: {0}")]
    MpsError(#[from] MpsError),

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("communicator error: {0}")]
    CommError(#[from] CommError),
}
use EnvError::*;
pub type EnvResult<T> = Result<T, EnvError>;

/// A partially contracted left or right block: one `bra × ket` matrix per MPO
/// bond index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvBlock {
    pub mats: Vec<na::DMatrix<f64>>,
}

impl EnvBlock {
    /// The block at either end of the chain, where the MPO bond is closed on
    /// index 0.
    pub fn boundary(mpo_dim: usize) -> Self {
        let mut mats = vec![na::DMatrix::zeros(1, 1); mpo_dim.max(1)];
        mats[0][(0, 0)] = 1.0;
        Self { mats }
    }

    /// Number of MPO bond indices.
    pub fn len(&self) -> usize { self.mats.len() }

    /// Return `true` if there are no MPO bond indices.
    pub fn is_empty(&self) -> bool { self.mats.is_empty() }

    /// `(bra, ket)` dimensions.
    pub fn dims(&self) -> (usize, usize) {
        self.mats.first().map(|m| m.shape()).unwrap_or((0, 0))
    }

    fn allreduce(&mut self, rule: &ParallelRule) -> EnvResult<()> {
        let mut flat: Vec<f64> =
            self.mats.iter().flat_map(|m| m.iter().copied()).collect();
        rule.comm.allreduce_sum(&mut flat)?;
        let mut offs: usize = 0;
        for mat in self.mats.iter_mut() {
            let len = mat.len();
            mat.as_mut_slice().copy_from_slice(&flat[offs..offs + len]);
            offs += len;
        }
        Ok(())
    }
}

fn check_block(
    block: &EnvBlock,
    mpo_dim: usize,
    dims: (usize, usize),
    what: &str,
) -> EnvResult<()>
{
    if block.len() != mpo_dim {
        return Err(SectorMismatch(
            format!("{what} block has {} MPO channels, operator has {mpo_dim}", block.len())));
    }
    if block.mats.iter().any(|m| m.shape() != dims) {
        return Err(SectorMismatch(
            format!("{what} block is {:?}, tensors need {dims:?}", block.dims())));
    }
    Ok(())
}

fn check_phys(site: &MpoSite, bra: &SiteTensor, ket: &SiteTensor) -> EnvResult<()> {
    if bra.phys_labels() != site.phys.as_slice() || ket.phys_labels() != site.phys.as_slice() {
        return Err(SectorMismatch("physical labels differ from the operator".into()));
    }
    Ok(())
}

// Σ_s op[s', s] mats[s], for every s'
fn mix_slices(op: &na::DMatrix<f64>, mats: &[na::DMatrix<f64>], sp: usize)
    -> na::DMatrix<f64>
{
    let (r, c) = mats[0].shape();
    let mut acc = na::DMatrix::zeros(r, c);
    for (s, m) in mats.iter().enumerate() {
        let o = op[(sp, s)];
        if o != 0.0 { acc += m * o; }
    }
    acc
}

/// Extend a left block through one site:
/// `L'[b] = Σ_{a, s', s} W_ab[s', s] B_{s'}ᵀ L[a] A_s`.
///
/// With a parallel rule, each process contracts only the operator terms it
/// owns and the partial blocks are summed over all processes.
pub fn extend_left(
    left: &EnvBlock,
    site: &MpoSite,
    bra: &SiteTensor,
    ket: &SiteTensor,
    rule: Option<&ParallelRule>,
) -> EnvResult<EnvBlock>
{
    check_phys(site, bra, ket)?;
    let (mb, _, nb) = bra.dims();
    let (mk, _, nk) = ket.dims();
    check_block(left, site.left_dim, (mb, mk), "left")?;
    let bra_s = bra.phys_slices();
    let ket_s = ket.phys_slices();
    let mut cache: Vec<Option<Vec<na::DMatrix<f64>>>> = vec![None; site.left_dim];
    let mut mats = vec![na::DMatrix::zeros(nb, nk); site.right_dim];
    for (t, term) in site.terms.iter().enumerate() {
        if rule.is_some_and(|r| !r.owns(t)) { continue; }
        let la =
            cache[term.left].get_or_insert_with(|| {
                ket_s.iter().map(|a| &left.mats[term.left] * a).collect()
            });
        for (sp, b) in bra_s.iter().enumerate() {
            let mixed = mix_slices(&term.op, la, sp);
            mats[term.right].gemm_tr(1.0, b, &mixed, 1.0);
        }
    }
    let mut new = EnvBlock { mats };
    if let Some(rule) = rule { new.allreduce(rule)?; }
    Ok(new)
}

/// Extend a right block through one site:
/// `R'[a] = Σ_{b, s', s} W_ab[s', s] B_{s'} R[b] A_sᵀ`.
///
/// Parallel rules are handled as in [`extend_left`].
pub fn extend_right(
    right: &EnvBlock,
    site: &MpoSite,
    bra: &SiteTensor,
    ket: &SiteTensor,
    rule: Option<&ParallelRule>,
) -> EnvResult<EnvBlock>
{
    check_phys(site, bra, ket)?;
    let (mb, _, nb) = bra.dims();
    let (mk, _, nk) = ket.dims();
    check_block(right, site.right_dim, (nb, nk), "right")?;
    let bra_s = bra.phys_slices();
    let ket_s = ket.phys_slices();
    let mut cache: Vec<Option<Vec<na::DMatrix<f64>>>> = vec![None; site.right_dim];
    let mut mats = vec![na::DMatrix::zeros(mb, mk); site.left_dim];
    for (t, term) in site.terms.iter().enumerate() {
        if rule.is_some_and(|r| !r.owns(t)) { continue; }
        let rb =
            cache[term.right].get_or_insert_with(|| {
                ket_s.iter().map(|a| &right.mats[term.right] * a.transpose()).collect()
            });
        for (sp, b) in bra_s.iter().enumerate() {
            let mixed = mix_slices(&term.op, rb, sp);
            mats[term.left].gemm(1.0, b, &mixed, 1.0);
        }
    }
    let mut new = EnvBlock { mats };
    if let Some(rule) = rule { new.allreduce(rule)?; }
    Ok(new)
}

/// Left and right operator blocks around a sliding window of `dot` sites.
///
/// The environment refers to its bra and ket through ids in an [`MpsArena`]
/// and reads their site tensors through the store as it moves.
#[derive(Clone, Debug)]
pub struct MovingEnvironment {
    pub bra: MpsId,
    pub ket: MpsId,
    mpo: Arc<Mpo>,
    n_sites: usize,
    /// First site of the window.
    pub center: usize,
    /// Width of the window.
    pub dot: usize,
    left: Vec<Option<EnvBlock>>,
    right: Vec<Option<EnvBlock>>,
    rule: Option<ParallelRule>,
}

impl MovingEnvironment {
    /// Create a new environment with no blocks computed yet.
    pub fn new(
        mpo: Arc<Mpo>,
        bra: MpsId,
        ket: MpsId,
        center: usize,
        dot: usize,
        rule: Option<ParallelRule>,
    ) -> EnvResult<Self>
    {
        let n_sites = mpo.n_sites();
        if dot == 0 || center + dot > n_sites {
            return Err(OutOfRange(center, dot, n_sites));
        }
        Ok(Self {
            bra,
            ket,
            mpo,
            n_sites,
            center,
            dot,
            left: vec![None; n_sites + 1],
            right: vec![None; n_sites + 1],
            rule,
        })
    }

    /// The operator.
    pub fn mpo(&self) -> &Mpo { &self.mpo }

    /// The parallel rule, if any.
    pub fn rule(&self) -> Option<&ParallelRule> { self.rule.as_ref() }

    /// Number of sites.
    pub fn n_sites(&self) -> usize { self.n_sites }

    /// Return `true` if the bra and ket are the same state.
    pub fn same_space(&self) -> bool { self.bra == self.ket }

    /// Left block at bond `k`.
    pub fn left_block(&self, k: usize) -> EnvResult<&EnvBlock> {
        self.left.get(k).and_then(|b| b.as_ref()).ok_or(MissingBlock("left", k))
    }

    /// Right block at bond `k`.
    pub fn right_block(&self, k: usize) -> EnvResult<&EnvBlock> {
        self.right.get(k).and_then(|b| b.as_ref()).ok_or(MissingBlock("right", k))
    }

    /// Overwrite the left block at bond `k`.
    pub fn set_left_block(&mut self, k: usize, block: EnvBlock) {
        self.left[k] = Some(block);
    }

    /// Overwrite the right block at bond `k`.
    pub fn set_right_block(&mut self, k: usize, block: EnvBlock) {
        self.right[k] = Some(block);
    }

    fn extend_left_at(&mut self, k: usize, arena: &MpsArena, store: &dyn TensorStore)
        -> EnvResult<()>
    {
        let new = {
            let left = self.left_block(k)?;
            let bra = arena.get(self.bra).site_tensor(k, store)?;
            let ket = arena.get(self.ket).site_tensor(k, store)?;
            extend_left(left, self.mpo.site(k), &bra, &ket, self.rule.as_ref())?
        };
        trace!("left block {} -> {}", k, k + 1);
        self.left[k + 1] = Some(new);
        Ok(())
    }

    fn extend_right_at(&mut self, k: usize, arena: &MpsArena, store: &dyn TensorStore)
        -> EnvResult<()>
    {
        let new = {
            let right = self.right_block(k + 1)?;
            let bra = arena.get(self.bra).site_tensor(k, store)?;
            let ket = arena.get(self.ket).site_tensor(k, store)?;
            extend_right(right, self.mpo.site(k), &bra, &ket, self.rule.as_ref())?
        };
        trace!("right block {} -> {}", k + 1, k);
        self.right[k] = Some(new);
        Ok(())
    }

    /// Build every block needed for the current window from the chain ends.
    pub fn prepare(&mut self, arena: &MpsArena, store: &dyn TensorStore)
        -> EnvResult<()>
    {
        let n = self.n_sites;
        let ldim = self.mpo.site(0).left_dim;
        let rdim = self.mpo.site(n - 1).right_dim;
        self.partial_prepare(
            0, n, EnvBlock::boundary(ldim), EnvBlock::boundary(rdim), arena, store)
    }

    /// Build the blocks for a window inside the segment `[a, b)`, starting from
    /// the given left block at bond `a` and right block at bond `b`.
    pub fn partial_prepare(
        &mut self,
        a: usize,
        b: usize,
        left: EnvBlock,
        right: EnvBlock,
        arena: &MpsArena,
        store: &dyn TensorStore,
    ) -> EnvResult<()>
    {
        if self.center < a || self.center + self.dot > b || b > self.n_sites {
            return Err(OutOfRange(self.center, self.dot, b));
        }
        self.left[a] = Some(left);
        self.right[b] = Some(right);
        for k in a..self.center {
            self.extend_left_at(k, arena, store)?;
        }
        for k in (self.center + self.dot..b).rev() {
            self.extend_right_at(k, arena, store)?;
        }
        Ok(())
    }

    /// Slide the window to start at site `i`, extending the blocks over the
    /// sites left behind.
    pub fn move_to(&mut self, i: usize, arena: &MpsArena, store: &dyn TensorStore)
        -> EnvResult<()>
    {
        if i + self.dot > self.n_sites {
            return Err(OutOfRange(i, self.dot, self.n_sites));
        }
        if i > self.center {
            for k in self.center..i {
                self.extend_left_at(k, arena, store)?;
            }
        } else if i < self.center {
            for k in (i + self.dot..self.center + self.dot).rev() {
                self.extend_right_at(k, arena, store)?;
            }
        }
        self.center = i;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        mps::{ Mps, MpsKind },
        quantum::Sector,
        store::MemoryStore,
    };
    use super::*;

    #[test]
    fn slices_mix_with_operator_rows() {
        let op = na::DMatrix::from_row_slice(2, 2, &[0.0, 2.0, -1.0, 0.5]);
        let mats =
            vec![
                na::DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                na::DMatrix::from_element(2, 3, 1.0),
            ];
        assert_eq!(mix_slices(&op, &mats, 0), na::DMatrix::from_element(2, 3, 2.0));
        assert_eq!(mix_slices(&op, &mats, 1), &mats[1] * 0.5 - &mats[0]);
    }

    #[test]
    fn full_contraction_is_the_energy() {
        let mpo = Arc::new(Mpo::heisenberg(5, 1.0, 1.0, 0.0));
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(40);
        let mps =
            Mps::random(
                "psi", mpo.bases(), Sector(1), 6, 1, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        let psi = mps.to_dense(0, &store).unwrap();
        let h = mpo.dense_matrix();
        let exact = psi.dot(&(&h * &psi)) - mpo.const_e;
        let mut arena = MpsArena::new();
        let id = arena.insert(mps);

        // contract everything from the left
        let mut block = EnvBlock::boundary(1);
        for k in 0..5 {
            let t = arena.get(id).site_tensor(k, &store).unwrap();
            block = extend_left(&block, mpo.site(k), &t, &t, None).unwrap();
        }
        assert!((block.mats[0][(0, 0)] - exact).abs() < 1e-10);

        // and from the right
        let mut block = EnvBlock::boundary(1);
        for k in (0..5).rev() {
            let t = arena.get(id).site_tensor(k, &store).unwrap();
            block = extend_right(&block, mpo.site(k), &t, &t, None).unwrap();
        }
        assert!((block.mats[0][(0, 0)] - exact).abs() < 1e-10);
    }

    #[test]
    fn moving_matches_fresh_preparation() {
        let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 0.5, 0.1));
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(41);
        let mps =
            Mps::random(
                "psi", mpo.bases(), Sector(0), 4, 2, MpsKind::Single, &store, &mut rng,
            ).unwrap();
        let mut arena = MpsArena::new();
        let id = arena.insert(mps);
        let mut env = MovingEnvironment::new(mpo.clone(), id, id, 0, 2, None).unwrap();
        env.prepare(&arena, &store).unwrap();
        // tensor content is irrelevant to the block bookkeeping, only that the
        // blocks agree with a fresh build
        env.move_to(3, &arena, &store).unwrap();
        let mut fresh = MovingEnvironment::new(mpo.clone(), id, id, 3, 2, None).unwrap();
        fresh.prepare(&arena, &store).unwrap();
        assert_eq!(env.left_block(3).unwrap(), fresh.left_block(3).unwrap());
        assert_eq!(env.right_block(5).unwrap(), fresh.right_block(5).unwrap());
        env.move_to(1, &arena, &store).unwrap();
        let mut fresh = MovingEnvironment::new(mpo, id, id, 1, 2, None).unwrap();
        fresh.prepare(&arena, &store).unwrap();
        assert_eq!(env.right_block(3).unwrap(), fresh.right_block(3).unwrap());
        assert!(env.move_to(5, &arena, &store).is_err());
    }

}
