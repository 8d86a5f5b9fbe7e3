#![allow(dead_code)]

use std::sync::Arc;
use nalgebra as na;
use mps_sweep::{
    Mpo,
    Mps,
    MpsId,
    MpsKind,
    Sector,
    SweepContext,
    store::MemoryStore,
};

/// Lowest eigenvalue of the dense operator restricted to states of total
/// label `target`.
pub fn exact_ground(mpo: &Mpo, target: Sector) -> f64 {
    let bases = mpo.bases();
    let dims: Vec<usize> = bases.iter().map(|b| b.len()).collect();
    let total: usize = dims.iter().product();
    let keep: Vec<usize> =
        (0..total)
        .filter(|idx| {
            let mut rem = *idx;
            let mut label = Sector::VACUUM;
            for (b, d) in bases.iter().zip(dims.iter()) {
                label += b[rem % d];
                rem /= d;
            }
            label == target
        })
        .collect();
    let h = mpo.dense_matrix();
    let sub = na::DMatrix::from_fn(keep.len(), keep.len(), |a, b| h[(keep[a], keep[b])]);
    sub.symmetric_eigen().eigenvalues.iter().copied().fold(f64::INFINITY, f64::min)
}

pub fn context(seed: u64) -> SweepContext {
    SweepContext::new(Arc::new(MemoryStore::new()), seed, 0)
}

/// A random single-state MPS tagged `psi` in the arena of `ctx`.
pub fn random_state(
    ctx: &mut SweepContext,
    mpo: &Mpo,
    target: Sector,
    bond_dim: usize,
    dot: usize,
) -> MpsId
{
    let store = Arc::clone(&ctx.store);
    let mps =
        Mps::random(
            "psi", mpo.bases(), target, bond_dim, dot, MpsKind::Single,
            store.as_ref(), &mut ctx.rng,
        ).unwrap();
    ctx.arena.insert(mps)
}
