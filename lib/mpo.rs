//! Matrix-product operators: the operator network the sweeps act with.
//!
//! An [`Mpo`] is a chain of sparse operator-valued matrices `W[a, b]`,
//! ```text
//!      s'           s'
//!      |            |
//!  a --W-- b    b --W-- c    ...
//!      |            |
//!      s            s
//! ```
//! with one local operator `O_ab[s', s]` per nonzero entry. The sweep engine
//! only consumes the entries site by site (and fused two-site windows, see
//! [`Mpo::window`]); construction helpers for nearest-neighbor Hamiltonians
//! are provided for tests and demos.

use nalgebra as na;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use crate::{
    ops::{ self, C_DN, C_UP, PARITY, SMINUS, SPLUS, SZ },
    quantum::Sector,
    rule::{ OpElement, OpNames, OpRule, RuleQc, SiteIndex },
    tensor::fuse_phys,
};

#[derive(Debug, Error)]
pub enum MpoError {
    /// Returned when a channel refers to an equivalent channel that has no
    /// explicit operators.
    #[error("error in Mpo::nearest_neighbor: channel {0} has no explicit equivalent")]
    UnresolvedChannel(String),

    /// Returned when a window extends past the end of the chain.
    #[error("error in Mpo::window: window at {0} with width {1} exceeds {2} sites")]
    WindowOutOfRange(usize, usize, usize),
}
use MpoError::*;
pub type MpoResult<T> = Result<T, MpoError>;

/// A single nonzero entry `O_ab` of a site's operator matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct MpoTerm {
    pub left: usize,
    pub right: usize,
    pub op: na::DMatrix<f64>,
}

/// The operator matrix of one site (or of a fused window of sites).
#[derive(Clone, Debug, PartialEq)]
pub struct MpoSite {
    /// Physical labels.
    pub phys: Vec<Sector>,
    /// Dimension of the left MPO bond.
    pub left_dim: usize,
    /// Dimension of the right MPO bond.
    pub right_dim: usize,
    /// Nonzero entries, sorted by `(left, right)`.
    pub terms: Vec<MpoTerm>,
}

impl MpoSite {
    /// Fuse `self` with the site to its right, with physical index
    /// `s1 + d1·s2`.
    pub fn fuse(&self, rhs: &Self) -> Self {
        let mut acc: HashMap<(usize, usize), na::DMatrix<f64>> =
            HashMap::default();
        for t1 in self.terms.iter() {
            for t2 in rhs.terms.iter().filter(|t2| t2.left == t1.right) {
                let op = t2.op.kronecker(&t1.op);
                acc.entry((t1.left, t2.right))
                    .and_modify(|prev| { *prev += &op; })
                    .or_insert(op);
            }
        }
        let mut terms: Vec<MpoTerm> =
            acc.into_iter()
            .map(|((left, right), op)| MpoTerm { left, right, op })
            .collect();
        terms.sort_by_key(|t| (t.left, t.right));
        Self {
            phys: fuse_phys(&self.phys, &rhs.phys),
            left_dim: self.left_dim,
            right_dim: rhs.right_dim,
            terms,
        }
    }
}

/// A matrix-product operator with a constant energy shift.
#[derive(Clone, Debug, PartialEq)]
pub struct Mpo {
    sites: Vec<MpoSite>,
    /// Constant added to every expectation value.
    pub const_e: f64,
}

/// A two-site channel `coef · L ⊗ R` of a nearest-neighbor operator.
///
/// Channels without explicit operators are resolved through an [`OpRule`]:
/// the channel's name is mapped to a canonical name, whose operators are used
/// (transposed and scaled as the rule says).
#[derive(Clone, Debug)]
pub struct Channel {
    pub name: OpElement,
    pub coef: f64,
    pub ops: Option<(na::DMatrix<f64>, na::DMatrix<f64>)>,
}

impl Mpo {
    /// Create a new MPO from its sites.
    pub fn new(sites: Vec<MpoSite>, const_e: f64) -> Self {
        Self { sites, const_e }
    }

    /// The identity operator on a chain with the given physical labels.
    pub fn identity(phys: &[Vec<Sector>]) -> Self {
        let sites =
            phys.iter()
            .map(|p| {
                MpoSite {
                    phys: p.clone(),
                    left_dim: 1,
                    right_dim: 1,
                    terms: vec![MpoTerm {
                        left: 0,
                        right: 0,
                        op: na::DMatrix::identity(p.len(), p.len()),
                    }],
                }
            })
            .collect();
        Self { sites, const_e: 0.0 }
    }

    /// A translation-invariant nearest-neighbor operator
    /// ```text
    /// Σ_i onsite_i + Σ_i Σ_k coef_k · L_k(i) ⊗ R_k(i + 1)
    /// ```
    /// as a finite-state MPO with bulk matrix
    /// ```text
    /// | I  L_1 ... L_K  onsite   |
    /// |          ...   c_1 R_1   |
    /// |          ...   c_K R_K   |
    /// |                I         |
    /// ```
    pub fn nearest_neighbor(
        n: usize,
        phys: &[Sector],
        onsite: &na::DMatrix<f64>,
        channels: &[Channel],
        rule: &dyn OpRule,
    ) -> MpoResult<Self>
    {
        let explicit: Vec<(&OpElement, &(na::DMatrix<f64>, na::DMatrix<f64>))> =
            channels.iter()
            .filter_map(|ch| ch.ops.as_ref().map(|ops| (&ch.name, ops)))
            .collect();
        let mut resolved: Vec<(f64, na::DMatrix<f64>, na::DMatrix<f64>)> =
            Vec::with_capacity(channels.len());
        for ch in channels.iter() {
            if let Some((l, r)) = &ch.ops {
                resolved.push((ch.coef, l.clone(), r.clone()));
                continue;
            }
            let eq = rule.canonical(&ch.name);
            let (_, (l, r)) =
                explicit.iter()
                .find(|(name, _)| {
                    name.name == eq.op.name
                        && name.site_index == eq.op.site_index
                        && name.q_label == eq.op.q_label
                })
                .ok_or_else(|| UnresolvedChannel(ch.name.to_string()))?;
            let (l, r) =
                if eq.trans {
                    (l.transpose(), r.transpose())
                } else {
                    (l.clone(), r.clone())
                };
            resolved.push((ch.coef * eq.factor, l, r));
        }

        let d = phys.len();
        let k = resolved.len();
        let last = k + 1;
        let id = na::DMatrix::<f64>::identity(d, d);
        let mut bulk: Vec<MpoTerm> = Vec::new();
        bulk.push(MpoTerm { left: 0, right: 0, op: id.clone() });
        for (j, (_, l, _)) in resolved.iter().enumerate() {
            bulk.push(MpoTerm { left: 0, right: j + 1, op: l.clone() });
        }
        bulk.push(MpoTerm { left: 0, right: last, op: onsite.clone() });
        for (j, (c, _, r)) in resolved.iter().enumerate() {
            bulk.push(MpoTerm { left: j + 1, right: last, op: r * *c });
        }
        bulk.push(MpoTerm { left: last, right: last, op: id });

        let sites =
            (0..n)
            .map(|i| {
                let first = i == 0;
                let end = i + 1 == n;
                let mut terms: Vec<MpoTerm> =
                    bulk.iter()
                    .filter(|t| !first || t.left == 0)
                    .filter(|t| !end || t.right == last)
                    .map(|t| {
                        MpoTerm {
                            left: if first { 0 } else { t.left },
                            right: if end { 0 } else { t.right },
                            op: t.op.clone(),
                        }
                    })
                    .collect();
                terms.sort_by_key(|t| (t.left, t.right));
                MpoSite {
                    phys: phys.to_vec(),
                    left_dim: if first { 1 } else { k + 2 },
                    right_dim: if end { 1 } else { k + 2 },
                    terms,
                }
            })
            .collect();
        Ok(Self { sites, const_e: 0.0 })
    }

    /// The spin-1/2 XXZ chain
    /// `J Σ (S⁺S⁻ + S⁻S⁺)/2 + Jz Σ SᶻSᶻ - h Σ Sᶻ`.
    pub fn heisenberg(n: usize, j: f64, jz: f64, h: f64) -> Self {
        let channel = |q: i32, coef: f64, l: &na::DMatrix<f64>, r: &na::DMatrix<f64>| {
            Channel {
                name: OpElement::new(OpNames::B, SiteIndex::new([(0, 0)]), Sector(q)),
                coef,
                ops: Some((l.clone(), r.clone())),
            }
        };
        let channels = [
            channel(2, 0.5 * j, &SPLUS, &SMINUS),
            channel(-2, 0.5 * j, &SMINUS, &SPLUS),
            channel(0, jz, &SZ, &SZ),
        ];
        let onsite = &*SZ * (-h);
        // all channels are explicit, so the rule is never consulted
        Self::nearest_neighbor(n, &ops::spin_half_basis(), &onsite, &channels, &RuleQc::default())
            .unwrap_or_else(|_| unreachable!())
    }

    /// The Hubbard chain
    /// `-t Σ_σ (c†_{iσ} c_{i+1,σ} + h.c.) + U Σ n_↑ n_↓ - μ Σ (n_↑ + n_↓)`.
    ///
    /// The hermitian-conjugate hopping channels are derived from the explicit
    /// ones through [`RuleQc`].
    pub fn hubbard(n: usize, t: f64, u: f64, mu: f64) -> Self {
        let parity = Lazy::force(&PARITY);
        let mut channels = Vec::new();
        for (spin, a) in [(0_u8, Lazy::force(&C_UP)), (1_u8, Lazy::force(&C_DN))] {
            channels.push(Channel {
                name: OpElement::new(OpNames::C, SiteIndex::new([(0, spin)]), Sector(1)),
                coef: -t,
                ops: Some((a.transpose() * parity, a.clone())),
            });
            channels.push(Channel {
                name: OpElement::new(OpNames::D, SiteIndex::new([(0, spin)]), Sector(-1)),
                coef: -t,
                ops: None,
            });
        }
        let (nu, nd) = (ops::number(0), ops::number(1));
        let onsite = &nu * &nd * u - (&nu + &nd) * mu;
        Self::nearest_neighbor(n, &ops::fermion_basis(), &onsite, &channels, &RuleQc::default())
            .unwrap_or_else(|_| unreachable!())
    }

    /// Return `self` with a new constant shift.
    pub fn with_const(mut self, const_e: f64) -> Self {
        self.const_e = const_e;
        self
    }

    /// Number of sites.
    pub fn n_sites(&self) -> usize { self.sites.len() }

    /// Operator matrix of site `k`.
    pub fn site(&self, k: usize) -> &MpoSite { &self.sites[k] }

    /// Physical labels of site `k`.
    pub fn basis(&self, k: usize) -> &[Sector] { &self.sites[k].phys }

    /// Physical labels of all sites.
    pub fn bases(&self) -> Vec<Vec<Sector>> {
        self.sites.iter().map(|s| s.phys.clone()).collect()
    }

    /// Operator matrix of the window `[i, i + dot - 1]`, fused.
    pub fn window(&self, i: usize, dot: usize) -> MpoResult<MpoSite> {
        let n = self.sites.len();
        if dot == 0 || i + dot > n { return Err(WindowOutOfRange(i, dot, n)); }
        let mut acc = self.sites[i].clone();
        for k in i + 1..i + dot {
            acc = acc.fuse(&self.sites[k]);
        }
        Ok(acc)
    }

    /// The full operator as a dense matrix over the product basis, with state
    /// index `Σ_k s_k d^k`, including the constant shift.
    ///
    /// *Only for small chains.*
    pub fn dense_matrix(&self) -> na::DMatrix<f64> {
        let Some(first) = self.sites.first() else {
            return na::DMatrix::from_element(1, 1, self.const_e);
        };
        let mut acc: Vec<Option<na::DMatrix<f64>>> = vec![None; first.right_dim];
        for t in first.terms.iter().filter(|t| t.left == 0) {
            add_into(&mut acc[t.right], t.op.clone());
        }
        for site in self.sites.iter().skip(1) {
            let mut next: Vec<Option<na::DMatrix<f64>>> = vec![None; site.right_dim];
            for t in site.terms.iter() {
                if let Some(prev) = &acc[t.left] {
                    add_into(&mut next[t.right], t.op.kronecker(prev));
                }
            }
            acc = next;
        }
        let dim: usize = self.sites.iter().map(|s| s.phys.len()).product();
        let mut h =
            acc.into_iter().next().flatten()
            .unwrap_or_else(|| na::DMatrix::zeros(dim, dim));
        for k in 0..dim { h[(k, k)] += self.const_e; }
        h
    }
}

fn add_into(slot: &mut Option<na::DMatrix<f64>>, op: na::DMatrix<f64>) {
    match slot {
        Some(prev) => { *prev += op; },
        None => { *slot = Some(op); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_site_heisenberg_is_singlet_triplet() {
        let h = Mpo::heisenberg(2, 1.0, 1.0, 0.0).dense_matrix();
        let mut eigs: Vec<f64> = h.symmetric_eigen().eigenvalues.iter().copied().collect();
        eigs.sort_by(|a, b| a.total_cmp(b));
        assert!((eigs[0] + 0.75).abs() < 1e-12);
        for e in eigs[1..].iter() { assert!((e - 0.25).abs() < 1e-12); }
    }

    #[test]
    fn hubbard_dimer_at_half_filling() {
        // ground state energy of the two-site Hubbard model with two electrons
        let (t, u) = (1.0, 4.0);
        let h = Mpo::hubbard(2, t, u, 0.0).dense_matrix();
        assert!((&h - h.transpose()).norm() < 1e-12);
        let basis = ops::fermion_basis();
        let idx: Vec<usize> =
            (0..16)
            .filter(|s| basis[s % 4] + basis[s / 4] == Sector(2))
            .collect();
        let sub = h.select_rows(idx.iter()).select_columns(idx.iter());
        let e0 =
            sub.symmetric_eigen().eigenvalues.iter().copied()
            .fold(f64::INFINITY, f64::min);
        let exact = 0.5 * (u - (u * u + 16.0 * t * t).sqrt());
        assert!((e0 - exact).abs() < 1e-10);
    }

    #[test]
    fn window_matches_dense_contraction() {
        let mpo = Mpo::heisenberg(3, 1.0, 0.5, 0.2);
        let w = mpo.window(0, 3).unwrap();
        assert_eq!((w.left_dim, w.right_dim), (1, 1));
        assert_eq!(w.terms.len(), 1);
        assert!((&w.terms[0].op - mpo.dense_matrix()).norm() < 1e-12);
        assert!(mpo.window(2, 2).is_err());
    }

    #[test]
    fn identity_is_identity() {
        let mpo = Mpo::identity(&[ops::spin_half_basis(), ops::spin_half_basis()]);
        assert_eq!(mpo.dense_matrix(), na::DMatrix::identity(4, 4));
    }
}
