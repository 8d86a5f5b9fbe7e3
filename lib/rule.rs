//! Named operator descriptors and equivalence rules between them.
//!
//! An operator network refers to its terms through [`OpElement`]s: a name, a
//! list of site indices (with one spin bit per site), a quantum-number label
//! and a scalar factor. Many descriptors are redundant, in the sense that they
//! are a transpose or a signed copy of another descriptor. An [`OpRule`] maps
//! a redundant descriptor to its canonical equivalent, so that only canonical
//! terms need to be represented or evaluated:
//! ```text
//! op  ==>  Some(OpElementRef { op: canonical, trans, factor })
//!            op = factor * (trans ? canonical^T : canonical)
//! op  ==>  None   (op is already canonical)
//! ```

use std::fmt;
use serde::{ Deserialize, Serialize };
use crate::quantum::Sector;

/// Operator names understood by the rules in this module.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub enum OpNames {
    /// Hamiltonian.
    H,
    /// Identity.
    I,
    /// Creation operator.
    C,
    /// Annihilation operator.
    D,
    /// Complementary operator paired with `C`.
    R,
    /// Complementary operator paired with `D`.
    RD,
    /// Two creation operators.
    A,
    /// Two annihilation operators.
    AD,
    /// Complementary operator paired with `AD`.
    P,
    /// Complementary operator paired with `A`.
    PD,
    /// One creation and one annihilation operator.
    B,
    /// Adjoint of `B`.
    BD,
    /// Complementary operator paired with `B`.
    Q,
    /// One-particle density matrix element `c†_i c_j`.
    PDM1,
    /// Two-particle density matrix element `c†_i c†_j c_k c_l`.
    PDM2,
    /// Number-projected correlation `n_i n_j`.
    NPC1,
}

/// Site indices of an operator descriptor, with one spin bit per site.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub struct SiteIndex {
    sites: Vec<u16>,
    spins: Vec<u8>,
}

impl SiteIndex {
    /// Create a new site index from `(site, spin)` pairs.
    pub fn new<I>(pairs: I) -> Self
    where I: IntoIterator<Item = (u16, u8)>
    {
        let (sites, spins) = pairs.into_iter().unzip();
        Self { sites, spins }
    }

    /// Number of sites referenced.
    pub fn len(&self) -> usize { self.sites.len() }

    /// Return `true` if no sites are referenced.
    pub fn is_empty(&self) -> bool { self.sites.is_empty() }

    /// Return the `k`-th site.
    pub fn site(&self, k: usize) -> usize { self.sites[k] as usize }

    /// Return the `k`-th spin bit.
    pub fn spin(&self, k: usize) -> u8 { self.spins[k] }

    /// Return the `k`-th `(site, spin)` pair.
    pub fn pair(&self, k: usize) -> (u16, u8) { (self.sites[k], self.spins[k]) }

    /// Reverse the order of sites (and spins).
    pub fn flip(&self) -> Self {
        Self {
            sites: self.sites.iter().rev().copied().collect(),
            spins: self.spins.iter().rev().copied().collect(),
        }
    }

    /// Swap the `a`-th and `b`-th entries.
    pub fn swapped(&self, a: usize, b: usize) -> Self {
        let mut new = self.clone();
        new.sites.swap(a, b);
        new.spins.swap(a, b);
        new
    }
}

impl fmt::Display for SiteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (k, (i, s)) in self.sites.iter().zip(&self.spins).enumerate() {
            if k > 0 { write!(f, ",")?; }
            write!(f, "{}{}", i, if *s == 0 { "a" } else { "b" })?;
        }
        write!(f, "]")
    }
}

/// A named operator descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpElement {
    pub name: OpNames,
    pub site_index: SiteIndex,
    pub q_label: Sector,
    pub factor: f64,
}

impl OpElement {
    pub fn new(name: OpNames, site_index: SiteIndex, q_label: Sector) -> Self {
        Self { name, site_index, q_label, factor: 1.0 }
    }

    fn with(&self, name: OpNames, site_index: SiteIndex, q_label: Sector)
        -> Self
    {
        Self { name, site_index, q_label, factor: self.factor }
    }
}

impl fmt::Display for OpElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factor != 1.0 { write!(f, "({}) ", self.factor)?; }
        write!(f, "{:?}{}", self.name, self.site_index)
    }
}

/// Reference to a canonical descriptor, with a transpose flag and a scalar
/// factor.
#[derive(Clone, Debug, PartialEq)]
pub struct OpElementRef {
    pub op: OpElement,
    pub trans: bool,
    pub factor: f64,
}

impl OpElementRef {
    fn new(op: OpElement, trans: bool, factor: f64) -> Self {
        Self { op, trans, factor }
    }
}

/// An equivalence rule between operator descriptors.
pub trait OpRule {
    /// Return the canonical equivalent of `op`, or `None` if `op` is already
    /// canonical under this rule.
    fn equivalent(&self, op: &OpElement) -> Option<OpElementRef>;

    /// Follow [`equivalent`][Self::equivalent] until a canonical descriptor is
    /// reached, accumulating transpose flags and factors.
    fn canonical(&self, op: &OpElement) -> OpElementRef {
        let mut cur = OpElementRef::new(op.clone(), false, 1.0);
        while let Some(next) = self.equivalent(&cur.op) {
            cur = OpElementRef::new(
                next.op, cur.trans ^ next.trans, cur.factor * next.factor);
        }
        cur
    }
}

/// Equivalence rules for quantum-chemistry operator networks with
/// non-spin-adapted (*S*<sup>*z*</sup>) quantum numbers.
///
/// Each group of rules can be switched off individually.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RuleQc {
    mask: u8,
}

impl Default for RuleQc {
    fn default() -> Self { Self::new(true, true, true, true, true, true) }
}

impl RuleQc {
    const D: u8 = 0;
    const R: u8 = 1;
    const A: u8 = 2;
    const P: u8 = 3;
    const B: u8 = 4;
    const Q: u8 = 5;

    /// Enable the `D → C`, `RD → R`, `A`/`AD`, `P`/`PD`, `B`/`BD` and `Q`
    /// groups of rules.
    pub fn new(d: bool, r: bool, a: bool, p: bool, b: bool, q: bool) -> Self {
        let mask =
            ((d as u8) << Self::D)
            | ((r as u8) << Self::R)
            | ((a as u8) << Self::A)
            | ((p as u8) << Self::P)
            | ((b as u8) << Self::B)
            | ((q as u8) << Self::Q);
        Self { mask }
    }

    fn on(&self, group: u8) -> bool { self.mask & (1 << group) != 0 }
}

impl OpRule for RuleQc {
    fn equivalent(&self, op: &OpElement) -> Option<OpElementRef> {
        use OpNames::*;
        let idx = &op.site_index;
        let q = op.q_label;
        let ordered = || idx.len() >= 2 && idx.site(0) <= idx.site(1);
        let reversed = || idx.len() >= 2 && idx.site(0) > idx.site(1);
        match op.name {
            D if self.on(Self::D) =>
                Some(OpElementRef::new(op.with(C, idx.clone(), -q), true, 1.0)),
            RD if self.on(Self::R) =>
                Some(OpElementRef::new(op.with(R, idx.clone(), -q), true, 1.0)),
            A | P if reversed()
                && self.on(if op.name == A { Self::A } else { Self::P }) =>
                Some(OpElementRef::new(
                    op.with(op.name, idx.flip(), q), false, -1.0)),
            AD | PD if self.on(if op.name == AD { Self::A } else { Self::P }) => {
                let target = if op.name == AD { A } else { P };
                if ordered() {
                    Some(OpElementRef::new(
                        op.with(target, idx.clone(), -q), true, 1.0))
                } else {
                    Some(OpElementRef::new(
                        op.with(target, idx.flip(), -q), true, -1.0))
                }
            },
            B if reversed() && self.on(Self::B) =>
                Some(OpElementRef::new(op.with(B, idx.flip(), -q), true, 1.0)),
            // BD with i == j has no B equivalent
            BD if self.on(Self::B)
                && idx.len() >= 2
                && idx.site(0) != idx.site(1) =>
            {
                if idx.site(0) < idx.site(1) {
                    Some(OpElementRef::new(
                        op.with(B, idx.clone(), -q), true, -1.0))
                } else {
                    Some(OpElementRef::new(
                        op.with(B, idx.flip(), q), false, -1.0))
                }
            },
            Q if reversed() && self.on(Self::Q) =>
                Some(OpElementRef::new(op.with(Q, idx.flip(), -q), true, 1.0)),
            _ => None,
        }
    }
}

/// Equivalence rules between density-matrix descriptors of a real-valued
/// state.
///
/// * `PDM1[i,j]` with `i > j` is the transpose of `PDM1[j,i]`.
/// * `PDM2[i,j,k,l]` is antisymmetric in `(i, j)` and in `(k, l)`; the
///   canonical descriptor has both pairs in ascending order.
/// * `NPC1[i,j]` with `i > j` equals `NPC1[j,i]`.
///
/// Ordering is on `(site, spin)` pairs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PdmRule;

impl OpRule for PdmRule {
    fn equivalent(&self, op: &OpElement) -> Option<OpElementRef> {
        use OpNames::*;
        let idx = &op.site_index;
        match op.name {
            PDM1 if idx.pair(0) > idx.pair(1) =>
                Some(OpElementRef::new(
                    op.with(PDM1, idx.flip(), -op.q_label), true, 1.0)),
            NPC1 if idx.pair(0) > idx.pair(1) =>
                Some(OpElementRef::new(
                    op.with(NPC1, idx.flip(), op.q_label), false, 1.0)),
            PDM2 if idx.pair(0) > idx.pair(1) =>
                Some(OpElementRef::new(
                    op.with(PDM2, idx.swapped(0, 1), op.q_label), false, -1.0)),
            PDM2 if idx.pair(2) > idx.pair(3) =>
                Some(OpElementRef::new(
                    op.with(PDM2, idx.swapped(2, 3), op.q_label), false, -1.0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: OpNames, pairs: &[(u16, u8)], q: i32) -> OpElement {
        OpElement::new(name, SiteIndex::new(pairs.iter().copied()), Sector(q))
    }

    #[test]
    fn qc_d_maps_to_transposed_c() {
        let rule = RuleQc::default();
        let r = rule.equivalent(&op(OpNames::D, &[(3, 1)], -1)).unwrap();
        assert_eq!(r.op.name, OpNames::C);
        assert_eq!(r.op.q_label, Sector(1));
        assert!(r.trans);
        assert_eq!(r.factor, 1.0);
    }

    #[test]
    fn qc_a_is_antisymmetric() {
        let rule = RuleQc::default();
        assert!(rule.equivalent(&op(OpNames::A, &[(1, 0), (2, 1)], 2)).is_none());
        let r = rule.equivalent(&op(OpNames::A, &[(2, 1), (1, 0)], 2)).unwrap();
        assert_eq!(r.op.site_index, SiteIndex::new([(1, 0), (2, 1)]));
        assert!(!r.trans);
        assert_eq!(r.factor, -1.0);
    }

    #[test]
    fn qc_ad_maps_to_a() {
        let rule = RuleQc::default();
        let r = rule.equivalent(&op(OpNames::AD, &[(0, 0), (1, 0)], -2)).unwrap();
        assert_eq!((r.op.name, r.trans, r.factor), (OpNames::A, true, 1.0));
        assert_eq!(r.op.q_label, Sector(2));
        let r = rule.equivalent(&op(OpNames::AD, &[(1, 0), (0, 0)], -2)).unwrap();
        assert_eq!((r.op.name, r.trans, r.factor), (OpNames::A, true, -1.0));
        assert_eq!(r.op.site_index, SiteIndex::new([(0, 0), (1, 0)]));
    }

    #[test]
    fn qc_bd_on_same_site_is_kept() {
        let rule = RuleQc::default();
        assert!(rule.equivalent(&op(OpNames::BD, &[(2, 0), (2, 1)], 0)).is_none());
        let r = rule.equivalent(&op(OpNames::BD, &[(1, 0), (2, 0)], 0)).unwrap();
        assert_eq!((r.op.name, r.trans, r.factor), (OpNames::B, true, -1.0));
        let r = rule.equivalent(&op(OpNames::BD, &[(2, 0), (1, 0)], 0)).unwrap();
        assert_eq!((r.op.name, r.trans, r.factor), (OpNames::B, false, -1.0));
        assert_eq!(r.op.site_index, SiteIndex::new([(1, 0), (2, 0)]));
    }

    #[test]
    fn qc_mask_disables_groups() {
        let rule = RuleQc::new(false, true, true, true, true, false);
        assert!(rule.equivalent(&op(OpNames::D, &[(0, 0)], -1)).is_none());
        assert!(rule.equivalent(&op(OpNames::Q, &[(3, 0), (1, 0)], 0)).is_none());
        assert!(rule.equivalent(&op(OpNames::RD, &[(0, 0)], 1)).is_some());
    }

    #[test]
    fn pdm2_canonical_accumulates_signs() {
        let rule = PdmRule;
        let r = rule.canonical(&op(OpNames::PDM2, &[(2, 0), (1, 0), (3, 1), (0, 1)], 0));
        assert_eq!(r.op.site_index, SiteIndex::new([(1, 0), (2, 0), (0, 1), (3, 1)]));
        assert_eq!(r.factor, 1.0);
        assert!(!r.trans);
        let r = rule.canonical(&op(OpNames::PDM2, &[(2, 0), (1, 0), (0, 1), (3, 1)], 0));
        assert_eq!(r.factor, -1.0);
    }
}
