//! Local operators on a single site and products of them across the chain.
//!
//! Two local bases are provided:
//! * spin-1/2, with basis `∣↑⟩, ∣↓⟩` labeled by 2*S*<sup>*z*</sup> = `+1, -1`;
//! * spinful fermions, with basis `∣0⟩, ∣↑⟩, ∣↓⟩, ∣↑↓⟩ = c†↑ c†↓ ∣0⟩` labeled
//!   by particle number.
//!
//! Fermionic operators act on the full chain through Jordan-Wigner strings,
//! with modes ordered `(0↑, 0↓, 1↑, 1↓, ...)`. The local annihilators returned
//! here already include the on-site part of the string, so that
//! ```text
//! c_{k,σ} = P_0 ⊗ P_1 ⊗ ... ⊗ P_{k-1} ⊗ a_σ ⊗ I ⊗ ...
//! ```
//! where `P = (-1)^n` is the local parity.

use nalgebra as na;
use once_cell::sync::Lazy;
use crate::quantum::Sector;

/// Spin-1/2 basis labels.
pub fn spin_half_basis() -> Vec<Sector> { vec![Sector(1), Sector(-1)] }

/// Spinful fermion basis labels (particle number).
pub fn fermion_basis() -> Vec<Sector> {
    vec![Sector(0), Sector(1), Sector(1), Sector(2)]
}

fn make_splus() -> na::DMatrix<f64> {
    na::dmatrix!(
        0.0, 1.0;
        0.0, 0.0;
    )
}

fn make_sminus() -> na::DMatrix<f64> { make_splus().transpose() }

fn make_sz() -> na::DMatrix<f64> {
    na::DMatrix::from_diagonal(&na::dvector![0.5, -0.5])
}

fn make_c_up() -> na::DMatrix<f64> {
    let mut a = na::DMatrix::zeros(4, 4);
    a[(0, 1)] = 1.0;
    a[(2, 3)] = 1.0;
    a
}

fn make_c_dn() -> na::DMatrix<f64> {
    let mut a = na::DMatrix::zeros(4, 4);
    a[(0, 2)] = 1.0;
    a[(1, 3)] = -1.0;
    a
}

fn make_parity() -> na::DMatrix<f64> {
    na::DMatrix::from_diagonal(&na::dvector![1.0, -1.0, -1.0, 1.0])
}

/// Lazy-static spin raising operator.
pub static SPLUS: Lazy<na::DMatrix<f64>> = Lazy::new(make_splus);
/// Lazy-static spin lowering operator.
pub static SMINUS: Lazy<na::DMatrix<f64>> = Lazy::new(make_sminus);
/// Lazy-static *S*<sup>*z*</sup>.
pub static SZ: Lazy<na::DMatrix<f64>> = Lazy::new(make_sz);
/// Lazy-static on-site annihilator for spin up.
pub static C_UP: Lazy<na::DMatrix<f64>> = Lazy::new(make_c_up);
/// Lazy-static on-site annihilator for spin down, including the on-site
/// string.
pub static C_DN: Lazy<na::DMatrix<f64>> = Lazy::new(make_c_dn);
/// Lazy-static local fermion parity.
pub static PARITY: Lazy<na::DMatrix<f64>> = Lazy::new(make_parity);

/// On-site annihilator for spin `spin` (0 = up, 1 = down).
pub fn annihilator(spin: u8) -> &'static na::DMatrix<f64> {
    if spin == 0 { Lazy::force(&C_UP) } else { Lazy::force(&C_DN) }
}

/// On-site number operator for spin `spin` (0 = up, 1 = down).
pub fn number(spin: u8) -> na::DMatrix<f64> {
    let a = annihilator(spin);
    a.transpose() * a
}

/// A fermionic ladder operator `c_{site,spin}` or `c†_{site,spin}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ladder {
    pub site: usize,
    pub spin: u8,
    pub create: bool,
}

impl Ladder {
    pub fn create(site: usize, spin: u8) -> Self {
        Self { site, spin, create: true }
    }

    pub fn annihilate(site: usize, spin: u8) -> Self {
        Self { site, spin, create: false }
    }

    fn local(&self) -> na::DMatrix<f64> {
        let a = annihilator(self.spin);
        if self.create { a.transpose() } else { a.clone() }
    }
}

/// A product of local operators, `⊗_k O_k`, with identities left implicit.
#[derive(Clone, Debug, PartialEq)]
pub struct ProductOp {
    // sorted by site, no repeated sites
    pub(crate) factors: Vec<(usize, na::DMatrix<f64>)>,
}

impl ProductOp {
    /// Build a product from local factors; factors on the same site are
    /// multiplied in the given order.
    pub fn local<I>(factors: I) -> Self
    where I: IntoIterator<Item = (usize, na::DMatrix<f64>)>
    {
        let mut acc: Vec<(usize, na::DMatrix<f64>)> = Vec::new();
        for (site, op) in factors.into_iter() {
            match acc.iter_mut().find(|(k, _)| *k == site) {
                Some((_, prev)) => { *prev = &*prev * op; },
                None => { acc.push((site, op)); },
            }
        }
        acc.sort_by_key(|(k, _)| *k);
        Self { factors: acc }
    }

    /// Build the product of fermionic ladder operators, in operator order,
    /// with Jordan-Wigner strings resolved into site-local factors.
    pub fn fermionic(ops: &[Ladder]) -> Self {
        let Some(last) = ops.iter().map(|op| op.site).max() else {
            return Self { factors: Vec::new() };
        };
        let first =
            if ops.len() % 2 == 0 {
                ops.iter().map(|op| op.site).min().unwrap_or(0)
            } else {
                0
            };
        let parity = Lazy::force(&PARITY);
        let mut factors = Vec::new();
        for site in first..=last {
            let mut local = na::DMatrix::<f64>::identity(4, 4);
            for op in ops.iter() {
                if op.site == site {
                    local = local * op.local();
                } else if op.site > site {
                    local = local * parity;
                }
            }
            let is_identity =
                (&local - na::DMatrix::<f64>::identity(4, 4)).norm() < 1e-14;
            if !is_identity { factors.push((site, local)); }
        }
        Self { factors }
    }

    /// Return the `(first, last)` sites carrying a non-identity factor.
    pub fn support(&self) -> Option<(usize, usize)> {
        let first = self.factors.first()?.0;
        let last = self.factors.last()?.0;
        Some((first, last))
    }

    /// Return the factor on `site`, if not the identity.
    pub fn factor(&self, site: usize) -> Option<&na::DMatrix<f64>> {
        self.factors.iter()
            .find(|(k, _)| *k == site)
            .map(|(_, op)| op)
    }

    /// Return the factors.
    pub fn factors(&self) -> &[(usize, na::DMatrix<f64>)] { &self.factors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_creation_builds_double_occupancy() {
        let cu = annihilator(0);
        let cd = annihilator(1);
        let vac = na::dvector![1.0, 0.0, 0.0, 0.0];
        let ud = cu.transpose() * (cd.transpose() * &vac);
        assert_eq!(ud, na::dvector![0.0, 0.0, 0.0, 1.0]);
        let anti = cu * cd + cd * cu;
        assert!(anti.norm() < 1e-14);
        let canon = cu * cu.transpose() + cu.transpose() * cu;
        assert!((canon - na::DMatrix::<f64>::identity(4, 4)).norm() < 1e-14);
    }

    #[test]
    fn hopping_string_lands_on_left_site() {
        // c†_{0↑} c_{1↑}: the string from c_{1↑} sits on site 0
        let op =
            ProductOp::fermionic(&[Ladder::create(0, 0), Ladder::annihilate(1, 0)]);
        assert_eq!(op.support(), Some((0, 1)));
        let expected = annihilator(0).transpose() * &*PARITY;
        assert!((op.factor(0).unwrap() - expected).norm() < 1e-14);
        assert!((op.factor(1).unwrap() - annihilator(0)).norm() < 1e-14);
    }

    #[test]
    fn number_operators() {
        assert_eq!(number(0), na::DMatrix::from_diagonal(&na::dvector![0.0, 1.0, 0.0, 1.0]));
        assert_eq!(number(1), na::DMatrix::from_diagonal(&na::dvector![0.0, 0.0, 1.0, 1.0]));
        let same =
            ProductOp::fermionic(&[Ladder::create(2, 1), Ladder::annihilate(2, 1)]);
        assert_eq!(same.support(), Some((2, 2)));
        assert!((same.factor(2).unwrap() - number(1)).norm() < 1e-14);
    }
}
