//! Abelian quantum-number labels attached to bond and physical indices.
//!
//! Every basis state of a bond or physical index carries a [`Sector`]. Labels
//! are accumulated from the left end of the chain: the left boundary bond
//! carries the vacuum label, and the label of a right bond state is the label
//! of the left bond state plus that of the physical state,
//! ```text
//!  l(u)        r(v) = l(u) + q(s)
//! ----- A[u,s,v] -----
//!          |
//!          | q(s)
//! ```
//! so that the right boundary bond carries the target label of the whole
//! state.

use std::{
    fmt,
    ops::{ Add, AddAssign, Neg, Sub },
};
use serde::{ Deserialize, Serialize };

/// A U(1)-like quantum number (e.g. particle number or twice the total
/// *S*<sup>*z*</sup>).
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize,
)]
pub struct Sector(pub i32);

impl Sector {
    /// The vacuum label.
    pub const VACUUM: Self = Self(0);
}

impl Add for Sector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self { Self(self.0 + rhs.0) }
}

impl AddAssign for Sector {
    fn add_assign(&mut self, rhs: Self) { self.0 += rhs.0; }
}

impl Sub for Sector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self { Self(self.0 - rhs.0) }
}

impl Neg for Sector {
    type Output = Self;

    fn neg(self) -> Self { Self(-self.0) }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Group the positions of `labels` by label, in order of first appearance of
/// each label.
pub(crate) fn group_by_sector(labels: &[Sector]) -> Vec<(Sector, Vec<usize>)> {
    let mut groups: Vec<(Sector, Vec<usize>)> = Vec::new();
    for (k, q) in labels.iter().enumerate() {
        match groups.iter_mut().find(|(p, _)| p == q) {
            Some((_, idx)) => { idx.push(k); },
            None => { groups.push((*q, vec![k])); },
        }
    }
    groups
}
