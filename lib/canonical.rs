//! Per-site canonical-form tags and the transitions a sweep applies to them.
//!
//! Every site of an [`Mps`][crate::mps::Mps] carries a one-letter tag:
//!
//! | tag | meaning |
//! |-----|---------|
//! | `L` | left-normalized |
//! | `R` | right-normalized |
//! | `C` | center (the active site of a two-site window, or a fresh center) |
//! | `K` | one-site wavefunction, physical index fused left |
//! | `S` | one-site wavefunction, physical index fused right |
//! | `J` | multi-state `K` |
//! | `T` | multi-state `S` |
//! | `M` | multi-state `C` |
//!
//! Between updates, all sites to the left of the active region are `L` and all
//! sites to the right are `R`:
//! ```text
//!  L L L L K R R R        (one-site, active site 4)
//!  L L L C R R R R        (two-site, window 3..=4)
//! ```
//! Any other arrangement met during a sweep is a representation fault.

use std::{ fmt, str::FromStr };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::tensor::FuseSide;

#[derive(Debug, Error)]
pub enum CanonicalError {
    /// Returned when a tag is met at a position or direction where it is not
    /// allowed.
    #[error("error in canonical form: unexpected tag '{tag}' at site {site} ({context})")]
    InvalidTag { site: usize, tag: char, context: &'static str },

    /// Returned when a tag string contains an unknown character.
    #[error("error in canonical form: unknown tag '{0}'")]
    UnknownTag(char),

    /// Returned when a site index is out of range.
    #[error("error in canonical form: site {0} out of range for {1} sites")]
    OutOfRange(usize, usize),
}
use CanonicalError::*;
pub type CanonicalResult<T> = Result<T, CanonicalError>;

/// The canonical-form tag of a single site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalForm {
    Left,
    Right,
    Center,
    LeftFused,
    RightFused,
    MultiLeftFused,
    MultiRightFused,
    MultiCenter,
}

impl CanonicalForm {
    /// Return the one-letter tag.
    pub fn to_char(self) -> char {
        match self {
            Self::Left => 'L',
            Self::Right => 'R',
            Self::Center => 'C',
            Self::LeftFused => 'K',
            Self::RightFused => 'S',
            Self::MultiLeftFused => 'J',
            Self::MultiRightFused => 'T',
            Self::MultiCenter => 'M',
        }
    }

    /// Parse a one-letter tag.
    pub fn from_char(c: char) -> CanonicalResult<Self> {
        match c {
            'L' => Ok(Self::Left),
            'R' => Ok(Self::Right),
            'C' => Ok(Self::Center),
            'K' => Ok(Self::LeftFused),
            'S' => Ok(Self::RightFused),
            'J' => Ok(Self::MultiLeftFused),
            'T' => Ok(Self::MultiRightFused),
            'M' => Ok(Self::MultiCenter),
            c => Err(UnknownTag(c)),
        }
    }

    /// The center tag, single- or multi-state.
    pub fn center(multi: bool) -> Self {
        if multi { Self::MultiCenter } else { Self::Center }
    }

    /// The fused one-site wavefunction tag, single- or multi-state.
    pub fn fused(side: FuseSide, multi: bool) -> Self {
        match (side, multi) {
            (FuseSide::Left, false) => Self::LeftFused,
            (FuseSide::Right, false) => Self::RightFused,
            (FuseSide::Left, true) => Self::MultiLeftFused,
            (FuseSide::Right, true) => Self::MultiRightFused,
        }
    }

    /// Return `true` for `L` and `R`.
    pub fn is_normalized(self) -> bool {
        matches!(self, Self::Left | Self::Right)
    }

    /// Return `true` for the multi-state tags.
    pub fn is_multi(self) -> bool {
        matches!(
            self,
            Self::MultiLeftFused | Self::MultiRightFused | Self::MultiCenter
        )
    }

    /// Return `true` for the center tags.
    pub fn is_center(self) -> bool {
        matches!(self, Self::Center | Self::MultiCenter)
    }

    /// Return the fused side of a one-site wavefunction tag.
    pub fn fused_side(self) -> Option<FuseSide> {
        match self {
            Self::LeftFused | Self::MultiLeftFused => Some(FuseSide::Left),
            Self::RightFused | Self::MultiRightFused => Some(FuseSide::Right),
            _ => None,
        }
    }
}

impl fmt::Display for CanonicalForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// Tags for a whole chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalForms(Vec<CanonicalForm>);

impl CanonicalForms {
    /// Tags for an MPS of `n` sites with its center at `center`: `L` to the
    /// left, `R` to the right.
    pub fn with_center(n: usize, center: usize, multi: bool) -> Self {
        let tags =
            (0..n)
            .map(|k| {
                if k < center {
                    CanonicalForm::Left
                } else if k == center {
                    CanonicalForm::center(multi)
                } else {
                    CanonicalForm::Right
                }
            })
            .collect();
        Self(tags)
    }

    /// Number of sites.
    pub fn len(&self) -> usize { self.0.len() }

    /// Return `true` if there are no sites.
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Return the tag of site `k`.
    pub fn get(&self, k: usize) -> CanonicalForm { self.0[k] }

    /// Overwrite the tag of site `k`.
    pub fn set(&mut self, k: usize, tag: CanonicalForm) { self.0[k] = tag; }

    /// Return the tags as a slice.
    pub fn as_slice(&self) -> &[CanonicalForm] { &self.0 }

    fn fault(&self, site: usize, context: &'static str) -> CanonicalError {
        InvalidTag { site, tag: self.0[site].to_char(), context }
    }

    fn check_site(&self, k: usize) -> CanonicalResult<()> {
        if k < self.0.len() { Ok(()) } else { Err(OutOfRange(k, self.0.len())) }
    }

    /// Bring the active site of a one-site update into a fused form.
    ///
    /// A center tag is only allowed at the chain ends, where it becomes `K`
    /// (site 0) or `S` (last site). Returns the fused side of the wavefunction
    /// after conversion.
    pub fn prepare_one_dot(&mut self, i: usize, multi: bool)
        -> CanonicalResult<FuseSide>
    {
        self.check_site(i)?;
        let n = self.0.len();
        let tag = self.0[i];
        if tag.is_multi() != multi && !tag.is_normalized() {
            return Err(self.fault(i, "state count mismatch"));
        }
        if tag.is_center() {
            if i == 0 {
                self.0[i] = CanonicalForm::fused(FuseSide::Left, multi);
            } else if i == n - 1 {
                self.0[i] = CanonicalForm::fused(FuseSide::Right, multi);
            } else {
                return Err(self.fault(i, "center tag inside the chain in one-site mode"));
            }
        }
        self.0[i].fused_side()
            .ok_or_else(|| self.fault(i, "one-site update of a normalized site"))
    }

    /// Record that the one-site wavefunction at `i` has been re-fused.
    pub fn swap_fused(&mut self, i: usize, side: FuseSide) -> CanonicalResult<()> {
        self.check_site(i)?;
        let tag = self.0[i];
        if tag.fused_side().is_none() {
            return Err(self.fault(i, "fuse swap of a non-wavefunction site"));
        }
        self.0[i] = CanonicalForm::fused(side, tag.is_multi());
        Ok(())
    }

    /// Check the window `(i, i + 1)` of a two-site update and return the
    /// offset (0 or 1) of the site holding the wavefunction.
    pub fn prepare_two_dot(&self, i: usize, multi: bool)
        -> CanonicalResult<usize>
    {
        self.check_site(i + 1)?;
        let (a, b) = (self.0[i], self.0[i + 1]);
        let is_wfn = |t: CanonicalForm| !t.is_normalized() && t.is_multi() == multi;
        if is_wfn(a) && b == CanonicalForm::Right {
            Ok(0)
        } else if a == CanonicalForm::Left && is_wfn(b) {
            Ok(1)
        } else if is_wfn(a) {
            Err(self.fault(i + 1, "two-site window partner must be 'R'"))
        } else {
            Err(self.fault(i, "two-site window without a wavefunction"))
        }
    }

    /// Advance the tags after the site(s) starting at `i` have been
    /// decomposed.
    ///
    /// One-site, forward: `i → L`, `i + 1 → S` (`K` at the last site).
    /// One-site, backward: `i → R`, `i - 1 → K` (`S` at site 0).
    /// Two-site, forward: `(i, i + 1) → (L, C)`; backward: `(C, R)`.
    pub fn advance(&mut self, i: usize, forward: bool, dot: usize, multi: bool)
        -> CanonicalResult<()>
    {
        let n = self.0.len();
        match dot {
            1 => {
                self.check_site(i)?;
                if self.0[i].is_normalized() {
                    return Err(self.fault(i, "advance from a normalized site"));
                }
                if forward {
                    if i + 1 < n {
                        self.0[i] = CanonicalForm::Left;
                        self.0[i + 1] =
                            CanonicalForm::fused(FuseSide::Right, multi);
                    } else {
                        self.0[i] = CanonicalForm::fused(FuseSide::Left, multi);
                    }
                } else if i > 0 {
                    self.0[i] = CanonicalForm::Right;
                    self.0[i - 1] = CanonicalForm::fused(FuseSide::Left, multi);
                } else {
                    self.0[i] = CanonicalForm::fused(FuseSide::Right, multi);
                }
            },
            2 => {
                self.check_site(i + 1)?;
                if forward {
                    self.0[i] = CanonicalForm::Left;
                    self.0[i + 1] = CanonicalForm::center(multi);
                } else {
                    self.0[i] = CanonicalForm::center(multi);
                    self.0[i + 1] = CanonicalForm::Right;
                }
            },
            _ => { return Err(self.fault(i, "unsupported dot width")); },
        }
        Ok(())
    }

    /// Return `true` if every site of `range_lo..range_hi` left of `lo` is `L`
    /// and every site right of `hi` is `R`.
    pub fn is_gauged_within(
        &self,
        lo: usize,
        hi: usize,
        range_lo: usize,
        range_hi: usize,
    ) -> bool
    {
        self.0[range_lo..lo].iter().all(|t| *t == CanonicalForm::Left)
            && self.0[hi + 1..range_hi].iter().all(|t| *t == CanonicalForm::Right)
    }

    /// Return `true` if every site left of `lo` is `L` and every site right of
    /// `hi` is `R`.
    pub fn is_gauged(&self, lo: usize, hi: usize) -> bool {
        self.is_gauged_within(lo, hi, 0, self.0.len())
    }
}

impl fmt::Display for CanonicalForms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|t| write!(f, "{}", t.to_char()))
    }
}

impl FromStr for CanonicalForms {
    type Err = CanonicalError;

    fn from_str(s: &str) -> CanonicalResult<Self> {
        s.chars()
            .map(CanonicalForm::from_char)
            .collect::<CanonicalResult<Vec<_>>>()
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(s: &str) -> CanonicalForms { s.parse().unwrap() }

    #[test]
    fn one_site_boundaries() {
        let mut f = tags("CRRR");
        assert_eq!(f.prepare_one_dot(0, false).unwrap(), FuseSide::Left);
        assert_eq!(f.to_string(), "KRRR");
        let mut f = tags("LLLC");
        assert_eq!(f.prepare_one_dot(3, false).unwrap(), FuseSide::Right);
        assert_eq!(f.to_string(), "LLLS");
        let mut f = tags("LCRR");
        assert!(f.prepare_one_dot(1, false).is_err());
    }

    #[test]
    fn one_site_forward_sweep_keeps_gauge() {
        let mut f = tags("KRRRR");
        for i in 0..5 {
            f.prepare_one_dot(i, false).unwrap();
            f.advance(i, true, 1, false).unwrap();
            let hi = (i + 1).min(4);
            assert!(f.is_gauged(hi, hi), "{f}");
        }
        assert_eq!(f.to_string(), "LLLLK");
    }

    #[test]
    fn one_site_backward_sweep_ends_right_fused() {
        let mut f = tags("LLLLK");
        for i in (0..5).rev() {
            f.advance(i, false, 1, false).unwrap();
        }
        assert_eq!(f.to_string(), "SRRRR");
    }

    #[test]
    fn two_site_windows() {
        let mut f = tags("CRRR");
        for i in 0..3 {
            assert_eq!(f.prepare_two_dot(i, false).unwrap(), 0);
            f.advance(i, true, 2, false).unwrap();
            assert!(f.is_gauged(i + 1, i + 1));
        }
        assert_eq!(f.to_string(), "LLLC");
        for i in (0..3).rev() {
            assert_eq!(f.prepare_two_dot(i, false).unwrap(), 1);
            f.advance(i, false, 2, false).unwrap();
            assert!(f.is_gauged(i, i));
        }
        assert_eq!(f.to_string(), "CRRR");
        assert!(tags("CLRR").prepare_two_dot(0, false).is_err());
        assert!(tags("LRRR").prepare_two_dot(0, false).is_err());
    }

    #[test]
    fn multi_state_letters() {
        let mut f = tags("MRR");
        assert_eq!(f.prepare_one_dot(0, true).unwrap(), FuseSide::Left);
        assert_eq!(f.to_string(), "JRR");
        f.advance(0, true, 1, true).unwrap();
        assert_eq!(f.to_string(), "LTR");
        assert!(tags("CRR").prepare_one_dot(0, true).is_err());
    }
}
