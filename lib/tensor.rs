//! Symmetry-labeled rank-3 site tensors with fused-index bookkeeping.
//!
//! A [`SiteTensor`] holds the rank-3 tensor `A[u, s, v]` of a single site (or
//! of two sites, whose physical indices have been fused) in the chain,
//! ```text
//!  u       v
//! ---- A ----
//!      |
//!      | s
//! ```
//! where `u` and `v` are the left and right bond indices and `s` is the
//! physical index. `nalgebra` has no rank-3 structure, so the data is kept as
//! an ordinary column-major matrix in one of two forms (see [`Fused`]):
//! `A[<us>, v]`, where `s` is fused with `u` (row `u + m·s`), or `A[u, <sv>]`,
//! where `s` is fused with `v` (column `s + d·v`). Both forms share the same
//! linear memory layout, `u + m·(s + d·v)`, so switching between them is a
//! no-copy reshape.
//!
//! Every basis state of every index carries a [`Sector`] label. Entries are
//! only allowed where `left[u] + phys[s] == right[v]`; everything else is kept
//! at zero (see [`SiteTensor::project`]).

use std::mem;
use nalgebra as na;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::quantum::Sector;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when the shape of the data matrix does not match the index
    /// labels.
    #[error("error in SiteTensor::new: data shape {0:?} inconsistent with index dimensions {1:?}")]
    IncompatibleShape((usize, usize), (usize, usize, usize)),

    /// Returned when two tensors are contracted over bonds of different
    /// dimension.
    #[error("error in SiteTensor contraction: bond dimension mismatch ({0} vs {1})")]
    BondMismatch(usize, usize),

    /// Returned when two tensors are contracted over bonds with different
    /// labels.
    #[error("error in SiteTensor contraction: bond labels do not match")]
    LabelMismatch,
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

/// Which bond index the physical index is fused with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuseSide {
    Left,
    Right,
}

/// Matrix data of a [`SiteTensor`], tagged by fusing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Fused {
    /// `A[<us>, v]`.
    Left(na::DMatrix<f64>),
    /// `A[u, <sv>]`.
    Right(na::DMatrix<f64>),
}

impl Fused {
    fn get(&self) -> &na::DMatrix<f64> {
        match self {
            Self::Left(mat) => mat,
            Self::Right(mat) => mat,
        }
    }

    fn get_mut(&mut self) -> &mut na::DMatrix<f64> {
        match self {
            Self::Left(mat) => mat,
            Self::Right(mat) => mat,
        }
    }

    fn into_inner(self) -> na::DMatrix<f64> {
        match self {
            Self::Left(mat) => mat,
            Self::Right(mat) => mat,
        }
    }
}

/// A single site tensor `A[u, s, v]` with sector labels on every index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteTensor {
    left: Vec<Sector>,
    phys: Vec<Sector>,
    right: Vec<Sector>,
    data: Fused,
}

impl SiteTensor {
    /// Create a new tensor of zeros.
    pub fn zeros(
        left: Vec<Sector>,
        phys: Vec<Sector>,
        right: Vec<Sector>,
        side: FuseSide,
    ) -> Self
    {
        let (m, d, n) = (left.len(), phys.len(), right.len());
        let data =
            match side {
                FuseSide::Left => Fused::Left(na::DMatrix::zeros(m * d, n)),
                FuseSide::Right => Fused::Right(na::DMatrix::zeros(m, d * n)),
            };
        Self { left, phys, right, data }
    }

    /// Create a new tensor from a left-fused matrix, `A[<us>, v]`.
    pub fn from_lfused(
        left: Vec<Sector>,
        phys: Vec<Sector>,
        right: Vec<Sector>,
        mat: na::DMatrix<f64>,
    ) -> TensorResult<Self>
    {
        let dims = (left.len(), phys.len(), right.len());
        if mat.shape() != (dims.0 * dims.1, dims.2) {
            return Err(IncompatibleShape(mat.shape(), dims));
        }
        Ok(Self { left, phys, right, data: Fused::Left(mat) })
    }

    /// Create a new tensor from a right-fused matrix, `A[u, <sv>]`.
    pub fn from_rfused(
        left: Vec<Sector>,
        phys: Vec<Sector>,
        right: Vec<Sector>,
        mat: na::DMatrix<f64>,
    ) -> TensorResult<Self>
    {
        let dims = (left.len(), phys.len(), right.len());
        if mat.shape() != (dims.0, dims.1 * dims.2) {
            return Err(IncompatibleShape(mat.shape(), dims));
        }
        Ok(Self { left, phys, right, data: Fused::Right(mat) })
    }

    /// Create a new tensor with uniformly random entries in `[-1, 1)` on all
    /// allowed positions.
    pub fn random<R>(
        left: Vec<Sector>,
        phys: Vec<Sector>,
        right: Vec<Sector>,
        rng: &mut R,
    ) -> Self
    where R: Rng + ?Sized
    {
        let mut new = Self::zeros(left, phys, right, FuseSide::Left);
        let (m, d, n) = new.dims();
        let data = new.as_mut_slice();
        for v in 0..n {
            for s in 0..d {
                for u in 0..m {
                    data[u + m * (s + d * v)] = rng.gen_range(-1.0..1.0);
                }
            }
        }
        new.project();
        new
    }

    /// Return the dimensions `(m, d, n)` of the left bond, physical, and right
    /// bond indices.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.left.len(), self.phys.len(), self.right.len())
    }

    /// Return the labels of the left bond index.
    pub fn left_labels(&self) -> &[Sector] { &self.left }

    /// Return the labels of the physical index.
    pub fn phys_labels(&self) -> &[Sector] { &self.phys }

    /// Return the labels of the right bond index.
    pub fn right_labels(&self) -> &[Sector] { &self.right }

    /// Return the side the physical index is currently fused to.
    pub fn fuse_side(&self) -> FuseSide {
        match self.data {
            Fused::Left(_) => FuseSide::Left,
            Fused::Right(_) => FuseSide::Right,
        }
    }

    /// Return `true` if `self` is left-fused.
    pub fn is_lfused(&self) -> bool { matches!(self.data, Fused::Left(_)) }

    /// Return `true` if `self` is right-fused.
    pub fn is_rfused(&self) -> bool { matches!(self.data, Fused::Right(_)) }

    /// Return a reference to the bare underlying matrix.
    pub fn mat(&self) -> &na::DMatrix<f64> { self.data.get() }

    /// Return the data in linear `u + m·(s + d·v)` order.
    pub fn as_slice(&self) -> &[f64] { self.data.get().as_slice() }

    /// Return the data in linear `u + m·(s + d·v)` order.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        self.data.get_mut().as_mut_slice()
    }

    /// Fuse the physical index with the left bond index.
    pub fn make_lfused(&mut self) {
        if self.is_lfused() { return; }
        let (m, d, n) = self.dims();
        let owned =
            mem::replace(&mut self.data, Fused::Left(na::DMatrix::zeros(0, 0)));
        let mat = owned.into_inner().reshape_generic(na::Dyn(m * d), na::Dyn(n));
        self.data = Fused::Left(mat);
    }

    /// Fuse the physical index with the right bond index.
    pub fn make_rfused(&mut self) {
        if self.is_rfused() { return; }
        let (m, d, n) = self.dims();
        let owned =
            mem::replace(&mut self.data, Fused::Right(na::DMatrix::zeros(0, 0)));
        let mat = owned.into_inner().reshape_generic(na::Dyn(m), na::Dyn(d * n));
        self.data = Fused::Right(mat);
    }

    /// Fuse the physical index to `side`.
    pub fn make_fused(&mut self, side: FuseSide) {
        match side {
            FuseSide::Left => self.make_lfused(),
            FuseSide::Right => self.make_rfused(),
        }
    }

    /// Return the bare matrix in left-fused form.
    pub fn into_lfused(mut self) -> na::DMatrix<f64> {
        self.make_lfused();
        self.data.into_inner()
    }

    /// Return the bare matrix in right-fused form.
    pub fn into_rfused(mut self) -> na::DMatrix<f64> {
        self.make_rfused();
        self.data.into_inner()
    }

    /// Return the data reshaped to `rows × cols` (in linear order).
    ///
    /// *Panics if `rows * cols` does not equal the number of elements.*
    pub fn reshaped(&self, rows: usize, cols: usize) -> na::DMatrix<f64> {
        na::DMatrix::from_column_slice(rows, cols, self.as_slice())
    }

    /// Return a single element.
    pub fn get(&self, u: usize, s: usize, v: usize) -> f64 {
        let (m, d, _) = self.dims();
        self.as_slice()[u + m * (s + d * v)]
    }

    /// Return `true` if the element at `(u, s, v)` is allowed by the sector
    /// labels.
    pub fn is_allowed(&self, u: usize, s: usize, v: usize) -> bool {
        self.left[u] + self.phys[s] == self.right[v]
    }

    /// Set all disallowed elements to zero.
    pub fn project(&mut self) {
        let (m, d, n) = self.dims();
        let left = &self.left;
        let phys = &self.phys;
        let right = &self.right;
        let data = self.data.get_mut().as_mut_slice();
        for v in 0..n {
            for s in 0..d {
                for u in 0..m {
                    if left[u] + phys[s] != right[v] {
                        data[u + m * (s + d * v)] = 0.0;
                    }
                }
            }
        }
    }

    /// Return the squared norm of all disallowed elements.
    pub fn leakage(&self) -> f64 {
        let (m, d, n) = self.dims();
        let data = self.as_slice();
        let mut acc = 0.0;
        for v in 0..n {
            for s in 0..d {
                for u in 0..m {
                    if !self.is_allowed(u, s, v) {
                        acc += data[u + m * (s + d * v)].powi(2);
                    }
                }
            }
        }
        acc
    }

    /// Return `true` if `self` and `other` have identical index labels.
    pub fn same_space(&self, other: &Self) -> bool {
        self.left == other.left
            && self.phys == other.phys
            && self.right == other.right
    }

    /// Return a new tensor of zeros with the same labels and fusing.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(
            self.left.clone(),
            self.phys.clone(),
            self.right.clone(),
            self.fuse_side(),
        )
    }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 { self.mat().norm() }

    /// Inner product with another tensor of the same shape.
    pub fn dot(&self, other: &Self) -> f64 {
        self.as_slice().iter().zip(other.as_slice())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Multiply all elements by `a`.
    pub fn scale(&mut self, a: f64) { self.data.get_mut().scale_mut(a); }

    /// `self += a * x`.
    pub fn axpy(&mut self, a: f64, x: &Self) {
        self.as_mut_slice().iter_mut().zip(x.as_slice())
            .for_each(|(y, xk)| { *y += a * xk; });
    }

    /// Copy the data out into a flat vector.
    pub fn to_vector(&self) -> na::DVector<f64> {
        na::DVector::from_column_slice(self.as_slice())
    }

    /// Overwrite the data with the contents of a flat vector.
    pub fn set_from_vector(&mut self, vec: &na::DVector<f64>) {
        self.as_mut_slice().copy_from_slice(vec.as_slice());
    }

    /// Return a copy of `self` with its data replaced by `vec`.
    pub fn with_vector(&self, vec: &na::DVector<f64>) -> Self {
        let mut new = self.clone();
        new.set_from_vector(vec);
        new
    }

    /// Return the `m × n` matrix `A[:, s, :]` for every physical state `s`.
    pub fn phys_slices(&self) -> Vec<na::DMatrix<f64>> {
        let (m, d, n) = self.dims();
        let data = self.as_slice();
        (0..d)
            .map(|s| {
                na::DMatrix::from_fn(m, n, |u, v| data[u + m * (s + d * v)])
            })
            .collect()
    }

    /// Assemble a tensor from `m × n` physical slices.
    pub fn from_phys_slices(
        left: Vec<Sector>,
        phys: Vec<Sector>,
        right: Vec<Sector>,
        slices: &[na::DMatrix<f64>],
        side: FuseSide,
    ) -> Self
    {
        let mut new = Self::zeros(left, phys, right, side);
        let (m, d, n) = new.dims();
        let data = new.as_mut_slice();
        for (s, slice) in slices.iter().enumerate().take(d) {
            for v in 0..n {
                for u in 0..m {
                    data[u + m * (s + d * v)] = slice[(u, v)];
                }
            }
        }
        new
    }

    /// Scale the left bond index by `weights`.
    pub fn scale_left<I>(&mut self, weights: I)
    where I: IntoIterator<Item = f64>
    {
        self.make_rfused();
        self.data.get_mut().row_iter_mut().zip(weights)
            .for_each(|(mut row, w)| { row.scale_mut(w); });
    }

    /// Scale the right bond index by `weights`.
    pub fn scale_right<I>(&mut self, weights: I)
    where I: IntoIterator<Item = f64>
    {
        self.make_lfused();
        self.data.get_mut().column_iter_mut().zip(weights)
            .for_each(|(mut col, w)| { col.scale_mut(w); });
    }

    /// Multiply the right bond index by `mat` (`n × k`), relabeling it with
    /// `right`. The result is left-fused.
    pub fn absorb_right(self, mat: &na::DMatrix<f64>, right: Vec<Sector>)
        -> TensorResult<Self>
    {
        let n = self.dims().2;
        if mat.nrows() != n { return Err(BondMismatch(n, mat.nrows())); }
        let Self { left, phys, right: _, data } = self;
        let lmat = Self::lfused_data(data, left.len(), phys.len(), n);
        Self::from_lfused(left, phys, right, lmat * mat)
    }

    /// Multiply the left bond index by `mat` (`k × m`), relabeling it with
    /// `left`. The result is right-fused.
    pub fn absorb_left(self, mat: &na::DMatrix<f64>, left: Vec<Sector>)
        -> TensorResult<Self>
    {
        let m = self.dims().0;
        if mat.ncols() != m { return Err(BondMismatch(m, mat.ncols())); }
        let Self { left: _, phys, right, data } = self;
        let rmat = Self::rfused_data(data, m, phys.len(), right.len());
        Self::from_rfused(left, phys, right, mat * rmat)
    }

    fn lfused_data(data: Fused, m: usize, d: usize, n: usize)
        -> na::DMatrix<f64>
    {
        data.into_inner().reshape_generic(na::Dyn(m * d), na::Dyn(n))
    }

    fn rfused_data(data: Fused, m: usize, d: usize, n: usize)
        -> na::DMatrix<f64>
    {
        data.into_inner().reshape_generic(na::Dyn(m), na::Dyn(d * n))
    }

    /// Contract two neighboring tensors over their shared bond into a single
    /// two-site tensor, with the physical indices fused as `s1 + d1·s2`.
    ///
    /// The result is left-fused.
    pub fn contract_pair(lhs: &Self, rhs: &Self) -> TensorResult<Self> {
        let (m, d1, k) = lhs.dims();
        let (k2, d2, n) = rhs.dims();
        if k != k2 { return Err(BondMismatch(k, k2)); }
        if lhs.right != rhs.left { return Err(LabelMismatch); }
        let lmat = lhs.reshaped(m * d1, k);
        let rmat = rhs.reshaped(k, d2 * n);
        let prod =
            (lmat * rmat).reshape_generic(na::Dyn(m * d1 * d2), na::Dyn(n));
        let phys = fuse_phys(&lhs.phys, &rhs.phys);
        Self::from_lfused(lhs.left.clone(), phys, rhs.right.clone(), prod)
    }
}

/// Labels of a fused pair of physical indices, `s1 + d1·s2`.
pub fn fuse_phys(p1: &[Sector], p2: &[Sector]) -> Vec<Sector> {
    p2.iter()
        .flat_map(|q2| p1.iter().map(move |q1| *q1 + *q2))
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;

    fn spin() -> Vec<Sector> { vec![Sector(1), Sector(-1)] }

    #[test]
    fn refusing_is_a_reshape() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut a =
            SiteTensor::random(
                vec![Sector(0), Sector(2)],
                spin(),
                vec![Sector(1), Sector(-1), Sector(1)],
                &mut rng,
            );
        let before: Vec<f64> = a.as_slice().to_vec();
        let e = a.get(1, 1, 0);
        a.make_rfused();
        assert_eq!(a.mat().shape(), (2, 6));
        assert_eq!(a.as_slice(), before.as_slice());
        assert_eq!(a.get(1, 1, 0), e);
        a.make_lfused();
        assert_eq!(a.mat().shape(), (4, 3));
    }

    #[test]
    fn random_respects_sectors() {
        let mut rng = StdRng::seed_from_u64(11);
        let a =
            SiteTensor::random(
                vec![Sector(0)], spin(), vec![Sector(1), Sector(-1)], &mut rng);
        assert_eq!(a.leakage(), 0.0);
        assert_eq!(a.get(0, 1, 0), 0.0);
        assert_eq!(a.get(0, 0, 1), 0.0);
    }

    #[test]
    fn pair_contraction_matches_elementwise() {
        let mut rng = StdRng::seed_from_u64(12);
        let a =
            SiteTensor::random(
                vec![Sector(0)], spin(), vec![Sector(1), Sector(-1)], &mut rng);
        let b =
            SiteTensor::random(
                vec![Sector(1), Sector(-1)], spin(), vec![Sector(0)], &mut rng);
        let ab = SiteTensor::contract_pair(&a, &b).unwrap();
        assert_eq!(ab.dims(), (1, 4, 1));
        for s2 in 0..2 {
            for s1 in 0..2 {
                let expected: f64 =
                    (0..2).map(|k| a.get(0, s1, k) * b.get(k, s2, 0)).sum();
                assert!((ab.get(0, s1 + 2 * s2, 0) - expected).abs() < 1e-14);
            }
        }
        assert_eq!(ab.leakage(), 0.0);
    }

    #[test]
    fn phys_slices_round_trip() {
        let mut rng = StdRng::seed_from_u64(13);
        let a =
            SiteTensor::random(
                vec![Sector(0), Sector(2)], spin(), vec![Sector(1)], &mut rng);
        let slices = a.phys_slices();
        let b =
            SiteTensor::from_phys_slices(
                a.left_labels().to_vec(),
                a.phys_labels().to_vec(),
                a.right_labels().to_vec(),
                &slices,
                FuseSide::Right,
            );
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
