//! Reduced density matrices and truncated decompositions of wavefunctions.
//!
//! A wavefunction is split across one bond of the chain. Viewed as a matrix
//! `X[<left>, <right>]` (a [`SplitMatrix`]), every row and column carries a
//! [`Sector`], and entries are allowed only where the two labels agree. For
//! a forward split the rows are normalized (the left factor becomes an
//! isometry and the right factor carries the wavefunction); for a backward
//! split the roles are swapped:
//! ```text
//!  forward:   X = U · (Uᵀ X)        U: left-normalized
//!  backward:  X = (X V) · Vᵀ        Vᵀ: right-normalized
//! ```
//! The normalized factor is built block by block over the labels of the
//! normalized side, either from the eigenvectors of the reduced density matrix
//! `ρ = X Xᵀ` (plus noise and weighted mixtures, see [`density_matrix`]) or
//! from a direct SVD ([`split_wavefunction_svd`]).

use nalgebra as na;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    comm::{ CommResult, Communicator },
    quantum::{ Sector, group_by_sector },
    tensor::{ SiteTensor, TensorError, fuse_phys },
};

#[derive(Debug, Error)]
pub enum DecomposeError {
    /// Returned when a noise type cannot be used with a decomposition type.
    #[error("error in decomposition: noise type {0:?} is not supported with {1:?}")]
    UnsupportedNoise(NoiseType, DecompositionType),

    /// Returned when a density matrix is requested for a non-vacuum label.
    #[error("error in density_matrix: reduced density matrices must carry the vacuum label, got {0}")]
    NonVacuum(Sector),

    /// Returned when a split is requested for inconsistent shapes.
    #[error("error in decomposition: expected a {0}x{1} matrix, got {2}x{3}")]
    ShapeMismatch(usize, usize, usize, usize),

    /// Returned when the physical labels of a two-site tensor do not match the
    /// labels of its sites.
    #[error("error in decomposition: physical labels do not match the window")]
    PhysMismatch,

    /// Returned when no wavefunction is given to a multi-state split.
    #[error("error in multi_split_density_matrix: no states")]
    NoStates,

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),
}
use DecomposeError::*;
pub type DecomposeResult<T> = Result<T, DecomposeError>;

/// The kind of noise added before a truncation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseKind {
    #[default]
    None,
    /// Random positive semi-definite blocks added to the density matrix.
    DensityMatrix,
    /// A random perturbation of the wavefunction.
    Wavefunction,
    /// The first-order correction built from the effective Hamiltonian.
    Perturbative,
}

/// A [`NoiseKind`] with an optional `Collected` modifier: when set, the
/// noise part of the density matrix is built on every process with a share
/// of the magnitude and reduced at the root.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoiseType {
    pub kind: NoiseKind,
    #[serde(default)]
    pub collected: bool,
}

impl NoiseType {
    pub const NONE: Self = Self { kind: NoiseKind::None, collected: false };
    pub const DENSITY_MATRIX: Self =
        Self { kind: NoiseKind::DensityMatrix, collected: false };
    pub const WAVEFUNCTION: Self =
        Self { kind: NoiseKind::Wavefunction, collected: false };
    pub const PERTURBATIVE: Self =
        Self { kind: NoiseKind::Perturbative, collected: false };

    /// Return `self` with the `Collected` modifier set.
    pub fn collected(self) -> Self { Self { collected: true, ..self } }

    /// Return `true` if noise of this type with magnitude `noise` has any
    /// effect.
    pub fn is_active(&self, noise: f64) -> bool {
        self.kind != NoiseKind::None && noise > 0.0
    }
}

/// How a wavefunction is decomposed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecompositionType {
    /// Eigenvectors of the reduced density matrix.
    #[default]
    DensityMatrix,
    /// SVD; the wavefunction factor is the projection of the wavefunction
    /// onto the kept basis.
    Svd,
    /// SVD; the wavefunction factor is `S·Vᵀ` directly.
    PureSvd,
}

/// How the number of kept states is capped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TruncationType {
    /// Cap the total number of kept states.
    #[default]
    Physical,
    /// Cap the number of kept states in each sector.
    Reduced,
}

/// Check that a noise type can be used with a decomposition type.
pub fn check_noise(noise_type: NoiseType, decomp: DecompositionType)
    -> DecomposeResult<()>
{
    let ok =
        match decomp {
            DecompositionType::DensityMatrix => true,
            DecompositionType::Svd =>
                !noise_type.collected
                && noise_type.kind != NoiseKind::DensityMatrix,
            DecompositionType::PureSvd =>
                !noise_type.collected
                && matches!(
                    noise_type.kind,
                    NoiseKind::None | NoiseKind::Wavefunction
                ),
        };
    if ok { Ok(()) } else { Err(UnsupportedNoise(noise_type, decomp)) }
}

/// Eigenvalues closer than this (relative to the largest) belong to the same
/// multiplet.
pub const DEGENERACY_TOL: f64 = 1e-10;

/// A wavefunction (or wavefunction-like term) as a matrix across the bond
/// being split.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitMatrix {
    pub mat: na::DMatrix<f64>,
    /// Labels of the rows.
    pub rows: Vec<Sector>,
    /// Labels of the columns.
    pub cols: Vec<Sector>,
}

impl SplitMatrix {
    /// The matrix with its normalized side on the rows: `X` for a forward
    /// split, `Xᵀ` for a backward one. Also returns the labels of the
    /// normalized side and of the other side.
    fn oriented(&self, forward: bool)
        -> (na::DMatrix<f64>, &[Sector], &[Sector])
    {
        if forward {
            (self.mat.clone(), &self.rows, &self.cols)
        } else {
            (self.mat.transpose(), &self.cols, &self.rows)
        }
    }

    /// Number of states on the normalized side of a split.
    fn kept_side(&self, forward: bool) -> usize {
        if forward { self.mat.nrows() } else { self.mat.ncols() }
    }
}

/// Index structure of a wavefunction being split: the left bond and
/// `left_phys` go to the left factor, `right_phys` and the right bond to the
/// right factor.
///
/// A one-site forward split has a trivial `right_phys`, a one-site backward
/// split a trivial `left_phys`. Data are in the usual linear order
/// `u + m·(s1 + d1·(s2 + d2·v))`, so the split matrix is a plain reshape.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitShape {
    pub left: Vec<Sector>,
    pub left_phys: Vec<Sector>,
    pub right_phys: Vec<Sector>,
    pub right: Vec<Sector>,
}

impl SplitShape {
    /// Shape of a one-site split.
    pub fn one_site(t: &SiteTensor, forward: bool) -> Self {
        let trivial = vec![Sector::VACUUM];
        let phys = t.phys_labels().to_vec();
        let (left_phys, right_phys) =
            if forward { (phys, trivial) } else { (trivial, phys) };
        Self {
            left: t.left_labels().to_vec(),
            left_phys,
            right_phys,
            right: t.right_labels().to_vec(),
        }
    }

    /// Shape of a two-site split, given the physical labels of both sites.
    pub fn two_site(t: &SiteTensor, p1: &[Sector], p2: &[Sector])
        -> DecomposeResult<Self>
    {
        if fuse_phys(p1, p2) != t.phys_labels() { return Err(PhysMismatch); }
        Ok(Self {
            left: t.left_labels().to_vec(),
            left_phys: p1.to_vec(),
            right_phys: p2.to_vec(),
            right: t.right_labels().to_vec(),
        })
    }

    /// Labels of the rows, `left[u] + left_phys[s1]` at `u + m·s1`.
    pub fn row_labels(&self) -> Vec<Sector> {
        fuse_phys(&self.left, &self.left_phys)
    }

    /// Labels of the columns, `right[v] - right_phys[s2]` at `s2 + d2·v`.
    pub fn col_labels(&self) -> Vec<Sector> {
        self.right.iter()
            .flat_map(|r| self.right_phys.iter().map(move |p| *r - *p))
            .collect()
    }

    fn nrows(&self) -> usize { self.left.len() * self.left_phys.len() }

    fn ncols(&self) -> usize { self.right_phys.len() * self.right.len() }

    /// View a tensor of this shape as a split matrix.
    pub fn matrix(&self, t: &SiteTensor) -> DecomposeResult<SplitMatrix> {
        let (rows, cols) = (self.nrows(), self.ncols());
        let len = t.as_slice().len();
        if rows * cols != len {
            let (m, d, n) = t.dims();
            return Err(ShapeMismatch(rows, cols, m * d, n));
        }
        Ok(SplitMatrix {
            mat: t.reshaped(rows, cols),
            rows: self.row_labels(),
            cols: self.col_labels(),
        })
    }

    /// Build the left factor `(u, s1, k)` from a `rows × K` matrix.
    pub fn left_tensor(&self, bond: Vec<Sector>, mat: na::DMatrix<f64>)
        -> DecomposeResult<SiteTensor>
    {
        Ok(SiteTensor::from_lfused(
            self.left.clone(), self.left_phys.clone(), bond, mat)?)
    }

    /// Build the right factor `(k, s2, v)` from a `K × cols` matrix.
    pub fn right_tensor(&self, bond: Vec<Sector>, mat: na::DMatrix<f64>)
        -> DecomposeResult<SiteTensor>
    {
        Ok(SiteTensor::from_rfused(
            bond, self.right_phys.clone(), self.right.clone(), mat)?)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct DmBlock {
    label: Sector,
    indices: Vec<usize>,
    rho: na::DMatrix<f64>,
}

/// A reduced density matrix, block diagonal over the labels of the
/// normalized side of a split.
#[derive(Clone, Debug, PartialEq)]
pub struct DensityMatrix {
    forward: bool,
    dim: usize,
    blocks: Vec<DmBlock>,
}

impl DensityMatrix {
    /// A zero density matrix over states labeled by `labels`.
    pub fn zeros(labels: &[Sector], forward: bool) -> Self {
        let blocks =
            group_by_sector(labels).into_iter()
            .map(|(label, indices)| {
                let k = indices.len();
                DmBlock { label, indices, rho: na::DMatrix::zeros(k, k) }
            })
            .collect();
        Self { forward, dim: labels.len(), blocks }
    }

    /// Number of states.
    pub fn dim(&self) -> usize { self.dim }

    /// Direction of the split this density matrix is built for.
    pub fn is_forward(&self) -> bool { self.forward }

    /// Trace.
    pub fn trace(&self) -> f64 {
        self.blocks.iter().map(|b| b.rho.trace()).sum()
    }

    /// Assemble the full `dim × dim` matrix.
    pub fn to_dense(&self) -> na::DMatrix<f64> {
        let mut full = na::DMatrix::zeros(self.dim, self.dim);
        for b in self.blocks.iter() {
            for (i, gi) in b.indices.iter().enumerate() {
                for (j, gj) in b.indices.iter().enumerate() {
                    full[(*gi, *gj)] = b.rho[(i, j)];
                }
            }
        }
        full
    }

    /// `ρ += w · Y Yᵀ`, keeping only the diagonal blocks, where `Y` has the
    /// normalized side on its rows.
    fn add_outer(&mut self, y: &na::DMatrix<f64>, w: f64) {
        if w == 0.0 { return; }
        for b in self.blocks.iter_mut() {
            let rows = y.select_rows(b.indices.iter());
            b.rho.gemm(w, &rows, &rows.transpose(), 1.0);
        }
    }

    fn add_scaled(&mut self, other: &Self, a: f64) {
        for (b, o) in self.blocks.iter_mut().zip(other.blocks.iter()) {
            b.rho += &o.rho * a;
        }
    }

    /// Sum the density matrices of all processes into the root's.
    pub fn reduce_sum(&mut self, comm: &dyn Communicator) -> CommResult<()> {
        let mut flat: Vec<f64> =
            self.blocks.iter()
            .flat_map(|b| b.rho.as_slice().iter().copied())
            .collect();
        comm.reduce_sum(&mut flat)?;
        let mut offs: usize = 0;
        for b in self.blocks.iter_mut() {
            let len = b.rho.len();
            b.rho.as_mut_slice().copy_from_slice(&flat[offs..offs + len]);
            offs += len;
        }
        Ok(())
    }
}

/// Build the reduced density matrix of a split,
/// ```text
/// ρ = weight · ψψᵀ + Σ_k w_k φ_k φ_kᵀ + noise
/// ```
/// over the normalized side (rows for `forward`, columns otherwise).
///
/// `DensityMatrix` noise adds a random positive semi-definite block in every
/// sector, with total trace `noise`; `Wavefunction` noise adds `δδᵀ` for a
/// random `δ` on the allowed entries of `ψ`, with `‖δ‖² = noise`.
/// Perturbative noise is added afterwards with [`add_perturbative_noise`].
#[allow(clippy::too_many_arguments)]
pub fn density_matrix<R>(
    vacuum: Sector,
    wfn: &SplitMatrix,
    forward: bool,
    noise: f64,
    noise_type: NoiseKind,
    weight: f64,
    extra: &[(f64, SplitMatrix)],
    rng: &mut R,
) -> DecomposeResult<DensityMatrix>
where R: Rng + ?Sized
{
    if vacuum != Sector::VACUUM { return Err(NonVacuum(vacuum)); }
    let (y, kept, other) = wfn.oriented(forward);
    let mut dm = DensityMatrix::zeros(kept, forward);
    dm.add_outer(&y, weight);
    for (w, phi) in extra.iter() {
        if phi.kept_side(forward) != dm.dim {
            let (r, c) = phi.mat.shape();
            return Err(ShapeMismatch(dm.dim, c, r, c));
        }
        dm.add_outer(&phi.oriented(forward).0, *w);
    }
    if noise <= 0.0 { return Ok(dm); }
    match noise_type {
        NoiseKind::DensityMatrix => {
            let mut part = DensityMatrix::zeros(kept, forward);
            for b in part.blocks.iter_mut() {
                let k = b.indices.len();
                let g = na::DMatrix::from_fn(k, k, |_, _| rng.gen_range(-1.0..1.0));
                b.rho.gemm(1.0, &g, &g.transpose(), 0.0);
            }
            let tr = part.trace();
            if tr > 0.0 { dm.add_scaled(&part, noise / tr); }
        },
        NoiseKind::Wavefunction => {
            let delta = random_allowed(y.nrows(), y.ncols(), kept, other, rng);
            let nrm2 = delta.norm_squared();
            if nrm2 > 0.0 { dm.add_outer(&delta, noise / nrm2); }
        },
        NoiseKind::None | NoiseKind::Perturbative => { },
    }
    Ok(dm)
}

fn random_allowed<R>(
    nrows: usize,
    ncols: usize,
    rows: &[Sector],
    cols: &[Sector],
    rng: &mut R,
) -> na::DMatrix<f64>
where R: Rng + ?Sized
{
    na::DMatrix::from_fn(nrows, ncols, |i, j| {
        if rows[i] == cols[j] { rng.gen_range(-1.0..1.0) } else { 0.0 }
    })
}

/// A random perturbation of `wfn` on its allowed entries with squared norm
/// `noise`, for mixing into an SVD split.
pub fn wavefunction_noise<R>(wfn: &SplitMatrix, noise: f64, rng: &mut R) -> SplitMatrix
where R: Rng + ?Sized
{
    let (r, c) = wfn.mat.shape();
    let mut mat = random_allowed(r, c, &wfn.rows, &wfn.cols, rng);
    let nrm2 = mat.norm_squared();
    if nrm2 > 0.0 { mat.scale_mut((noise / nrm2).sqrt()); }
    SplitMatrix { mat, rows: wfn.rows.clone(), cols: wfn.cols.clone() }
}

/// Add `Σ_b P_b P_bᵀ` to `dm`, rescaled so that `Σ_b ‖P_b‖² = noise`.
///
/// `norm2` is the total squared norm used for the rescaling; pass `None` to
/// use the norm of `perturbations` (collected noise passes the norm summed
/// over all processes).
pub fn add_perturbative_noise(
    dm: &mut DensityMatrix,
    noise: f64,
    perturbations: &[SplitMatrix],
    norm2: Option<f64>,
) -> DecomposeResult<()>
{
    let norm2 =
        norm2.unwrap_or_else(|| {
            perturbations.iter().map(|p| p.mat.norm_squared()).sum()
        });
    if noise <= 0.0 || norm2 <= 0.0 { return Ok(()); }
    for p in perturbations.iter() {
        if p.kept_side(dm.forward) != dm.dim {
            let (r, c) = p.mat.shape();
            return Err(ShapeMismatch(dm.dim, c, r, c));
        }
        dm.add_outer(&p.oriented(dm.forward).0, noise / norm2);
    }
    Ok(())
}

/// The per-sector eigen- (or singular-) vectors of a decomposition, sorted by
/// descending weight within each sector.
struct Spectrum {
    labels: Vec<Sector>,
    indices: Vec<Vec<usize>>,
    values: Vec<Vec<f64>>,
    vectors: Vec<na::DMatrix<f64>>,
}

impl Spectrum {
    fn push(
        &mut self,
        label: Sector,
        indices: Vec<usize>,
        values: na::DVector<f64>,
        vectors: na::DMatrix<f64>,
    ) {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|a, b| values[*b].total_cmp(&values[*a]));
        self.values.push(order.iter().map(|k| values[*k]).collect());
        self.vectors.push(vectors.select_columns(order.iter()));
        self.labels.push(label);
        self.indices.push(indices);
    }

    fn from_density_matrix(dm: &DensityMatrix) -> Self {
        let mut spec = Self::empty();
        for b in dm.blocks.iter() {
            let sym = (&b.rho + b.rho.transpose()) * 0.5;
            let eig = sym.symmetric_eigen();
            spec.push(b.label, b.indices.clone(), eig.eigenvalues, eig.eigenvectors);
        }
        spec
    }

    fn empty() -> Self {
        Self {
            labels: Vec::new(),
            indices: Vec::new(),
            values: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Truncate and assemble the normalized factor, `dim × K`, together with
    /// the new bond labels and the discarded weight.
    fn truncate(
        &self,
        dim: usize,
        bond_dim: usize,
        cutoff: f64,
        trunc_type: TruncationType,
    ) -> (na::DMatrix<f64>, Vec<Sector>, f64)
    {
        let (counts, error) =
            select_states(&self.values, bond_dim, cutoff, trunc_type);
        let total: usize = counts.iter().sum();
        let mut basis = na::DMatrix::zeros(dim, total);
        let mut bond = Vec::with_capacity(total);
        // new bond states ordered by sector label
        let mut order: Vec<usize> = (0..self.labels.len()).collect();
        order.sort_by_key(|b| self.labels[*b]);
        let mut col: usize = 0;
        for b in order.into_iter() {
            for j in 0..counts[b] {
                for (i, gi) in self.indices[b].iter().enumerate() {
                    basis[(*gi, col)] = self.vectors[b][(i, j)];
                }
                bond.push(self.labels[b]);
                col += 1;
            }
        }
        (basis, bond, error)
    }
}

/// Number of states kept in each block, and the discarded weight.
///
/// `values` holds the weights of each block in descending order. States at or
/// below `cutoff` are discarded; a group of degenerate states straddling the
/// bond-dimension cut is discarded as a whole unless that would leave nothing
/// kept; at least one state is always kept.
pub fn select_states(
    values: &[Vec<f64>],
    bond_dim: usize,
    cutoff: f64,
    trunc_type: TruncationType,
) -> (Vec<usize>, f64)
{
    let mut counts = vec![0; values.len()];
    let vmax =
        values.iter().flatten().copied().fold(0.0_f64, f64::max);
    let tol = DEGENERACY_TOL * vmax.max(f64::MIN_POSITIVE);
    match trunc_type {
        TruncationType::Physical => {
            let mut all: Vec<(f64, usize)> =
                values.iter().enumerate()
                .flat_map(|(b, vs)| vs.iter().map(move |v| (*v, b)))
                .collect();
            all.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            let above = all.iter().take_while(|(v, _)| *v > cutoff).count();
            let mut k = above.min(bond_dim);
            if k < above { k = drop_straddling(&all, k, tol); }
            for (_, b) in all.iter().take(k) { counts[*b] += 1; }
        },
        TruncationType::Reduced => {
            for (b, vs) in values.iter().enumerate() {
                let above = vs.iter().take_while(|v| **v > cutoff).count();
                let mut k = above.min(bond_dim);
                if k < above {
                    let tagged: Vec<(f64, usize)> =
                        vs.iter().map(|v| (*v, b)).collect();
                    k = drop_straddling(&tagged, k, tol);
                }
                counts[b] = k;
            }
        },
    }
    if counts.iter().all(|c| *c == 0) {
        let best =
            values.iter().enumerate()
            .filter_map(|(b, vs)| vs.first().map(|v| (b, *v)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((b, _)) = best { counts[b] = 1; }
    }
    let error =
        values.iter().zip(counts.iter())
        .map(|(vs, c)| vs.iter().skip(*c).map(|v| v.max(0.0)).sum::<f64>())
        .sum();
    (counts, error)
}

fn drop_straddling(sorted: &[(f64, usize)], k: usize, tol: f64) -> usize {
    if k == 0 || k >= sorted.len() { return k; }
    let edge = sorted[k].0;
    let mut j = k;
    while j > 0 && (sorted[j - 1].0 - edge).abs() <= tol { j -= 1; }
    if j == 0 { k } else { j }
}

/// Result of a single-state split: `X ≈ left · right`.
#[derive(Clone, Debug)]
pub struct Split {
    /// `rows × K`.
    pub left: na::DMatrix<f64>,
    /// `K × cols`.
    pub right: na::DMatrix<f64>,
    /// Labels of the new bond.
    pub bond: Vec<Sector>,
    /// Discarded weight.
    pub error: f64,
}

fn normalize_mat(mat: &mut na::DMatrix<f64>) {
    let nrm = mat.norm();
    if nrm > 0.0 { mat.scale_mut(1.0 / nrm); }
}

/// Truncate a density matrix and split `wfn` with its eigenvectors.
///
/// The normalized factor holds the kept eigenvectors; the other factor is the
/// projection of `wfn` onto them, renormalized if `normalize` is set.
pub fn split_density_matrix(
    dm: &DensityMatrix,
    wfn: &SplitMatrix,
    bond_dim: usize,
    forward: bool,
    normalize: bool,
    cutoff: f64,
    trunc_type: TruncationType,
) -> DecomposeResult<Split>
{
    if wfn.kept_side(forward) != dm.dim || dm.forward != forward {
        let (r, c) = wfn.mat.shape();
        return Err(ShapeMismatch(dm.dim, c, r, c));
    }
    let spec = Spectrum::from_density_matrix(dm);
    let (basis, bond, error) = spec.truncate(dm.dim, bond_dim, cutoff, trunc_type);
    let (left, right) =
        if forward {
            let mut right = basis.transpose() * &wfn.mat;
            if normalize { normalize_mat(&mut right); }
            (basis, right)
        } else {
            let mut left = &wfn.mat * &basis;
            if normalize { normalize_mat(&mut left); }
            (left, basis.transpose())
        };
    Ok(Split { left, right, bond, error })
}

/// Split `wfn` with a blockwise SVD of the scaled concatenation
/// `[ψ, √w_1 φ_1, √w_2 φ_2, ...]` along the non-normalized side.
///
/// `Svd` projects `wfn` onto the kept singular vectors; `PureSvd` uses the
/// part of `S·Vᵀ` belonging to `wfn`. Noise terms (wavefunction or
/// perturbative) are passed in `extra`.
#[allow(clippy::too_many_arguments)]
pub fn split_wavefunction_svd(
    wfn: &SplitMatrix,
    extra: &[(f64, SplitMatrix)],
    bond_dim: usize,
    forward: bool,
    normalize: bool,
    cutoff: f64,
    trunc_type: TruncationType,
    decomp_type: DecompositionType,
) -> DecomposeResult<Split>
{
    let (y0, kept, _) = wfn.oriented(forward);
    let dim = y0.nrows();
    let mut parts = vec![y0];
    for (w, phi) in extra.iter() {
        if phi.kept_side(forward) != dim {
            let (r, c) = phi.mat.shape();
            return Err(ShapeMismatch(dim, c, r, c));
        }
        parts.push(phi.oriented(forward).0 * w.max(0.0).sqrt());
    }
    let total_cols: usize = parts.iter().map(|p| p.ncols()).sum();
    let mut joint = na::DMatrix::zeros(dim, total_cols);
    let mut offs: usize = 0;
    for p in parts.iter() {
        joint.columns_mut(offs, p.ncols()).copy_from(p);
        offs += p.ncols();
    }
    let ncols0 = parts[0].ncols();

    let mut spec = Spectrum::empty();
    let mut svals: Vec<na::DMatrix<f64>> = Vec::new();
    for (label, indices) in group_by_sector(kept).into_iter() {
        let block = joint.select_rows(indices.iter());
        let svd = block.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            unreachable!("svd requested with both factors");
        };
        // S·Vᵀ restricted to the columns of the primary wavefunction
        let sv = na::DMatrix::from_diagonal(&svd.singular_values)
            * v_t.columns(0, ncols0);
        let s2 = svd.singular_values.map(|s| s * s);
        let mut order: Vec<usize> = (0..s2.len()).collect();
        order.sort_by(|a, b| s2[*b].total_cmp(&s2[*a]));
        svals.push(sv.select_rows(order.iter()));
        spec.push(label, indices, s2, u);
    }
    let (basis, bond, error) = spec.truncate(dim, bond_dim, cutoff, trunc_type);
    let mut wfn_factor: na::DMatrix<f64> =
        match decomp_type {
            DecompositionType::PureSvd => {
                let (counts, _) =
                    select_states(&spec.values, bond_dim, cutoff, trunc_type);
                let mut order: Vec<usize> = (0..spec.labels.len()).collect();
                order.sort_by_key(|b| spec.labels[*b]);
                let rows: Vec<na::DMatrix<f64>> =
                    order.into_iter()
                    .map(|b| svals[b].rows(0, counts[b]).into_owned())
                    .collect();
                let k: usize = rows.iter().map(|r| r.nrows()).sum();
                let mut acc = na::DMatrix::zeros(k, ncols0);
                let mut r0: usize = 0;
                for r in rows.into_iter() {
                    acc.rows_mut(r0, r.nrows()).copy_from(&r);
                    r0 += r.nrows();
                }
                acc
            },
            _ => basis.transpose() * &parts[0],
        };
    if normalize { normalize_mat(&mut wfn_factor); }
    let (left, right) =
        if forward {
            (basis, wfn_factor)
        } else {
            (wfn_factor.transpose(), basis.transpose())
        };
    Ok(Split { left, right, bond, error })
}

/// Result of a multi-state split: a shared normalized factor and one
/// wavefunction factor per state.
#[derive(Clone, Debug)]
pub struct MultiSplit {
    /// `rows × K` for a forward split, `K × cols` for a backward one.
    pub normalized: na::DMatrix<f64>,
    /// `K × cols` for a forward split, `rows × K` for a backward one.
    pub wavefunctions: Vec<na::DMatrix<f64>>,
    /// Labels of the new bond.
    pub bond: Vec<Sector>,
    /// Discarded weight.
    pub error: f64,
}

/// Split a group of wavefunctions with the density matrix
/// `ρ = Σ_k w_k ψ_k ψ_kᵀ (+ noise_dm)`.
#[allow(clippy::too_many_arguments)]
pub fn multi_split_density_matrix(
    noise_dm: Option<&DensityMatrix>,
    wfns: &[SplitMatrix],
    weights: &[f64],
    bond_dim: usize,
    forward: bool,
    normalize: bool,
    cutoff: f64,
    trunc_type: TruncationType,
) -> DecomposeResult<MultiSplit>
{
    let first = wfns.first().ok_or(NoStates)?;
    let (_, kept, _) = first.oriented(forward);
    let mut dm = DensityMatrix::zeros(kept, forward);
    for (k, psi) in wfns.iter().enumerate() {
        if psi.kept_side(forward) != dm.dim {
            let (r, c) = psi.mat.shape();
            return Err(ShapeMismatch(dm.dim, c, r, c));
        }
        let w = weights.get(k).copied().unwrap_or(0.0);
        dm.add_outer(&psi.oriented(forward).0, w);
    }
    if let Some(noise) = noise_dm {
        if noise.dim != dm.dim {
            return Err(ShapeMismatch(dm.dim, dm.dim, noise.dim, noise.dim));
        }
        dm.add_scaled(noise, 1.0);
    }
    let spec = Spectrum::from_density_matrix(&dm);
    let (basis, bond, error) = spec.truncate(dm.dim, bond_dim, cutoff, trunc_type);
    let wavefunctions =
        wfns.iter()
        .map(|psi| {
            let mut w =
                if forward {
                    basis.transpose() * &psi.mat
                } else {
                    &psi.mat * &basis
                };
            if normalize { normalize_mat(&mut w); }
            w
        })
        .collect();
    let normalized = if forward { basis } else { basis.transpose() };
    Ok(MultiSplit { normalized, wavefunctions, bond, error })
}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;

    fn spin() -> Vec<Sector> { vec![Sector(1), Sector(-1)] }

    // a random two-site wavefunction on bonds (0 | ... | 0) with three
    // inner-bond labels available on each side
    fn two_site_wfn(seed: u64) -> (SiteTensor, SplitShape) {
        let mut rng = StdRng::seed_from_u64(seed);
        let left = vec![Sector(1), Sector(-1), Sector(-1), Sector(1), Sector(3)];
        let right = vec![Sector(0), Sector(2), Sector(-2), Sector(0)];
        let phys = fuse_phys(&spin(), &spin());
        let t = SiteTensor::random(left, phys, right, &mut rng);
        let shape = SplitShape::two_site(&t, &spin(), &spin()).unwrap();
        (t, shape)
    }

    #[test]
    fn untruncated_split_reproduces_wavefunction() {
        let (t, shape) = two_site_wfn(20);
        let x = shape.matrix(&t).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for forward in [true, false] {
            let dm =
                density_matrix(
                    Sector::VACUUM, &x, forward, 0.0, NoiseKind::None, 1.0, &[],
                    &mut rng,
                ).unwrap();
            let split =
                split_density_matrix(
                    &dm, &x, 1000, forward, false, 1e-14,
                    TruncationType::Physical,
                ).unwrap();
            let recon = &split.left * &split.right;
            assert!((recon - &x.mat).norm() < 1e-10);
            assert!(split.error < 1e-12);
            let l = shape.left_tensor(split.bond.clone(), split.left).unwrap();
            let r = shape.right_tensor(split.bond, split.right).unwrap();
            assert!(l.leakage() < 1e-20);
            assert!(r.leakage() < 1e-20);
        }
    }

    #[test]
    fn truncation_error_is_discarded_weight() {
        let (mut t, shape) = two_site_wfn(21);
        t.scale(1.0 / t.norm());
        let x = shape.matrix(&t).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let dm =
            density_matrix(
                Sector::VACUUM, &x, true, 0.0, NoiseKind::None, 1.0, &[], &mut rng,
            ).unwrap();
        let mut eigs: Vec<f64> =
            dm.to_dense().symmetric_eigen().eigenvalues.iter().copied().collect();
        eigs.sort_by(|a, b| b.total_cmp(a));
        let split =
            split_density_matrix(
                &dm, &x, 2, true, false, 0.0, TruncationType::Physical,
            ).unwrap();
        let discarded: f64 = eigs[2..].iter().map(|v| v.max(0.0)).sum();
        assert_eq!(split.bond.len(), 2);
        assert!((split.error - discarded).abs() < 1e-12);
        // the left factor is an isometry
        let iso = split.left.transpose() * &split.left;
        assert!((iso - na::DMatrix::identity(2, 2)).norm() < 1e-12);
    }

    #[test]
    fn svd_and_density_matrix_agree() {
        let (t, shape) = two_site_wfn(22);
        let x = shape.matrix(&t).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for forward in [true, false] {
            let dm =
                density_matrix(
                    Sector::VACUUM, &x, forward, 0.0, NoiseKind::None, 1.0, &[],
                    &mut rng,
                ).unwrap();
            let a =
                split_density_matrix(
                    &dm, &x, 3, forward, false, 0.0, TruncationType::Physical,
                ).unwrap();
            for decomp in [DecompositionType::Svd, DecompositionType::PureSvd] {
                let b =
                    split_wavefunction_svd(
                        &x, &[], 3, forward, false, 0.0,
                        TruncationType::Physical, decomp,
                    ).unwrap();
                assert!((a.error - b.error).abs() < 1e-10);
                let ra = &a.left * &a.right;
                let rb = &b.left * &b.right;
                assert!((ra - rb).norm() < 1e-8);
            }
        }
    }

    #[test]
    fn reduced_truncation_caps_each_sector() {
        let values = vec![vec![0.5, 0.2, 0.1], vec![0.15, 0.05]];
        let (counts, error) = select_states(&values, 1, 0.0, TruncationType::Reduced);
        assert_eq!(counts, vec![1, 1]);
        assert!((error - 0.35).abs() < 1e-14);
        let (counts, error) = select_states(&values, 3, 0.0, TruncationType::Physical);
        assert_eq!(counts, vec![2, 1]);
        assert!((error - 0.15).abs() < 1e-14);
    }

    #[test]
    fn degenerate_multiplet_is_not_split() {
        let values = vec![vec![0.4, 0.2], vec![0.2, 0.1]];
        let (counts, _) = select_states(&values, 2, 0.0, TruncationType::Physical);
        assert_eq!(counts, vec![1, 0]);
        // dropping the whole multiplet would leave nothing: keep the cut
        let values = vec![vec![0.3], vec![0.3], vec![0.3]];
        let (counts, _) = select_states(&values, 2, 0.0, TruncationType::Physical);
        assert_eq!(counts.iter().sum::<usize>(), 2);
    }

    #[test]
    fn cutoff_always_keeps_one_state() {
        let values = vec![vec![1e-20], vec![1e-18]];
        let (counts, error) = select_states(&values, 10, 1e-14, TruncationType::Physical);
        assert_eq!(counts, vec![0, 1]);
        assert!((error - 1e-20).abs() < 1e-30);
    }

    #[test]
    fn noise_keeps_trace_budget() {
        let (mut t, shape) = two_site_wfn(23);
        t.scale(1.0 / t.norm());
        let x = shape.matrix(&t).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        for kind in [NoiseKind::DensityMatrix, NoiseKind::Wavefunction] {
            let dm =
                density_matrix(
                    Sector::VACUUM, &x, true, 1e-3, kind, 1.0, &[], &mut rng,
                ).unwrap();
            assert!((dm.trace() - 1.0 - 1e-3).abs() < 1e-12);
        }
    }

    #[test]
    fn noise_with_svd_is_checked() {
        assert!(check_noise(NoiseType::PERTURBATIVE, DecompositionType::DensityMatrix).is_ok());
        assert!(check_noise(NoiseType::PERTURBATIVE, DecompositionType::Svd).is_ok());
        assert!(check_noise(NoiseType::PERTURBATIVE, DecompositionType::PureSvd).is_err());
        assert!(check_noise(NoiseType::DENSITY_MATRIX, DecompositionType::Svd).is_err());
        assert!(check_noise(NoiseType::WAVEFUNCTION.collected(), DecompositionType::Svd).is_err());
    }

    #[test]
    fn multi_split_shares_basis() {
        let (t0, shape) = two_site_wfn(24);
        let (t1, _) = two_site_wfn(25);
        let x0 = shape.matrix(&t0).unwrap();
        let x1 = shape.matrix(&t1).unwrap();
        let split =
            multi_split_density_matrix(
                None, &[x0.clone(), x1.clone()], &[0.5, 0.5], 1000, true, false,
                1e-14, TruncationType::Physical,
            ).unwrap();
        for (x, w) in [x0, x1].iter().zip(split.wavefunctions.iter()) {
            assert!((&split.normalized * w - &x.mat).norm() < 1e-10);
        }
    }
}
