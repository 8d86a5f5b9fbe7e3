//! Sweep-based variational optimization of matrix-product states.
//!
//! The crate implements the sweep engine of the density matrix
//! renormalization group (DMRG) and its companions on top of `nalgebra`:
//! * [`dmrg::Dmrg`]: ground-state (and state-averaged excited-state)
//!   optimization with one- or two-site updates, noise, and optional
//!   distribution of operator terms over processes;
//! * [`multicenter::ParallelMps`]: multi-center sweeps over disjoint segments
//!   of the chain with dynamic load balancing;
//! * [`linear::Linear`]: linear equations `(H + shift)|x⟩ = O|r⟩`,
//!   compression and Green's functions;
//! * [`expect::Expect`]: expectation values and reduced density matrices.
//!
//! Every step of a sweep goes through the same pipeline: the
//! [`environment::MovingEnvironment`] slides to the active window, an
//! [`eff_ham::EffectiveHamiltonian`] solves the local problem, the
//! [`decompose`] routines truncate the result, and the
//! [`canonical::CanonicalForms`] tags are advanced.

use thiserror::Error;

pub mod quantum;
pub mod rule;
pub mod tensor;
pub mod ops;
pub mod mpo;
pub mod canonical;
pub mod store;
pub mod comm;
pub mod mps;
pub mod solver;
pub mod decompose;
pub mod environment;
pub mod eff_ham;
pub mod context;
pub mod config;
mod sweep;
pub mod dmrg;
pub mod multicenter;
pub mod linear;
pub mod expect;

pub use quantum::Sector;
pub use mpo::Mpo;
pub use mps::{ Mps, MpsArena, MpsId, MpsKind };
pub use context::SweepContext;
pub use config::{ DmrgConfig, LinearConfig, ExpectConfig, SweepSchedule };

use crate::{
    canonical::CanonicalError,
    comm::CommError,
    decompose::{ DecomposeError, DecompositionType, NoiseType },
    environment::EnvError,
    mpo::MpoError,
    mps::MpsError,
    store::StoreError,
    tensor::{ FuseSide, TensorError },
};

/// Errors raised by the sweep drivers.
///
/// All of these are representation or I/O faults; numerical non-convergence
/// is reported through logs and statistics instead.
#[derive(Debug, Error)]
pub enum SweepError {
    /// Returned when a wavefunction is fused on the wrong side of its window.
    #[error("fuse mismatch: expected {expected:?}-fused wavefunction, got {found:?}")]
    FuseMismatch { expected: FuseSide, found: FuseSide },

    /// Returned when a tensor does not fit the operator or environment.
    #[error("sector mismatch: {0}")]
    SectorMismatch(String),

    /// Returned when a noise type cannot be used with a decomposition type.
    #[error("noise type {0:?} is not supported with {1:?}")]
    UnsupportedNoise(NoiseType, DecompositionType),

    /// Returned for unsupported combinations of driver settings.
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    #[error("canonical form error: {0}")]
    CanonicalForm(#[from] CanonicalError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("communicator error: {0}")]
    Comm(#[from] CommError),

    #[error("decomposition error: {0}")]
    Decompose(DecomposeError),

    #[error("MPO error: {0}")]
    Mpo(#[from] MpoError),

    #[error("MPS error: {0}")]
    Mps(MpsError),

    #[error("environment error: {0}")]
    Env(EnvError),
}
pub type SweepResult<T> = Result<T, SweepError>;

impl From<EnvError> for SweepError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::FuseMismatch { expected, found } =>
                Self::FuseMismatch { expected, found },
            EnvError::SectorMismatch(msg) => Self::SectorMismatch(msg),
            EnvError::CommError(err) => Self::Comm(err),
            EnvError::MpsError(err) => Self::from(err),
            err => Self::Env(err),
        }
    }
}

impl From<DecomposeError> for SweepError {
    fn from(err: DecomposeError) -> Self {
        match err {
            DecomposeError::UnsupportedNoise(noise, decomp) =>
                Self::UnsupportedNoise(noise, decomp),
            err => Self::Decompose(err),
        }
    }
}

impl From<MpsError> for SweepError {
    fn from(err: MpsError) -> Self {
        match err {
            MpsError::StoreError(err) => Self::Store(err),
            MpsError::CanonicalError(err) => Self::CanonicalForm(err),
            MpsError::DecomposeError(err) => Self::from(err),
            err => Self::Mps(err),
        }
    }
}
