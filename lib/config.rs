//! Sweep schedules and driver settings.
//!
//! Everything here is plain data deserializable with `serde`; missing fields
//! take their defaults, so a settings file only needs to list what differs:
//! ```json
//! { "dot": 1, "noise_type": { "kind": "Perturbative" },
//!   "schedule": { "bond_dims": [50, 100], "noises": [1e-4, 0.0] } }
//! ```

use serde::{ Deserialize, Serialize };
use crate::decompose::{ DecompositionType, NoiseType, TruncationType };

/// Per-sweep bond dimensions, noise magnitudes and solver thresholds.
///
/// Schedules shorter than the number of sweeps are padded with their last
/// entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSchedule {
    pub bond_dims: Vec<usize>,
    pub noises: Vec<f64>,
    /// Solver thresholds; empty to derive them from the noise and the
    /// energy tolerance.
    pub solver_convs: Vec<f64>,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self { bond_dims: vec![100], noises: vec![0.0], solver_convs: Vec::new() }
    }
}

fn padded<T: Copy>(items: &[T], k: usize) -> Option<T> {
    items.get(k).or_else(|| items.last()).copied()
}

impl SweepSchedule {
    /// A schedule from bond dimensions and noises.
    pub fn new<I, J>(bond_dims: I, noises: J) -> Self
    where
        I: IntoIterator<Item = usize>,
        J: IntoIterator<Item = f64>,
    {
        Self {
            bond_dims: bond_dims.into_iter().collect(),
            noises: noises.into_iter().collect(),
            solver_convs: Vec::new(),
        }
    }

    /// Bond dimension of sweep `k`.
    pub fn bond_dim(&self, k: usize) -> usize { padded(&self.bond_dims, k).unwrap_or(1) }

    /// Noise of sweep `k`.
    pub fn noise(&self, k: usize) -> f64 { padded(&self.noises, k).unwrap_or(0.0) }

    /// Solver threshold of sweep `k`: the scheduled value, or
    /// `0.1 × (noise, else tol, else 1e-9)`.
    pub fn solver_conv(&self, k: usize, tol: f64) -> f64 {
        padded(&self.solver_convs, k).unwrap_or_else(|| {
            let noise = self.noise(k);
            let base =
                if noise == 0.0 {
                    if tol == 0.0 { 1e-9 } else { tol }
                } else {
                    noise
                };
            0.1 * base
        })
    }

    /// Return `true` if sweep `k` has reached the final bond dimension and
    /// noise of the schedule.
    pub fn is_final(&self, k: usize) -> bool {
        let last_m = self.bond_dims.last().copied().unwrap_or(1);
        let last_noise = self.noises.last().copied().unwrap_or(0.0);
        self.bond_dim(k) == last_m && self.noise(k) == last_noise
    }
}

/// Settings of a ground-state optimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmrgConfig {
    /// Number of sites updated at once, 1 or 2.
    pub dot: usize,
    pub schedule: SweepSchedule,
    pub noise_type: NoiseType,
    pub decomp_type: DecompositionType,
    pub trunc_type: TruncationType,
    /// Density-matrix eigenvalues (squared singular values) below this are
    /// discarded.
    pub cutoff: f64,
    pub davidson_max_iter: usize,
    pub davidson_soft_max_iter: Option<usize>,
    /// Split the wavefunction at the chain ends too.
    pub decomp_last_site: bool,
    /// Minimum number of sweeps before convergence can be declared.
    pub min_sweeps: usize,
    /// Verbosity, 0 to 3.
    pub iprint: u8,
    /// Most sites a multi-center connection moves per round.
    pub conn_adjust_step: usize,
}

impl Default for DmrgConfig {
    fn default() -> Self {
        Self {
            dot: 2,
            schedule: SweepSchedule::default(),
            noise_type: NoiseType::DENSITY_MATRIX,
            decomp_type: DecompositionType::DensityMatrix,
            trunc_type: TruncationType::Physical,
            cutoff: 1e-14,
            davidson_max_iter: 5000,
            davidson_soft_max_iter: None,
            decomp_last_site: true,
            min_sweeps: 2,
            iprint: 2,
            conn_adjust_step: 2,
        }
    }
}

impl DmrgConfig {
    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Kind of linear problem.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquationType {
    /// `(H + shift) |x⟩ = O |r⟩`; plain compression `|x⟩ = O |r⟩` without a
    /// left-hand operator.
    #[default]
    Normal,
    /// Compression, with the left-hand operator only used for perturbative
    /// noise.
    PerturbativeCompression,
    /// `(H + shift - ω + iη) |x⟩ = O |r⟩`.
    GreensFunction,
}

/// Settings of a linear solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub dot: usize,
    pub eq_type: EquationType,
    pub schedule: SweepSchedule,
    /// Bond dimension the source `|r⟩` is re-truncated to.
    pub ket_bond_dim: usize,
    /// Bond dimension of the bra of the target environment, if any.
    pub target_bond_dim: usize,
    pub noise_type: NoiseType,
    pub decomp_type: DecompositionType,
    pub trunc_type: TruncationType,
    pub cutoff: f64,
    pub minres_max_iter: usize,
    pub minres_soft_max_iter: Option<usize>,
    pub decomp_last_site: bool,
    /// Diagonal shift of the left-hand operator.
    pub shift: f64,
    pub gf_omega: f64,
    pub gf_eta: f64,
    /// Weight of `O|r⟩` mixed into the bra's density matrix; the bra itself
    /// keeps `1 - right_weight`.
    pub right_weight: f64,
    /// Weights of the real and imaginary parts of a Green's function in the
    /// bra's density matrix.
    pub complex_weights: [f64; 2],
    pub min_sweeps: usize,
    pub iprint: u8,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            dot: 2,
            eq_type: EquationType::Normal,
            schedule: SweepSchedule::default(),
            ket_bond_dim: usize::MAX,
            target_bond_dim: usize::MAX,
            noise_type: NoiseType::DENSITY_MATRIX,
            decomp_type: DecompositionType::DensityMatrix,
            trunc_type: TruncationType::Physical,
            cutoff: 1e-14,
            minres_max_iter: 5000,
            minres_soft_max_iter: None,
            decomp_last_site: true,
            shift: 0.0,
            gf_omega: 0.0,
            gf_eta: 0.0,
            right_weight: 0.0,
            complex_weights: [0.5, 0.5],
            min_sweeps: 2,
            iprint: 2,
        }
    }
}

/// Settings of an expectation sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectConfig {
    /// Re-truncate bra and ket while sweeping.
    pub propagate: bool,
    pub bra_bond_dim: usize,
    pub ket_bond_dim: usize,
    pub trunc_type: TruncationType,
    pub iprint: u8,
}

impl Default for ExpectConfig {
    fn default() -> Self {
        Self {
            propagate: false,
            bra_bond_dim: usize::MAX,
            ket_bond_dim: usize::MAX,
            trunc_type: TruncationType::Physical,
            iprint: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::decompose::NoiseKind;
    use super::*;

    #[test]
    fn schedules_are_padded() {
        let s = SweepSchedule::new([10, 20], [1e-4, 1e-5, 0.0]);
        assert_eq!(s.bond_dim(0), 10);
        assert_eq!(s.bond_dim(5), 20);
        assert_eq!(s.noise(1), 1e-5);
        assert_eq!(s.noise(7), 0.0);
        assert!(!s.is_final(1));
        assert!(s.is_final(2));
        assert!((s.solver_conv(0, 1e-8) - 1e-5).abs() < 1e-20);
        assert!((s.solver_conv(2, 1e-8) - 1e-9).abs() < 1e-22);
        assert!((s.solver_conv(2, 0.0) - 1e-10).abs() < 1e-23);
    }

    #[test]
    fn settings_from_json() {
        let cfg =
            DmrgConfig::from_json(r#"{
                "dot": 1,
                "noise_type": { "kind": "Perturbative", "collected": true },
                "schedule": { "bond_dims": [50, 100], "noises": [1e-4, 0.0] }
            }"#).unwrap();
        assert_eq!(cfg.dot, 1);
        assert_eq!(cfg.noise_type.kind, NoiseKind::Perturbative);
        assert!(cfg.noise_type.collected);
        assert_eq!(cfg.schedule.bond_dim(3), 100);
        assert_eq!(cfg.cutoff, 1e-14);
        assert!(cfg.decomp_last_site);
    }
}
