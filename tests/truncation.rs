use proptest::prelude::*;
use rand::{ SeedableRng, rngs::StdRng };
use mps_sweep::{
    Sector,
    decompose::{
        NoiseKind,
        SplitMatrix,
        SplitShape,
        TruncationType,
        density_matrix,
        split_density_matrix,
    },
    tensor::{ SiteTensor, fuse_phys },
};

fn spin() -> Vec<Sector> { vec![Sector(1), Sector(-1)] }

// a normalized two-site wavefunction with several sectors on both bonds
fn wavefunction(seed: u64) -> SplitMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let left = vec![Sector(1), Sector(-1), Sector(-1), Sector(1), Sector(3), Sector(-3)];
    let right = vec![Sector(0), Sector(2), Sector(-2), Sector(0), Sector(2)];
    let mut t = SiteTensor::random(left, fuse_phys(&spin(), &spin()), right, &mut rng);
    t.scale(1.0 / t.norm());
    let shape = SplitShape::two_site(&t, &spin(), &spin()).unwrap();
    shape.matrix(&t).unwrap()
}

fn discarded(
    x: &SplitMatrix,
    forward: bool,
    kind: NoiseKind,
    noise: f64,
    bond_dim: usize,
    seed: u64,
) -> f64
{
    let mut rng = StdRng::seed_from_u64(seed);
    let dm = density_matrix(Sector::VACUUM, x, forward, noise, kind, 1.0, &[], &mut rng).unwrap();
    split_density_matrix(&dm, x, bond_dim, forward, false, 0.0, TruncationType::Physical)
        .unwrap()
        .error
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn noise_never_lowers_the_truncation_error(
        seed in 0_u64..1000,
        noise in 1e-6_f64..1e-1,
        bond_dim in 1_usize..6,
        forward in any::<bool>(),
        wavefunction_noise in any::<bool>(),
    ) {
        let x = wavefunction(seed);
        let kind =
            if wavefunction_noise { NoiseKind::Wavefunction } else { NoiseKind::DensityMatrix };
        let clean = discarded(&x, forward, NoiseKind::None, 0.0, bond_dim, seed);
        let noisy = discarded(&x, forward, kind, noise, bond_dim, seed);
        prop_assert!(clean >= 0.0);
        prop_assert!(noisy >= clean - 1e-12, "{} < {}", noisy, clean);
    }

    #[test]
    fn smaller_bond_dimension_discards_more(
        seed in 0_u64..1000,
        bond_dim in 1_usize..8,
        forward in any::<bool>(),
    ) {
        let x = wavefunction(seed);
        let wide = discarded(&x, forward, NoiseKind::None, 0.0, bond_dim + 1, seed);
        let narrow = discarded(&x, forward, NoiseKind::None, 0.0, bond_dim, seed);
        prop_assert!(wide >= 0.0);
        prop_assert!(narrow >= wide - 1e-12, "{} < {}", narrow, wide);
    }
}
