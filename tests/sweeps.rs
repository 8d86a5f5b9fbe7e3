mod common;

use std::{ fs, sync::Arc, thread };
use mps_sweep::{
    DmrgConfig,
    ExpectConfig,
    Mpo,
    Mps,
    Sector,
    SweepContext,
    SweepSchedule,
    comm::{ Communicator, ParallelRule, ThreadComm },
    decompose::NoiseType,
    dmrg::Dmrg,
    expect::Expect,
    multicenter::ParallelMps,
    store::{ self, DiskStore, MemoryStore, TensorStore },
};
use common::{ context, exact_ground, random_state };

fn config(bond_dims: &[usize], noises: &[f64]) -> DmrgConfig {
    DmrgConfig {
        schedule: SweepSchedule::new(bond_dims.iter().copied(), noises.iter().copied()),
        noise_type: NoiseType::DENSITY_MATRIX,
        iprint: 0,
        ..DmrgConfig::default()
    }
}

#[test]
fn noiseless_schedule_reaches_exact_energy() {
    let mpo = Arc::new(Mpo::heisenberg(8, 1.0, 1.0, 0.0));
    let e0 = exact_ground(&mpo, Sector(0));
    for dot in [1, 2] {
        let mut ctx = context(3);
        let id = random_state(&mut ctx, &mpo, Sector(0), 16, dot);
        let cfg = DmrgConfig { dot, noise_type: NoiseType::NONE, ..config(&[16, 32], &[0.0]) };
        let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, cfg, None).unwrap();
        let e = dmrg.solve(&mut ctx, 20, true, 1e-10).unwrap();
        assert!((e - e0).abs() < 1e-8, "dot = {dot}: {e} vs {e0}");
        assert!(dmrg.converged);
    }
}

#[test]
fn expectation_after_dmrg_is_the_energy() {
    let mpo = Arc::new(Mpo::hubbard(5, 1.0, 2.0, 0.0).with_const(-1.5));
    let mut ctx = context(4);
    let id = random_state(&mut ctx, &mpo, Sector(5), 8, 2);
    let mut dmrg =
        Dmrg::new(mpo.clone(), id, &mut ctx, config(&[16, 48], &[1e-4, 1e-6, 0.0]), None)
        .unwrap();
    let e = dmrg.solve(&mut ctx, 20, true, 1e-9).unwrap();
    let e0 = exact_ground(&mpo, Sector(5));
    assert!((e - e0).abs() < 1e-6, "{e} vs {e0}");

    let cfg = ExpectConfig { iprint: 0, ..ExpectConfig::default() };
    let mut expect = Expect::new(mpo, id, id, &mut ctx, cfg, None).unwrap();
    let value = expect.solve(&mut ctx).unwrap();
    assert_eq!(expect.iterations.len(), 1);
    assert!((value - e).abs() < 1e-8, "{value} vs {e}");
}

#[test]
fn particle_number_from_density_matrix() {
    let n = 4;
    let mpo = Arc::new(Mpo::hubbard(n, 1.0, 4.0, 0.0));
    let mut ctx = context(5);
    let id = random_state(&mut ctx, &mpo, Sector(4), 8, 2);
    let mut dmrg =
        Dmrg::new(mpo.clone(), id, &mut ctx, config(&[16], &[1e-5, 0.0]), None).unwrap();
    dmrg.solve(&mut ctx, 10, true, 1e-9).unwrap();
    let cfg = ExpectConfig { propagate: true, iprint: 0, ..ExpectConfig::default() };
    let mut expect =
        Expect::new(mpo, id, id, &mut ctx, cfg, None).unwrap()
        .with_terms(mps_sweep::expect::pdm1_terms(n), &ctx).unwrap();
    expect.solve(&mut ctx).unwrap();
    let dm = expect.get_1pdm_spatial(n);
    assert!((dm.diag().sum() - 4.0).abs() < 1e-8);
    // half filling on a uniform chain
    assert!(dm.diag().iter().all(|x| (x - 1.0).abs() < 1e-6));
}

// run the same schedule on `size` threads sharing one store
fn parallel_dmrg(mpo: Arc<Mpo>, size: usize) -> Vec<f64> {
    let store: Arc<dyn TensorStore> = Arc::new(MemoryStore::new());
    {
        let mut ctx = SweepContext::new(Arc::clone(&store), 9, 0);
        random_state(&mut ctx, &mpo, Sector(0), 8, 2);
    }
    let handles: Vec<_> =
        ThreadComm::group(size).into_iter()
        .map(|comm| {
            let mpo = Arc::clone(&mpo);
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let rank = comm.rank();
                let rule = ParallelRule::new(Arc::new(comm));
                let mut ctx = SweepContext::new(store, 9, rank);
                let mps = Mps::load("psi", ctx.store()).unwrap();
                let id = ctx.arena.insert(mps);
                let cfg = DmrgConfig { noise_type: NoiseType::NONE, ..config(&[8, 16], &[0.0]) };
                let mut dmrg = Dmrg::new(mpo, id, &mut ctx, cfg, Some(rule)).unwrap();
                dmrg.solve(&mut ctx, 8, true, 1e-10).unwrap()
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn parallel_rule_matches_serial() {
    let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 0.7, 0.1));
    let serial = parallel_dmrg(mpo.clone(), 1);
    let parallel = parallel_dmrg(mpo.clone(), 3);
    let e0 = exact_ground(&mpo, Sector(0));
    assert!((serial[0] - e0).abs() < 1e-8);
    for e in parallel {
        assert!((e - serial[0]).abs() < 1e-8, "{e} vs {}", serial[0]);
    }
}

#[test]
fn multi_center_on_threads_matches_serial() {
    let mpo = Arc::new(Mpo::heisenberg(8, 1.0, 1.0, 0.0));
    let e0 = exact_ground(&mpo, Sector(0));
    let store: Arc<dyn TensorStore> = Arc::new(MemoryStore::new());
    {
        let mut ctx = SweepContext::new(Arc::clone(&store), 2, 0);
        random_state(&mut ctx, &mpo, Sector(0), 8, 2);
    }
    let handles: Vec<_> =
        ThreadComm::group(2).into_iter()
        .map(|comm| {
            let mpo = Arc::clone(&mpo);
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let rank = comm.rank();
                let rule = ParallelRule::new(Arc::new(comm));
                let mut ctx = SweepContext::new(store, 2, rank);
                let mps = Mps::load("psi", ctx.store()).unwrap();
                let id = ctx.arena.insert(mps);
                let cfg = DmrgConfig { noise_type: NoiseType::NONE, ..config(&[16], &[0.0]) };
                let mut pm =
                    ParallelMps::new(mpo, id, &mut ctx, cfg, vec![3, 6], Some(rule)).unwrap();
                pm.solve(&mut ctx, 30, 1e-10).unwrap()
            })
        })
        .collect();
    for h in handles {
        let e = h.join().unwrap();
        assert!((e - e0).abs() < 1e-6, "{e} vs {e0}");
    }
}

#[test]
fn abort_file_ends_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort");
    fs::write(&path, "STOP\n").unwrap();
    let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
    let mut ctx = context(6).with_abort_file(&path);
    let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2);
    let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, config(&[8], &[0.0]), None).unwrap();
    dmrg.solve(&mut ctx, 4, true, 1e-8).unwrap();
    assert!(dmrg.aborted);
    assert!(!dmrg.converged);
    assert!(dmrg.sweep_energies.is_empty());

    fs::write(&path, "GO\n").unwrap();
    let e = dmrg.solve(&mut ctx, 10, true, 1e-9).unwrap();
    assert!(!dmrg.aborted);
    assert!((e - exact_ground(&mpo, Sector(0))).abs() < 1e-7);
}

#[test]
fn restart_resumes_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let mpo = Arc::new(Mpo::heisenberg(6, 1.0, 1.0, 0.0));
    let cfg = config(&[4, 8, 16], &[1e-4, 1e-5, 0.0]);
    {
        let mut ctx = context(8).with_restart_dir(dir.path());
        let id = random_state(&mut ctx, &mpo, Sector(0), 4, 2);
        let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, cfg.clone(), None).unwrap();
        dmrg.solve(&mut ctx, 2, true, 0.0).unwrap();
        assert_eq!(dmrg.sweep_energies.len(), 2);
    }
    // a fresh process: copy the mirrored records into a new store
    let disk = DiskStore::new(dir.path()).unwrap();
    let memory = Arc::new(MemoryStore::new());
    assert!(store::mirror(&disk, "psi.", memory.as_ref()).unwrap() > 0);
    let mut ctx = SweepContext::new(memory, 8, 0).with_restart_dir(dir.path());
    let cursor = ctx.load_resume("psi").unwrap().unwrap();
    assert_eq!(cursor.sweep, 2);
    assert!(cursor.forward);
    let mps = Mps::load("psi", ctx.store()).unwrap();
    let id = ctx.arena.insert(mps);
    let mut dmrg = Dmrg::new(mpo.clone(), id, &mut ctx, cfg, None).unwrap();
    let e = dmrg.solve(&mut ctx, 12, true, 1e-9).unwrap();
    assert!(dmrg.sweep_energies.len() > 2);
    assert!((e - exact_ground(&mpo, Sector(0))).abs() < 1e-7);
}
