//! Process-wide state threaded through every sweep.
//!
//! A [`SweepContext`] owns the MPS arena, the tensor store, the abort and
//! restart settings, timing counters and the random number generator. It is
//! built once per process and passed by `&mut` to the drivers.

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use rand::{ SeedableRng, rngs::StdRng };
use serde::{ Deserialize, Serialize };
use tracing::info;
use crate::{
    comm::{ CommResult, Communicator },
    mps::{ Mps, MpsArena, MpsResult },
    store::{ self, DiskStore, StoreResult, TensorStore },
};

/// Accumulated wall time per sweep phase.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Timers {
    pub env: Duration,
    pub solve: Duration,
    pub decomp: Duration,
    pub io: Duration,
}

impl Timers {
    /// Sum of all phases.
    pub fn total(&self) -> Duration { self.env + self.solve + self.decomp + self.io }
}

/// Position of an interrupted schedule, saved next to the MPS in the restart
/// directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeCursor {
    /// Index of the next sweep.
    pub sweep: usize,
    /// Direction of the next sweep.
    pub forward: bool,
    /// Energies (or targets) of the sweeps done so far.
    pub energies: Vec<Vec<f64>>,
}

type Signal = Box<dyn Fn() -> bool + Send + Sync>;

/// The context of a sweep.
pub struct SweepContext {
    pub arena: MpsArena,
    pub store: Arc<dyn TensorStore>,
    /// Directory the MPS and resume cursor are mirrored to after each sweep.
    pub restart_dir: Option<PathBuf>,
    /// File whose first line `STOP` ends the schedule.
    pub abort_file: Option<PathBuf>,
    signal: Option<Signal>,
    pub timers: Timers,
    pub rng: StdRng,
}

impl std::fmt::Debug for SweepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepContext")
            .field("arena", &self.arena)
            .field("restart_dir", &self.restart_dir)
            .field("abort_file", &self.abort_file)
            .field("timers", &self.timers)
            .finish()
    }
}

impl SweepContext {
    /// A new context over `store`, with its random number generator seeded
    /// from `seed` and the process rank.
    pub fn new(store: Arc<dyn TensorStore>, seed: u64, rank: usize) -> Self {
        Self {
            arena: MpsArena::new(),
            store,
            restart_dir: None,
            abort_file: None,
            signal: None,
            timers: Timers::default(),
            rng: StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
        }
    }

    pub fn with_restart_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.restart_dir = Some(dir.into());
        self
    }

    pub fn with_abort_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.abort_file = Some(path.into());
        self
    }

    /// Install a callback polled once per site; returning `true` ends the
    /// schedule like the abort file does.
    pub fn with_signal<F>(mut self, signal: F) -> Self
    where F: Fn() -> bool + Send + Sync + 'static
    {
        self.signal = Some(Box::new(signal));
        self
    }

    /// The store, as a trait object.
    pub fn store(&self) -> &dyn TensorStore { self.store.as_ref() }

    fn abort_requested(&self) -> bool {
        let by_file =
            self.abort_file.as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|text| text.lines().next().map(|l| l.trim() == "STOP").unwrap_or(false))
            .unwrap_or(false);
        by_file || self.signal.as_ref().map(|f| f()).unwrap_or(false)
    }

    /// Poll the abort file and signal callback. With a communicator, the
    /// root's answer is broadcast so that all processes agree.
    pub fn should_abort(&self, comm: Option<&dyn Communicator>) -> CommResult<bool> {
        match comm {
            None => Ok(self.abort_requested()),
            Some(comm) => {
                let mut flag =
                    [if comm.is_root() && self.abort_requested() { 1.0 } else { 0.0 }];
                comm.broadcast(&mut flag)?;
                Ok(flag[0] != 0.0)
            },
        }
    }

    /// Mirror an MPS and a resume cursor to the restart directory, if one is
    /// set.
    pub fn save_restart(&self, mps: &Mps, cursor: &ResumeCursor) -> MpsResult<()> {
        let Some(dir) = &self.restart_dir else { return Ok(()); };
        mps.save_data(self.store())?;
        let disk = DiskStore::new(dir)?;
        let count = store::mirror(self.store(), &format!("{}.", mps.tag), &disk)?;
        store::save_json(&disk, &resume_key(&mps.tag), cursor)?;
        info!("restart: mirrored {} records of '{}' to {}", count, mps.tag, dir.display());
        Ok(())
    }

    /// Read the resume cursor of `tag` from the restart directory.
    pub fn load_resume(&self, tag: &str) -> StoreResult<Option<ResumeCursor>> {
        let Some(dir) = &self.restart_dir else { return Ok(None); };
        let disk = DiskStore::new(dir)?;
        if !disk.contains(&resume_key(tag)) { return Ok(None); }
        store::load_json(&disk, &resume_key(tag)).map(Some)
    }
}

fn resume_key(tag: &str) -> String { format!("{tag}.resume") }

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;
    use super::*;

    #[test]
    fn abort_file_needs_stop_on_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abort");
        let ctx =
            SweepContext::new(Arc::new(MemoryStore::new()), 0, 0)
            .with_abort_file(&path);
        assert!(!ctx.should_abort(None).unwrap());
        fs::write(&path, "RUN\nSTOP\n").unwrap();
        assert!(!ctx.should_abort(None).unwrap());
        fs::write(&path, "STOP\n").unwrap();
        assert!(ctx.should_abort(None).unwrap());
    }

    #[test]
    fn signal_callback() {
        let ctx =
            SweepContext::new(Arc::new(MemoryStore::new()), 0, 0)
            .with_signal(|| true);
        assert!(ctx.should_abort(None).unwrap());
    }
}
