//! Collective communication between the processes of a distributed sweep.
//!
//! Sweeps are written in a synchronous SPMD style: every process runs the same
//! control flow and meets the others only at collective calls. The
//! [`Communicator`] trait captures the collectives the sweep engine needs;
//! [`SerialComm`] is the trivial single-process implementation and
//! [`ThreadComm`] runs a group of "processes" as threads of one program,
//! passing messages over `crossbeam` channels:
//! ```text
//!            rank 1 ──┐            ┌──> rank 1
//!            rank 2 ──┼──> root ───┼──> rank 2
//!            rank 3 ──┘  (reduce)  └──> rank 3
//! ```
//! Every collective is a gather at the root (rank 0) followed, when all ranks
//! need the result, by a scatter of the root's result. Reductions are summed in
//! rank order, so all ranks see bit-identical results.

use std::sync::Arc;
use crossbeam::channel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommError {
    /// Returned when a peer hung up before a collective completed.
    #[error("error in collective: peer {0} disconnected")]
    Disconnected(usize),

    /// Returned when a collective receives a buffer of the wrong length.
    #[error("error in collective: expected {0} values, received {1}")]
    LengthMismatch(usize, usize),
}
use CommError::*;
pub type CommResult<T> = Result<T, CommError>;

/// Collective operations over a group of processes.
pub trait Communicator: Send + Sync {
    /// Rank of this process.
    fn rank(&self) -> usize;

    /// Number of processes.
    fn size(&self) -> usize;

    /// Return `true` for the root process.
    fn is_root(&self) -> bool { self.rank() == 0 }

    /// Block until every process has reached this call.
    fn barrier(&self) -> CommResult<()>;

    /// Sum `data` over all processes into the root's buffer; other buffers
    /// are left untouched.
    fn reduce_sum(&self, data: &mut [f64]) -> CommResult<()>;

    /// Sum `data` over all processes into every buffer.
    fn allreduce_sum(&self, data: &mut [f64]) -> CommResult<()>;

    /// Elementwise minimum over all processes into every buffer.
    fn allreduce_min(&self, data: &mut [f64]) -> CommResult<()>;

    /// Elementwise maximum over all processes into every buffer.
    fn allreduce_max(&self, data: &mut [f64]) -> CommResult<()>;

    /// Copy the root's buffer into every buffer.
    fn broadcast(&self, data: &mut [f64]) -> CommResult<()>;
}

/// A single process.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize { 0 }

    fn size(&self) -> usize { 1 }

    fn barrier(&self) -> CommResult<()> { Ok(()) }

    fn reduce_sum(&self, _data: &mut [f64]) -> CommResult<()> { Ok(()) }

    fn allreduce_sum(&self, _data: &mut [f64]) -> CommResult<()> { Ok(()) }

    fn allreduce_min(&self, _data: &mut [f64]) -> CommResult<()> { Ok(()) }

    fn allreduce_max(&self, _data: &mut [f64]) -> CommResult<()> { Ok(()) }

    fn broadcast(&self, _data: &mut [f64]) -> CommResult<()> { Ok(()) }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Reduce {
    Sum,
    Min,
    Max,
    Root,
}

impl Reduce {
    fn fold(self, acc: &mut [f64], other: &[f64]) {
        match self {
            Self::Sum => {
                acc.iter_mut().zip(other).for_each(|(a, b)| { *a += b; });
            },
            Self::Min => {
                acc.iter_mut().zip(other).for_each(|(a, b)| { *a = a.min(*b); });
            },
            Self::Max => {
                acc.iter_mut().zip(other).for_each(|(a, b)| { *a = a.max(*b); });
            },
            Self::Root => { },
        }
    }
}

/// One member of a group of threads acting as processes.
///
/// Create the whole group at once with [`ThreadComm::group`] and move one
/// member into each thread.
#[derive(Debug)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    // non-root: channel to the root
    to_root: Option<channel::Sender<Vec<f64>>>,
    // non-root: channel from the root
    from_root: Option<channel::Receiver<Vec<f64>>>,
    // root: one channel from each non-root rank (index = rank - 1)
    from_ranks: Vec<channel::Receiver<Vec<f64>>>,
    // root: one channel to each non-root rank (index = rank - 1)
    to_ranks: Vec<channel::Sender<Vec<f64>>>,
}

impl ThreadComm {
    /// Create a group of `size` communicators, indexed by rank.
    pub fn group(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let mut from_ranks = Vec::with_capacity(size - 1);
        let mut to_ranks = Vec::with_capacity(size - 1);
        let mut members = Vec::with_capacity(size);
        for rank in 1..size {
            let (up_tx, up_rx) = channel::unbounded();
            let (down_tx, down_rx) = channel::unbounded();
            from_ranks.push(up_rx);
            to_ranks.push(down_tx);
            members.push(Self {
                rank,
                size,
                to_root: Some(up_tx),
                from_root: Some(down_rx),
                from_ranks: Vec::new(),
                to_ranks: Vec::new(),
            });
        }
        let root =
            Self { rank: 0, size, to_root: None, from_root: None, from_ranks, to_ranks };
        members.insert(0, root);
        members
    }

    // gather at the root and fold; returns the folded buffer on the root only
    fn gather(&self, data: &[f64], op: Reduce) -> CommResult<Option<Vec<f64>>> {
        if self.rank == 0 {
            let mut acc = data.to_vec();
            for (k, rx) in self.from_ranks.iter().enumerate() {
                let other = rx.recv().map_err(|_| Disconnected(k + 1))?;
                if other.len() != acc.len() {
                    return Err(LengthMismatch(acc.len(), other.len()));
                }
                op.fold(&mut acc, &other);
            }
            Ok(Some(acc))
        } else {
            self.to_root.as_ref()
                .ok_or(Disconnected(0))?
                .send(data.to_vec())
                .map_err(|_| Disconnected(0))?;
            Ok(None)
        }
    }

    // send the root's buffer to every rank
    fn scatter(&self, data: &mut [f64]) -> CommResult<()> {
        if self.rank == 0 {
            for (k, tx) in self.to_ranks.iter().enumerate() {
                tx.send(data.to_vec()).map_err(|_| Disconnected(k + 1))?;
            }
        } else {
            let result =
                self.from_root.as_ref()
                .ok_or(Disconnected(0))?
                .recv()
                .map_err(|_| Disconnected(0))?;
            if result.len() != data.len() {
                return Err(LengthMismatch(data.len(), result.len()));
            }
            data.copy_from_slice(&result);
        }
        Ok(())
    }

    fn allreduce(&self, data: &mut [f64], op: Reduce) -> CommResult<()> {
        if let Some(acc) = self.gather(data, op)? {
            data.copy_from_slice(&acc);
        }
        self.scatter(data)
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize { self.rank }

    fn size(&self) -> usize { self.size }

    fn barrier(&self) -> CommResult<()> { self.allreduce(&mut [], Reduce::Root) }

    fn reduce_sum(&self, data: &mut [f64]) -> CommResult<()> {
        if let Some(acc) = self.gather(data, Reduce::Sum)? {
            data.copy_from_slice(&acc);
        }
        Ok(())
    }

    fn allreduce_sum(&self, data: &mut [f64]) -> CommResult<()> {
        self.allreduce(data, Reduce::Sum)
    }

    fn allreduce_min(&self, data: &mut [f64]) -> CommResult<()> {
        self.allreduce(data, Reduce::Min)
    }

    fn allreduce_max(&self, data: &mut [f64]) -> CommResult<()> {
        self.allreduce(data, Reduce::Max)
    }

    fn broadcast(&self, data: &mut [f64]) -> CommResult<()> {
        self.allreduce(data, Reduce::Root)
    }
}

/// Distribution of operator terms over the processes of a communicator.
///
/// Term `t` is owned by rank `t % size`. Partial results computed from owned
/// terms are combined with a reduction.
#[derive(Clone)]
pub struct ParallelRule {
    pub comm: Arc<dyn Communicator>,
}

impl ParallelRule {
    pub fn new(comm: Arc<dyn Communicator>) -> Self { Self { comm } }

    /// Return `true` if this process owns term `t`.
    pub fn owns(&self, t: usize) -> bool {
        t % self.comm.size() == self.comm.rank()
    }

    /// Return `true` for the root process.
    pub fn is_root(&self) -> bool { self.comm.is_root() }
}

impl std::fmt::Debug for ParallelRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParallelRule {{ rank: {}, size: {} }}",
            self.comm.rank(), self.comm.size())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use super::*;

    #[test]
    fn thread_collectives() {
        let group = ThreadComm::group(3);
        let handles: Vec<_> =
            group.into_iter()
            .map(|comm| thread::spawn(move || {
                let r = comm.rank() as f64;
                let mut sum = [r, 1.0];
                comm.allreduce_sum(&mut sum).unwrap();
                let mut lo = [r];
                comm.allreduce_min(&mut lo).unwrap();
                let mut hi = [r];
                comm.allreduce_max(&mut hi).unwrap();
                let mut root_only = [r + 10.0];
                comm.reduce_sum(&mut root_only).unwrap();
                let mut bc = [r * 2.0 + 1.0];
                comm.broadcast(&mut bc).unwrap();
                comm.barrier().unwrap();
                (comm.rank(), sum, lo[0], hi[0], root_only[0], bc[0])
            }))
            .collect();
        for h in handles {
            let (rank, sum, lo, hi, root_only, bc) = h.join().unwrap();
            assert_eq!(sum, [3.0, 3.0]);
            assert_eq!(lo, 0.0);
            assert_eq!(hi, 2.0);
            if rank == 0 {
                assert_eq!(root_only, 33.0);
            } else {
                assert_eq!(root_only, rank as f64 + 10.0);
            }
            assert_eq!(bc, 1.0);
        }
    }

    #[test]
    fn serial_is_trivial() {
        let comm = SerialComm;
        let mut data = [1.0, 2.0];
        comm.allreduce_sum(&mut data).unwrap();
        assert_eq!(data, [1.0, 2.0]);
        let rule = ParallelRule::new(Arc::new(SerialComm));
        assert!((0..5).all(|t| rule.owns(t)));
    }
}
