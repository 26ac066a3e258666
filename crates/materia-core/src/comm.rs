//! Collective reduction across ranks.
//!
//! A simulation may be split across several ranks,
//! each owning a disjoint share of the particles and a full copy of the mesh.
//! Nodal quantities are then summed across ranks between the stages of a step.
//! Ranks here are in-process: [`LocalGroup`] hands out one [`LocalComm`]
//! per rank, to be moved onto its own thread.

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Error in a collective reduction.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReduceError {
    /// Not every rank arrived at the reduction in time.
    #[error("rank {rank}: reduction timed out after {timeout:?}")]
    Timeout {
        /// Rank that gave up waiting.
        rank: usize,
        /// How long it waited.
        timeout: Duration,
    },
    /// Ranks contributed buffers of different lengths.
    #[error("rank {rank}: expected a buffer of length {expected}, another rank sent {found}")]
    LengthMismatch {
        /// Rank reporting the mismatch.
        rank: usize,
        /// Length of this rank's buffer.
        expected: usize,
        /// Length of the other buffer.
        found: usize,
    },
    /// Another rank left the group or failed a reduction.
    #[error("rank {rank}: reduction group was abandoned")]
    Abandoned {
        /// Rank reporting the failure.
        rank: usize,
    },
}

/// Access to the ranks taking part in a simulation.
pub trait Communicator: Send + Sync + Debug {
    /// Index of this rank, starting at 0.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Replace `values` with the elementwise sum over every rank's `values`.
    ///
    /// Every rank must call this the same number of times
    /// with buffers of the same length.
    /// The summation order is fixed, so every rank receives bit-identical results.
    fn allreduce_sum(&self, values: &mut [f64]) -> Result<(), ReduceError>;
}

/// The communicator of a run with a single rank.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _values: &mut [f64]) -> Result<(), ReduceError> {
        Ok(())
    }
}

//
// in-process group
//

/// Default time a rank waits for the others at a reduction.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
enum BarrierFailure {
    Timeout,
    Broken,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
}

/// A reusable barrier that can time out or be broken.
#[derive(Debug)]
struct Barrier {
    size: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration) -> Result<(), BarrierFailure> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.broken {
            return Err(BarrierFailure::Broken);
        }
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        loop {
            let timed_out = self.cvar.wait_until(&mut state, deadline).timed_out();
            // a completed generation wins over a failure raised after it
            if state.generation != generation {
                return Ok(());
            }
            if state.broken {
                return Err(BarrierFailure::Broken);
            }
            if timed_out {
                state.broken = true;
                self.cvar.notify_all();
                return Err(BarrierFailure::Timeout);
            }
        }
    }

    fn break_barrier(&self) {
        self.state.lock().broken = true;
        self.cvar.notify_all();
    }
}

#[derive(Debug)]
struct Shared {
    timeout: Duration,
    slots: Mutex<Vec<Vec<f64>>>,
    barrier: Barrier,
}

/// Builder of a group of in-process ranks.
///
/// ```
/// # use materia_core::comm::{Communicator, LocalGroup};
/// let comms = LocalGroup::new(2).split();
/// std::thread::scope(|s| {
///     for comm in comms {
///         s.spawn(move || {
///             let mut values = [comm.rank() as f64 + 1.];
///             comm.allreduce_sum(&mut values).expect("all ranks take part");
///             assert_eq!(values, [3.]);
///         });
///     }
/// });
/// ```
#[derive(Clone, Copy, Debug)]
pub struct LocalGroup {
    size: usize,
    timeout: Duration,
}

impl LocalGroup {
    /// A group of `size` ranks. A size of 0 is treated as 1.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set how long a rank waits for the others at a reduction.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create the communicator of every rank, in rank order.
    pub fn split(self) -> Vec<LocalComm> {
        let shared = Arc::new(Shared {
            timeout: self.timeout,
            slots: Mutex::new(vec![Vec::new(); self.size]),
            barrier: Barrier::new(self.size),
        });
        (0..self.size)
            .map(|rank| LocalComm {
                rank,
                size: self.size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank of a [`LocalGroup`].
///
/// Dropping a communicator abandons the group,
/// so ranks still waiting in a reduction fail instead of hanging.
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    fn barrier(&self) -> Result<(), ReduceError> {
        self.shared
            .barrier
            .wait(self.shared.timeout)
            .map_err(|failure| match failure {
                BarrierFailure::Timeout => ReduceError::Timeout {
                    rank: self.rank,
                    timeout: self.shared.timeout,
                },
                BarrierFailure::Broken => ReduceError::Abandoned { rank: self.rank },
            })
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allreduce_sum(&self, values: &mut [f64]) -> Result<(), ReduceError> {
        if self.size == 1 {
            return Ok(());
        }

        {
            let mut slots = self.shared.slots.lock();
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(values);
        }
        self.barrier()?;

        let result = {
            let slots = self.shared.slots.lock();
            match slots.iter().find(|s| s.len() != values.len()) {
                Some(other) => Err(ReduceError::LengthMismatch {
                    rank: self.rank,
                    expected: values.len(),
                    found: other.len(),
                }),
                None => {
                    let mut sum = vec![0.; values.len()];
                    for slot in slots.iter() {
                        for (total, v) in sum.iter_mut().zip(slot) {
                            *total += v;
                        }
                    }
                    Ok(sum)
                }
            }
        };

        // nobody may overwrite their slot until everyone has read
        self.barrier()?;

        values.copy_from_slice(&result?);
        Ok(())
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        if self.size > 1 {
            self.shared.barrier.break_barrier();
        }
    }
}
