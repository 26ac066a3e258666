//! Output and checkpoint contracts.
//!
//! The solver hands its state to [`OutputWriter`]s and a [`CheckpointStore`]
//! every few steps. How that state is encoded is up to the implementations;
//! the ones here log summaries, write JSON lines or keep checkpoints in memory.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    io::Write,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{mesh::Mesh, particle::ParticleRecord, SOLID};

/// Error in writing output or handling checkpoints.
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    /// No checkpoint exists for the step.
    #[error("no checkpoint for step {step}")]
    MissingCheckpoint {
        /// The requested step.
        step: usize,
    },
    /// A checkpoint was written for a different dimension.
    #[error("checkpoint is {found}D but the mesh is {expected}D")]
    DimensionMismatch {
        /// Dimension of the mesh.
        expected: usize,
        /// Dimension of the checkpoint.
        found: usize,
    },
    /// Encoding or decoding failed.
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),
    /// Writing failed.
    #[error("writing output failed")]
    Io(#[from] std::io::Error),
}

/// The state needed to resume a run.
///
/// Only particles are stored, since nodes are reset at the start of every step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The step at which the run continues.
    pub step: usize,
    /// Dimension of the mesh.
    pub dim: usize,
    /// Every particle of the rank.
    pub particles: Vec<ParticleRecord>,
}

impl Checkpoint {
    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, OutputError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, OutputError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Somewhere to keep checkpoints.
pub trait CheckpointStore: Send + Debug {
    /// Store a checkpoint, replacing any with the same step.
    fn save(&mut self, checkpoint: Checkpoint) -> Result<(), OutputError>;

    /// Retrieve the checkpoint for a step.
    fn load(&self, step: usize) -> Result<Checkpoint, OutputError>;
}

/// Checkpoints kept in memory as JSON.
///
/// Clones share the same storage, so a store can be handed to a solver
/// and still be read from afterwards.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<Mutex<BTreeMap<usize, String>>>,
}

impl MemoryCheckpointStore {
    /// Steps with a stored checkpoint, in order.
    pub fn steps(&self) -> Vec<usize> {
        self.checkpoints.lock().keys().copied().collect()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, checkpoint: Checkpoint) -> Result<(), OutputError> {
        let json = checkpoint.to_json()?;
        self.checkpoints.lock().insert(checkpoint.step, json);
        Ok(())
    }

    fn load(&self, step: usize) -> Result<Checkpoint, OutputError> {
        let checkpoints = self.checkpoints.lock();
        let json = checkpoints
            .get(&step)
            .ok_or(OutputError::MissingCheckpoint { step })?;
        Checkpoint::from_json(json)
    }
}

/// A consumer of simulation state at output steps.
pub trait OutputWriter<const DIM: usize>: Send + Debug {
    /// Write the state after step `step` of `nsteps`.
    fn write(&mut self, step: usize, nsteps: usize, mesh: &Mesh<DIM>) -> Result<(), OutputError>;
}

/// Logs summary statistics of every output step.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogWriter;

impl<const DIM: usize> OutputWriter<DIM> for LogWriter {
    fn write(&mut self, step: usize, nsteps: usize, mesh: &Mesh<DIM>) -> Result<(), OutputError> {
        log::info!(
            "step {step}/{nsteps}: {} particles, mass {:.6e}, nodal mass {:.6e}, \
             kinetic energy {:.6e}, strain energy {:.6e}",
            mesh.nparticles(),
            mesh.total_particle_mass(),
            mesh.total_nodal_mass(SOLID),
            mesh.kinetic_energy(),
            mesh.strain_energy(),
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct Frame<'a> {
    step: usize,
    particles: &'a [ParticleRecord],
}

/// Writes every particle as one line of JSON per output step.
#[derive(Debug)]
pub struct JsonLinesWriter<W> {
    out: W,
}

impl<W: Write> JsonLinesWriter<W> {
    /// Write to `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W, const DIM: usize> OutputWriter<DIM> for JsonLinesWriter<W>
where
    W: Write + Send + Debug,
{
    fn write(&mut self, step: usize, _nsteps: usize, mesh: &Mesh<DIM>) -> Result<(), OutputError> {
        let particles: Vec<ParticleRecord> = mesh.particles().iter().map(|p| p.record()).collect();
        serde_json::to_writer(&mut self.out, &Frame {
            step,
            particles: &particles,
        })?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}
