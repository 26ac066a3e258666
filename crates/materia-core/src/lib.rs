//! This is the core crate containing `materia`'s functionality,
//! an explicit Material Point Method engine.
//! See the `materia` crate's documentation for an introduction.

#![warn(missing_docs)]

pub mod element;
#[doc(inline)]
pub use element::ElementKind;

pub mod node;
#[doc(inline)]
pub use node::{Accumulate, NodalState, Node};

pub mod cell;
#[doc(inline)]
pub use cell::Cell;

pub mod particle;
#[doc(inline)]
pub use particle::{Particle, ParticleError, ParticleRecord};

pub mod material;
#[doc(inline)]
pub use material::{LinearElastic, Material, MaterialConfig, MaterialError, Newtonian};

pub mod comm;
#[doc(inline)]
pub use comm::{Communicator, LocalComm, LocalGroup, ReduceError, SingleRank};

pub mod mesh;
#[doc(inline)]
pub use mesh::{GridView, Mesh, MeshError};

pub mod schedule;

pub mod config;
#[doc(inline)]
pub use config::{ConfigError, SimulationConfig};

pub mod io;
#[doc(inline)]
pub use io::{
    Checkpoint, CheckpointStore, JsonLinesWriter, LogWriter, MemoryCheckpointStore, OutputError,
    OutputWriter,
};

pub mod solver;
#[doc(inline)]
pub use solver::{MpmError, Scheme, Solver, SolverState, Stage};

pub mod gmsh;

/// Number of material phases carried by nodes.
/// The explicit solver is single-phase.
pub const NUM_PHASES: usize = 1;
/// Index of the solid phase.
pub const SOLID: usize = 0;

/// A symmetric tensor in Voigt notation,
/// with components ordered `[xx, yy, zz, xy, yz, xz]`.
///
/// Stresses and strains use this form in every dimension;
/// 2D problems are plane strain.
pub type Voigt = na::SVector<f64, 6>;

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 2D `nalgebra` vector.
pub type Vec2 = na::Vector2<f64>;
/// Type alias for a 3D `nalgebra` vector.
pub type Vec3 = na::Vector3<f64>;
