//! `materia` is an explicit Material Point Method (MPM) engine
//! for simulating large deformations of solids and fluids.
//!
//! A body is discretised into material points (particles)
//! that carry mass, velocity, stress and material state,
//! moving through a fixed background mesh of nodes and cells.
//! Each time step maps particle quantities to the nodes,
//! solves the equations of motion there
//! and maps the result back to move the particles.
//!
//! # Setting up a simulation
//!
//! A simulation is built from three things:
//! - a [`Mesh`], either generated with [`Mesh::hypercube_grid`]
//!   or loaded from a Gmsh file with the [`gmsh`] module,
//!   and filled with particles e.g. using [`Mesh::seed_particles`],
//! - a [`SimulationConfig`] parsed from JSON,
//!   naming the analysis scheme, the materials, boundary conditions
//!   and events such as adding, removing or re-materialing particles,
//! - optionally [`OutputWriter`]s and a [`CheckpointStore`]
//!   that receive the state every `output_steps` steps.
//!
//! These are combined into a [`Solver`] which runs the time loop:
//! ```
//! # use materia::*;
//! # use std::sync::Arc;
//! let config = SimulationConfig::from_json_str(r#"{
//!     "analysis": {"type": "MPMExplicitUSL2D", "dt": 1.0e-4, "nsteps": 5,
//!                  "gravity": [0.0, -9.81]},
//!     "materials": [{"type": "LinearElastic", "id": 0, "density": 1000.0,
//!                    "youngs_modulus": 1.0e6, "poisson_ratio": 0.3}],
//!     "particle_properties": [{"material_id": 0}]
//! }"#)?;
//!
//! let mut mesh = Mesh::hypercube_grid(Vec2::zeros(), Vec2::repeat(0.5), [4, 4])?;
//! let material = config.materials[0].build::<2>()?;
//! mesh.seed_particles(2, 0, &material, |s| s.coordinates.y < 1.)?;
//!
//! let mut solver = Solver::new(&config, mesh)?.with_output(LogWriter);
//! solver.solve()?;
//! assert_eq!(solver.state().stage, Stage::Finished);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Schemes
//!
//! Two explicit schemes are available, chosen by the analysis type
//! `MPMExplicitUSF<dim>D` or `MPMExplicitUSL<dim>D`:
//! update stress first ([`Scheme::Usf`]) computes strain and stress
//! from the nodal velocities at the start of the step,
//! update stress last ([`Scheme::Usl`]) from the velocities after integration.
//!
//! # Multiple ranks
//!
//! A mesh can be given a [`Communicator`] with [`Mesh::with_communicator`].
//! Every rank holds the whole mesh but only its own particles,
//! and nodal quantities are summed across ranks every step.
//! [`LocalGroup`] provides communicators for ranks running as threads
//! of the same process.

#![warn(missing_docs)]

#[doc(inline)]
pub use materia_core::*;
