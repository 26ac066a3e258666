//! The explicit time integrator.
//!
//! [`Solver`] owns the mesh, the materials and the population schedules,
//! and advances the simulation one explicit step at a time.
//! Each step maps particle mass, momentum and forces to the nodes,
//! sums them across ranks, integrates the nodal equations of motion
//! and moves the particles with the result.
//! Stress is updated either before the forces are mapped ([`Scheme::Usf`])
//! or after the particles have moved ([`Scheme::Usl`]).

use std::{collections::BTreeMap, sync::Arc};

use nalgebra as na;
use rayon::prelude::*;

use crate::{
    comm::ReduceError,
    config::{ConfigError, ResumeConfig, SimulationConfig},
    io::{Checkpoint, CheckpointStore, OutputError, OutputWriter},
    material::{Material, MaterialError},
    mesh::{Mesh, MeshError},
    node::Accumulate,
    particle::{Particle, ParticleError},
    schedule::{AddParticleSchedule, ChangeMaterialSchedule, RemoveSchedule},
    SOLID,
};

/// Error that stops a run.
#[derive(thiserror::Error, Debug)]
pub enum MpmError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Invalid mesh operation.
    #[error(transparent)]
    Mesh(#[from] MeshError),
    /// Invalid particle operation.
    #[error(transparent)]
    Particle(#[from] ParticleError),
    /// Invalid material.
    #[error(transparent)]
    Material(#[from] MaterialError),
    /// A cross-rank reduction failed.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    /// Output or checkpointing failed.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// Particles left the mesh.
    #[error("step {step}: {total} particles left the mesh, on this rank {particles:?}")]
    UnlocatableParticles {
        /// The failing step.
        step: usize,
        /// Ids of the lost particles on this rank.
        particles: Vec<usize>,
        /// Number of lost particles on all ranks.
        total: usize,
    },
    /// An earlier step failed and the solver can't continue.
    #[error("the solver was aborted by an earlier error")]
    Aborted,
}

/// When particle stress is updated within a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Update stress first, from the velocities mapped at the start of the step.
    Usf,
    /// Update stress last, from the velocities after integration.
    Usl,
}

/// Lifecycle of a solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// No step has run and no checkpoint has been restored.
    Uninitialised,
    /// Steps are running.
    Stepping,
    /// Every step has run.
    Finished,
    /// A step failed.
    Aborted,
}

/// Global run parameters and progress.
#[derive(Clone, Debug)]
pub struct SolverState<const DIM: usize> {
    /// Time step size.
    pub dt: f64,
    /// The next step to run.
    pub step: usize,
    /// Steps in the whole run.
    pub nsteps: usize,
    /// Output interval.
    pub output_steps: usize,
    /// Stress update scheme.
    pub scheme: Scheme,
    /// Gravitational acceleration.
    pub gravity: na::SVector<f64, DIM>,
    /// Whether particles take the nodal velocity instead of integrating acceleration.
    pub velocity_update: bool,
    /// Whether pressure is smoothed over the mesh.
    pub pressure_smoothing: bool,
    /// Whether strain energy is computed.
    pub strain_energy: bool,
    /// Where to resume from, if anywhere.
    pub resume: Option<ResumeConfig>,
    /// Lifecycle stage.
    pub stage: Stage,
}

/// The explicit MPM solver of one rank.
#[derive(Debug)]
pub struct Solver<const DIM: usize> {
    state: SolverState<DIM>,
    mesh: Mesh<DIM>,
    materials: BTreeMap<usize, Arc<dyn Material<DIM>>>,
    change_materials: ChangeMaterialSchedule,
    removals: RemoveSchedule,
    add_particles: Option<AddParticleSchedule<DIM>>,
    writers: Vec<Box<dyn OutputWriter<DIM>>>,
    checkpoints: Option<Box<dyn CheckpointStore>>,
}

impl<const DIM: usize> Solver<DIM> {
    /// Set up a solver from a configuration and a mesh with its initial particles.
    ///
    /// Sets, materials and boundary conditions from the configuration
    /// are applied to the mesh here.
    /// Particles must already have their volumes assigned,
    /// their mass is computed from the material given to them.
    pub fn new(config: &SimulationConfig, mut mesh: Mesh<DIM>) -> Result<Self, MpmError> {
        let scheme = config.validate::<DIM>()?;
        let analysis = &config.analysis;

        let materials: BTreeMap<usize, Arc<dyn Material<DIM>>> = config
            .materials
            .iter()
            .map(|m| Ok((m.id(), m.build::<DIM>()?)))
            .collect::<Result<_, MaterialError>>()?;

        if let Some(isoparametric) = analysis.isoparametric {
            mesh.force_isoparametric(isoparametric);
        }

        for set in &config.particle_sets {
            mesh.create_particle_set(set.id, set.ids.clone());
        }
        for set in &config.node_sets {
            mesh.create_node_set(set.id, set.ids.clone())?;
        }

        let mut solver = Self {
            state: SolverState {
                dt: analysis.dt,
                step: 0,
                nsteps: analysis.nsteps,
                output_steps: analysis.output_steps,
                scheme,
                gravity: config.gravity::<DIM>(),
                velocity_update: analysis.velocity_update,
                pressure_smoothing: analysis.pressure_smoothing,
                strain_energy: analysis.strain_energy,
                resume: analysis.resume,
                stage: Stage::Uninitialised,
            },
            mesh,
            materials,
            change_materials: ChangeMaterialSchedule::default(),
            removals: RemoveSchedule::default(),
            add_particles: analysis
                .add_particles
                .as_ref()
                .map(AddParticleSchedule::from_config)
                .transpose()?,
            writers: Vec::new(),
            checkpoints: None,
        };

        for props in &config.particle_properties {
            let material = solver.material(props.material_id)?;
            match props.set_id {
                None => solver.mesh.try_iterate_over_particles(|p, _| {
                    p.assign_material(Arc::clone(&material));
                    p.compute_mass()
                })?,
                Some(set) => {
                    solver.check_particle_set(set)?;
                    let mut result = Ok(());
                    solver.mesh.iterate_over_particle_set(set, |p| {
                        p.assign_material(Arc::clone(&material));
                        if let Err(e) = p.compute_mass() {
                            result = Err(e);
                        }
                    })?;
                    result?;
                }
            }
        }

        for constraint in &config.velocity_constraints {
            solver.mesh.assign_velocity_constraints(
                constraint.set_id,
                constraint.dir,
                constraint.velocity,
            )?;
        }
        // concentrated forces live on rank 0 only so the cross-rank sum counts them once
        if solver.mesh.communicator().rank() == 0 {
            for traction in &config.nodal_tractions {
                solver
                    .mesh
                    .assign_nodal_tractions(traction.set_id, traction.dir, traction.force)?;
            }
        }
        for traction in &config.particle_tractions {
            solver.check_particle_set(traction.set_id)?;
            solver.mesh.assign_particle_tractions(
                traction.set_id,
                traction.dir,
                traction.traction,
            )?;
        }

        for change in &analysis.change_materials {
            solver.create_change_material_step(change.step, change.set_id, change.material_id)?;
        }
        for removal in &analysis.remove_particles {
            solver.check_particle_set(removal.set_id)?;
            solver.removals.insert(removal.step, removal.set_id);
        }

        log::info!(
            "solver ready: {:?} scheme, {} particles, {} cells, {} materials",
            scheme,
            solver.mesh.nparticles(),
            solver.mesh.cells().len(),
            solver.materials.len(),
        );
        Ok(solver)
    }

    /// Add a writer called at every output step.
    pub fn with_output(mut self, writer: impl OutputWriter<DIM> + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    /// Set the store checkpoints are saved to and resumed from.
    pub fn with_checkpoint_store(mut self, store: impl CheckpointStore + 'static) -> Self {
        self.checkpoints = Some(Box::new(store));
        self
    }

    //
    // accessors
    //

    /// Run parameters and progress.
    pub fn state(&self) -> &SolverState<DIM> {
        &self.state
    }

    /// The mesh and its particles.
    pub fn mesh(&self) -> &Mesh<DIM> {
        &self.mesh
    }

    /// The mesh and its particles, for modification between steps.
    pub fn mesh_mut(&mut self) -> &mut Mesh<DIM> {
        &mut self.mesh
    }

    /// Materials by id.
    pub fn materials(&self) -> &BTreeMap<usize, Arc<dyn Material<DIM>>> {
        &self.materials
    }

    /// Scheduled material changes.
    pub fn change_material_schedule(&self) -> &ChangeMaterialSchedule {
        &self.change_materials
    }

    /// Scheduled removals.
    pub fn remove_schedule(&self) -> &RemoveSchedule {
        &self.removals
    }

    fn material(&self, id: usize) -> Result<Arc<dyn Material<DIM>>, ConfigError> {
        self.materials
            .get(&id)
            .cloned()
            .ok_or(ConfigError::UnknownMaterial { material: id })
    }

    fn check_particle_set(&self, set: usize) -> Result<(), ConfigError> {
        match self.mesh.particle_set(set) {
            Some(_) => Ok(()),
            None => Err(ConfigError::UnknownParticleSet { set }),
        }
    }

    //
    // population events
    //

    /// Schedule particle set `set_id` to switch to `material_id` at `step`.
    pub fn create_change_material_step(
        &mut self,
        step: usize,
        set_id: usize,
        material_id: usize,
    ) -> Result<(), ConfigError> {
        self.material(material_id)?;
        self.check_particle_set(set_id)?;
        self.change_materials.insert(step, set_id, material_id);
        Ok(())
    }

    /// Fire the pending material changes at `step`.
    ///
    /// With `resume` the particles are left alone and the events are only
    /// marked applied, since restored particles already carry the change.
    /// Returns whether any event was pending.
    pub fn apply_change_material_step(&mut self, step: usize, resume: bool) -> Result<bool, MpmError> {
        let events = self.change_materials.pending_at(step);
        if events.is_empty() {
            return Ok(false);
        }
        if !resume {
            for event in &events {
                let material = self.material(event.material_id)?;
                for &set in &event.set_ids {
                    let changed = self.mesh.iterate_over_particle_set(set, |p| {
                        p.assign_material(Arc::clone(&material));
                    })?;
                    log::info!(
                        "step {step}: {changed} particles of set {set} changed to material {}",
                        event.material_id
                    );
                }
            }
        }
        self.change_materials.mark_applied(step);
        Ok(true)
    }

    /// Retire the material changes a run resumed at `resume_step` has already seen.
    ///
    /// Events before `resume_step` are marked applied without touching particles.
    /// Events at or after it stay pending.
    pub fn resume_change_material(&mut self, resume_step: usize) -> Result<(), MpmError> {
        for step in self.change_materials.steps_before(resume_step) {
            self.apply_change_material_step(step, true)?;
        }
        Ok(())
    }

    /// Remove the particle sets due at `step`, returning how many particles went.
    pub fn apply_remove_step(&mut self, step: usize) -> Result<usize, MpmError> {
        let mut removed = 0;
        for set in self.removals.take_due(step) {
            let ids = self
                .mesh
                .particle_set(set)
                .ok_or(ConfigError::UnknownParticleSet { set })?
                .to_vec();
            let count = self.mesh.remove_particles(&ids);
            log::info!("step {step}: removed {count} particles of set {set}");
            removed += count;
        }
        Ok(removed)
    }

    /// Add the scheduled particle if one is due at `step`.
    ///
    /// Every rank advances the id counter but only rank 0 attaches the particle.
    /// Returns the id of the particle if this rank attached it.
    pub fn add_scheduled_particle(&mut self, step: usize) -> Result<Option<usize>, MpmError> {
        let Some(schedule) = self.add_particles.as_mut() else {
            return Ok(None);
        };
        if !schedule.is_due(step) {
            return Ok(None);
        }
        let material = self
            .materials
            .get(&schedule.material_id())
            .cloned()
            .ok_or(ConfigError::UnknownMaterial {
                material: schedule.material_id(),
            })?;
        if self.mesh.communicator().rank() != 0 {
            schedule.skip_particle();
            return Ok(None);
        }
        let particle: Particle<DIM> = schedule.next_particle(material)?;
        let id = particle.id();
        self.mesh.add_particle(particle)?;
        log::debug!("step {step}: added particle {id}");
        Ok(Some(id))
    }

    //
    // checkpoints
    //

    /// Capture the particles of this rank, to be resumed at the next step to run.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            step: self.state.step,
            dim: DIM,
            particles: self.mesh.particles().iter().map(|p| p.record()).collect(),
        }
    }

    /// Replace every particle with those of a checkpoint
    /// and continue from its step.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), MpmError> {
        if checkpoint.dim != DIM {
            return Err(OutputError::DimensionMismatch {
                expected: DIM,
                found: checkpoint.dim,
            }
            .into());
        }
        self.mesh.clear_particles();
        for record in &checkpoint.particles {
            let material = record.material_id.map(|m| self.material(m)).transpose()?;
            self.mesh
                .add_particle(Particle::from_record(record, material)?)?;
        }
        self.state.step = checkpoint.step;
        Ok(())
    }

    /// Restore the checkpoint named by the resume configuration
    /// and bring the schedules up to its step.
    pub fn checkpoint_resume(&mut self) -> Result<(), MpmError> {
        let Some(ResumeConfig { resume: true, step }) = self.state.resume else {
            return Ok(());
        };
        let store = self
            .checkpoints
            .as_ref()
            .ok_or(ConfigError::MissingCheckpoint { step })?;
        let checkpoint = store.load(step)?;
        self.restore(&checkpoint)?;

        self.resume_change_material(step)?;
        let retired = self.removals.retire_before(step);
        if let Some(schedule) = &mut self.add_particles {
            schedule.skip_to(step);
        }
        log::info!(
            "resumed at step {step} with {} particles, {} removal sets already applied",
            self.mesh.nparticles(),
            retired.len(),
        );
        Ok(())
    }

    //
    // stepping
    //

    fn initialise(&mut self) -> Result<(), MpmError> {
        self.checkpoint_resume()?;
        self.state.stage = if self.state.step >= self.state.nsteps {
            Stage::Finished
        } else {
            Stage::Stepping
        };
        log::info!(
            "starting {:?} run at step {} of {}",
            self.state.scheme,
            self.state.step,
            self.state.nsteps
        );
        Ok(())
    }

    /// Run every remaining step.
    pub fn solve(&mut self) -> Result<(), MpmError> {
        loop {
            match self.state.stage {
                Stage::Finished => return Ok(()),
                Stage::Aborted => return Err(MpmError::Aborted),
                _ => self.step_once()?,
            }
        }
    }

    /// Run a single step, initialising first if needed.
    ///
    /// Does nothing once the run has finished.
    /// Any error aborts the solver for good.
    pub fn step_once(&mut self) -> Result<(), MpmError> {
        match self.state.stage {
            Stage::Aborted => return Err(MpmError::Aborted),
            Stage::Finished => return Ok(()),
            Stage::Uninitialised => {
                if let Err(e) = self.initialise() {
                    return Err(self.abort(e));
                }
                if self.state.stage == Stage::Finished {
                    return Ok(());
                }
            }
            Stage::Stepping => {}
        }

        let step = self.state.step;
        match self.run_step(step) {
            Ok(()) => {
                self.state.step += 1;
                if self.state.step >= self.state.nsteps {
                    self.state.stage = Stage::Finished;
                    log::info!("finished after {} steps", self.state.nsteps);
                }
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn abort(&mut self, error: MpmError) -> MpmError {
        log::error!("step {}: {error}", self.state.step);
        self.state.stage = Stage::Aborted;
        error
    }

    fn run_step(&mut self, step: usize) -> Result<(), MpmError> {
        let dt = self.state.dt;

        self.add_scheduled_particle(step)?;
        self.apply_change_material_step(step, false)?;
        self.apply_remove_step(step)?;

        // nodes are cleared while particles evaluate their shape functions
        {
            let (particles, grid) = self.mesh.split();
            let ((), shapefn) = rayon::join(
                || {
                    grid.reset_nodes();
                    grid.activate_nodes();
                },
                || {
                    particles
                        .par_iter_mut()
                        .try_for_each(|p| p.compute_shapefn(grid.cells))
                },
            );
            shapefn?;
        }
        self.mesh.synchronise_active_nodes()?;

        self.mesh
            .iterate_over_particles_in_order(|p, grid| p.map_mass_momentum_to_nodes(grid.nodes));
        self.mesh.allreduce_nodal_scalar_property(
            |n| n.mass(SOLID),
            |n, mass| n.update_mass(Accumulate::Overwrite, SOLID, mass),
        )?;
        self.mesh.allreduce_nodal_vector_property(
            |n| n.momentum(SOLID),
            |n, momentum| n.update_momentum(Accumulate::Overwrite, SOLID, momentum),
        )?;

        self.mesh.iterate_over_active_nodes(|n| n.compute_velocity());

        if self.state.scheme == Scheme::Usf {
            self.update_stress_strain()?;
        }

        // external and internal forces touch different nodal fields
        {
            let gravity = self.state.gravity;
            let grid = self.mesh.grid();
            let particles = self.mesh.particles();
            rayon::join(
                || {
                    for p in particles {
                        p.map_body_force(grid.nodes, &gravity);
                        p.map_traction_force(grid.nodes);
                    }
                    grid.apply_concentrated_forces(SOLID);
                },
                || {
                    for p in particles {
                        p.map_internal_force(grid.nodes);
                    }
                },
            );
        }
        self.mesh.allreduce_nodal_vector_property(
            |n| n.external_force(SOLID),
            |n, force| n.update_external_force(Accumulate::Overwrite, SOLID, force),
        )?;
        self.mesh.allreduce_nodal_vector_property(
            |n| n.internal_force(SOLID),
            |n, force| n.update_internal_force(Accumulate::Overwrite, SOLID, force),
        )?;

        self.mesh
            .iterate_over_active_nodes(|n| n.compute_acceleration_velocity(SOLID, dt));

        let velocity_update = self.state.velocity_update;
        self.mesh.iterate_over_particles(|p, grid| {
            p.compute_updated_position(grid.nodes, dt, velocity_update)
        });

        if self.state.scheme == Scheme::Usl {
            self.update_stress_strain()?;
        }

        let unlocatable = self.mesh.locate_particles();
        let mut total = [unlocatable.len() as f64];
        self.mesh.communicator().allreduce_sum(&mut total)?;
        if total[0] > 0. {
            return Err(MpmError::UnlocatableParticles {
                step,
                particles: unlocatable,
                total: total[0] as usize,
            });
        }

        log::debug!(
            "step {step}: {} particles, {} active nodes",
            self.mesh.nparticles(),
            self.mesh.active_nodes().count_ones(..),
        );

        if step % self.state.output_steps == 0 {
            self.write_output(step)?;
        }
        Ok(())
    }

    fn update_stress_strain(&mut self) -> Result<(), MpmError> {
        let dt = self.state.dt;
        self.mesh.iterate_over_particles(|p, grid| {
            p.compute_strain(grid.nodes, dt);
            p.update_volume();
        });
        if self.state.pressure_smoothing {
            self.smooth_pressure()?;
        }
        self.mesh.try_iterate_over_particles(|p, _| p.compute_stress())?;
        if self.state.strain_energy {
            self.mesh
                .iterate_over_particles(|p, _| p.compute_strain_energy());
        }
        Ok(())
    }

    fn smooth_pressure(&mut self) -> Result<(), MpmError> {
        self.mesh.iterate_over_nodes(|n| n.assign_pressure(SOLID, 0.));
        self.mesh
            .iterate_over_particles_in_order(|p, grid| p.map_pressure_to_nodes(grid.nodes));
        // contributions are already normalised by the reduced nodal mass
        self.mesh.allreduce_nodal_scalar_property(
            |n| n.pressure(SOLID),
            |n, pressure| n.assign_pressure(SOLID, pressure),
        )?;
        self.mesh
            .iterate_over_particles(|p, grid| p.compute_pressure_smoothing(grid.nodes));
        Ok(())
    }

    fn write_output(&mut self, step: usize) -> Result<(), MpmError> {
        if self.checkpoints.is_some() {
            let mut checkpoint = self.checkpoint();
            checkpoint.step = step + 1;
            if let Some(store) = self.checkpoints.as_mut() {
                store.save(checkpoint)?;
            }
        }
        for writer in &mut self.writers {
            writer.write(step, self.state.nsteps, &self.mesh)?;
        }
        Ok(())
    }
}
