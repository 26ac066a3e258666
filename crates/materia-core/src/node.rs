//! Mesh nodes, the per-vertex accumulators of the background grid.
//!
//! Nodes are stored in an arena inside the [`Mesh`][crate::Mesh]
//! and referred to by index from cells and particles.
//! Every accumulation method takes `&self` and locks the node's state,
//! so particles sharing a node can contribute to it from parallel iterations.

use nalgebra as na;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::NUM_PHASES;

/// Nodes with mass at or below this are treated as massless
/// and never divided by.
pub const MASS_TOLERANCE: f64 = 1.0e-15;

/// How a value is combined with a nodal quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accumulate {
    /// Add the value to what is already there.
    Add,
    /// Replace what is there with the value.
    /// Used to write back the results of cross-rank reductions.
    Overwrite,
}

impl Accumulate {
    #[inline]
    fn apply<T>(self, target: &mut T, value: T)
    where
        T: std::ops::AddAssign,
    {
        match self {
            Self::Add => *target += value,
            Self::Overwrite => *target = value,
        }
    }
}

/// The mutable per-step state of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodalState<const DIM: usize> {
    /// Mass per phase.
    pub mass: [f64; NUM_PHASES],
    /// Momentum per phase.
    pub momentum: [na::SVector<f64, DIM>; NUM_PHASES],
    /// External force (gravity, tractions) per phase.
    pub external_force: [na::SVector<f64, DIM>; NUM_PHASES],
    /// Internal force (divergence of stress) per phase.
    pub internal_force: [na::SVector<f64, DIM>; NUM_PHASES],
    /// Velocity per phase.
    pub velocity: [na::SVector<f64, DIM>; NUM_PHASES],
    /// Acceleration per phase.
    pub acceleration: [na::SVector<f64, DIM>; NUM_PHASES],
    /// Smoothed pressure per phase.
    pub pressure: [f64; NUM_PHASES],
}

impl<const DIM: usize> NodalState<DIM> {
    /// A state with every quantity set to zero.
    pub fn zeroed() -> Self {
        Self {
            mass: [0.; NUM_PHASES],
            momentum: [na::SVector::zeros(); NUM_PHASES],
            external_force: [na::SVector::zeros(); NUM_PHASES],
            internal_force: [na::SVector::zeros(); NUM_PHASES],
            velocity: [na::SVector::zeros(); NUM_PHASES],
            acceleration: [na::SVector::zeros(); NUM_PHASES],
            pressure: [0.; NUM_PHASES],
        }
    }

    /// Whether every quantity is exactly zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::zeroed()
    }
}

/// A node of the background mesh.
#[derive(Debug)]
pub struct Node<const DIM: usize> {
    id: usize,
    coordinates: na::SVector<f64, DIM>,
    active: AtomicBool,
    state: Mutex<NodalState<DIM>>,
    /// prescribed velocity components as (direction, velocity)
    velocity_constraints: Vec<(usize, f64)>,
    /// concentrated forces applied every step, from nodal tractions
    concentrated_force: na::SVector<f64, DIM>,
}

impl<const DIM: usize> Node<DIM> {
    /// Create an inactive node with zero state.
    pub fn new(id: usize, coordinates: na::SVector<f64, DIM>) -> Self {
        Self {
            id,
            coordinates,
            active: AtomicBool::new(false),
            state: Mutex::new(NodalState::zeroed()),
            velocity_constraints: Vec::new(),
            concentrated_force: na::SVector::zeros(),
        }
    }

    /// Index of this node in the mesh.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Position of this node.
    #[inline]
    pub fn coordinates(&self) -> na::SVector<f64, DIM> {
        self.coordinates
    }

    /// Zero every accumulated quantity and deactivate the node.
    pub fn reset(&self) {
        *self.state.lock() = NodalState::zeroed();
        self.active.store(false, Ordering::Relaxed);
    }

    /// Whether a particle touched this node in the current step.
    #[inline]
    pub fn status(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Set the activation flag.
    #[inline]
    pub fn assign_status(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// A copy of the current state.
    pub fn state(&self) -> NodalState<DIM> {
        self.state.lock().clone()
    }

    //
    // accumulation
    //

    /// Accumulate mass.
    pub fn update_mass(&self, mode: Accumulate, phase: usize, mass: f64) {
        mode.apply(&mut self.state.lock().mass[phase], mass);
    }

    /// Accumulate momentum.
    pub fn update_momentum(&self, mode: Accumulate, phase: usize, momentum: na::SVector<f64, DIM>) {
        mode.apply(&mut self.state.lock().momentum[phase], momentum);
    }

    /// Accumulate external force.
    pub fn update_external_force(
        &self,
        mode: Accumulate,
        phase: usize,
        force: na::SVector<f64, DIM>,
    ) {
        mode.apply(&mut self.state.lock().external_force[phase], force);
    }

    /// Accumulate internal force.
    pub fn update_internal_force(
        &self,
        mode: Accumulate,
        phase: usize,
        force: na::SVector<f64, DIM>,
    ) {
        mode.apply(&mut self.state.lock().internal_force[phase], force);
    }

    /// Add a mass-weighted pressure contribution.
    ///
    /// The contribution is normalised by the nodal mass as it arrives,
    /// so the sum over all contributions is already the smoothed pressure
    /// and reductions assign it with [`assign_pressure`][Self::assign_pressure]
    /// rather than dividing afterwards.
    /// Massless nodes ignore the contribution.
    pub fn update_mass_pressure(&self, phase: usize, mass_pressure: f64) {
        let mut state = self.state.lock();
        if state.mass[phase] > MASS_TOLERANCE {
            state.pressure[phase] += mass_pressure / state.mass[phase];
        }
    }

    /// Overwrite the nodal pressure.
    pub fn assign_pressure(&self, phase: usize, pressure: f64) {
        self.state.lock().pressure[phase] = pressure;
    }

    //
    // getters
    //

    /// Nodal mass.
    #[inline]
    pub fn mass(&self, phase: usize) -> f64 {
        self.state.lock().mass[phase]
    }

    /// Nodal momentum.
    #[inline]
    pub fn momentum(&self, phase: usize) -> na::SVector<f64, DIM> {
        self.state.lock().momentum[phase]
    }

    /// Nodal external force.
    #[inline]
    pub fn external_force(&self, phase: usize) -> na::SVector<f64, DIM> {
        self.state.lock().external_force[phase]
    }

    /// Nodal internal force.
    #[inline]
    pub fn internal_force(&self, phase: usize) -> na::SVector<f64, DIM> {
        self.state.lock().internal_force[phase]
    }

    /// Nodal velocity.
    #[inline]
    pub fn velocity(&self, phase: usize) -> na::SVector<f64, DIM> {
        self.state.lock().velocity[phase]
    }

    /// Nodal acceleration.
    #[inline]
    pub fn acceleration(&self, phase: usize) -> na::SVector<f64, DIM> {
        self.state.lock().acceleration[phase]
    }

    /// Smoothed nodal pressure.
    #[inline]
    pub fn pressure(&self, phase: usize) -> f64 {
        self.state.lock().pressure[phase]
    }

    //
    // integration
    //

    /// Derive velocity from momentum for every phase with mass.
    pub fn compute_velocity(&self) {
        let mut state = self.state.lock();
        for phase in 0..NUM_PHASES {
            if state.mass[phase] > MASS_TOLERANCE {
                state.velocity[phase] = state.momentum[phase] / state.mass[phase];
            }
        }
        self.apply_velocity_constraints(&mut state);
    }

    /// Derive acceleration from the total force and integrate velocity over `dt`.
    pub fn compute_acceleration_velocity(&self, phase: usize, dt: f64) {
        let mut state = self.state.lock();
        if state.mass[phase] > MASS_TOLERANCE {
            let total_force = state.external_force[phase] + state.internal_force[phase];
            state.acceleration[phase] = total_force / state.mass[phase];
            let acceleration = state.acceleration[phase];
            state.velocity[phase] += acceleration * dt;
        }
        self.apply_velocity_constraints(&mut state);
    }

    fn apply_velocity_constraints(&self, state: &mut NodalState<DIM>) {
        for &(dir, velocity) in &self.velocity_constraints {
            for phase in 0..NUM_PHASES {
                state.velocity[phase][dir] = velocity;
                state.acceleration[phase][dir] = 0.;
            }
        }
    }

    //
    // boundary conditions
    //

    /// Prescribe the velocity component in direction `dir`.
    ///
    /// Returns false if `dir` is not a valid direction.
    pub fn assign_velocity_constraint(&mut self, dir: usize, velocity: f64) -> bool {
        if dir >= DIM {
            return false;
        }
        self.velocity_constraints.retain(|(d, _)| *d != dir);
        self.velocity_constraints.push((dir, velocity));
        true
    }

    /// Prescribed velocity components as (direction, velocity) pairs.
    pub fn velocity_constraints(&self) -> &[(usize, f64)] {
        &self.velocity_constraints
    }

    /// Add a concentrated force component applied every step.
    ///
    /// Returns false if `dir` is not a valid direction.
    pub fn assign_concentrated_force(&mut self, dir: usize, force: f64) -> bool {
        if dir >= DIM {
            return false;
        }
        self.concentrated_force[dir] += force;
        true
    }

    /// Whether this node carries a concentrated force.
    #[inline]
    pub fn has_concentrated_force(&self) -> bool {
        self.concentrated_force.iter().any(|f| *f != 0.)
    }

    /// Add the concentrated force to the external force.
    pub fn apply_concentrated_force(&self, phase: usize) {
        if self.has_concentrated_force() {
            self.update_external_force(Accumulate::Add, phase, self.concentrated_force);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rayon::prelude::*;

    const PHASE: usize = 0;

    #[test]
    fn accumulation_modes() {
        let node = Node::new(0, na::Vector2::new(0., 0.));
        node.update_mass(Accumulate::Add, PHASE, 1.5);
        node.update_mass(Accumulate::Add, PHASE, 2.5);
        assert_eq!(node.mass(PHASE), 4.);
        node.update_mass(Accumulate::Overwrite, PHASE, 10.);
        assert_eq!(node.mass(PHASE), 10.);

        node.update_momentum(Accumulate::Add, PHASE, na::Vector2::new(1., 2.));
        node.update_momentum(Accumulate::Overwrite, PHASE, na::Vector2::new(3., 4.));
        assert_eq!(node.momentum(PHASE), na::Vector2::new(3., 4.));
    }

    #[test]
    fn concurrent_contributions_are_not_lost() {
        let node = Node::new(0, na::Vector3::zeros());
        (0..10_000).into_par_iter().for_each(|_| {
            node.update_mass(Accumulate::Add, PHASE, 1.);
            node.update_internal_force(Accumulate::Add, PHASE, na::Vector3::new(1., 0., -1.));
        });
        assert_eq!(node.mass(PHASE), 10_000.);
        assert_eq!(
            node.internal_force(PHASE),
            na::Vector3::new(10_000., 0., -10_000.)
        );
    }

    #[test]
    fn massless_nodes_keep_zero_velocity() {
        let node = Node::new(0, na::Vector2::zeros());
        node.update_external_force(Accumulate::Add, PHASE, na::Vector2::new(1., 1.));
        node.compute_velocity();
        node.compute_acceleration_velocity(PHASE, 0.1);
        let state = node.state();
        assert_eq!(state.velocity[PHASE], na::Vector2::zeros());
        assert_eq!(state.acceleration[PHASE], na::Vector2::zeros());
        assert!(state.velocity[PHASE].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn velocity_and_acceleration() {
        let node = Node::new(0, na::Vector2::zeros());
        node.update_mass(Accumulate::Add, PHASE, 2.);
        node.update_momentum(Accumulate::Add, PHASE, na::Vector2::new(4., -2.));
        node.compute_velocity();
        assert_eq!(node.velocity(PHASE), na::Vector2::new(2., -1.));

        node.update_external_force(Accumulate::Add, PHASE, na::Vector2::new(0., -20.));
        node.update_internal_force(Accumulate::Add, PHASE, na::Vector2::new(2., 0.));
        node.compute_acceleration_velocity(PHASE, 0.5);
        assert_eq!(node.acceleration(PHASE), na::Vector2::new(1., -10.));
        assert_relative_eq!(node.velocity(PHASE), na::Vector2::new(2.5, -6.));
    }

    #[test]
    fn velocity_constraints_override_integration() {
        let mut node = Node::new(0, na::Vector2::zeros());
        assert!(node.assign_velocity_constraint(1, 0.));
        assert!(!node.assign_velocity_constraint(2, 0.));
        node.update_mass(Accumulate::Add, PHASE, 1.);
        node.update_momentum(Accumulate::Add, PHASE, na::Vector2::new(1., 1.));
        node.compute_velocity();
        assert_eq!(node.velocity(PHASE), na::Vector2::new(1., 0.));

        node.update_external_force(Accumulate::Add, PHASE, na::Vector2::new(0., -9.81));
        node.compute_acceleration_velocity(PHASE, 0.1);
        assert_eq!(node.velocity(PHASE).y, 0.);
        assert_eq!(node.acceleration(PHASE).y, 0.);
    }

    #[test]
    fn pressure_is_normalised_on_arrival() {
        let node = Node::new(0, na::Vector2::zeros());
        // no mass yet, contribution is dropped
        node.update_mass_pressure(PHASE, 5.);
        assert_eq!(node.pressure(PHASE), 0.);

        node.update_mass(Accumulate::Add, PHASE, 4.);
        node.update_mass_pressure(PHASE, 2. * 10.);
        node.update_mass_pressure(PHASE, 2. * 20.);
        assert_relative_eq!(node.pressure(PHASE), 15.);

        node.assign_pressure(PHASE, 1.);
        assert_eq!(node.pressure(PHASE), 1.);
    }

    #[test]
    fn concentrated_forces_add_to_external_force() {
        let mut node = Node::new(0, na::Vector2::zeros());
        assert!(!node.has_concentrated_force());
        node.apply_concentrated_force(PHASE);
        assert_eq!(node.external_force(PHASE), na::Vector2::zeros());

        assert!(node.assign_concentrated_force(1, -3.));
        assert!(!node.assign_concentrated_force(2, 1.));
        assert!(node.has_concentrated_force());
        node.update_external_force(Accumulate::Add, PHASE, na::Vector2::new(1., 1.));
        node.apply_concentrated_force(PHASE);
        assert_eq!(node.external_force(PHASE), na::Vector2::new(1., -2.));
    }

    #[test]
    fn reset_clears_everything() {
        let node = Node::new(0, na::Vector2::zeros());
        node.assign_status(true);
        node.update_mass(Accumulate::Add, PHASE, 1.);
        node.update_momentum(Accumulate::Add, PHASE, na::Vector2::new(1., 1.));
        node.reset();
        assert!(!node.status());
        assert!(node.state().is_zero());
    }
}
