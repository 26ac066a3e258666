//! Material points and their transfer operators.
//!
//! A particle carries the physical state of the simulated body.
//! Every step it caches the shape functions of the cell it lies in
//! and uses them to exchange quantities with that cell's nodes.

use std::sync::Arc;

use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{
    cell::Cell,
    material::{Material, ParticleContext, StateVars, PRESSURE},
    node::{Accumulate, Node},
    Voigt, SOLID,
};

/// Error in a particle operation.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParticleError {
    /// The particle hasn't been located in a cell.
    #[error("particle {id} is not in any cell")]
    NoCell {
        /// Id of the particle.
        id: usize,
    },
    /// The particle has no material.
    #[error("particle {id} has no material")]
    NoMaterial {
        /// Id of the particle.
        id: usize,
    },
    /// Volume must be positive.
    #[error("particle {id}: invalid volume {volume}")]
    InvalidVolume {
        /// Id of the particle.
        id: usize,
        /// The offending volume.
        volume: f64,
    },
    /// A vector in a record has the wrong number of components.
    #[error("particle {id}: expected {expected} components, found {found}")]
    DimensionMismatch {
        /// Id of the particle.
        id: usize,
        /// Dimension of the mesh.
        expected: usize,
        /// Length of the vector.
        found: usize,
    },
}

/// Position of the tensor component `(a, b)` in a [`Voigt`] vector.
#[inline]
pub fn voigt_index(a: usize, b: usize) -> usize {
    match (a.min(b), a.max(b)) {
        (i, j) if i == j => i,
        (0, 1) => 3,
        (1, 2) => 4,
        _ => 5,
    }
}

/// A material point.
#[derive(Clone, Debug)]
pub struct Particle<const DIM: usize> {
    id: usize,
    coordinates: na::SVector<f64, DIM>,
    displacement: na::SVector<f64, DIM>,
    cell: Option<usize>,
    xi: na::SVector<f64, DIM>,
    mass: f64,
    volume: f64,
    mass_density: f64,
    stress: Voigt,
    strain: Voigt,
    dstrain: Voigt,
    strain_rate: Voigt,
    velocity: na::SVector<f64, DIM>,
    traction: na::SVector<f64, DIM>,
    material: Option<Arc<dyn Material<DIM>>>,
    state_vars: StateVars,
    strain_energy: f64,
    phase: usize,
    // interpolation cache, valid from compute_shapefn until the next relocation
    nodes: Vec<usize>,
    shapefn: Vec<f64>,
    dn_dx: Vec<na::SVector<f64, DIM>>,
}

impl<const DIM: usize> Particle<DIM> {
    /// Create a particle at rest with no mass, volume or material.
    pub fn new(id: usize, coordinates: na::SVector<f64, DIM>) -> Self {
        Self {
            id,
            coordinates,
            displacement: na::SVector::zeros(),
            cell: None,
            xi: na::SVector::zeros(),
            mass: 0.,
            volume: 0.,
            mass_density: 0.,
            stress: Voigt::zeros(),
            strain: Voigt::zeros(),
            dstrain: Voigt::zeros(),
            strain_rate: Voigt::zeros(),
            velocity: na::SVector::zeros(),
            traction: na::SVector::zeros(),
            material: None,
            state_vars: StateVars::new(),
            strain_energy: 0.,
            phase: SOLID,
            nodes: Vec::new(),
            shapefn: Vec::new(),
            dn_dx: Vec::new(),
        }
    }

    //
    // accessors
    //

    /// Unique id of the particle.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current position.
    #[inline]
    pub fn coordinates(&self) -> na::SVector<f64, DIM> {
        self.coordinates
    }

    /// Displacement since creation.
    #[inline]
    pub fn displacement(&self) -> na::SVector<f64, DIM> {
        self.displacement
    }

    /// Index of the cell containing the particle, if located.
    #[inline]
    pub fn cell(&self) -> Option<usize> {
        self.cell
    }

    /// Local coordinates within the containing cell.
    #[inline]
    pub fn local_coordinates(&self) -> na::SVector<f64, DIM> {
        self.xi
    }

    /// Mass.
    #[inline]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Current volume.
    #[inline]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Current mass density.
    #[inline]
    pub fn mass_density(&self) -> f64 {
        self.mass_density
    }

    /// Stress in Voigt notation.
    #[inline]
    pub fn stress(&self) -> Voigt {
        self.stress
    }

    /// Accumulated strain in Voigt notation, with engineering shear.
    #[inline]
    pub fn strain(&self) -> Voigt {
        self.strain
    }

    /// Strain increment of the latest step.
    #[inline]
    pub fn dstrain(&self) -> Voigt {
        self.dstrain
    }

    /// Strain rate of the latest step.
    #[inline]
    pub fn strain_rate(&self) -> Voigt {
        self.strain_rate
    }

    /// Velocity.
    #[inline]
    pub fn velocity(&self) -> na::SVector<f64, DIM> {
        self.velocity
    }

    /// Traction force applied every step.
    #[inline]
    pub fn traction(&self) -> na::SVector<f64, DIM> {
        self.traction
    }

    /// The particle's material, if assigned.
    #[inline]
    pub fn material(&self) -> Option<&Arc<dyn Material<DIM>>> {
        self.material.as_ref()
    }

    /// Id of the particle's material, if assigned.
    #[inline]
    pub fn material_id(&self) -> Option<usize> {
        self.material.as_ref().map(|m| m.id())
    }

    /// Material state variables.
    #[inline]
    pub fn state_vars(&self) -> &StateVars {
        &self.state_vars
    }

    /// Look up a single state variable.
    #[inline]
    pub fn state_variable(&self, name: &str) -> Option<f64> {
        self.state_vars.get(name).copied()
    }

    /// Strain energy computed in the latest step.
    #[inline]
    pub fn strain_energy(&self) -> f64 {
        self.strain_energy
    }

    /// Phase index, always the solid phase.
    #[inline]
    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Kinetic energy `m |v|^2 / 2`.
    #[inline]
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.norm_squared()
    }

    /// Node indices the particle interpolates from.
    #[inline]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// Shape function values at the particle.
    #[inline]
    pub fn shapefn(&self) -> &[f64] {
        &self.shapefn
    }

    //
    // assignment
    //

    pub(crate) fn assign_cell(&mut self, cell: usize, xi: na::SVector<f64, DIM>) {
        self.cell = Some(cell);
        self.xi = xi;
    }

    pub(crate) fn clear_cell(&mut self) {
        self.cell = None;
    }

    /// Move the particle without touching its displacement.
    ///
    /// The containing cell is stale until the mesh relocates particles.
    pub fn assign_coordinates(&mut self, coordinates: na::SVector<f64, DIM>) {
        self.coordinates = coordinates;
    }

    /// Set the initial volume.
    pub fn assign_volume(&mut self, volume: f64) -> Result<(), ParticleError> {
        if !(volume > 0. && volume.is_finite()) {
            return Err(ParticleError::InvalidVolume {
                id: self.id,
                volume,
            });
        }
        self.volume = volume;
        Ok(())
    }

    /// Point the particle at a material and reset its state variables.
    ///
    /// Mass and density are unchanged, so reassigning a material mid-run
    /// conserves mass. Use [`compute_mass`][Self::compute_mass] to derive them.
    pub fn assign_material(&mut self, material: Arc<dyn Material<DIM>>) {
        self.state_vars = material.initialise_state_variables();
        self.material = Some(material);
    }

    /// Overwrite the stress.
    pub fn assign_stress(&mut self, stress: Voigt) {
        self.stress = stress;
    }

    /// Overwrite the velocity.
    pub fn assign_velocity(&mut self, velocity: na::SVector<f64, DIM>) {
        self.velocity = velocity;
    }

    /// Overwrite a state variable.
    pub fn assign_state_variable(&mut self, name: &str, value: f64) {
        self.state_vars.insert(name.to_string(), value);
    }

    /// Apply a surface traction in direction `dir`.
    ///
    /// The traction is turned into a force using the side length
    /// of a cube with the particle's volume.
    /// Returns false if `dir` is not a valid direction.
    pub fn assign_traction(&mut self, dir: usize, traction: f64) -> bool {
        if dir >= DIM {
            return false;
        }
        let side = self.volume.powf(1. / DIM as f64);
        self.traction[dir] = traction * self.volume / side;
        true
    }

    /// Derive mass from volume and the material's density.
    pub fn compute_mass(&mut self) -> Result<(), ParticleError> {
        let material = self
            .material
            .as_ref()
            .ok_or(ParticleError::NoMaterial { id: self.id })?;
        if self.volume <= 0. {
            return Err(ParticleError::InvalidVolume {
                id: self.id,
                volume: self.volume,
            });
        }
        self.mass_density = material.density();
        self.mass = self.volume * self.mass_density;
        Ok(())
    }

    //
    // transfer operators
    //

    /// Evaluate and cache shape functions of the containing cell.
    pub fn compute_shapefn(&mut self, cells: &[Cell<DIM>]) -> Result<(), ParticleError> {
        let cell = &cells[self.cell.ok_or(ParticleError::NoCell { id: self.id })?];
        self.nodes.clear();
        self.nodes.extend_from_slice(cell.nodes());
        self.shapefn = cell.shapefn(&self.xi);
        self.dn_dx = cell.grad_shapefn(&self.xi);
        Ok(())
    }

    /// Add mass and momentum to the cached nodes.
    pub fn map_mass_momentum_to_nodes(&self, nodes: &[Node<DIM>]) {
        for (&n, &shape) in self.nodes.iter().zip(&self.shapefn) {
            let node = &nodes[n];
            node.update_mass(Accumulate::Add, self.phase, shape * self.mass);
            node.update_momentum(
                Accumulate::Add,
                self.phase,
                self.velocity * (shape * self.mass),
            );
        }
    }

    /// Add the weight of the particle to the cached nodes' external force.
    pub fn map_body_force(&self, nodes: &[Node<DIM>], gravity: &na::SVector<f64, DIM>) {
        for (&n, &shape) in self.nodes.iter().zip(&self.shapefn) {
            nodes[n].update_external_force(Accumulate::Add, self.phase, gravity * (shape * self.mass));
        }
    }

    /// Add the traction force to the cached nodes' external force.
    pub fn map_traction_force(&self, nodes: &[Node<DIM>]) {
        if self.traction.iter().all(|t| *t == 0.) {
            return;
        }
        for (&n, &shape) in self.nodes.iter().zip(&self.shapefn) {
            nodes[n].update_external_force(Accumulate::Add, self.phase, self.traction * shape);
        }
    }

    /// Add the divergence of stress to the cached nodes' internal force.
    pub fn map_internal_force(&self, nodes: &[Node<DIM>]) {
        for (&n, grad) in self.nodes.iter().zip(&self.dn_dx) {
            let force = na::SVector::<f64, DIM>::from_fn(|d, _| {
                -self.volume
                    * (0..DIM)
                        .map(|e| self.stress[voigt_index(d, e)] * grad[e])
                        .sum::<f64>()
            });
            nodes[n].update_internal_force(Accumulate::Add, self.phase, force);
        }
    }

    /// Compute strain rate and increment from nodal velocities
    /// and accumulate the strain.
    pub fn compute_strain(&mut self, nodes: &[Node<DIM>], dt: f64) {
        let velocity_gradient = self
            .nodes
            .iter()
            .zip(&self.dn_dx)
            .map(|(&n, grad)| nodes[n].velocity(self.phase) * grad.transpose())
            .fold(na::SMatrix::<f64, DIM, DIM>::zeros(), |acc, l| acc + l);

        let mut rate = Voigt::zeros();
        for a in 0..DIM {
            for b in a..DIM {
                rate[voigt_index(a, b)] = if a == b {
                    velocity_gradient[(a, a)]
                } else {
                    velocity_gradient[(a, b)] + velocity_gradient[(b, a)]
                };
            }
        }
        self.strain_rate = rate;
        self.dstrain = rate * dt;
        self.strain += self.dstrain;
    }

    /// Scale volume by the volumetric strain increment.
    pub fn update_volume(&mut self) {
        let dvolumetric = self.dstrain[0] + self.dstrain[1] + self.dstrain[2];
        self.volume *= 1. + dvolumetric;
        self.mass_density /= 1. + dvolumetric;
    }

    /// Add the mass-weighted pressure to the cached nodes.
    ///
    /// Particles whose material has no pressure state contribute nothing.
    pub fn map_pressure_to_nodes(&self, nodes: &[Node<DIM>]) {
        let Some(pressure) = self.state_variable(PRESSURE) else {
            return;
        };
        for (&n, &shape) in self.nodes.iter().zip(&self.shapefn) {
            nodes[n].update_mass_pressure(self.phase, shape * self.mass * pressure);
        }
    }

    /// Replace the particle pressure with the value interpolated from the nodes.
    pub fn compute_pressure_smoothing(&mut self, nodes: &[Node<DIM>]) {
        if !self.state_vars.contains_key(PRESSURE) {
            return;
        }
        let pressure: f64 = self
            .nodes
            .iter()
            .zip(&self.shapefn)
            .map(|(&n, &shape)| shape * nodes[n].pressure(self.phase))
            .sum();
        self.state_vars.insert(PRESSURE.to_string(), pressure);
    }

    /// Update stress through the material.
    pub fn compute_stress(&mut self) -> Result<(), ParticleError> {
        let material = self
            .material
            .as_ref()
            .ok_or(ParticleError::NoMaterial { id: self.id })?;
        let context = ParticleContext {
            id: self.id,
            volume: self.volume,
            mass_density: self.mass_density,
            strain: self.strain,
            strain_rate: self.strain_rate,
        };
        self.stress =
            material.compute_stress(&self.stress, &self.dstrain, &context, &mut self.state_vars);
        Ok(())
    }

    /// Compute the elastic strain energy `V σ·ε / 2`.
    pub fn compute_strain_energy(&mut self) {
        self.strain_energy = 0.5 * self.volume * self.stress.dot(&self.strain);
    }

    /// Move the particle with the nodal velocity field.
    ///
    /// With `velocity_update` the particle velocity is replaced by
    /// the interpolated nodal velocity, otherwise it is integrated
    /// from the interpolated nodal acceleration.
    /// Either way the position advances with the interpolated nodal velocity.
    pub fn compute_updated_position(&mut self, nodes: &[Node<DIM>], dt: f64, velocity_update: bool) {
        let mut nodal_velocity = na::SVector::<f64, DIM>::zeros();
        let mut nodal_acceleration = na::SVector::<f64, DIM>::zeros();
        for (&n, &shape) in self.nodes.iter().zip(&self.shapefn) {
            nodal_velocity += nodes[n].velocity(self.phase) * shape;
            nodal_acceleration += nodes[n].acceleration(self.phase) * shape;
        }

        if velocity_update {
            self.velocity = nodal_velocity;
        } else {
            self.velocity += nodal_acceleration * dt;
        }
        let step = nodal_velocity * dt;
        self.coordinates += step;
        self.displacement += step;
    }

    //
    // checkpointing
    //

    /// Capture the particle's state.
    pub fn record(&self) -> ParticleRecord {
        ParticleRecord {
            id: self.id,
            cell: self.cell,
            coordinates: self.coordinates.iter().copied().collect(),
            displacement: self.displacement.iter().copied().collect(),
            velocity: self.velocity.iter().copied().collect(),
            traction: self.traction.iter().copied().collect(),
            mass: self.mass,
            volume: self.volume,
            mass_density: self.mass_density,
            stress: self.stress.into(),
            strain: self.strain.into(),
            material_id: self.material_id(),
            state_vars: self.state_vars.clone(),
        }
    }

    /// Rebuild a particle from a record.
    ///
    /// The material is looked up by the caller from the record's material id.
    /// State variables come from the record, not the material's initial values.
    pub fn from_record(
        record: &ParticleRecord,
        material: Option<Arc<dyn Material<DIM>>>,
    ) -> Result<Self, ParticleError> {
        let vector = |values: &[f64]| {
            if values.len() == DIM {
                Ok(na::SVector::<f64, DIM>::from_column_slice(values))
            } else {
                Err(ParticleError::DimensionMismatch {
                    id: record.id,
                    expected: DIM,
                    found: values.len(),
                })
            }
        };
        let mut particle = Self::new(record.id, vector(&record.coordinates)?);
        particle.displacement = vector(&record.displacement)?;
        particle.velocity = vector(&record.velocity)?;
        particle.traction = vector(&record.traction)?;
        particle.mass = record.mass;
        particle.volume = record.volume;
        particle.mass_density = record.mass_density;
        particle.stress = Voigt::from(record.stress);
        particle.strain = Voigt::from(record.strain);
        particle.material = material;
        particle.state_vars = record.state_vars.clone();
        // kept as a hint for relocation, local coordinates are recomputed
        particle.cell = record.cell;
        Ok(particle)
    }
}

/// Serializable state of a particle, stored in checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    /// Particle id.
    pub id: usize,
    /// Cell the particle was last located in.
    #[serde(default)]
    pub cell: Option<usize>,
    /// Position.
    pub coordinates: Vec<f64>,
    /// Displacement since creation.
    pub displacement: Vec<f64>,
    /// Velocity.
    pub velocity: Vec<f64>,
    /// Traction force.
    pub traction: Vec<f64>,
    /// Mass.
    pub mass: f64,
    /// Volume.
    pub volume: f64,
    /// Mass density.
    pub mass_density: f64,
    /// Stress in Voigt order.
    pub stress: [f64; 6],
    /// Strain in Voigt order.
    pub strain: [f64; 6],
    /// Material id.
    pub material_id: Option<usize>,
    /// Material state variables.
    pub state_vars: StateVars,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{element::ElementKind, material::LinearElastic};
    use approx::assert_relative_eq;

    /// A single unit square cell with its four nodes.
    fn unit_square() -> (Vec<Node<2>>, Vec<Cell<2>>) {
        let verts = vec![
            na::Vector2::new(0., 0.),
            na::Vector2::new(1., 0.),
            na::Vector2::new(1., 1.),
            na::Vector2::new(0., 1.),
        ];
        let nodes = verts
            .iter()
            .enumerate()
            .map(|(i, v)| Node::new(i, *v))
            .collect();
        let cell = Cell::new(0, ElementKind::Hypercube, vec![0, 1, 2, 3], verts)
            .expect("valid cell");
        (nodes, vec![cell])
    }

    fn particle_at(cells: &[Cell<2>], x: na::Vector2<f64>) -> Particle<2> {
        let mut p = Particle::new(0, x);
        let xi = cells[0].is_point_in_cell(&x).expect("point in cell");
        p.assign_cell(0, xi);
        p.assign_volume(0.25).expect("valid volume");
        p.assign_material(Arc::new(
            LinearElastic::new(0, 1000., 1.0e6, 0.3).expect("valid material"),
        ));
        p.compute_mass().expect("has material");
        p.compute_shapefn(cells).expect("located");
        p
    }

    #[test]
    fn voigt_indices() {
        assert_eq!(voigt_index(0, 0), 0);
        assert_eq!(voigt_index(2, 2), 2);
        assert_eq!(voigt_index(1, 0), 3);
        assert_eq!(voigt_index(1, 2), 4);
        assert_eq!(voigt_index(2, 0), 5);
    }

    #[test]
    fn mass_and_momentum_are_conserved_in_transfer() {
        let (nodes, cells) = unit_square();
        let mut p = particle_at(&cells, na::Vector2::new(0.3, 0.8));
        p.assign_velocity(na::Vector2::new(2., -1.));
        p.map_mass_momentum_to_nodes(&nodes);

        let total_mass: f64 = nodes.iter().map(|n| n.mass(SOLID)).sum();
        let total_momentum: na::Vector2<f64> = nodes.iter().map(|n| n.momentum(SOLID)).sum();
        assert_relative_eq!(total_mass, p.mass());
        assert_relative_eq!(total_momentum, p.velocity() * p.mass());
    }

    #[test]
    fn uniform_stress_gives_balanced_internal_force() {
        let (nodes, cells) = unit_square();
        let mut p = particle_at(&cells, na::Vector2::new(0.5, 0.5));
        p.assign_stress(Voigt::from([-10., -20., -5., 3., 0., 0.]));
        p.map_internal_force(&nodes);

        let total: na::Vector2<f64> = nodes.iter().map(|n| n.internal_force(SOLID)).sum();
        assert_relative_eq!(total, na::Vector2::zeros(), epsilon = 1e-12);
        // compressive stress pushes the corner nodes outwards
        let corner = nodes[2].internal_force(SOLID);
        assert!(corner.x > 0. && corner.y > 0., "got {corner:?}");
    }

    #[test]
    fn traction_is_spread_by_shape_functions() {
        let (nodes, cells) = unit_square();
        let mut p = particle_at(&cells, na::Vector2::new(0.3, 0.8));
        // nothing assigned yet
        p.map_traction_force(&nodes);
        assert!(nodes.iter().all(|n| n.external_force(SOLID) == na::Vector2::zeros()));

        assert!(!p.assign_traction(2, 1.));
        assert!(p.assign_traction(1, 4.));
        p.map_traction_force(&nodes);

        // traction * volume / volume^(1/2) = 4 * 0.25 / 0.5
        let force = 2.;
        for (node, shape) in nodes.iter().zip(p.shapefn()) {
            assert_relative_eq!(
                node.external_force(SOLID),
                na::Vector2::new(0., force * shape),
                epsilon = 1e-12
            );
        }
        assert_relative_eq!(nodes[3].external_force(SOLID).y, 2. * 0.7 * 0.8, epsilon = 1e-12);
    }

    #[test]
    fn strain_rate_of_linear_velocity_field() {
        let (nodes, cells) = unit_square();
        // v = (x, y) + (0, x): uniform expansion plus shear
        for node in &nodes {
            let x = node.coordinates();
            node.update_mass(Accumulate::Add, SOLID, 1.);
            node.update_momentum(Accumulate::Add, SOLID, na::Vector2::new(x.x, x.y + x.x));
            node.compute_velocity();
        }
        let mut p = particle_at(&cells, na::Vector2::new(0.4, 0.4));
        let volume = p.volume();
        p.compute_strain(&nodes, 0.01);

        let rate = p.strain_rate();
        assert_relative_eq!(rate[0], 1., epsilon = 1e-12);
        assert_relative_eq!(rate[1], 1., epsilon = 1e-12);
        assert_relative_eq!(rate[3], 1., epsilon = 1e-12);
        assert_relative_eq!(p.dstrain(), rate * 0.01);

        p.update_volume();
        assert_relative_eq!(p.volume(), volume * 1.02, epsilon = 1e-12);
        assert_relative_eq!(p.mass(), 250.);
    }

    #[test]
    fn position_update_modes() {
        let (nodes, cells) = unit_square();
        for node in &nodes {
            node.update_mass(Accumulate::Add, SOLID, 1.);
            node.update_momentum(Accumulate::Add, SOLID, na::Vector2::new(1., 0.));
            node.update_external_force(Accumulate::Add, SOLID, na::Vector2::new(0., -10.));
            node.compute_velocity();
            node.compute_acceleration_velocity(SOLID, 0.1);
        }

        let start = na::Vector2::new(0.5, 0.5);
        let mut by_velocity = particle_at(&cells, start);
        by_velocity.compute_updated_position(&nodes, 0.1, true);
        assert_relative_eq!(by_velocity.velocity(), na::Vector2::new(1., -1.));
        assert_relative_eq!(by_velocity.coordinates(), na::Vector2::new(0.6, 0.4));

        let mut by_acceleration = particle_at(&cells, start);
        by_acceleration.assign_velocity(na::Vector2::new(0.5, 0.));
        by_acceleration.compute_updated_position(&nodes, 0.1, false);
        assert_relative_eq!(by_acceleration.velocity(), na::Vector2::new(0.5, -1.));
        assert_relative_eq!(by_acceleration.coordinates(), na::Vector2::new(0.6, 0.4));
        assert_relative_eq!(by_acceleration.displacement(), na::Vector2::new(0.1, -0.1));
    }

    #[test]
    fn missing_prerequisites_are_errors() {
        let (_, cells) = unit_square();
        let mut p = Particle::<2>::new(5, na::Vector2::new(0.5, 0.5));
        assert_eq!(p.compute_shapefn(&cells), Err(ParticleError::NoCell { id: 5 }));
        assert_eq!(p.compute_stress(), Err(ParticleError::NoMaterial { id: 5 }));
        assert_eq!(
            p.assign_volume(0.),
            Err(ParticleError::InvalidVolume { id: 5, volume: 0. })
        );
    }

    #[test]
    fn records_restore_state() {
        let (_, cells) = unit_square();
        let mut p = particle_at(&cells, na::Vector2::new(0.2, 0.7));
        p.assign_stress(Voigt::from([1., 2., 3., 4., 5., 6.]));
        p.assign_velocity(na::Vector2::new(-1., 1.));
        p.assign_state_variable("plastic_strain", 0.01);

        let record = p.record();
        let restored = Particle::<2>::from_record(&record, p.material().cloned())
            .expect("dimensions match");
        assert_eq!(restored.record(), record);
        assert_eq!(restored.material_id(), Some(0));

        assert_eq!(
            Particle::<3>::from_record(&record, None).err(),
            Some(ParticleError::DimensionMismatch {
                id: 0,
                expected: 3,
                found: 2
            })
        );
    }
}
