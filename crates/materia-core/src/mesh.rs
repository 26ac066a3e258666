//! The background mesh and the particles living on it.
//!
//! A [`Mesh`] owns nodes, cells and particles in flat arenas,
//! along with named sets of particles and nodes
//! and the bookkeeping of which cells hold particles.
//! Parallel passes over particles go through the `iterate_over_*` methods,
//! which hand each particle a [`GridView`] of the shared nodes and cells.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use fixedbitset as fb;
use itertools::Itertools;
use nalgebra as na;
use rayon::prelude::*;

use crate::{
    cell::{BoundingBox, Cell},
    comm::{Communicator, ReduceError, SingleRank},
    element::ElementKind,
    node::Node,
    particle::{Particle, ParticleError},
};

mod structured;
pub use structured::SeedPoint;

/// Error in building or modifying a mesh.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MeshError {
    /// A cell has the wrong number of nodes for its element kind.
    #[error("cell {cell}: expected {expected} nodes, found {found}")]
    WrongNodeCount {
        /// Index of the cell.
        cell: usize,
        /// Nodes required by the element kind.
        expected: usize,
        /// Nodes given.
        found: usize,
    },
    /// A cell refers to a node that doesn't exist.
    #[error("cell {cell} refers to missing node {node}")]
    MissingNode {
        /// Index of the cell.
        cell: usize,
        /// The missing node index.
        node: usize,
    },
    /// A cell has zero volume.
    #[error("cell {cell} is degenerate")]
    DegenerateCell {
        /// Index of the cell.
        cell: usize,
    },
    /// The mesh has no nodes or no cells.
    #[error("mesh has no nodes or no cells")]
    Empty,
    /// A particle with the same id already exists.
    #[error("duplicate particle id {id}")]
    DuplicateParticle {
        /// The duplicated id.
        id: usize,
    },
    /// A particle lies outside every cell.
    #[error("particle {id} is outside the mesh")]
    ParticleOutside {
        /// Id of the particle.
        id: usize,
    },
    /// A node set refers to a node that doesn't exist.
    #[error("node {node} doesn't exist")]
    UnknownNode {
        /// The missing node index.
        node: usize,
    },
    /// No particle set with the id exists.
    #[error("no particle set with id {set}")]
    UnknownParticleSet {
        /// The set id.
        set: usize,
    },
    /// No node set with the id exists.
    #[error("no node set with id {set}")]
    UnknownNodeSet {
        /// The set id.
        set: usize,
    },
    /// A direction is not less than the mesh dimension.
    #[error("invalid direction {dir}")]
    InvalidDirection {
        /// The direction.
        dir: usize,
    },
    /// A particle operation failed.
    #[error(transparent)]
    Particle(#[from] ParticleError),
    /// A cross-rank reduction failed.
    #[error(transparent)]
    Reduce(#[from] ReduceError),
}

/// Shared read access to the nodes and cells of a mesh,
/// split off from its particles so both can be used at once.
#[derive(Clone, Copy, Debug)]
pub struct GridView<'a, const DIM: usize> {
    /// Every node of the mesh.
    pub nodes: &'a [Node<DIM>],
    /// Every cell of the mesh.
    pub cells: &'a [Cell<DIM>],
    /// Cells holding at least one particle.
    pub occupied_cells: &'a fb::FixedBitSet,
}

impl<'a, const DIM: usize> GridView<'a, DIM> {
    /// Zero every node.
    pub fn reset_nodes(&self) {
        self.nodes.par_iter().for_each(|n| n.reset());
    }

    /// Activate the nodes of every occupied cell.
    pub fn activate_nodes(&self) {
        for c in self.occupied_cells.ones() {
            self.cells[c].activate_nodes(self.nodes);
        }
    }

    /// Add the concentrated forces of every active node to its external force.
    pub fn apply_concentrated_forces(&self, phase: usize) {
        self.nodes
            .par_iter()
            .filter(|n| n.status() && n.has_concentrated_force())
            .for_each(|n| n.apply_concentrated_force(phase));
    }

    /// Find the cell containing a point and its local coordinates there.
    ///
    /// The hinted cell and its neighbours are tried first,
    /// then every cell whose bounding box contains the point.
    pub fn locate(
        &self,
        point: &na::SVector<f64, DIM>,
        hint: Option<usize>,
    ) -> Option<(usize, na::SVector<f64, DIM>)> {
        if let Some(hint) = hint.filter(|&c| c < self.cells.len()) {
            let cell = &self.cells[hint];
            if let Some(xi) = cell.is_point_in_cell(point) {
                return Some((hint, xi));
            }
            for &n in cell.neighbours() {
                if let Some(xi) = self.cells[n].is_point_in_cell(point) {
                    return Some((n, xi));
                }
            }
        }
        self.cells
            .iter()
            .find_map(|c| c.is_point_in_cell(point).map(|xi| (c.id(), xi)))
    }
}

/// The background mesh with its particles.
#[derive(Debug)]
pub struct Mesh<const DIM: usize> {
    nodes: Vec<Node<DIM>>,
    cells: Vec<Cell<DIM>>,
    particles: Vec<Particle<DIM>>,
    /// map from particle id to its index in `particles`
    particle_index: HashMap<usize, usize>,
    particle_sets: BTreeMap<usize, Vec<usize>>,
    node_sets: BTreeMap<usize, Vec<usize>>,
    occupied_cells: fb::FixedBitSet,
    active_nodes: fb::FixedBitSet,
    isoparametric: bool,
    bounds: BoundingBox<DIM>,
    comm: Arc<dyn Communicator>,
}

impl<const DIM: usize> Mesh<DIM> {
    /// Construct a mesh from vertex positions and cells given as
    /// an element kind plus node indices.
    ///
    /// The mesh starts out on a single rank with no particles.
    pub fn new(
        vertices: Vec<na::SVector<f64, DIM>>,
        cells: Vec<(ElementKind, Vec<usize>)>,
    ) -> Result<Self, MeshError> {
        if vertices.is_empty() || cells.is_empty() {
            return Err(MeshError::Empty);
        }

        let cells: Vec<Cell<DIM>> = cells
            .into_iter()
            .enumerate()
            .map(|(id, (kind, node_ids))| {
                let coords = node_ids
                    .iter()
                    .map(|&n| {
                        vertices
                            .get(n)
                            .copied()
                            .ok_or(MeshError::MissingNode { cell: id, node: n })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Cell::new(id, kind, node_ids, coords)
            })
            .collect::<Result<_, _>>()?;

        let nodes: Vec<Node<DIM>> = vertices
            .into_iter()
            .enumerate()
            .map(|(id, x)| Node::new(id, x))
            .collect();

        let mut mesh = Self {
            occupied_cells: fb::FixedBitSet::with_capacity(cells.len()),
            active_nodes: fb::FixedBitSet::with_capacity(nodes.len()),
            isoparametric: cells.iter().any(|c| c.is_isoparametric()),
            bounds: cells
                .iter()
                .map(|c| c.bounds())
                .reduce(|a, b| a.union(&b))
                .ok_or(MeshError::Empty)?,
            nodes,
            cells,
            particles: Vec::new(),
            particle_index: HashMap::new(),
            particle_sets: BTreeMap::new(),
            node_sets: BTreeMap::new(),
            comm: Arc::new(SingleRank),
        };
        mesh.compute_cell_neighbours();
        Ok(mesh)
    }

    fn compute_cell_neighbours(&mut self) {
        let mut cells_of_node: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for cell in &self.cells {
            for &n in cell.nodes() {
                cells_of_node[n].push(cell.id());
            }
        }
        for cell in &mut self.cells {
            let neighbours = cell
                .nodes()
                .iter()
                .flat_map(|&n| cells_of_node[n].iter().copied())
                .filter(|&c| c != cell.id())
                .sorted_unstable()
                .dedup()
                .collect();
            cell.set_neighbours(neighbours);
        }
    }

    /// Attach the communicator of this rank.
    pub fn with_communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    /// Override whether cells invert local coordinates with Newton iteration.
    pub fn force_isoparametric(&mut self, isoparametric: bool) {
        self.isoparametric = isoparametric;
        for cell in &mut self.cells {
            cell.set_isoparametric(isoparametric);
        }
    }

    //
    // accessors
    //

    /// Every node of the mesh.
    #[inline]
    pub fn nodes(&self) -> &[Node<DIM>] {
        &self.nodes
    }

    /// Every cell of the mesh.
    #[inline]
    pub fn cells(&self) -> &[Cell<DIM>] {
        &self.cells
    }

    /// Every particle on this rank.
    #[inline]
    pub fn particles(&self) -> &[Particle<DIM>] {
        &self.particles
    }

    /// Look up a particle by id.
    pub fn particle(&self, id: usize) -> Option<&Particle<DIM>> {
        self.particle_index.get(&id).map(|&i| &self.particles[i])
    }

    /// Look up a particle by id for modification.
    pub fn particle_mut(&mut self, id: usize) -> Option<&mut Particle<DIM>> {
        self.particle_index.get(&id).map(|&i| &mut self.particles[i])
    }

    /// Number of particles on this rank.
    #[inline]
    pub fn nparticles(&self) -> usize {
        self.particles.len()
    }

    /// Axis-aligned bounding box of the mesh.
    #[inline]
    pub fn bounds(&self) -> BoundingBox<DIM> {
        self.bounds
    }

    /// Whether any cell needs Newton iteration to invert local coordinates.
    #[inline]
    pub fn is_isoparametric(&self) -> bool {
        self.isoparametric
    }

    /// The communicator of this rank.
    #[inline]
    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Cells holding at least one particle.
    #[inline]
    pub fn occupied_cells(&self) -> &fb::FixedBitSet {
        &self.occupied_cells
    }

    /// Nodes active in the current step,
    /// as of the latest [`synchronise_active_nodes`][Self::synchronise_active_nodes].
    #[inline]
    pub fn active_nodes(&self) -> &fb::FixedBitSet {
        &self.active_nodes
    }

    /// Borrow particles mutably alongside shared nodes and cells.
    pub fn split(&mut self) -> (&mut [Particle<DIM>], GridView<'_, DIM>) {
        (
            &mut self.particles,
            GridView {
                nodes: &self.nodes,
                cells: &self.cells,
                occupied_cells: &self.occupied_cells,
            },
        )
    }

    /// Shared view of nodes and cells.
    pub fn grid(&self) -> GridView<'_, DIM> {
        GridView {
            nodes: &self.nodes,
            cells: &self.cells,
            occupied_cells: &self.occupied_cells,
        }
    }

    //
    // particle population
    //

    /// Insert a particle, locating it in the mesh.
    ///
    /// A cell already set on the particle is tried first.
    pub fn add_particle(&mut self, mut particle: Particle<DIM>) -> Result<(), MeshError> {
        let id = particle.id();
        if self.particle_index.contains_key(&id) {
            return Err(MeshError::DuplicateParticle { id });
        }
        let (cell, xi) = self
            .grid()
            .locate(&particle.coordinates(), particle.cell())
            .ok_or(MeshError::ParticleOutside { id })?;
        particle.assign_cell(cell, xi);
        self.occupied_cells.insert(cell);
        self.particle_index.insert(id, self.particles.len());
        self.particles.push(particle);
        Ok(())
    }

    /// Remove the particles with the given ids, returning how many existed.
    ///
    /// Removed ids are also dropped from every particle set.
    pub fn remove_particles(&mut self, ids: &[usize]) -> usize {
        let before = self.particles.len();
        let to_remove: std::collections::HashSet<usize> = ids.iter().copied().collect();
        self.particles.retain(|p| !to_remove.contains(&p.id()));
        for set in self.particle_sets.values_mut() {
            set.retain(|id| !to_remove.contains(id));
        }
        self.rebuild_particle_index();
        self.rebuild_occupied_cells();
        before - self.particles.len()
    }

    /// Remove every particle. Sets keep their ids.
    pub fn clear_particles(&mut self) {
        self.particles.clear();
        self.particle_index.clear();
        self.occupied_cells.clear();
    }

    fn rebuild_particle_index(&mut self) {
        self.particle_index = self
            .particles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id(), i))
            .collect();
    }

    fn rebuild_occupied_cells(&mut self) {
        self.occupied_cells.clear();
        for cell in self.particles.iter().filter_map(|p| p.cell()) {
            self.occupied_cells.insert(cell);
        }
    }

    //
    // sets
    //

    /// Store a set of particle ids, replacing any set with the same id.
    ///
    /// Ids need not exist on this rank;
    /// iteration over the set skips the ones that don't.
    pub fn create_particle_set(&mut self, set_id: usize, ids: Vec<usize>) {
        if self.particle_sets.insert(set_id, ids).is_some() {
            log::warn!("replaced existing particle set {set_id}");
        }
    }

    /// Store the set of particles on this rank satisfying a predicate.
    pub fn create_particle_set_from_predicate(
        &mut self,
        set_id: usize,
        pred: impl Fn(&Particle<DIM>) -> bool,
    ) {
        let ids = self
            .particles
            .iter()
            .filter(|p| pred(p))
            .map(|p| p.id())
            .collect();
        self.create_particle_set(set_id, ids);
    }

    /// Look up a particle set.
    pub fn particle_set(&self, set_id: usize) -> Option<&[usize]> {
        self.particle_sets.get(&set_id).map(|s| s.as_slice())
    }

    /// Store a set of node indices, replacing any set with the same id.
    pub fn create_node_set(&mut self, set_id: usize, ids: Vec<usize>) -> Result<(), MeshError> {
        if let Some(&node) = ids.iter().find(|&&n| n >= self.nodes.len()) {
            return Err(MeshError::UnknownNode { node });
        }
        self.node_sets.insert(set_id, ids);
        Ok(())
    }

    /// Store the set of nodes satisfying a predicate.
    pub fn create_node_set_from_predicate(
        &mut self,
        set_id: usize,
        pred: impl Fn(&Node<DIM>) -> bool,
    ) {
        let ids = self
            .nodes
            .iter()
            .filter(|n| pred(n))
            .map(|n| n.id())
            .collect();
        self.node_sets.insert(set_id, ids);
    }

    /// Look up a node set.
    pub fn node_set(&self, set_id: usize) -> Option<&[usize]> {
        self.node_sets.get(&set_id).map(|s| s.as_slice())
    }

    //
    // iteration
    //

    /// Apply `op` to every particle in parallel.
    pub fn iterate_over_particles<F>(&mut self, op: F)
    where
        F: Fn(&mut Particle<DIM>, GridView<'_, DIM>) + Send + Sync,
    {
        let (particles, grid) = self.split();
        particles.par_iter_mut().for_each(|p| op(p, grid));
    }

    /// Apply a fallible `op` to every particle in parallel,
    /// stopping at the first error.
    pub fn try_iterate_over_particles<F, E>(&mut self, op: F) -> Result<(), E>
    where
        F: Fn(&mut Particle<DIM>, GridView<'_, DIM>) -> Result<(), E> + Send + Sync,
        E: Send,
    {
        let (particles, grid) = self.split();
        particles.par_iter_mut().try_for_each(|p| op(p, grid))
    }

    /// Apply `op` to every particle satisfying `pred`, in parallel.
    pub fn iterate_over_particles_predicate<F, P>(&mut self, op: F, pred: P)
    where
        F: Fn(&mut Particle<DIM>, GridView<'_, DIM>) + Send + Sync,
        P: Fn(&Particle<DIM>) -> bool + Send + Sync,
    {
        let (particles, grid) = self.split();
        particles
            .par_iter_mut()
            .filter(|p| pred(p))
            .for_each(|p| op(p, grid));
    }

    /// Apply `op` to every particle in storage order on the calling thread.
    ///
    /// Passes scattering particle quantities to nodes go through here
    /// so that nodal sums are reproducible from run to run.
    pub fn iterate_over_particles_in_order(
        &self,
        mut op: impl FnMut(&Particle<DIM>, GridView<'_, DIM>),
    ) {
        let grid = self.grid();
        for p in &self.particles {
            op(p, grid);
        }
    }

    /// Apply `op` to the particles of a set present on this rank,
    /// returning how many were visited.
    pub fn iterate_over_particle_set(
        &mut self,
        set_id: usize,
        mut op: impl FnMut(&mut Particle<DIM>),
    ) -> Result<usize, MeshError> {
        let set = self
            .particle_sets
            .get(&set_id)
            .ok_or(MeshError::UnknownParticleSet { set: set_id })?;
        let mut visited = 0;
        for id in set {
            match self.particle_index.get(id) {
                Some(&i) => {
                    op(&mut self.particles[i]);
                    visited += 1;
                }
                None => log::debug!("particle {id} of set {set_id} is not on this rank"),
            }
        }
        Ok(visited)
    }

    /// Apply `op` to every node in parallel.
    pub fn iterate_over_nodes(&self, op: impl Fn(&Node<DIM>) + Send + Sync) {
        self.nodes.par_iter().for_each(op);
    }

    /// Apply `op` to every node satisfying `pred`, in parallel.
    pub fn iterate_over_nodes_predicate(
        &self,
        op: impl Fn(&Node<DIM>) + Send + Sync,
        pred: impl Fn(&Node<DIM>) -> bool + Send + Sync,
    ) {
        self.nodes.par_iter().filter(|n| pred(n)).for_each(op);
    }

    /// Apply `op` to every active node in parallel.
    pub fn iterate_over_active_nodes(&self, op: impl Fn(&Node<DIM>) + Send + Sync) {
        let active = &self.active_nodes;
        self.nodes
            .par_iter()
            .filter(|n| active.contains(n.id()))
            .for_each(op);
    }

    //
    // cross-rank reduction
    //

    /// Rebuild the active node set from the node flags.
    ///
    /// With more than one rank, a node active on any rank
    /// becomes active on every rank, so all ranks reduce the same nodes.
    pub fn synchronise_active_nodes(&mut self) -> Result<(), ReduceError> {
        if self.comm.size() > 1 {
            let mut flags: Vec<f64> = self
                .nodes
                .iter()
                .map(|n| if n.status() { 1. } else { 0. })
                .collect();
            self.comm.allreduce_sum(&mut flags)?;
            for (node, flag) in self.nodes.iter().zip(flags) {
                node.assign_status(flag > 0.);
            }
        }
        self.active_nodes.clear();
        for node in self.nodes.iter().filter(|n| n.status()) {
            self.active_nodes.insert(node.id());
        }
        Ok(())
    }

    /// Sum a scalar nodal property over every rank
    /// and write the total back through `set`.
    ///
    /// Only active nodes take part. Does nothing on a single rank.
    pub fn allreduce_nodal_scalar_property(
        &self,
        get: impl Fn(&Node<DIM>) -> f64,
        set: impl Fn(&Node<DIM>, f64),
    ) -> Result<(), ReduceError> {
        if self.comm.size() <= 1 {
            return Ok(());
        }
        let mut buffer: Vec<f64> = self
            .active_nodes
            .ones()
            .map(|n| get(&self.nodes[n]))
            .collect();
        self.comm.allreduce_sum(&mut buffer)?;
        for (n, value) in self.active_nodes.ones().zip(buffer) {
            set(&self.nodes[n], value);
        }
        Ok(())
    }

    /// Sum a vector nodal property over every rank
    /// and write the total back through `set`.
    ///
    /// Only active nodes take part. Does nothing on a single rank.
    pub fn allreduce_nodal_vector_property(
        &self,
        get: impl Fn(&Node<DIM>) -> na::SVector<f64, DIM>,
        set: impl Fn(&Node<DIM>, na::SVector<f64, DIM>),
    ) -> Result<(), ReduceError> {
        if self.comm.size() <= 1 {
            return Ok(());
        }
        let mut buffer: Vec<f64> = self
            .active_nodes
            .ones()
            .flat_map(|n| {
                let value = get(&self.nodes[n]);
                (0..DIM).map(move |d| value[d])
            })
            .collect();
        self.comm.allreduce_sum(&mut buffer)?;
        for (n, chunk) in self.active_nodes.ones().zip(buffer.chunks_exact(DIM)) {
            set(&self.nodes[n], na::SVector::from_column_slice(chunk));
        }
        Ok(())
    }

    //
    // relocation
    //

    /// Find the containing cell of every particle after it has moved.
    ///
    /// Returns the sorted ids of particles no longer inside any cell.
    /// Those particles keep their position but lose their cell.
    pub fn locate_particles(&mut self) -> Vec<usize> {
        let (particles, grid) = self.split();
        let mut unlocatable: Vec<usize> = particles
            .par_iter_mut()
            .filter_map(|p| match grid.locate(&p.coordinates(), p.cell()) {
                Some((cell, xi)) => {
                    p.assign_cell(cell, xi);
                    None
                }
                None => {
                    p.clear_cell();
                    Some(p.id())
                }
            })
            .collect();
        unlocatable.sort_unstable();
        self.rebuild_occupied_cells();
        unlocatable
    }

    //
    // boundary conditions
    //

    fn node_set_checked(&self, set_id: usize, dir: usize) -> Result<Vec<usize>, MeshError> {
        if dir >= DIM {
            return Err(MeshError::InvalidDirection { dir });
        }
        self.node_sets
            .get(&set_id)
            .cloned()
            .ok_or(MeshError::UnknownNodeSet { set: set_id })
    }

    /// Prescribe a velocity component on every node of a set.
    pub fn assign_velocity_constraints(
        &mut self,
        set_id: usize,
        dir: usize,
        velocity: f64,
    ) -> Result<(), MeshError> {
        for n in self.node_set_checked(set_id, dir)? {
            self.nodes[n].assign_velocity_constraint(dir, velocity);
        }
        Ok(())
    }

    /// Apply a concentrated force component to every node of a set.
    pub fn assign_nodal_tractions(
        &mut self,
        set_id: usize,
        dir: usize,
        force: f64,
    ) -> Result<(), MeshError> {
        for n in self.node_set_checked(set_id, dir)? {
            self.nodes[n].assign_concentrated_force(dir, force);
        }
        Ok(())
    }

    /// Apply a traction component to every particle of a set on this rank.
    pub fn assign_particle_tractions(
        &mut self,
        set_id: usize,
        dir: usize,
        traction: f64,
    ) -> Result<(), MeshError> {
        if dir >= DIM {
            return Err(MeshError::InvalidDirection { dir });
        }
        self.iterate_over_particle_set(set_id, |p| {
            p.assign_traction(dir, traction);
        })?;
        Ok(())
    }

    //
    // diagnostics
    //

    /// Total mass of the particles on this rank.
    pub fn total_particle_mass(&self) -> f64 {
        self.particles.iter().map(|p| p.mass()).sum()
    }

    /// Total nodal mass of a phase.
    pub fn total_nodal_mass(&self, phase: usize) -> f64 {
        self.nodes.iter().map(|n| n.mass(phase)).sum()
    }

    /// Total kinetic energy of the particles on this rank.
    pub fn kinetic_energy(&self) -> f64 {
        self.particles.iter().map(|p| p.kinetic_energy()).sum()
    }

    /// Total strain energy of the particles on this rank.
    pub fn strain_energy(&self) -> f64 {
        self.particles.iter().map(|p| p.strain_energy()).sum()
    }
}
