//! Generators for structured meshes and regularly seeded particles.

use std::sync::Arc;

use nalgebra as na;

use super::{Mesh, MeshError};
use crate::{
    element::{hypercube_corner, ElementKind},
    material::Material,
    particle::Particle,
};

/// A position to seed a particle at, with the volume it represents.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeedPoint<const DIM: usize> {
    /// Index of the cell the point lies in.
    pub cell: usize,
    /// Physical position.
    pub coordinates: na::SVector<f64, DIM>,
    /// Share of the cell's volume.
    pub volume: f64,
}

/// Decompose a flat index into a multi-index with the first axis varying fastest.
fn multi_index<const DIM: usize>(mut flat: usize, counts: &[usize; DIM]) -> [usize; DIM] {
    let mut idx = [0; DIM];
    for d in 0..DIM {
        idx[d] = flat % counts[d];
        flat /= counts[d];
    }
    idx
}

impl<const DIM: usize> Mesh<DIM> {
    /// Generate a grid of `counts[d]` hypercubes along every axis `d`,
    /// starting at `origin` with cell size `spacing`.
    ///
    /// Nodes and cells are numbered with the x index varying fastest.
    pub fn hypercube_grid(
        origin: na::SVector<f64, DIM>,
        spacing: na::SVector<f64, DIM>,
        counts: [usize; DIM],
    ) -> Result<Self, MeshError> {
        if counts.iter().any(|&c| c == 0) {
            return Err(MeshError::Empty);
        }
        let node_counts = counts.map(|c| c + 1);
        let mut strides = [1; DIM];
        for d in 1..DIM {
            strides[d] = strides[d - 1] * node_counts[d - 1];
        }

        let vertices = (0..node_counts.iter().product::<usize>())
            .map(|flat| {
                let idx = multi_index(flat, &node_counts);
                origin + na::SVector::from_fn(|d, _| idx[d] as f64 * spacing[d])
            })
            .collect();

        let corners: Vec<[usize; DIM]> = (0..1 << DIM)
            .map(|i| {
                let corner = hypercube_corner::<DIM>(i);
                std::array::from_fn(|d| if corner[d] > 0. { 1 } else { 0 })
            })
            .collect();
        let cells = (0..counts.iter().product::<usize>())
            .map(|flat| {
                let idx = multi_index(flat, &counts);
                let nodes: Vec<usize> = corners
                    .iter()
                    .map(|offset| {
                        (0..DIM)
                            .map(|d| (idx[d] + offset[d]) * strides[d])
                            .sum::<usize>()
                    })
                    .collect();
                (ElementKind::Hypercube, nodes)
            })
            .collect();

        Self::new(vertices, cells)
    }

    /// Seed positions at regular local coordinates in every cell.
    ///
    /// Hypercube cells get `per_dim` points along each local axis,
    /// at the centres of an even subdivision of the reference cell.
    /// Simplex cells get a single point at their centroid.
    pub fn seed_points(&self, per_dim: usize) -> Vec<SeedPoint<DIM>> {
        let per_dim = per_dim.max(1);
        let mut seeds = Vec::new();
        for cell in self.cells() {
            match cell.kind() {
                ElementKind::Simplex => seeds.push(SeedPoint {
                    cell: cell.id(),
                    coordinates: cell.centroid(),
                    volume: cell.volume(),
                }),
                ElementKind::Hypercube => {
                    let count = per_dim.pow(DIM as u32);
                    let counts = [per_dim; DIM];
                    seeds.extend((0..count).map(|flat| {
                        let k = multi_index(flat, &counts);
                        let xi = na::SVector::from_fn(|d, _| {
                            (2 * k[d] + 1) as f64 / per_dim as f64 - 1.
                        });
                        SeedPoint {
                            cell: cell.id(),
                            coordinates: cell.global_coordinates(&xi),
                            volume: cell.volume() / count as f64,
                        }
                    }));
                }
            }
        }
        seeds
    }

    /// Fill the cells selected by `pred` with particles of a material,
    /// numbered from `first_id`. Returns the ids of the new particles.
    pub fn seed_particles(
        &mut self,
        per_dim: usize,
        first_id: usize,
        material: &Arc<dyn Material<DIM>>,
        pred: impl Fn(&SeedPoint<DIM>) -> bool,
    ) -> Result<Vec<usize>, MeshError> {
        let seeds: Vec<SeedPoint<DIM>> =
            self.seed_points(per_dim).into_iter().filter(|s| pred(s)).collect();
        let mut ids = Vec::with_capacity(seeds.len());
        for (id, seed) in (first_id..).zip(seeds) {
            let mut particle = Particle::new(id, seed.coordinates);
            particle.assign_volume(seed.volume)?;
            particle.assign_material(Arc::clone(material));
            particle.compute_mass()?;
            self.add_particle(particle)?;
            ids.push(id);
        }
        Ok(ids)
    }
}

impl Mesh<2> {
    /// Generate a grid of `counts[0] x counts[1]` squares
    /// each split into two triangles along the diagonal.
    pub fn simplex_grid(
        origin: na::Vector2<f64>,
        spacing: na::Vector2<f64>,
        counts: [usize; 2],
    ) -> Result<Self, MeshError> {
        if counts.iter().any(|&c| c == 0) {
            return Err(MeshError::Empty);
        }
        let row = counts[0] + 1;
        let vertices = (0..row * (counts[1] + 1))
            .map(|n| {
                origin + na::Vector2::new((n % row) as f64 * spacing.x, (n / row) as f64 * spacing.y)
            })
            .collect();
        let cells = itertools::iproduct!(0..counts[1], 0..counts[0])
            .flat_map(|(j, i)| {
                let a = i + j * row;
                let b = a + 1;
                let c = b + row;
                let d = a + row;
                [
                    (ElementKind::Simplex, vec![a, b, c]),
                    (ElementKind::Simplex, vec![a, c, d]),
                ]
            })
            .collect();
        Self::new(vertices, cells)
    }
}
