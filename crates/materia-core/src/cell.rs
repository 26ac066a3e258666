//! Cells of the background mesh.
//!
//! A cell keeps a copy of its vertex positions
//! since the background mesh never moves,
//! which lets it answer geometric queries without access to the node arena.

use nalgebra as na;

use crate::{element::ElementKind, mesh::MeshError, node::Node};

/// Slack allowed when testing whether a point lies in a cell,
/// in local coordinate units.
pub const LOCAL_TOLERANCE: f64 = 1.0e-10;

const NEWTON_MAX_ITERATIONS: usize = 20;
const NEWTON_TOLERANCE: f64 = 1.0e-12;

/// Determinant of a square matrix by Gaussian elimination with partial pivoting.
///
/// Works for any const dimension,
/// unlike `Matrix::determinant` which needs `DimMin` bounds on `DIM`.
pub fn determinant<const DIM: usize>(m: &na::SMatrix<f64, DIM, DIM>) -> f64 {
    let mut a = *m;
    let mut det = 1.;
    for col in 0..DIM {
        let pivot = (col..DIM)
            .max_by(|&i, &j| a[(i, col)].abs().total_cmp(&a[(j, col)].abs()))
            .unwrap_or(col);
        if a[(pivot, col)] == 0. {
            return 0.;
        }
        if pivot != col {
            a.swap_rows(pivot, col);
            det = -det;
        }
        let p = a[(col, col)];
        det *= p;
        for row in col + 1..DIM {
            let factor = a[(row, col)] / p;
            for k in col..DIM {
                a[(row, k)] -= factor * a[(col, k)];
            }
        }
    }
    det
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox<const DIM: usize> {
    /// The minimum (bottom left in 2D) corner of the box.
    pub min: na::SVector<f64, DIM>,
    /// The maximum (top right in 2D) corner of the box.
    pub max: na::SVector<f64, DIM>,
}

impl<const DIM: usize> BoundingBox<DIM> {
    /// The smallest box containing every given point.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a na::SVector<f64, DIM>>) -> Self {
        let mut min = na::SVector::<f64, DIM>::repeat(f64::MAX);
        let mut max = na::SVector::<f64, DIM>::repeat(f64::MIN);
        for p in points {
            min = min.inf(p);
            max = max.sup(p);
        }
        Self { min, max }
    }

    /// The smallest box containing both boxes.
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Whether the point lies in the box grown by `margin` on every side.
    pub fn contains(&self, point: &na::SVector<f64, DIM>, margin: f64) -> bool {
        (0..DIM).all(|d| point[d] >= self.min[d] - margin && point[d] <= self.max[d] + margin)
    }

    /// Length of the box diagonal.
    pub fn diagonal(&self) -> f64 {
        (self.max - self.min).norm()
    }
}

/// A cell of the background mesh.
#[derive(Clone, Debug)]
pub struct Cell<const DIM: usize> {
    id: usize,
    kind: ElementKind,
    nodes: Vec<usize>,
    vertices: Vec<na::SVector<f64, DIM>>,
    isoparametric: bool,
    bounds: BoundingBox<DIM>,
    centroid: na::SVector<f64, DIM>,
    // inverse jacobian at the reference centroid,
    // exact everywhere in the cell when the map is affine
    inverse_jacobian: na::SMatrix<f64, DIM, DIM>,
    volume: f64,
    neighbours: Vec<usize>,
}

impl<const DIM: usize> Cell<DIM> {
    /// Create a cell from its node indices and their positions.
    ///
    /// Nodes must be ordered as described in the [`element`][crate::element] module.
    pub fn new(
        id: usize,
        kind: ElementKind,
        nodes: Vec<usize>,
        vertices: Vec<na::SVector<f64, DIM>>,
    ) -> Result<Self, MeshError> {
        let expected = kind.node_count(DIM);
        if nodes.len() != expected || vertices.len() != expected {
            return Err(MeshError::WrongNodeCount {
                cell: id,
                expected,
                found: nodes.len(),
            });
        }

        let xi_c = kind.centroid::<DIM>();
        let jacobian = Self::jacobian_of(kind, &vertices, &xi_c);
        let det = determinant(&jacobian);
        let bounds = BoundingBox::from_points(&vertices);
        // scale-aware degeneracy check
        let scale = bounds.diagonal().powi(DIM as i32);
        if !det.is_finite() || det.abs() <= 1.0e-12 * scale {
            return Err(MeshError::DegenerateCell { cell: id });
        }
        let inverse_jacobian = jacobian
            .try_inverse()
            .ok_or(MeshError::DegenerateCell { cell: id })?;

        let centroid = Self::map_to_global(kind, &vertices, &xi_c);

        let volume = match kind {
            ElementKind::Simplex => det.abs() / (1..=DIM).product::<usize>() as f64,
            ElementKind::Hypercube => det.abs() * (1 << DIM) as f64,
        };

        // the map is affine if the centroid jacobian reproduces every vertex
        let isoparametric = match kind {
            ElementKind::Simplex => false,
            ElementKind::Hypercube => vertices.iter().enumerate().any(|(i, v)| {
                let predicted = centroid + jacobian * (kind.reference_node::<DIM>(i) - xi_c);
                (predicted - v).norm() > 1.0e-10 * bounds.diagonal()
            }),
        };

        Ok(Self {
            id,
            kind,
            nodes,
            vertices,
            isoparametric,
            bounds,
            centroid,
            inverse_jacobian,
            volume,
            neighbours: Vec::new(),
        })
    }

    fn jacobian_of(
        kind: ElementKind,
        vertices: &[na::SVector<f64, DIM>],
        xi: &na::SVector<f64, DIM>,
    ) -> na::SMatrix<f64, DIM, DIM> {
        kind.grad_shapefn(xi)
            .iter()
            .zip(vertices)
            .map(|(grad, x)| x * grad.transpose())
            .fold(na::SMatrix::<f64, DIM, DIM>::zeros(), |acc, m| acc + m)
    }

    fn map_to_global(
        kind: ElementKind,
        vertices: &[na::SVector<f64, DIM>],
        xi: &na::SVector<f64, DIM>,
    ) -> na::SVector<f64, DIM> {
        kind.shapefn(xi)
            .iter()
            .zip(vertices)
            .map(|(n, x)| x * *n)
            .fold(na::SVector::<f64, DIM>::zeros(), |acc, x| acc + x)
    }

    //
    // accessors
    //

    /// Index of this cell in the mesh.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Element family of this cell.
    #[inline]
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Indices of this cell's nodes, in element order.
    #[inline]
    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    /// Positions of this cell's nodes, in element order.
    #[inline]
    pub fn vertices(&self) -> &[na::SVector<f64, DIM>] {
        &self.vertices
    }

    /// Whether local coordinates need Newton iteration to invert.
    #[inline]
    pub fn is_isoparametric(&self) -> bool {
        self.isoparametric
    }

    /// Override the isoparametric flag.
    ///
    /// Forcing it on makes every point query use Newton iteration.
    /// Forcing it off on a non-affine cell makes queries approximate.
    pub fn set_isoparametric(&mut self, isoparametric: bool) {
        self.isoparametric = isoparametric;
    }

    /// Axis-aligned bounding box of the cell.
    #[inline]
    pub fn bounds(&self) -> BoundingBox<DIM> {
        self.bounds
    }

    /// Physical position of the reference centroid.
    #[inline]
    pub fn centroid(&self) -> na::SVector<f64, DIM> {
        self.centroid
    }

    /// Volume (area in 2D, length in 1D) of the cell.
    #[inline]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Indices of cells sharing at least one node with this one.
    #[inline]
    pub fn neighbours(&self) -> &[usize] {
        &self.neighbours
    }

    pub(crate) fn set_neighbours(&mut self, neighbours: Vec<usize>) {
        self.neighbours = neighbours;
    }

    //
    // geometry
    //

    /// Jacobian of the reference-to-physical map at local coordinates `xi`.
    pub fn jacobian(&self, xi: &na::SVector<f64, DIM>) -> na::SMatrix<f64, DIM, DIM> {
        Self::jacobian_of(self.kind, &self.vertices, xi)
    }

    /// Physical position of local coordinates `xi`.
    pub fn global_coordinates(&self, xi: &na::SVector<f64, DIM>) -> na::SVector<f64, DIM> {
        Self::map_to_global(self.kind, &self.vertices, xi)
    }

    /// Local coordinates of a physical point.
    ///
    /// The affine inverse is exact for affine cells
    /// and serves as the initial guess of Newton iteration otherwise.
    pub fn local_coordinates(&self, point: &na::SVector<f64, DIM>) -> na::SVector<f64, DIM> {
        let mut xi = self.kind.centroid::<DIM>() + self.inverse_jacobian * (point - self.centroid);
        if !self.isoparametric {
            return xi;
        }

        for _ in 0..NEWTON_MAX_ITERATIONS {
            let residual = self.global_coordinates(&xi) - point;
            let Some(inv) = self.jacobian(&xi).try_inverse() else {
                break;
            };
            let step = inv * residual;
            xi -= step;
            if step.norm() < NEWTON_TOLERANCE {
                break;
            }
        }
        xi
    }

    /// Check whether the cell contains a point,
    /// returning its local coordinates if it does.
    pub fn is_point_in_cell(&self, point: &na::SVector<f64, DIM>) -> Option<na::SVector<f64, DIM>> {
        if !self
            .bounds
            .contains(point, LOCAL_TOLERANCE * self.bounds.diagonal())
        {
            return None;
        }
        let xi = self.local_coordinates(point);
        self.kind.contains_local(&xi, LOCAL_TOLERANCE).then_some(xi)
    }

    /// Shape function values at local coordinates `xi`.
    pub fn shapefn(&self, xi: &na::SVector<f64, DIM>) -> Vec<f64> {
        self.kind.shapefn(xi)
    }

    /// Shape function gradients with respect to physical coordinates
    /// at local coordinates `xi`.
    pub fn grad_shapefn(&self, xi: &na::SVector<f64, DIM>) -> Vec<na::SVector<f64, DIM>> {
        let inv_t = if self.isoparametric {
            self.jacobian(xi)
                .try_inverse()
                .unwrap_or(self.inverse_jacobian)
                .transpose()
        } else {
            self.inverse_jacobian.transpose()
        };
        self.kind
            .grad_shapefn(xi)
            .into_iter()
            .map(|g| inv_t * g)
            .collect()
    }

    /// Mark every node of this cell active.
    pub fn activate_nodes(&self, nodes: &[Node<DIM>]) {
        for &n in &self.nodes {
            nodes[n].assign_status(true);
        }
    }
}
