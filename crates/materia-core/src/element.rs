//! Shape functions of the supported cell types.
//!
//! Two element families are available, both first order:
//! - [`ElementKind::Simplex`]: line segments, triangles and tetrahedra
//!   with `DIM + 1` nodes. Local coordinates live in the unit simplex
//!   (`xi_k >= 0`, `sum(xi) <= 1`) and the node at the local origin comes first.
//! - [`ElementKind::Hypercube`]: line segments, quadrilaterals and hexahedra
//!   with `2^DIM` nodes. Local coordinates live in `[-1, 1]^DIM`.
//!   In 2D the nodes go counterclockwise starting from `(-1, -1)`;
//!   in 3D the bottom face (`z = -1`) comes first in the same order,
//!   followed by the top face. This matches the Gmsh node ordering
//!   of `Qua4` and `Hex8` elements.

use nalgebra as na;

/// The family of a cell's interpolation basis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElementKind {
    /// Linear simplex with `DIM + 1` nodes.
    Simplex,
    /// Multilinear hypercube with `2^DIM` nodes.
    Hypercube,
}

// counterclockwise corners of the reference square,
// reused as the first two coordinates of higher-dimensional corners
const SQUARE_CORNERS: [[f64; 2]; 4] = [[-1., -1.], [1., -1.], [1., 1.], [-1., 1.]];

/// Local coordinates of the `i`th corner of the reference hypercube.
pub(crate) fn hypercube_corner<const DIM: usize>(i: usize) -> na::SVector<f64, DIM> {
    let mut corner = na::SVector::<f64, DIM>::zeros();
    if DIM == 1 {
        corner[0] = if i == 0 { -1. } else { 1. };
        return corner;
    }
    let [x, y] = SQUARE_CORNERS[i % 4];
    corner[0] = x;
    corner[1] = y;
    for d in 2..DIM {
        corner[d] = if (i >> d) & 1 == 0 { -1. } else { 1. };
    }
    corner
}

impl ElementKind {
    /// Number of nodes of a cell of this kind in `dim` dimensions.
    #[inline]
    pub fn node_count(self, dim: usize) -> usize {
        match self {
            Self::Simplex => dim + 1,
            Self::Hypercube => 1 << dim,
        }
    }

    /// Local coordinates of the centroid of the reference element.
    pub fn centroid<const DIM: usize>(self) -> na::SVector<f64, DIM> {
        match self {
            Self::Simplex => na::SVector::repeat(1. / (DIM as f64 + 1.)),
            Self::Hypercube => na::SVector::zeros(),
        }
    }

    /// Local coordinates of the `i`th node of the reference element.
    pub fn reference_node<const DIM: usize>(self, i: usize) -> na::SVector<f64, DIM> {
        match self {
            Self::Simplex => {
                let mut node = na::SVector::<f64, DIM>::zeros();
                if i > 0 {
                    node[i - 1] = 1.;
                }
                node
            }
            Self::Hypercube => hypercube_corner(i),
        }
    }

    /// Evaluate every shape function of the element at local coordinates `xi`.
    pub fn shapefn<const DIM: usize>(self, xi: &na::SVector<f64, DIM>) -> Vec<f64> {
        match self {
            Self::Simplex => {
                let mut n = Vec::with_capacity(DIM + 1);
                n.push(1. - xi.sum());
                n.extend(xi.iter().copied());
                n
            }
            Self::Hypercube => (0..1 << DIM)
                .map(|i| {
                    let corner = hypercube_corner::<DIM>(i);
                    (0..DIM).map(|d| 0.5 * (1. + corner[d] * xi[d])).product::<f64>()
                })
                .collect(),
        }
    }

    /// Gradients of every shape function with respect to the local coordinates.
    pub fn grad_shapefn<const DIM: usize>(
        self,
        xi: &na::SVector<f64, DIM>,
    ) -> Vec<na::SVector<f64, DIM>> {
        match self {
            Self::Simplex => {
                let mut grads: Vec<na::SVector<f64, DIM>> = Vec::with_capacity(DIM + 1);
                grads.push(na::SVector::repeat(-1.));
                grads.extend((0..DIM).map(|k| {
                    let mut g = na::SVector::<f64, DIM>::zeros();
                    g[k] = 1.;
                    g
                }));
                grads
            }
            Self::Hypercube => (0..1 << DIM)
                .map(|i| {
                    let corner = hypercube_corner::<DIM>(i);
                    na::SVector::from_fn(|k, _| {
                        (0..DIM)
                            .map(|d| {
                                if d == k {
                                    0.5 * corner[d]
                                } else {
                                    0.5 * (1. + corner[d] * xi[d])
                                }
                            })
                            .product::<f64>()
                    })
                })
                .collect(),
        }
    }

    /// Whether local coordinates `xi` lie inside the reference element,
    /// allowing `tolerance` of slack on every face.
    pub fn contains_local<const DIM: usize>(
        self,
        xi: &na::SVector<f64, DIM>,
        tolerance: f64,
    ) -> bool {
        match self {
            Self::Simplex => xi.iter().all(|x| *x >= -tolerance) && xi.sum() <= 1. + tolerance,
            Self::Hypercube => xi.iter().all(|x| x.abs() <= 1. + tolerance),
        }
    }
}
