//! Utilities for loading meshes generated with [`gmsh`](https://www.gmsh.info/).
//!
//! Only version 4.1 of the MSH format is supported,
//! as per the [`mshio`] library.

use std::collections::{HashMap, HashSet};

use nalgebra as na;

use crate::{
    element::ElementKind,
    mesh::{Mesh, MeshError},
};

/// Error in loading a mesh from a Gmsh .msh file.
#[derive(thiserror::Error, Debug)]
pub enum GmshError {
    /// Error parsing the .msh file.
    ///
    /// (Implementation note: parser error converted to string
    /// to avoid lifetime issues with the byte slices it contains)
    #[error("Parsing the .msh data failed: {0}")]
    ParseError(String),
    /// The given .msh file contains no nodes.
    #[error("Invalid .msh data: no nodes")]
    MissingNodes,
    /// The given .msh file contains no elements of the supported type.
    #[error("Invalid .msh data: no elements of the correct type")]
    MissingElements,
    /// The elements don't form a valid mesh.
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct EntityId {
    dim: i32,
    tag: i32,
}

#[derive(Clone, Debug, Default)]
struct PhysicalGroup {
    entities: HashSet<EntityId>,
    nodes: HashSet<usize>,
}

/// Load a 2D mesh from a `.msh` file.
///
/// First-order triangles (`Tri3`) become simplex cells
/// and first-order quadrilaterals (`Qua4`) hypercube cells
/// (see [`ElementType`][mshio::ElementType]).
/// Other elements, such as boundary lines, are ignored.
/// The `z` coordinate of vertices is dropped to project the mesh to 2D space.
///
/// # Physical groups
///
/// Every physical group in the file becomes a node set
/// whose id is the group's integer tag,
/// containing the nodes of every entity in the group.
/// (named groups are currently not supported due to limitations of [`mshio`]).
/// Nodes on the boundary of an entity belong to the boundary entities,
/// so a group meant to contain a whole curve
/// must also contain the curve's end points:
/// ```text
/// Physical Curve(100) = {1};
/// Physical Point(100) = {1, 2}; // also add the curve endpoints!
/// ```
/// Velocity constraints and nodal tractions can then refer to node set 100.
pub fn load_mesh_2d(bytes: &[u8]) -> Result<Mesh<2>, GmshError> {
    load_mesh(
        bytes,
        &[
            (mshio::ElementType::Tri3, ElementKind::Simplex),
            (mshio::ElementType::Qua4, ElementKind::Hypercube),
        ],
    )
}

/// Load a 3D mesh from a `.msh` file.
///
/// First-order tetrahedra (`Tet4`) become simplex cells
/// and first-order hexahedra (`Hex8`) hypercube cells.
///
/// See [`load_mesh_2d`] for information about physical groups.
pub fn load_mesh_3d(bytes: &[u8]) -> Result<Mesh<3>, GmshError> {
    load_mesh(
        bytes,
        &[
            (mshio::ElementType::Tet4, ElementKind::Simplex),
            (mshio::ElementType::Hex8, ElementKind::Hypercube),
        ],
    )
}

fn load_mesh<const DIM: usize>(
    bytes: &[u8],
    element_kinds: &[(mshio::ElementType, ElementKind)],
) -> Result<Mesh<DIM>, GmshError> {
    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| GmshError::ParseError(format!("{}", e)))?;
    let nodes = msh.data.nodes.ok_or(GmshError::MissingNodes)?;
    let elements = msh.data.elements.ok_or(GmshError::MissingElements)?;

    let mut physical_groups = gather_physical_groups(msh.data.entities.as_ref());

    let mut vertices: Vec<na::SVector<f64, DIM>> = Vec::new();
    for block in &nodes.node_blocks {
        let ent_id = EntityId {
            dim: block.entity_dim,
            tag: block.entity_tag,
        };
        let mut phys_groups: Vec<&mut PhysicalGroup> = physical_groups
            .values_mut()
            .filter(|pg| pg.entities.contains(&ent_id))
            .collect();

        for node in &block.nodes {
            let vert_idx = vertices.len();
            let xyz = [node.x, node.y, node.z];
            vertices.push(na::SVector::<f64, DIM>::from_fn(|i, _| xyz[i]));
            for g in &mut phys_groups {
                g.nodes.insert(vert_idx);
            }
        }
    }

    if vertices.is_empty() {
        return Err(GmshError::MissingNodes);
    }

    let cells: Vec<(ElementKind, Vec<usize>)> = elements
        .element_blocks
        .iter()
        .filter_map(|block| {
            element_kinds
                .iter()
                .find(|(ty, _)| *ty == block.element_type)
                .map(|(_, kind)| (*kind, block))
        })
        .flat_map(|(kind, block)| {
            block.elements.iter().map(move |el| {
                el.nodes
                    .iter()
                    .map(|tag| node_index(*tag))
                    .collect::<Result<Vec<usize>, GmshError>>()
                    .map(|nodes| (kind, nodes))
            })
        })
        .collect::<Result<_, _>>()?;
    if cells.is_empty() {
        return Err(GmshError::MissingElements);
    }

    let mut mesh = Mesh::new(vertices, cells)?;
    for (group_id, group) in physical_groups {
        let mut ids: Vec<usize> = group.nodes.into_iter().collect();
        ids.sort_unstable();
        log::debug!("physical group {group_id} has {} nodes", ids.len());
        let set_id = usize::try_from(group_id).map_err(|_| {
            GmshError::ParseError(format!("negative physical group tag {group_id}"))
        })?;
        mesh.create_node_set(set_id, ids)?;
    }

    Ok(mesh)
}

/// Index of a node in the vertex array.
///
/// Gmsh tags start at 1; this assumes they are sequential and in order.
fn node_index(tag: u64) -> Result<usize, GmshError> {
    usize::try_from(tag)
        .ok()
        .and_then(|t| t.checked_sub(1))
        .ok_or_else(|| GmshError::ParseError(format!("invalid node tag {tag}")))
}

/// Collect the physical groups defined in a .msh file
/// into a structure we can easily look them up from.
///
/// This only populates the `entities` field of each group;
/// nodes are filled in while reading node blocks.
fn gather_physical_groups(
    entities: Option<&mshio::Entities<i32, f64>>,
) -> HashMap<i32, PhysicalGroup> {
    let Some(entities) = entities else {
        return HashMap::new();
    };

    let mut groups: HashMap<i32, PhysicalGroup> = HashMap::new();
    let mut add = |dim: i32, tag: i32, physical_tags: &[i32]| {
        for ptag in physical_tags {
            groups
                .entry(*ptag)
                .or_default()
                .entities
                .insert(EntityId { dim, tag });
        }
    };

    for point in &entities.points {
        add(0, point.tag, &point.physical_tags);
    }
    for curve in &entities.curves {
        add(1, curve.tag, &curve.physical_tags);
    }
    for surface in &entities.surfaces {
        add(2, surface.tag, &surface.physical_tags);
    }
    for volume in &entities.volumes {
        add(3, volume.tag, &volume.physical_tags);
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    // a 2x1 rectangle split into two unit squares,
    // with physical group 100 on the bottom edge and its end points
    const TWO_QUADS: &str = "\
$MeshFormat
4.1 0 8
$EndMeshFormat
$Entities
4 4 1 0
1 0 0 0 1 100
2 2 0 0 1 100
3 2 1 0 0
4 0 1 0 0
1 0 0 0 2 0 0 1 100 2 1 -2
2 2 0 0 2 1 0 0 2 2 -3
3 0 1 0 2 1 0 0 2 3 -4
4 0 0 0 0 1 0 0 2 4 -1
1 0 0 0 2 1 0 0 4 1 2 3 4
$EndEntities
$Nodes
6 6 1 6
0 1 0 1
1
0 0 0
0 2 0 1
2
2 0 0
0 3 0 1
3
2 1 0
0 4 0 1
4
0 1 0
1 1 0 1
5
1 0 0
1 3 0 1
6
1 1 0
$EndNodes
$Elements
2 4 1 4
1 1 1 2
3 1 5
4 5 2
2 1 3 2
1 1 5 6 4
2 5 2 3 6
$EndElements
";

    #[test]
    fn quads_and_physical_groups() {
        let mesh = load_mesh_2d(TWO_QUADS.as_bytes()).expect("Failed to load mesh");

        assert_eq!(mesh.nodes().len(), 6);
        assert_eq!(
            mesh.cells().len(),
            2,
            "line elements should not become cells"
        );
        for cell in mesh.cells() {
            assert_eq!(cell.kind(), ElementKind::Hypercube);
            approx::assert_relative_eq!(cell.volume(), 1.);
        }
        assert_eq!(mesh.cells()[0].neighbours(), &[1]);

        let bottom = mesh.node_set(100).expect("physical group should be a node set");
        assert_eq!(bottom, &[0, 1, 4]);
        for &n in bottom {
            assert_eq!(
                mesh.nodes()[n].coordinates().y,
                0.,
                "node {n} isn't on the bottom edge"
            );
        }

        let centre = na::Vector2::new(1.5, 0.5);
        let (cell, _) = mesh
            .grid()
            .locate(&centre, None)
            .expect("point inside the mesh");
        assert_eq!(cell, 1);
    }

    #[test]
    fn missing_elements() {
        // the same nodes with only the boundary lines
        let lines_only = TWO_QUADS.replace(
            "2 4 1 4\n1 1 1 2\n3 1 5\n4 5 2\n2 1 3 2\n1 1 5 6 4\n2 5 2 3 6\n",
            "1 2 3 4\n1 1 1 2\n3 1 5\n4 5 2\n",
        );
        assert!(matches!(
            load_mesh_2d(lines_only.as_bytes()),
            Err(GmshError::MissingElements)
        ));
        assert!(matches!(
            load_mesh_2d(b"not a mesh"),
            Err(GmshError::ParseError(_))
        ));
    }

    #[test]
    fn invalid_tags() {
        // element referring to node tag 0
        let zero_node = TWO_QUADS.replace("1 1 5 6 4\n", "1 0 5 6 4\n");
        assert!(matches!(
            load_mesh_2d(zero_node.as_bytes()),
            Err(GmshError::ParseError(_))
        ));

        let negative_group =
            TWO_QUADS.replace("1 0 0 0 1 100\n2 2 0 0 1 100\n", "1 0 0 0 1 -7\n2 2 0 0 1 -7\n");
        assert_ne!(negative_group, TWO_QUADS);
        assert!(matches!(
            load_mesh_2d(negative_group.as_bytes()),
            Err(GmshError::ParseError(_))
        ));

        assert!(matches!(node_index(0), Err(GmshError::ParseError(_))));
        assert_eq!(node_index(1).expect("valid tag"), 0);
    }
}
