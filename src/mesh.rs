//! Tetrahedral mesh collaborator.
//!
//! The particle core only needs read access to element connectivity, vertex
//! coordinates and the boundary faces. [`MeshTopology`] is that contract;
//! [`TetMesh`] is an in-memory implementation with face adjacency and point
//! location, plus a structured box generator used by the driver and tests.
//! Reading partitioned meshes from disk is left to other tooling.

use std::collections::HashMap;

use nalgebra::{Matrix3, Point3};

use crate::triangle::Triangle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cube_is_six_tets() {
        let mesh = TetMesh::structured_box([0.0; 3], [1.0; 3], [1, 1, 1]);
        assert_eq!(mesh.nelems(), 6);
        assert_eq!(mesh.coords().len(), 8);
        let volume: f64 = (0..mesh.nelems()).map(|e| mesh.volume(e)).sum();
        assert!((volume - 1.0).abs() < 1e-12, "volume: {}", volume);
        // two triangles per side
        assert_eq!(mesh.boundary_faces().len(), 12);
    }

    #[test]
    fn boundary_faces_point_outward() {
        let mesh = TetMesh::structured_box([0.0; 3], [2.0, 1.0, 1.0], [2, 1, 1]);
        assert_eq!(mesh.boundary_faces().len(), 20);
        for face in mesh.boundary_faces() {
            let tri = mesh.face_triangle(face);
            let outward = tri.centroid() - mesh.centroid(face.element);
            assert!(tri.normal().dot(&outward) > 0.0);
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let mesh = TetMesh::structured_box([0.0; 3], [1.0; 3], [2, 2, 2]);
        for e in 0..mesh.nelems() {
            for n in mesh.neighbors(e).iter().flatten() {
                assert!(mesh.neighbors(*n).contains(&Some(e)));
            }
        }
    }

    #[test]
    fn locate_points() {
        let mesh = TetMesh::structured_box([0.0; 3], [1.0; 3], [3, 3, 3]);
        let p = Point3::new(0.71, 0.12, 0.43);
        let found = mesh.locate(&p, Some(0)).unwrap();
        assert!(mesh.contains(found, &p));
        assert_eq!(mesh.locate(&p, None), Some(found));
        assert_eq!(mesh.locate(&Point3::new(1.5, 0.5, 0.5), Some(found)), None);
    }
}

/// Barycentric tolerance for point-in-element tests.
pub const CONTAINMENT_TOLERANCE: f64 = 1e-12;

/// A triangular face on the domain boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFace {
    pub id: usize,
    /// The element the face bounds.
    pub element: usize,
    /// Vertex indices, ordered so the normal points out of the domain.
    pub verts: [usize; 3],
}

/// Read access to a tetrahedral mesh partition.
pub trait MeshTopology {
    fn nelems(&self) -> usize;
    fn coords(&self) -> &[Point3<f64>];
    fn elem_verts(&self, elem: usize) -> [usize; 4];
    fn boundary_faces(&self) -> &[BoundaryFace];

    fn elem_points(&self, elem: usize) -> [Point3<f64>; 4] {
        let coords = self.coords();
        self.elem_verts(elem).map(|v| coords[v])
    }

    fn centroid(&self, elem: usize) -> Point3<f64> {
        let pts = self.elem_points(elem);
        Point3::from(pts.iter().fold(nalgebra::Vector3::zeros(), |acc, p| acc + p.coords) / 4.0)
    }

    fn face_triangle(&self, face: &BoundaryFace) -> Triangle {
        let coords = self.coords();
        Triangle::new(
            coords[face.verts[0]],
            coords[face.verts[1]],
            coords[face.verts[2]],
        )
    }
}

/// Unstructured tetrahedral mesh held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct TetMesh {
    coords: Vec<Point3<f64>>,
    elems: Vec<[usize; 4]>,
    /// Element across local face `i`, the face opposite local vertex `i`.
    neighbors: Vec<[Option<usize>; 4]>,
    boundary: Vec<BoundaryFace>,
}

impl TetMesh {
    /// Builds the mesh and derives face adjacency and boundary faces.
    ///
    /// Boundary face ids are assigned in element order, then local face order.
    pub fn new(coords: Vec<Point3<f64>>, elems: Vec<[usize; 4]>) -> Self {
        let mut owners: HashMap<[usize; 3], Vec<usize>> = HashMap::new();
        for (e, verts) in elems.iter().enumerate() {
            for local in 0..4 {
                owners.entry(face_key(verts, local)).or_default().push(e);
            }
        }

        let mut neighbors = vec![[None; 4]; elems.len()];
        let mut boundary = Vec::new();
        for (e, verts) in elems.iter().enumerate() {
            for local in 0..4 {
                let shared = &owners[&face_key(verts, local)];
                match shared.iter().find(|&&other| other != e) {
                    Some(&other) => neighbors[e][local] = Some(other),
                    None => {
                        let id = boundary.len();
                        boundary.push(BoundaryFace {
                            id,
                            element: e,
                            verts: outward_face(&coords, verts, local),
                        });
                    }
                }
            }
        }

        Self {
            coords,
            elems,
            neighbors,
            boundary,
        }
    }

    /// Axis-aligned box split into `divisions` cubes of six tetrahedra each.
    ///
    /// Every cube is cut along the diagonal from its low to its high corner,
    /// which keeps the triangulation conforming across cube faces.
    pub fn structured_box(lo: [f64; 3], hi: [f64; 3], divisions: [usize; 3]) -> Self {
        let [nx, ny, nz] = divisions.map(|n| n.max(1));
        let vid = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);

        let mut coords = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    coords.push(Point3::new(
                        lo[0] + (hi[0] - lo[0]) * i as f64 / nx as f64,
                        lo[1] + (hi[1] - lo[1]) * j as f64 / ny as f64,
                        lo[2] + (hi[2] - lo[2]) * k as f64 / nz as f64,
                    ));
                }
            }
        }

        const AXIS_ORDERS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut elems = Vec::with_capacity(6 * nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    for order in AXIS_ORDERS {
                        let mut corner = [i, j, k];
                        let mut tet = [vid(i, j, k); 4];
                        for (step, axis) in order.iter().enumerate() {
                            corner[*axis] += 1;
                            tet[step + 1] = vid(corner[0], corner[1], corner[2]);
                        }
                        elems.push(tet);
                    }
                }
            }
        }

        Self::new(coords, elems)
    }

    pub fn neighbors(&self, elem: usize) -> &[Option<usize>; 4] {
        &self.neighbors[elem]
    }

    pub fn volume(&self, elem: usize) -> f64 {
        let [a, b, c, d] = self.elem_points(elem);
        (b - a).cross(&(c - a)).dot(&(d - a)).abs() / 6.0
    }

    /// Barycentric coordinates of `p` in `elem`, `None` for a flat element.
    pub fn barycentric(&self, elem: usize, p: &Point3<f64>) -> Option<[f64; 4]> {
        let [a, b, c, d] = self.elem_points(elem);
        let inv = Matrix3::from_columns(&[b - a, c - a, d - a]).try_inverse()?;
        let l = inv * (p - a);
        Some([1.0 - l.x - l.y - l.z, l.x, l.y, l.z])
    }

    pub fn contains(&self, elem: usize, p: &Point3<f64>) -> bool {
        self.barycentric(elem, p)
            .is_some_and(|bc| bc.iter().all(|&l| l >= -CONTAINMENT_TOLERANCE))
    }

    /// Finds the element containing `p`.
    ///
    /// Walks across the face with the most negative barycentric coordinate
    /// starting from `hint`, then scans every element if the walk leaves the
    /// mesh or stalls. `None` means the point is outside the partition.
    pub fn locate(&self, p: &Point3<f64>, hint: Option<usize>) -> Option<usize> {
        if self.elems.is_empty() {
            return None;
        }
        let mut elem = hint.filter(|&e| e < self.elems.len()).unwrap_or(0);
        for _ in 0..self.elems.len() {
            let Some(bc) = self.barycentric(elem, p) else {
                break;
            };
            let (worst, min) = bc
                .iter()
                .copied()
                .enumerate()
                .fold((0, f64::INFINITY), |acc, (i, l)| if l < acc.1 { (i, l) } else { acc });
            if min >= -CONTAINMENT_TOLERANCE {
                return Some(elem);
            }
            match self.neighbors[elem][worst] {
                Some(next) => elem = next,
                None => break,
            }
        }
        (0..self.elems.len()).find(|&e| self.contains(e, p))
    }
}

impl MeshTopology for TetMesh {
    fn nelems(&self) -> usize {
        self.elems.len()
    }

    fn coords(&self) -> &[Point3<f64>] {
        &self.coords
    }

    fn elem_verts(&self, elem: usize) -> [usize; 4] {
        self.elems[elem]
    }

    fn boundary_faces(&self) -> &[BoundaryFace] {
        &self.boundary
    }
}

fn face_verts(verts: &[usize; 4], local: usize) -> [usize; 3] {
    let mut face = [0; 3];
    let mut n = 0;
    for (i, v) in verts.iter().enumerate() {
        if i != local {
            face[n] = *v;
            n += 1;
        }
    }
    face
}

fn face_key(verts: &[usize; 4], local: usize) -> [usize; 3] {
    let mut key = face_verts(verts, local);
    key.sort_unstable();
    key
}

/// Face vertices reordered so the normal points away from the opposite vertex.
fn outward_face(coords: &[Point3<f64>], verts: &[usize; 4], local: usize) -> [usize; 3] {
    let [a, b, c] = face_verts(verts, local);
    let normal = (coords[b] - coords[a]).cross(&(coords[c] - coords[a]));
    if normal.dot(&(coords[verts[local]] - coords[a])) > 0.0 {
        [a, c, b]
    } else {
        [a, b, c]
    }
}
