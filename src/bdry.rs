//! Boundary face candidate list.
//!
//! For every mesh element the list holds the boundary faces that are close
//! enough to matter for the distance-to-boundary search, in CSR form: an
//! `offsets` array over the elements and a flat `f64` payload with a fixed
//! stride per entry. Each entry is
//!
//! ```text
//! [face id, neighbouring element id, x0, y0, z0, x1, y1, z1, x2, y2, z2]
//! ```
//!
//! The list is built once per mesh and is read-only afterwards; every kernel
//! invocation shares it.

use nalgebra::Point3;
use rayon::prelude::*;
use tracing::info;

use crate::csr;
use crate::error::IndexError;
use crate::mesh::MeshTopology;
use crate::triangle::Triangle;


/// Header values per entry: face id and neighbouring element id.
pub const FACE_HEADER: usize = 2;
/// Payload values per entry.
pub const FACE_STRIDE: usize = FACE_HEADER + 9;

/// One decoded candidate entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateFace {
    pub face_id: usize,
    /// Element bounded by the face.
    pub element: usize,
    pub triangle: Triangle,
}

impl CandidateFace {
    fn encode(&self, out: &mut Vec<f64>) {
        out.push(self.face_id as f64);
        out.push(self.element as f64);
        for vertex in &self.triangle.vertices {
            out.extend_from_slice(&[vertex.x, vertex.y, vertex.z]);
        }
    }
}

/// Immutable per-element candidate boundary faces.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFaceIndex {
    offsets: Vec<usize>,
    payload: Vec<f64>,
}

impl BoundaryFaceIndex {
    /// Adopts an externally built list after checking its invariants.
    pub fn from_raw(offsets: Vec<usize>, payload: Vec<f64>) -> Result<Self, IndexError> {
        csr::validate_offsets(&offsets)?;
        let entries = offsets.last().copied().unwrap_or(0);
        if payload.len() != entries * FACE_STRIDE {
            return Err(IndexError::PayloadLength {
                expected: entries * FACE_STRIDE,
                found: payload.len(),
            });
        }
        for entry in 0..entries {
            for value in &payload[entry * FACE_STRIDE..entry * FACE_STRIDE + FACE_HEADER] {
                if !value.is_finite() || *value < 0.0 || value.fract() != 0.0 {
                    return Err(IndexError::MalformedHeader {
                        entry,
                        value: *value,
                    });
                }
            }
        }
        Ok(Self { offsets, payload })
    }

    /// Packs per-element candidate lists.
    pub fn from_candidates(per_elem: Vec<Vec<CandidateFace>>) -> Self {
        let counts: Vec<usize> = per_elem.iter().map(Vec::len).collect();
        let offsets = csr::offsets_from_counts(&counts);
        let mut payload = Vec::with_capacity(offsets[counts.len()] * FACE_STRIDE);
        for face in per_elem.iter().flatten() {
            face.encode(&mut payload);
        }
        Self { offsets, payload }
    }

    /// Registers boundary faces with nearby elements.
    ///
    /// A face is a candidate for element `e` when its closest point to the
    /// centroid of `e` lies within `radius` plus the largest centroid-to-vertex
    /// distance of `e`. The element bounded by a face always lists it.
    pub fn build<M: MeshTopology + Sync>(mesh: &M, radius: f64) -> Self {
        let faces: Vec<(usize, usize, Triangle)> = mesh
            .boundary_faces()
            .iter()
            .map(|f| (f.id, f.element, mesh.face_triangle(f)))
            .collect();

        let per_elem: Vec<Vec<CandidateFace>> = (0..mesh.nelems())
            .into_par_iter()
            .map(|e| {
                let centroid = mesh.centroid(e);
                let reach = mesh
                    .elem_points(e)
                    .iter()
                    .map(|p| (p - centroid).norm())
                    .fold(0.0, f64::max)
                    + radius;
                faces
                    .iter()
                    .filter(|(_, owner, tri)| {
                        *owner == e || tri.closest_point(&centroid).dist_sq <= reach * reach
                    })
                    .map(|&(face_id, element, triangle)| CandidateFace {
                        face_id,
                        element,
                        triangle,
                    })
                    .collect()
            })
            .collect();

        let index = Self::from_candidates(per_elem);
        info!(
            "Built boundary candidate list: {} entries over {} elements ({} boundary faces)",
            index.num_entries(),
            index.nelems(),
            faces.len()
        );
        index
    }

    /// Confirms the list covers exactly the elements of `mesh`.
    pub fn check_mesh<M: MeshTopology>(&self, mesh: &M) -> Result<(), IndexError> {
        self.check_covers(mesh.nelems())
    }

    /// Fails unless the list has a candidate range for exactly `num_elems` elements.
    pub fn check_covers(&self, num_elems: usize) -> Result<(), IndexError> {
        if self.nelems() != num_elems {
            return Err(IndexError::ElementCount {
                expected: num_elems,
                found: self.nelems(),
            });
        }
        Ok(())
    }

    pub fn nelems(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn num_entries(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn payload(&self) -> &[f64] {
        &self.payload
    }

    /// Entry range of `elem`; empty when no boundary face is near it.
    pub fn range(&self, elem: usize) -> std::ops::Range<usize> {
        csr::range(&self.offsets, elem)
    }

    /// Decodes entry `entry` of the flat payload.
    pub fn decode(&self, entry: usize) -> CandidateFace {
        let data = &self.payload[entry * FACE_STRIDE..(entry + 1) * FACE_STRIDE];
        let vertex = |i: usize| {
            let at = FACE_HEADER + 3 * i;
            Point3::new(data[at], data[at + 1], data[at + 2])
        };
        CandidateFace {
            face_id: data[0] as usize,
            element: data[1] as usize,
            triangle: Triangle::new(vertex(0), vertex(1), vertex(2)),
        }
    }

    /// Candidates of `elem` in list order.
    pub fn candidates(&self, elem: usize) -> impl Iterator<Item = CandidateFace> + '_ {
        self.range(elem).map(move |entry| self.decode(entry))
    }
}
