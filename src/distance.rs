//! Distance from every live particle to the nearest boundary face.
//!
//! For a particle in element `e` only the candidates registered for `e` in
//! the [`BoundaryFaceIndex`] are searched. An element without candidates is
//! far from the boundary and its particles get no face; an element whose
//! candidates yield no usable face points at corrupt geometry and aborts the
//! kernel.

use nalgebra::Point3;
use ndarray::Array1;
use ndarray_stats::QuantileExt;
use serde::Serialize;

use crate::bdry::BoundaryFaceIndex;
use crate::container::{Execution, ParticleContainer};
use crate::error::KernelError;
use crate::triangle::Region;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdry::CandidateFace;
    use crate::container::{ContainerConfig, ParticleRecord};
    use crate::error::IndexError;
    use crate::triangle::Triangle;
    use nalgebra::Vector3;

    fn plane_at(face_id: usize, z: f64) -> CandidateFace {
        CandidateFace {
            face_id,
            element: 0,
            triangle: Triangle::new(
                Point3::new(0.0, 0.0, z),
                Point3::new(1.0, 0.0, z),
                Point3::new(0.0, 1.0, z),
            ),
        }
    }

    fn container_with(points: &[(usize, Point3<f64>)], num_elems: usize) -> ParticleContainer {
        let particles = points
            .iter()
            .enumerate()
            .map(|(i, (e, p))| (*e, ParticleRecord::new(i as u64, *p, Vector3::zeros())))
            .collect();
        let config = ContainerConfig {
            chunk_width: 4,
            ..ContainerConfig::default()
        };
        ParticleContainer::from_particles(config, num_elems, particles).unwrap()
    }

    #[test]
    fn picks_the_closest_of_three() {
        // d1 = 0.3 is listed in the middle
        let index = BoundaryFaceIndex::from_candidates(vec![vec![
            plane_at(7, 1.0),
            plane_at(3, 0.5),
            plane_at(5, -1.5),
        ]]);
        let container = container_with(&[(0, Point3::new(0.1, 0.1, 0.2))], 1);
        let result = find_distance_to_boundary(&container, &index, Execution::Serial).unwrap();
        let nearest = result.nearest(0).unwrap();
        assert_eq!(nearest.face_id, 3);
        assert!((nearest.distance - 0.3).abs() < 1e-6 * 0.3);
        assert_eq!(nearest.region, Region::Interior);
    }

    #[test]
    fn ties_go_to_the_first_candidate() {
        let index =
            BoundaryFaceIndex::from_candidates(vec![vec![plane_at(2, 1.0), plane_at(1, -1.0)]]);
        let hit = nearest_face(&index, 0, &Point3::new(0.2, 0.2, 0.0)).unwrap();
        assert_eq!(hit.face_id, 2);
    }

    #[test]
    fn empty_candidates_mean_unknown() {
        let index = BoundaryFaceIndex::from_candidates(vec![vec![plane_at(0, 0.0)], vec![]]);
        let container = container_with(
            &[
                (1, Point3::new(0.5, 0.5, 0.5)),
                (1, Point3::new(0.1, 0.1, 0.1)),
                (0, Point3::new(0.2, 0.2, 0.5)),
            ],
            2,
        );
        let result = find_distance_to_boundary(&container, &index, Execution::Parallel).unwrap();
        for (elem, slot, _) in container.live_particles() {
            match elem {
                1 => assert_eq!(result.face_id(slot), None),
                _ => assert_eq!(result.face_id(slot), Some(0)),
            }
        }
        assert_eq!(result.num_found(), 1);
    }

    #[test]
    fn padding_slots_are_ignored() {
        let index = BoundaryFaceIndex::from_candidates(vec![vec![plane_at(0, 0.0)]]);
        let mut container = container_with(&[(0, Point3::new(0.2, 0.2, 0.5))], 1);
        container.parallel_for_mut(Execution::Serial, |_, _, live, p| {
            if !live {
                *p.pos = Point3::new(f64::NAN, 1e300, -1e300);
            }
        });
        let result = find_distance_to_boundary(&container, &index, Execution::Serial).unwrap();
        assert_eq!(result.num_found(), 1);
        for slot in 0..container.capacity() {
            if !container.is_live(slot) {
                assert!(result.nearest(slot).is_none());
            }
        }
    }

    #[test]
    fn repeated_runs_agree() {
        let index = BoundaryFaceIndex::from_candidates(vec![vec![
            plane_at(0, 0.0),
            plane_at(1, 0.25),
        ]]);
        let points: Vec<_> = (0..9)
            .map(|i| (0, Point3::new(0.05 * i as f64, 0.1, 0.03 * i as f64)))
            .collect();
        let container = container_with(&points, 1);
        let first = find_distance_to_boundary(&container, &index, Execution::Parallel).unwrap();
        let second = find_distance_to_boundary(&container, &index, Execution::Parallel).unwrap();
        assert_eq!(first.face_ids(), second.face_ids());
        for slot in 0..container.capacity() {
            if let (Some(a), Some(b)) = (first.nearest(slot), second.nearest(slot)) {
                assert!((a.distance - b.distance).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn unusable_candidates_are_fatal() {
        let mut face = plane_at(0, 0.0);
        face.triangle.vertices[1].x = f64::NAN;
        face.triangle.vertices[0].z = f64::NAN;
        let index = BoundaryFaceIndex::from_candidates(vec![vec![face]]);
        let container = container_with(&[(0, Point3::new(0.2, 0.2, 0.5))], 1);
        assert!(matches!(
            find_distance_to_boundary(&container, &index, Execution::Serial),
            Err(KernelError::NoFaceFound { candidates: 1, .. })
        ));
    }

    #[test]
    fn candidate_list_must_cover_every_element() {
        let index = BoundaryFaceIndex::from_candidates(vec![vec![plane_at(0, 0.0)]]);
        let container = container_with(&[(1, Point3::new(0.2, 0.2, 0.5))], 2);
        let err = find_distance_to_boundary(&container, &index, Execution::Parallel).unwrap_err();
        assert_eq!(
            err,
            KernelError::Index(IndexError::ElementCount {
                expected: 2,
                found: 1
            })
        );
        assert!(err.to_string().contains("covers 1 elements"));
    }
}

/// The boundary face closest to one particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestFace {
    pub face_id: usize,
    /// Element bounded by the face.
    pub face_element: usize,
    pub point: Point3<f64>,
    pub region: Region,
    pub distance: f64,
}

/// Per-slot result of [`find_distance_to_boundary`].
///
/// `None` marks a padding slot or a particle with no boundary face nearby.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundaryDistances {
    nearest: Vec<Option<NearestFace>>,
}

impl BoundaryDistances {
    pub fn nearest(&self, slot: usize) -> Option<&NearestFace> {
        self.nearest.get(slot).and_then(Option::as_ref)
    }

    pub fn face_id(&self, slot: usize) -> Option<usize> {
        self.nearest(slot).map(|n| n.face_id)
    }

    pub fn face_ids(&self) -> Vec<Option<usize>> {
        self.nearest.iter().map(|n| n.map(|n| n.face_id)).collect()
    }

    pub fn len(&self) -> usize {
        self.nearest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nearest.is_empty()
    }

    pub fn num_found(&self) -> usize {
        self.nearest.iter().flatten().count()
    }

    /// Min, max and mean distance over the particles that found a face.
    pub fn summary(&self) -> Option<DistanceSummary> {
        let distances: Array1<f64> = self.nearest.iter().flatten().map(|n| n.distance).collect();
        let mean = distances.mean()?;
        Some(DistanceSummary {
            found: distances.len(),
            min: *distances.min_skipnan(),
            max: *distances.max_skipnan(),
            mean,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceSummary {
    pub found: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Scans the candidates of `elem` for the face closest to `point`.
///
/// The first usable candidate sets the running minimum and only a strictly
/// smaller distance replaces it, so ties keep the earlier candidate.
/// Candidates whose distance is not finite are skipped.
pub fn nearest_face(
    index: &BoundaryFaceIndex,
    elem: usize,
    point: &Point3<f64>,
) -> Option<NearestFace> {
    let mut best: Option<(f64, NearestFace)> = None;
    for candidate in index.candidates(elem) {
        let proj = candidate.triangle.closest_point(point);
        if !proj.dist_sq.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |(min, _)| proj.dist_sq < *min) {
            best = Some((
                proj.dist_sq,
                NearestFace {
                    face_id: candidate.face_id,
                    face_element: candidate.element,
                    point: proj.point,
                    region: proj.region,
                    distance: 0.0,
                },
            ));
        }
    }
    best.map(|(dist_sq, nearest)| NearestFace {
        distance: dist_sq.sqrt(),
        ..nearest
    })
}

/// Finds the nearest candidate boundary face of every live particle.
///
/// The result is indexed by slot and is only valid until the next rebuild.
pub fn find_distance_to_boundary(
    container: &ParticleContainer,
    index: &BoundaryFaceIndex,
    exec: Execution,
) -> Result<BoundaryDistances, KernelError> {
    index.check_covers(container.num_elems())?;
    let positions = container.positions();
    let nearest = container.try_parallel_map(exec, |elem, slot, live| {
        if !live {
            return Ok(None);
        }
        let candidates = index.range(elem).len();
        if candidates == 0 {
            return Ok(None);
        }
        match nearest_face(index, elem, &positions[slot]) {
            Some(found) => Ok(Some(found)),
            None => Err(KernelError::NoFaceFound {
                element: elem,
                slot,
                candidates,
            }),
        }
    })?;
    Ok(BoundaryDistances { nearest })
}
