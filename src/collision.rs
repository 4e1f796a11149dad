//! Wall collisions and the detector histogram.
//!
//! After a push every live particle has travelled from its previous to its
//! current position. [`find_wall_collisions`] intersects that path with the
//! candidate boundary faces of the particle's element and keeps the earliest
//! crossing. [`store_collisions`] then bins the crossings into a shared
//! [`HitHistogram`]. Both read slot-indexed data, so they must run before the
//! container is rebuilt.

use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::bdry::BoundaryFaceIndex;
use crate::container::{Execution, ParticleContainer};
use crate::error::KernelError;


/// A particle path crossing a boundary face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallCollision {
    pub face_id: usize,
    pub point: Point3<f64>,
    /// Fraction of the path travelled before the crossing.
    pub t: f64,
}

/// Per-slot crossings of the last push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collisions {
    hits: Vec<Option<WallCollision>>,
}

impl Collisions {
    pub fn hit(&self, slot: usize) -> Option<&WallCollision> {
        self.hits.get(slot).and_then(Option::as_ref)
    }

    pub fn face_id(&self, slot: usize) -> Option<usize> {
        self.hit(slot).map(|h| h.face_id)
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn num_hits(&self) -> usize {
        self.hits.iter().flatten().count()
    }
}

/// Intersects each live particle's last step with its element's candidate faces.
///
/// On equal crossing fractions the earlier candidate is kept.
pub fn find_wall_collisions(
    container: &ParticleContainer,
    index: &BoundaryFaceIndex,
    exec: Execution,
) -> Result<Collisions, KernelError> {
    index.check_covers(container.num_elems())?;
    let prev = container.prev_positions();
    let pos = container.positions();
    let hits = container.parallel_map(exec, |elem, slot, live| {
        if !live {
            return None;
        }
        let mut best: Option<WallCollision> = None;
        for candidate in index.candidates(elem) {
            let Some(hit) = candidate.triangle.intersect_segment(&prev[slot], &pos[slot]) else {
                continue;
            };
            if best.map_or(true, |b| hit.t < b.t) {
                best = Some(WallCollision {
                    face_id: candidate.face_id,
                    point: hit.point,
                    t: hit.t,
                });
            }
        }
        best
    });
    Ok(Collisions { hits })
}

/// Axial height bands inside a radial cut, numbered from the bottom.
///
/// Band 0 spans up to `first_band`; every later band is `band_height` tall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightBands {
    pub rad_max: f64,
    pub z_min: f64,
    pub z_max: f64,
    pub first_band: f64,
    pub band_height: f64,
}

impl Default for HeightBands {
    fn default() -> Self {
        Self {
            rad_max: 0.05,
            z_min: 0.0,
            z_max: 0.15,
            first_band: 0.01275,
            band_height: 0.01,
        }
    }
}

impl HeightBands {
    pub fn num_bands(&self) -> usize {
        if self.z_max <= self.first_band {
            1
        } else {
            1 + ((self.z_max - self.first_band) / self.band_height).ceil() as usize
        }
    }

    pub fn band(&self, p: &Point3<f64>) -> Option<usize> {
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
            return None;
        }
        let rad = p.x.hypot(p.y);
        if rad >= self.rad_max || p.z <= self.z_min || p.z >= self.z_max {
            return None;
        }
        if p.z <= self.first_band {
            Some(0)
        } else {
            Some(1 + ((p.z - self.first_band) / self.band_height).floor() as usize)
        }
    }
}

/// Maps a crossing to a detector bin.
#[derive(Debug, Clone, PartialEq)]
pub enum BinScheme {
    /// Detector id per boundary face id; `None` for untagged faces.
    FaceTags { detector_ids: Vec<Option<usize>> },
    HeightBands(HeightBands),
}

impl BinScheme {
    pub fn num_bins(&self) -> usize {
        match self {
            BinScheme::FaceTags { detector_ids } => {
                detector_ids.iter().flatten().max().map_or(0, |m| m + 1)
            }
            BinScheme::HeightBands(bands) => bands.num_bands(),
        }
    }

    pub fn bin(&self, point: &Point3<f64>, face_id: usize) -> Option<usize> {
        match self {
            BinScheme::FaceTags { detector_ids } => detector_ids.get(face_id).copied().flatten(),
            BinScheme::HeightBands(bands) => bands.band(point),
        }
    }
}

/// Hit counts per detector bin, safe to update from parallel kernels.
#[derive(Debug, Default)]
pub struct HitHistogram {
    bins: Vec<AtomicU64>,
}

impl HitHistogram {
    pub fn new(num_bins: usize) -> Self {
        Self {
            bins: (0..num_bins).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Counts one hit; returns false for an out-of-range bin.
    pub fn record(&self, bin: usize) -> bool {
        match self.bins.get(bin) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<u64> {
        self.bins.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn reset(&self) {
        for count in &self.bins {
            count.store(0, Ordering::Relaxed);
        }
    }
}

/// Bins the crossings of the last push and returns how many were recorded.
///
/// `collisions` is slot-indexed, so this has to run before the next rebuild.
pub fn store_collisions(
    container: &ParticleContainer,
    collisions: &Collisions,
    scheme: &BinScheme,
    histogram: &HitHistogram,
    exec: Execution,
) -> u64 {
    let recorded = AtomicU64::new(0);
    container.parallel_for(exec, |_, slot, live| {
        if !live {
            return;
        }
        let Some(hit) = collisions.hit(slot) else {
            return;
        };
        if let Some(bin) = scheme.bin(&hit.point, hit.face_id) {
            if histogram.record(bin) {
                recorded.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    recorded.into_inner()
}
