//! Geometric primitives on bounded triangles.
//!
//! Two queries are needed by the particle kernels: the closest point on a
//! triangle to a query point, classified by the Voronoi region it lands in,
//! and the first crossing of a straight particle path with a triangle.

use nalgebra::{Point3, Vector3};


/// Determinant magnitude below which a path is treated as parallel to a triangle.
pub const PARALLEL_EPSILON: f64 = 1e-14;

/// Which feature of a triangle the closest point lies on.
///
/// Vertices are numbered in triangle order. Edge `i` runs from vertex `i` to
/// vertex `(i + 1) % 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Vertex(u8),
    Edge(u8),
    Interior,
}

impl Region {
    /// Numeric classification: 0 for a vertex, 1 for an edge, 2 for the interior.
    pub fn code(&self) -> u8 {
        match self {
            Region::Vertex(_) => 0,
            Region::Edge(_) => 1,
            Region::Interior => 2,
        }
    }
}

/// Result of projecting a point onto a triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub point: Point3<f64>,
    pub region: Region,
    pub dist_sq: f64,
}

impl Projection {
    pub fn distance(&self) -> f64 {
        self.dist_sq.sqrt()
    }
}

/// Crossing of a path with a triangle at `start + t * (end - start)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHit {
    pub t: f64,
    pub point: Point3<f64>,
}

/// A bounded triangle in 3D.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Point3<f64>; 3],
}

impl Triangle {
    pub fn new(a: Point3<f64>, b: Point3<f64>, c: Point3<f64>) -> Self {
        Self {
            vertices: [a, b, c],
        }
    }

    /// Unit normal following the right-hand rule over the vertex order.
    /// Zero for a degenerate triangle.
    pub fn normal(&self) -> Vector3<f64> {
        let [a, b, c] = &self.vertices;
        (b - a).cross(&(c - a)).try_normalize(0.0).unwrap_or_else(Vector3::zeros)
    }

    pub fn centroid(&self) -> Point3<f64> {
        let [a, b, c] = &self.vertices;
        Point3::from((a.coords + b.coords + c.coords) / 3.0)
    }

    /// Closest point on the triangle to `p`.
    ///
    /// Walks the Voronoi regions of the vertices, then the edges, and falls
    /// back to the barycentric interior point. A triangle whose area
    /// vanishes is treated as the union of its three edges.
    pub fn closest_point(&self, p: &Point3<f64>) -> Projection {
        let [a, b, c] = &self.vertices;
        let ab = b - a;
        let ac = c - a;

        let ap = p - a;
        let d1 = ab.dot(&ap);
        let d2 = ac.dot(&ap);
        if d1 <= 0.0 && d2 <= 0.0 {
            return Projection::new(*a, Region::Vertex(0), p);
        }

        let bp = p - b;
        let d3 = ab.dot(&bp);
        let d4 = ac.dot(&bp);
        if d3 >= 0.0 && d4 <= d3 {
            return Projection::new(*b, Region::Vertex(1), p);
        }

        let vc = d1 * d4 - d3 * d2;
        if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
            let v = d1 / (d1 - d3);
            return Projection::new(a + ab * v, Region::Edge(0), p);
        }

        let cp = p - c;
        let d5 = ab.dot(&cp);
        let d6 = ac.dot(&cp);
        if d6 >= 0.0 && d5 <= d6 {
            return Projection::new(*c, Region::Vertex(2), p);
        }

        let vb = d5 * d2 - d1 * d6;
        if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
            let w = d2 / (d2 - d6);
            return Projection::new(a + ac * w, Region::Edge(2), p);
        }

        let va = d3 * d6 - d5 * d4;
        if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
            let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
            return Projection::new(b + (c - b) * w, Region::Edge(1), p);
        }

        let sum = va + vb + vc;
        if sum.abs() <= f64::EPSILON * (ab.norm_squared() * ac.norm_squared()).max(f64::MIN_POSITIVE)
        {
            return self.closest_point_on_edges(p);
        }
        let v = vb / sum;
        let w = vc / sum;
        Projection::new(a + ab * v + ac * w, Region::Interior, p)
    }

    fn closest_point_on_edges(&self, p: &Point3<f64>) -> Projection {
        let mut best = self.closest_point_on_edge(0, p);
        for i in 1..3 {
            let proj = self.closest_point_on_edge(i, p);
            if proj.dist_sq < best.dist_sq {
                best = proj;
            }
        }
        best
    }

    fn closest_point_on_edge(&self, i: usize, p: &Point3<f64>) -> Projection {
        let start = self.vertices[i];
        let end = self.vertices[(i + 1) % 3];
        let edge = end - start;
        let len_sq = edge.norm_squared();
        let t = if len_sq > 0.0 {
            ((p - start).dot(&edge) / len_sq).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let region = if t <= 0.0 {
            Region::Vertex(i as u8)
        } else if t >= 1.0 {
            Region::Vertex(((i + 1) % 3) as u8)
        } else {
            Region::Edge(i as u8)
        };
        Projection::new(start + edge * t, region, p)
    }

    /// Crossing of the segment from `start` to `end` with the triangle.
    ///
    /// The start point is excluded, so a path leaving the triangle's surface
    /// does not cross it. Paths lying in the plane of the triangle never
    /// report a crossing.
    pub fn intersect_segment(&self, start: &Point3<f64>, end: &Point3<f64>) -> Option<SegmentHit> {
        let [a, b, c] = &self.vertices;
        let dir = end - start;
        let e1 = b - a;
        let e2 = c - a;

        let pvec = dir.cross(&e2);
        let det = e1.dot(&pvec);
        if det.abs() < PARALLEL_EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;

        let tvec = start - a;
        let u = tvec.dot(&pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let qvec = tvec.cross(&e1);
        let v = dir.dot(&qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = e2.dot(&qvec) * inv_det;
        if !(t > 0.0 && t <= 1.0) {
            return None;
        }

        Some(SegmentHit {
            t,
            point: start + dir * t,
        })
    }
}

impl Projection {
    fn new(point: Point3<f64>, region: Region, query: &Point3<f64>) -> Self {
        Self {
            point,
            region,
            dist_sq: (point - query).norm_squared(),
        }
    }
}
