use impic::bdry::{BoundaryFaceIndex, CandidateFace};
use impic::distance::nearest_face;
use impic::error::KernelError;
use impic::triangle::Triangle;
use nalgebra::Point3;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

fn triangle(vertices: [[f64; 3]; 3]) -> Triangle {
    let [a, b, c] = vertices.map(Point3::from);
    Triangle::new(a, b, c)
}

/// Closest point on a triangle to `point`.
///
/// Returns the point, the region code (0 vertex, 1 edge, 2 interior) and the
/// distance.
#[pyfunction]
fn closest_point_on_triangle(
    vertices: [[f64; 3]; 3],
    point: [f64; 3],
) -> PyResult<([f64; 3], u8, f64)> {
    let proj = triangle(vertices).closest_point(&Point3::from(point));
    Ok((proj.point.coords.into(), proj.region.code(), proj.distance()))
}

/// Nearest of `faces`, given as `(face_id, vertices)` pairs, to `point`.
///
/// Returns `(face_id, closest_point, distance)`; the face id is -1 when
/// `faces` is empty.
#[pyfunction]
fn nearest_boundary_face(
    faces: Vec<(usize, [[f64; 3]; 3])>,
    point: [f64; 3],
) -> PyResult<(i64, [f64; 3], f64)> {
    if faces.is_empty() {
        return Ok((-1, [0.0; 3], f64::INFINITY));
    }
    let candidates = faces
        .iter()
        .map(|(face_id, vertices)| CandidateFace {
            face_id: *face_id,
            element: 0,
            triangle: triangle(*vertices),
        })
        .collect();
    let index = BoundaryFaceIndex::from_candidates(vec![candidates]);
    match nearest_face(&index, 0, &Point3::from(point)) {
        Some(found) => Ok((
            found.face_id as i64,
            found.point.coords.into(),
            found.distance,
        )),
        None => Err(PyValueError::new_err(
            KernelError::NoFaceFound {
                element: 0,
                slot: 0,
                candidates: faces.len(),
            }
            .to_string(),
        )),
    }
}

/// A Python module implemented in Rust.
#[pymodule]
fn _impic_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(closest_point_on_triangle, m)?)?;
    m.add_function(wrap_pyfunction!(nearest_boundary_face, m)?)?;
    Ok(())
}
