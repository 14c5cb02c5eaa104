//! 3D plane fitting.
//!
//! A plane is stored as a unit normal `n` and a distance `d` with `n·p = d` for every point `p`
//! on the plane. The optimizer works on the minimal parameterization `(yaw, pitch, distance)`
//! with `n = (cos(pitch)·sin(yaw), sin(pitch), cos(pitch)·cos(yaw))`.

use std::f64::consts::PI;

use nalgebra::Vector3;
use tracing::warn;

use crate::core::{CoreError, EPS, FixedVector};
use crate::error::LmResult;
use crate::optimizer::{LevenbergMarquardtConfig, SolverResult};
use crate::universal::{DenseUniversalModel, optimize_universal_model};

/// An oriented plane `n·p = d` with unit normal `n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    normal: Vector3<f64>,
    distance: f64,
}

impl Plane {
    /// Creates a plane from a (not necessarily unit) normal and the distance along it.
    ///
    /// Returns `None` for a zero or non-finite normal.
    pub fn from_normal_distance(normal: Vector3<f64>, distance: f64) -> Option<Self> {
        let length = normal.norm();
        (length > EPS && length.is_finite() && distance.is_finite()).then(|| Self {
            normal: normal / length,
            distance,
        })
    }

    /// Plane through `point` with the given normal.
    pub fn from_point_normal(point: &Vector3<f64>, normal: Vector3<f64>) -> Option<Self> {
        let length = normal.norm();
        if length <= EPS {
            return None;
        }
        let unit = normal / length;
        Self::from_normal_distance(unit, unit.dot(point))
    }

    pub fn from_angles(yaw: f64, pitch: f64, distance: f64) -> Self {
        let (sin_yaw, cos_yaw) = yaw.sin_cos();
        let (sin_pitch, cos_pitch) = pitch.sin_cos();
        Self {
            normal: Vector3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw),
            distance,
        }
    }

    /// `(yaw, pitch)` of the normal, inverse of [`Plane::from_angles`].
    pub fn decompose_normal(&self) -> (f64, f64) {
        let pitch = self.normal.y.clamp(-1.0, 1.0).asin();
        let yaw = self.normal.x.atan2(self.normal.z);
        (yaw, pitch)
    }

    pub fn normal(&self) -> &Vector3<f64> {
        &self.normal
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Positive on the side the normal points to.
    #[inline]
    pub fn signed_distance(&self, point: &Vector3<f64>) -> f64 {
        self.normal.dot(point) - self.distance
    }

    /// Orthogonal projection of `point` onto the plane.
    #[inline]
    pub fn project(&self, point: &Vector3<f64>) -> Vector3<f64> {
        point - self.normal * self.signed_distance(point)
    }

    /// Intersection with the ray `origin + t·direction`, `None` for parallel rays.
    pub fn intersection(
        &self,
        origin: &Vector3<f64>,
        direction: &Vector3<f64>,
    ) -> Option<Vector3<f64>> {
        let denominator = self.normal.dot(direction);
        if denominator.abs() <= EPS {
            return None;
        }
        let t = (self.distance - self.normal.dot(origin)) / denominator;
        Some(origin + direction * t)
    }

    fn to_external(self) -> FixedVector<f64, 4> {
        FixedVector::from([self.normal.x, self.normal.y, self.normal.z, self.distance])
    }

    pub(crate) fn from_external(external: &FixedVector<f64, 4>) -> Self {
        Self {
            normal: Vector3::new(external[0], external[1], external[2]),
            distance: external[3],
        }
    }
}

/// Wraps an angle into `(-π, π]`.
pub(crate) fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI { wrapped + 2.0 * PI } else { wrapped }
}

/// `(yaw, pitch)` to the external `(nx, ny, nz, d)`, returning the wrapped angles.
pub(crate) fn plane_transform(
    yaw: f64,
    pitch: f64,
    distance: f64,
) -> (FixedVector<f64, 4>, f64, f64) {
    let yaw = wrap_angle(yaw);
    let pitch = wrap_angle(pitch);
    (Plane::from_angles(yaw, pitch, distance).to_external(), yaw, pitch)
}

/// 3D points seen through the dense universal adapter: internal `(yaw, pitch, distance)`,
/// external `(nx, ny, nz, d)`, one 3D residual per point.
pub struct PlaneData<'a> {
    points: &'a [Vector3<f64>],
}

impl<'a> PlaneData<'a> {
    pub fn new(points: &'a [Vector3<f64>]) -> Self {
        Self { points }
    }
}

impl DenseUniversalModel<3, 3, 4> for PlaneData<'_> {
    fn value(&self, external: &FixedVector<f64, 4>, index: usize) -> FixedVector<f64, 3> {
        let projected = Plane::from_external(external).project(&self.points[index]);
        FixedVector::from([projected.x, projected.y, projected.z])
    }

    fn error(&self, external: &FixedVector<f64, 4>, index: usize) -> Option<FixedVector<f64, 3>> {
        let point = &self.points[index];
        let error = Plane::from_external(external).project(point) - point;
        Some(FixedVector::from([error.x, error.y, error.z]))
    }

    fn transform(
        &self,
        internal: &FixedVector<f64, 3>,
    ) -> (FixedVector<f64, 4>, FixedVector<f64, 3>) {
        let (external, yaw, pitch) = plane_transform(internal[0], internal[1], internal[2]);
        (external, FixedVector::from([yaw, pitch, internal[2]]))
    }
}

/// Fits `plane` to `points` by minimizing the orthogonal point distances.
///
/// # Errors
/// - `CoreError::InvalidInput` for fewer than 3 points
/// - the optimizer errors of [`crate::optimizer::LevenbergMarquardt::optimize_dense`]
pub fn optimize_plane(
    plane: &Plane,
    points: &[Vector3<f64>],
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<Plane>> {
    if points.len() < 3 {
        warn!("Plane fit with {} points", points.len());
        return Err(CoreError::InvalidInput(format!(
            "a plane needs at least 3 points, got {}",
            points.len()
        ))
        .log()
        .into());
    }

    let (yaw, pitch) = plane.decompose_normal();
    let model = FixedVector::from([yaw, pitch, plane.distance()]);
    let mut data = PlaneData::new(points);

    let result = optimize_universal_model::<_, 3, 3, 4>(&mut data, &model, points.len(), config)?;
    let optimized = Plane::from_angles(
        result.parameters[0],
        result.parameters[1],
        result.parameters[2],
    );
    Ok(result.with_parameters(optimized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_angles_round_trip_through_normal() {
        let plane = Plane::from_angles(0.4, -0.3, 2.0);
        let (yaw, pitch) = plane.decompose_normal();
        assert_relative_eq!(yaw, 0.4, epsilon = 1e-12);
        assert_relative_eq!(pitch, -0.3, epsilon = 1e-12);
        assert_relative_eq!(plane.normal().norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_projection_and_intersection() {
        let plane = Plane::from_normal_distance(Vector3::new(0.0, 0.0, 2.0), 5.0);
        assert!(plane.is_some());
        let Some(plane) = plane else { return };

        let point = Vector3::new(1.0, 2.0, 8.0);
        assert_relative_eq!(plane.signed_distance(&point), 3.0);
        assert_relative_eq!(plane.project(&point), Vector3::new(1.0, 2.0, 5.0));

        let hit = plane.intersection(&Vector3::zeros(), &Vector3::new(0.0, 1.0, 1.0));
        assert_eq!(hit, Some(Vector3::new(0.0, 5.0, 5.0)));
        assert!(plane.intersection(&Vector3::zeros(), &Vector3::x()).is_none());
        assert!(Plane::from_normal_distance(Vector3::zeros(), 1.0).is_none());
    }

    #[test]
    fn test_wrap_angle() {
        assert_relative_eq!(wrap_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-0.5), -0.5);
        assert_relative_eq!(wrap_angle(2.0 * PI + 0.25), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_recovers_tilted_plane() -> TestResult {
        let truth = Plane::from_angles(0.3, 0.2, -1.5);
        let points: Vec<Vector3<f64>> = (0..25)
            .map(|i| {
                let p = Vector3::new((i % 5) as f64 - 2.0, (i / 5) as f64 - 2.0, 0.3 * i as f64);
                truth.project(&p)
            })
            .collect();

        let initial = Plane::from_angles(0.25, 0.3, -1.0);
        let config = LevenbergMarquardtConfig::new().with_max_iterations(20);
        let result = optimize_plane(&initial, &points, &config)?;

        assert_relative_eq!(*result.parameters.normal(), *truth.normal(), epsilon = 1e-6);
        assert_relative_eq!(result.parameters.distance(), -1.5, epsilon = 1e-6);
        assert!(result.final_error < 1e-12);
        Ok(())
    }

    #[test]
    fn test_too_few_points() {
        let plane = Plane::from_angles(0.0, 0.0, 1.0);
        let points = [Vector3::zeros(), Vector3::x()];
        assert!(optimize_plane(&plane, &points, &LevenbergMarquardtConfig::new()).is_err());
    }
}
