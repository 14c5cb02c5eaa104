//! Camera poses and a 3D plane from image correspondences.
//!
//! Image points of a fixed first camera are back-projected as rays and intersected with the
//! plane; the resulting 3D points are projected into one or more second cameras and compared
//! with the observed image points. The plane distance stays fixed (it fixes the scale), so the
//! plane contributes `(yaw, pitch)` and every second camera a 6-parameter pose.
//!
//! Poses are `camera_T_world` transformations of a pinhole camera looking along `+z`. A pose
//! is optimized as `(tx, ty, tz, rx, ry, rz)`, translation followed by a rotation vector, and
//! handed to the error functions as a column-major 4x4 matrix.

use nalgebra::{Isometry3, Matrix4, Point3, Translation3, UnitQuaternion, Vector2, Vector3};
use tracing::warn;

use crate::core::{CoreError, CoreResult, EPS, FixedVector};
use crate::error::LmResult;
use crate::optimizer::{LevenbergMarquardtConfig, SolverResult};
use crate::problems::plane::{Plane, plane_transform};
use crate::universal::{
    DenseUniversalModel, SharedIndividualModel, optimize_shared_individual,
    optimize_universal_model,
};

/// Pinhole camera without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Viewing direction of `image_point` in camera coordinates.
    pub fn direction(&self, image_point: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (image_point.x - self.cx) / self.fx,
            (image_point.y - self.cy) / self.fy,
            1.0,
        )
    }

    /// Projects a point given in camera coordinates, `None` for points on the camera plane.
    ///
    /// Points behind the camera are mirrored through the center like any pinhole projection.
    #[inline]
    pub fn project(&self, camera_point: &Vector3<f64>) -> Option<Vector2<f64>> {
        (camera_point.z.abs() > EPS).then(|| {
            Vector2::new(
                self.fx * camera_point.x / camera_point.z + self.cx,
                self.fy * camera_point.y / camera_point.z + self.cy,
            )
        })
    }
}

/// A world-space ray `origin + t·direction`.
#[derive(Debug, Clone, Copy)]
struct Ray {
    origin: Vector3<f64>,
    direction: Vector3<f64>,
}

/// Snaps every residual component onto a grid of `0.2`, truncating towards zero.
pub fn quantize_residual<const R: usize>(residual: &FixedVector<f64, R>) -> FixedVector<f64, R> {
    let mut quantized = *residual;
    for value in quantized.iter_mut() {
        *value = (*value * 5.0).trunc() * 0.2;
    }
    quantized
}

/// Internal pose model `(t, rotation vector)` of a `camera_T_world` transformation.
pub fn pose_to_model(camera_t_world: &Isometry3<f64>) -> FixedVector<f64, 6> {
    let t = camera_t_world.translation.vector;
    let r = camera_t_world.rotation.scaled_axis();
    FixedVector::from([t.x, t.y, t.z, r.x, r.y, r.z])
}

pub fn model_to_pose(model: &FixedVector<f64, 6>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(model[0], model[1], model[2]),
        UnitQuaternion::from_scaled_axis(Vector3::new(model[3], model[4], model[5])),
    )
}

/// External 4x4 pose and the renormalized internal pose (rotation angle within `[0, π]`).
fn pose_transform(internal: &FixedVector<f64, 6>) -> (FixedVector<f64, 16>, FixedVector<f64, 6>) {
    let pose = model_to_pose(internal);
    (
        FixedVector::from_prefix(pose.to_homogeneous().as_slice()),
        pose_to_model(&pose),
    )
}

/// Observations of a plane by a fixed first camera and a set of second cameras.
///
/// Every group of second image points holds one point per first image point.
#[derive(Debug, Clone)]
pub struct PosesPlaneData {
    camera: PinholeCamera,
    rays: Vec<Ray>,
    plane_distance: f64,
    image_point_groups: Vec<Vec<Vector2<f64>>>,
    /// Rejects candidates placing a point behind the first or a second camera.
    pub only_front_points: bool,
    /// Quantizes residuals with [`quantize_residual`].
    pub quantized_residuals: bool,
}

impl PosesPlaneData {
    /// # Errors
    /// - `CoreError::InvalidInput` without first image points or without second cameras
    /// - `CoreError::DimensionMismatch` if a group does not hold one point per first image point
    pub fn new(
        camera: PinholeCamera,
        first_t_world: &Isometry3<f64>,
        image_points_first: &[Vector2<f64>],
        plane_distance: f64,
        image_point_groups: Vec<Vec<Vector2<f64>>>,
    ) -> CoreResult<Self> {
        if image_points_first.is_empty() || image_point_groups.is_empty() {
            return Err(CoreError::InvalidInput(
                "pose and plane optimization needs image points and second cameras".to_string(),
            )
            .log());
        }
        if let Some(group) = image_point_groups
            .iter()
            .position(|g| g.len() != image_points_first.len())
        {
            warn!("Image point group {} does not match the first camera", group);
            return Err(CoreError::DimensionMismatch(format!(
                "group {} has {} points, the first camera {}",
                group,
                image_point_groups[group].len(),
                image_points_first.len()
            ))
            .log());
        }

        let world_t_first = first_t_world.inverse();
        let origin = world_t_first.translation.vector;
        let rays = image_points_first
            .iter()
            .map(|p| Ray {
                origin,
                direction: world_t_first.rotation * camera.direction(p),
            })
            .collect();

        Ok(Self {
            camera,
            rays,
            plane_distance,
            image_point_groups,
            only_front_points: true,
            quantized_residuals: false,
        })
    }

    pub fn with_only_front_points(mut self, only_front_points: bool) -> Self {
        self.only_front_points = only_front_points;
        self
    }

    pub fn with_quantized_residuals(mut self, quantized_residuals: bool) -> Self {
        self.quantized_residuals = quantized_residuals;
        self
    }

    pub fn number_points(&self) -> usize {
        self.rays.len()
    }

    pub fn number_cameras(&self) -> usize {
        self.image_point_groups.len()
    }

    fn plane_from_angles(
        &self,
        yaw: f64,
        pitch: f64,
    ) -> (FixedVector<f64, 4>, FixedVector<f64, 2>) {
        let (external, yaw, pitch) = plane_transform(yaw, pitch, self.plane_distance);
        (external, FixedVector::from([yaw, pitch]))
    }

    /// Projection of point `index` into the second camera and whether the point lies in front
    /// of both cameras.
    fn project_point(
        &self,
        plane: &FixedVector<f64, 4>,
        pose: &FixedVector<f64, 16>,
        index: usize,
    ) -> Option<(Vector2<f64>, bool)> {
        let ray = &self.rays[index];
        let plane = Plane::from_external(plane);
        let world_point = plane.intersection(&ray.origin, &ray.direction)?;

        let camera_t_world = Matrix4::from_column_slice(pose.as_slice());
        let camera_point = (camera_t_world * world_point.push(1.0)).xyz();

        let in_front =
            ray.direction.dot(&(world_point - ray.origin)) > 0.0 && camera_point.z > 0.0;
        let projected = self.camera.project(&camera_point)?;
        Some((projected, in_front))
    }

    fn value_of(
        &self,
        plane: &FixedVector<f64, 4>,
        pose: &FixedVector<f64, 16>,
        index: usize,
    ) -> FixedVector<f64, 2> {
        self.project_point(plane, pose, index)
            .map(|(p, _)| FixedVector::from([p.x, p.y]))
            .unwrap_or_default()
    }

    fn error_of(
        &self,
        plane: &FixedVector<f64, 4>,
        pose: &FixedVector<f64, 16>,
        group: usize,
        index: usize,
    ) -> Option<FixedVector<f64, 2>> {
        let (projected, in_front) = self.project_point(plane, pose, index)?;
        if self.only_front_points && !in_front {
            return None;
        }

        let error = projected - self.image_point_groups[group][index];
        let error = FixedVector::from([error.x, error.y]);
        Some(if self.quantized_residuals {
            quantize_residual(&error)
        } else {
            error
        })
    }
}

/// One second camera: internal `(yaw, pitch | pose)`, external `(plane | 4x4 pose)`.
impl DenseUniversalModel<8, 2, 20> for PosesPlaneData {
    fn value(&self, external: &FixedVector<f64, 20>, index: usize) -> FixedVector<f64, 2> {
        let (plane, pose) = split_external(external);
        self.value_of(&plane, &pose, index)
    }

    fn error(&self, external: &FixedVector<f64, 20>, index: usize) -> Option<FixedVector<f64, 2>> {
        let (plane, pose) = split_external(external);
        self.error_of(&plane, &pose, 0, index)
    }

    fn transform(
        &self,
        internal: &FixedVector<f64, 8>,
    ) -> (FixedVector<f64, 20>, FixedVector<f64, 8>) {
        let (plane, angles) = self.plane_from_angles(internal[0], internal[1]);
        let (pose, pose_model) =
            pose_transform(&FixedVector::from_prefix(&internal.as_slice()[2..]));

        let mut external = FixedVector::new();
        external.as_mut_slice()[..4].copy_from_slice(plane.as_slice());
        external.as_mut_slice()[4..].copy_from_slice(pose.as_slice());

        let mut renormalized = FixedVector::new();
        renormalized.as_mut_slice()[..2].copy_from_slice(angles.as_slice());
        renormalized.as_mut_slice()[2..].copy_from_slice(pose_model.as_slice());
        (external, renormalized)
    }
}

fn split_external(external: &FixedVector<f64, 20>) -> (FixedVector<f64, 4>, FixedVector<f64, 16>) {
    (
        FixedVector::from_prefix(&external.as_slice()[..4]),
        FixedVector::from_prefix(&external.as_slice()[4..]),
    )
}

/// Shared plane `(yaw, pitch)`, one pose per second camera.
impl SharedIndividualModel<2, 6, 2, 4, 16> for PosesPlaneData {
    fn value(
        &self,
        shared: &FixedVector<f64, 4>,
        individual: &FixedVector<f64, 16>,
        _individual_index: usize,
        element_index: usize,
    ) -> FixedVector<f64, 2> {
        self.value_of(shared, individual, element_index)
    }

    fn error(
        &self,
        shared: &FixedVector<f64, 4>,
        individual: &FixedVector<f64, 16>,
        individual_index: usize,
        element_index: usize,
    ) -> Option<FixedVector<f64, 2>> {
        self.error_of(shared, individual, individual_index, element_index)
    }

    fn shared_is_valid(&self, shared: &FixedVector<f64, 4>) -> bool {
        let normal = Vector3::new(shared[0], shared[1], shared[2]);
        normal.iter().all(|v| v.is_finite()) && normal.norm() > EPS
    }

    fn transform_shared(
        &self,
        internal: &FixedVector<f64, 2>,
    ) -> (FixedVector<f64, 4>, FixedVector<f64, 2>) {
        self.plane_from_angles(internal[0], internal[1])
    }

    fn transform_individual(
        &self,
        internal: &FixedVector<f64, 6>,
    ) -> (FixedVector<f64, 16>, FixedVector<f64, 6>) {
        pose_transform(internal)
    }
}

fn plane_angles(plane: &Plane, plane_distance: f64) -> CoreResult<(f64, f64)> {
    if (plane.distance() - plane_distance).abs() > EPS.sqrt() {
        return Err(CoreError::InvalidInput(format!(
            "plane distance {} differs from the fixed distance {}",
            plane.distance(),
            plane_distance
        ))
        .log());
    }
    Ok(plane.decompose_normal())
}

/// Optimizes the pose of a single second camera together with the plane orientation.
///
/// `data` must hold exactly one group of second image points.
///
/// # Errors
/// - `CoreError::InvalidInput` if `data` holds more than one group or `plane` has another
///   distance than `data`
/// - the optimizer errors of [`crate::optimizer::LevenbergMarquardt::optimize_dense`]
pub fn optimize_pose_plane(
    data: &mut PosesPlaneData,
    second_t_world: &Isometry3<f64>,
    plane: &Plane,
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<(Isometry3<f64>, Plane)>> {
    if data.number_cameras() != 1 {
        return Err(CoreError::InvalidInput(format!(
            "a single pose optimization needs one image point group, got {}",
            data.number_cameras()
        ))
        .log()
        .into());
    }
    let (yaw, pitch) = plane_angles(plane, data.plane_distance)?;

    let mut model = FixedVector::<f64, 8>::new();
    model[0] = yaw;
    model[1] = pitch;
    model.as_mut_slice()[2..].copy_from_slice(pose_to_model(second_t_world).as_slice());

    let elements = data.number_points();
    let result = optimize_universal_model::<_, 8, 2, 20>(data, &model, elements, config)?;

    let optimized = result.parameters;
    let pose = model_to_pose(&FixedVector::from_prefix(&optimized.as_slice()[2..]));
    let plane = Plane::from_angles(optimized[0], optimized[1], data.plane_distance);
    Ok(result.with_parameters((pose, plane)))
}

/// Optimizes the poses of all second cameras together with the shared plane orientation.
///
/// # Errors
/// - `CoreError::DimensionMismatch` if `poses` does not hold one pose per image point group
/// - `CoreError::InvalidInput` if `plane` has another distance than `data`
/// - the optimizer errors of [`crate::optimizer::LevenbergMarquardt::optimize_sparse`]
pub fn optimize_poses_plane(
    data: &mut PosesPlaneData,
    poses: &[Isometry3<f64>],
    plane: &Plane,
    config: &LevenbergMarquardtConfig,
) -> LmResult<SolverResult<(Vec<Isometry3<f64>>, Plane)>> {
    let (yaw, pitch) = plane_angles(plane, data.plane_distance)?;
    let shared = FixedVector::from([yaw, pitch]);
    let individuals: Vec<FixedVector<f64, 6>> = poses.iter().map(pose_to_model).collect();
    let counts = vec![data.number_points(); data.number_cameras()];

    let result = optimize_shared_individual::<_, 2, 6, 2, 4, 16>(
        data,
        &shared,
        &individuals,
        &counts,
        config,
    )?;

    let (angles, models) = &result.parameters;
    let plane = Plane::from_angles(angles[0], angles[1], data.plane_distance);
    let poses = models.iter().map(model_to_pose).collect();
    Ok(result.with_parameters((poses, plane)))
}
