//! Concrete optimization problems built on the universal adapters.
//!
//! - [`homography`]: 2D-2D homography refinement, numeric and closed-form
//! - [`plane`]: plane fitting to 3D points
//! - [`pose_plane`]: camera poses and plane orientation from image correspondences

pub mod homography;
pub mod plane;
pub mod pose_plane;

pub use homography::{
    HomographyData, HomographyProvider, optimize_homography, optimize_homography_analytic,
};
pub use plane::{Plane, PlaneData, optimize_plane};
pub use pose_plane::{
    PinholeCamera, PosesPlaneData, optimize_pose_plane, optimize_poses_plane, quantize_residual,
};
