//! Geometry utilities: SE3 transforms, meshes, projection and PnP solving.

pub mod mesh;
pub mod pnp;
pub mod projection;
pub mod se3;

pub use mesh::TriangleMesh;
pub use pnp::{PnpConfig, PoseEstimate, PoseSolver, RansacPnpSolver};
pub use projection::{AxesOverlay, SilhouetteMask, mesh_pose_to_mask, project_axes};
pub use se3::SE3;
