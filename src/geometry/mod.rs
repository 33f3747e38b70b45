//! Geometry kernel: rigid transforms, two-view and PnP solvers, triangulation.

pub mod essential;
pub mod pnp;
pub mod ransac;
pub mod se3;
pub mod so3;
pub mod triangulation;

pub use essential::{Correspondence, EssentialEstimate, RelativePose};
pub use pnp::{solve_pnp_ransac, PnpConfig, PnpSolution};
pub use ransac::RansacConfig;
pub use se3::SE3;
pub use triangulation::Triangulated;
