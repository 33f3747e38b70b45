//! Dataset access and trajectory output for the runner.

pub mod dataset;
pub mod trajectory;

pub use dataset::{Dataset, DatasetKind, RunConfig};
pub use trajectory::TrajectoryWriter;
