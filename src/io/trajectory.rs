use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;

use crate::tracking::FrameOutput;

/// One CSV row per localized frame.
#[derive(Debug, Serialize)]
struct TrajectoryRow {
    frame: usize,
    tx: f64,
    ty: f64,
    tz: f64,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
    landmarks: usize,
    candidates: usize,
}

impl From<&FrameOutput> for TrajectoryRow {
    fn from(output: &FrameOutput) -> Self {
        let q = output.pose.rotation;
        Self {
            frame: output.frame_index,
            tx: output.pose.translation.x,
            ty: output.pose.translation.y,
            tz: output.pose.translation.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            landmarks: output.landmarks.len(),
            candidates: output.num_candidates,
        }
    }
}

/// Writes `T_wc` of every frame as CSV.
pub struct TrajectoryWriter<W: Write> {
    writer: Writer<W>,
}

impl TrajectoryWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let writer =
            Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self { writer })
    }
}

impl<W: Write> TrajectoryWriter<W> {
    pub fn from_writer(inner: W) -> Self {
        Self {
            writer: Writer::from_writer(inner),
        }
    }

    pub fn write(&mut self, output: &FrameOutput) -> Result<()> {
        self.writer
            .serialize(TrajectoryRow::from(output))
            .with_context(|| format!("Failed to write frame {}", output.frame_index))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush trajectory")
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to finish trajectory: {}", e.error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::{Landmark, Landmarks};
    use crate::tracking::{TimingStats, TrackingMetrics, TrackingState};
    use nalgebra::{Point2, Vector3};

    #[test]
    fn test_rows_have_header_and_pose() {
        let landmarks: Landmarks = (0..3)
            .map(|i| Landmark::new(Point2::new(i as f64, 0.0), Vector3::new(0.0, 0.0, 5.0)))
            .collect();
        let output = FrameOutput {
            frame_index: 7,
            state: TrackingState::Ok,
            pose: SE3 {
                translation: Vector3::new(1.0, 2.0, 3.0),
                ..SE3::identity()
            },
            landmarks,
            num_candidates: 11,
            metrics: TrackingMetrics::default(),
            timing: TimingStats::zero(),
        };

        let mut writer = TrajectoryWriter::from_writer(Vec::new());
        writer.write(&output).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();

        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("frame,tx,ty,tz,qw,qx,qy,qz,landmarks,candidates")
        );
        assert_eq!(lines.next(), Some("7,1.0,2.0,3.0,1.0,0.0,0.0,0.0,3,11"));
        assert_eq!(lines.next(), None);
    }
}
