use anyhow::{bail, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mono_vo::config::{TrackerKind, VoConfig};
use mono_vo::io::{Dataset, RunConfig, TrajectoryWriter};
use mono_vo::system::VisualOdometry;
use mono_vo::tracking::frame::Frame;
use mono_vo::tracking::{DescriptorTracker, KltTracker, PointTracker};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let run_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "run.yaml".to_string());
    let run = RunConfig::from_yaml_file(&run_path)?;
    let config = match &run.vo_config {
        Some(path) => VoConfig::from_yaml_file(path)?,
        None => VoConfig::default(),
    };

    info!("Loading {:?} dataset from: {}", run.dataset, run.root.display());
    let dataset = Dataset::open(run.dataset, &run.root)?;
    info!(
        "Loaded {} frames, {} ground truth poses",
        dataset.len(),
        dataset.groundtruth.len()
    );

    match config.tracker {
        TrackerKind::Klt => {
            let tracker = KltTracker::new(config.klt);
            run_sequence(&run, &dataset, VisualOdometry::with_tracker(dataset.camera, &config, tracker))
        }
        TrackerKind::Descriptor => {
            let tracker = DescriptorTracker::new(config.descriptor_tracker);
            run_sequence(&run, &dataset, VisualOdometry::with_tracker(dataset.camera, &config, tracker))
        }
    }
}

fn run_sequence<T: PointTracker>(
    run: &RunConfig,
    dataset: &Dataset,
    mut vo: VisualOdometry<T>,
) -> Result<()> {
    let [first, second] = run.bootstrap_frames();
    let last = run
        .last_frame
        .unwrap_or(dataset.len() - 1)
        .min(dataset.len() - 1);
    if first >= second || second > last {
        bail!("Bootstrap frames {first}, {second} do not fit a sequence ending at {last}");
    }
    let gap = second - first;

    let mut writer = TrajectoryWriter::create(&run.output)?;

    let first_frame = load(&vo, dataset, first)?;
    let second_frame = load(&vo, dataset, second)?;
    let output = vo.bootstrap(first_frame, second_frame)?;
    writer.write(&output)?;

    let mut failures = 0;
    let mut i = second + 1;
    while i <= last {
        let frame = load(&vo, dataset, i)?;
        match vo.process_frame(frame) {
            Ok(output) => {
                writer.write(&output)?;
                if i % 100 == 0 {
                    info!(
                        frame = i,
                        landmarks = output.landmarks.len(),
                        candidates = output.num_candidates,
                        inliers = output.metrics.n_inliers,
                        ms = output.timing.total_ms,
                        "progress"
                    );
                }
                if !output.needs_rebootstrap() {
                    i += 1;
                    continue;
                }
                warn!(frame = i, "landmarks exhausted, re-bootstrapping");
            }
            Err(e) => {
                failures += 1;
                warn!(frame = i, "tracking failed: {}; re-bootstrapping", e);
            }
        }

        // The frame just handed over is the first view of the new map.
        let next = i + gap;
        if next > last {
            break;
        }
        let frame = load(&vo, dataset, next)?;
        match vo.rebootstrap(frame) {
            Ok(output) => writer.write(&output)?,
            Err(e) => warn!(frame = next, "re-bootstrap failed: {}", e),
        }
        i = next + 1;
    }

    writer.flush()?;
    info!(
        "Processed frames up to {}, {} poses written to {}, {} failed frames",
        last,
        vo.trajectory().len(),
        run.output.display(),
        failures
    );
    if let Some((index, pose)) = vo.trajectory().last() {
        if let Some(truth) = dataset.groundtruth_pose(*index) {
            info!(
                "Final position [{:.2}, {:.2}, {:.2}] (map units), ground truth [{:.2}, {:.2}, {:.2}] m",
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
                truth.translation.x,
                truth.translation.y,
                truth.translation.z,
            );
        }
    }
    Ok(())
}

fn load<T: PointTracker>(vo: &VisualOdometry<T>, dataset: &Dataset, i: usize) -> Result<Frame> {
    Ok(vo.extract(i, dataset.load_frame(i)?))
}
