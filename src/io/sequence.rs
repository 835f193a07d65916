//! Recorded RGB-D sequences with detections, for offline replay.
//!
//! Layout:
//!
//! ```text
//! <root>/camera.yaml          width, height, intrinsics [fx, fy, cx, cy]
//! <root>/color/data.csv       timestamp_ns, filename
//! <root>/color/data/<file>
//! <root>/depth/data.csv       timestamp_ns, filename (16-bit PNG, mm)
//! <root>/depth/data/<file>
//! <root>/detections.csv       timestamp_ns, model, confidence, tx, ty, tz, qx, qy, qz, qw
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_COLOR, IMREAD_UNCHANGED};
use opencv::prelude::*;
use serde::Deserialize;

use crate::detection::{DetectedPose, DetectionBatch};
use crate::geometry::SE3;
use crate::system::{CameraInfo, TrackerEvent};
use crate::tracking::frame::StampedImage;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

/// One step of a replay, in timestamp order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStep {
    Depth(usize),
    Color(usize),
    Detections(usize),
}

/// `camera.yaml` format.
#[derive(Debug, Deserialize)]
struct CameraYaml {
    width: u32,
    height: u32,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
}

#[derive(Debug)]
pub struct RecordedSequence {
    root: PathBuf,
    pub camera: CameraInfo,
    pub color_entries: Vec<ImageEntry>,
    pub depth_entries: Vec<ImageEntry>,
    pub detections: Vec<DetectionBatch>,
}

impl RecordedSequence {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let camera = load_camera(&root.join("camera.yaml"))?;
        let color_entries = load_image_list(root.join("color/data.csv"))?;
        let depth_entries = load_image_list(root.join("depth/data.csv"))?;

        let detections_path = root.join("detections.csv");
        let detections = if detections_path.exists() {
            load_detections(detections_path)?
        } else {
            Vec::new()
        };

        if color_entries.is_empty() {
            bail!("No color frames in {}", root.display());
        }

        Ok(Self {
            root,
            camera,
            color_entries,
            depth_entries,
            detections,
        })
    }

    /// Every frame and detection batch ordered by timestamp.
    ///
    /// At equal timestamps depth comes before color and detections come last,
    /// so a detection always finds the frames it was computed from.
    pub fn replay_order(&self) -> Vec<(u64, ReplayStep)> {
        let mut steps: Vec<(u64, ReplayStep)> = self
            .depth_entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.timestamp_ns, ReplayStep::Depth(i)))
            .chain(
                self.color_entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (e.timestamp_ns, ReplayStep::Color(i))),
            )
            .chain(
                self.detections
                    .iter()
                    .enumerate()
                    .map(|(i, b)| (b.timestamp_ns, ReplayStep::Detections(i))),
            )
            .collect();
        // Stable sort keeps the depth / color / detections grouping at equal stamps.
        steps.sort_by_key(|(ts, _)| *ts);
        steps
    }

    /// Load the data for one replay step as a tracker event.
    pub fn event(&self, step: ReplayStep) -> Result<TrackerEvent> {
        match step {
            ReplayStep::Depth(i) => {
                let entry = entry(&self.depth_entries, i)?;
                let image = read_image(&self.root.join("depth/data").join(&entry.filename), IMREAD_UNCHANGED)?;
                Ok(TrackerEvent::Depth(StampedImage::new(entry.timestamp_ns, image)))
            }
            ReplayStep::Color(i) => {
                let entry = entry(&self.color_entries, i)?;
                let image = read_image(&self.root.join("color/data").join(&entry.filename), IMREAD_COLOR)?;
                Ok(TrackerEvent::Image(StampedImage::new(entry.timestamp_ns, image)))
            }
            ReplayStep::Detections(i) => {
                let batch = self
                    .detections
                    .get(i)
                    .with_context(|| format!("No detection batch {i}"))?;
                Ok(TrackerEvent::Detections(batch.clone()))
            }
        }
    }

    pub fn camera_event(&self) -> TrackerEvent {
        TrackerEvent::CameraInfo(self.camera)
    }

    pub fn len(&self) -> usize {
        self.color_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.color_entries.is_empty()
    }
}

fn entry(entries: &[ImageEntry], idx: usize) -> Result<&ImageEntry> {
    entries
        .get(idx)
        .with_context(|| format!("No image entry {idx}"))
}

fn read_image(path: &Path, flags: i32) -> Result<Mat> {
    let path_str = path.to_str().context("Invalid image path")?;
    let image = imgcodecs::imread(path_str, flags)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if image.empty() {
        bail!("Failed to read {}", path.display());
    }
    Ok(image)
}

fn load_camera(path: &Path) -> Result<CameraInfo> {
    let yaml: CameraYaml = serde_yaml::from_reader(
        File::open(path).with_context(|| format!("Failed to open {:?}", path))?,
    )?;
    if yaml.intrinsics.len() != 4 {
        bail!(
            "Expected 4 intrinsics [fx, fy, cx, cy], got {}",
            yaml.intrinsics.len()
        );
    }
    let (fx, fy, cx, cy) = (
        yaml.intrinsics[0],
        yaml.intrinsics[1],
        yaml.intrinsics[2],
        yaml.intrinsics[3],
    );
    Ok(CameraInfo {
        k: [fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0],
        width: yaml.width,
        height: yaml.height,
    })
}

/// Headerless CSV with `#` comments, as written by the recorder.
fn csv_records(csv_path: &Path) -> Result<csv::StringRecordsIntoIter<File>> {
    let reader = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    Ok(reader.into_records())
}

fn parse_field<T>(rec: &csv::StringRecord, idx: usize, csv_path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let line = rec.position().map_or(0, |p| p.line());
    let field = rec
        .get(idx)
        .with_context(|| format!("{}:{line}: missing column {idx}", csv_path.display()))?;
    field
        .parse()
        .with_context(|| format!("{}:{line}: bad value {field:?}", csv_path.display()))
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    csv_records(&csv_path)?
        .map(|rec| -> Result<ImageEntry> {
            let rec = rec?;
            Ok(ImageEntry {
                timestamp_ns: parse_field(&rec, 0, &csv_path)?,
                filename: parse_field(&rec, 1, &csv_path)?,
            })
        })
        .collect()
}

/// Rows with the same consecutive timestamp form one batch.
fn load_detections(csv_path: PathBuf) -> Result<Vec<DetectionBatch>> {
    let mut batches: Vec<DetectionBatch> = Vec::new();
    for rec in csv_records(&csv_path)? {
        let rec = rec?;
        let ts: u64 = parse_field(&rec, 0, &csv_path)?;
        let mut values = [0.0f64; 8];
        for (i, v) in values.iter_mut().enumerate() {
            *v = parse_field(&rec, i + 2, &csv_path)?;
        }
        let [confidence, tx, ty, tz, qx, qy, qz, qw] = values;
        let pose = DetectedPose {
            model: parse_field(&rec, 1, &csv_path)?,
            pose: SE3 {
                rotation: UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz)),
                translation: Vector3::new(tx, ty, tz),
            },
            confidence,
        };

        match batches.last_mut() {
            Some(batch) if batch.timestamp_ns == ts => batch.poses.push(pose),
            _ => batches.push(DetectionBatch::new(ts, vec![pose])),
        }
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use approx::assert_relative_eq;
    use opencv::core::{CV_16UC1, CV_8UC3, Scalar, Vector};

    fn write_sequence(root: &Path) {
        fs::create_dir_all(root.join("color/data")).unwrap();
        fs::create_dir_all(root.join("depth/data")).unwrap();
        fs::write(
            root.join("camera.yaml"),
            "width: 64\nheight: 48\nintrinsics: [50.0, 51.0, 32.0, 24.0]\n",
        )
        .unwrap();
        fs::write(
            root.join("color/data.csv"),
            "#timestamp [ns],filename\n100,100.png\n200,200.png\n",
        )
        .unwrap();
        fs::write(root.join("depth/data.csv"), "100,100.png\n200,200.png\n").unwrap();
        fs::write(
            root.join("detections.csv"),
            "# ts, model, conf, t, q\n\
             100,drill,0.9,0.0,0.0,0.5,0.0,0.0,0.0,1.0\n\
             100,mug,0.4,0.1,0.0,0.6,0.0,0.0,0.7071068,0.7071068\n\
             200,drill,0.8,0.0,0.0,0.5,0.0,0.0,0.0,1.0\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());

        let seq = RecordedSequence::new(dir.path()).unwrap();

        assert_eq!(seq.len(), 2);
        assert_eq!(seq.camera.k, [50.0, 0.0, 32.0, 0.0, 51.0, 24.0, 0.0, 0.0, 1.0]);
        assert_eq!((seq.camera.width, seq.camera.height), (64, 48));
        assert_eq!(seq.detections.len(), 2);
        assert_eq!(seq.detections[0].poses.len(), 2);
        assert_eq!(seq.detections[1].timestamp_ns, 200);

        let mug = &seq.detections[0].poses[1];
        assert_eq!(mug.model, "mug");
        assert_relative_eq!(mug.confidence, 0.4);
        assert_relative_eq!(mug.pose.rotation.angle(), std::f64::consts::FRAC_PI_2, epsilon = 1e-6);
    }

    #[test]
    fn test_replay_order() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        let seq = RecordedSequence::new(dir.path()).unwrap();

        let steps: Vec<ReplayStep> = seq.replay_order().into_iter().map(|(_, s)| s).collect();

        assert_eq!(
            steps,
            vec![
                ReplayStep::Depth(0),
                ReplayStep::Color(0),
                ReplayStep::Detections(0),
                ReplayStep::Depth(1),
                ReplayStep::Color(1),
                ReplayStep::Detections(1),
            ]
        );
    }

    #[test]
    fn test_event_reads_images() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        let color = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(90.0)).unwrap();
        let depth = Mat::new_rows_cols_with_default(48, 64, CV_16UC1, Scalar::all(750.0)).unwrap();
        for ts in ["100", "200"] {
            let color_path = dir.path().join(format!("color/data/{ts}.png"));
            let depth_path = dir.path().join(format!("depth/data/{ts}.png"));
            imgcodecs::imwrite(color_path.to_str().unwrap(), &color, &Vector::new()).unwrap();
            imgcodecs::imwrite(depth_path.to_str().unwrap(), &depth, &Vector::new()).unwrap();
        }
        let seq = RecordedSequence::new(dir.path()).unwrap();

        match seq.event(ReplayStep::Depth(1)).unwrap() {
            TrackerEvent::Depth(frame) => {
                assert_eq!(frame.timestamp_ns, 200);
                assert_eq!(frame.image.typ(), CV_16UC1);
                assert_eq!(*frame.image.at_2d::<u16>(10, 10).unwrap(), 750);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match seq.event(ReplayStep::Color(0)).unwrap() {
            TrackerEvent::Image(frame) => assert_eq!(frame.image.typ(), CV_8UC3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_short_detection_row_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        fs::write(dir.path().join("detections.csv"), "100,drill,0.9,0.0,0.0\n").unwrap();

        let err = RecordedSequence::new(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("missing column 5"), "{err:#}");
    }

    #[test]
    fn test_missing_image_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_sequence(dir.path());
        let seq = RecordedSequence::new(dir.path()).unwrap();

        assert!(seq.event(ReplayStep::Color(0)).is_err());
        assert!(seq.event(ReplayStep::Detections(5)).is_err());
    }
}
