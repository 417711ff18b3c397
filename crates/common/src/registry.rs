//! Dataset / clip registry.
//!
//! Static descriptors loaded from JSON files:
//!
//! ```text
//! <root>/<DATASET>/<split>.json          → DatasetSplit
//! <root>/<DATASET>/subsets/<clip>.json   → ClipInfo
//! ```
//!
//! Read-only at runtime. [`ethucy`] writes the ETH-UCY descriptors and
//! converts the raw `true_pos_.csv` annotations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One video clip (sub-dataset).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClipInfo {
    pub name: String,
    /// Path of the processed `frame,id,x,y` annotation file.
    pub annpath: PathBuf,
    /// Column order of the coordinates in the annotation file.
    #[serde(default = "default_order")]
    pub order: [usize; 2],
    /// `[frame step between annotations, video fps]`.
    pub paras: [usize; 2],
    #[serde(default)]
    pub video_path: Option<PathBuf>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default = "default_scale")]
    pub scale_vis: f32,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_anntype")]
    pub anntype: String,
    /// Real-world → pixel matrix `[W0, b0, W1, b1]`.
    #[serde(default)]
    pub matrix: Vec<f32>,
    /// Optional segmentation map (safetensors with `map` and `paras`).
    #[serde(default)]
    pub segmap: Option<PathBuf>,
}

/// One train/test/val split of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSplit {
    pub dataset: String,
    pub train: Vec<String>,
    pub test: Vec<String>,
    pub val: Vec<String>,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default = "default_anntype")]
    pub anntype: String,
    #[serde(rename = "type", default = "default_type")]
    pub kind: String,
}

fn default_order() -> [usize; 2] {
    [0, 1]
}
fn default_scale() -> f32 {
    1.0
}
fn default_dimension() -> usize {
    2
}
fn default_anntype() -> String {
    "coordinate".to_string()
}
fn default_type() -> String {
    "meter".to_string()
}

/// Registry rooted at a `dataset_configs` directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split_path(&self, dataset: &str, split: &str) -> PathBuf {
        self.root.join(dataset).join(format!("{split}.json"))
    }

    pub fn clip_path(&self, dataset: &str, clip: &str) -> PathBuf {
        self.root
            .join(dataset)
            .join("subsets")
            .join(format!("{clip}.json"))
    }

    pub fn load_split(&self, dataset: &str, split: &str) -> anyhow::Result<DatasetSplit> {
        read_json(&self.split_path(dataset, split))
            .with_context(|| format!("load split `{split}` of dataset `{dataset}`"))
    }

    pub fn load_clip(&self, dataset: &str, clip: &str) -> anyhow::Result<ClipInfo> {
        read_json(&self.clip_path(dataset, clip))
            .with_context(|| format!("load clip `{clip}` of dataset `{dataset}`"))
    }

    pub fn save_split(&self, name: &str, split: &DatasetSplit) -> anyhow::Result<PathBuf> {
        let path = self.split_path(&split.dataset, name);
        write_json(&path, split)?;
        Ok(path)
    }

    pub fn save_clip(&self, dataset: &str, clip: &ClipInfo) -> anyhow::Result<PathBuf> {
        let path = self.clip_path(dataset, &clip.name);
        write_json(&path, clip)?;
        Ok(path)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let json =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

// ── ETH-UCY preset ──────────────────────────────────────────────────────────

pub mod ethucy {
    //! ETH-UCY descriptors and annotation conversion.

    use std::path::{Path, PathBuf};

    use anyhow::Context;

    use super::{ClipInfo, DatasetSplit, Registry};

    pub const DATASET: &str = "ETH-UCY";
    pub const PROCESSED_FILE: &str = "ann_meter.csv";
    pub const TEST_SETS: [&str; 5] = ["eth", "hotel", "zara1", "zara2", "univ"];

    /// `(name, source dir, order, frame step, video, matrix)`.
    const SUBSETS: [(&str, &str, [usize; 2], usize, &str, [f32; 4]); 8] = [
        ("eth", "eth", [0, 1], 6, "eth.mp4", [17.667, 190.19, 10.338, 225.89]),
        ("hotel", "hotel", [0, 1], 10, "hotel.mp4", [44.788, 310.07, 48.308, 497.08]),
        ("zara1", "zara1", [1, 0], 10, "zara1.mp4", [-42.547_48, 580.566_5, 47.293_7, 3.196_071]),
        ("zara2", "zara2", [1, 0], 10, "zara2.mp4", [-42.547_48, 580.566_5, 47.293_7, 3.196_071]),
        ("univ", "univ", [1, 0], 10, "students003.mp4", [-41.1428, 576.0, 48.0, 0.0]),
        ("zara3", "zara3", [1, 0], 10, "zara2.mp4", [-42.547_48, 580.566_5, 47.293_7, 3.196_071]),
        ("univ3", "univ3", [1, 0], 10, "students003.mp4", [-41.1428, 576.0, 48.0, 0.0]),
        ("unive", "unive", [1, 0], 10, "students003.mp4", [-41.1428, 576.0, 48.0, 0.0]),
    ];

    /// Clip descriptors with annotation paths under `processed_root`.
    pub fn clips(processed_root: &Path) -> Vec<(ClipInfo, [usize; 2])> {
        SUBSETS
            .iter()
            .map(|(name, _, order, step, video, matrix)| {
                let info = ClipInfo {
                    name: name.to_string(),
                    annpath: processed_root.join(DATASET).join(name).join(PROCESSED_FILE),
                    order: [0, 1],
                    paras: [*step, 25],
                    video_path: Some(PathBuf::from("videos").join(video)),
                    scale: 1.0,
                    scale_vis: 1.0,
                    dimension: 2,
                    anntype: "coordinate".to_string(),
                    matrix: matrix.to_vec(),
                    segmap: None,
                };
                (info, *order)
            })
            .collect()
    }

    /// Leave-one-out split: `test_clip` is the test/val set, all other clips train.
    pub fn split(test_clip: &str) -> DatasetSplit {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (name, ..) in SUBSETS.iter() {
            if *name == test_clip {
                test.push(name.to_string());
            } else {
                train.push(name.to_string());
            }
        }
        DatasetSplit {
            dataset: DATASET.to_string(),
            train,
            val: test.clone(),
            test,
            scale: 1.0,
            dimension: 2,
            anntype: "coordinate".to_string(),
            kind: "meter".to_string(),
        }
    }

    /// Frame / id value of a raw annotation as an index.
    fn whole(value: f64, what: &str, column: usize) -> anyhow::Result<u32> {
        if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
            anyhow::bail!("column {column}: {what} `{value}` is not a non-negative integer");
        }
        Ok(value as u32)
    }

    /// Convert `true_pos_.csv` (4 rows: frames, ids, x, y) into
    /// `frame,id,c0,c1` records, with coordinates reordered by `order`.
    pub fn transform_annotations(source: &Path, target: &Path, order: [usize; 2]) -> anyhow::Result<usize> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(source)
            .with_context(|| format!("open {}", source.display()))?;
        let rows = reader
            .deserialize::<Vec<f64>>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parse {}", source.display()))?;
        if rows.len() < 4 {
            anyhow::bail!("{}: expected 4 rows, got {}", source.display(), rows.len());
        }
        let n = rows[0].len();

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(target)
            .with_context(|| format!("create {}", target.display()))?;
        for i in 0..n {
            let frame = whole(rows[0][i], "frame", i)
                .with_context(|| format!("parse {}", source.display()))?;
            let id = whole(rows[1][i], "id", i)
                .with_context(|| format!("parse {}", source.display()))?;
            let coords = [rows[2][i], rows[3][i]];
            writer.serialize((frame, id, coords[order[0]], coords[order[1]]))?;
        }
        writer.flush()?;
        Ok(n)
    }

    /// Convert every clip found under `source_root` and write all descriptors.
    pub fn prepare(source_root: &Path, processed_root: &Path, registry: &Registry) -> anyhow::Result<()> {
        for ((info, order), (_, source_dir, ..)) in clips(processed_root).into_iter().zip(SUBSETS.iter()) {
            let source = source_root.join(source_dir).join("true_pos_.csv");
            if source.exists() {
                let n = transform_annotations(&source, &info.annpath, order)?;
                tracing::info!(clip = %info.name, records = n, "annotations converted");
            } else {
                tracing::warn!(path = %source.display(), "source annotations not found, skipped");
            }
            registry.save_clip(DATASET, &info)?;
        }
        for test_clip in TEST_SETS {
            let path = registry.save_split(test_clip, &split(test_clip))?;
            tracing::info!(path = %path.display(), "split saved");
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leave_one_out_split() {
        let s = ethucy::split("zara1");
        assert_eq!(s.test, vec!["zara1".to_string()]);
        assert_eq!(s.val, s.test);
        assert_eq!(s.train.len(), 7);
        assert!(!s.train.contains(&"zara1".to_string()));
    }

    #[test]
    fn registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path());
        let split = ethucy::split("eth");
        reg.save_split("eth", &split).unwrap();
        assert_eq!(reg.load_split(ethucy::DATASET, "eth").unwrap(), split);

        let (clip, _) = ethucy::clips(Path::new("processed")).remove(0);
        reg.save_clip(ethucy::DATASET, &clip).unwrap();
        let loaded = reg.load_clip(ethucy::DATASET, "eth").unwrap();
        assert_eq!(loaded.paras, [6, 25]);
        assert_eq!(loaded, clip);
    }

    #[test]
    fn transform_annotations_reorders_columns() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("true_pos_.csv");
        std::fs::write(&source, "10,20\n1,2\n0.5,1.5\n3.0,4.0\n").unwrap();
        let target = dir.path().join("out").join("ann_meter.csv");
        let n = ethucy::transform_annotations(&source, &target, [1, 0]).unwrap();
        assert_eq!(n, 2);
        let recs = crate::agent::read_annotations(&target).unwrap();
        assert_eq!((recs[0].frame, recs[0].id, recs[0].pos), (10, 1, [3.0, 0.5]));
        assert_eq!((recs[1].frame, recs[1].id, recs[1].pos), (20, 2, [4.0, 1.5]));
    }

    #[test]
    fn transform_annotations_rejects_bad_frames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ann_meter.csv");
        let source = dir.path().join("true_pos_.csv");
        // scientific notation, as in the raw files, is accepted
        std::fs::write(&source, "7.8e+02\n1\n0.5\n3.0\n").unwrap();
        assert_eq!(ethucy::transform_annotations(&source, &target, [0, 1]).unwrap(), 1);

        for bad in ["-1\n1\n0.5\n3.0\n", "10.5\n1\n0.5\n3.0\n", "10,20\n1\n0.5\n3.0\n"] {
            std::fs::write(&source, bad).unwrap();
            assert!(ethucy::transform_annotations(&source, &target, [0, 1]).is_err());
        }
    }
}
