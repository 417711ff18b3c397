//! Writing test outputs: per-clip prediction files and the metric report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use traj_common::Agent;

pub const TEST_RESULTS_FILE: &str = "test_results.json";

/// Predictions of one agent, in world coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPrediction {
    pub id: u32,
    pub frames: Vec<u32>,
    pub obs: Vec<[f32; 2]>,
    pub gt: Vec<[f32; 2]>,
    /// `K` candidate futures.
    pub pred: Vec<Vec<[f32; 2]>>,
}

/// Metrics of one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub model: String,
    pub dataset: String,
    pub split: String,
    pub clips: Vec<String>,
    pub agents: usize,
    pub metrics: BTreeMap<String, f32>,
}

fn points(t: &Tensor) -> anyhow::Result<Vec<[f32; 2]>> {
    Ok(t.to_device(&Device::Cpu)?
        .to_vec2::<f32>()?
        .into_iter()
        .map(|p| [p[0], p[1]])
        .collect())
}

/// Write `<dir>/<clip>.json` for every clip present in `agents`.
///
/// `predictions` is `(n_agents, K, steps, 2)`, aligned with `agents`.
pub fn write_predictions(
    dir: &Path,
    agents: &[Agent],
    predictions: &Tensor,
) -> anyhow::Result<Vec<PathBuf>> {
    let n = predictions.dim(0)?;
    if n != agents.len() {
        anyhow::bail!("{n} predictions for {} agents", agents.len());
    }
    let predictions = predictions.to_device(&Device::Cpu)?;
    std::fs::create_dir_all(dir)?;

    let mut by_clip: BTreeMap<&str, Vec<AgentPrediction>> = BTreeMap::new();
    for (i, agent) in agents.iter().enumerate() {
        let pred = predictions
            .get(i)?
            .to_vec3::<f32>()?
            .into_iter()
            .map(|k| k.into_iter().map(|p| [p[0], p[1]]).collect())
            .collect();
        by_clip.entry(agent.clip.as_str()).or_default().push(AgentPrediction {
            id: agent.id,
            frames: agent.frames.clone(),
            obs: points(&agent.obs)?,
            gt: points(&agent.gt)?,
            pred,
        });
    }

    let mut written = Vec::with_capacity(by_clip.len());
    for (clip, preds) in by_clip {
        let path = dir.join(format!("{clip}.json"));
        std::fs::write(&path, serde_json::to_string(&preds)?)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(clip, agents = preds.len(), path = %path.display(), "predictions saved");
        written.push(path);
    }
    Ok(written)
}

/// Append `report` to `<dir>/test_results.json` (a JSON list).
pub fn append_report(dir: &Path, report: &TestReport) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(TEST_RESULTS_FILE);
    let mut reports: Vec<TestReport> = if path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&path)?)
            .with_context(|| format!("parsing {}", path.display()))?
    } else {
        Vec::new()
    };
    reports.push(report.clone());
    std::fs::write(&path, serde_json::to_string_pretty(&reports)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn agent(clip: &str, id: u32) -> Agent {
        let dev = Device::Cpu;
        Agent {
            clip: clip.into(),
            id,
            frames: vec![0, 10, 20],
            obs: Tensor::new(&[[0.0f32, 0.0], [1.0, 1.0]], &dev).unwrap(),
            gt: Tensor::new(&[[2.0f32, 2.0]], &dev).unwrap(),
            neighbors: Tensor::zeros((1, 2, 2), DType::F32, &dev).unwrap(),
            seg_map: None,
            map_paras: None,
        }
    }

    #[test]
    fn predictions_grouped_by_clip() {
        let dir = tempfile::tempdir().unwrap();
        let agents = vec![agent("a", 1), agent("b", 2), agent("a", 3)];
        let preds = Tensor::ones((3, 2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let files = write_predictions(dir.path(), &agents, &preds).unwrap();
        assert_eq!(files.len(), 2);

        let a: Vec<AgentPrediction> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("a.json")).unwrap())
                .unwrap();
        assert_eq!(a.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(a[0].pred.len(), 2);
        assert_eq!(a[0].obs[1], [1.0, 1.0]);
    }

    #[test]
    fn misaligned_predictions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let preds = Tensor::ones((2, 1, 1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(write_predictions(dir.path(), &[agent("a", 1)], &preds).is_err());
    }

    #[test]
    fn reports_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = TestReport {
            model: "evsc".into(),
            dataset: "ETH-UCY".into(),
            split: "zara1".into(),
            clips: vec!["zara1".into()],
            agents: 10,
            metrics: BTreeMap::from([("ADE".to_string(), 0.25f32)]),
        };
        append_report(dir.path(), &report).unwrap();
        report.clips = vec!["zara2".into()];
        let path = append_report(dir.path(), &report).unwrap();
        let all: Vec<TestReport> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].clips, vec!["zara2".to_string()]);
    }
}
