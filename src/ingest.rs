use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::action::{raw_bbox, Action, BBox};
use crate::error::GraphError;
use crate::graph::{Cursor, Graph, TrajectoryStep};
use crate::oracle::Oracles;

#[derive(Debug, Deserialize)]
struct TaskFile {
    task: String,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    trajectory: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action: Value,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    bbox: Option<BBox>,
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    pub id: String,
    pub task: String,
    pub steps: Vec<TrajectoryStep>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub trajectories: usize,
    pub steps: usize,
    pub skipped: Vec<String>,
    // steps before the failure are kept
    pub failed: Vec<String>,
}

pub fn trajectory_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "json") || !path.is_dir() {
            continue;
        }
        dirs.push(path);
    }
    dirs.sort();
    Ok(dirs)
}

pub fn load_trajectory(dir: &Path) -> Result<Trajectory> {
    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no folder name", dir.display()))?;
    let file = dir.join(format!("{id}.json"));
    let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
    let parsed: TaskFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let steps = parsed
        .trajectory
        .into_iter()
        .enumerate()
        .map(|(i, raw)| TrajectoryStep {
            screenshot: dir.join(format!("observation_{i}.png")),
            bbox: raw.bbox.or_else(|| raw_bbox(&raw.action)),
            action: Action::from_raw(&raw.action),
            app: raw.app.or_else(|| parsed.app.clone()),
        })
        .collect();
    Ok(Trajectory { id, task: parsed.task, steps })
}

pub async fn ingest_trajectory<R: Rng + Send>(
    graph: &mut Graph,
    trajectory: &Trajectory,
    oracles: &Oracles,
    rng: &mut R,
) -> Result<usize, GraphError> {
    let mut prev: Option<Cursor> = None;
    for (i, step) in trajectory.steps.iter().enumerate() {
        let cursor = graph.update(step, prev, oracles, rng).await?;
        info!(trajectory = %trajectory.id, step = i + 1, node = %cursor.node, "step folded into graph");
        prev = Some(cursor);
    }
    Ok(trajectory.steps.len())
}

pub async fn build_from_dir<R: Rng + Send>(
    graph: &mut Graph,
    oracles: &Oracles,
    input: &Path,
    output: &Path,
    rng: &mut R,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for dir in trajectory_dirs(input)? {
        let trajectory = match load_trajectory(&dir) {
            Ok(t) => t,
            Err(e) => {
                warn!(dir = %dir.display(), error = %format!("{e:#}"), "skipping unreadable task folder");
                report.skipped.push(dir.display().to_string());
                continue;
            }
        };
        info!(trajectory = %trajectory.id, task = %trajectory.task, steps = trajectory.steps.len(), "ingesting trajectory");

        match ingest_trajectory(graph, &trajectory, oracles, rng).await {
            Ok(n) => {
                report.trajectories += 1;
                report.steps += n;
            }
            Err(e) => {
                warn!(trajectory = %trajectory.id, error = %e, "trajectory aborted");
                report.failed.push(trajectory.id.clone());
            }
        }
        graph
            .save(output)
            .with_context(|| format!("saving graph to {}", output.display()))?;
    }
    info!(
        trajectories = report.trajectories,
        steps = report.steps,
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        nodes = graph.len(),
        "ingest finished"
    );
    Ok(report)
}
