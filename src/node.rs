use std::collections::BTreeSet;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{Action, BBox};
use crate::error::OracleError;
use crate::graph::GraphConfig;
use crate::oracle::Oracles;
use crate::screenshot::Screenshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl NodeId {
    // also the target of a pending edge
    pub const UNASSIGNED: NodeId = NodeId(-1);
    pub const HOME: NodeId = NodeId(0);

    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub action: Action,
    pub bbox: Option<BBox>,
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.target == other.target && self.action == other.action
    }
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, action: Action) -> Self {
        Self { source, target, action, bbox: None }
    }

    pub fn pending(action: Action, bbox: Option<BBox>) -> Self {
        Self { source: NodeId::UNASSIGNED, target: NodeId::UNASSIGNED, action, bbox }
    }

    pub fn is_resolved(&self) -> bool {
        self.target.is_assigned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenNode {
    pub(crate) id: NodeId,
    pub(crate) screenshots: Vec<Screenshot>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) next_ids: BTreeSet<NodeId>,
    pub(crate) app: String,
}

impl ScreenNode {
    pub fn new(id: NodeId, app: impl Into<String>) -> Self {
        Self {
            id,
            screenshots: Vec::new(),
            edges: Vec::new(),
            next_ids: BTreeSet::new(),
            app: app.into(),
        }
    }

    pub fn candidate(screenshot: Screenshot, action: Action, bbox: Option<BBox>, app: impl Into<String>) -> Self {
        let mut node = Self::new(NodeId::UNASSIGNED, app);
        node.screenshots.push(screenshot);
        node.edges.push(Edge::pending(action, bbox));
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn screenshots(&self) -> &[Screenshot] {
        &self.screenshots
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn next_ids(&self) -> &BTreeSet<NodeId> {
        &self.next_ids
    }

    pub(crate) fn assign(&mut self, id: NodeId) {
        self.id = id;
        for edge in &mut self.edges {
            edge.source = id;
        }
    }

    pub(crate) fn push_edge(&mut self, edge: Edge) -> usize {
        if let Some(i) = self.edges.iter().position(|e| *e == edge) {
            return i;
        }
        if edge.is_resolved() {
            self.next_ids.insert(edge.target);
        }
        self.edges.push(edge);
        self.edges.len() - 1
    }

    pub(crate) fn dedup_edges(&mut self) -> usize {
        let before = self.edges.len();
        let mut kept: Vec<Edge> = Vec::with_capacity(before);
        for edge in self.edges.drain(..) {
            if !kept.contains(&edge) {
                kept.push(edge);
            }
        }
        self.edges = kept;
        before - self.edges.len()
    }

    pub async fn similarity<R: Rng + Send>(
        &self,
        candidate: &ScreenNode,
        cfg: &GraphConfig,
        oracles: &Oracles,
        rng: &mut R,
    ) -> Result<f32, OracleError> {
        let Some(incoming) = candidate.screenshots.first() else {
            return Ok(0.0);
        };
        if self.screenshots.is_empty() || self.app != candidate.app {
            return Ok(0.0);
        }

        let text = self.text_similarity(incoming, cfg.text_samples, rng);
        debug!(node = %self.id, text, "text similarity");
        if text > cfg.text_accept {
            return Ok(1.0);
        }
        if text <= cfg.threshold {
            return Ok(0.0);
        }

        let visual = self.visual_similarity(incoming, cfg.visual_samples, oracles, rng).await?;
        debug!(node = %self.id, visual, "visual similarity");
        Ok(0.5 * text + 0.5 * visual)
    }

    fn text_similarity<R: Rng>(&self, incoming: &Screenshot, samples: usize, rng: &mut R) -> f32 {
        let picked: Vec<&Screenshot> = self.screenshots.choose_multiple(rng, samples).collect();
        if picked.is_empty() {
            return 0.0;
        }
        picked.iter().map(|s| s.text_similarity(incoming)).sum::<f32>() / picked.len() as f32
    }

    async fn visual_similarity<R: Rng + Send>(
        &self,
        incoming: &Screenshot,
        samples: usize,
        oracles: &Oracles,
        rng: &mut R,
    ) -> Result<f32, OracleError> {
        let picked: Vec<&Screenshot> = self.screenshots.choose_multiple(rng, samples).collect();
        if picked.is_empty() {
            return Ok(0.0);
        }
        let mut same = 0usize;
        for shot in &picked {
            if oracles.same_state(shot.path(), incoming.path()).await? {
                same += 1;
            }
        }
        Ok(same as f32 / picked.len() as f32)
    }
}
