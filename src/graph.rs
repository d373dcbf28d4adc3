use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionRecord, BBox};
use crate::error::{GraphError, OracleError};
use crate::node::{Edge, NodeId, ScreenNode};
use crate::oracle::Oracles;
use crate::screenshot::Screenshot;

#[derive(Clone, Debug)]
pub struct GraphConfig {
    // strictly above
    pub threshold: f32,
    pub text_accept: f32,
    pub text_samples: usize,
    pub visual_samples: usize,
    pub nodes_dir: Option<PathBuf>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            text_accept: 0.9,
            text_samples: 5,
            visual_samples: 3,
            nodes_dir: env::var("SCREENGRAPH_NODES_DIR").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub node: NodeId,
    pub edge: usize,
}

#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    pub screenshot: PathBuf,
    pub action: Action,
    pub bbox: Option<BBox>,
    pub app: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub screenshots: usize,
    pub edges: usize,
    pub unresolved_edges: usize,
    pub apps: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<NodeId, ScreenNode>,
    next_id: i64,
    home_id: NodeId,
    app: String,
    config: GraphConfig,
}

impl Graph {
    pub fn new(app: impl Into<String>, config: GraphConfig) -> Self {
        Self {
            nodes: BTreeMap::new(),
            next_id: 0,
            home_id: NodeId::HOME,
            app: app.into(),
            config,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn home_id(&self) -> NodeId {
        self.home_id
    }

    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&ScreenNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ScreenNode> {
        self.nodes.values()
    }

    // On error nothing from this step is committed; earlier steps stay.
    pub async fn update<R: Rng + Send>(
        &mut self,
        step: &TrajectoryStep,
        prev: Option<Cursor>,
        oracles: &Oracles,
        rng: &mut R,
    ) -> Result<Cursor, GraphError> {
        if let Some(p) = prev {
            self.check_cursor(p)?;
        }
        let app = step.app.clone().unwrap_or_else(|| self.app.clone());
        let shot = Screenshot::create(&step.screenshot, &app, oracles).await?;
        let candidate = ScreenNode::candidate(shot, step.action.clone(), step.bbox, app);

        let cursor = match self.find_similar(&candidate, oracles, rng).await? {
            Some(id) => {
                self.store_images(&candidate, id).await?;
                if let Some(p) = prev {
                    self.link(p, id)?;
                }
                let cursor = self.merge_into(candidate, id)?;
                info!(node = %id, screenshot = %step.screenshot.display(), "merged into existing node");
                cursor
            }
            None => {
                let id = NodeId(self.next_id);
                self.store_images(&candidate, id).await?;
                let cursor = self.place(candidate, id);
                if let Some(p) = prev {
                    self.link(p, id)?;
                }
                info!(node = %id, screenshot = %step.screenshot.display(), "added new node");
                cursor
            }
        };
        Ok(cursor)
    }

    async fn find_similar<R: Rng + Send>(
        &self,
        candidate: &ScreenNode,
        oracles: &Oracles,
        rng: &mut R,
    ) -> Result<Option<NodeId>, OracleError> {
        let mut above: Vec<(NodeId, f32)> = Vec::new();
        for (id, node) in &self.nodes {
            let score = node.similarity(candidate, &self.config, oracles, rng).await?;
            debug!(node = %id, score, "total similarity");
            if score > self.config.threshold {
                above.push((*id, score));
            }
        }
        let Some(best) = above.iter().map(|(_, s)| *s).reduce(f32::max) else {
            return Ok(None);
        };
        let tied: Vec<NodeId> = above
            .iter()
            .filter(|(_, s)| *s == best)
            .map(|(id, _)| *id)
            .collect();
        let chosen = tied.choose(rng).copied();
        if tied.len() > 1 {
            warn!(candidates = ?tied, score = best, chosen = ?chosen, "several nodes tie for best match, picking one at random");
        }
        Ok(chosen)
    }

    fn check_cursor(&self, cursor: Cursor) -> Result<(), GraphError> {
        let node = self.nodes.get(&cursor.node).ok_or_else(|| {
            GraphError::Integrity(format!("predecessor node {} does not exist", cursor.node))
        })?;
        if cursor.edge >= node.edges.len() {
            return Err(GraphError::Integrity(format!(
                "predecessor node {} has no edge slot {}",
                cursor.node, cursor.edge
            )));
        }
        Ok(())
    }

    async fn store_images(&self, candidate: &ScreenNode, id: NodeId) -> Result<(), GraphError> {
        if let Some(root) = &self.config.nodes_dir {
            let dir = root.join(&candidate.app).join(format!("node{}", id));
            for shot in &candidate.screenshots {
                shot.store_into(&dir).await?;
            }
        }
        Ok(())
    }

    fn place(&mut self, mut candidate: ScreenNode, id: NodeId) -> Cursor {
        candidate.assign(id);
        self.nodes.insert(id, candidate);
        self.next_id += 1;
        self.add_home_edge(id);
        Cursor { node: id, edge: 0 }
    }

    fn merge_into(&mut self, candidate: ScreenNode, id: NodeId) -> Result<Cursor, GraphError> {
        let target = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| GraphError::Integrity(format!("merge target {} does not exist", id)))?;
        let ScreenNode { screenshots, edges, .. } = candidate;
        target.screenshots.extend(screenshots);
        let mut slot = 0;
        for mut edge in edges {
            edge.source = id;
            slot = target.push_edge(edge);
        }
        Ok(Cursor { node: id, edge: slot })
    }

    fn link(&mut self, prev: Cursor, resolved: NodeId) -> Result<(), GraphError> {
        let pred = self.nodes.get_mut(&prev.node).ok_or_else(|| {
            GraphError::Integrity(format!("predecessor node {} does not exist", prev.node))
        })?;
        let edge = pred.edges.get_mut(prev.edge).ok_or_else(|| {
            GraphError::Integrity(format!("predecessor node {} has no edge slot {}", prev.node, prev.edge))
        })?;
        edge.target = resolved;
        pred.next_ids.insert(resolved);
        if pred.dedup_edges() > 0 {
            info!(from = %prev.node, to = %resolved, "edge already recorded, dropped duplicate");
        }
        if resolved != prev.node {
            self.add_back_edge(resolved, prev.node);
        }
        Ok(())
    }

    fn add_home_edge(&mut self, source: NodeId) -> bool {
        let home = self.home_id;
        self.add_synthetic(Edge::new(source, home, Action::home()))
    }

    fn add_back_edge(&mut self, source: NodeId, target: NodeId) -> bool {
        self.add_synthetic(Edge::new(source, target, Action::back()))
    }

    fn add_synthetic(&mut self, edge: Edge) -> bool {
        match self.nodes.get_mut(&edge.source) {
            Some(node) => {
                let before = node.edges.len();
                node.push_edge(edge);
                node.edges.len() > before
            }
            None => false,
        }
    }

    pub async fn restore_embeddings(&mut self, oracles: &Oracles) -> Result<usize, GraphError> {
        let mut cache: HashMap<String, Vec<f32>> = HashMap::new();
        let mut updated = 0;
        for node in self.nodes.values_mut() {
            for shot in &mut node.screenshots {
                if !shot.embedding().is_empty() {
                    continue;
                }
                let text = shot.description().to_string();
                let embedding = match cache.get(&text) {
                    Some(e) => e.clone(),
                    None => {
                        let e = oracles.embed(&text).await?;
                        cache.insert(text, e.clone());
                        e
                    }
                };
                shot.set_embedding(embedding);
                updated += 1;
            }
        }
        info!(updated, distinct = cache.len(), "restored screenshot embeddings");
        Ok(updated)
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats { nodes: self.nodes.len(), ..GraphStats::default() };
        for node in self.nodes.values() {
            stats.screenshots += node.screenshots.len();
            stats.edges += node.edges.len();
            stats.unresolved_edges += node.edges.iter().filter(|e| !e.is_resolved()).count();
            stats.apps.insert(node.app.clone());
        }
        stats
    }

    // ========================= Persistence =========================

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| GraphError::io(dir, e))?;
        }
        let file = GraphFile {
            metadata: Some(Metadata {
                created_at: Utc::now().to_rfc3339(),
                num_nodes: self.nodes.len(),
                app: Some(self.app.clone()),
                next_id: Some(self.next_id),
            }),
            nodes: self.nodes.iter().map(|(id, n)| (id.0, NodeRecord::from(n))).collect(),
        };
        let text = serde_json::to_string_pretty(&file)?;
        if is_gzip(path) {
            let out = File::create(path).map_err(|e| GraphError::io(path, e))?;
            let mut gz = GzEncoder::new(out, Compression::default());
            gz.write_all(text.as_bytes()).map_err(|e| GraphError::io(path, e))?;
            gz.finish().map_err(|e| GraphError::io(path, e))?;
        } else {
            std::fs::write(path, text).map_err(|e| GraphError::io(path, e))?;
        }
        info!(path = %path.display(), nodes = self.nodes.len(), gzip = is_gzip(path), "graph saved");
        Ok(())
    }

    // Embeddings are not persisted; call restore_embeddings before ingesting more.
    pub fn load(path: impl AsRef<Path>, config: GraphConfig) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let text = if is_gzip(path) {
            let compressed = File::open(path).map_err(|e| GraphError::io(path, e))?;
            let mut text = String::new();
            GzDecoder::new(compressed)
                .read_to_string(&mut text)
                .map_err(|e| GraphError::io(path, e))?;
            text
        } else {
            std::fs::read_to_string(path).map_err(|e| GraphError::io(path, e))?
        };
        let file: GraphFile = serde_json::from_str(&text)?;

        let mut nodes = BTreeMap::new();
        for (key, record) in file.nodes {
            let id = NodeId(key);
            if record.node_id != id {
                warn!(key, node_id = %record.node_id, "node id differs from its key, using the key");
            }
            nodes.insert(id, record.into_node(id));
        }

        let (app, next_id) = match file.metadata {
            Some(meta) => (
                meta.app.unwrap_or_default(),
                meta.next_id.unwrap_or(nodes.len() as i64),
            ),
            None => (String::new(), nodes.len() as i64),
        };
        let max_id = nodes.keys().next_back().map(|id| id.0 + 1).unwrap_or(0);
        if next_id < max_id {
            warn!(next_id, max_id, "persisted next_id is behind existing ids, advancing it");
        }

        info!(path = %path.display(), nodes = nodes.len(), "graph loaded");
        Ok(Self {
            nodes,
            next_id: next_id.max(max_id),
            home_id: NodeId::HOME,
            app,
            config,
        })
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    nodes: BTreeMap<i64, NodeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    num_nodes: usize,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    next_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    node_id: NodeId,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    screenlists: Vec<ScreenshotRecord>,
    #[serde(default, alias = "ui_element_edge_list")]
    edges: Vec<EdgeRecord>,
    #[serde(default, alias = "next_node_id_list")]
    next_ids: Vec<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScreenshotRecord {
    #[serde(alias = "screenshot_path")]
    path: PathBuf,
    #[serde(default, alias = "node_description")]
    description: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    #[serde(alias = "source_node")]
    source: NodeId,
    #[serde(alias = "target_node")]
    target: NodeId,
    #[serde(flatten)]
    action: ActionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bbox: Option<BBox>,
}

impl From<&ScreenNode> for NodeRecord {
    fn from(n: &ScreenNode) -> Self {
        Self {
            node_id: n.id,
            app: Some(n.app.clone()),
            screenlists: n
                .screenshots
                .iter()
                .map(|s| ScreenshotRecord {
                    path: s.path().to_path_buf(),
                    description: s.description().to_string(),
                })
                .collect(),
            edges: n
                .edges
                .iter()
                .map(|e| EdgeRecord {
                    source: e.source,
                    target: e.target,
                    action: e.action.to_record(),
                    bbox: e.bbox,
                })
                .collect(),
            next_ids: n.next_ids.iter().copied().collect(),
        }
    }
}

impl NodeRecord {
    fn into_node(self, id: NodeId) -> ScreenNode {
        let mut node = ScreenNode::new(id, self.app.unwrap_or_default());
        node.screenshots = self
            .screenlists
            .into_iter()
            .map(|s| Screenshot::from_parts(s.path, s.description, Vec::new()))
            .collect();
        node.edges = self
            .edges
            .into_iter()
            .map(|e| Edge {
                source: e.source,
                target: e.target,
                action: Action::from_record(&e.action),
                bbox: e.bbox,
            })
            .collect();
        node.next_ids = self.next_ids.into_iter().collect();
        node
    }
}
