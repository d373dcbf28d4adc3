use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nanoid::nanoid;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::action::{Action, ActionRecord, BBox};
use crate::error::{GraphError, NavigationError};
use crate::graph::Graph;
use crate::node::{Edge, NodeId};

const FINISHED_STATUSES: &[&str] = &["complete", "answer", "success"];

const TEXT_SEPARATORS: &[char] = &['，', '。', '/', ':', '*', '?', '"', '“', '”', '<', '>', '|'];

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub screen_width: f64,
    // radius = screen_width * click_radius_ratio
    pub click_radius_ratio: f64,
    pub app_aliases: BTreeMap<String, String>,
    pub app_zones: Vec<(String, BBox)>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        let app_aliases = [
            ("bilibili", "哔哩哔哩"),
            ("高德", "高德地图"),
            ("WPS", "WPS Office"),
            ("58", "58同城"),
            ("去哪儿", "去哪儿旅行"),
            ("携程", "携程旅行"),
            ("红果", "红果免费短剧"),
            ("红果短剧", "红果免费短剧"),
            ("小布", "小布助手"),
            ("百度浏览器", "百度"),
            ("JD", "京东"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let app_zones = [
            ("微信", BBox::new(78, 191, 248, 421)),
            ("QQ", BBox::new(327, 193, 499, 426)),
            ("淘宝", BBox::new(576, 472, 755, 705)),
            ("哔哩哔哩", BBox::new(329, 474, 501, 707)),
            ("抖音", BBox::new(78, 479, 250, 702)),
            ("京东", BBox::new(834, 479, 1004, 707)),
            ("美团", BBox::new(78, 756, 250, 988)),
            ("小红书", BBox::new(585, 758, 750, 981)),
            ("百度", BBox::new(834, 758, 1004, 988)),
            ("高德地图", BBox::new(329, 1042, 501, 1273)),
            ("拼多多", BBox::new(332, 1328, 490, 1558)),
            ("携程旅行", BBox::new(80, 1323, 250, 1553)),
            ("大众点评", BBox::new(834, 1326, 1004, 1556)),
        ]
        .into_iter()
        .map(|(k, b)| (k.to_string(), b))
        .collect();

        Self { screen_width: 1080.0, click_radius_ratio: 0.15, app_aliases, app_zones }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Moved { node: NodeId, note: String },
    Stayed { node: NodeId, reason: String },
    Completed { answer: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayRecord {
    pub step: usize,
    pub node: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskState {
    id: String,
    query: String,
    history_stack: Vec<NodeId>,
    current_node: NodeId,
    app_entry_index: BTreeMap<String, Vec<NodeId>>,
    status: TaskStatus,
    records: Vec<ReplayRecord>,
}

#[derive(Serialize)]
struct TrajectoryFile<'a> {
    task_id: &'a str,
    query: &'a str,
    status: TaskStatus,
    step_count: usize,
    trajectory: &'a [ReplayRecord],
}

impl TaskState {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn current_node(&self) -> NodeId {
        self.current_node
    }

    pub fn history(&self) -> &[NodeId] {
        &self.history_stack
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }

    pub fn answer(&self) -> Option<&str> {
        self.records.iter().rev().find_map(|r| r.answer.as_deref())
    }

    fn record(&mut self, action: &Action, note: String, answer: Option<String>) {
        let step = self.records.len();
        self.records.push(ReplayRecord {
            step,
            node: self.current_node,
            action: Some(action.to_record()),
            note: Some(note),
            answer,
        });
    }

    pub fn save_trajectory(&self, dir: impl AsRef<Path>) -> Result<PathBuf, GraphError> {
        let folder = dir.as_ref().join(safe_name(&self.query, &self.id));
        std::fs::create_dir_all(&folder).map_err(|e| GraphError::io(&folder, e))?;
        let file = TrajectoryFile {
            task_id: &self.id,
            query: &self.query,
            status: self.status,
            step_count: self.records.len(),
            trajectory: &self.records,
        };
        let path = folder.join("trajectory.json");
        std::fs::write(&path, serde_json::to_string_pretty(&file)?).map_err(|e| GraphError::io(&path, e))?;
        info!(task = %self.id, path = %path.display(), "saved replay trajectory");
        Ok(path)
    }
}

fn safe_name(query: &str, fallback: &str) -> String {
    let name: String = query
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    if name.is_empty() {
        fallback.to_string()
    } else {
        name
    }
}

pub struct ReplayMatcher<'g> {
    graph: &'g Graph,
    config: ReplayConfig,
    entries: BTreeMap<String, Vec<NodeId>>,
}

impl<'g> ReplayMatcher<'g> {
    pub fn new(graph: &'g Graph, config: ReplayConfig) -> Self {
        let entries = app_entries(graph);
        info!(apps = entries.len(), "indexed app entry nodes");
        Self { graph, config, entries }
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<NodeId>> {
        &self.entries
    }

    pub fn start_task(&self, query: impl Into<String>) -> TaskState {
        let home = self.graph.home_id();
        TaskState {
            id: nanoid!(),
            query: query.into(),
            history_stack: vec![home],
            current_node: home,
            app_entry_index: self.entries.clone(),
            status: TaskStatus::Active,
            records: vec![ReplayRecord { step: 0, node: home, action: None, note: None, answer: None }],
        }
    }

    // Errors end the task; Stayed does not.
    pub fn step<R: Rng>(
        &self,
        state: &mut TaskState,
        action: &Action,
        rng: &mut R,
    ) -> Result<StepOutcome, NavigationError> {
        if state.status != TaskStatus::Active {
            return Err(NavigationError::Inactive);
        }

        if action.is_back() {
            if state.history_stack.len() < 2 {
                return Err(self.fail(state, action, NavigationError::CannotGoBack));
            }
            let from = state.current_node;
            state.history_stack.pop();
            let to = *state.history_stack.last().unwrap_or(&self.graph.home_id());
            state.current_node = to;
            let note = format!("back to {} (from {})", to, from);
            info!(task = %state.id, from = %from, to = %to, "back");
            state.record(action, note.clone(), None);
            return Ok(StepOutcome::Moved { node: to, note });
        }

        match self.resolve(state, action, rng) {
            Ok(StepOutcome::Moved { node, note }) => {
                info!(task = %state.id, from = %state.current_node, to = %node, %note, "moved");
                state.history_stack.push(node);
                state.current_node = node;
                state.record(action, note.clone(), None);
                Ok(StepOutcome::Moved { node, note })
            }
            Ok(StepOutcome::Stayed { node, reason }) => {
                info!(task = %state.id, node = %node, %reason, "no matching edge, staying");
                state.record(action, reason.clone(), None);
                Ok(StepOutcome::Stayed { node, reason })
            }
            Ok(StepOutcome::Completed { answer }) => {
                info!(task = %state.id, answer = ?answer, "task completed");
                state.status = TaskStatus::Completed;
                state.record(action, "complete".into(), answer.clone().or_else(|| Some("complete".into())));
                Ok(StepOutcome::Completed { answer })
            }
            Err(err) => Err(self.fail(state, action, err)),
        }
    }

    fn fail(&self, state: &mut TaskState, action: &Action, err: NavigationError) -> NavigationError {
        warn!(task = %state.id, node = %state.current_node, error = %err, "replay task failed");
        state.status = TaskStatus::Failed;
        state.record(action, err.to_string(), None);
        err
    }

    fn resolve<R: Rng>(
        &self,
        state: &TaskState,
        action: &Action,
        rng: &mut R,
    ) -> Result<StepOutcome, NavigationError> {
        match action {
            Action::Complete => return Ok(StepOutcome::Completed { answer: None }),
            Action::Answer { text } => return Ok(StepOutcome::Completed { answer: Some(text.clone()) }),
            // other statuses (e.g. infeasible) go through the edge scan
            Action::Status { status } if is_finished(status) => {
                return Ok(StepOutcome::Completed { answer: Some(status.clone()) })
            }
            _ => {}
        }

        let home = self.graph.home_id();
        if action.is_home() {
            return Ok(StepOutcome::Moved { node: home, note: "back to home".into() });
        }

        if let Action::Open { app } = action {
            return self.open(state, app, rng);
        }
        if state.current_node == home {
            if let Action::Click { x, y } = action {
                if let Some(app) = self.app_at(*x, *y) {
                    return self.open(state, app, rng);
                }
            }
        }

        let node = self
            .graph
            .node(state.current_node)
            .ok_or(NavigationError::MissingNode(state.current_node))?;

        let matched: Vec<(&Edge, String)> = node
            .edges()
            .iter()
            .filter(|e| e.is_resolved())
            .filter_map(|e| self.edge_match(e, action).map(|why| (e, why)))
            .collect();
        if let Some((edge, why)) = matched.choose(rng) {
            return Ok(StepOutcome::Moved { node: edge.target, note: why.clone() });
        }

        let waits: Vec<&Edge> = node
            .edges()
            .iter()
            .filter(|e| e.is_resolved() && e.action == Action::Wait)
            .collect();
        if let Some(edge) = waits.choose(rng) {
            return Ok(StepOutcome::Moved {
                node: edge.target,
                note: format!("no edge matched {}, followed wait", action.action_type()),
            });
        }

        Ok(StepOutcome::Stayed {
            node: state.current_node,
            reason: format!(
                "no recorded {} edge out of node {} matches {:?}",
                action.action_type(),
                state.current_node,
                action
            ),
        })
    }

    fn open<R: Rng>(&self, state: &TaskState, app: &str, rng: &mut R) -> Result<StepOutcome, NavigationError> {
        let name = self.config.app_aliases.get(app).map(String::as_str).unwrap_or(app);
        let entry = state
            .app_entry_index
            .get(name)
            .and_then(|ids| ids.choose(rng))
            .copied()
            .ok_or_else(|| NavigationError::UnknownApp(name.to_string()))?;
        Ok(StepOutcome::Moved { node: entry, note: format!("opened {} at {}", name, entry) })
    }

    fn app_at(&self, x: i64, y: i64) -> Option<&str> {
        self.config
            .app_zones
            .iter()
            .find(|(_, zone)| zone.contains(x, y))
            .map(|(app, _)| app.as_str())
    }

    fn edge_match(&self, edge: &Edge, proposed: &Action) -> Option<String> {
        match (proposed, &edge.action) {
            (Action::Click { x, y }, Action::Click { x: ex, y: ey })
            | (Action::LongPress { x, y }, Action::LongPress { x: ex, y: ey }) => {
                if let Some(bbox) = edge.bbox.filter(|b| b.contains(*x, *y)) {
                    return Some(format!("({x},{y}) inside recorded box {:?}", <[i64; 4]>::from(bbox)));
                }
                let dist = (*x as f64 - *ex as f64).hypot(*y as f64 - *ey as f64);
                let limit = self.config.screen_width * self.config.click_radius_ratio;
                (dist < limit).then(|| format!("({x},{y}) is {dist:.1}px from ({ex},{ey}), limit {limit:.1}"))
            }
            (Action::Type { text }, Action::Type { text: recorded }) => {
                text_matches(recorded, text).then(|| format!("typed text matches {recorded:?}"))
            }
            (Action::SystemButton { button }, Action::SystemButton { button: recorded }) => button
                .eq_ignore_ascii_case(recorded)
                .then(|| format!("system button {recorded}")),
            (p, e) if p.action_type() == "swipe" && e.action_type() == "swipe" => {
                match (p.direction(), e.direction()) {
                    (Some(a), Some(b)) if a == b => Some(format!("swipe {}", a.as_str())),
                    _ => None,
                }
            }
            (p, e) => (p.action_type() == e.action_type()).then(|| format!("action type {}", e.action_type())),
        }
    }
}

fn app_entries(graph: &Graph) -> BTreeMap<String, Vec<NodeId>> {
    let mut entries: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
    let home = graph.home_id();
    let Some(home_node) = graph.node(home) else {
        return entries;
    };
    for edge in home_node.edges() {
        if !edge.is_resolved() || edge.target == home {
            continue;
        }
        let app = match &edge.action {
            Action::SystemButton { .. } => continue,
            Action::Open { app } => app.clone(),
            _ => match graph.node(edge.target) {
                Some(n) => n.app().to_string(),
                None => continue,
            },
        };
        let ids = entries.entry(app).or_default();
        if !ids.contains(&edge.target) {
            ids.push(edge.target);
        }
    }
    entries
}

fn is_finished(status: &str) -> bool {
    FINISHED_STATUSES.iter().any(|s| status.trim().eq_ignore_ascii_case(s))
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if TEXT_SEPARATORS.contains(&c) { ',' } else { c })
        .collect()
}

pub fn text_matches(recorded: &str, proposed: &str) -> bool {
    let r = normalize_text(recorded);
    let p = normalize_text(proposed);
    let covers = |fragments: &str, other: &str| {
        fragments
            .split(',')
            .filter(|f| !f.is_empty())
            .all(|f| other.contains(f))
    };
    if covers(&r, &p) || covers(&p, &r) {
        return true;
    }
    let rl = recorded.to_lowercase();
    let pl = proposed.to_lowercase();
    rl.contains(&pl) || pl.contains(&rl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Direction;
    use crate::graph::GraphConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::{json, Value};

    fn edge(source: i64, target: i64, action: Action) -> Value {
        let rec = action.to_record();
        json!({
            "source": source,
            "target": target,
            "action_type": rec.action_type,
            "action_parameter": rec.action_parameter,
        })
    }

    fn node(id: i64, app: &str, mut edges: Vec<Value>) -> Value {
        if id != 0 {
            edges.push(edge(id, 0, Action::home()));
        }
        json!({
            "node_id": id,
            "app": app,
            "screenlists": [{"path": format!("n{id}.png"), "description": format!("node {id}")}],
            "edges": edges,
            "next_ids": [],
        })
    }

    // 0 home -> 1 map (opened as 高德地图); 2 is a dead end without a wait edge.
    fn sample_graph() -> Graph {
        let doc = json!({
            "metadata": {"app": "高德地图", "next_id": 6, "num_nodes": 6, "created_at": ""},
            "nodes": {
                "0": node(0, "launcher", vec![
                    edge(0, 1, Action::Open { app: "高德地图".into() }),
                    edge(0, 0, Action::home()),
                ]),
                "1": node(1, "高德地图", vec![
                    edge(1, 2, Action::Click { x: 520, y: 510 }),
                    edge(1, 3, Action::Wait),
                    edge(1, 4, Action::Type { text: "Coffee, Shop".into() }),
                    edge(1, 5, Action::SwipeXY { touch: [540, 1800], lift: [540, 600] }),
                    edge(1, 0, Action::back()),
                ]),
                "2": node(2, "高德地图", vec![edge(2, 1, Action::back())]),
                "3": node(3, "高德地图", vec![edge(3, 1, Action::back())]),
                "4": node(4, "高德地图", vec![edge(4, 1, Action::back())]),
                "5": node(5, "高德地图", vec![edge(5, 1, Action::back())]),
            }
        });
        load_doc(doc)
    }

    fn load_doc(doc: Value) -> Graph {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, doc.to_string()).unwrap();
        Graph::load(&path, GraphConfig::default()).unwrap()
    }

    fn boxed(mut edge: Value, bbox: [i64; 4]) -> Value {
        edge["bbox"] = json!(bbox);
        edge
    }

    // 1 has a boxed click, a long press and the same click recorded twice
    // with different outcomes (4 and 5). No wait edge.
    fn touch_graph() -> Graph {
        let doc = json!({
            "metadata": {"app": "高德地图", "next_id": 6, "num_nodes": 6, "created_at": ""},
            "nodes": {
                "0": node(0, "launcher", vec![edge(0, 1, Action::Open { app: "高德地图".into() })]),
                "1": node(1, "高德地图", vec![
                    boxed(edge(1, 2, Action::Click { x: 100, y: 100 }), [0, 0, 1000, 1000]),
                    edge(1, 3, Action::LongPress { x: 300, y: 1500 }),
                    edge(1, 4, Action::Click { x: 600, y: 1800 }),
                    edge(1, 5, Action::Click { x: 600, y: 1800 }),
                ]),
                "2": node(2, "高德地图", vec![]),
                "3": node(3, "高德地图", vec![]),
                "4": node(4, "高德地图", vec![]),
                "5": node(5, "高德地图", vec![]),
            }
        });
        load_doc(doc)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn moved_to(outcome: Result<StepOutcome, NavigationError>) -> NodeId {
        match outcome {
            Ok(StepOutcome::Moved { node, .. }) => node,
            other => panic!("expected a move, got {other:?}"),
        }
    }

    fn at_map<'g>(m: &ReplayMatcher<'g>, rng: &mut StdRng) -> TaskState {
        let mut task = m.start_task("find coffee");
        let n = moved_to(m.step(&mut task, &Action::Open { app: "高德".into() }, rng));
        assert_eq!(n, NodeId(1));
        task
    }

    #[test]
    fn back_from_fresh_task_fails_and_stays_home() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut task = m.start_task("anything");
        let err = m.step(&mut task, &Action::back(), &mut rng()).unwrap_err();
        assert_eq!(err, NavigationError::CannotGoBack);
        assert_eq!(err.to_string(), "cannot go back");
        assert_eq!(task.current_node(), NodeId(0));
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(
            m.step(&mut task, &Action::Wait, &mut rng()),
            Err(NavigationError::Inactive)
        );
    }

    #[test]
    fn nearby_click_matches_recorded_point() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let n = moved_to(m.step(&mut task, &Action::Click { x: 500, y: 500 }, &mut r));
        assert_eq!(n, NodeId(2));
        assert_eq!(task.history(), &[NodeId(0), NodeId(1), NodeId(2)]);
    }

    #[test]
    fn distant_click_falls_back_to_wait_edge() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let n = moved_to(m.step(&mut task, &Action::Click { x: 800, y: 500 }, &mut r));
        assert_eq!(n, NodeId(3));
    }

    #[test]
    fn unmatched_action_without_wait_edge_stays() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        moved_to(m.step(&mut task, &Action::Click { x: 520, y: 510 }, &mut r));
        let out = m.step(&mut task, &Action::Click { x: 10, y: 10 }, &mut r).unwrap();
        assert!(matches!(out, StepOutcome::Stayed { node: NodeId(2), .. }));
        assert_eq!(task.status(), TaskStatus::Active);
        assert_eq!(task.history().last(), Some(&NodeId(2)));
    }

    #[test]
    fn back_walks_the_history_stack() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        moved_to(m.step(&mut task, &Action::Click { x: 530, y: 520 }, &mut r));
        assert_eq!(moved_to(m.step(&mut task, &Action::back(), &mut r)), NodeId(1));
        assert_eq!(moved_to(m.step(&mut task, &Action::back(), &mut r)), NodeId(0));
        assert_eq!(m.step(&mut task, &Action::back(), &mut r), Err(NavigationError::CannotGoBack));
    }

    #[test]
    fn home_button_always_returns_home() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        assert_eq!(moved_to(m.step(&mut task, &Action::home(), &mut r)), NodeId(0));
    }

    #[test]
    fn clicking_an_icon_on_home_opens_the_app() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = m.start_task("maps");
        assert_eq!(moved_to(m.step(&mut task, &Action::Click { x: 400, y: 1100 }, &mut r)), NodeId(1));
    }

    #[test]
    fn opening_an_unknown_app_ends_the_task() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut task = m.start_task("chat");
        let err = m.step(&mut task, &Action::Open { app: "微信".into() }, &mut rng()).unwrap_err();
        assert_eq!(err, NavigationError::UnknownApp("微信".into()));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn paraphrased_text_still_matches() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Type { text: "coffee shop nearby".into() }, &mut r);
        assert_eq!(moved_to(out), NodeId(4));
    }

    #[test]
    fn swipes_compare_by_direction() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Swipe { direction: Direction::Up }, &mut r);
        assert_eq!(moved_to(out), NodeId(5));
    }

    #[test]
    fn completion_keeps_node_and_carries_answer() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Answer { text: "42 min".into() }, &mut r).unwrap();
        assert_eq!(out, StepOutcome::Completed { answer: Some("42 min".into()) });
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.current_node(), NodeId(1));
        assert_eq!(task.answer(), Some("42 min"));
    }

    #[test]
    fn off_screen_click_is_a_mismatch_not_a_crash() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let huge = Action::from_raw(&json!({"action_type": "click", "x": 4_000_000_000i64, "y": 0}));
        assert_eq!(moved_to(m.step(&mut task, &huge, &mut r)), NodeId(3));

        let mut task = at_map(&m, &mut r);
        let far = Action::Click { x: i64::MAX, y: i64::MIN };
        assert_eq!(moved_to(m.step(&mut task, &far, &mut r)), NodeId(3));
        assert_eq!(task.status(), TaskStatus::Active);
    }

    #[test]
    fn click_inside_recorded_box_matches_far_from_point() {
        let g = touch_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        assert_eq!(moved_to(m.step(&mut task, &Action::Click { x: 900, y: 900 }, &mut r)), NodeId(2));
    }

    #[test]
    fn long_press_uses_the_same_radius() {
        let g = touch_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let press = Action::LongPress { x: 350, y: 1520 };
        assert_eq!(moved_to(m.step(&mut task, &press, &mut r)), NodeId(3));

        // a plain click at the same spot is a different action
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Click { x: 350, y: 1520 }, &mut r).unwrap();
        assert!(matches!(out, StepOutcome::Stayed { node: NodeId(1), .. }));
    }

    #[test]
    fn equally_good_edges_are_all_reachable() {
        let g = touch_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut reached = std::collections::BTreeSet::new();
        for seed in 0..32 {
            let mut r = StdRng::seed_from_u64(seed);
            let mut task = at_map(&m, &mut r);
            reached.insert(moved_to(m.step(&mut task, &Action::Click { x: 610, y: 1790 }, &mut r)));
        }
        assert_eq!(reached.into_iter().collect::<Vec<_>>(), vec![NodeId(4), NodeId(5)]);
    }

    #[test]
    fn finishing_status_completes_the_task() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Status { status: "complete".into() }, &mut r).unwrap();
        assert_eq!(out, StepOutcome::Completed { answer: Some("complete".into()) });
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.current_node(), NodeId(1));
    }

    #[test]
    fn infeasible_status_does_not_complete() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        let out = m.step(&mut task, &Action::Status { status: "infeasible".into() }, &mut r);
        // no status edge out of 1, so the wait edge is taken
        assert_eq!(moved_to(out), NodeId(3));
        assert_eq!(task.status(), TaskStatus::Active);
    }

    #[test]
    fn entries_come_from_home_edges() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        assert_eq!(m.entries().get("高德地图"), Some(&vec![NodeId(1)]));
        assert_eq!(m.entries().len(), 1);
    }

    #[test]
    fn text_matching_rules() {
        assert!(text_matches("北京，天气", "北京 今天 天气"));
        assert!(text_matches("pizza", "Pizza Hut"));
        assert!(!text_matches("pizza", "sushi"));
        assert!(text_matches("A/B", "a b"));
    }

    #[test]
    fn saved_trajectory_lists_every_step() {
        let g = sample_graph();
        let m = ReplayMatcher::new(&g, ReplayConfig::default());
        let mut r = rng();
        let mut task = at_map(&m, &mut r);
        m.step(&mut task, &Action::Complete, &mut r).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = task.save_trajectory(dir.path()).unwrap();
        assert!(path.ends_with("find coffee/trajectory.json"));
        let v: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["step_count"], json!(3));
        assert_eq!(v["status"], json!("completed"));
        assert_eq!(v["trajectory"][1]["action"]["action_type"], json!("open"));
    }
}
