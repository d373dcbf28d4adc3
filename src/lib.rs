pub mod action;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod node;
pub mod oracle;
pub mod replay;
pub mod screenshot;

pub use action::{Action, ActionRecord, BBox, Direction};
pub use error::{GraphError, NavigationError, OracleError};
pub use graph::{Cursor, Graph, GraphConfig, GraphStats, TrajectoryStep};
pub use ingest::{build_from_dir, IngestReport, Trajectory};
pub use node::{Edge, NodeId, ScreenNode};
pub use oracle::{Description, DescriptionOracle, Oracles, VisualJudge, VlmClient, VlmConfig};
pub use replay::{ReplayConfig, ReplayMatcher, StepOutcome, TaskState, TaskStatus};
pub use screenshot::Screenshot;
