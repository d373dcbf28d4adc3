use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;

#[derive(Debug, Error, Clone)]
pub enum OracleError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot read image {path}: {reason}")]
    Image { path: PathBuf, reason: String },
    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graph integrity error: {0}")]
    Integrity(String),
}

impl GraphError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraphError::Io { path: path.into(), source }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("cannot go back")]
    CannotGoBack,
    #[error("unknown app: {0}")]
    UnknownApp(String),
    #[error("node {0} is not part of the graph")]
    MissingNode(NodeId),
    #[error("task is no longer active")]
    Inactive,
}
