use std::path::{Path, PathBuf};

use tokio::fs as async_fs;

use crate::error::{GraphError, OracleError};
use crate::oracle::Oracles;

#[derive(Debug, Clone)]
pub struct Screenshot {
    path: PathBuf,
    description: String,
    embedding: Vec<f32>,
}

// The embedding is derived from the description, so it takes no part in
// equality (persisted graphs do not carry it).
impl PartialEq for Screenshot {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.description == other.description
    }
}

impl Screenshot {
    pub async fn create(path: impl Into<PathBuf>, app: &str, oracles: &Oracles) -> Result<Self, OracleError> {
        let path = path.into();
        let desc = oracles.describe(&path, app).await?;
        Ok(Self { path, description: desc.text, embedding: desc.embedding })
    }

    pub fn from_parts(path: impl Into<PathBuf>, description: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self { path: path.into(), description: description.into(), embedding }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub(crate) fn set_embedding(&mut self, embedding: Vec<f32>) {
        self.embedding = embedding;
    }

    pub fn text_similarity(&self, other: &Screenshot) -> f32 {
        cosine(&self.embedding, &other.embedding)
    }

    // <parent-dir>_<file-name>, so frames from different trajectories never collide.
    pub async fn store_into(&self, dir: &Path) -> Result<PathBuf, GraphError> {
        async_fs::create_dir_all(dir)
            .await
            .map_err(|e| GraphError::io(dir, e))?;
        let file = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "screenshot.png".to_string());
        let name = match self.path.parent().and_then(|p| p.file_name()) {
            Some(parent) => format!("{}_{}", parent.to_string_lossy(), file),
            None => file,
        };
        let dest = dir.join(name);
        async_fs::copy(&self.path, &dest)
            .await
            .map_err(|e| GraphError::io(&self.path, e))?;
        Ok(dest)
    }
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert!((cosine(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 3.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn equality_ignores_embedding() {
        let a = Screenshot::from_parts("t1/observation_0.png", "home", vec![1.0]);
        let b = Screenshot::from_parts("t1/observation_0.png", "home", vec![]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn stored_copy_is_prefixed_with_trajectory_dir() {
        let src = tempfile::tempdir().unwrap();
        let traj = src.path().join("task42");
        std::fs::create_dir_all(&traj).unwrap();
        let img = traj.join("observation_3.png");
        std::fs::write(&img, b"png").unwrap();

        let out = tempfile::tempdir().unwrap();
        let shot = Screenshot::from_parts(&img, "search page", vec![]);
        let dest = shot.store_into(&out.path().join("node7")).await.unwrap();

        assert_eq!(dest.file_name().unwrap(), "task42_observation_3.png");
        assert_eq!(std::fs::read(dest).unwrap(), b"png");
    }
}
