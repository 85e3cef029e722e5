//! JSON audit artifacts: `<dir>/<timestamp>_<kind>.json`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StepError;

/// Writes one JSON document per artifact kind and run.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the `kind` artifact for a run stamped `at`.
    pub fn path_for(&self, kind: &str, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", at.format("%Y%m%dT%H%M%S%.3fZ"), kind))
    }

    pub async fn write<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        at: DateTime<Utc>,
        value: &T,
    ) -> Result<PathBuf, StepError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(kind, at);
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_path_layout() {
        let writer = ArtifactWriter::new("/tmp/artifacts");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            writer.path_for("consensus_signals", at),
            PathBuf::from("/tmp/artifacts/20240301T123005.000Z_consensus_signals.json")
        );
    }

    #[tokio::test]
    async fn test_write_creates_dir() {
        let dir = std::env::temp_dir().join(format!("artifacts-{}", uuid::Uuid::new_v4()));
        let writer = ArtifactWriter::new(&dir);
        let path = writer.write("raw_signals", Utc::now(), &vec![1, 2, 3]).await.unwrap();

        let body: Vec<u32> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body, vec![1, 2, 3]);
        std::fs::remove_dir_all(dir).ok();
    }
}
