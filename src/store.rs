//! Filesystem artifact store
//!
//! Stages communicate only through named, typed artifacts inside one run
//! directory. The model archive is the `model/` subdirectory: everything S2
//! produces is co-located there so downstream stages and the inference
//! surface receive it atomically as one package.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::{RecoError, RecoResult};
use crate::models::{AssociationRule, BasketRow, ClusterAssignment, FeedbackRow, Recommendation};
use crate::serialization::{read_csv, read_feedback, write_csv};

/// Fixed artifact names within a run directory.
pub const MARKET_BASKET_FILE: &str = "market_basket.csv";
pub const MODEL_DIR: &str = "model";
pub const CLUSTERS_FILE: &str = "customer_clusters.csv";
pub const MODEL_REGISTRY_FILE: &str = "model_registry.json";
pub const ASSOCIATIONS_FILE: &str = "associations.csv";
pub const RECOMMENDATIONS_FILE: &str = "recommendations.csv";
pub const FINAL_RECOMMENDATIONS_FILE: &str = "final_recommendations.csv";
pub const FEEDBACK_SUMMARY_FILE: &str = "feedback_summary.json";
pub const FEEDBACK_FILE: &str = "feedback.csv";

/// A run directory holding every artifact the stages exchange.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a run directory.
    pub fn open(root: impl Into<PathBuf>) -> RecoResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            RecoError::io(format!("cannot create run directory {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The model archive directory, created on first use.
    pub fn model_dir(&self) -> RecoResult<PathBuf> {
        let dir = self.root.join(MODEL_DIR);
        fs::create_dir_all(&dir).map_err(|e| {
            RecoError::io(format!("cannot create model directory {}: {}", dir.display(), e))
        })?;
        Ok(dir)
    }

    pub fn path(&self, artifact: &str) -> PathBuf {
        self.root.join(artifact)
    }

    fn model_path(&self, artifact: &str) -> PathBuf {
        self.root.join(MODEL_DIR).join(artifact)
    }

    // ---- market basket ----

    pub fn write_basket(&self, rows: &[BasketRow]) -> RecoResult<()> {
        let path = self.path(MARKET_BASKET_FILE);
        write_csv(&path, rows)?;
        info!(rows = rows.len(), path = %path.display(), "wrote market basket");
        Ok(())
    }

    pub fn read_basket(&self) -> RecoResult<Vec<BasketRow>> {
        read_csv(&self.path(MARKET_BASKET_FILE))
    }

    // ---- cluster assignments (inside the model archive) ----

    pub fn write_assignments(&self, rows: &[ClusterAssignment]) -> RecoResult<()> {
        self.model_dir()?;
        let path = self.model_path(CLUSTERS_FILE);
        write_csv(&path, rows)?;
        info!(rows = rows.len(), path = %path.display(), "wrote cluster assignments");
        Ok(())
    }

    pub fn read_assignments(&self) -> RecoResult<Vec<ClusterAssignment>> {
        read_csv(&self.model_path(CLUSTERS_FILE))
    }

    // ---- association rules ----

    pub fn write_rules(&self, rows: &[AssociationRule]) -> RecoResult<()> {
        let path = self.path(ASSOCIATIONS_FILE);
        write_csv(&path, rows)?;
        info!(rows = rows.len(), path = %path.display(), "wrote association rules");
        Ok(())
    }

    pub fn read_rules(&self) -> RecoResult<Vec<AssociationRule>> {
        read_csv(&self.path(ASSOCIATIONS_FILE))
    }

    // ---- recommendations ----

    pub fn write_recommendations(&self, rows: &[Recommendation]) -> RecoResult<()> {
        let path = self.path(RECOMMENDATIONS_FILE);
        write_csv(&path, rows)?;
        info!(rows = rows.len(), path = %path.display(), "wrote ranked recommendations");
        Ok(())
    }

    pub fn read_recommendations(&self) -> RecoResult<Vec<Recommendation>> {
        read_csv(&self.path(RECOMMENDATIONS_FILE))
    }

    pub fn write_final_recommendations(&self, rows: &[Recommendation]) -> RecoResult<()> {
        let path = self.path(FINAL_RECOMMENDATIONS_FILE);
        write_csv(&path, rows)?;
        info!(rows = rows.len(), path = %path.display(), "wrote final recommendations");
        Ok(())
    }

    pub fn read_final_recommendations(&self) -> RecoResult<Vec<Recommendation>> {
        read_csv(&self.path(FINAL_RECOMMENDATIONS_FILE))
    }

    // ---- feedback ----

    /// Read prior-cycle feedback if the file exists. Absence is not an
    /// error: calibration passes recommendations through unchanged.
    pub fn read_feedback_optional(&self) -> RecoResult<Option<Vec<FeedbackRow>>> {
        let path = self.path(FEEDBACK_FILE);
        if !path.exists() {
            info!(path = %path.display(), "no feedback file — calibration will pass through");
            return Ok(None);
        }
        Ok(Some(read_feedback(&path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::ClusterAssignment;

    #[test]
    fn test_round_trip_assignments_in_model_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let rows = vec![
            ClusterAssignment::new("C1", "West_Plumbing", 0),
            ClusterAssignment::new("C2", "West_Plumbing", 1),
        ];
        store.write_assignments(&rows).unwrap();
        assert!(dir.path().join("model/customer_clusters.csv").exists());
        assert_eq!(store.read_assignments().unwrap(), rows);
    }

    #[test]
    fn test_missing_feedback_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.read_feedback_optional().unwrap().is_none());
    }
}
