use crate::gap_list::GapSnapshot;
use anyhow::Context;
use std::path::PathBuf;
use tracing::debug;

/// Synchronous on-disk persistence for GapList snapshots.
///
/// Snapshots are written at defined checkpoints (periodically and on close) rather than on every
///  sequence update; a crash loses at most one checkpoint interval of gap state, which the
///  peer-reconciliation path recovers from.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> SnapshotStore {
        SnapshotStore { path: path.into() }
    }

    pub fn load(&self) -> anyhow::Result<Option<GapSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading gap snapshot from {:?}", self.path))?;
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("parsing gap snapshot from {:?}", self.path))?;
        Ok(Some(snapshot))
    }

    /// Write via a sidecar file and rename, so a crash mid-write never leaves a torn snapshot.
    pub fn save(&self, snapshot: &GapSnapshot) -> anyhow::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let raw = serde_json::to_vec(snapshot)?;
        std::fs::write(&tmp_path, raw)
            .with_context(|| format!("writing gap snapshot to {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("installing gap snapshot at {:?}", self.path))?;

        debug!("checkpointed gap snapshot for series {} to {:?}", snapshot.series, self.path);
        Ok(())
    }
}
