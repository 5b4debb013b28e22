use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The readiness-marker file inside an engine home.
pub const MARKER_FILE: &str = ".prepared.json";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinnedRepo {
    pub repo: String,
    pub commit: String,
}

/// Records the signature of a completed realization.
///
/// Written as the final step of preparing an engine home; its presence and a
/// matching signature are the sole gate for the skip-preparation fast path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedMarker {
    pub version_id: String,
    pub comfy: PinnedRepo,
    /// Sorted by (repo, commit) so the comparison is order-insensitive.
    pub custom_nodes: Vec<PinnedRepo>,
}

impl PreparedMarker {
    /// Load the marker from an engine home. Unreadable or unparsable markers
    /// are treated as absent, forcing a full re-prepare.
    pub fn load(engine_home: &Path) -> Option<Self> {
        let path = engine_home.join(MARKER_FILE);
        let text = fs_err::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(marker) => Some(marker),
            Err(err) => {
                debug!("ignoring unreadable marker at {}: {err}", path.display());
                None
            }
        }
    }

    /// Write the marker, committing the realization.
    pub fn persist(&self, engine_home: &Path) -> std::io::Result<()> {
        let mut text =
            serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        text.push('\n');
        fs_err::write(engine_home.join(MARKER_FILE), text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker() -> PreparedMarker {
        PreparedMarker {
            version_id: "wan22".to_string(),
            comfy: PinnedRepo {
                repo: "https://github.com/comfyanonymous/ComfyUI".to_string(),
                commit: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            },
            custom_nodes: Vec::new(),
        }
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let marker = marker();
        marker.persist(dir.path()).unwrap();
        assert_eq!(PreparedMarker::load(dir.path()), Some(marker));
    }

    #[test]
    fn corrupt_marker_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join(MARKER_FILE), "{not json").unwrap();
        assert_eq!(PreparedMarker::load(dir.path()), None);
    }

    #[test]
    fn missing_marker_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PreparedMarker::load(dir.path()), None);
    }
}
