use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use comfyctl_cache::{Cache, CacheBucket};

use crate::error::SpecError;
use crate::marker::{PinnedRepo, PreparedMarker};

/// The deterministic, fully-pinned counterpart of a version spec.
///
/// Every mutable reference is resolved to an immutable identifier, every model
/// carries an explicit target path, and both options are always present.
/// Serialization is canonical: sorted keys, two-space indent, trailing
/// newline, so writing and re-reading a lock is byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLock {
    pub schema_version: u32,
    pub version_id: String,
    pub comfy: ResolvedEngine,
    pub custom_nodes: Vec<ResolvedNode>,
    pub models: Vec<ResolvedModel>,
    pub env: BTreeMap<String, String>,
    pub options: ResolvedOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEngine {
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Empty only when resolution ran offline against an unpinned spec.
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedNode {
    pub name: String,
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub source: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subdir: Option<String>,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    pub offline: bool,
    pub skip_models: bool,
}

impl ResolvedLock {
    /// The canonical on-disk location: `<cache_root>/resolved/<id>.lock.json`.
    pub fn path_for(cache: &Cache, version_id: &str) -> PathBuf {
        cache
            .bucket(CacheBucket::Resolved)
            .join(format!("{version_id}.lock.json"))
    }

    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let text = fs_err::read_to_string(path).map_err(|err| SpecError::Read {
            path: path.to_path_buf(),
            err,
        })?;
        serde_json::from_str(&text).map_err(|err| SpecError::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    /// The canonical serialization: sorted keys, indent 2, trailing newline.
    pub fn to_canonical_json(&self) -> String {
        // `serde_json::Value` maps are BTree-backed, so going through a value
        // sorts every object's keys.
        let value = serde_json::to_value(self).expect("lock serialization is infallible");
        let mut text = serde_json::to_string_pretty(&value)
            .expect("lock serialization is infallible");
        text.push('\n');
        text
    }

    /// Atomically (re)write the lock document under the cache root.
    pub fn persist(&self, cache: &Cache) -> Result<PathBuf, std::io::Error> {
        let path = Self::path_for(cache, &self.version_id);
        let dir = path.parent().expect("lock path has a parent");
        fs_err::create_dir_all(dir)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".lock-")
            .tempfile_in(dir)?;
        temp.write_all(self.to_canonical_json().as_bytes())?;
        temp.persist(&path).map_err(|err| err.error)?;
        Ok(path)
    }

    /// The signature recorded by the readiness marker.
    pub fn signature(&self) -> PreparedMarker {
        let mut custom_nodes: Vec<PinnedRepo> = self
            .custom_nodes
            .iter()
            .map(|node| PinnedRepo {
                repo: node.repo.clone(),
                commit: node.commit.clone(),
            })
            .collect();
        custom_nodes.sort();
        PreparedMarker {
            version_id: self.version_id.clone(),
            comfy: PinnedRepo {
                repo: self.comfy.repo.clone(),
                commit: self.comfy.commit.clone(),
            },
            custom_nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::SCHEMA_VERSION;

    fn sample() -> ResolvedLock {
        ResolvedLock {
            schema_version: SCHEMA_VERSION,
            version_id: "wan22".to_string(),
            comfy: ResolvedEngine {
                repo: "https://github.com/comfyanonymous/ComfyUI".to_string(),
                reference: Some("master".to_string()),
                commit: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            },
            custom_nodes: vec![ResolvedNode {
                name: "videohelpersuite".to_string(),
                repo: "https://github.com/Kosinkadink/ComfyUI-VideoHelperSuite".to_string(),
                reference: None,
                commit: "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            }],
            models: vec![ResolvedModel {
                source: "hf://org/repo/unet.safetensors".to_string(),
                name: "unet.safetensors".to_string(),
                target_subdir: Some("unet".to_string()),
                target_path: "unet/unet.safetensors".to_string(),
                checksum: None,
            }],
            env: BTreeMap::from([("PYTORCH_ENABLE_MPS_FALLBACK".to_string(), "1".to_string())]),
            options: ResolvedOptions {
                offline: false,
                skip_models: false,
            },
        }
    }

    #[test]
    fn canonical_json_is_sorted_and_newline_terminated() {
        let text = sample().to_canonical_json();
        assert!(text.ends_with('\n'));
        let comfy_at = text.find("\"comfy\"").unwrap();
        let version_at = text.find("\"version_id\"").unwrap();
        assert!(comfy_at < version_at, "keys must be sorted");
    }

    #[test]
    fn persist_then_load_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::from_path(dir.path()).unwrap();
        let lock = sample();

        let path = lock.persist(&cache).unwrap();
        let first = fs_err::read(&path).unwrap();

        let reloaded = ResolvedLock::load(&path).unwrap();
        assert_eq!(reloaded, lock);

        let path = reloaded.persist(&cache).unwrap();
        let second = fs_err::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn signature_sorts_custom_nodes() {
        let mut lock = sample();
        lock.custom_nodes.push(ResolvedNode {
            name: "a-node".to_string(),
            repo: "https://github.com/a/a".to_string(),
            reference: None,
            commit: "cccccccccccccccccccccccccccccccccccccccc".to_string(),
        });
        let signature = lock.signature();
        assert_eq!(signature.custom_nodes[0].repo, "https://github.com/a/a");
    }
}
