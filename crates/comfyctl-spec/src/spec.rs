use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use comfyctl_fetch::{Checksum, ModelSource};

use crate::error::SpecError;

/// The schema generation this implementation understands.
pub const SCHEMA_VERSION: u32 = 2;

/// A user-authored version spec, schema v2.
///
/// Parsing is strict where the schema demands it (unknown option keys are an
/// error, booleans may arrive as strings) but otherwise total: a successfully
/// loaded `VersionSpec` needs no further field-existence checks downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSpec {
    pub schema_version: u32,
    pub version_id: String,
    pub comfy: EngineSpec,
    #[serde(default)]
    pub custom_nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub options: SpecOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub repo: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecOptions {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub offline: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub skip_models: bool,
}

impl VersionSpec {
    /// Read and validate a spec file.
    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let text = fs_err::read_to_string(path).map_err(|err| SpecError::Read {
            path: path.to_path_buf(),
            err: err.into(),
        })?;
        let spec: Self = serde_json::from_str(&text).map_err(|err| SpecError::Parse {
            path: path.to_path_buf(),
            err,
        })?;
        spec.validate(path)?;
        Ok(spec)
    }

    /// Validate invariants that the serde shape cannot express.
    ///
    /// Idempotent and total: validating an already-validated spec (or its
    /// re-serialization) always succeeds with the same result.
    pub fn validate(&self, path: &Path) -> Result<(), SpecError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SpecError::field(
                path,
                "schema_version",
                format!("expected {SCHEMA_VERSION}, got {}", self.schema_version),
            ));
        }
        if self.version_id.trim().is_empty() {
            return Err(SpecError::field(path, "version_id", "must be non-empty"));
        }
        if self.comfy.repo.trim().is_empty() {
            return Err(SpecError::field(path, "comfy.repo", "must be non-empty"));
        }
        non_empty_opt(path, "comfy.ref", self.comfy.reference.as_deref())?;
        non_empty_opt(path, "comfy.commit", self.comfy.commit.as_deref())?;

        for (index, node) in self.custom_nodes.iter().enumerate() {
            let at = |field: &str| format!("custom_nodes[{index}].{field}");
            if node.repo.trim().is_empty() {
                return Err(SpecError::field(path, at("repo"), "must be non-empty"));
            }
            non_empty_opt(path, at("name"), node.name.as_deref())?;
            non_empty_opt(path, at("ref"), node.reference.as_deref())?;
            non_empty_opt(path, at("commit"), node.commit.as_deref())?;
        }

        for (index, model) in self.models.iter().enumerate() {
            let at = |field: &str| format!("models[{index}].{field}");
            ModelSource::parse(&model.source)
                .map_err(|err| SpecError::field(path, at("source"), err.to_string()))?;
            if let Some(checksum) = &model.checksum {
                Checksum::from_str(checksum)
                    .map_err(|err| SpecError::field(path, at("checksum"), err.to_string()))?;
            }
            non_empty_opt(path, at("name"), model.name.as_deref())?;
            non_empty_opt(path, at("target_subdir"), model.target_subdir.as_deref())?;
            non_empty_opt(path, at("target_path"), model.target_path.as_deref())?;
        }

        Ok(())
    }
}

fn non_empty_opt(
    path: &Path,
    field: impl Into<String>,
    value: Option<&str>,
) -> Result<(), SpecError> {
    match value {
        Some(value) if value.trim().is_empty() => {
            Err(SpecError::field(path, field, "must be non-empty when present"))
        }
        _ => Ok(()),
    }
}

/// Accept JSON booleans plus the string spellings `"true"`, `"false"`, `"1"`,
/// and `"0"`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct LenientBool;

    impl de::Visitor<'_> for LenientBool {
        type Value = bool;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a boolean or \"true\"/\"false\"/\"1\"/\"0\"")
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<bool, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<bool, E> {
            match value {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(E::invalid_value(de::Unexpected::Str(value), &self)),
            }
        }
    }

    deserializer.deserialize_any(LenientBool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn write_spec(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("spec.json");
        fs_err::write(&path, body).unwrap();
        path
    }

    const MINIMAL: &str = indoc! {r#"
        {
          "schema_version": 2,
          "version_id": "wan22",
          "comfy": {"repo": "https://github.com/comfyanonymous/ComfyUI"}
        }
    "#};

    #[test]
    fn loads_minimal_spec() {
        let dir = tempfile::tempdir().unwrap();
        let spec = VersionSpec::load(&write_spec(dir.path(), MINIMAL)).unwrap();
        assert_eq!(spec.version_id, "wan22");
        assert!(spec.custom_nodes.is_empty());
        assert!(!spec.options.offline);
    }

    #[test]
    fn validate_is_idempotent_through_serialization() {
        let dir = tempfile::tempdir().unwrap();
        let spec = VersionSpec::load(&write_spec(dir.path(), MINIMAL)).unwrap();
        let reserialized = serde_json::to_string(&spec).unwrap();
        let reloaded: VersionSpec = serde_json::from_str(&reserialized).unwrap();
        reloaded.validate(Path::new("spec.json")).unwrap();
        assert_eq!(spec, reloaded);
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            r#"{"schema_version": 1, "version_id": "x", "comfy": {"repo": "r"}}"#,
        );
        let err = VersionSpec::load(&path).unwrap_err();
        assert!(matches!(err, SpecError::Field { field, .. } if field == "schema_version"));
    }

    #[test]
    fn rejects_unknown_option_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            indoc! {r#"
                {
                  "schema_version": 2,
                  "version_id": "x",
                  "comfy": {"repo": "https://example.com/r.git"},
                  "options": {"offline": true, "turbo": true}
                }
            "#},
        );
        assert!(matches!(VersionSpec::load(&path), Err(SpecError::Parse { .. })));
    }

    #[test]
    fn coerces_string_booleans() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            indoc! {r#"
                {
                  "schema_version": 2,
                  "version_id": "x",
                  "comfy": {"repo": "https://example.com/r.git"},
                  "options": {"offline": "1", "skip_models": "false"}
                }
            "#},
        );
        let spec = VersionSpec::load(&path).unwrap();
        assert!(spec.options.offline);
        assert!(!spec.options.skip_models);
    }

    #[test]
    fn rejects_non_boolean_option() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            indoc! {r#"
                {
                  "schema_version": 2,
                  "version_id": "x",
                  "comfy": {"repo": "https://example.com/r.git"},
                  "options": {"offline": 5}
                }
            "#},
        );
        assert!(matches!(VersionSpec::load(&path), Err(SpecError::Parse { .. })));
    }

    #[test]
    fn rejects_blank_ref() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            indoc! {r#"
                {
                  "schema_version": 2,
                  "version_id": "x",
                  "comfy": {"repo": "https://example.com/r.git", "ref": "  "}
                }
            "#},
        );
        let err = VersionSpec::load(&path).unwrap_err();
        assert!(matches!(err, SpecError::Field { field, .. } if field == "comfy.ref"));
    }

    #[test]
    fn rejects_bad_model_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spec(
            dir.path(),
            indoc! {r#"
                {
                  "schema_version": 2,
                  "version_id": "x",
                  "comfy": {"repo": "https://example.com/r.git"},
                  "models": [{"source": "https://example.com/m.bin", "checksum": "crc32:1234"}]
                }
            "#},
        );
        let err = VersionSpec::load(&path).unwrap_err();
        assert!(matches!(err, SpecError::Field { field, .. } if field == "models[0].checksum"));
    }
}
