use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::Url;

use crate::error::FetchError;

/// Matches Python's `urllib.parse.quote(..., safe="")`: everything but the
/// unreserved characters is escaped.
const STRICT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');
const STRICT_KEEP_SLASH: &AsciiSet = &STRICT.remove(b'/');

/// A model artifact source, parsed from the spec's `source` string.
///
/// Parsing is total: every later decision (auth headers, size preflight,
/// download strategy) dispatches on the variant instead of re-inspecting the
/// raw string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    raw: String,
    kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// `http://` or `https://`.
    Http(Url),
    /// `file://` or a bare filesystem path.
    Path(PathBuf),
    /// `gs://bucket/object`, fetched by shelling out to `gsutil`.
    Gs(String),
    /// `hf://<org>/<repo>[@rev]/<path>[?rev=<rev>]`.
    Hf(HfSource),
    /// `civitai://api/download/models/<id>` or `civitai://models/<id>`.
    Civitai(CivitaiSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfSource {
    pub repo_id: String,
    pub revision: String,
    pub path_in_repo: String,
}

impl HfSource {
    /// The `huggingface.co/<repo>/resolve/<rev>/<path>?download=true` URL.
    pub fn resolve_url(&self) -> String {
        let repo = self
            .repo_id
            .split('/')
            .map(|part| utf8_percent_encode(part, STRICT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        let path = utf8_percent_encode(self.path_in_repo.trim_start_matches('/'), STRICT_KEEP_SLASH);
        let rev = utf8_percent_encode(&self.revision, STRICT);
        format!("https://huggingface.co/{repo}/resolve/{rev}/{path}?download=true")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CivitaiSource {
    /// Path below the host, e.g. `api/download/models/12345`.
    pub path: String,
    pub query: Option<String>,
}

impl CivitaiSource {
    /// The `civitai.com` download URL.
    pub fn download_url(&self) -> Result<String, FetchError> {
        let base = if self.path.starts_with("api/download/models/") {
            format!("https://civitai.com/{}", self.path)
        } else if let Some(id) = self.path.strip_prefix("models/") {
            let id = id.split('/').next().unwrap_or_default();
            format!("https://civitai.com/api/download/models/{id}")
        } else {
            return Err(FetchError::InvalidSource {
                source_value: format!("civitai://{}", self.path),
                reason: "expected civitai://models/<id> or civitai://api/download/models/<id>"
                    .to_string(),
            });
        };
        Ok(match &self.query {
            Some(query) => format!("{base}?{query}"),
            None => base,
        })
    }

    /// The model-version id, used for the size-lookup API fallback.
    pub fn version_id(&self) -> Option<&str> {
        let tail = self
            .path
            .strip_prefix("api/download/models/")
            .or_else(|| self.path.strip_prefix("download/models/"))
            .or_else(|| self.path.strip_prefix("models/"))?;
        let id = tail.split(['/', '?']).next()?;
        (!id.is_empty()).then_some(id)
    }
}

impl ModelSource {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidSource {
                source_value: raw.to_string(),
                reason: "empty source".to_string(),
            });
        }

        let kind = match raw.split_once("://") {
            Some(("http" | "https", _)) => {
                let url = Url::parse(raw).map_err(|err| FetchError::InvalidSource {
                    source_value: raw.to_string(),
                    reason: err.to_string(),
                })?;
                SourceKind::Http(url)
            }
            Some(("file", _)) => {
                let url = Url::parse(raw).map_err(|err| FetchError::InvalidSource {
                    source_value: raw.to_string(),
                    reason: err.to_string(),
                })?;
                let path = url
                    .to_file_path()
                    .map_err(|()| FetchError::InvalidSource {
                        source_value: raw.to_string(),
                        reason: "not a local file path".to_string(),
                    })?;
                SourceKind::Path(path)
            }
            Some(("gs", _)) => SourceKind::Gs(raw.to_string()),
            Some(("hf" | "huggingface", rest)) => SourceKind::Hf(parse_hf(raw, rest)?),
            Some(("civitai", rest)) => SourceKind::Civitai(parse_civitai(raw, rest)?),
            Some((scheme, _)) => return Err(FetchError::UnsupportedScheme(scheme.to_string())),
            // A bare path.
            None => SourceKind::Path(PathBuf::from(raw)),
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The trailing file name of the source, if it has one.
    pub fn file_name(&self) -> Option<String> {
        let candidate = match &self.kind {
            SourceKind::Http(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(ToOwned::to_owned)),
            SourceKind::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            SourceKind::Gs(url) => url.rsplit('/').next().map(ToOwned::to_owned),
            SourceKind::Hf(hf) => hf
                .path_in_repo
                .rsplit('/')
                .next()
                .map(ToOwned::to_owned),
            // Civitai download URLs carry no usable file name.
            SourceKind::Civitai(_) => None,
        };
        candidate.filter(|name| !name.is_empty())
    }

    /// The file suffix (with leading dot) of the source, if any.
    pub fn suffix(&self) -> Option<String> {
        let name = self.file_name()?;
        let (_, extension) = name.rsplit_once('.')?;
        if extension.is_empty() || extension.contains('/') {
            return None;
        }
        Some(format!(".{extension}"))
    }
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_hf(raw: &str, rest: &str) -> Result<HfSource, FetchError> {
    let invalid = |reason: &str| FetchError::InvalidSource {
        source_value: raw.to_string(),
        reason: reason.to_string(),
    };

    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };
    let mut segments = rest.split('/').filter(|segment| !segment.is_empty());
    let org = segments
        .next()
        .ok_or_else(|| invalid("missing organization"))?;
    let repo_segment = segments.next().ok_or_else(|| invalid("missing repository"))?;
    let path_in_repo = segments.collect::<Vec<_>>().join("/");
    if path_in_repo.is_empty() {
        return Err(invalid("missing a file path inside the repository"));
    }

    let (repo_name, mut revision) = match repo_segment.split_once('@') {
        Some((name, revision)) => (name, Some(revision.to_string())),
        None => (repo_segment, None),
    };
    if revision.is_none() {
        revision = query.and_then(|query| {
            query.split('&').find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                matches!(key, "rev" | "revision").then(|| value.to_string())
            })
        });
    }

    Ok(HfSource {
        repo_id: format!("{org}/{repo_name}"),
        revision: revision.unwrap_or_else(|| "main".to_string()),
        path_in_repo,
    })
}

fn parse_civitai(raw: &str, rest: &str) -> Result<CivitaiSource, FetchError> {
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query.to_string())),
        None => (rest, None),
    };
    let path = rest
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if path.is_empty() {
        return Err(FetchError::InvalidSource {
            source_value: raw.to_string(),
            reason: "expected civitai://models/<id> or civitai://api/download/models/<id>"
                .to_string(),
        });
    }
    Ok(CivitaiSource { path, query })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http() {
        let source = ModelSource::parse("https://example.com/models/unet.safetensors").unwrap();
        assert!(matches!(source.kind(), SourceKind::Http(_)));
        assert_eq!(source.file_name().as_deref(), Some("unet.safetensors"));
        assert_eq!(source.suffix().as_deref(), Some(".safetensors"));
    }

    #[test]
    fn parses_bare_path() {
        let source = ModelSource::parse("/data/models/vae.pt").unwrap();
        assert!(matches!(source.kind(), SourceKind::Path(_)));
        assert_eq!(source.suffix().as_deref(), Some(".pt"));
    }

    #[test]
    fn parses_hf_with_at_revision() {
        let source = ModelSource::parse("hf://org/repo@v1.0/weights/model.safetensors").unwrap();
        let SourceKind::Hf(hf) = source.kind() else {
            panic!("expected hf source");
        };
        assert_eq!(hf.repo_id, "org/repo");
        assert_eq!(hf.revision, "v1.0");
        assert_eq!(hf.path_in_repo, "weights/model.safetensors");
        assert_eq!(
            hf.resolve_url(),
            "https://huggingface.co/org/repo/resolve/v1.0/weights/model.safetensors?download=true"
        );
    }

    #[test]
    fn parses_hf_with_query_revision() {
        let source = ModelSource::parse("hf://org/repo/model.bin?rev=refs/pr/1").unwrap();
        let SourceKind::Hf(hf) = source.kind() else {
            panic!("expected hf source");
        };
        assert_eq!(hf.revision, "refs/pr/1");
    }

    #[test]
    fn hf_defaults_to_main() {
        let source = ModelSource::parse("hf://org/repo/model.bin").unwrap();
        let SourceKind::Hf(hf) = source.kind() else {
            panic!("expected hf source");
        };
        assert_eq!(hf.revision, "main");
    }

    #[test]
    fn civitai_shorthand_translates() {
        let source = ModelSource::parse("civitai://models/12345").unwrap();
        let SourceKind::Civitai(civitai) = source.kind() else {
            panic!("expected civitai source");
        };
        assert_eq!(
            civitai.download_url().unwrap(),
            "https://civitai.com/api/download/models/12345"
        );
        assert_eq!(civitai.version_id(), Some("12345"));
    }

    #[test]
    fn civitai_api_path_passes_through() {
        let source =
            ModelSource::parse("civitai://api/download/models/67890?format=SafeTensor").unwrap();
        let SourceKind::Civitai(civitai) = source.kind() else {
            panic!("expected civitai source");
        };
        assert_eq!(
            civitai.download_url().unwrap(),
            "https://civitai.com/api/download/models/67890?format=SafeTensor"
        );
        assert_eq!(civitai.version_id(), Some("67890"));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            ModelSource::parse("ftp://example.com/model.bin"),
            Err(FetchError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }
}
