use std::hash::{Hash, Hasher};
use std::ops::Deref;

use url::Url;

/// A wrapper around `Url` which represents the canonical form of a source
/// repository URL.
///
/// A canonical URL is only intended for internal comparison and cache keying.
/// It papers over mistakes such as depending on `github.com/foo/bar` vs.
/// `github.com/foo/bar.git`. All fetching still happens with the original URL.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct RepositoryUrl(Url);

impl RepositoryUrl {
    pub fn new(url: &Url) -> Self {
        let mut url = url.clone();

        // Strip a trailing slash.
        if url.path().ends_with('/') {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty();
            }
        }

        // GitHub treats URLs case-insensitively, but they hash differently,
        // and we're gonna be hashing them.
        if url.host_str() == Some("github.com") {
            let path = url.path().to_lowercase();
            url.set_path(&path);
        }

        // Repos can generally be accessed with or without the `.git` suffix.
        let needs_chopping = std::path::Path::new(url.path())
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("git"));
        if needs_chopping {
            let last = url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(ToOwned::to_owned));
            if let Some(last) = last {
                let chopped = last[..last.len() - 4].to_owned();
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.pop().push(&chopped);
                }
            }
        }

        // Drop any fragments and query parameters.
        url.set_fragment(None);
        url.set_query(None);

        Self(url)
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(&Url::parse(url)?))
    }

    /// The last path segment of the canonical URL, used as a human-readable
    /// directory name for the repository's cache.
    pub fn slug(&self) -> String {
        self.0
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(ToOwned::to_owned))
            .filter(|segment| !segment.is_empty())
            .unwrap_or_else(|| crate::hash_digest(&self.0.as_str()))
    }
}

impl Hash for RepositoryUrl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // `as_str` gives the serialisation of a url (which has a spec) and so
        // insulates against possible changes in how the URL crate does hashing.
        self.0.as_str().hash(state);
    }
}

impl Deref for RepositoryUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RepositoryUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_url() -> Result<(), url::ParseError> {
        // Two URLs should be considered equal regardless of the `.git` suffix.
        assert_eq!(
            RepositoryUrl::parse("https://github.com/comfyanonymous/ComfyUI.git")?,
            RepositoryUrl::parse("https://github.com/comfyanonymous/ComfyUI")?,
        );

        // Two URLs should _not_ be considered equal if they point to different
        // repositories.
        assert_ne!(
            RepositoryUrl::parse("https://github.com/comfyanonymous/ComfyUI.git")?,
            RepositoryUrl::parse("https://github.com/ltdrdata/ComfyUI-Manager.git")?,
        );

        Ok(())
    }

    #[test]
    fn slug() -> Result<(), url::ParseError> {
        assert_eq!(
            RepositoryUrl::parse("https://github.com/comfyanonymous/ComfyUI.git")?.slug(),
            "comfyui"
        );
        assert_eq!(
            RepositoryUrl::parse("https://example.com/nodes/VideoHelperSuite")?.slug(),
            "VideoHelperSuite"
        );
        Ok(())
    }
}
