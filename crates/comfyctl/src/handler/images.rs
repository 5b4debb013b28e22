use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

/// Per-file download deadline for request inputs.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// The request-scoped file-name prefix: the request id with dashes stripped,
/// capped at 16 characters, or a UTC timestamp when no id is available.
pub(crate) fn request_prefix(request_id: Option<&str>) -> String {
    match request_id {
        Some(request_id) if !request_id.trim().is_empty() => request_id
            .chars()
            .filter(|c| *c != '-')
            .take(16)
            .collect(),
        _ => jiff::Timestamp::now()
            .strftime("%Y%m%d%H%M%S")
            .to_string(),
    }
}

/// `<prefix>_<rand8>_<original>`; keeps the original name and extension so
/// graph references stay recognizable.
fn unique_name(original: &str, prefix: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}_{original}", &random[..8])
}

/// Download the request's input files into `<engine_home>/input/`.
///
/// Returns the original-name to unique-name mapping used for the graph
/// rewrite. Entries with blank names or URLs are skipped with a warning; a
/// failed download aborts the request.
pub(crate) async fn stage_inputs(
    entries: &BTreeMap<String, String>,
    engine_home: &Path,
    prefix: &str,
) -> Result<BTreeMap<String, String>> {
    if entries.is_empty() {
        return Ok(BTreeMap::new());
    }

    let input_dir = engine_home.join("input");
    fs_err::create_dir_all(&input_dir)?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("comfyctl/", env!("CARGO_PKG_VERSION")))
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .expect("Failed to build HTTP client.");

    let mut mapping = BTreeMap::new();
    for (name, url) in entries {
        let name = name.trim();
        if name.is_empty() {
            warn!("skipping input image with a blank name");
            continue;
        }
        if url.trim().is_empty() {
            warn!("skipping input image '{name}': blank URL");
            continue;
        }

        let unique = unique_name(name, prefix);
        let target = input_dir.join(&unique);
        info!("downloading input '{name}' -> '{unique}'");
        let response = client
            .get(url.trim())
            .send()
            .await
            .with_context(|| format!("failed to download input image '{name}' from {url}"))?;
        if !response.status().is_success() {
            bail!(
                "failed to download input image '{name}' from {url}: HTTP {}",
                response.status()
            );
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read input image '{name}'"))?;
        fs_err::write(&target, &bytes)?;
        debug!("input '{unique}' saved ({} bytes)", bytes.len());
        mapping.insert(name.to_string(), unique);
    }
    Ok(mapping)
}

/// Remove this request's input files, leaving other requests' files alone.
pub(crate) fn cleanup_inputs(engine_home: &Path, prefix: &str) -> usize {
    let input_dir = engine_home.join("input");
    let Ok(entries) = fs_err::read_dir(&input_dir) else {
        return 0;
    };
    let mut deleted = 0;
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&format!("{prefix}_")) {
            continue;
        }
        if entry.path().is_file() {
            match fs_err::remove_file(entry.path()) {
                Ok(()) => deleted += 1,
                Err(err) => warn!("failed to remove input file {name}: {err}"),
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_strips_dashes_and_caps() {
        let prefix = request_prefix(Some("ab-cd-ef-gh-ij-kl-mn-op-qr"));
        assert_eq!(prefix, "abcdefghijklmnop");
        // Without a request id, a timestamp stands in.
        let fallback = request_prefix(None);
        assert_eq!(fallback.len(), 14);
        assert!(fallback.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn unique_names_preserve_original() {
        let name = unique_name("img1.png", "req123");
        assert!(name.starts_with("req123_"));
        assert!(name.ends_with("_img1.png"));
    }

    #[test]
    fn cleanup_only_touches_this_request() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fs_err::create_dir_all(&input).unwrap();
        fs_err::write(input.join("req123_aa_img.png"), b"x").unwrap();
        fs_err::write(input.join("other456_bb_img.png"), b"x").unwrap();

        assert_eq!(cleanup_inputs(dir.path(), "req123"), 1);
        assert!(!input.join("req123_aa_img.png").exists());
        assert!(input.join("other456_bb_img.png").exists());
    }
}
