use std::path::Path;

/// Read a requirements file into its requirement lines.
///
/// Follows `-r` includes, drops comments, blank lines, and pip options.
pub fn read_requirements(path: &Path) -> std::io::Result<Vec<String>> {
    let mut lines = Vec::new();
    collect(path, &mut lines)?;
    Ok(lines)
}

fn collect(path: &Path, lines: &mut Vec<String>) -> std::io::Result<()> {
    let text = fs_err::read_to_string(path)?;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(include) = line.strip_prefix("-r ").or_else(|| line.strip_prefix("-r\t")) {
            let include_path = path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(include.trim());
            collect(&include_path, lines)?;
            continue;
        }
        // Other pip options (--index-url, -c, -e, ...) carry no distribution
        // name we can verify.
        if line.starts_with('-') {
            continue;
        }
        lines.push(line.to_string());
    }
    Ok(())
}

/// Extract the normalized distribution name from a requirement line.
///
/// Strips extras, version specifiers, environment markers, and direct-URL
/// tails; returns `None` for lines that name no distribution (bare URLs,
/// local paths).
pub fn package_name(requirement: &str) -> Option<String> {
    let head = requirement
        .split(';')
        .next()?
        .split(" @ ")
        .next()?
        .trim();
    if head.is_empty() || head.contains("://") || head.starts_with('.') || head.starts_with('/') {
        return None;
    }
    let name_end = head
        .find(['[', '=', '<', '>', '~', '!', ' ', '('])
        .unwrap_or(head.len());
    let name = head[..name_end].trim();
    if name.is_empty() {
        return None;
    }
    Some(normalize(name))
}

/// PEP 503 normalization: case-insensitive, `-`/`_`/`.` equivalent.
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}
