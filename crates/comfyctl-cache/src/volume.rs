use std::path::{Path, PathBuf};

/// Well-known RunPod volume mounts: `/runpod-volume` (serverless) and
/// `/workspace` (pod).
const VOLUME_MOUNTS: &[&str] = &["/runpod-volume", "/workspace"];

const DEFAULT_BUILDS_ROOT: &str = "/runpod-volume/builds";

/// Return the mounted RunPod volume, if one is present and usable.
///
/// `RUNPOD_VOLUME_ROOT` overrides the probe; otherwise the well-known mounts
/// are tried in order. A mount only counts if it is writable and traversable
/// by the current user.
pub fn runpod_volume() -> Option<PathBuf> {
    if let Some(root) = std::env::var_os("RUNPOD_VOLUME_ROOT") {
        if !root.is_empty() {
            let root = PathBuf::from(root);
            if is_usable_mount(&root) {
                return Some(root);
            }
            return None;
        }
    }
    VOLUME_MOUNTS
        .iter()
        .map(Path::new)
        .find(|mount| is_usable_mount(mount))
        .map(Path::to_path_buf)
}

/// The root directory for prebuilt engine homes.
pub fn builds_root() -> PathBuf {
    if let Some(root) = std::env::var_os("COMFY_BUILDS_ROOT") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    if let Some(volume) = runpod_volume() {
        return volume.join("builds");
    }
    PathBuf::from(DEFAULT_BUILDS_ROOT)
}

fn is_usable_mount(path: &Path) -> bool {
    use rustix::fs::{Access, access};
    path.is_dir() && access(path, Access::WRITE_OK | Access::EXEC_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_mount_is_skipped() {
        assert!(!is_usable_mount(Path::new("/definitely/not/mounted")));
    }

    #[test]
    fn tempdir_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_usable_mount(dir.path()));
    }
}
