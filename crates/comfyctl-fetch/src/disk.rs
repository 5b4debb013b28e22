use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// A declared size budget for the RunPod volume.
///
/// Network volumes report the host filesystem's free space, not the volume
/// quota, so `statvfs` alone over-promises. When a quota is declared we treat
/// `quota - measured usage` as the ceiling.
#[derive(Debug, Clone)]
pub struct VolumeQuota {
    pub root: PathBuf,
    pub bytes: u64,
}

impl VolumeQuota {
    /// Read the declared quota from the environment, if any.
    ///
    /// `RUNPOD_VOLUME_QUOTA_BYTES` wins over `RUNPOD_VOLUME_QUOTA_GB` (and its
    /// bare `RUNPOD_VOLUME_QUOTA` synonym, also in GiB).
    pub fn from_env() -> Option<Self> {
        let root = comfyctl_cache::runpod_volume()?;
        let bytes = read_env_u64("RUNPOD_VOLUME_QUOTA_BYTES").or_else(|| {
            read_env_u64("RUNPOD_VOLUME_QUOTA_GB")
                .or_else(|| read_env_u64("RUNPOD_VOLUME_QUOTA"))
                .map(|gb| gb.saturating_mul(1024 * 1024 * 1024))
        })?;
        Some(Self { root, bytes })
    }

    fn applies_to(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// `quota - used`, where `used` is the measured size of the volume.
    fn remaining(&self) -> u64 {
        let used = directory_usage(&self.root);
        debug!(
            "volume quota: {} bytes declared, {used} bytes used under {}",
            self.bytes,
            self.root.display()
        );
        self.bytes.saturating_sub(used)
    }
}

/// Free bytes reported by the filesystem backing `path`.
///
/// Climbs to the nearest existing ancestor so preflight works for paths that
/// have not been created yet.
pub fn free_space(path: &Path) -> io::Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        probe = probe
            .parent()
            .ok_or_else(|| io::Error::other(format!("no existing ancestor of {}", path.display())))?;
    }
    let stat = rustix::fs::statvfs(probe)?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

/// Bytes available for writing at `path`, honoring a declared volume quota.
pub fn available_for(path: &Path, quota: Option<&VolumeQuota>) -> io::Result<u64> {
    let free = free_space(path)?;
    match quota {
        Some(quota) if quota.applies_to(path) => Ok(free.min(quota.remaining())),
        _ => Ok(free),
    }
}

/// Total size of the files below `path`. Unreadable entries count as zero.
fn directory_usage(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|metadata| metadata.len())
        .sum()
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_caps_availability() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        fs_err::write(dir.path().join("used"), vec![0u8; 4096])?;
        let quota = VolumeQuota {
            root: dir.path().to_path_buf(),
            bytes: 10_000,
        };
        let available = available_for(dir.path(), Some(&quota))?;
        assert!(available <= 10_000 - 4096);
        Ok(())
    }

    #[test]
    fn quota_ignored_outside_volume() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let elsewhere = tempfile::tempdir()?;
        let quota = VolumeQuota {
            root: dir.path().to_path_buf(),
            bytes: 1,
        };
        let available = available_for(elsewhere.path(), Some(&quota))?;
        assert!(available > 1);
        Ok(())
    }

    #[test]
    fn free_space_climbs_to_existing_ancestor() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("not").join("yet").join("created");
        assert!(free_space(&missing)? > 0);
        Ok(())
    }
}
