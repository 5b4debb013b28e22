//! Content-addressed artifact fetching.
//!
//! Sources are parsed into a tagged [`ModelSource`]; downloads land in the
//! shared immutable cache under `<cache_root>/models/` and are published to
//! their target paths by symlink (or copy, when the filesystem refuses).

pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumParseError, hash_file};
pub use disk::{VolumeQuota, available_for, free_space};
pub use error::FetchError;
pub use fetcher::{DEFAULT_CONCURRENCY, Fetcher, Publish, publish};
pub use source::{CivitaiSource, HfSource, ModelSource, SourceKind};

mod checksum;
mod disk;
mod error;
mod fetcher;
mod source;
