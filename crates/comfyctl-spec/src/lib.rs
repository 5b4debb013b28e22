//! The declarative version-spec document (schema v2), its resolved-lock
//! counterpart, and the readiness marker that gates re-preparation.

pub use error::SpecError;
pub use lock::{ResolvedEngine, ResolvedLock, ResolvedModel, ResolvedNode, ResolvedOptions};
pub use marker::{MARKER_FILE, PreparedMarker, PinnedRepo};
pub use resolve::{ResolveError, effective_offline, resolve};
pub use spec::{EngineSpec, ModelEntry, NodeSpec, SpecOptions, VersionSpec};

mod error;
mod lock;
mod marker;
mod resolve;
mod spec;
