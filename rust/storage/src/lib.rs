use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

pub mod store;

pub use store::{error::StorageError, ArtifactLock, LocalStorage};

/// Names never included in an archive.
pub const DEFAULT_EXCLUDES: &[&str] = &[".git"];

/// Stable alias of the most recently published artifact of a resource.
pub const LATEST_ALIAS: &str = "latest.tar.gz";

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// A content-addressed archive published for one resource.
///
/// The identity is `(kind, namespace, name, filename)`; `path` locates it on disk
/// and `url` is where downstream consumers fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub path: PathBuf,
    pub url: String,
}

impl Artifact {
    pub fn filename(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }
}

/// Storage backend for artifacts.
///
/// All operations are blocking; callers run them off the async runtime. The
/// `cancel` flag is polled by long running operations, which abort with
/// [`StorageError::Cancelled`] once it is raised.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Guard returned by [`ArtifactStore::lock`], the lock is held until it is dropped.
    type Lock: Send;

    /// Derives the artifact identity. Pure, performs no I/O.
    fn artifact_for(&self, kind: &str, namespace: &str, name: &str, filename: &str) -> Artifact;

    fn exists(&self, artifact: &Artifact) -> bool;

    /// Creates the artifact's parent directory, succeeds if it already exists.
    fn ensure_dir(&self, artifact: &Artifact) -> Result<()>;

    /// Serializes archive and publish operations on the artifact's directory.
    fn lock(&self, artifact: &Artifact, cancel: &AtomicBool) -> Result<Self::Lock>;

    /// Writes a gzip compressed tarball of `source_dir` to the artifact path,
    /// skipping every entry whose file name is listed in `excludes`.
    fn archive(
        &self,
        artifact: &Artifact,
        source_dir: &Path,
        excludes: &[&str],
        cancel: &AtomicBool,
    ) -> Result<()>;

    /// Atomically points `alias` (in the artifact's directory) at the artifact.
    fn publish_alias(&self, artifact: &Artifact, alias: &str) -> Result<PathBuf>;

    /// Removes every other artifact stored for the same resource.
    fn retain_only(&self, artifact: &Artifact) -> Result<()>;

    /// Removes every artifact stored for a resource.
    fn remove_all(&self, kind: &str, namespace: &str, name: &str) -> Result<()>;
}
