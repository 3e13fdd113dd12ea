use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use fslock::LockFile;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::{store::error::*, Artifact, ArtifactStore};

mod archive;
pub mod error;

type Result<T, E = StorageError> = std::result::Result<T, E>;

const LOCK_FILE: &str = ".lock";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const ARCHIVE_SUFFIX: &str = ".tar.gz";
const ARCHIVE_TMP_PREFIX: &str = ".archive-";

/// Artifact storage on the local filesystem.
///
/// Layout: `<base>/<kind>/<namespace>/<name>/<filename>`, advertised as
/// `http://<hostname>/<kind>/<namespace>/<name>/<filename>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: Url,
}

impl LocalStorage {
    /// # Example:
    /// ```ignore
    /// let storage = LocalStorage::new("/data", "source-controller.flux-system.svc")?;
    /// ```
    pub fn new(base_path: impl Into<PathBuf>, hostname: &str) -> Result<Self> {
        let address = format!("http://{hostname}/");
        let base_url = Url::parse(&address).context(InvalidAddressSnafu { address })?;
        Ok(Self {
            base_path: base_path.into(),
            base_url,
        })
    }

    fn resource_dir(&self, kind: &str, namespace: &str, name: &str) -> PathBuf {
        self.base_path.join(kind).join(namespace).join(name)
    }
}

fn artifact_dir(artifact: &Artifact) -> Result<&Path> {
    artifact.dir().context(NoParentDirSnafu {
        path: &artifact.path,
    })
}

/// Takes the directory lock if it is free right now.
fn try_lock_dir(dir: &Path) -> Result<Option<ArtifactLock>> {
    let path = dir.join(LOCK_FILE);
    let mut file = LockFile::open(path.as_os_str()).context(OpenLockSnafu { path: &path })?;
    if file.try_lock().context(AcquireLockSnafu { path: &path })? {
        Ok(Some(ArtifactLock { file, path }))
    } else {
        debug!("{} is busy, keeping temporary archives", dir.display());
        Ok(None)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Holds the directory lock of an artifact until dropped.
pub struct ArtifactLock {
    file: LockFile,
    path: PathBuf,
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!("Failed to release lock {}: {}", self.path.display(), err);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}

impl ArtifactStore for LocalStorage {
    type Lock = ArtifactLock;

    fn artifact_for(&self, kind: &str, namespace: &str, name: &str, filename: &str) -> Artifact {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend([kind, namespace, name, filename]);
        }
        Artifact {
            path: self.resource_dir(kind, namespace, name).join(filename),
            url: url.to_string(),
        }
    }

    fn exists(&self, artifact: &Artifact) -> bool {
        fs::metadata(&artifact.path).is_ok_and(|m| m.is_file())
    }

    fn ensure_dir(&self, artifact: &Artifact) -> Result<()> {
        let dir = artifact_dir(artifact)?;
        fs::create_dir_all(dir).context(CreateDirSnafu { path: dir })
    }

    fn lock(&self, artifact: &Artifact, cancel: &AtomicBool) -> Result<ArtifactLock> {
        let path = artifact_dir(artifact)?.join(LOCK_FILE);
        let mut file = LockFile::open(path.as_os_str()).context(OpenLockSnafu { path: &path })?;
        while !file.try_lock().context(AcquireLockSnafu { path: &path })? {
            ensure!(!cancel.load(Ordering::Relaxed), CancelledSnafu { path: &path });
            thread::sleep(LOCK_POLL_INTERVAL);
        }
        debug!("Acquired lock {}", path.display());
        Ok(ArtifactLock { file, path })
    }

    fn archive(
        &self,
        artifact: &Artifact,
        source_dir: &Path,
        excludes: &[&str],
        cancel: &AtomicBool,
    ) -> Result<()> {
        let dir = artifact_dir(artifact)?;
        let path = &artifact.path;
        let tmp = tempfile::Builder::new()
            .prefix(ARCHIVE_TMP_PREFIX)
            .suffix(ARCHIVE_SUFFIX)
            .tempfile_in(dir)
            .context(WriteArchiveSnafu { path })?;

        let mut writer = archive::write_tarball(
            source_dir,
            BufWriter::new(tmp.as_file()),
            excludes,
            cancel,
        )?;
        writer.flush().context(WriteArchiveSnafu { path })?;
        drop(writer);
        tmp.as_file().sync_all().context(WriteArchiveSnafu { path })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
                .context(WriteArchiveSnafu { path })?;
        }

        ensure!(!cancel.load(Ordering::Relaxed), CancelledSnafu { path });
        tmp.persist(path).context(PersistArchiveSnafu { path })?;
        info!("Archived {} to {}", source_dir.display(), path.display());
        Ok(())
    }

    fn publish_alias(&self, artifact: &Artifact, alias: &str) -> Result<PathBuf> {
        let dir = artifact_dir(artifact)?;
        let target = artifact.path.file_name().context(NoParentDirSnafu {
            path: &artifact.path,
        })?;
        let alias_path = dir.join(alias);
        let tmp_path = dir.join(format!(".{alias}.tmp"));

        remove_if_exists(&tmp_path).context(LinkAliasSnafu { path: &tmp_path })?;
        link(Path::new(target), &artifact.path, &tmp_path)
            .context(LinkAliasSnafu { path: &tmp_path })?;
        fs::rename(&tmp_path, &alias_path).context(LinkAliasSnafu { path: &alias_path })?;

        debug!("Pointed {} at {}", alias_path.display(), artifact.path.display());
        Ok(alias_path)
    }

    fn retain_only(&self, artifact: &Artifact) -> Result<()> {
        let dir = artifact_dir(artifact)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context(ReadDirSnafu { path: dir }),
        };

        // Leftovers of an interrupted archive are only safe to remove while
        // nobody is archiving.
        let idle = try_lock_dir(dir)?;

        let mut failed = Vec::new();
        for entry in entries {
            let entry = entry.context(ReadDirSnafu { path: dir })?;
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let is_archive = name.ends_with(ARCHIVE_SUFFIX) && !name.starts_with('.');
            let is_leftover = idle.is_some() && name.starts_with(ARCHIVE_TMP_PREFIX);
            // file_type does not follow symlinks, so the alias is never a candidate
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            if !(is_archive || is_leftover) || !is_file || path == artifact.path {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale artifact {}", path.display()),
                Err(err) => failed.push((path, err)),
            }
        }

        ensure!(failed.is_empty(), RemoveArtifactsSnafu { failed });
        Ok(())
    }

    fn remove_all(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        let dir = self.resource_dir(kind, namespace, name);
        match fs::remove_dir_all(&dir) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(err).context(RemoveSnafu { path: dir })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn link(target: &Path, _absolute: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link(_target: &Path, absolute: &Path, link: &Path) -> io::Result<()> {
    fs::copy(absolute, link).map(|_| ())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs::File, io::Read};

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::*;
    use crate::{DEFAULT_EXCLUDES, LATEST_ALIAS};

    const KIND: &str = "gitrepository";

    fn storage() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().expect("temp dir");
        let storage = LocalStorage::new(dir.path(), "localhost:9090").expect("storage");
        (dir, storage)
    }

    fn source_tree() -> TempDir {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir_all(dir.path().join("deploy/base")).unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join("README.md"), "# podinfo\n").unwrap();
        fs::write(dir.path().join("deploy/base/kustomization.yaml"), "resources: []\n").unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/master\n").unwrap();
        dir
    }

    fn unpack(path: &Path) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                files.insert(name, content);
            }
        }
        files
    }

    fn publish(storage: &LocalStorage, source: &Path, filename: &str) -> Artifact {
        let artifact = storage.artifact_for(KIND, "default", "podinfo", filename);
        let cancel = AtomicBool::new(false);
        storage.ensure_dir(&artifact).unwrap();
        let _lock = storage.lock(&artifact, &cancel).unwrap();
        storage
            .archive(&artifact, source, DEFAULT_EXCLUDES, &cancel)
            .unwrap();
        storage.publish_alias(&artifact, LATEST_ALIAS).unwrap();
        artifact
    }

    #[test]
    fn test_artifact_for_is_deterministic() {
        let (dir, storage) = storage();
        let artifact = storage.artifact_for(KIND, "flux-system", "podinfo", "6b7aab8a.tar.gz");
        assert_eq!(
            artifact.path,
            dir.path().join("gitrepository/flux-system/podinfo/6b7aab8a.tar.gz")
        );
        assert_eq!(
            artifact.url,
            "http://localhost:9090/gitrepository/flux-system/podinfo/6b7aab8a.tar.gz"
        );
        assert_eq!(
            artifact,
            storage.artifact_for(KIND, "flux-system", "podinfo", "6b7aab8a.tar.gz")
        );
        assert_eq!(artifact.filename(), Some("6b7aab8a.tar.gz"));
    }

    #[test]
    fn test_invalid_address() {
        assert!(LocalStorage::new("/tmp", "not a host").is_err());
    }

    #[test]
    fn test_ensure_dir_is_idempotent() -> Result<()> {
        let (_dir, storage) = storage();
        let artifact = storage.artifact_for(KIND, "default", "podinfo", "a.tar.gz");
        storage.ensure_dir(&artifact)?;
        storage.ensure_dir(&artifact)?;
        assert!(artifact.dir().unwrap().is_dir());
        assert!(!storage.exists(&artifact));
        Ok(())
    }

    #[test]
    fn test_archive_round_trip_excludes_git_metadata() {
        let (_dir, storage) = storage();
        let source = source_tree();
        let artifact = publish(&storage, source.path(), "abc.tar.gz");

        assert!(storage.exists(&artifact));
        let files = unpack(&artifact.path);
        assert_eq!(
            files.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["README.md", "deploy/base/kustomization.yaml"]
        );
        assert_eq!(files["README.md"], "# podinfo\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_keeps_symlinks() {
        let (_dir, storage) = storage();
        let source = source_tree();
        std::os::unix::fs::symlink("README.md", source.path().join("INDEX.md")).unwrap();
        let artifact = publish(&storage, source.path(), "abc.tar.gz");

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&artifact.path).unwrap()));
        let link = archive
            .entries()
            .unwrap()
            .map(Result::unwrap)
            .find(|e| e.header().entry_type().is_symlink())
            .expect("symlink entry");
        assert_eq!(
            link.link_name().unwrap().unwrap().to_string_lossy(),
            "README.md"
        );
    }

    #[test]
    fn test_archive_is_reproducible() {
        let (_dir, storage) = storage();
        let source = source_tree();
        let first = publish(&storage, source.path(), "first.tar.gz");
        let second = publish(&storage, source.path(), "second.tar.gz");
        assert_eq!(fs::read(first.path).unwrap(), fs::read(second.path).unwrap());
    }

    #[test]
    fn test_cancelled_archive_leaves_no_artifact() {
        let (_dir, storage) = storage();
        let source = source_tree();
        let artifact = storage.artifact_for(KIND, "default", "podinfo", "abc.tar.gz");
        storage.ensure_dir(&artifact).unwrap();

        let cancel = AtomicBool::new(true);
        let result = storage.archive(&artifact, source.path(), DEFAULT_EXCLUDES, &cancel);
        assert!(matches!(result, Err(StorageError::Cancelled { .. })));
        assert!(!storage.exists(&artifact));
        assert_eq!(fs::read_dir(artifact.dir().unwrap()).unwrap().count(), 0);
    }

    #[test]
    fn test_alias_follows_latest_publish() {
        let (_dir, storage) = storage();
        let source = source_tree();
        let first = publish(&storage, source.path(), "first.tar.gz");
        let alias = first.dir().unwrap().join(LATEST_ALIAS);
        assert_eq!(fs::read(&alias).unwrap(), fs::read(&first.path).unwrap());

        fs::write(source.path().join("README.md"), "# changed\n").unwrap();
        let second = publish(&storage, source.path(), "second.tar.gz");
        assert_eq!(fs::read(&alias).unwrap(), fs::read(&second.path).unwrap());
        assert_eq!(unpack(&alias)["README.md"], "# changed\n");
    }

    #[test]
    fn test_retain_only_keeps_current_alias_and_lock() -> Result<()> {
        let (_dir, storage) = storage();
        let source = source_tree();
        let old = publish(&storage, source.path(), "old.tar.gz");
        let current = publish(&storage, source.path(), "current.tar.gz");

        storage.retain_only(&current)?;

        assert!(!storage.exists(&old));
        assert!(storage.exists(&current));
        let dir = current.dir().unwrap();
        assert!(dir.join(LATEST_ALIAS).exists());
        assert!(dir.join(LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_retain_only_collects_interrupted_archives() -> Result<()> {
        let (_dir, storage) = storage();
        let source = source_tree();
        let current = publish(&storage, source.path(), "current.tar.gz");
        let leftover = current.dir().unwrap().join(".archive-k3Xq9a.tar.gz");

        fs::write(&leftover, "partial").unwrap();
        let held = storage.lock(&current, &AtomicBool::new(false))?;
        storage.retain_only(&current)?;
        assert!(leftover.exists());

        drop(held);
        storage.retain_only(&current)?;
        assert!(!leftover.exists());
        assert!(storage.exists(&current));
        Ok(())
    }

    #[test]
    fn test_retain_only_without_directory() -> Result<()> {
        let (_dir, storage) = storage();
        let artifact = storage.artifact_for(KIND, "default", "missing", "a.tar.gz");
        storage.retain_only(&artifact)
    }

    #[test]
    fn test_remove_all() -> Result<()> {
        let (_dir, storage) = storage();
        let source = source_tree();
        let artifact = publish(&storage, source.path(), "abc.tar.gz");

        storage.remove_all(KIND, "default", "podinfo")?;
        assert!(!artifact.dir().unwrap().exists());
        storage.remove_all(KIND, "default", "podinfo")
    }

    #[test]
    fn test_lock_is_exclusive_per_directory() {
        let (_dir, storage) = storage();
        let artifact = storage.artifact_for(KIND, "default", "podinfo", "a.tar.gz");
        let sibling = storage.artifact_for(KIND, "default", "podinfo", "b.tar.gz");
        let other = storage.artifact_for(KIND, "default", "other", "a.tar.gz");
        storage.ensure_dir(&artifact).unwrap();
        storage.ensure_dir(&other).unwrap();

        let idle = AtomicBool::new(false);
        let held = storage.lock(&artifact, &idle).unwrap();

        let cancelled = AtomicBool::new(true);
        let contended = storage.lock(&sibling, &cancelled);
        assert!(matches!(contended, Err(StorageError::Cancelled { .. })));
        assert!(storage.lock(&other, &idle).is_ok());

        drop(held);
        assert!(storage.lock(&sibling, &cancelled).is_ok());
    }
}
