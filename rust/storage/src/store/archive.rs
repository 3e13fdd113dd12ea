use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use flate2::{write::GzEncoder, Compression};
use snafu::{ensure, ResultExt};
use tar::{Builder, EntryType, Header};
use walkdir::{DirEntry, WalkDir};

use crate::store::error::*;

type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Streams a reproducible `.tar.gz` of `source_dir` into `writer`.
///
/// Entries are visited in file name order and carry zeroed timestamps and
/// ownership, so the same tree always yields the same bytes.
pub(crate) fn write_tarball<W: Write>(
    source_dir: &Path,
    writer: W,
    excludes: &[&str],
    cancel: &AtomicBool,
) -> Result<W> {
    let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.follow_symlinks(false);

    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry, excludes));

    for entry in walker {
        ensure!(
            !cancel.load(Ordering::Relaxed),
            CancelledSnafu { path: source_dir }
        );
        let entry = entry.context(WalkSourceSnafu { path: source_dir })?;
        let Ok(relative) = entry.path().strip_prefix(source_dir) else {
            continue;
        };
        append_entry(&mut builder, &entry, relative)?;
    }

    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .context(WriteArchiveSnafu { path: source_dir })
}

fn is_excluded(entry: &DirEntry, excludes: &[&str]) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| excludes.contains(&name))
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &DirEntry,
    relative: &Path,
) -> Result<()> {
    let path = entry.path();
    let file_type = entry.file_type();
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder
            .append_data(&mut header, relative, io::empty())
            .context(WriteArchiveSnafu { path })
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(path).context(ReadSourceSnafu { path })?;
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder
            .append_link(&mut header, relative, target)
            .context(WriteArchiveSnafu { path })
    } else if file_type.is_file() {
        let metadata = entry.metadata().map_err(io::Error::from).context(ReadSourceSnafu { path })?;
        let file = File::open(path).context(ReadSourceSnafu { path })?;
        header.set_entry_type(EntryType::Regular);
        header.set_mode(file_mode(&metadata));
        header.set_size(metadata.len());
        builder
            .append_data(&mut header, relative, file)
            .context(WriteArchiveSnafu { path })
    } else {
        tracing::debug!("Skipping special file {}", path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
