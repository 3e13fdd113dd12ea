use std::{io, path::PathBuf};

use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("Invalid advertised address {}: {}", address, source))]
    InvalidAddress {
        address: String,
        source: url::ParseError,
    },

    #[snafu(display("Artifact path {} has no parent directory", path.display()))]
    NoParentDir { path: PathBuf },

    #[snafu(display("Cannot create directory {}: {}", path.display(), source))]
    CreateDir { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot open lock file {}: {}", path.display(), source))]
    OpenLock { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot acquire lock {}: {}", path.display(), source))]
    AcquireLock { path: PathBuf, source: io::Error },

    #[snafu(display("Operation on {} was cancelled", path.display()))]
    Cancelled { path: PathBuf },

    #[snafu(display("Cannot walk source directory {}: {}", path.display(), source))]
    WalkSource {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Cannot read {}: {}", path.display(), source))]
    ReadSource { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot write archive {}: {}", path.display(), source))]
    WriteArchive { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot persist archive {}: {}", path.display(), source))]
    PersistArchive {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("Cannot link alias {}: {}", path.display(), source))]
    LinkAlias { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot read directory {}: {}", path.display(), source))]
    ReadDir { path: PathBuf, source: io::Error },

    #[snafu(display("Cannot remove {}: {}", path.display(), source))]
    Remove { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to remove {} artifact(s): {}", failed.len(), describe(failed)))]
    RemoveArtifacts { failed: Vec<(PathBuf, io::Error)> },
}

fn describe(failed: &[(PathBuf, io::Error)]) -> String {
    failed
        .iter()
        .map(|(path, err)| format!("{}: {}", path.display(), err))
        .collect::<Vec<_>>()
        .join("; ")
}
