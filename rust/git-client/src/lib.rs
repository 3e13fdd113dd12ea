pub mod auth;
mod engine;
pub mod known_hosts;
mod reference;
mod version;

use std::{path::Path, sync::atomic::AtomicBool};

use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};

pub use auth::{Credentials, SecretData};
pub use engine::{set_network_timeout, Git2Engine};
pub use reference::ReferenceStrategy;
pub use version::VersionRange;

pub const DEFAULT_BRANCH: &str = "master";

/// Whether `commit` is a full or abbreviated commit hash.
pub fn is_commit_hash(commit: &str) -> bool {
    (4..=40).contains(&commit.len()) && commit.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Depth used for every shallow fetch.
pub const SHALLOW_DEPTH: u32 = 2;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("git network timeout error: {}", source))]
    ConfigureTimeout { source: git2::Error },

    #[snafu(display("git init error: {}", source))]
    InitRepository { source: git2::Error },

    #[snafu(display("git remote error for {}: {}", url, source))]
    CreateRemote { url: String, source: git2::Error },

    #[snafu(display("git clone error: {}", source))]
    Fetch { source: git2::Error },

    #[snafu(display("git clone was cancelled"))]
    Cancelled,

    #[snafu(display("git reference {} not found: {}", name, source))]
    FindReference { name: String, source: git2::Error },

    #[snafu(display("git checkout {} error: {}", commit, source))]
    Checkout { commit: String, source: git2::Error },

    #[snafu(display("'{}' is not a commit hash", commit))]
    InvalidCommit { commit: String },

    #[snafu(display("git checkout {} for {} error: {}", commit, branch, source))]
    CommitNotFound {
        commit: String,
        branch: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    #[snafu(display("git resolve HEAD error: {}", source))]
    ResolveHead { source: git2::Error },

    #[snafu(display("git list tags error: {}", source))]
    ListTags { source: git2::Error },

    #[snafu(display("semver parse range error for '{}': {}", expr, source))]
    InvalidSemverRange { expr: String, source: semver::Error },

    #[snafu(display("no match found for semver: {}", expr))]
    NoSemverMatch { expr: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which remote reference a clone fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRef {
    Branch(String),
    Tag(String),
}

impl RemoteRef {
    /// Refspec fetched from the remote and the local reference it lands on.
    pub fn refspec(&self) -> (String, String) {
        match self {
            RemoteRef::Branch(branch) => (
                format!("+refs/heads/{branch}:refs/remotes/origin/{branch}"),
                format!("refs/remotes/origin/{branch}"),
            ),
            RemoteRef::Tag(tag) => (
                format!("+refs/tags/{tag}:refs/tags/{tag}"),
                format!("refs/tags/{tag}"),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    None,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOptions {
    pub reference: RemoteRef,
    /// `None` fetches the full history.
    pub depth: Option<u32>,
    pub tags: TagMode,
}

/// A tag of the cloned repository, peeled to the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub commit: String,
}

/// Handle to a freshly cloned working tree.
pub trait Checkout {
    /// Hash of the commit currently checked out.
    fn head(&self) -> Result<String>;

    /// Every tag fetched with the clone.
    fn tags(&self) -> Result<Vec<Tag>>;

    /// Force-checks out `commit` (full or abbreviated hash) and returns its full hash.
    /// Anything other than 4 to 40 hex digits is rejected.
    fn checkout(&self, commit: &str) -> Result<String>;
}

/// The version-control engine: a black box able to clone a single reference.
pub trait GitEngine: Send + Sync + 'static {
    /// Clones `url` into the existing, empty directory `dest` and checks out the
    /// fetched reference. Aborts with [`Error::Cancelled`] once `cancel` is raised
    /// and the transfer reaches its next callback.
    fn clone_repo(
        &self,
        url: &str,
        credentials: &Credentials,
        options: &CloneOptions,
        dest: &Path,
        cancel: &AtomicBool,
    ) -> Result<Box<dyn Checkout>>;
}
