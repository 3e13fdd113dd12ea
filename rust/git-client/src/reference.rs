use std::{fmt, path::Path, sync::atomic::AtomicBool};

use snafu::{OptionExt, ResultExt};
use tracing::debug;

use crate::{
    version::VersionRange, CloneOptions, CommitNotFoundSnafu, Credentials, GitEngine,
    InvalidSemverRangeSnafu, NoSemverMatchSnafu, RemoteRef, Result, TagMode, DEFAULT_BRANCH,
    SHALLOW_DEPTH,
};

/// How a repository reference is turned into one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceStrategy {
    /// Shallow clone of a branch tip.
    Branch { branch: String },
    /// Shallow clone of a tag.
    Tag { tag: String },
    /// Shallow clone of `branch` with every tag, checking out the highest tag
    /// matching `range`.
    SemVer { branch: String, range: String },
    /// Full clone of `branch`, then a forced checkout of `commit`.
    Commit { branch: String, commit: String },
}

impl ReferenceStrategy {
    /// Picks the strategy for the given reference fields, first match wins:
    /// commit, semver range, tag, branch, and finally the default branch.
    pub fn select(
        branch: Option<&str>,
        tag: Option<&str>,
        semver: Option<&str>,
        commit: Option<&str>,
    ) -> Self {
        let branch = branch.unwrap_or(DEFAULT_BRANCH).to_string();
        match (commit, semver, tag) {
            (Some(commit), _, _) => Self::Commit {
                branch,
                commit: commit.to_string(),
            },
            (None, Some(range), _) => Self::SemVer {
                branch,
                range: range.to_string(),
            },
            (None, None, Some(tag)) => Self::Tag {
                tag: tag.to_string(),
            },
            (None, None, None) => Self::Branch { branch },
        }
    }

    pub fn clone_options(&self) -> CloneOptions {
        match self {
            Self::Branch { branch } => CloneOptions {
                reference: RemoteRef::Branch(branch.clone()),
                depth: Some(SHALLOW_DEPTH),
                tags: TagMode::None,
            },
            Self::Tag { tag } => CloneOptions {
                reference: RemoteRef::Tag(tag.clone()),
                depth: Some(SHALLOW_DEPTH),
                tags: TagMode::None,
            },
            Self::SemVer { branch, .. } => CloneOptions {
                reference: RemoteRef::Branch(branch.clone()),
                depth: Some(SHALLOW_DEPTH),
                tags: TagMode::All,
            },
            Self::Commit { branch, .. } => CloneOptions {
                reference: RemoteRef::Branch(branch.clone()),
                depth: None,
                tags: TagMode::None,
            },
        }
    }

    /// Clones `url` into `dest` and leaves the resolved commit checked out.
    /// Returns the full hash of that commit.
    pub fn checkout<G: GitEngine + ?Sized>(
        &self,
        engine: &G,
        url: &str,
        credentials: &Credentials,
        dest: &Path,
        cancel: &AtomicBool,
    ) -> Result<String> {
        let range = match self {
            Self::SemVer { range, .. } => Some(
                VersionRange::parse(range).context(InvalidSemverRangeSnafu { expr: range })?,
            ),
            _ => None,
        };

        let repo = engine.clone_repo(url, credentials, &self.clone_options(), dest, cancel)?;

        match (self, range) {
            (Self::Commit { branch, commit }, _) => repo
                .checkout(commit)
                .context(CommitNotFoundSnafu { commit, branch }),
            (Self::SemVer { range: expr, .. }, Some(range)) => {
                let tags = repo.tags()?;
                let tag = range
                    .latest(&tags)
                    .context(NoSemverMatchSnafu { expr })?;
                debug!(tag = %tag.name, commit = %tag.commit, "Selected tag for semver {}", expr);
                repo.checkout(&tag.commit)
            }
            _ => repo.head(),
        }
    }
}

impl fmt::Display for ReferenceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch { branch } => write!(f, "branch '{branch}'"),
            Self::Tag { tag } => write!(f, "tag '{tag}'"),
            Self::SemVer { branch, range } => write!(f, "semver '{range}' on branch '{branch}'"),
            Self::Commit { branch, commit } => write!(f, "commit '{commit}' on branch '{branch}'"),
        }
    }
}
