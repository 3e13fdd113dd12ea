use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use git2::{
    build::CheckoutBuilder, AutotagOption, CertificateCheckStatus, Cred, CredentialType,
    FetchOptions, Oid, RemoteCallbacks, Repository,
};
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};
use url::Url;

use crate::{
    is_commit_hash, CancelledSnafu, Checkout, CheckoutSnafu, CloneOptions, ConfigureTimeoutSnafu,
    CreateRemoteSnafu, Credentials, Error, FindReferenceSnafu, GitEngine, InitRepositorySnafu,
    InvalidCommitSnafu, ListTagsSnafu, ResolveHeadSnafu, Result, Tag, TagMode,
};

const REMOTE_NAME: &str = "origin";
const ALL_TAGS_REFSPEC: &str = "+refs/tags/*:refs/tags/*";

/// Bounds how long libgit2 waits to connect to a remote and for every read or
/// write on an open connection. The setting is process wide and must be applied
/// before the first clone starts.
///
/// Cancellation is only observed from remote callbacks; this bounds the waits
/// in between them.
pub fn set_network_timeout(timeout: Duration) -> Result<()> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: both calls only store an integer in libgit2's global options.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)
            .context(ConfigureTimeoutSnafu)?;
        git2::opts::set_server_timeout_in_milliseconds(millis).context(ConfigureTimeoutSnafu)?;
    }
    debug!("libgit2 network timeout set to {}ms", millis);
    Ok(())
}

/// [`GitEngine`] backed by libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Engine;

impl GitEngine for Git2Engine {
    fn clone_repo(
        &self,
        url: &str,
        credentials: &Credentials,
        options: &CloneOptions,
        dest: &Path,
        cancel: &AtomicBool,
    ) -> Result<Box<dyn Checkout>> {
        ensure!(!cancel.load(Ordering::Relaxed), CancelledSnafu);

        let repo = Repository::init(dest).context(InitRepositorySnafu)?;
        let (refspec, local_ref) = options.reference.refspec();
        {
            let mut remote = repo
                .remote(REMOTE_NAME, url)
                .context(CreateRemoteSnafu { url })?;

            let mut fetch = FetchOptions::new();
            fetch.remote_callbacks(callbacks(url, credentials, cancel));
            let mut refspecs = vec![refspec];
            match options.tags {
                TagMode::All => {
                    fetch.download_tags(AutotagOption::All);
                    refspecs.push(ALL_TAGS_REFSPEC.to_string());
                }
                TagMode::None => {
                    fetch.download_tags(AutotagOption::None);
                }
            }
            match options.depth {
                Some(depth) if !is_local(url) => {
                    fetch.depth(i32::try_from(depth).unwrap_or(i32::MAX));
                }
                _ => {}
            }

            debug!(url, ?refspecs, depth = ?options.depth, "Fetching");
            remote
                .fetch(&refspecs, Some(&mut fetch), None)
                .map_err(|source| {
                    if cancel.load(Ordering::Relaxed) {
                        Error::Cancelled
                    } else {
                        Error::Fetch { source }
                    }
                })?;
        }
        ensure!(!cancel.load(Ordering::Relaxed), CancelledSnafu);

        let commit = repo
            .find_reference(&local_ref)
            .and_then(|reference| reference.peel_to_commit())
            .context(FindReferenceSnafu { name: &local_ref })?
            .id();
        force_checkout(&repo, commit).context(CheckoutSnafu {
            commit: commit.to_string(),
        })?;

        Ok(Box::new(Git2Checkout { repo }))
    }
}

pub struct Git2Checkout {
    repo: Repository,
}

impl Checkout for Git2Checkout {
    fn head(&self) -> Result<String> {
        self.repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map(|commit| commit.id().to_string())
            .context(ResolveHeadSnafu)
    }

    fn tags(&self) -> Result<Vec<Tag>> {
        let names = self.repo.tag_names(None).context(ListTagsSnafu)?;
        let mut tags: Vec<Tag> = names
            .iter()
            .flatten()
            .filter_map(|name| {
                match self
                    .repo
                    .revparse_single(&format!("refs/tags/{name}"))
                    .and_then(|object| object.peel_to_commit())
                {
                    Ok(commit) => Some(Tag {
                        name: name.to_string(),
                        commit: commit.id().to_string(),
                    }),
                    Err(error) => {
                        debug!("Ignoring tag {} not pointing at a commit: {}", name, error);
                        None
                    }
                }
            })
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    fn checkout(&self, commit: &str) -> Result<String> {
        ensure!(is_commit_hash(commit), InvalidCommitSnafu { commit });
        let oid = self
            .repo
            .find_commit_by_prefix(commit)
            .map(|commit| commit.id())
            .context(CheckoutSnafu { commit })?;
        force_checkout(&self.repo, oid).context(CheckoutSnafu { commit })?;
        Ok(oid.to_string())
    }
}

fn force_checkout(repo: &Repository, oid: Oid) -> Result<(), git2::Error> {
    let commit = repo.find_commit(oid)?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(oid)
}

/// libgit2 only supports shallow fetches over smart transports.
fn is_local(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.scheme() == "file",
        Err(_) => Path::new(url).exists(),
    }
}

fn callbacks<'a>(
    url: &str,
    credentials: &'a Credentials,
    cancel: &'a AtomicBool,
) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |_| !cancel.load(Ordering::Relaxed));
    callbacks.sideband_progress(move |_| !cancel.load(Ordering::Relaxed));

    let mut attempted = false;
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if cancel.load(Ordering::Relaxed) {
            return Err(git2::Error::from_str("cancelled"));
        }
        let username = match credentials {
            Credentials::Basic { username, .. } | Credentials::SshIdentity { username, .. } => {
                username_from_url.unwrap_or(username.as_str())
            }
            Credentials::None => {
                return Err(git2::Error::from_str(
                    "remote requires authentication but no credentials are configured",
                ))
            }
        };
        if allowed.contains(CredentialType::USERNAME) {
            return Cred::username(username);
        }
        if attempted {
            return Err(git2::Error::from_str("remote rejected the configured credentials"));
        }
        attempted = true;
        match credentials {
            Credentials::Basic { password, .. } => Cred::userpass_plaintext(username, password),
            Credentials::SshIdentity { private_key, .. } => {
                Cred::ssh_key_from_memory(username, None, private_key, None)
            }
            Credentials::None => Err(git2::Error::from_str("no credentials configured")),
        }
    });

    if let Credentials::SshIdentity { known_hosts, .. } = credentials {
        let port = Url::parse(url).ok().and_then(|parsed| parsed.port());
        callbacks.certificate_check(move |cert, host| {
            if cancel.load(Ordering::Relaxed) {
                return Err(git2::Error::from_str("cancelled"));
            }
            let Some(host_key) = cert.as_hostkey() else {
                return Ok(CertificateCheckStatus::CertificatePassthrough);
            };
            let Some(fingerprint) = host_key.hash_sha256() else {
                return Err(git2::Error::from_str("host key has no SHA-256 fingerprint"));
            };
            known_hosts
                .verify(host, port, fingerprint)
                .map(|()| CertificateCheckStatus::CertificateOk)
                .map_err(|error| {
                    warn!("Rejecting host key of {}: {}", host, error);
                    git2::Error::from_str(&error.to_string())
                })
        });
    }

    callbacks
}
