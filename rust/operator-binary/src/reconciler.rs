use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use artifact_storage::{Artifact, ArtifactStore, StorageError, DEFAULT_EXCLUDES, LATEST_ALIAS};
use async_trait::async_trait;
use git_client::{auth, GitEngine, ReferenceStrategy, SecretData};
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};
use source_controller_crd::{
    ConditionReason, GitRepository, GitRepositoryStatus, SourceCondition, STORAGE_KIND,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::deadline::{Deadline, DeadlineError};

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Name of the working tree inside a sync attempt's scratch directory.
const CHECKOUT_DIR: &str = "checkout";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("GitRepository {} has no namespace", name))]
    MissingNamespace { name: String },

    #[snafu(display("Unable to update status of GitRepository {}: {}", name, source))]
    WriteStatus { name: String, source: kube::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The part of a sync attempt that ran into trouble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Auth,
    Git,
    Storage,
}

/// Why a sync attempt failed. Never escapes the reconciler: it is reported
/// through the Ready condition.
#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum SyncError {
    #[snafu(display("auth error: unable to read secret '{}': {}", name, source))]
    ReadSecret { name: String, source: kube::Error },

    #[snafu(display("auth error: secret '{}' not found", name))]
    SecretNotFound { name: String },

    #[snafu(display("auth error: {}", source))]
    Negotiate { source: auth::Error },

    #[snafu(display("tmp dir error: {}", source))]
    ScratchDir { source: std::io::Error },

    #[snafu(display("{}", source))]
    Git { source: git_client::Error },

    #[snafu(display("storage error: {}", source))]
    Storage { source: StorageError },

    #[snafu(display("{} {}", stage, source))]
    Deadline { stage: Stage, source: DeadlineError },
}

impl SyncError {
    pub fn reason(&self) -> ConditionReason {
        match self {
            SyncError::ReadSecret { .. }
            | SyncError::SecretNotFound { .. }
            | SyncError::Negotiate { .. } => ConditionReason::AuthenticationFailed,
            SyncError::ScratchDir { .. }
            | SyncError::Storage { .. }
            | SyncError::Deadline {
                stage: Stage::Storage,
                ..
            } => ConditionReason::StorageOperationFailed,
            SyncError::Git { .. } | SyncError::Deadline { .. } => {
                ConditionReason::GitOperationFailed
            }
        }
    }
}

/// Reads the credential secret referenced by a repository.
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// `Ok(None)` when the secret does not exist.
    async fn read_secret(&self, namespace: &str, name: &str)
        -> Result<Option<SecretData>, kube::Error>;
}

/// Persists the status sub-resource of a repository.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn write_status(
        &self,
        repo: &GitRepository,
        status: &GitRepositoryStatus,
    ) -> Result<(), kube::Error>;
}

/// Result of one sync attempt: the condition to report and, on success, the
/// URL of the published artifact.
#[derive(Debug)]
pub struct ReconciliationOutcome {
    pub condition: SourceCondition,
    pub artifact: Option<String>,
    pub error: Option<SyncError>,
}

impl ReconciliationOutcome {
    fn succeeded(artifact: &Artifact) -> Self {
        Self {
            condition: SourceCondition::ready(
                ConditionReason::GitOperationSucceeded,
                format!("Artifact is available at: {}", artifact.path.display()),
            ),
            artifact: Some(artifact.url.clone()),
            error: None,
        }
    }

    fn failed(error: SyncError) -> Self {
        Self {
            condition: SourceCondition::not_ready(error.reason(), error.to_string()),
            artifact: None,
            error: Some(error),
        }
    }
}

/// What a reconciliation left behind.
#[derive(Debug)]
pub struct Reconciled {
    /// The status as last written.
    pub status: GitRepositoryStatus,
    pub error: Option<SyncError>,
    /// Whether `status.artifact` now advertises a different artifact.
    pub new_artifact: bool,
}

/// The GitRepository control loop body.
pub struct Reconciler<S, G> {
    storage: Arc<S>,
    engine: Arc<G>,
    secrets: Arc<dyn SecretReader>,
    status: Arc<dyn StatusWriter>,
    timeout: Duration,
    scratch_root: PathBuf,
}

impl<S: ArtifactStore, G: GitEngine> Reconciler<S, G> {
    pub fn new(
        storage: Arc<S>,
        engine: Arc<G>,
        secrets: Arc<dyn SecretReader>,
        status: Arc<dyn StatusWriter>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            engine,
            secrets,
            status,
            timeout,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Directory under which every sync attempt creates its private scratch directory.
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    /// Brings the status of `repo` in line with its remote.
    ///
    /// Sync failures end up in the Ready condition; only failures to write the
    /// status itself are returned.
    pub async fn reconcile(&self, repo: &GitRepository) -> Result<Reconciled> {
        let name = repo.name_any();
        let namespace = repo
            .namespace()
            .context(MissingNamespaceSnafu { name: &name })?;

        let mut status = repo.status.clone().unwrap_or_default();
        if let Some(initial) = self.should_reset_status(repo, &namespace, &name) {
            info!("Initializing repository {}/{}", namespace, name);
            status = initial;
            self.write_status(repo, &status).await?;
        }

        self.gc(&namespace, &name, &status).await;

        let outcome = self.sync(repo, &namespace, &name).await;
        let mut new_artifact = false;
        match &outcome.error {
            Some(error) => {
                let reason: &'static str = SyncErrorDiscriminants::from(error).into();
                info!(reason, "Repository {}/{} sync failed: {}", namespace, name, error);
            }
            None => {
                if status.artifact != outcome.artifact {
                    status.artifact = outcome.artifact.clone();
                    status.last_update_time = Some(Time(Utc::now()));
                    new_artifact = true;
                }
                info!(
                    "Repository {}/{} sync succeeded: {}",
                    namespace, name, outcome.condition.message
                );
            }
        }

        status.conditions = vec![outcome.condition];
        status.observed_generation = repo.metadata.generation;
        self.write_status(repo, &status).await?;

        Ok(Reconciled {
            status,
            error: outcome.error,
            new_artifact,
        })
    }

    /// Returns a fresh `Initializing` status when `repo` has never been
    /// reconciled, or when the artifact it advertises is gone from storage.
    pub fn should_reset_status(
        &self,
        repo: &GitRepository,
        namespace: &str,
        name: &str,
    ) -> Option<GitRepositoryStatus> {
        let Some(status) = repo.status.as_ref().filter(|s| !s.conditions.is_empty()) else {
            return Some(GitRepositoryStatus::initializing());
        };
        let filename = status.artifact_filename()?;
        let artifact = self.storage.artifact_for(STORAGE_KIND, namespace, name, filename);
        if self.storage.exists(&artifact) {
            None
        } else {
            warn!(
                "Artifact {} of {}/{} is missing",
                artifact.path.display(),
                namespace,
                name
            );
            Some(GitRepositoryStatus::initializing())
        }
    }

    /// Removes every stored artifact of the repository except the one its
    /// status advertises. Failures are only logged.
    pub async fn gc(&self, namespace: &str, name: &str, status: &GitRepositoryStatus) {
        let Some(filename) = status.artifact_filename() else {
            return;
        };
        let artifact = self.storage.artifact_for(STORAGE_KIND, namespace, name, filename);
        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || storage.retain_only(&artifact)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("Artifacts GC of {}/{} failed: {}", namespace, name, error),
            Err(error) => warn!("Artifacts GC of {}/{} aborted: {}", namespace, name, error),
        }
    }

    /// Removes every artifact of a deleted repository. Failures are only logged.
    pub async fn cleanup(&self, namespace: &str, name: &str) {
        let storage = self.storage.clone();
        let (ns, n) = (namespace.to_string(), name.to_string());
        match tokio::task::spawn_blocking(move || storage.remove_all(STORAGE_KIND, &ns, &n)).await {
            Ok(Ok(())) => info!("Repository {}/{} artifacts deleted", namespace, name),
            Ok(Err(error)) => warn!(
                "Unable to delete artifacts of {}/{}: {}",
                namespace, name, error
            ),
            Err(error) => warn!(
                "Deleting artifacts of {}/{} aborted: {}",
                namespace, name, error
            ),
        }
    }

    /// Resolves, clones and publishes the repository under one deadline.
    pub async fn sync(
        &self,
        repo: &GitRepository,
        namespace: &str,
        name: &str,
    ) -> ReconciliationOutcome {
        match self.try_sync(repo, namespace, name).await {
            Ok(artifact) => ReconciliationOutcome::succeeded(&artifact),
            Err(error) => ReconciliationOutcome::failed(error),
        }
    }

    async fn try_sync(
        &self,
        repo: &GitRepository,
        namespace: &str,
        name: &str,
    ) -> Result<Artifact, SyncError> {
        let deadline = Deadline::after(self.timeout);

        let secret = match &repo.spec.secret_ref {
            Some(secret_ref) => Some(
                deadline
                    .wrap(self.secrets.read_secret(namespace, &secret_ref.name))
                    .await
                    .context(DeadlineSnafu { stage: Stage::Auth })?
                    .context(ReadSecretSnafu {
                        name: &secret_ref.name,
                    })?
                    .context(SecretNotFoundSnafu {
                        name: &secret_ref.name,
                    })?,
            ),
            None => None,
        };

        let reference = repo.spec.reference.clone().unwrap_or_default();
        let strategy = ReferenceStrategy::select(
            reference.branch(),
            reference.tag(),
            reference.semver(),
            reference.commit(),
        );
        debug!("Resolving {} of {}/{}", strategy, namespace, name);

        let url = repo.spec.url.clone();
        let engine = self.engine.clone();
        let scratch_root = self.scratch_root.clone();
        let scratch_prefix = format!("{namespace}-{name}-");
        let (scratch, commit) = deadline
            .run(move |cancel| -> Result<(TempDir, String), SyncError> {
                let scratch = tempfile::Builder::new()
                    .prefix(&scratch_prefix)
                    .tempdir_in(&scratch_root)
                    .context(ScratchDirSnafu)?;
                let credentials = auth::negotiate(&url, secret.as_ref(), scratch.path())
                    .context(NegotiateSnafu)?;
                let checkout_dir = scratch.path().join(CHECKOUT_DIR);
                fs::create_dir(&checkout_dir).context(ScratchDirSnafu)?;
                let commit = strategy
                    .checkout(engine.as_ref(), &url, &credentials, &checkout_dir, cancel)
                    .context(GitSnafu)?;
                Ok((scratch, commit))
            })
            .await
            .context(DeadlineSnafu { stage: Stage::Git })??;

        let artifact = self.storage.artifact_for(
            STORAGE_KIND,
            namespace,
            name,
            &format!("{commit}{ARCHIVE_SUFFIX}"),
        );
        let storage = self.storage.clone();
        let target = artifact.clone();
        deadline
            .run(move |cancel| -> Result<(), SyncError> {
                let source_dir = scratch.path().join(CHECKOUT_DIR);
                storage.ensure_dir(&target).context(StorageSnafu)?;
                let _lock = storage.lock(&target, cancel).context(StorageSnafu)?;
                if storage.exists(&target) {
                    debug!("Artifact {} already published", target.path.display());
                } else {
                    storage
                        .archive(&target, &source_dir, DEFAULT_EXCLUDES, cancel)
                        .context(StorageSnafu)?;
                }
                storage
                    .publish_alias(&target, LATEST_ALIAS)
                    .context(StorageSnafu)?;
                Ok(())
            })
            .await
            .context(DeadlineSnafu {
                stage: Stage::Storage,
            })??;

        Ok(artifact)
    }

    async fn write_status(&self, repo: &GitRepository, status: &GitRepositoryStatus) -> Result<()> {
        self.status
            .write_status(repo, status)
            .await
            .context(WriteStatusSnafu {
                name: repo.name_any(),
            })
    }
}
