use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use artifact_storage::LocalStorage;
use git_client::Git2Engine;
use kube::{
    runtime::{controller::Action, events::EventType, events::Reporter},
    Client, Resource, ResourceExt,
};
use snafu::{OptionExt, ResultExt, Snafu};
use source_controller_crd::{GitRepository, SYNC_AT_ANNOTATION};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{info, warn};

use crate::{event, finalizer, reconciler, reconciler::Reconciler};

/// Delay before retrying a reconciliation whose status could not be written.
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed retrive namespace from resource: {}", name))]
    GitRepositoryMissingNamespace { name: String },

    #[snafu(display("Failed to add finalizer: {}", source))]
    AddFinalizer { source: kube::Error },

    #[snafu(display("Failed to delete finalizer: {}", source))]
    DeleteFinalizer { source: kube::Error },

    #[snafu(display("Failed to reconcile: {}", source))]
    Reconcile { source: reconciler::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Context injected with each `reconcile` and `error_policy` invocation.
pub struct ContextData {
    /// Kubernetes client, used for finalizers and events.
    client: Client,

    reporter: Reporter,
    reconciler: Reconciler<LocalStorage, Git2Engine>,
}

impl ContextData {
    pub fn new(
        client: Client,
        reporter: Reporter,
        reconciler: Reconciler<LocalStorage, Git2Engine>,
    ) -> Self {
        ContextData {
            client,
            reporter,
            reconciler,
        }
    }
}

/// Action to be taken upon a `GitRepository` during reconciliation
#[derive(Debug, PartialEq, Eq)]
enum RepositoryAction {
    /// First observation: add the finalizer, then sync
    Create,
    /// Remove every artifact and release the finalizer
    Delete,
    /// Sync with the remote
    Sync,
}

pub async fn reconcile(repo: Arc<GitRepository>, context: Arc<ContextData>) -> Result<Action> {
    let client = context.client.clone();
    let name = &repo.name_any();

    let namespace = repo
        .namespace()
        .context(GitRepositoryMissingNamespaceSnafu { name })?;

    match determine_action(&repo) {
        RepositoryAction::Delete => {
            if finalizer::has_finalizer(&repo) {
                context.reconciler.cleanup(&namespace, name).await;
                finalizer::delete(client, &repo, &namespace)
                    .await
                    .context(DeleteFinalizerSnafu)?;
                info!("Deleted finalizer from resource {}/{}", namespace, name);
            }
            return Ok(Action::await_change());
        }
        RepositoryAction::Create => {
            finalizer::add(client.clone(), &repo, &namespace)
                .await
                .context(AddFinalizerSnafu)?;
            info!("Added finalizer to resource {}/{}", namespace, name);
        }
        RepositoryAction::Sync => {}
    }

    if !repo.interval_is_valid() {
        warn!(
            "Invalid interval '{}' on {}/{}, using {}",
            repo.spec.interval,
            namespace,
            name,
            humantime::format_duration(repo.interval())
        );
    }

    let reconciled = context
        .reconciler
        .reconcile(&repo)
        .await
        .context(ReconcileSnafu)?;

    let notice = match (&reconciled.error, reconciled.new_artifact) {
        (Some(_), _) => reconciled.status.ready_condition().map(|condition| {
            let reason: &'static str = condition.reason.into();
            (EventType::Warning, reason, condition.message.clone())
        }),
        (None, true) => reconciled.status.artifact.clone().map(|artifact| {
            (
                EventType::Normal,
                "NewArtifact",
                format!("New artifact available at {artifact}"),
            )
        }),
        (None, false) => None,
    };
    if let Some((type_, reason, note)) = notice {
        if let Err(error) = event::publish_event(
            &repo,
            client,
            context.reporter.clone(),
            type_,
            reason,
            Some(note),
        )
        .await
        {
            warn!("Unable to publish event for {}/{}: {}", namespace, name, error);
        }
    }

    Ok(Action::requeue(repo.interval()))
}

/// Reached only when the status of the repository could not be read or
/// written; sync failures are reported through the status and requeued by
/// `reconcile` itself.
pub fn error_policy(repo: Arc<GitRepository>, error: &Error, _context: Arc<ContextData>) -> Action {
    let reason: &'static str = ErrorDiscriminants::from(error).into();
    warn!(
        reason,
        "Reconciliation of {}/{} failed: {}",
        repo.namespace().unwrap_or_default(),
        repo.name_any(),
        error
    );
    Action::requeue(ERROR_REQUEUE)
}

fn determine_action(repo: &GitRepository) -> RepositoryAction {
    if repo.meta().deletion_timestamp.is_some() {
        RepositoryAction::Delete
    } else if !finalizer::has_finalizer(repo) {
        RepositoryAction::Create
    } else {
        RepositoryAction::Sync
    }
}

/// Watch events pass only when this value changes: on spec changes, on a new
/// `syncAt` annotation and when deletion starts. Status writes are ignored.
pub fn source_changed(repo: &GitRepository) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    repo.meta().generation.hash(&mut hasher);
    repo.annotations().get(SYNC_AT_ANNOTATION).hash(&mut hasher);
    repo.meta().deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}
