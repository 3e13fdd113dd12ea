use kube::{
    api::{Patch, PatchParams},
    Api, Client, Error, ResourceExt,
};
use serde_json::{json, Value};
use source_controller_crd::{GitRepository, FINALIZER};

pub(crate) fn has_finalizer(repo: &GitRepository) -> bool {
    repo.finalizers().iter().any(|f| f == FINALIZER)
}

/// Adds the controller's finalizer to a GitRepository, keeping any finalizer
/// owned by someone else.
///
/// # Arguments
///
/// * `client` - Kubernetes client to use for the API request
/// * `repo` - The GitRepository as last observed
/// * `namespace` - Namespace containing the GitRepository
pub(crate) async fn add(
    client: Client,
    repo: &GitRepository,
    namespace: &str,
) -> Result<GitRepository, Error> {
    let mut finalizers = repo.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(client, &repo.name_any(), namespace, &finalizers).await
}

/// Removes the controller's finalizer from a GitRepository, letting the
/// deletion proceed.
pub(crate) async fn delete(
    client: Client,
    repo: &GitRepository,
    namespace: &str,
) -> Result<GitRepository, Error> {
    let finalizers = without_own(repo.finalizers());
    patch_finalizers(client, &repo.name_any(), namespace, &finalizers).await
}

fn without_own(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect()
}

async fn patch_finalizers(
    client: Client,
    name: &str,
    namespace: &str,
    finalizers: &[String],
) -> Result<GitRepository, Error> {
    let api: Api<GitRepository> = Api::namespaced(client, namespace);
    let finalizer: Value = json!({
      "metadata": {
          "finalizers": finalizers
      }
    });

    let patch: Patch<&Value> = Patch::Merge(&finalizer);
    api.patch(name, &PatchParams::default(), &patch).await
}
