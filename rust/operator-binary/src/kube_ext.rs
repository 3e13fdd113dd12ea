use std::collections::BTreeMap;

use async_trait::async_trait;
use git_client::SecretData;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use source_controller_crd::{GitRepository, GitRepositoryStatus};

use crate::reconciler::{SecretReader, StatusWriter};

/// Reads credential secrets through the Kubernetes API.
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecrets {
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretData>, kube::Error> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?;
        Ok(secret.map(|secret| secret_data(name, secret)))
    }
}

/// Flattens `stringData` and `data`, with `data` taking precedence.
fn secret_data(name: &str, secret: Secret) -> SecretData {
    let mut data = BTreeMap::new();
    data.extend(
        secret
            .string_data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.into_bytes())),
    );
    data.extend(
        secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0)),
    );
    SecretData {
        name: name.to_string(),
        data,
    }
}

/// Writes the status sub-resource with a JSON merge patch of the whole status.
pub struct KubeStatus {
    client: Client,
}

impl KubeStatus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatus {
    async fn write_status(
        &self,
        repo: &GitRepository,
        status: &GitRepositoryStatus,
    ) -> Result<(), kube::Error> {
        let namespace = repo.namespace().unwrap_or_default();
        let patch = json!({ "status": status });
        Api::<GitRepository>::namespaced(self.client.clone(), &namespace)
            .patch_status(&repo.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
