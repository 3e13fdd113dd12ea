use std::time::Duration;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

pub const APP_NAME: &str = "source-controller";

/// Lower-cased kind used to namespace artifacts in storage.
pub const STORAGE_KIND: &str = "gitrepository";

pub const FINALIZER: &str = "source.fluxcd.io/finalizer";

/// Changing the value of this annotation requests an immediate reconciliation.
pub const SYNC_AT_ANNOTATION: &str = "source.fluxcd.io/syncAt";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// GitRepositorySpec defines the desired state of a Git repository.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "source.fluxcd.io",
    version = "v1alpha1",
    plural = "gitrepositories",
    kind = "GitRepository",
    shortname = "gitrepo",
    status = "GitRepositoryStatus",
    namespaced,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// The repository URL, can be a HTTP or SSH address.
    pub url: String,

    /// The secret name containing the Git credentials.
    /// For HTTPS repositories the secret must contain username and password fields.
    /// For SSH repositories the secret must contain identity and known_hosts fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// The interval at which to check for repository updates, e.g. `1m` or `1h30m`.
    pub interval: String,

    /// The git reference to checkout and monitor for changes, defaults to master branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitRepositoryRef>,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SecretReference {
    /// Name of the secret, it must reside in the namespace of the GitRepository.
    pub name: String,
}

/// GitRepositoryRef defines the git ref used for pull and checkout operations.
///
/// Precedence, highest first: `commit`, `semver`, `tag`, `branch`, then the
/// default branch. `branch` also selects the branch fetched for a `commit`.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryRef {
    /// The git branch to checkout, defaults to master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// The git tag to checkout, takes precedence over branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// The git tag semver expression, takes precedence over tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,

    /// The git commit sha to checkout, if specified tag filters will be ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl GitRepositoryRef {
    pub fn branch(&self) -> Option<&str> {
        non_empty(&self.branch)
    }

    pub fn tag(&self) -> Option<&str> {
        non_empty(&self.tag)
    }

    pub fn semver(&self) -> Option<&str> {
        non_empty(&self.semver)
    }

    pub fn commit(&self) -> Option<&str> {
        non_empty(&self.commit)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryStatus {
    /// Conditions holds the single Ready condition of the repository.
    #[serde(default)]
    pub conditions: Vec<SourceCondition>,

    /// URL of the last successfully published artifact.
    ///
    /// Serialized even when empty so that a merge patch clears it on reset.
    #[serde(default)]
    pub artifact: Option<String>,

    /// Time of the last artifact change.
    #[serde(default)]
    pub last_update_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GitRepositoryStatus {
    /// Fresh status reported on first observation or after the artifact went missing.
    pub fn initializing() -> Self {
        Self {
            conditions: vec![SourceCondition::initializing()],
            ..Default::default()
        }
    }

    pub fn ready_condition(&self) -> Option<&SourceCondition> {
        self.conditions
            .iter()
            .find(|c| c.type_ == ConditionType::Ready)
    }

    /// File name of the advertised artifact, i.e. the last segment of its URL.
    pub fn artifact_filename(&self) -> Option<&str> {
        self.artifact
            .as_deref()
            .and_then(|url| url.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, IntoStaticStr, JsonSchema, PartialEq, Eq, Serialize,
)]
pub enum ConditionType {
    Ready,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, IntoStaticStr, JsonSchema, PartialEq, Eq, Serialize,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, IntoStaticStr, JsonSchema, PartialEq, Eq, Serialize,
)]
pub enum ConditionReason {
    /// Status has been reset and a first sync is pending.
    Initializing,
    /// Clone, fetch, checkout or reference resolution failed.
    GitOperationFailed,
    GitOperationSucceeded,
    /// Credentials were missing or incomplete.
    AuthenticationFailed,
    /// Scratch directory, lock, archive or alias publish failed.
    StorageOperationFailed,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: Time,
}

impl SourceCondition {
    pub fn ready(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(ConditionStatus::True, reason, message)
    }

    pub fn not_ready(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self::new(ConditionStatus::False, reason, message)
    }

    pub fn initializing() -> Self {
        Self::new(ConditionStatus::Unknown, ConditionReason::Initializing, "")
    }

    fn new(status: ConditionStatus, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: ConditionType::Ready,
            status,
            reason,
            message: message.into(),
            last_transition_time: Time(Utc::now()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

impl GitRepository {
    pub fn interval(&self) -> Duration {
        humantime::parse_duration(&self.spec.interval).unwrap_or(DEFAULT_INTERVAL)
    }

    pub fn interval_is_valid(&self) -> bool {
        humantime::parse_duration(&self.spec.interval).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    const REPOSITORY: &str = r#"
apiVersion: source.fluxcd.io/v1alpha1
kind: GitRepository
metadata:
  name: podinfo
  namespace: flux-system
spec:
  url: https://github.com/stefanprodan/podinfo
  interval: 1m30s
  secretRef:
    name: https-credentials
  reference:
    branch: main
    semver: ">=1.0.0 <2.0.0"
"#;

    #[test]
    fn test_deserialize_repository() -> Result<(), serde_yaml::Error> {
        let repo: GitRepository = serde_yaml::from_str(REPOSITORY)?;
        assert_eq!(repo.spec.url, "https://github.com/stefanprodan/podinfo");
        assert_eq!(repo.interval(), Duration::from_secs(90));
        assert_eq!(repo.spec.secret_ref.as_ref().map(|s| s.name.as_str()), Some("https-credentials"));

        let reference = repo.spec.reference.expect("reference is set");
        assert_eq!(reference.branch(), Some("main"));
        assert_eq!(reference.semver(), Some(">=1.0.0 <2.0.0"));
        assert_eq!(reference.tag(), None);
        assert!(repo.status.is_none());
        Ok(())
    }

    #[test]
    fn test_blank_reference_fields_are_unset() {
        let reference = GitRepositoryRef {
            branch: Some("  ".to_string()),
            commit: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(reference.branch(), None);
        assert_eq!(reference.commit(), None);
    }

    #[test]
    fn test_invalid_interval_falls_back_to_default() -> Result<(), serde_yaml::Error> {
        let mut repo: GitRepository = serde_yaml::from_str(REPOSITORY)?;
        repo.spec.interval = "every now and then".to_string();
        assert!(!repo.interval_is_valid());
        assert_eq!(repo.interval(), DEFAULT_INTERVAL);
        Ok(())
    }

    #[test]
    fn test_artifact_filename() {
        let status = GitRepositoryStatus {
            artifact: Some(
                "http://localhost:9090/gitrepository/flux-system/podinfo/6b7aab8a.tar.gz"
                    .to_string(),
            ),
            ..Default::default()
        };
        assert_eq!(status.artifact_filename(), Some("6b7aab8a.tar.gz"));
        assert_eq!(GitRepositoryStatus::default().artifact_filename(), None);
    }

    #[test]
    fn test_initializing_status_has_single_unknown_condition() {
        let status = GitRepositoryStatus::initializing();
        assert_eq!(status.conditions.len(), 1);
        let ready = status.ready_condition().expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, ConditionReason::Initializing);
        assert!(status.artifact.is_none());
    }

    #[test]
    fn test_status_serializes_cleared_artifact() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(GitRepositoryStatus::initializing())?;
        assert!(value.get("artifact").is_some_and(|v| v.is_null()));
        assert!(value.get("lastUpdateTime").is_some_and(|v| v.is_null()));
        assert_eq!(value["conditions"][0]["type"], "Ready");
        assert_eq!(value["conditions"][0]["reason"], "Initializing");
        Ok(())
    }

    #[test]
    fn test_crd_definition() {
        let crd = GitRepository::crd();
        assert_eq!(crd.spec.group, "source.fluxcd.io");
        assert_eq!(crd.spec.names.kind, "GitRepository");
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().is_some_and(|s| s.status.is_some()));
        assert_eq!(
            version.additional_printer_columns.as_ref().map(Vec::len),
            Some(4)
        );
    }
}
