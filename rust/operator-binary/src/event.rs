use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};
use snafu::{ResultExt, Snafu};
use source_controller_crd::GitRepository;
use strum::{EnumDiscriminants, IntoStaticStr};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to publish event: {}", source))]
    PublishEvent { source: kube::Error },
}

/// Publishes a Kubernetes event about `repo`.
pub async fn publish_event(
    repo: &GitRepository,
    client: Client,
    reporter: Reporter,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) -> Result<(), Error> {
    let recorder = Recorder::new(client, reporter, repo.object_ref(&()));
    recorder
        .publish(Event {
            action: "Reconcile".to_string(),
            reason: reason.to_string(),
            note,
            type_,
            secondary: None,
        })
        .await
        .context(PublishEventSnafu)
}
