//! Bidirectional sync of cert-manager objects between the virtual and the host cluster.
//!
//! Each synced kind implements [`Syncer`]. The reconcile entry points fetch both copies of an
//! object and hand them to the syncer method matching which of them exist, so every syncer
//! only has to decide what to do for a given pair.

pub mod certificates;
pub mod issuers;
pub mod secrets;

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::ObjectReference,
    kube::{
        self,
        runtime::events::{Event, EventType, Recorder, Reporter},
        Resource,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    ingress::IngressIndex,
    patcher,
    plane::{self, Plane, PlaneObject},
    translate::{self, Identity, IdentityMapper},
    utils::error_full_message,
};

pub use certificates::CertificateSyncer;
pub use issuers::IssuerSyncer;
pub use secrets::SecretSyncer;

/// Reason of the warning event recorded when a pass fails.
pub const SYNC_ERROR_REASON: &str = "SyncError";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to get virtual object"))]
    GetVirtual { source: plane::Error },

    #[snafu(display("failed to get host object"))]
    GetHost { source: plane::Error },

    #[snafu(display("failed to list virtual objects"))]
    ListVirtual { source: plane::Error },

    #[snafu(display("failed to list host objects"))]
    ListHost { source: plane::Error },

    #[snafu(display("failed to create host object"))]
    CreateHost { source: plane::Error },

    #[snafu(display("failed to create virtual object"))]
    CreateVirtual { source: plane::Error },

    #[snafu(display("failed to update virtual object"))]
    UpdateVirtual { source: plane::Error },

    #[snafu(display("failed to update status of virtual object"))]
    UpdateVirtualStatus { source: plane::Error },

    #[snafu(display("failed to delete host object"))]
    DeleteHost { source: plane::Error },

    #[snafu(display("failed to delete virtual object"))]
    DeleteVirtual { source: plane::Error },

    #[snafu(display("failed to patch host object"))]
    PatchHost { source: patcher::Error },

    #[snafu(display("failed to patch virtual object"))]
    PatchVirtual { source: patcher::Error },

    #[snafu(display(
        "{}",
        errors.iter().map(|err| error_full_message(err)).collect::<Vec<_>>().join(", ")
    ))]
    Multiple { errors: Vec<Error> },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Combines the errors of independent steps that were all attempted.
pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
    match errors.pop() {
        None => Ok(()),
        Some(err) if errors.is_empty() => Err(err),
        Some(err) => {
            errors.push(err);
            Err(Error::Multiple { errors })
        }
    }
}

/// What a single pass did, mostly for logging and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    CreatedHost,
    UpdatedHost,
    DeletedHost,
    CreatedVirtual,
    UpdatedVirtual,
    /// Only the virtual status was written, the spec is looked at in the next pass.
    UpdatedVirtualStatus,
    DeletedVirtual,
    /// The virtual object was deleted and created again with the host's content.
    RecreatedVirtual,
    /// The controller label was claimed, the actual sync happens in the next pass.
    Claimed,
    Relinquished,
    /// Another controller owns the object.
    Deferred { owner: String },
}

impl Outcome {
    /// Whether the pass stopped early and expects another one.
    pub fn needs_followup(&self) -> bool {
        matches!(self, Outcome::UpdatedVirtualStatus | Outcome::Claimed)
    }
}

/// Best-effort reporting of problems on objects, failures must never fail a reconciliation.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn warning(&self, object: ObjectReference, reason: &str, note: String);
}

pub struct KubeEventSink {
    client: kube::Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: kube::Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn warning(&self, object: ObjectReference, reason: &str, note: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object);
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(
                reason,
                error = &err as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}

pub struct SyncContext<P> {
    pub virtual_plane: P,
    pub host_plane: P,
    pub mapper: IdentityMapper,
    pub ingresses: IngressIndex,
    pub events: Arc<dyn EventSink>,
}

/// Sync logic for one kind of object.
///
/// Exactly one method is called per pass, depending on which copies exist:
///
/// | virtual | host | method |
/// |---------|------|--------|
/// | yes     | no   | [`Syncer::sync_to_host`] |
/// | yes     | yes  | [`Syncer::sync`] |
/// | no      | yes  | [`Syncer::sync_to_virtual`] |
#[async_trait]
pub trait Syncer: Send + Sync {
    type Object: PlaneObject + PartialEq;

    const KIND: &'static str;

    /// The virtual object a host object belongs to, [`None`] if it doesn't belong to this vcluster.
    async fn virtual_identity<P: Plane>(
        &self,
        _ctx: &SyncContext<P>,
        host: &Self::Object,
    ) -> Result<Option<Identity>> {
        Ok(translate::virtual_identity(host.meta()))
    }

    async fn sync_to_host<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        virtual_obj: &Self::Object,
    ) -> Result<Outcome>;

    async fn sync<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Self::Object,
        virtual_obj: &Self::Object,
    ) -> Result<Outcome>;

    async fn sync_to_virtual<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Self::Object,
    ) -> Result<Outcome>;
}

/// Copies the host status into the virtual object if they differ.
///
/// Returns [`None`] if the statuses already match.
pub(crate) async fn fold_status<P, K, S>(
    ctx: &SyncContext<P>,
    host: &K,
    virtual_obj: &K,
    status: impl Fn(&K) -> &Option<S>,
    set_status: impl FnOnce(&mut K, Option<S>),
) -> Result<Option<Outcome>>
where
    P: Plane,
    K: PlaneObject,
    S: PartialEq + Clone,
{
    if status(host) == status(virtual_obj) {
        return Ok(None);
    }
    let mut updated = virtual_obj.clone();
    set_status(&mut updated, status(host).clone());
    ctx.virtual_plane
        .replace_status(&updated)
        .await
        .context(UpdateVirtualStatusSnafu)?;
    Ok(Some(Outcome::UpdatedVirtualStatus))
}

async fn dispatch<S: Syncer, P: Plane>(
    syncer: &S,
    ctx: &SyncContext<P>,
    host: Option<S::Object>,
    virtual_obj: Option<S::Object>,
) -> Result<Outcome> {
    let virtual_ref = virtual_obj.as_ref().map(|obj| obj.object_ref(&()));
    let result = match (host, virtual_obj) {
        (None, Some(virtual_obj)) => syncer.sync_to_host(ctx, &virtual_obj).await,
        (Some(host), Some(virtual_obj)) => syncer.sync(ctx, &host, &virtual_obj).await,
        (Some(host), None) => syncer.sync_to_virtual(ctx, &host).await,
        (None, None) => Ok(Outcome::Unchanged),
    };
    if let (Err(err), Some(virtual_ref)) = (&result, virtual_ref) {
        ctx.events
            .warning(
                virtual_ref,
                SYNC_ERROR_REASON,
                format!("Error syncing: {}", error_full_message(err)),
            )
            .await;
    }
    result
}

fn report<S: Syncer>(identity: &Identity, outcome: &Outcome) {
    match outcome {
        Outcome::Unchanged => debug!(kind = S::KIND, object = %identity, "already in sync"),
        Outcome::Deferred { owner } => debug!(
            kind = S::KIND,
            object = %identity,
            owner,
            "object is controlled by someone else, skipping"
        ),
        outcome => info!(kind = S::KIND, object = %identity, ?outcome, "synced"),
    }
}

/// Reconciles the virtual object `identity` and its host copy.
pub async fn reconcile_virtual<S: Syncer, P: Plane>(
    syncer: &S,
    ctx: &SyncContext<P>,
    identity: &Identity,
) -> Result<Outcome> {
    let host_identity = ctx.mapper.to_host(identity);
    let virtual_obj = ctx
        .virtual_plane
        .get::<S::Object>(&identity.namespace, &identity.name)
        .await
        .context(GetVirtualSnafu)?;
    let host = ctx
        .host_plane
        .get::<S::Object>(&host_identity.namespace, &host_identity.name)
        .await
        .context(GetHostSnafu)?;
    let outcome = dispatch(syncer, ctx, host, virtual_obj).await?;
    report::<S>(identity, &outcome);
    Ok(outcome)
}

/// Reconciles the host object `host_identity` if the virtual object it belongs to is missing.
///
/// Pairs where both copies exist belong to [`reconcile_virtual`], so that at most one pass works
/// on a pair at a time. Host objects that don't belong to this vcluster are left alone.
pub async fn reconcile_host<S: Syncer, P: Plane>(
    syncer: &S,
    ctx: &SyncContext<P>,
    host_identity: &Identity,
) -> Result<Outcome> {
    let Some(host) = ctx
        .host_plane
        .get::<S::Object>(&host_identity.namespace, &host_identity.name)
        .await
        .context(GetHostSnafu)?
    else {
        return Ok(Outcome::Unchanged);
    };
    let Some(identity) = syncer.virtual_identity(ctx, &host).await? else {
        debug!(
            kind = S::KIND,
            object = %host_identity,
            "host object is not synced by this vcluster"
        );
        return Ok(Outcome::Unchanged);
    };
    let virtual_obj = ctx
        .virtual_plane
        .get::<S::Object>(&identity.namespace, &identity.name)
        .await
        .context(GetVirtualSnafu)?;
    if virtual_obj.is_some() {
        debug!(
            kind = S::KIND,
            object = %identity,
            "virtual object exists, leaving the pair to its own pass"
        );
        return Ok(Outcome::Unchanged);
    }
    let outcome = dispatch(syncer, ctx, Some(host), None).await?;
    report::<S>(&identity, &outcome);
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use stackable_operator::{k8s_openapi::api::core::v1::ObjectReference, kube::api::ObjectMeta};

    use super::*;
    use crate::{ingress::IngressSource, plane::memory::MemoryPlane};

    pub const HOST_NAMESPACE: &str = "vcluster-tenant-a";

    #[derive(Default)]
    pub struct RecordedEvents {
        pub events: Mutex<Vec<(ObjectReference, String, String)>>,
    }

    #[async_trait]
    impl EventSink for RecordedEvents {
        async fn warning(&self, object: ObjectReference, reason: &str, note: String) {
            self.events
                .lock()
                .unwrap()
                .push((object, reason.to_string(), note));
        }
    }

    pub struct TestContext {
        pub ctx: SyncContext<MemoryPlane>,
        pub events: Arc<RecordedEvents>,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self::with_ingresses(Vec::new())
        }

        pub fn with_ingresses(
            ingresses: Vec<Arc<stackable_operator::k8s_openapi::api::networking::v1::Ingress>>,
        ) -> Self {
            let mapper = IdentityMapper::new(HOST_NAMESPACE, "tenant-a");
            let events = Arc::new(RecordedEvents::default());
            let source: Arc<dyn IngressSource> = Arc::new(ingresses);
            Self {
                ctx: SyncContext {
                    virtual_plane: MemoryPlane::new(),
                    host_plane: MemoryPlane::new(),
                    mapper: mapper.clone(),
                    ingresses: IngressIndex::new(source, mapper),
                    events: events.clone(),
                },
                events,
            }
        }

        pub fn clear_writes(&self) {
            self.ctx.virtual_plane.clear_writes();
            self.ctx.host_plane.clear_writes();
        }

        pub fn write_count(&self) -> usize {
            self.ctx.virtual_plane.writes().len() + self.ctx.host_plane.writes().len()
        }

        pub fn recorded_events(&self) -> Vec<(ObjectReference, String, String)> {
            self.events.events.lock().unwrap().clone()
        }
    }

    pub fn parse<T: serde::de::DeserializeOwned>(input: &str) -> T {
        let deserializer = serde_yaml::Deserializer::from_str(input);
        serde::Deserialize::deserialize(deserializer).unwrap()
    }

    pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn aggregate_keeps_every_error() {
        assert!(aggregate(Vec::new()).is_ok());
        let single = aggregate(vec![Error::ListVirtual {
            source: plane::Error::NoName {
                kind: "Issuer".to_string(),
                object: "shop/".to_string(),
            },
        }])
        .unwrap_err();
        assert!(matches!(single, Error::ListVirtual { .. }));

        let errors = vec![
            Error::ListVirtual {
                source: plane::Error::Injected {
                    kind: "Certificate".to_string(),
                    object: "shop".to_string(),
                },
            },
            Error::ListVirtual {
                source: plane::Error::Injected {
                    kind: "Issuer".to_string(),
                    object: "shop".to_string(),
                },
            },
        ];
        let multiple = aggregate(errors).unwrap_err();
        assert_eq!(
            multiple.to_string(),
            "failed to list virtual objects: injected failure for Certificate shop, \
             failed to list virtual objects: injected failure for Issuer shop"
        );
        assert_eq!(multiple.category(), "Multiple");
    }
}
