//! Syncs the Secrets that cert-manager objects depend on or produce.
//!
//! Secrets flow in both directions:
//!
//! - Credentials referenced by virtual Issuers and Certificates are copied to the host, but only
//!   while something references them and only while no other syncer controls the virtual Secret
//!   (see [`Ownership`]).
//! - Secrets issued by cert-manager on the host are copied back into the virtual cluster and marked
//!   as backward synced, the host copy stays authoritative for these.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future;
use snafu::ResultExt;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{api::ObjectMeta, ResourceExt},
};
use tracing::{debug, info};

use super::{
    aggregate, CreateHostSnafu, CreateVirtualSnafu, DeleteHostSnafu, DeleteVirtualSnafu,
    GetVirtualSnafu, ListHostSnafu, ListVirtualSnafu, Outcome, PatchHostSnafu, Result,
    SyncContext, Syncer, UpdateVirtualSnafu,
};
use crate::{
    constants,
    external_crd::cert_manager::{Certificate, Issuer},
    patcher,
    plane::Plane,
    translate::{self, Identity},
};

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const OPAQUE_TYPE: &str = "Opaque";

/// Who is in charge of syncing a virtual Secret, as recorded in [`constants::CONTROLLER_LABEL`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    Unclaimed,
    ClaimedBySelf,
    ClaimedByOther(String),
}

impl Ownership {
    pub fn observe(labels: Option<&BTreeMap<String, String>>) -> Self {
        match labels.and_then(|labels| labels.get(constants::CONTROLLER_LABEL)) {
            None => Ownership::Unclaimed,
            Some(owner) if owner.is_empty() => Ownership::Unclaimed,
            Some(owner) if owner == constants::PLUGIN_NAME => Ownership::ClaimedBySelf,
            Some(owner) => Ownership::ClaimedByOther(owner.clone()),
        }
    }

    /// Takes over unclaimed objects. Returns the new state and whether it has to be persisted.
    pub fn claim(self) -> (Self, bool) {
        match self {
            Ownership::Unclaimed => (Ownership::ClaimedBySelf, true),
            owned => (owned, false),
        }
    }

    /// Gives up control, objects owned by others stay untouched.
    pub fn relinquish(self) -> (Self, bool) {
        match self {
            Ownership::ClaimedBySelf => (Ownership::Unclaimed, true),
            other => (other, false),
        }
    }

    /// Records this state in `labels`.
    pub fn persist(&self, labels: &mut BTreeMap<String, String>) {
        match self {
            Ownership::Unclaimed => {
                labels.remove(constants::CONTROLLER_LABEL);
            }
            Ownership::ClaimedBySelf => {
                labels.insert(
                    constants::CONTROLLER_LABEL.to_string(),
                    constants::PLUGIN_NAME.to_string(),
                );
            }
            Ownership::ClaimedByOther(owner) => {
                labels.insert(constants::CONTROLLER_LABEL.to_string(), owner.clone());
            }
        }
    }
}

pub struct SecretSyncer;

impl SecretSyncer {
    /// Whether some virtual Certificate or Issuer reads `secret`.
    async fn is_referenced<P: Plane>(ctx: &SyncContext<P>, secret: &Secret) -> Result<bool> {
        let namespace = secret.namespace().unwrap_or_default();
        let name = secret.name_any();
        let (certificates, issuers) = future::join(
            ctx.virtual_plane.list::<Certificate>(&namespace),
            ctx.virtual_plane.list::<Issuer>(&namespace),
        )
        .await;
        let mut errors = Vec::new();
        let certificates = certificates.context(ListVirtualSnafu).unwrap_or_else(|err| {
            errors.push(err);
            Vec::new()
        });
        let issuers = issuers.context(ListVirtualSnafu).unwrap_or_else(|err| {
            errors.push(err);
            Vec::new()
        });
        aggregate(errors)?;
        Ok(certificates
            .iter()
            .flat_map(|certificate| certificate.spec.referenced_secrets())
            .chain(issuers.iter().flat_map(|issuer| issuer.spec.referenced_secrets()))
            .any(|referenced| referenced == name))
    }

    /// The virtual identity of a Secret that is synced from the host, if it is one.
    async fn backward_identity<P: Plane>(
        ctx: &SyncContext<P>,
        host: Option<&Secret>,
        virtual_obj: Option<&Secret>,
    ) -> Result<Option<Identity>> {
        if let Some(virtual_obj) = virtual_obj {
            if constants::is_backward_synced(virtual_obj.annotations()) {
                return Ok(Some(Identity::from_meta(&virtual_obj.metadata)));
            }
        }
        let Some(host) = host else {
            return Ok(None);
        };
        let host_name = host.name_any();
        if let Some(identity) = ctx.ingresses.virtual_identity_for(&host_name) {
            return Ok(Some(identity));
        }
        Self::issued_for_virtual_certificate(ctx, &host_name).await
    }

    /// Finds the virtual Certificate whose host copy writes into the host Secret `host_name`.
    async fn issued_for_virtual_certificate<P: Plane>(
        ctx: &SyncContext<P>,
        host_name: &str,
    ) -> Result<Option<Identity>> {
        let host_certificates = ctx
            .host_plane
            .list::<Certificate>(ctx.mapper.host_namespace())
            .await
            .context(ListHostSnafu)?;
        for host_certificate in host_certificates
            .iter()
            .filter(|certificate| certificate.spec.secret_name == host_name)
        {
            let Some(certificate) = translate::virtual_identity(&host_certificate.metadata) else {
                continue;
            };
            let virtual_certificate = ctx
                .virtual_plane
                .get::<Certificate>(&certificate.namespace, &certificate.name)
                .await
                .context(GetVirtualSnafu)?;
            if let Some(virtual_certificate) = virtual_certificate {
                return Ok(Some(Identity::new(
                    certificate.namespace,
                    virtual_certificate.spec.secret_name,
                )));
            }
        }
        Ok(None)
    }

    fn host_secret<P: Plane>(ctx: &SyncContext<P>, virtual_obj: &Secret) -> Secret {
        let type_ = match virtual_obj.type_.as_deref() {
            // The host would bind these to a ServiceAccount of the same name
            Some(SERVICE_ACCOUNT_TOKEN_TYPE) => Some(OPAQUE_TYPE.to_string()),
            other => other.map(str::to_string),
        };
        Secret {
            metadata: ctx.mapper.host_metadata(&virtual_obj.metadata, Self::KIND),
            data: virtual_obj.data.clone(),
            string_data: virtual_obj.string_data.clone(),
            type_,
            ..Secret::default()
        }
    }

    fn virtual_secret(host: &Secret, identity: &Identity) -> Secret {
        let mut labels = translate::virtual_labels(host.metadata.labels.as_ref());
        Ownership::ClaimedBySelf.persist(&mut labels);
        let mut annotations = translate::virtual_annotations(host.metadata.annotations.as_ref());
        annotations.insert(
            constants::BACKWARD_SYNC_ANNOTATION.to_string(),
            "true".to_string(),
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(identity.name.clone()),
                namespace: Some(identity.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            data: host.data.clone(),
            type_: host.type_.clone(),
            ..Secret::default()
        }
    }

    /// Replaces the virtual Secret if the host issued a new one.
    async fn sync_backward<P: Plane>(
        ctx: &SyncContext<P>,
        host: &Secret,
        virtual_obj: &Secret,
    ) -> Result<Outcome> {
        if virtual_obj.data == host.data && virtual_obj.type_ == host.type_ {
            return Ok(Outcome::Unchanged);
        }
        let mut projected = virtual_obj.clone();
        projected.data = host.data.clone();
        projected.type_ = host.type_.clone();
        projected.metadata.resource_version = None;
        projected.metadata.uid = None;
        projected.metadata.creation_timestamp = None;
        projected.metadata.managed_fields = None;

        let namespace = virtual_obj.namespace().unwrap_or_default();
        let name = virtual_obj.name_any();
        info!(
            secret = %Identity::new(&namespace, &name),
            "host issued a new secret, recreating virtual copy"
        );
        ctx.virtual_plane
            .delete::<Secret>(&namespace, &name)
            .await
            .context(DeleteVirtualSnafu)?;
        ctx.virtual_plane
            .create(&projected)
            .await
            .context(CreateVirtualSnafu)?;
        Ok(Outcome::RecreatedVirtual)
    }

    async fn remove_controller<P: Plane>(
        ctx: &SyncContext<P>,
        virtual_obj: &Secret,
    ) -> Result<Outcome> {
        let (ownership, changed) =
            Ownership::observe(virtual_obj.metadata.labels.as_ref()).relinquish();
        if !changed {
            return Ok(Outcome::Unchanged);
        }
        let mut updated = virtual_obj.clone();
        ownership.persist(updated.labels_mut());
        ctx.virtual_plane
            .replace(&updated)
            .await
            .context(UpdateVirtualSnafu)?;
        Ok(Outcome::Relinquished)
    }

    /// Ensures the host copy of a virtual Secret that the virtual cluster is authoritative for.
    async fn sync_forward<P: Plane>(
        ctx: &SyncContext<P>,
        host: Option<&Secret>,
        virtual_obj: &Secret,
    ) -> Result<Outcome> {
        if !Self::is_referenced(ctx, virtual_obj).await? {
            return Self::remove_controller(ctx, virtual_obj).await;
        }

        match Ownership::observe(virtual_obj.metadata.labels.as_ref()).claim() {
            (Ownership::ClaimedByOther(owner), _) => return Ok(Outcome::Deferred { owner }),
            (ownership, true) => {
                let mut claimed = virtual_obj.clone();
                ownership.persist(claimed.labels_mut());
                ctx.virtual_plane
                    .replace(&claimed)
                    .await
                    .context(UpdateVirtualSnafu)?;
                return Ok(Outcome::Claimed);
            }
            (_, false) => {}
        }

        let translated = Self::host_secret(ctx, virtual_obj);
        let Some(host) = host else {
            return match ctx.host_plane.create(&translated).await {
                Ok(_) => Ok(Outcome::CreatedHost),
                Err(err) if err.is_already_exists() => Ok(Outcome::Unchanged),
                Err(source) => Err(source).context(CreateHostSnafu),
            };
        };
        let mut desired = host.clone();
        desired.data = translated.data;
        desired.string_data = translated.string_data;
        desired.type_ = translated.type_;
        desired.metadata.labels = translated.metadata.labels;
        desired.metadata.annotations = translated.metadata.annotations;
        let written = patcher::patch(&ctx.host_plane, host, &desired)
            .await
            .context(PatchHostSnafu)?;
        Ok(written.map_or(Outcome::Unchanged, |_| Outcome::UpdatedHost))
    }
}

#[async_trait]
impl Syncer for SecretSyncer {
    type Object = Secret;

    const KIND: &'static str = "Secret";

    async fn virtual_identity<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Secret,
    ) -> Result<Option<Identity>> {
        match translate::virtual_identity(&host.metadata) {
            Some(identity) => Ok(Some(identity)),
            None => Self::backward_identity(ctx, Some(host), None).await,
        }
    }

    async fn sync_to_host<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        virtual_obj: &Secret,
    ) -> Result<Outcome> {
        if constants::is_backward_synced(virtual_obj.annotations()) {
            ctx.virtual_plane
                .delete::<Secret>(
                    &virtual_obj.namespace().unwrap_or_default(),
                    &virtual_obj.name_any(),
                )
                .await
                .context(DeleteVirtualSnafu)?;
            return Ok(Outcome::DeletedVirtual);
        }
        Self::sync_forward(ctx, None, virtual_obj).await
    }

    async fn sync<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Secret,
        virtual_obj: &Secret,
    ) -> Result<Outcome> {
        if Self::backward_identity(ctx, Some(host), Some(virtual_obj))
            .await?
            .is_some()
        {
            return Self::sync_backward(ctx, host, virtual_obj).await;
        }
        Self::sync_forward(ctx, Some(host), virtual_obj).await
    }

    async fn sync_to_virtual<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Secret,
    ) -> Result<Outcome> {
        if let Some(identity) = Self::backward_identity(ctx, Some(host), None).await? {
            return match ctx
                .virtual_plane
                .create(&Self::virtual_secret(host, &identity))
                .await
            {
                Ok(_) => Ok(Outcome::CreatedVirtual),
                Err(err) if err.is_already_exists() => Ok(Outcome::Unchanged),
                Err(source) => Err(source).context(CreateVirtualSnafu),
            };
        }
        if !ctx.mapper.is_managed(&host.metadata) {
            debug!(
                secret = %Identity::from_meta(&host.metadata),
                "not deleting unmanaged host secret"
            );
            return Ok(Outcome::Unchanged);
        }
        ctx.host_plane
            .delete::<Secret>(&host.namespace().unwrap_or_default(), &host.name_any())
            .await
            .context(DeleteHostSnafu)?;
        Ok(Outcome::DeletedHost)
    }
}
