//! Syncs cert-manager Issuers, the virtual copy is always authoritative.

use async_trait::async_trait;
use snafu::ResultExt;
use stackable_operator::kube::ResourceExt;

use super::{
    fold_status, CreateHostSnafu, DeleteHostSnafu, Outcome, PatchHostSnafu, Result, SyncContext,
    Syncer,
};
use crate::{
    external_crd::cert_manager::Issuer, patcher, plane::Plane, rewrite::rewrite_issuer_spec,
};

pub struct IssuerSyncer;

impl IssuerSyncer {
    fn host_issuer<P: Plane>(ctx: &SyncContext<P>, virtual_obj: &Issuer) -> Issuer {
        let namespace = virtual_obj.namespace().unwrap_or_default();
        Issuer {
            metadata: ctx.mapper.host_metadata(&virtual_obj.metadata, Self::KIND),
            spec: rewrite_issuer_spec(&virtual_obj.spec, &namespace, &ctx.mapper),
            status: None,
        }
    }
}

#[async_trait]
impl Syncer for IssuerSyncer {
    type Object = Issuer;

    const KIND: &'static str = "Issuer";

    async fn sync_to_host<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        virtual_obj: &Issuer,
    ) -> Result<Outcome> {
        match ctx.host_plane.create(&Self::host_issuer(ctx, virtual_obj)).await {
            Ok(_) => Ok(Outcome::CreatedHost),
            Err(err) if err.is_already_exists() => Ok(Outcome::Unchanged),
            Err(source) => Err(source).context(CreateHostSnafu),
        }
    }

    async fn sync<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Issuer,
        virtual_obj: &Issuer,
    ) -> Result<Outcome> {
        if let Some(outcome) = fold_status(
            ctx,
            host,
            virtual_obj,
            |issuer| &issuer.status,
            |issuer, status| issuer.status = status,
        )
        .await?
        {
            return Ok(outcome);
        }

        let translated = Self::host_issuer(ctx, virtual_obj);
        let mut desired = host.clone();
        desired.metadata.labels = translated.metadata.labels;
        desired.metadata.annotations = translated.metadata.annotations;
        desired.spec = translated.spec;
        let written = patcher::patch(&ctx.host_plane, host, &desired)
            .await
            .context(PatchHostSnafu)?;
        Ok(written.map_or(Outcome::Unchanged, |_| Outcome::UpdatedHost))
    }

    async fn sync_to_virtual<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Issuer,
    ) -> Result<Outcome> {
        if !ctx.mapper.is_managed(&host.metadata) {
            return Ok(Outcome::Unchanged);
        }
        ctx.host_plane
            .delete::<Issuer>(&host.namespace().unwrap_or_default(), &host.name_any())
            .await
            .context(DeleteHostSnafu)?;
        Ok(Outcome::DeletedHost)
    }
}
