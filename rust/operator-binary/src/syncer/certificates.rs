//! Syncs cert-manager Certificates.
//!
//! Certificates requested in the virtual cluster are copied to the host (forward sync).
//! Certificates that cert-manager's ingress-shim creates on the host for synced Ingresses are
//! copied back into the virtual cluster and marked with
//! [`constants::BACKWARD_SYNC_ANNOTATION`] (backward sync), the host copy stays authoritative
//! for these. The status always flows from host to virtual.

use async_trait::async_trait;
use snafu::ResultExt;
use stackable_operator::kube::{api::ObjectMeta, ResourceExt};
use tracing::debug;

use super::{
    fold_status, CreateHostSnafu, CreateVirtualSnafu, DeleteHostSnafu, DeleteVirtualSnafu,
    GetHostSnafu, Outcome, PatchHostSnafu, PatchVirtualSnafu, Result, SyncContext, Syncer,
};
use crate::{
    constants,
    external_crd::cert_manager::{Certificate, Issuer},
    patcher,
    plane::Plane,
    rewrite::rewrite_certificate_spec,
    translate::{self, Identity},
};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    /// The host copy is authoritative, the virtual copy lives at the contained identity.
    Backward(Identity),
}

pub struct CertificateSyncer;

impl CertificateSyncer {
    fn direction<P: Plane>(
        ctx: &SyncContext<P>,
        host: Option<&Certificate>,
        virtual_obj: Option<&Certificate>,
    ) -> Direction {
        if let Some(virtual_obj) = virtual_obj {
            if constants::is_backward_synced(virtual_obj.annotations()) {
                return Direction::Backward(Identity::from_meta(&virtual_obj.metadata));
            }
        }
        host.and_then(|host| ctx.ingresses.virtual_identity_for(&host.name_any()))
            .map_or(Direction::Forward, Direction::Backward)
    }

    fn host_certificate<P: Plane>(ctx: &SyncContext<P>, virtual_obj: &Certificate) -> Certificate {
        let namespace = virtual_obj.namespace().unwrap_or_default();
        Certificate {
            metadata: ctx.mapper.host_metadata(&virtual_obj.metadata, Self::KIND),
            spec: rewrite_certificate_spec(&virtual_obj.spec, &namespace, &ctx.mapper),
            status: None,
        }
    }

    /// Resolves the host name of a namespaced Issuer back to the name it has in `namespace`.
    async fn virtual_issuer_name<P: Plane>(
        ctx: &SyncContext<P>,
        host_name: &str,
        namespace: &str,
    ) -> Result<String> {
        if let Some(name) = ctx.mapper.decode_host_name(host_name, namespace) {
            return Ok(name);
        }
        let issuer = ctx
            .host_plane
            .get::<Issuer>(ctx.mapper.host_namespace(), host_name)
            .await
            .context(GetHostSnafu)?;
        Ok(issuer
            .and_then(|issuer| translate::virtual_identity(&issuer.metadata))
            .filter(|identity| identity.namespace == namespace)
            .map_or_else(|| host_name.to_string(), |identity| identity.name))
    }

    /// Projects the authoritative host copy into the virtual cluster.
    async fn virtual_certificate<P: Plane>(
        ctx: &SyncContext<P>,
        host: &Certificate,
        identity: &Identity,
    ) -> Result<Certificate> {
        let mut spec = host.spec.clone();
        spec.secret_name = identity.name.clone();
        if spec.issuer_ref.is_namespaced_issuer() && !spec.issuer_ref.name.is_empty() {
            spec.issuer_ref.name =
                Self::virtual_issuer_name(ctx, &spec.issuer_ref.name, &identity.namespace).await?;
        }
        let mut annotations = translate::virtual_annotations(host.metadata.annotations.as_ref());
        annotations.insert(
            constants::BACKWARD_SYNC_ANNOTATION.to_string(),
            "true".to_string(),
        );
        Ok(Certificate {
            metadata: ObjectMeta {
                name: Some(identity.name.clone()),
                namespace: Some(identity.namespace.clone()),
                labels: Some(translate::virtual_labels(host.metadata.labels.as_ref())),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec,
            status: None,
        })
    }
}

#[async_trait]
impl Syncer for CertificateSyncer {
    type Object = Certificate;

    const KIND: &'static str = "Certificate";

    async fn virtual_identity<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Certificate,
    ) -> Result<Option<Identity>> {
        Ok(translate::virtual_identity(&host.metadata)
            .or_else(|| ctx.ingresses.virtual_identity_for(&host.name_any())))
    }

    async fn sync_to_host<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        virtual_obj: &Certificate,
    ) -> Result<Outcome> {
        if constants::is_backward_synced(virtual_obj.annotations()) {
            // The host copy was the reason for this one to exist
            ctx.virtual_plane
                .delete::<Certificate>(
                    &virtual_obj.namespace().unwrap_or_default(),
                    &virtual_obj.name_any(),
                )
                .await
                .context(DeleteVirtualSnafu)?;
            return Ok(Outcome::DeletedVirtual);
        }
        match ctx
            .host_plane
            .create(&Self::host_certificate(ctx, virtual_obj))
            .await
        {
            Ok(_) => Ok(Outcome::CreatedHost),
            Err(err) if err.is_already_exists() => Ok(Outcome::Unchanged),
            Err(source) => Err(source).context(CreateHostSnafu),
        }
    }

    async fn sync<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Certificate,
        virtual_obj: &Certificate,
    ) -> Result<Outcome> {
        if let Some(outcome) = fold_status(
            ctx,
            host,
            virtual_obj,
            |certificate| &certificate.status,
            |certificate, status| certificate.status = status,
        )
        .await?
        {
            return Ok(outcome);
        }

        match Self::direction(ctx, Some(host), Some(virtual_obj)) {
            Direction::Backward(identity) => {
                let projected = Self::virtual_certificate(ctx, host, &identity).await?;
                let mut desired = virtual_obj.clone();
                desired.metadata.labels = projected.metadata.labels;
                desired.metadata.annotations = projected.metadata.annotations;
                desired.spec = projected.spec;
                let written = patcher::patch(&ctx.virtual_plane, virtual_obj, &desired)
                    .await
                    .context(PatchVirtualSnafu)?;
                Ok(written.map_or(Outcome::Unchanged, |_| Outcome::UpdatedVirtual))
            }
            Direction::Forward => {
                let translated = Self::host_certificate(ctx, virtual_obj);
                let mut desired = host.clone();
                desired.metadata.labels = translated.metadata.labels;
                desired.metadata.annotations = translated.metadata.annotations;
                desired.spec = translated.spec;
                let written = patcher::patch(&ctx.host_plane, host, &desired)
                    .await
                    .context(PatchHostSnafu)?;
                Ok(written.map_or(Outcome::Unchanged, |_| Outcome::UpdatedHost))
            }
        }
    }

    async fn sync_to_virtual<P: Plane>(
        &self,
        ctx: &SyncContext<P>,
        host: &Certificate,
    ) -> Result<Outcome> {
        if let Direction::Backward(identity) = Self::direction(ctx, Some(host), None) {
            let virtual_obj = Self::virtual_certificate(ctx, host, &identity).await?;
            return match ctx.virtual_plane.create(&virtual_obj).await {
                Ok(_) => Ok(Outcome::CreatedVirtual),
                Err(err) if err.is_already_exists() => Ok(Outcome::Unchanged),
                Err(source) => Err(source).context(CreateVirtualSnafu),
            };
        }
        if !ctx.mapper.is_managed(&host.metadata) {
            debug!(
                certificate = %Identity::from_meta(&host.metadata),
                "not deleting unmanaged host certificate"
            );
            return Ok(Outcome::Unchanged);
        }
        ctx.host_plane
            .delete::<Certificate>(&host.namespace().unwrap_or_default(), &host.name_any())
            .await
            .context(DeleteHostSnafu)?;
        Ok(Outcome::DeletedHost)
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::kube::Resource;

    use super::*;
    use crate::{
        external_crd::cert_manager::{CertificateStatus, IssuerSpec, ObjectReference},
        ingress::tests::shop_ingress,
        plane::memory::Op,
        syncer::{
            reconcile_host, reconcile_virtual,
            tests::{meta, parse, TestContext, HOST_NAMESPACE},
            SYNC_ERROR_REASON,
        },
    };

    fn virtual_certificate(issuer_kind: &str) -> Certificate {
        parse(&format!(
            r#"
            apiVersion: cert-manager.io/v1
            kind: Certificate
            metadata:
              name: web
              namespace: shop
              labels:
                app: web
            spec:
              secretName: web-tls
              dnsNames: [shop.example.com]
              issuerRef:
                name: letsencrypt
                kind: {issuer_kind}
            "#
        ))
    }

    async fn sync_virtual(test: &TestContext, namespace: &str, name: &str) -> Outcome {
        reconcile_virtual(&CertificateSyncer, &test.ctx, &Identity::new(namespace, name))
            .await
            .unwrap()
    }

    fn host_certificate(test: &TestContext, name: &str) -> Certificate {
        test.ctx
            .host_plane
            .object(HOST_NAMESPACE, name)
            .expect("host certificate should exist")
    }

    #[tokio::test]
    async fn forward_sync_rewrites_references() {
        let test = TestContext::new();
        test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));

        assert_eq!(sync_virtual(&test, "shop", "web").await, Outcome::CreatedHost);
        let host = host_certificate(&test, "web-x-shop-x-tenant-a");
        assert_eq!(host.spec.secret_name, "web-tls-x-shop-x-tenant-a");
        assert_eq!(host.spec.issuer_ref.name, "letsencrypt-x-shop-x-tenant-a");
        assert_eq!(host.spec.dns_names, vec!["shop.example.com".to_string()]);
        assert_eq!(host.labels()["app"], "web");
        assert_eq!(host.labels()[constants::MANAGED_BY_LABEL], "tenant-a");
        assert_eq!(host.annotations()[constants::NAME_ANNOTATION], "web");

        // Nothing changed, nothing to write
        test.clear_writes();
        assert_eq!(sync_virtual(&test, "shop", "web").await, Outcome::Unchanged);
        assert_eq!(test.write_count(), 0);
    }

    #[tokio::test]
    async fn cluster_issuer_names_are_kept() {
        let test = TestContext::new();
        test.ctx
            .virtual_plane
            .insert(virtual_certificate("ClusterIssuer"));
        sync_virtual(&test, "shop", "web").await;
        let host = host_certificate(&test, "web-x-shop-x-tenant-a");
        assert_eq!(host.spec.secret_name, "web-tls-x-shop-x-tenant-a");
        assert_eq!(host.spec.issuer_ref.name, "letsencrypt");
    }

    #[tokio::test]
    async fn spec_changes_are_patched_onto_the_host() {
        let test = TestContext::new();
        let mut certificate = test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));
        sync_virtual(&test, "shop", "web").await;

        certificate.spec.dns_names.push("www.example.com".to_string());
        certificate.spec.secret_name = "web-tls-2".to_string();
        test.ctx.virtual_plane.insert(certificate);
        test.clear_writes();
        assert_eq!(sync_virtual(&test, "shop", "web").await, Outcome::UpdatedHost);
        let host = host_certificate(&test, "web-x-shop-x-tenant-a");
        assert_eq!(host.spec.secret_name, "web-tls-2-x-shop-x-tenant-a");
        assert_eq!(host.spec.dns_names.len(), 2);
        assert_eq!(test.ctx.host_plane.writes().len(), 1);
    }

    #[tokio::test]
    async fn status_is_copied_before_anything_else() {
        let test = TestContext::new();
        let mut certificate = test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));
        sync_virtual(&test, "shop", "web").await;

        let mut host = host_certificate(&test, "web-x-shop-x-tenant-a");
        host.status = Some(CertificateStatus {
            fields: [("revision".to_string(), serde_json::json!(1))].into(),
        });
        test.ctx.host_plane.insert(host);
        certificate.spec.dns_names.push("www.example.com".to_string());
        test.ctx.virtual_plane.insert(certificate);
        test.clear_writes();

        assert_eq!(
            sync_virtual(&test, "shop", "web").await,
            Outcome::UpdatedVirtualStatus
        );
        assert!(test.ctx.host_plane.writes().is_empty());
        let virtual_obj: Certificate = test.ctx.virtual_plane.object("shop", "web").unwrap();
        assert_eq!(virtual_obj.status.unwrap().fields["revision"], 1);

        assert_eq!(sync_virtual(&test, "shop", "web").await, Outcome::UpdatedHost);
    }

    #[tokio::test]
    async fn managed_host_copies_are_deleted_with_their_virtual_certificate() {
        let test = TestContext::new();
        test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));
        sync_virtual(&test, "shop", "web").await;
        test.ctx.virtual_plane.delete::<Certificate>("shop", "web").await.unwrap();

        let host_identity = Identity::new(HOST_NAMESPACE, "web-x-shop-x-tenant-a");
        assert_eq!(
            reconcile_host(&CertificateSyncer, &test.ctx, &host_identity)
                .await
                .unwrap(),
            Outcome::DeletedHost
        );
        assert!(test
            .ctx
            .host_plane
            .object::<Certificate>(HOST_NAMESPACE, "web-x-shop-x-tenant-a")
            .is_none());
    }

    #[tokio::test]
    async fn unrelated_host_certificates_are_ignored() {
        let test = TestContext::new();
        test.ctx.host_plane.insert(Certificate {
            metadata: meta(HOST_NAMESPACE, "platform-tls"),
            spec: virtual_certificate("ClusterIssuer").spec,
            status: None,
        });
        let outcome = reconcile_host(
            &CertificateSyncer,
            &test.ctx,
            &Identity::new(HOST_NAMESPACE, "platform-tls"),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(test.write_count(), 0);
    }

    fn shim_certificate() -> Certificate {
        // As created by cert-manager's ingress-shim for the host copy of `shop_ingress`
        parse(
            r#"
            apiVersion: cert-manager.io/v1
            kind: Certificate
            metadata:
              name: ingress-tls-cert-x-shop-x-tenant-a
              namespace: vcluster-tenant-a
              labels:
                vcluster.loft.sh/managed-by: tenant-a
            spec:
              secretName: ingress-tls-cert-x-shop-x-tenant-a
              dnsNames: [shop.example.com]
              issuerRef:
                name: letsencrypt-x-shop-x-tenant-a
                kind: Issuer
                group: cert-manager.io
            "#,
        )
    }

    #[tokio::test]
    async fn ingress_certificates_are_synced_backwards() {
        let test = TestContext::with_ingresses(vec![shop_ingress()]);
        test.ctx.host_plane.insert(shim_certificate());

        let host_identity = Identity::new(HOST_NAMESPACE, "ingress-tls-cert-x-shop-x-tenant-a");
        assert_eq!(
            reconcile_host(&CertificateSyncer, &test.ctx, &host_identity)
                .await
                .unwrap(),
            Outcome::CreatedVirtual
        );
        let virtual_obj: Certificate = test
            .ctx
            .virtual_plane
            .object("shop", "ingress-tls-cert")
            .expect("virtual certificate should have been created");
        assert_eq!(virtual_obj.spec.secret_name, "ingress-tls-cert");
        assert_eq!(virtual_obj.spec.issuer_ref.name, "letsencrypt");
        assert_eq!(
            virtual_obj.annotations()[constants::BACKWARD_SYNC_ANNOTATION],
            "true"
        );
        assert!(!virtual_obj.labels().contains_key(constants::MANAGED_BY_LABEL));

        // The host copy stays authoritative
        test.clear_writes();
        assert_eq!(
            reconcile_virtual(
                &CertificateSyncer,
                &test.ctx,
                &Identity::new("shop", "ingress-tls-cert")
            )
            .await
            .unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(test.write_count(), 0);
        let mut host = host_certificate(&test, "ingress-tls-cert-x-shop-x-tenant-a");
        host.spec.dns_names.push("www.example.com".to_string());
        test.ctx.host_plane.insert(host);
        assert_eq!(
            sync_virtual(&test, "shop", "ingress-tls-cert").await,
            Outcome::UpdatedVirtual
        );
        let virtual_obj: Certificate = test
            .ctx
            .virtual_plane
            .object("shop", "ingress-tls-cert")
            .unwrap();
        assert_eq!(virtual_obj.spec.dns_names.len(), 2);

        // Once the host copy is gone, so is the virtual one
        test.ctx
            .host_plane
            .delete::<Certificate>(HOST_NAMESPACE, "ingress-tls-cert-x-shop-x-tenant-a")
            .await
            .unwrap();
        assert_eq!(
            sync_virtual(&test, "shop", "ingress-tls-cert").await,
            Outcome::DeletedVirtual
        );
    }

    #[tokio::test]
    async fn forward_then_backward_projection_round_trips() {
        let test = TestContext::new();
        let original = test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));
        sync_virtual(&test, "shop", "web").await;
        let host = host_certificate(&test, "web-x-shop-x-tenant-a");

        let projected = CertificateSyncer::virtual_certificate(
            &test.ctx,
            &host,
            &Identity::new("shop", &original.spec.secret_name),
        )
        .await
        .unwrap();
        assert_eq!(projected.spec.secret_name, original.spec.secret_name);
        assert_eq!(projected.spec.issuer_ref, original.spec.issuer_ref);
    }

    #[tokio::test]
    async fn hashed_issuer_names_are_resolved_through_the_host_issuer() {
        let test = TestContext::new();
        let issuer_name = "an-issuer-with-a-name-long-enough-to-need-shortening";
        let host_issuer_name = test.ctx.mapper.host_name(issuer_name, "shop");
        assert_eq!(
            test.ctx.mapper.decode_host_name(&host_issuer_name, "shop"),
            None
        );
        test.ctx.host_plane.insert(Issuer {
            metadata: test
                .ctx
                .mapper
                .host_metadata(&meta("shop", issuer_name), "Issuer"),
            spec: IssuerSpec::default(),
            status: None,
        });
        let mut host = shim_certificate();
        host.spec.issuer_ref = ObjectReference {
            name: host_issuer_name,
            kind: None,
            group: None,
        };
        let projected = CertificateSyncer::virtual_certificate(
            &test.ctx,
            &host,
            &Identity::new("shop", "ingress-tls-cert"),
        )
        .await
        .unwrap();
        assert_eq!(projected.spec.issuer_ref.name, issuer_name);
    }

    #[tokio::test]
    async fn failed_patches_are_reported_on_the_virtual_certificate() {
        let test = TestContext::new();
        let mut certificate = test.ctx.virtual_plane.insert(virtual_certificate("Issuer"));
        sync_virtual(&test, "shop", "web").await;
        certificate.spec.dns_names.push("www.example.com".to_string());
        let certificate = test.ctx.virtual_plane.insert(certificate);

        test.ctx.host_plane.fail_next::<Certificate>(Op::Replace);
        let err = reconcile_virtual(&CertificateSyncer, &test.ctx, &Identity::new("shop", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::syncer::Error::PatchHost { .. }));
        let events = test.recorded_events();
        assert_eq!(events.len(), 1);
        let (object, reason, note) = &events[0];
        assert_eq!(*object, certificate.object_ref(&()));
        assert_eq!(reason, SYNC_ERROR_REASON);
        assert!(note.starts_with("Error syncing: failed to patch host object"));
    }
}
