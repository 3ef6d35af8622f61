//! Mutations applied to objects that vcluster itself syncs to the host cluster.
//!
//! vcluster translates Ingresses on its own, the plugin only fixes up the issuer annotation so
//! that cert-manager's ingress-shim on the host finds the translated Issuer.

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{core::v1::Secret, networking::v1::Ingress},
    kube::ResourceExt,
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    constants,
    external_crd::cert_manager::{Certificate, Issuer},
    patcher,
    plane::Plane,
    translate::IdentityMapper,
};

/// The object kinds a [`ClientHook`] can be registered for.
#[derive(Clone, Debug, PartialEq)]
pub enum HookObject {
    Ingress(Box<Ingress>),
    Certificate(Box<Certificate>),
    Issuer(Box<Issuer>),
    Secret(Box<Secret>),
}

impl HookObject {
    pub fn kind(&self) -> &'static str {
        match self {
            HookObject::Ingress(_) => "Ingress",
            HookObject::Certificate(_) => "Certificate",
            HookObject::Issuer(_) => "Issuer",
            HookObject::Secret(_) => "Secret",
        }
    }
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("hook {hook} only handles {expected} objects, got a {actual}"))]
    UnexpectedKind {
        hook: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[snafu(display("failed to store the mutated host Ingress"))]
    Patch { source: patcher::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Rewrites host objects of one kind before vcluster creates or updates them.
pub trait ClientHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn mutate_create_physical(&self, obj: HookObject) -> Result<HookObject>;

    fn mutate_update_physical(&self, obj: HookObject) -> Result<HookObject>;
}

pub struct IngressHook {
    mapper: IdentityMapper,
}

impl IngressHook {
    pub const NAME: &'static str = "ingress-hook-cert-manager";

    pub fn new(mapper: IdentityMapper) -> Self {
        Self { mapper }
    }

    fn mutate(&self, obj: HookObject) -> Result<HookObject> {
        let mut ingress = match obj {
            HookObject::Ingress(ingress) => ingress,
            other @ (HookObject::Certificate(_)
            | HookObject::Issuer(_)
            | HookObject::Secret(_)) => {
                return UnexpectedKindSnafu {
                    hook: Self::NAME,
                    expected: "Ingress",
                    actual: other.kind(),
                }
                .fail()
            }
        };
        if let Some(annotations) = &mut ingress.metadata.annotations {
            let virtual_namespace = annotations.get(constants::NAMESPACE_ANNOTATION).cloned();
            if let (Some(issuer), Some(namespace)) = (
                annotations.get_mut(constants::ISSUER_ANNOTATION),
                virtual_namespace,
            ) {
                if !issuer.is_empty() {
                    *issuer = self.mapper.host_name(issuer, &namespace);
                }
            }
        }
        Ok(HookObject::Ingress(ingress))
    }
}

impl ClientHook for IngressHook {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mutate_create_physical(&self, obj: HookObject) -> Result<HookObject> {
        self.mutate(obj)
    }

    fn mutate_update_physical(&self, obj: HookObject) -> Result<HookObject> {
        self.mutate(obj)
    }
}

/// Runs `hook` over the host copy of `virtual_ingress` and writes back the result.
///
/// vcluster may have written the host copy before, so the issuer annotation is first reset to the
/// virtual value, which is what the hook sees when vcluster itself calls it. Returns whether the
/// host copy changed.
pub async fn apply_to_host<H, P>(
    hook: &H,
    plane: &P,
    host: &Ingress,
    virtual_ingress: &Ingress,
) -> Result<bool>
where
    H: ClientHook + ?Sized,
    P: Plane,
{
    let Some(issuer) = virtual_ingress
        .annotations()
        .get(constants::ISSUER_ANNOTATION)
        .cloned()
    else {
        return Ok(false);
    };
    let mut physical = host.clone();
    physical
        .annotations_mut()
        .insert(constants::ISSUER_ANNOTATION.to_string(), issuer);
    let mutated = match hook.mutate_update_physical(HookObject::Ingress(Box::new(physical)))? {
        HookObject::Ingress(ingress) => ingress,
        other => {
            return UnexpectedKindSnafu {
                hook: hook.name(),
                expected: "Ingress",
                actual: other.kind(),
            }
            .fail()
        }
    };
    let written = patcher::patch(plane, host, mutated.as_ref())
        .await
        .context(PatchSnafu)?;
    Ok(written.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::memory::MemoryPlane;

    fn hook() -> IngressHook {
        IngressHook::new(IdentityMapper::new("vcluster-tenant-a", "tenant-a"))
    }

    fn host_ingress(annotations: &str) -> HookObject {
        let deserializer = serde_yaml::Deserializer::from_str(&format!(
            r#"
            apiVersion: networking.k8s.io/v1
            kind: Ingress
            metadata:
              name: shop-x-shop-x-tenant-a
              namespace: vcluster-tenant-a
              annotations: {annotations}
            "#
        ));
        HookObject::Ingress(Box::new(
            serde::Deserialize::deserialize(deserializer).unwrap(),
        ))
    }

    fn issuer_annotation(obj: &HookObject) -> Option<String> {
        match obj {
            HookObject::Ingress(ingress) => ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(constants::ISSUER_ANNOTATION).cloned()),
            _ => panic!("expected an Ingress"),
        }
    }

    #[test]
    fn issuer_annotation_is_translated() {
        let obj = host_ingress(
            r#"{"cert-manager.io/issuer": "letsencrypt", "vcluster.loft.sh/object-namespace": "shop"}"#,
        );
        for mutated in [
            hook().mutate_create_physical(obj.clone()).unwrap(),
            hook().mutate_update_physical(obj).unwrap(),
        ] {
            assert_eq!(
                issuer_annotation(&mutated).as_deref(),
                Some("letsencrypt-x-shop-x-tenant-a")
            );
        }
    }

    #[test]
    fn cluster_issuers_and_untracked_ingresses_are_unchanged() {
        let cluster_issuer = host_ingress(
            r#"{"cert-manager.io/cluster-issuer": "letsencrypt", "vcluster.loft.sh/object-namespace": "shop"}"#,
        );
        assert_eq!(
            hook().mutate_create_physical(cluster_issuer.clone()).unwrap(),
            cluster_issuer
        );
        let untracked = host_ingress(r#"{"cert-manager.io/issuer": "letsencrypt"}"#);
        assert_eq!(
            hook().mutate_create_physical(untracked.clone()).unwrap(),
            untracked
        );
    }

    fn ingress_yaml(namespace: &str, name: &str, annotations: &str) -> Ingress {
        let deserializer = serde_yaml::Deserializer::from_str(&format!(
            r#"
            apiVersion: networking.k8s.io/v1
            kind: Ingress
            metadata:
              name: {name}
              namespace: {namespace}
              annotations: {annotations}
            "#
        ));
        serde::Deserialize::deserialize(deserializer).unwrap()
    }

    fn host_issuer(plane: &MemoryPlane) -> Option<String> {
        plane
            .object::<Ingress>("vcluster-tenant-a", "shop-x-shop-x-tenant-a")
            .unwrap()
            .annotations()
            .get(constants::ISSUER_ANNOTATION)
            .cloned()
    }

    #[tokio::test]
    async fn host_ingresses_get_the_translated_issuer_once() {
        let plane = MemoryPlane::new();
        let virtual_ingress =
            ingress_yaml("shop", "shop", r#"{"cert-manager.io/issuer": "letsencrypt"}"#);
        // vcluster copies the annotations verbatim
        plane.insert(ingress_yaml(
            "vcluster-tenant-a",
            "shop-x-shop-x-tenant-a",
            r#"{"cert-manager.io/issuer": "letsencrypt", "vcluster.loft.sh/object-namespace": "shop"}"#,
        ));

        for expect_write in [true, false] {
            let host: Ingress = plane
                .object("vcluster-tenant-a", "shop-x-shop-x-tenant-a")
                .unwrap();
            assert_eq!(
                apply_to_host(&hook(), &plane, &host, &virtual_ingress)
                    .await
                    .unwrap(),
                expect_write
            );
            assert_eq!(
                host_issuer(&plane).as_deref(),
                Some("letsencrypt-x-shop-x-tenant-a")
            );
        }
        assert_eq!(plane.writes().len(), 1);
    }

    #[tokio::test]
    async fn ingresses_without_issuer_are_not_written() {
        let plane = MemoryPlane::new();
        let virtual_ingress = ingress_yaml(
            "shop",
            "shop",
            r#"{"cert-manager.io/cluster-issuer": "letsencrypt"}"#,
        );
        let host = plane.insert(ingress_yaml(
            "vcluster-tenant-a",
            "shop-x-shop-x-tenant-a",
            r#"{"cert-manager.io/cluster-issuer": "letsencrypt", "vcluster.loft.sh/object-namespace": "shop"}"#,
        ));
        assert!(!apply_to_host(&hook(), &plane, &host, &virtual_ingress)
            .await
            .unwrap());
        assert!(plane.writes().is_empty());
        assert_eq!(host_issuer(&plane), None);
    }

    #[test]
    fn other_kinds_are_rejected() {
        let err = hook()
            .mutate_create_physical(HookObject::Secret(Box::default()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "hook ingress-hook-cert-manager only handles Ingress objects, got a Secret"
        );
        assert_eq!(hook().name(), "ingress-hook-cert-manager");
    }
}
