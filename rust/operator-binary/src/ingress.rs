//! Index of the Certificates that cert-manager's ingress-shim creates for virtual Ingresses.
//!
//! The shim runs against the host copies of Ingresses, so the Certificates it creates only exist
//! on the host and their names carry no tracking annotations. The virtual Ingress that caused
//! them is the only way back to a virtual identity.

use std::sync::Arc;

use stackable_operator::{
    k8s_openapi::api::networking::v1::Ingress,
    kube::{runtime::reflector, ResourceExt},
};

use crate::{
    constants,
    translate::{Identity, IdentityMapper},
};

/// Current view of the virtual Ingresses.
pub trait IngressSource: Send + Sync {
    fn ingresses(&self) -> Vec<Arc<Ingress>>;
}

impl IngressSource for reflector::Store<Ingress> {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.state()
    }
}

impl IngressSource for Vec<Arc<Ingress>> {
    fn ingresses(&self) -> Vec<Arc<Ingress>> {
        self.clone()
    }
}

fn requests_certificates(ingress: &Ingress) -> bool {
    let annotations = ingress.annotations();
    [
        constants::ISSUER_ANNOTATION,
        constants::CLUSTER_ISSUER_ANNOTATION,
    ]
    .iter()
    .any(|key| annotations.get(*key).is_some_and(|value| !value.is_empty()))
}

/// Virtual `(namespace, secretName)` of every TLS entry that the shim will issue a Certificate for.
pub fn implied_certificates(ingress: &Ingress) -> Vec<Identity> {
    if !requests_certificates(ingress) {
        return Vec::new();
    }
    let namespace = ingress.namespace().unwrap_or_default();
    ingress
        .spec
        .iter()
        .flat_map(|spec| spec.tls.iter().flatten())
        .filter_map(|tls| tls.secret_name.as_deref())
        .filter(|secret_name| !secret_name.is_empty())
        .map(|secret_name| Identity::new(&namespace, secret_name))
        .collect()
}

/// Index keys of an Ingress: the host name and the `namespace/name` composite of each implied
/// Certificate.
pub fn certificate_names_from_ingress(ingress: &Ingress, mapper: &IdentityMapper) -> Vec<String> {
    implied_certificates(ingress)
        .into_iter()
        .flat_map(|certificate| {
            [
                mapper.host_name(&certificate.name, &certificate.namespace),
                certificate.composite(),
            ]
        })
        .collect()
}

#[derive(Clone)]
pub struct IngressIndex {
    source: Arc<dyn IngressSource>,
    mapper: IdentityMapper,
}

impl IngressIndex {
    pub fn new(source: Arc<dyn IngressSource>, mapper: IdentityMapper) -> Self {
        Self { source, mapper }
    }

    /// All virtual Ingresses that imply a Certificate under `key`.
    pub fn lookup(&self, key: &str) -> Vec<Arc<Ingress>> {
        self.source
            .ingresses()
            .into_iter()
            .filter(|ingress| {
                certificate_names_from_ingress(ingress, &self.mapper)
                    .iter()
                    .any(|name| name == key)
            })
            .collect()
    }

    /// Recovers the virtual identity of a host Certificate (or its Secret) created for an Ingress.
    pub fn virtual_identity_for(&self, host_name: &str) -> Option<Identity> {
        self.lookup(host_name)
            .iter()
            .flat_map(|ingress| implied_certificates(ingress))
            .find(|certificate| {
                self.mapper.host_name(&certificate.name, &certificate.namespace) == host_name
            })
    }

    /// The virtual Ingress at `identity`, if it is known.
    pub fn virtual_ingress(&self, identity: &Identity) -> Option<Arc<Ingress>> {
        self.source
            .ingresses()
            .into_iter()
            .find(|ingress| Identity::from_meta(&ingress.metadata) == *identity)
    }

    /// Host identities of the Certificates implied by `ingress`.
    pub fn host_certificates(&self, ingress: &Ingress) -> Vec<Identity> {
        implied_certificates(ingress)
            .iter()
            .map(|certificate| self.mapper.to_host(certificate))
            .collect()
    }
}
