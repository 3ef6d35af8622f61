//! Rewrites the object references embedded in cert-manager specs from virtual to host names.
//!
//! All references are namespace-local, so the namespace of the object that contains them is
//! enough to translate them. Inputs are never modified, the rewritten spec is returned as a copy.

use crate::{
    external_crd::cert_manager::{CertificateSpec, IssuerSpec, SecretNames},
    translate::IdentityMapper,
};

fn rewrite_name(name: &mut String, namespace: &str, mapper: &IdentityMapper) {
    if !name.is_empty() {
        *name = mapper.host_name(name, namespace);
    }
}

/// Translates the target secret, the issuer (unless it is cluster-scoped or external) and the
/// keystore password secrets of a virtual Certificate in `namespace`.
pub fn rewrite_certificate_spec(
    spec: &CertificateSpec,
    namespace: &str,
    mapper: &IdentityMapper,
) -> CertificateSpec {
    let mut spec = spec.clone();
    rewrite_name(&mut spec.secret_name, namespace, mapper);
    if spec.issuer_ref.is_namespaced_issuer() {
        rewrite_name(&mut spec.issuer_ref.name, namespace, mapper);
    }
    if let Some(keystores) = &mut spec.keystores {
        for password in [&mut keystores.jks, &mut keystores.pkcs12]
            .into_iter()
            .flatten()
            .filter_map(|keystore| keystore.password_secret_ref.as_mut())
        {
            rewrite_name(&mut password.name, namespace, mapper);
        }
    }
    spec
}

/// Translates every credential secret of every provider configured in a virtual Issuer.
pub fn rewrite_issuer_spec(
    spec: &IssuerSpec,
    namespace: &str,
    mapper: &IdentityMapper,
) -> IssuerSpec {
    let mut spec = spec.clone();
    for name in spec.secret_names_mut() {
        rewrite_name(name, namespace, mapper);
    }
    spec
}
