//! CRDs owned by [cert-manager](https://cert-manager.io/),
//! see [their API docs](https://cert-manager.io/docs/reference/api-docs/).
//!
//! Only the fields that reference other objects are modelled, everything else is carried along
//! verbatim in the `other` maps so that copying an object between clusters never loses data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::kube::CustomResource;

/// Fields not modelled explicitly.
pub type UnknownFields = BTreeMap<String, serde_json::Value>;

pub const ISSUER_KIND: &str = "Issuer";
pub const CLUSTER_ISSUER_KIND: &str = "ClusterIssuer";
pub const GROUP: &str = "cert-manager.io";

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.Certificate>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced,
    derive = "PartialEq",
    status = "CertificateStatus",
    schema = "disabled",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub issuer_ref: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystores: Option<CertificateKeystores>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

/// Owned by cert-manager, only ever copied.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CertificateStatus {
    #[serde(flatten)]
    pub fields: UnknownFields,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateKeystores>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateKeystores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jks: Option<Keystore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs12: Option<Keystore>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

/// Shared shape of the JKS and PKCS#12 keystore options.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Keystore {
    #[serde(default)]
    pub create: bool,
    /// Unset when the keystore uses a literal `password` instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ObjectReference {
    /// Whether this refers to a namespaced cert-manager `Issuer`.
    ///
    /// cert-manager treats a missing kind as `Issuer`, and issuers of other API groups are
    /// external issuers that this plugin does not sync.
    pub fn is_namespaced_issuer(&self) -> bool {
        let kind_is_issuer = match self.kind.as_deref() {
            None | Some("") => true,
            Some(kind) => kind == ISSUER_KIND,
        };
        let group_is_cert_manager = match self.group.as_deref() {
            None | Some("") => true,
            Some(group) => group == GROUP,
        };
        kind_is_issuer && group_is_cert_manager
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.SecretKeySelector>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.LocalObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    #[serde(default)]
    pub name: String,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.Issuer>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Issuer",
    namespaced,
    derive = "PartialEq",
    status = "IssuerStatus",
    schema = "disabled",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeIssuer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultIssuer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venafi: Option<VenafiIssuer>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

/// Owned by cert-manager, only ever copied.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IssuerStatus {
    #[serde(flatten)]
    pub fields: UnknownFields,
}

/// Exposes every field of an issuer configuration that holds the name of a Secret.
///
/// Implemented once per provider, fields of absent optional branches are simply not returned.
pub trait SecretNames {
    fn secret_names_mut(&mut self) -> Vec<&mut String>;
}

impl IssuerSpec {
    fn providers_mut(&mut self) -> [Option<&mut dyn SecretNames>; 4] {
        [
            self.acme.as_mut().map(|p| p as &mut dyn SecretNames),
            self.ca.as_mut().map(|p| p as &mut dyn SecretNames),
            self.vault.as_mut().map(|p| p as &mut dyn SecretNames),
            self.venafi.as_mut().map(|p| p as &mut dyn SecretNames),
        ]
    }

    /// Names of all Secrets (in the Issuer's namespace) this configuration depends on.
    pub fn referenced_secrets(&self) -> Vec<String> {
        let mut spec = self.clone();
        spec.secret_names_mut()
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| name.clone())
            .collect()
    }
}

impl SecretNames for IssuerSpec {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        self.providers_mut()
            .into_iter()
            .flatten()
            .flat_map(|provider| provider.secret_names_mut())
            .collect()
    }
}

fn selector_names<'a>(
    selectors: impl IntoIterator<Item = Option<&'a mut SecretKeySelector>>,
) -> impl Iterator<Item = &'a mut String> {
    selectors
        .into_iter()
        .flatten()
        .map(|selector| &mut selector.name)
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    pub private_key_secret_ref: SecretKeySelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<AcmeExternalAccountBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub solvers: Vec<AcmeChallengeSolver>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl SecretNames for AcmeIssuer {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        let mut names = vec![&mut self.private_key_secret_ref.name];
        if let Some(eab) = &mut self.external_account_binding {
            names.push(&mut eab.key_secret_ref.name);
        }
        names.extend(
            self.solvers
                .iter_mut()
                .filter_map(|solver| solver.dns01.as_mut())
                .flat_map(|dns01| dns01.secret_names_mut()),
        );
        names
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeExternalAccountBinding {
    pub key_secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeChallengeSolver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns01: Option<AcmeChallengeSolverDns01>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeChallengeSolverDns01 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub akamai: Option<AcmeIssuerDns01ProviderAkamai>,
    #[serde(
        default,
        rename = "cloudDNS",
        skip_serializing_if = "Option::is_none"
    )]
    pub cloud_dns: Option<AcmeIssuerDns01ProviderCloudDns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflare: Option<AcmeIssuerDns01ProviderCloudflare>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digitalocean: Option<AcmeIssuerDns01ProviderDigitalOcean>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route53: Option<AcmeIssuerDns01ProviderRoute53>,
    #[serde(
        default,
        rename = "azureDNS",
        skip_serializing_if = "Option::is_none"
    )]
    pub azure_dns: Option<AcmeIssuerDns01ProviderAzureDns>,
    #[serde(
        default,
        rename = "acmeDNS",
        skip_serializing_if = "Option::is_none"
    )]
    pub acme_dns: Option<AcmeIssuerDns01ProviderAcmeDns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc2136: Option<AcmeIssuerDns01ProviderRfc2136>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl SecretNames for AcmeChallengeSolverDns01 {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        let mut names = Vec::new();
        if let Some(akamai) = &mut self.akamai {
            names.extend([
                &mut akamai.client_token_secret_ref.name,
                &mut akamai.client_secret_secret_ref.name,
                &mut akamai.access_token_secret_ref.name,
            ]);
        }
        if let Some(cloud_dns) = &mut self.cloud_dns {
            names.extend(selector_names([cloud_dns
                .service_account_secret_ref
                .as_mut()]));
        }
        if let Some(cloudflare) = &mut self.cloudflare {
            names.extend(selector_names([
                cloudflare.api_key_secret_ref.as_mut(),
                cloudflare.api_token_secret_ref.as_mut(),
            ]));
        }
        if let Some(digitalocean) = &mut self.digitalocean {
            names.push(&mut digitalocean.token_secret_ref.name);
        }
        if let Some(route53) = &mut self.route53 {
            names.extend(selector_names([
                route53.secret_access_key_secret_ref.as_mut(),
                route53.access_key_id_secret_ref.as_mut(),
            ]));
        }
        if let Some(azure_dns) = &mut self.azure_dns {
            names.extend(selector_names([azure_dns.client_secret_secret_ref.as_mut()]));
        }
        if let Some(acme_dns) = &mut self.acme_dns {
            names.push(&mut acme_dns.account_secret_ref.name);
        }
        if let Some(rfc2136) = &mut self.rfc2136 {
            names.extend(selector_names([rfc2136.tsig_secret_secret_ref.as_mut()]));
        }
        names
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderAkamai {
    pub client_token_secret_ref: SecretKeySelector,
    pub client_secret_secret_ref: SecretKeySelector,
    pub access_token_secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderCloudDns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderCloudflare {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderDigitalOcean {
    pub token_secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderRoute53 {
    // Both are optional, Route53 may use ambient credentials instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key_secret_ref: Option<SecretKeySelector>,
    #[serde(
        default,
        rename = "accessKeyIDSecretRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_key_id_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderAzureDns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderAcmeDns {
    pub account_secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerDns01ProviderRfc2136 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsig_secret_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    pub secret_name: String,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl SecretNames for CaIssuer {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        vec![&mut self.secret_name]
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultIssuer {
    #[serde(default)]
    pub auth: VaultAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl SecretNames for VaultIssuer {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        let auth = &mut self.auth;
        selector_names([
            auth.token_secret_ref.as_mut(),
            auth.app_role.as_mut().map(|app_role| &mut app_role.secret_ref),
            auth.kubernetes
                .as_mut()
                .and_then(|kubernetes| kubernetes.secret_ref.as_mut()),
            self.ca_bundle_secret_ref.as_mut(),
            self.client_cert_secret_ref.as_mut(),
            self.client_key_secret_ref.as_mut(),
        ])
        .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_role: Option<VaultAppRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<VaultKubernetesAuth>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultAppRole {
    pub secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultKubernetesAuth {
    // Unset when a ServiceAccount reference is used instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiIssuer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpp: Option<VenafiTpp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<VenafiCloud>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl SecretNames for VenafiIssuer {
    fn secret_names_mut(&mut self) -> Vec<&mut String> {
        let mut names = Vec::new();
        if let Some(tpp) = &mut self.tpp {
            names.push(&mut tpp.credentials_ref.name);
            names.extend(selector_names([tpp.ca_bundle_secret_ref.as_mut()]));
        }
        if let Some(cloud) = &mut self.cloud {
            names.push(&mut cloud.api_token_secret_ref.name);
        }
        names
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiTpp {
    pub credentials_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<SecretKeySelector>,
    #[serde(flatten)]
    pub other: UnknownFields,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VenafiCloud {
    pub api_token_secret_ref: SecretKeySelector,
    #[serde(flatten)]
    pub other: UnknownFields,
}

impl CertificateSpec {
    /// Names of the Secrets (in the Certificate's namespace) this Certificate reads from.
    ///
    /// The target [`Self::secret_name`] is written by cert-manager and thus not included.
    pub fn referenced_secrets(&self) -> Vec<String> {
        self.keystores
            .iter()
            .flat_map(|keystores| [&keystores.jks, &keystores.pkcs12])
            .flatten()
            .filter_map(|keystore| keystore.password_secret_ref.as_ref())
            .map(|password| password.name.clone())
            .filter(|name| !name.is_empty())
            .collect()
    }
}
