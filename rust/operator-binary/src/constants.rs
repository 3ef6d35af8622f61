//! Annotation and label keys that other components (cert-manager's ingress-shim, vcluster itself,
//! and previously deployed versions of this plugin) rely on.
//!
//! These strings are part of the wire protocol, do not change them.

/// Value of [`CONTROLLER_LABEL`] when this plugin is responsible for syncing a Secret.
pub const PLUGIN_NAME: &str = "cert-manager-plugin";

/// Names the namespaced `Issuer` that cert-manager's ingress-shim should use for an `Ingress`.
pub const ISSUER_ANNOTATION: &str = "cert-manager.io/issuer";
/// Names the `ClusterIssuer` that cert-manager's ingress-shim should use for an `Ingress`.
pub const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

/// Set to `"true"` on virtual objects that were created from a host object,
/// the host object is authoritative for these.
pub const BACKWARD_SYNC_ANNOTATION: &str = "cert-manager.vcluster.loft.sh/backward-sync";

/// Ownership marker on virtual Secrets, the value identifies the syncer currently in charge.
pub const CONTROLLER_LABEL: &str = "vcluster.loft.sh/controlled-by";

/// Set on every host object created by this plugin, the value is the vcluster name.
pub const MANAGED_BY_LABEL: &str = "vcluster.loft.sh/managed-by";
/// Virtual namespace of the object a host object was translated from.
pub const NAMESPACE_LABEL: &str = "vcluster.loft.sh/namespace";

pub const NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";
pub const NAMESPACE_ANNOTATION: &str = "vcluster.loft.sh/object-namespace";
pub const KIND_ANNOTATION: &str = "vcluster.loft.sh/object-kind";
pub const UID_ANNOTATION: &str = "vcluster.loft.sh/object-uid";

pub const LAST_APPLIED_CONFIG_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Annotations that only make sense on one side of the plane boundary.
pub const TRACKING_ANNOTATIONS: &[&str] = &[
    NAME_ANNOTATION,
    NAMESPACE_ANNOTATION,
    KIND_ANNOTATION,
    UID_ANNOTATION,
    LAST_APPLIED_CONFIG_ANNOTATION,
];

pub fn is_backward_synced(annotations: &std::collections::BTreeMap<String, String>) -> bool {
    annotations
        .get(BACKWARD_SYNC_ANNOTATION)
        .is_some_and(|value| value == "true")
}
