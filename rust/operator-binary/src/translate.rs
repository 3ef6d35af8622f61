//! Maps object identities and metadata between the virtual and the host cluster.
//!
//! Every virtual object lands in the single host namespace the vcluster runs in, under a name
//! that encodes its virtual name and namespace. The forward direction is a pure function of the
//! virtual identity. The reverse direction is only pure while the host name was not shortened,
//! otherwise it has to be recovered from the tracking annotations written by
//! [`IdentityMapper::host_metadata`].

use std::{collections::BTreeMap, fmt::Display};

use sha2::{Digest, Sha256};
use stackable_operator::kube::api::ObjectMeta;

use crate::{constants, utils::FmtByteSlice};

/// Longest name Kubernetes accepts for most object kinds.
const MAX_NAME_LENGTH: usize = 63;
/// Length of the readable prefix kept when a name needs to be shortened.
const TRUNCATED_PREFIX_LENGTH: usize = 52;

/// A namespaced object identity within one of the two planes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// Parses the `namespace/name` composite key used by the ingress index.
    pub fn from_composite(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        (!namespace.is_empty() && !name.is_empty() && !name.contains('/'))
            .then(|| Self::new(namespace, name))
    }

    pub fn composite(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Joins `parts` with `-`, shortening the result to a valid object name if required.
///
/// Shortened names keep a readable prefix and append a hash of the full name, so distinct inputs
/// stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full_name = parts.join("-");
    if full_name.len() <= MAX_NAME_LENGTH {
        return full_name;
    }
    let digest = Sha256::digest(full_name.as_bytes());
    let prefix_end = (0..=TRUNCATED_PREFIX_LENGTH)
        .rev()
        .find(|idx| full_name.is_char_boundary(*idx))
        .unwrap_or(0);
    format!(
        "{}-{:x}",
        &full_name[..prefix_end],
        FmtByteSlice(&digest[..5])
    )
    .replace(".-", "-")
}

#[derive(Clone, Debug)]
pub struct IdentityMapper {
    host_namespace: String,
    suffix: String,
}

impl IdentityMapper {
    /// `suffix` is the vcluster name, it keeps names of different vclusters sharing a host
    /// namespace apart.
    pub fn new(host_namespace: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            host_namespace: host_namespace.into(),
            suffix: suffix.into(),
        }
    }

    pub fn host_namespace(&self) -> &str {
        &self.host_namespace
    }

    pub fn host_name(&self, name: &str, namespace: &str) -> String {
        safe_concat_name(&[name, "x", namespace, "x", &self.suffix])
    }

    pub fn to_host(&self, identity: &Identity) -> Identity {
        Identity::new(
            &self.host_namespace,
            self.host_name(&identity.name, &identity.namespace),
        )
    }

    /// Recovers the virtual name from a host name without consulting any cluster state.
    ///
    /// Returns [`None`] if `host_name` was not produced by [`Self::host_name`] for `namespace`,
    /// or if it had to be shortened.
    pub fn decode_host_name(&self, host_name: &str, namespace: &str) -> Option<String> {
        let tail = format!("-x-{namespace}-x-{}", self.suffix);
        host_name
            .strip_suffix(&tail)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    /// Builds the metadata of the host copy of a virtual object.
    pub fn host_metadata(&self, virtual_meta: &ObjectMeta, kind: &str) -> ObjectMeta {
        let host = self.to_host(&Identity::from_meta(virtual_meta));
        ObjectMeta {
            name: Some(host.name),
            namespace: Some(host.namespace),
            labels: Some(self.host_labels(virtual_meta)),
            annotations: Some(self.host_annotations(virtual_meta, kind)),
            ..ObjectMeta::default()
        }
    }

    pub fn host_labels(&self, virtual_meta: &ObjectMeta) -> BTreeMap<String, String> {
        let mut labels = virtual_meta.labels.clone().unwrap_or_default();
        labels.insert(
            constants::MANAGED_BY_LABEL.to_string(),
            self.suffix.clone(),
        );
        if let Some(namespace) = &virtual_meta.namespace {
            labels.insert(constants::NAMESPACE_LABEL.to_string(), namespace.clone());
        }
        labels
    }

    pub fn host_annotations(
        &self,
        virtual_meta: &ObjectMeta,
        kind: &str,
    ) -> BTreeMap<String, String> {
        let mut annotations = virtual_annotations(virtual_meta.annotations.as_ref());
        let identity = Identity::from_meta(virtual_meta);
        annotations.insert(constants::NAME_ANNOTATION.to_string(), identity.name);
        annotations.insert(
            constants::NAMESPACE_ANNOTATION.to_string(),
            identity.namespace,
        );
        annotations.insert(constants::KIND_ANNOTATION.to_string(), kind.to_string());
        if let Some(uid) = &virtual_meta.uid {
            annotations.insert(constants::UID_ANNOTATION.to_string(), uid.clone());
        }
        annotations
    }

    /// Whether the host object was created by this vcluster (and may thus be deleted by it).
    pub fn is_managed(&self, host_meta: &ObjectMeta) -> bool {
        host_meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get(constants::MANAGED_BY_LABEL))
            .is_some_and(|owner| owner == &self.suffix)
    }
}

/// Reads the virtual identity recorded on a host object by [`IdentityMapper::host_metadata`].
pub fn virtual_identity(host_meta: &ObjectMeta) -> Option<Identity> {
    let annotations = host_meta.annotations.as_ref()?;
    let name = annotations.get(constants::NAME_ANNOTATION)?;
    let namespace = annotations.get(constants::NAMESPACE_ANNOTATION)?;
    Some(Identity::new(namespace, name))
}

/// Copies host `labels` for a virtual object, dropping the markers added by
/// [`IdentityMapper::host_labels`].
pub fn virtual_labels(labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .into_iter()
        .flatten()
        .filter(|(key, _)| {
            key.as_str() != constants::MANAGED_BY_LABEL
                && key.as_str() != constants::NAMESPACE_LABEL
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Copies `annotations`, dropping the keys that must not cross the plane boundary.
pub fn virtual_annotations(
    annotations: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    annotations
        .into_iter()
        .flatten()
        .filter(|(key, _)| !constants::TRACKING_ANNOTATIONS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
