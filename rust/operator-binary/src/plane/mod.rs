//! Access to the objects of one of the two clusters (planes).
//!
//! Reconcilers only talk to clusters through [`Plane`], which keeps the sync logic independent
//! of the Kubernetes client and lets tests run it against [`memory::MemoryPlane`].

pub mod cluster;
#[cfg(test)]
pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;
use stackable_operator::{k8s_openapi::NamespaceResourceScope, kube::Resource};

pub use cluster::KubePlane;

/// Namespaced objects that can be stored in a [`Plane`].
pub trait PlaneObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> PlaneObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{kind} {object} was modified concurrently"))]
    Conflict { kind: String, object: String },

    #[snafu(display("{kind} {object} already exists"))]
    AlreadyExists { kind: String, object: String },

    #[snafu(display("{kind} {object} has no name"))]
    NoName { kind: String, object: String },

    #[snafu(display("request for {kind} {object} failed"))]
    Request {
        source: stackable_operator::kube::Error,
        kind: String,
        object: String,
    },

    #[snafu(display("failed to serialize {kind} {object}"))]
    Serialize {
        source: serde_json::Error,
        kind: String,
        object: String,
    },

    #[cfg(test)]
    #[snafu(display("injected failure for {kind} {object}"))]
    Injected { kind: String, object: String },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Blocking (from the caller's point of view) CRUD access to one cluster.
///
/// Writes carry the `resourceVersion` of the passed object, a stale version fails with
/// [`Error::Conflict`] instead of overwriting concurrent changes.
#[async_trait]
pub trait Plane: Send + Sync {
    async fn get<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn list<K: PlaneObject>(&self, namespace: &str) -> Result<Vec<K>>;

    async fn create<K: PlaneObject>(&self, obj: &K) -> Result<K>;

    /// Replaces everything but the status subresource.
    async fn replace<K: PlaneObject>(&self, obj: &K) -> Result<K>;

    /// Replaces only the status subresource.
    async fn replace_status<K: PlaneObject>(&self, obj: &K) -> Result<K>;

    /// Deleting an object that does not exist (anymore) is not an error.
    async fn delete<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<()>;
}

/// `namespace/name` of `obj`, for logs and errors.
pub fn describe<K: PlaneObject>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

pub fn kind_of<K: PlaneObject>() -> String {
    K::kind(&()).into_owned()
}
