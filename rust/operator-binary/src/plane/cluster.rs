//! [`Plane`] backed by a Kubernetes API server.

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt};
use stackable_operator::kube::{
    self,
    api::{Api, DeleteParams, ListParams, PostParams},
};

use super::{
    describe, kind_of, Error, NoNameSnafu, Plane, PlaneObject, Result, SerializeSnafu,
};

#[derive(Clone)]
pub struct KubePlane {
    client: kube::Client,
    field_manager: String,
}

impl KubePlane {
    pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    fn api<K: PlaneObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

fn request_error(source: kube::Error, kind: String, object: String) -> Error {
    match &source {
        kube::Error::Api(response)
            if response.code == 409 && response.reason == "AlreadyExists" =>
        {
            Error::AlreadyExists { kind, object }
        }
        kube::Error::Api(response) if response.code == 409 => Error::Conflict { kind, object },
        _ => Error::Request {
            source,
            kind,
            object,
        },
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Namespace and name of `obj`, failing if it has no name.
fn locate<K: PlaneObject>(obj: &K) -> Result<(String, String)> {
    let meta = obj.meta();
    let name = meta.name.clone().with_context(|| NoNameSnafu {
        kind: kind_of::<K>(),
        object: describe(obj),
    })?;
    Ok((meta.namespace.clone().unwrap_or_default(), name))
}

#[async_trait]
impl Plane for KubePlane {
    async fn get<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|source| request_error(source, kind_of::<K>(), format!("{namespace}/{name}")))
    }

    async fn list<K: PlaneObject>(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|source| request_error(source, kind_of::<K>(), namespace.to_string()))?
            .items)
    }

    async fn create<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let (namespace, _) = locate(obj)?;
        self.api::<K>(&namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|source| request_error(source, kind_of::<K>(), describe(obj)))
    }

    async fn replace<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|source| request_error(source, kind_of::<K>(), describe(obj)))
    }

    async fn replace_status<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        let data = serde_json::to_vec(obj).with_context(|_| SerializeSnafu {
            kind: kind_of::<K>(),
            object: describe(obj),
        })?;
        self.api::<K>(&namespace)
            .replace_status(&name, &self.post_params(), data)
            .await
            .map_err(|source| request_error(source, kind_of::<K>(), describe(obj)))
    }

    async fn delete<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(source) => Err(request_error(
                source,
                kind_of::<K>(),
                format!("{namespace}/{name}"),
            )),
        }
    }
}
