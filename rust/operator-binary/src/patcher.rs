//! Read-modify-write of a single object with optimistic concurrency.
//!
//! A reconciler computes the desired object from the one it read, [`patch`] turns the difference
//! into a JSON merge patch (RFC 7386) and only writes if there is one. When the write races with
//! another writer the patch is re-applied to the fresh object, so changes to fields the reconciler
//! doesn't care about are never reverted.

use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::plane::{self, describe, kind_of, Plane, PlaneObject};

/// Writes attempted before giving up on a contended object.
pub const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize {kind} {object}"))]
    Serialize {
        source: serde_json::Error,
        kind: String,
        object: String,
    },

    #[snafu(display("failed to apply patch to {kind} {object}"))]
    Deserialize {
        source: serde_json::Error,
        kind: String,
        object: String,
    },

    #[snafu(display("failed to write {kind} {object}"))]
    Write {
        source: plane::Error,
        kind: String,
        object: String,
    },

    #[snafu(display("failed to re-read {kind} {object} after a conflict"))]
    Reload {
        source: plane::Error,
        kind: String,
        object: String,
    },

    #[snafu(display("{kind} {object} was deleted while patching it"))]
    Vanished { kind: String, object: String },

    #[snafu(display("{kind} {object} was still contended after {attempts} attempts"))]
    RetriesExhausted {
        kind: String,
        object: String,
        attempts: usize,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Computes the merge patch that turns `before` into `after`.
///
/// Returns [`None`] if both are equal.
pub fn diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = Map::new();
            for key in before.keys() {
                if !after.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, after_value) in after {
                match before.get(key) {
                    Some(before_value) => {
                        if let Some(field_patch) = diff(before_value, after_value) {
                            patch.insert(key.clone(), field_patch);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), after_value.clone());
                    }
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Applies a merge patch produced by [`diff`] to `target`.
pub fn apply(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, field_patch) in patch {
            if field_patch.is_null() {
                fields.remove(key);
            } else {
                apply(
                    fields.entry(key.clone()).or_insert(Value::Null),
                    field_patch,
                );
            }
        }
    }
}

fn without_status(obj: Value) -> Value {
    match obj {
        Value::Object(mut fields) => {
            fields.remove("status");
            Value::Object(fields)
        }
        other => other,
    }
}

/// Persists the changes between `before` (as read from `plane`) and `after`.
///
/// The status subresource is ignored. Returns the written object, or [`None`] if there was
/// nothing to write.
pub async fn patch<P: Plane, K: PlaneObject>(
    plane: &P,
    before: &K,
    after: &K,
) -> Result<Option<K>> {
    let kind = kind_of::<K>();
    let object = describe(before);
    let serialize = |obj: &K| {
        serde_json::to_value(obj)
            .map(without_status)
            .with_context(|_| SerializeSnafu {
                kind: kind.clone(),
                object: object.clone(),
            })
    };
    let Some(merge_patch) = diff(&serialize(before)?, &serialize(after)?) else {
        return Ok(None);
    };
    debug!(%kind, %object, patch = %merge_patch, "patching object");

    let mut desired = after.clone();
    for _ in 0..MAX_CONFLICT_RETRIES {
        match plane.replace(&desired).await {
            Ok(written) => return Ok(Some(written)),
            Err(err) if err.is_conflict() => {
                debug!(%kind, %object, "conflict while patching, retrying on fresh copy");
                let namespace = before.meta().namespace.clone().unwrap_or_default();
                let name = before.meta().name.clone().unwrap_or_default();
                let fresh = plane
                    .get::<K>(&namespace, &name)
                    .await
                    .with_context(|_| ReloadSnafu {
                        kind: kind.clone(),
                        object: object.clone(),
                    })?
                    .with_context(|| VanishedSnafu {
                        kind: kind.clone(),
                        object: object.clone(),
                    })?;
                let mut value = serialize(&fresh)?;
                apply(&mut value, &merge_patch);
                desired = serde_json::from_value(value).with_context(|_| DeserializeSnafu {
                    kind: kind.clone(),
                    object: object.clone(),
                })?;
            }
            Err(source) => {
                return Err(source).context(WriteSnafu {
                    kind: kind.clone(),
                    object: object.clone(),
                })
            }
        }
    }
    RetriesExhaustedSnafu {
        kind,
        object,
        attempts: MAX_CONFLICT_RETRIES,
    }
    .fail()
}
