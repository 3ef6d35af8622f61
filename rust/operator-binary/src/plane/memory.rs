//! In-memory [`Plane`] for tests, with a log of every write it received.

use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{describe, kind_of, Error, Plane, PlaneObject, Result};
use crate::translate::Identity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    List,
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: Op,
    pub kind: String,
    pub object: Identity,
}

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    next_version: u64,
    next_uid: u64,
    writes: Vec<WriteRecord>,
    pending_conflicts: usize,
    pending_failures: Vec<(Op, String)>,
}

impl State {
    fn bump_version(&mut self, value: &mut Value) {
        self.next_version += 1;
        value["metadata"]["resourceVersion"] = Value::String(self.next_version.to_string());
    }

    fn take_failure(&mut self, op: Op, kind: &str) -> bool {
        match self
            .pending_failures
            .iter()
            .position(|(failing_op, failing_kind)| *failing_op == op && failing_kind == kind)
        {
            Some(idx) => {
                self.pending_failures.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Fails like an API server would if `incoming` is based on an outdated version.
    fn check_version(
        &mut self,
        key: &Key,
        incoming: &Value,
        kind: &str,
        object: &str,
    ) -> Result<()> {
        let Some(stored) = self.objects.get(key).cloned() else {
            return Err(Error::Conflict {
                kind: kind.to_string(),
                object: object.to_string(),
            });
        };
        if self.pending_conflicts > 0 {
            self.pending_conflicts -= 1;
            // Somebody else wrote in the meantime
            let mut stored = stored;
            self.bump_version(&mut stored);
            self.objects.insert(key.clone(), stored);
            return Err(Error::Conflict {
                kind: kind.to_string(),
                object: object.to_string(),
            });
        }
        let incoming_version = &incoming["metadata"]["resourceVersion"];
        if !incoming_version.is_null()
            && *incoming_version != stored["metadata"]["resourceVersion"]
        {
            return Err(Error::Conflict {
                kind: kind.to_string(),
                object: object.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPlane {
    state: Mutex<State>,
}

fn key_of<K: PlaneObject>(obj: &K) -> Key {
    let meta = obj.meta();
    (
        kind_of::<K>(),
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

impl MemoryPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `obj` without recording a write, as if it had existed before the test started.
    pub fn insert<K: PlaneObject>(&self, obj: K) -> K {
        let mut state = self.state.lock().unwrap();
        let mut value = serde_json::to_value(&obj).unwrap();
        state.bump_version(&mut value);
        if value["metadata"]["uid"].is_null() {
            state.next_uid += 1;
            value["metadata"]["uid"] = Value::String(format!("uid-{}", state.next_uid));
        }
        state.objects.insert(key_of(&obj), value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn object<K: PlaneObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// The next `count` replace calls fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.state.lock().unwrap().pending_conflicts = count;
    }

    /// The next `op` on an object of kind `K` fails.
    pub fn fail_next<K: PlaneObject>(&self, op: Op) {
        self.state
            .lock()
            .unwrap()
            .pending_failures
            .push((op, kind_of::<K>()));
    }

    fn record(state: &mut State, op: Op, key: &Key) {
        state.writes.push(WriteRecord {
            op,
            kind: key.0.clone(),
            object: Identity::new(&key.1, &key.2),
        });
    }
}

#[async_trait]
impl Plane for MemoryPlane {
    async fn get<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.object(namespace, name))
    }

    async fn list<K: PlaneObject>(&self, namespace: &str) -> Result<Vec<K>> {
        let mut state = self.state.lock().unwrap();
        let kind = kind_of::<K>();
        if state.take_failure(Op::List, &kind) {
            return Err(Error::Injected {
                kind,
                object: namespace.to_string(),
            });
        }
        Ok(state
            .objects
            .iter()
            .filter(|((obj_kind, obj_namespace, _), _)| {
                *obj_kind == kind && obj_namespace == namespace
            })
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect())
    }

    async fn create<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        if state.take_failure(Op::Create, &key.0) {
            return Err(Error::Injected {
                kind: key.0,
                object: describe(obj),
            });
        }
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: key.0,
                object: describe(obj),
            });
        }
        let mut value = serde_json::to_value(obj).unwrap();
        state.bump_version(&mut value);
        state.next_uid += 1;
        value["metadata"]["uid"] = Value::String(format!("uid-{}", state.next_uid));
        state.objects.insert(key.clone(), value.clone());
        Self::record(&mut state, Op::Create, &key);
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn replace<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        if state.take_failure(Op::Replace, &key.0) {
            return Err(Error::Injected {
                kind: key.0,
                object: describe(obj),
            });
        }
        let mut value = serde_json::to_value(obj).unwrap();
        state.check_version(&key, &value, &key.0, &describe(obj))?;
        let stored_status = state.objects[&key].get("status").cloned();
        match (value.as_object_mut(), stored_status) {
            (Some(fields), Some(status)) => {
                fields.insert("status".to_string(), status);
            }
            (Some(fields), None) => {
                fields.remove("status");
            }
            (None, _) => {}
        }
        state.bump_version(&mut value);
        state.objects.insert(key.clone(), value.clone());
        Self::record(&mut state, Op::Replace, &key);
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn replace_status<K: PlaneObject>(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(obj);
        if state.take_failure(Op::ReplaceStatus, &key.0) {
            return Err(Error::Injected {
                kind: key.0,
                object: describe(obj),
            });
        }
        let incoming = serde_json::to_value(obj).unwrap();
        state.check_version(&key, &incoming, &key.0, &describe(obj))?;
        let mut value = state.objects[&key].clone();
        value["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        state.bump_version(&mut value);
        state.objects.insert(key.clone(), value.clone());
        Self::record(&mut state, Op::ReplaceStatus, &key);
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn delete<K: PlaneObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        if state.take_failure(Op::Delete, &key.0) {
            return Err(Error::Injected {
                kind: key.0,
                object: format!("{namespace}/{name}"),
            });
        }
        if state.objects.remove(&key).is_some() {
            Self::record(&mut state, Op::Delete, &key);
        }
        Ok(())
    }
}
