//! Atom store: in-RAM `ResourceStore` with API-server-like write semantics.
//!
//! Objects are held as JSON keyed by (apiVersion/kind, namespace, name). The store
//! assigns resource versions and uids, rejects stale writes, keeps the status
//! sub-resource separate from the main object, honours finalizers on delete and
//! cascades deletion along owner references.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use atom_kubehub::{kind_of, Managed, ResourceStore, StoreError};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};
use tracing::debug;

type Key = (String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Delete,
    List,
    UpdateStatus,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Key, Json>,
    next_rv: u64,
    writes: FxHashMap<Op, u64>,
    faults: FxHashMap<(String, Op), String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn type_key<K: Managed>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

fn finalizers(v: &Json) -> usize {
    v.get("metadata").and_then(|m| m.get("finalizers")).and_then(|f| f.as_array()).map(|a| a.len()).unwrap_or(0)
}

/// Everything that counts towards `metadata.generation` (i.e. not metadata or status).
fn spec_part(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        obj.remove("metadata");
    }
    v
}

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(obj) = v.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| json!({}));
        if let Some(m) = meta.as_object_mut() {
            m.insert(field.to_string(), value);
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Transport("memory store lock poisoned".into()))
    }

    /// Number of mutating calls (create/update/delete/update_status) served so far.
    pub fn writes(&self) -> u64 {
        self.lock().map(|g| g.writes.values().sum()).unwrap_or(0)
    }

    pub fn writes_of(&self, op: Op) -> u64 {
        self.lock().map(|g| g.writes.get(&op).copied().unwrap_or(0)).unwrap_or(0)
    }

    pub fn reset_writes(&self) {
        if let Ok(mut g) = self.lock() {
            g.writes.clear();
        }
    }

    /// Make every `op` on kind `K` fail with a transport error until cleared.
    pub fn inject_failure<K: Managed>(&self, op: Op, message: &str) {
        if let Ok(mut g) = self.lock() {
            g.faults.insert((type_key::<K>(), op), message.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut g) = self.lock() {
            g.faults.clear();
        }
    }

    /// All objects of kind `K` in `namespace`, sorted by name.
    pub fn all<K: Managed>(&self, namespace: &str) -> Vec<K> {
        let g = match self.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let tk = type_key::<K>();
        let mut out: Vec<(String, K)> = g
            .objects
            .iter()
            .filter(|((t, ns, _), _)| *t == tk && ns == namespace)
            .filter_map(|((_, _, name), v)| serde_json::from_value(v.clone()).ok().map(|o| (name.clone(), o)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.into_iter().map(|(_, o)| o).collect()
    }

    fn check_fault(g: &Inner, tk: &str, op: Op) -> Result<(), StoreError> {
        match g.faults.get(&(tk.to_string(), op)) {
            Some(msg) => Err(StoreError::Transport(msg.clone())),
            None => Ok(()),
        }
    }

    fn count(g: &mut Inner, op: Op) {
        *g.writes.entry(op).or_insert(0) += 1;
    }

    fn bump_rv(g: &mut Inner) -> String {
        g.next_rv += 1;
        g.next_rv.to_string()
    }

    fn key_of<K: Managed>(obj: &K) -> Result<Key, StoreError> {
        let meta = obj.meta();
        let name = meta.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} missing metadata.name", kind_of::<K>())))?;
        let ns = meta
            .namespace
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("{} {} missing metadata.namespace", kind_of::<K>(), name)))?;
        if name.len() > 253 {
            return Err(StoreError::Invalid(format!("{} name too long: {}", kind_of::<K>(), name)));
        }
        Ok((type_key::<K>(), ns, name))
    }

    /// Remove an object and, transitively, everything that names it as owner.
    fn remove_cascading(g: &mut Inner, key: &Key) {
        let removed = match g.objects.remove(key) {
            Some(v) => v,
            None => return,
        };
        let uid = match meta_str(&removed, "uid") {
            Some(u) => u.to_string(),
            None => return,
        };
        let dependents: Vec<Key> = g
            .objects
            .iter()
            .filter(|(_, v)| {
                v.get("metadata")
                    .and_then(|m| m.get("ownerReferences"))
                    .and_then(|r| r.as_array())
                    .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(uid.as_str())))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dk in dependents {
            debug!(kind = %dk.0, ns = %dk.1, name = %dk.2, owner = %key.2, "garbage collecting dependent");
            Self::remove_cascading(g, &dk);
        }
    }

    fn decode<K: Managed>(v: &Json) -> Result<K, StoreError> {
        Ok(serde_json::from_value(v.clone())?)
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let g = self.lock()?;
        let tk = type_key::<K>();
        Self::check_fault(&g, &tk, Op::Get)?;
        match g.objects.get(&(tk, namespace.to_string(), name.to_string())) {
            Some(v) => Ok(Some(Self::decode(v)?)),
            None => Ok(None),
        }
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut g = self.lock()?;
        Self::check_fault(&g, &key.0, Op::Create)?;
        Self::count(&mut g, Op::Create);
        if g.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: kind_of::<K>(), namespace: key.1, name: key.2 });
        }
        if obj.meta().resource_version.is_some() {
            return Err(StoreError::Invalid("resourceVersion should not be set on objects to be created".into()));
        }
        let mut v = serde_json::to_value(obj)?;
        let rv = Self::bump_rv(&mut g);
        set_meta(&mut v, "resourceVersion", json!(rv));
        set_meta(&mut v, "uid", json!(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut v, "creationTimestamp", json!(now_rfc3339()));
        set_meta(&mut v, "generation", json!(1));
        debug!(kind = %key.0, ns = %key.1, name = %key.2, rv = %rv, "created");
        g.objects.insert(key, v.clone());
        Self::decode(&v)
    }

    async fn update<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut g = self.lock()?;
        Self::check_fault(&g, &key.0, Op::Update)?;
        Self::count(&mut g, Op::Update);
        let stored = g
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: kind_of::<K>(), namespace: key.1.clone(), name: key.2.clone() })?;
        let stored_rv = meta_str(&stored, "resourceVersion").unwrap_or_default().to_string();
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if rv != stored_rv {
                return Err(StoreError::Conflict(format!(
                    "the object {} {}/{} has been modified; please apply your changes to the latest version (rv {} != {})",
                    kind_of::<K>(),
                    key.1,
                    key.2,
                    rv,
                    stored_rv
                )));
            }
        }
        let mut v = serde_json::to_value(obj)?;
        // Status, identity and deletion state are not writable through the main resource.
        if let Some(obj) = v.as_object_mut() {
            obj.remove("status");
            if let Some(st) = stored.get("status") {
                obj.insert("status".into(), st.clone());
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match stored.get("metadata").and_then(|m| m.get(field)) {
                Some(val) => set_meta(&mut v, field, val.clone()),
                None => {
                    if let Some(m) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                        m.remove(field);
                    }
                }
            }
        }
        let generation = stored.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(1);
        let spec_changed = spec_part(&v) != spec_part(&stored);
        set_meta(&mut v, "generation", json!(if spec_changed { generation + 1 } else { generation }));
        let rv = Self::bump_rv(&mut g);
        set_meta(&mut v, "resourceVersion", json!(rv));

        if meta_str(&v, "deletionTimestamp").is_some() && finalizers(&v) == 0 {
            debug!(kind = %key.0, ns = %key.1, name = %key.2, "last finalizer removed; deleting");
            Self::remove_cascading(&mut g, &key);
            return Self::decode(&v);
        }
        g.objects.insert(key, v.clone());
        Self::decode(&v)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key: Key = (type_key::<K>(), namespace.to_string(), name.to_string());
        let mut g = self.lock()?;
        Self::check_fault(&g, &key.0, Op::Delete)?;
        Self::count(&mut g, Op::Delete);
        let stored = match g.objects.get(&key) {
            Some(v) => v.clone(),
            None => return Ok(()),
        };
        if finalizers(&stored) > 0 {
            if meta_str(&stored, "deletionTimestamp").is_none() {
                let mut v = stored;
                set_meta(&mut v, "deletionTimestamp", json!(now_rfc3339()));
                let rv = Self::bump_rv(&mut g);
                set_meta(&mut v, "resourceVersion", json!(rv));
                debug!(kind = %key.0, ns = %key.1, name = %key.2, "marked for deletion; waiting on finalizers");
                g.objects.insert(key, v);
            }
            return Ok(());
        }
        Self::remove_cascading(&mut g, &key);
        Ok(())
    }

    async fn list<K: Managed>(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        let tk = type_key::<K>();
        let mut out = Vec::new();
        {
            let g = self.lock()?;
            Self::check_fault(&g, &tk, Op::List)?;
            let mut matching: Vec<(&Key, &Json)> = g
                .objects
                .iter()
                .filter(|((t, ns, _), _)| *t == tk && ns == namespace)
                .filter(|(_, v)| {
                    let labels = v.get("metadata").and_then(|m| m.get("labels"));
                    selector.iter().all(|(k, want)| labels.and_then(|l| l.get(k)).and_then(|s| s.as_str()) == Some(want.as_str()))
                })
                .collect();
            matching.sort_by(|a, b| a.0 .2.cmp(&b.0 .2));
            for (_, v) in matching {
                out.push(Self::decode(v)?);
            }
        }
        Ok(out)
    }

    async fn update_status<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let mut g = self.lock()?;
        Self::check_fault(&g, &key.0, Op::UpdateStatus)?;
        Self::count(&mut g, Op::UpdateStatus);
        let mut stored = g
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: kind_of::<K>(), namespace: key.1.clone(), name: key.2.clone() })?;
        let stored_rv = meta_str(&stored, "resourceVersion").unwrap_or_default().to_string();
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if rv != stored_rv {
                return Err(StoreError::Conflict(format!("status of {} {}/{} is stale (rv {} != {})", kind_of::<K>(), key.1, key.2, rv, stored_rv)));
            }
        }
        let incoming = serde_json::to_value(obj)?;
        if let Some(o) = stored.as_object_mut() {
            match incoming.get("status") {
                Some(st) => o.insert("status".into(), st.clone()),
                None => o.remove("status"),
            };
        }
        let rv = Self::bump_rv(&mut g);
        set_meta(&mut stored, "resourceVersion", json!(rv));
        g.objects.insert(key, stored.clone());
        Self::decode(&stored)
    }
}
