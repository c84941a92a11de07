//! In-memory [`Backend`] with optional JSON snapshots.
//!
//! Documents live in per-collection `BTreeMap`s behind one `RwLock`, so the
//! store is cheap to share across worker threads. The CLI persists the whole
//! store as a single JSON snapshot between runs; tests use it bare.

use super::backend::{scalar_value, Backend, Error, Filter, ProtoGroup, Result};
use crate::model::DocId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct UniqueIndex {
    paths: Vec<String>,
    keys: HashMap<String, DocId>,
}

impl UniqueIndex {
    fn key_for(&self, document: &Value) -> String {
        let key: Vec<Value> = self
            .paths
            .iter()
            .map(|path| scalar_value(document, path).cloned().unwrap_or(Value::Null))
            .collect();
        // Vec<Value> always serializes
        serde_json::to_string(&key).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Collection {
    documents: BTreeMap<DocId, Value>,
    indexes: Vec<UniqueIndex>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct CollectionSnapshot {
    documents: Vec<Value>,
    unique_indexes: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Snapshot {
    collections: BTreeMap<String, CollectionSnapshot>,
}

fn document_id(document: &Value) -> Result<Option<DocId>> {
    match document.get("_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Uuid::parse_str(id)
            .map(Some)
            .map_err(|_| Error::InvalidDocument(format!("malformed _id {id:?}"))),
        Some(other) => Err(Error::InvalidDocument(format!("malformed _id {other}"))),
    }
}

fn set_path(document: &mut Value, path: &str, value: Value) -> Result<()> {
    let mut current = document;
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| Error::InvalidDocument("empty field path".into()))?;
    for segment in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| Error::InvalidDocument(format!("{path} crosses a non-object")))?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let object = current
        .as_object_mut()
        .ok_or_else(|| Error::InvalidDocument(format!("{path} crosses a non-object")))?;
    object.insert(last.to_string(), value);
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a snapshot file. A missing file yields an empty
    /// store so a first run needs no setup step.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Backend(format!("reading {}: {err}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|err| Error::Backend(format!("parsing {}: {err}", path.display())))?;
        let store = Self::new();
        for (name, collection) in snapshot.collections {
            for paths in &collection.unique_indexes {
                let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
                store.ensure_unique_index(&name, &paths)?;
            }
            for document in collection.documents {
                store.insert(&name, document)?;
            }
        }
        Ok(store)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let collections = self
            .collections
            .read()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let mut snapshot = Snapshot::default();
        for (name, collection) in collections.iter() {
            snapshot.collections.insert(
                name.clone(),
                CollectionSnapshot {
                    documents: collection.documents.values().cloned().collect(),
                    unique_indexes: collection
                        .indexes
                        .iter()
                        .map(|index| index.paths.clone())
                        .collect(),
                },
            );
        }
        let raw = serde_json::to_string(&snapshot)
            .map_err(|err| Error::Backend(format!("serializing snapshot: {err}")))?;
        fs::write(path, raw)
            .map_err(|err| Error::Backend(format!("writing {}: {err}", path.display())))
    }
}

impl Backend for MemoryStore {
    fn insert(&self, collection: &str, mut document: Value) -> Result<DocId> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let target = collections.entry(collection.to_string()).or_default();

        let id = match document_id(&document)? {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                set_path(&mut document, "_id", Value::String(id.to_string()))?;
                id
            }
        };
        if target.documents.contains_key(&id) {
            return Err(Error::DuplicateKey {
                collection: collection.to_string(),
                key: format!("_id:{id}"),
            });
        }
        for index in &target.indexes {
            let key = index.key_for(&document);
            if index.keys.contains_key(&key) {
                return Err(Error::DuplicateKey {
                    collection: collection.to_string(),
                    key,
                });
            }
        }
        for index in &mut target.indexes {
            let key = index.key_for(&document);
            index.keys.insert(key, id);
        }
        target.documents.insert(id, document);
        Ok(id)
    }

    fn find_by_id(&self, collection: &str, id: DocId) -> Result<Value> {
        let collections = self
            .collections
            .read()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        collections
            .get(collection)
            .and_then(|target| target.documents.get(&id))
            .cloned()
            .ok_or(Error::NotFound {
                collection: collection.to_string(),
                id,
            })
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        Ok(collections
            .get(collection)
            .map(|target| {
                target
                    .documents
                    .values()
                    .filter(|document| filter.matches(document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn update_fields(&self, collection: &str, id: DocId, fields: &[(String, Value)]) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let document = collections
            .get_mut(collection)
            .and_then(|target| target.documents.get_mut(&id))
            .ok_or(Error::NotFound {
                collection: collection.to_string(),
                id,
            })?;
        for (path, value) in fields {
            set_path(document, path, value.clone())?;
        }
        Ok(())
    }

    fn push_field(&self, collection: &str, id: DocId, path: &str, value: Value) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let document = collections
            .get_mut(collection)
            .and_then(|target| target.documents.get_mut(&id))
            .ok_or(Error::NotFound {
                collection: collection.to_string(),
                id,
            })?;
        match super::backend::path_value(document, path).cloned() {
            Some(Value::Array(mut items)) => {
                items.push(value);
                set_path(document, path, Value::Array(items))
            }
            None | Some(Value::Null) => set_path(document, path, Value::Array(vec![value])),
            Some(other) => Err(Error::InvalidDocument(format!(
                "{path} holds a non-array: {other}"
            ))),
        }
    }

    fn ensure_unique_index(&self, collection: &str, paths: &[&str]) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let target = collections.entry(collection.to_string()).or_default();
        let paths: Vec<String> = paths.iter().map(ToString::to_string).collect();
        if target.indexes.iter().any(|index| index.paths == paths) {
            return Ok(());
        }
        let mut index = UniqueIndex {
            paths,
            keys: HashMap::new(),
        };
        for (id, document) in &target.documents {
            let key = index.key_for(document);
            if index.keys.insert(key.clone(), *id).is_some() {
                return Err(Error::Backend(format!(
                    "cannot build unique index on {collection}, documents collide on {key}"
                )));
            }
        }
        target.indexes.push(index);
        Ok(())
    }

    fn group_by(
        &self,
        collection: &str,
        filter: &Filter,
        key_paths: &[&str],
    ) -> Result<Vec<ProtoGroup>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut groups: BTreeMap<String, ProtoGroup> = BTreeMap::new();
        for (id, document) in &target.documents {
            if !filter.matches(document) {
                continue;
            }
            let key: Vec<Value> = key_paths
                .iter()
                .map(|path| scalar_value(document, path).cloned().unwrap_or(Value::Null))
                .collect();
            let serialized = serde_json::to_string(&key).unwrap_or_default();
            groups
                .entry(serialized)
                .or_insert_with(|| ProtoGroup {
                    key,
                    child_ids: Vec::new(),
                })
                .child_ids
                .push(*id);
        }
        Ok(groups.into_values().collect())
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collections = self
            .collections
            .read()
            .map_err(|_| Error::Backend("store lock poisoned".into()))?;
        Ok(collections
            .get(collection)
            .map(|target| {
                target
                    .documents
                    .values()
                    .filter(|document| filter.matches(document))
                    .count() as u64
            })
            .unwrap_or(0))
    }
}
