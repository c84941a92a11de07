//! Typed access to the document store.
//!
//! [`EntityStore`] wraps a [`Backend`] for one entity type and enforces the
//! entity's unique key. Uniqueness under concurrent writers relies on the
//! backend's unique index alone: writers insert optimistically and re-query
//! on a duplicate-key failure, so the first writer wins and everyone ends up
//! with the same document.

pub mod backend;
pub mod memory;

pub use backend::{path_value, scalar_value, Backend, Error, Filter, ProtoGroup, Result};
pub use memory::MemoryStore;

use crate::model::{DocId, Entity, FileSource, ImageMetadata, Patient, RadiologicalSeries, RadiologicalStudy};
use chrono::Utc;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared backend handle.
pub type Db = Arc<dyn Backend>;

pub struct EntityStore<T> {
    db: Db,
    key_paths: &'static [&'static str],
    index_ready: AtomicBool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityStore<T> {
    pub fn new(db: Db, key_paths: &'static [&'static str]) -> Self {
        Self {
            db,
            key_paths,
            index_ready: AtomicBool::new(false),
            _entity: PhantomData,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    // The unique index is created on first use instead of at startup, so
    // merely constructing a store never touches the backend.
    fn ensure_index(&self) -> Result<()> {
        if self.key_paths.is_empty() || self.index_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.db.ensure_unique_index(T::COLLECTION, self.key_paths)?;
        self.index_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn key_filter(&self, document: &Value) -> Filter {
        let mut filter = Filter::new();
        for path in self.key_paths {
            filter = match scalar_value(document, path) {
                Some(value) => filter.eq(*path, value.clone()),
                None => filter.exists(*path, false),
            };
        }
        filter
    }

    /// Insert, failing on a unique-key collision.
    pub fn insert(&self, mut entity: T) -> Result<T> {
        self.ensure_index()?;
        let document = entity.to_document()?;
        let id = self.db.insert(T::COLLECTION, document)?;
        entity.set_id(id);
        Ok(entity)
    }

    /// Insert, or fetch the already-persisted entity on a unique-key
    /// collision. The boolean is true when this call did the insert.
    pub fn insert_or_get(&self, entity: T) -> Result<(T, bool)> {
        self.ensure_index()?;
        let document = entity.to_document()?;
        match self.db.insert(T::COLLECTION, document.clone()) {
            Ok(id) => {
                let mut entity = entity;
                entity.set_id(id);
                Ok((entity, true))
            }
            Err(Error::DuplicateKey { .. }) => {
                let existing = self
                    .db
                    .find(T::COLLECTION, &self.key_filter(&document))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::Backend(format!(
                            "duplicate key in {} but no matching document",
                            T::COLLECTION
                        ))
                    })?;
                Ok((T::from_document(existing)?, false))
            }
            Err(err) => Err(err),
        }
    }

    pub fn by_id(&self, id: DocId) -> Result<T> {
        let document = self.db.find_by_id(T::COLLECTION, id)?;
        Ok(T::from_document(document)?)
    }

    pub fn by_ids(&self, ids: &[DocId]) -> Result<Vec<T>> {
        ids.iter().map(|id| self.by_id(*id)).collect()
    }

    pub fn find(&self, filter: &Filter) -> Result<Vec<T>> {
        self.db
            .find(T::COLLECTION, filter)?
            .into_iter()
            .map(|document| T::from_document(document).map_err(Into::into))
            .collect()
    }

    pub fn count(&self, filter: &Filter) -> Result<u64> {
        self.db.count(T::COLLECTION, filter)
    }

    /// Update fields on one document, stamping `_metadata.modified`.
    pub fn update_fields(&self, id: DocId, fields: &[(String, Value)]) -> Result<()> {
        let mut stamped = fields.to_vec();
        stamped.push(("_metadata.modified".into(), json!(Utc::now())));
        self.db.update_fields(T::COLLECTION, id, &stamped)
    }

    pub fn group_by(&self, filter: &Filter, key_paths: &[&str]) -> Result<Vec<ProtoGroup>> {
        self.db.group_by(T::COLLECTION, filter, key_paths)
    }
}

pub struct ImageStore {
    entities: EntityStore<ImageMetadata>,
}

impl ImageStore {
    pub const KEY: &'static [&'static str] = &["tags.SOPInstanceUID.Value"];

    pub fn new(db: Db) -> Self {
        Self {
            entities: EntityStore::new(db, Self::KEY),
        }
    }

    pub fn entities(&self) -> &EntityStore<ImageMetadata> {
        &self.entities
    }

    pub fn insert_or_get(&self, image: ImageMetadata) -> Result<(ImageMetadata, bool)> {
        self.entities.insert_or_get(image)
    }

    pub fn set_series_id(&self, id: DocId, series_id: DocId) -> Result<()> {
        self.entities
            .update_fields(id, &[("series_id".into(), json!(series_id))])
    }

    pub fn set_study_id(&self, id: DocId, study_id: DocId) -> Result<()> {
        self.entities
            .update_fields(id, &[("study_id".into(), json!(study_id))])
    }

    /// Record an alternate location of the same instance, e.g. after a
    /// de-identified re-export.
    pub fn add_aka_file_source(&self, id: DocId, source: &FileSource) -> Result<()> {
        let value = serde_json::to_value(source)
            .map_err(|err| Error::InvalidDocument(format!("{err}")))?;
        self.entities
            .db
            .push_field(ImageMetadata::COLLECTION, id, "aka_file_sources", value)?;
        self.entities
            .update_fields(id, &[])
    }
}

pub struct SeriesStore {
    entities: EntityStore<RadiologicalSeries>,
}

impl SeriesStore {
    pub const KEY: &'static [&'static str] = &["series_uid"];

    pub fn new(db: Db) -> Self {
        Self {
            entities: EntityStore::new(db, Self::KEY),
        }
    }

    pub fn entities(&self) -> &EntityStore<RadiologicalSeries> {
        &self.entities
    }

    pub fn insert_or_get(&self, series: RadiologicalSeries) -> Result<(RadiologicalSeries, bool)> {
        self.entities.insert_or_get(series)
    }

    pub fn set_study_id(&self, id: DocId, study_id: DocId) -> Result<()> {
        self.entities
            .update_fields(id, &[("study_id".into(), json!(study_id))])
    }
}

pub struct StudyStore {
    entities: EntityStore<RadiologicalStudy>,
}

impl StudyStore {
    /// Studies are keyed by patient and date; the StudyInstanceUID is not
    /// reliable enough to identify a study across exporters.
    pub const KEY: &'static [&'static str] = &["tags.PatientID.Value", "date"];

    pub fn new(db: Db) -> Self {
        Self {
            entities: EntityStore::new(db, Self::KEY),
        }
    }

    pub fn entities(&self) -> &EntityStore<RadiologicalStudy> {
        &self.entities
    }

    pub fn insert_or_get(&self, study: RadiologicalStudy) -> Result<(RadiologicalStudy, bool)> {
        self.entities.insert_or_get(study)
    }

    pub fn set_patient_id(&self, id: DocId, patient_id: DocId) -> Result<()> {
        self.entities
            .update_fields(id, &[("patient_id".into(), json!(patient_id))])
    }
}

pub struct PatientStore {
    entities: EntityStore<Patient>,
}

impl PatientStore {
    pub const KEY: &'static [&'static str] = &["anon_id"];

    pub fn new(db: Db) -> Self {
        Self {
            entities: EntityStore::new(db, Self::KEY),
        }
    }

    pub fn entities(&self) -> &EntityStore<Patient> {
        &self.entities
    }

    pub fn insert_or_get(&self, patient: Patient) -> Result<(Patient, bool)> {
        self.entities.insert_or_get(patient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{TagElement, TagRecord};
    use serde_json::json;

    fn db() -> Db {
        Arc::new(MemoryStore::new())
    }

    fn image(uid: &str) -> ImageMetadata {
        let mut tags = TagRecord::new();
        tags.insert("SOPInstanceUID", TagElement::new("UI", json!([uid])));
        ImageMetadata::new(tags, FileSource::new("drive_a", format!("{uid}.dcm")), None)
    }

    #[test]
    fn test_insert_assigns_id_and_is_unique() {
        let store = ImageStore::new(db());
        let (first, inserted) = store.insert_or_get(image("1.1")).unwrap();
        assert!(inserted);
        assert!(first.id.is_some());
    }

    #[test]
    fn test_insert_or_get_returns_existing() {
        let store = ImageStore::new(db());
        let (first, _) = store.insert_or_get(image("1.1")).unwrap();
        let (second, inserted) = store.insert_or_get(image("1.1")).unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn test_insert_or_get_is_idempotent_under_repeats() {
        let store = ImageStore::new(db());
        for _ in 0..5 {
            store.insert_or_get(image("1.1")).unwrap();
        }
        assert_eq!(store.entities().count(&Filter::new()).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_insert_or_get_converges_on_one_document() {
        let store = ImageStore::new(db());
        let ids: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let (image, _) = store.insert_or_get(image("1.1")).unwrap();
                        image.id.unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.entities().count(&Filter::new()).unwrap(), 1);
    }

    #[test]
    fn test_plain_insert_propagates_duplicate() {
        let store = ImageStore::new(db());
        store.entities().insert(image("1.1")).unwrap();
        let result = store.entities().insert(image("1.1"));
        assert!(matches!(result, Err(Error::DuplicateKey { .. })));
    }

    #[test]
    fn test_set_series_id_stamps_modified() {
        let store = ImageStore::new(db());
        let (image, _) = store.insert_or_get(image("1.1")).unwrap();
        let id = image.id.unwrap();
        let series_id = uuid::Uuid::new_v4();
        store.set_series_id(id, series_id).unwrap();
        let reloaded = store.entities().by_id(id).unwrap();
        assert_eq!(reloaded.series_id, Some(series_id));
        assert!(reloaded.metadata.modified.is_some());
    }

    #[test]
    fn test_add_aka_file_source() {
        let store = ImageStore::new(db());
        let (image, _) = store.insert_or_get(image("1.1")).unwrap();
        let id = image.id.unwrap();
        store
            .add_aka_file_source(id, &FileSource::new("deid_drive", "26e/3af/x.dcm"))
            .unwrap();
        let reloaded = store.entities().by_id(id).unwrap();
        let sources = reloaded.aka_file_sources.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].drive_name, "deid_drive");
    }

    #[test]
    fn test_patient_store_unique_on_anon_id() {
        let store = PatientStore::new(db());
        let mut tags = TagRecord::new();
        tags.insert("PatientID", TagElement::new("LO", json!(["abc"])));
        let patient = Patient::from_consensus(&tags).unwrap();
        let (first, _) = store.insert_or_get(patient.clone()).unwrap();
        let (second, inserted) = store.insert_or_get(patient).unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
    }
}
