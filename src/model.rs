//! Persisted entities of the image/series/study/patient hierarchy.
//!
//! All entities share the same shape: an optional document id, an embedded
//! `_metadata` block and entity-specific fields. There is no inheritance;
//! the [`Entity`] trait only ties a struct to its collection and its
//! document form.

use crate::consensus;
use crate::tags::{parse_as_years, parse_da, parse_da_tm, TagRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Opaque document identifier.
pub type DocId = Uuid;

/// Data model version stamped into every `_metadata` block.
pub const MODEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Missing tag: {0}")]
    MissingTag(String),

    #[error("Invalid value: {}", .0.to_lowercase())]
    InvalidValue(String),

    #[error("Serialization error: {}", .0.to_lowercase())]
    Serialization(String),

    #[error("{0} is not below any of the configured mount paths")]
    UnknownMount(String),
}

impl From<crate::tags::Error> for Error {
    fn from(err: crate::tags::Error) -> Self {
        Error::InvalidValue(format!("{err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creation/modification bookkeeping embedded in every persisted document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub model_version: String,
    pub created: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

impl Metadata {
    pub fn create() -> Self {
        Self {
            model_version: MODEL_VERSION.into(),
            created: Utc::now(),
            modified: None,
            project_name: None,
        }
    }

    pub fn for_project(project_name: Option<&str>) -> Self {
        Self {
            project_name: project_name.map(Into::into),
            ..Self::create()
        }
    }
}

/// Pointer to a file below a named drive. `rel_path` is relative to wherever
/// the drive is mounted, because the same drive is mounted at different paths
/// on different machines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileSource {
    pub drive_name: String,
    pub rel_path: String,
    pub filename: String,
}

impl FileSource {
    pub fn new(drive_name: impl Into<String>, rel_path: impl Into<String>) -> Self {
        let rel_path = rel_path.into();
        let filename = Path::new(&rel_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            drive_name: drive_name.into(),
            rel_path,
            filename,
        }
    }

    /// Build a source from an absolute path by matching it against the
    /// configured `drive name -> mount path` map.
    pub fn from_mount_paths(filepath: &Path, mount_paths: &BTreeMap<String, PathBuf>) -> Result<Self> {
        for (drive_name, mount_path) in mount_paths {
            if let Ok(rel_path) = filepath.strip_prefix(mount_path) {
                return Ok(Self::new(drive_name.clone(), rel_path.to_string_lossy()));
            }
        }
        Err(Error::UnknownMount(filepath.display().to_string()))
    }

    pub fn local_path(&self, mount_paths: &BTreeMap<String, PathBuf>) -> Option<PathBuf> {
        mount_paths
            .get(&self.drive_name)
            .map(|mount| mount.join(&self.rel_path))
    }
}

/// A persisted entity: a collection name plus document serialization.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn id(&self) -> Option<DocId>;
    fn set_id(&mut self, id: DocId);

    fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|err| Error::Serialization(format!("{err}")))
    }

    fn from_document(document: Value) -> Result<Self> {
        serde_json::from_value(document).map_err(|err| Error::Serialization(format!("{err}")))
    }
}

/// One DICOM instance with pixel data; only the headers are stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<DocId>,

    pub tags: TagRecord,
    pub file_source: FileSource,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<DocId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_id: Option<DocId>,

    /// Alternate locations, e.g. after de-identified re-export.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aka_file_sources: Option<Vec<FileSource>>,

    #[serde(rename = "_metadata")]
    pub metadata: Metadata,
}

impl ImageMetadata {
    pub fn new(tags: TagRecord, file_source: FileSource, project_name: Option<&str>) -> Self {
        Self {
            id: None,
            tags,
            file_source,
            series_id: None,
            study_id: None,
            aka_file_sources: None,
            metadata: Metadata::for_project(project_name),
        }
    }
}

impl Entity for ImageMetadata {
    const COLLECTION: &'static str = "ImageMetadata";

    fn id(&self) -> Option<DocId> {
        self.id
    }

    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

/// Aggregation of images sharing a SeriesInstanceUID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RadiologicalSeries {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<DocId>,

    pub tags: TagRecord,
    pub series_uid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_id: Option<DocId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDateTime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,

    /// Count of images actually grouped, not the InstanceNumber tag.
    pub image_count: u64,

    /// (rows, columns), only when the tags of all images agree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_shape: Option<(u32, u32)>,

    #[serde(rename = "_metadata")]
    pub metadata: Metadata,
}

impl RadiologicalSeries {
    /// Build a series from a consensus tag record. The series identifier is
    /// required; everything else degrades to `None`.
    pub fn from_consensus(tags: &TagRecord, project_name: Option<&str>) -> Result<Self> {
        let series_uid = tags
            .first_str("SeriesInstanceUID")
            .ok_or_else(|| Error::MissingTag("SeriesInstanceUID".into()))?
            .to_owned();
        let date = parse_da_tm(
            tags.first_str("SeriesDate").unwrap_or("00000000"),
            tags.first_str("SeriesTime").unwrap_or("000000"),
        )
        .ok()
        .flatten();
        let rows = tags.first_i64("Rows");
        let columns = tags.first_i64("Columns");
        let image_shape = match (rows, columns) {
            (Some(rows), Some(columns)) => Some((rows as u32, columns as u32)),
            _ => None,
        };
        Ok(Self {
            id: None,
            tags: tags.clone(),
            series_uid,
            study_id: None,
            date,
            description: tags.first_str("SeriesDescription").map(Into::into),
            protocol_name: tags.first_str("ProtocolName").map(Into::into),
            image_count: 0,
            image_shape,
            metadata: Metadata::for_project(project_name),
        })
    }
}

impl Entity for RadiologicalSeries {
    const COLLECTION: &'static str = "RadiologicalSeries";

    fn id(&self) -> Option<DocId> {
        self.id
    }

    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

/// Aggregation of images by (patient identifier, study date).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RadiologicalStudy {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<DocId>,

    pub tags: TagRecord,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<DocId>,

    /// All distinct StudyInstanceUIDs seen in the group; more than one is
    /// possible because the grouping key is patient + date, not the UID.
    pub study_uid: Vec<String>,

    pub date: NaiveDateTime,

    /// Count of distinct series actually grouped, not the SeriesNumber tag.
    pub series_count: u64,

    pub modality: Vec<String>,
    pub sop_class: Vec<String>,
    pub accession_number: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_age: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_weight: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_height: Option<f64>,

    #[serde(rename = "_metadata")]
    pub metadata: Metadata,
}

impl RadiologicalStudy {
    /// Build a study from a consensus tag record. The study date is part of
    /// the grouping key, so a missing or unparseable date is an error and the
    /// group is skipped by the caller.
    pub fn from_consensus(tags: &TagRecord, project_name: Option<&str>) -> Result<Self> {
        let date = parse_da_tm(
            tags.first_str("StudyDate")
                .ok_or_else(|| Error::MissingTag("StudyDate".into()))?,
            tags.first_str("StudyTime").unwrap_or("000000"),
        )?
        .ok_or_else(|| Error::InvalidValue("study date is the null sentinel".into()))?;
        let patient_age = match tags.first_str("PatientAge") {
            Some(age) => Some(parse_as_years(age)?),
            None => None,
        };
        Ok(Self {
            id: None,
            tags: tags.clone(),
            patient_id: None,
            study_uid: Vec::new(),
            date,
            series_count: 0,
            modality: Vec::new(),
            sop_class: Vec::new(),
            accession_number: Vec::new(),
            description: tags.first_str("StudyDescription").map(Into::into),
            patient_age,
            patient_weight: tags.first_f64("PatientWeight"),
            patient_height: tags.first_f64("PatientSize"),
            metadata: Metadata::for_project(project_name),
        })
    }

    /// Fill the set-valued fields from the full list of child records.
    pub fn fill_unions(&mut self, records: &[TagRecord]) {
        self.study_uid = string_union(records, "StudyInstanceUID");
        self.modality = string_union(records, "Modality");
        self.sop_class = string_union(records, "SOPClassUID");
        self.accession_number = string_union(records, "AccessionNumber");
        self.series_count = consensus::set_union(records, "SeriesInstanceUID")
            .map(|uids| uids.len() as u64)
            .unwrap_or(0);
    }
}

fn string_union(records: &[TagRecord], keyword: &str) -> Vec<String> {
    consensus::set_union(records, keyword)
        .unwrap_or_default()
        .iter()
        .map(crate::tags::canonical)
        .collect()
}

impl Entity for RadiologicalStudy {
    const COLLECTION: &'static str = "RadiologicalStudy";

    fn id(&self) -> Option<DocId> {
        self.id
    }

    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

/// A unique person; terminal entity of the hierarchy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Patient {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<DocId>,

    /// Anonymized patient identifier; unique within a database.
    pub anon_id: String,

    pub hidden: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,

    #[serde(rename = "_metadata")]
    pub metadata: Metadata,
}

impl Patient {
    pub fn from_consensus(tags: &TagRecord) -> Result<Self> {
        let anon_id = tags
            .first_str("PatientID")
            .ok_or_else(|| Error::MissingTag("PatientID".into()))?
            .to_owned();
        let birth_date = match tags.first_str("PatientBirthDate") {
            Some(date) => parse_da(date)?,
            None => None,
        };
        Ok(Self {
            id: None,
            anon_id,
            hidden: false,
            birth_date,
            metadata: Metadata::create(),
        })
    }
}

impl Entity for Patient {
    const COLLECTION: &'static str = "Patient";

    fn id(&self) -> Option<DocId> {
        self.id
    }

    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}
