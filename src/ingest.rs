//! Ingestion of exported tag records into the image collection.
//!
//! Walks a directory tree of flat JSON tag records and inserts one
//! [`ImageMetadata`] per file, keyed on SOPInstanceUID. Files that fail to
//! parse are logged and counted, never fatal; re-ingesting the same tree is
//! a no-op thanks to the unique index.

use crate::model::{self, FileSource, ImageMetadata};
use crate::store::{self, Db, ImageStore};
use crate::tags::TagRecord;
use rayon::iter::{ParallelBridge, ParallelIterator};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fs, io};
use thiserror::Error;
use walkdir::WalkDir;

const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing tag in {path}: {keyword}")]
    MissingTag { path: PathBuf, keyword: String },

    #[error(transparent)]
    Model(#[from] model::Error),

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IngestReport {
    /// Record files encountered.
    pub seen: u64,
    /// Images newly inserted.
    pub persisted: u64,
    /// Files that failed to parse or persist.
    pub failed: u64,
}

impl AddAssign for IngestReport {
    fn add_assign(&mut self, other: Self) {
        self.seen += other.seen;
        self.persisted += other.persisted;
        self.failed += other.failed;
    }
}

pub struct Ingestor {
    images: ImageStore,
    mount_paths: BTreeMap<String, PathBuf>,
    project_name: Option<String>,
}

impl Ingestor {
    pub fn new(db: Db, mount_paths: BTreeMap<String, PathBuf>, project_name: Option<String>) -> Self {
        Self {
            images: ImageStore::new(db),
            mount_paths,
            project_name,
        }
    }

    /// Ingest one tag record file. Returns true when the image was new.
    pub fn ingest_file(&self, path: &Path) -> Result<bool> {
        let raw = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let tags: TagRecord = serde_json::from_str(&raw).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        // the unique key cannot be null, two keyless records would collide
        if tags.first("SOPInstanceUID").is_none() {
            return Err(Error::MissingTag {
                path: path.to_path_buf(),
                keyword: "SOPInstanceUID".into(),
            });
        }
        let file_source = FileSource::from_mount_paths(path, &self.mount_paths)?;
        let image = ImageMetadata::new(tags, file_source, self.project_name.as_deref());
        let (_, inserted) = self.images.insert_or_get(image)?;
        Ok(inserted)
    }

    /// Walk `dir` and ingest every record file in parallel.
    pub fn ingest_dir(&self, dir: &Path) -> IngestReport {
        let seen = AtomicU64::new(0);
        let persisted = AtomicU64::new(0);
        let failed = AtomicU64::new(0);

        WalkDir::new(dir)
            .into_iter()
            .par_bridge()
            .for_each(|entry| match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if !entry.file_type().is_file() || !has_record_extension(path) {
                        return;
                    }
                    seen.fetch_add(1, Ordering::Relaxed);
                    match self.ingest_file(path) {
                        Ok(true) => {
                            persisted.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {
                            log::debug!("already ingested: {}", path.display());
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            log::error!("{err}");
                        }
                    }
                }
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    log::error!("walk error below {}: {err}", dir.display());
                }
            });

        let report = IngestReport {
            seen: seen.into_inner(),
            persisted: persisted.into_inner(),
            failed: failed.into_inner(),
        };
        log::info!(
            "ingest: seen {} files, persisted {} images, {} failures",
            report.seen,
            report.persisted,
            report.failed
        );
        report
    }
}

fn has_record_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(RECORD_EXTENSION))
        .unwrap_or(false)
}
