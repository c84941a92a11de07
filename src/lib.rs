//! Progressive aggregation of flat DICOM metadata records into an
//! image / series / study / patient hierarchy in a document store, with
//! field-level de-identification and deterministic anonymized export paths.
//!
//! The typical flow: [`ingest`] walks a tree of exported JSON tag records
//! into the image collection, the [`grouping`] stages build the hierarchy on
//! top of it, and [`deid`] plus [`paths`] turn a record into its anonymized
//! form and its content-addressed location on the export drive.

pub mod batch;
pub mod consensus;
pub mod deid;
pub mod grouping;
pub mod hashing;
pub mod ingest;
pub mod model;
pub mod paths;
pub mod store;
pub mod tags;

pub use deid::{FieldAction, Pseudonymizer, Recipe};
pub use hashing::{Blake3Hasher, Hasher};
pub use model::{ImageMetadata, Patient, RadiologicalSeries, RadiologicalStudy};
pub use tags::{TagElement, TagRecord};
