//! Deterministic, anonymized filesystem paths for de-identified re-export.
//!
//! Every image maps to
//! `<id[0:3]>/<id[3:6]>/<id[6:24]>/study_<YYYYDDMM>/series_<MODALITY>_<HHMMSS>_<desc>/<instance>.dcm`
//! where `id` is the 64-char hex hash of the patient identifier. The 3/3/18
//! split balances directory fan-out because the hash is near-uniform.

use crate::tags::{parse_da_tm, TagRecord};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

static NON_ALPHANUMERIC: OnceLock<Regex> = OnceLock::new();

const ANON_ID_LENGTH: usize = 64;
const UNKNOWN_PATIENT_SEGMENT: &str = "UNK_PatientID";
const UNKNOWN: &str = "UNK";
const INSTANCE_EXTENSION: &str = "dcm";

// sentinel for studies without a usable date; a real study date of 1900-01-01
// is not expected in radiological data
fn sentinel_study_date() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .expect("valid sentinel date")
        .and_hms_opt(0, 0, 0)
        .expect("valid sentinel time")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid anonymized id: {}", .0.to_lowercase())]
    InvalidAnonId(String),

    #[error("Missing tag: {0}")]
    MissingTag(String),

    #[error("Invalid tag value: {}", .0.to_lowercase())]
    InvalidValue(String),
}

impl From<crate::tags::Error> for Error {
    fn from(err: crate::tags::Error) -> Self {
        Error::InvalidValue(format!("{err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn sanitize(description: &str) -> String {
    let regex = NON_ALPHANUMERIC.get_or_init(|| Regex::new(r"[^a-zA-Z0-9]").unwrap());
    regex.replace_all(description, "-").into_owned()
}

/// Patient directory from the first 12 bytes (24 hex chars) of the anonymized
/// patient id, split 3/3/18. A malformed id is a caller bug, not a recoverable
/// condition, so anything that is not exactly 64 hex chars is rejected.
pub fn patient_dir(patient_anon_id: Option<&str>) -> Result<PathBuf> {
    let Some(id) = patient_anon_id else {
        return Ok(PathBuf::from(UNKNOWN_PATIENT_SEGMENT));
    };
    if id.len() != ANON_ID_LENGTH {
        return Err(Error::InvalidAnonId(format!(
            "expected {ANON_ID_LENGTH} hex chars, got {} in {id:?}",
            id.len()
        )));
    }
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidAnonId(format!("non-hex characters in {id:?}")));
    }
    Ok([&id[0..3], &id[3..6], &id[6..24]].iter().collect())
}

/// Study directory below the patient directory. A study is identified by
/// patient + date, so the segment carries the date only.
pub fn study_dir(
    patient_anon_id: Option<&str>,
    study_date: Option<NaiveDateTime>,
) -> Result<PathBuf> {
    let date = study_date.unwrap_or_else(sentinel_study_date);
    let mut dir = patient_dir(patient_anon_id)?;
    dir.push(format!("study_{}", date.format("%Y%d%m")));
    Ok(dir)
}

/// Series directory derived from the tag record: modality, series time (or
/// series number, or `UNK`) and the sanitized series description.
pub fn series_dir(record: &TagRecord) -> Result<PathBuf> {
    // unparseable dates degrade to the sentinel/fallback segments; only the
    // anon id and the instance uid are hard requirements
    let study_dt = parse_da_tm(
        record.first_str("StudyDate").unwrap_or("00000000"),
        record.first_str("StudyTime").unwrap_or("000000"),
    )
    .ok()
    .flatten();
    let series_dt = parse_da_tm(
        record.first_str("SeriesDate").unwrap_or("00000000"),
        record.first_str("SeriesTime").unwrap_or("000000"),
    )
    .ok()
    .flatten();
    let series_key = match series_dt {
        Some(dt) => dt.format("%H%M%S").to_string(),
        None => record
            .first_i64("SeriesNumber")
            .map(|n| n.to_string())
            .unwrap_or_else(|| UNKNOWN.into()),
    };
    let modality = record.first_str("Modality").unwrap_or(UNKNOWN);
    let description = record.first_str("SeriesDescription").unwrap_or(UNKNOWN);
    let patient_id = record.first_str("PatientID");

    let mut dir = study_dir(patient_id, study_dt)?;
    dir.push(format!("series_{modality}_{series_key}_{}", sanitize(description)));
    Ok(dir)
}

/// Full relative path for one instance, unique per SOPInstanceUID.
pub fn instance_path(record: &TagRecord) -> Result<PathBuf> {
    let instance_uid = record
        .first_str("SOPInstanceUID")
        .ok_or_else(|| Error::MissingTag("SOPInstanceUID".into()))?;
    let mut path = series_dir(record)?;
    path.push(format!("{instance_uid}.{INSTANCE_EXTENSION}"));
    Ok(path)
}
