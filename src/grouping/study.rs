//! Image -> study stage: groups images by (PatientID, StudyDate).
//!
//! Studies are keyed on patient and date rather than StudyInstanceUID, which
//! is rewritten by some exporters; all UIDs seen in the group are kept as a
//! set on the study instead. The stage also links the series of the grouped
//! images to their study.

use super::{key_str, skip, GroupingStage, Result};
use crate::consensus;
use crate::model::{DocId, RadiologicalStudy};
use crate::store::{self, Db, Filter, ImageStore, ProtoGroup, SeriesStore, StudyStore};
use crate::tags::{TagElement, TagRecord};
use serde_json::json;
use std::collections::HashSet;

const PATIENT_PATH: &str = "tags.PatientID.Value";
const DATE_PATH: &str = "tags.StudyDate.Value";

pub struct StudyStage {
    images: ImageStore,
    series: SeriesStore,
    studies: StudyStore,
    project_name: Option<String>,
}

impl StudyStage {
    pub fn new(db: Db, project_name: Option<String>) -> Self {
        Self {
            images: ImageStore::new(db.clone()),
            series: SeriesStore::new(db.clone()),
            studies: StudyStore::new(db),
            project_name,
        }
    }
}

impl GroupingStage for StudyStage {
    fn name(&self) -> &'static str {
        "study"
    }

    // study groups span whole exams, so batches stay small
    fn default_batch_size(&self) -> usize {
        20
    }

    fn proto_groups(&self) -> store::Result<Vec<ProtoGroup>> {
        let excluded = self
            .images
            .entities()
            .count(&Filter::new().exists(PATIENT_PATH, false))?;
        if excluded > 0 {
            log::warn!("{}: {excluded} images without a PatientID are not grouped", self.name());
        }
        // StudyDate is deliberately not required here: groups with a missing
        // or malformed date must surface in the skip log, not vanish
        self.images.entities().group_by(
            &Filter::new().exists(PATIENT_PATH, true),
            &[PATIENT_PATH, DATE_PATH],
        )
    }

    fn process_group(&self, group: &ProtoGroup) -> Result<u64> {
        let children = self.images.entities().by_ids(&group.child_ids)?;
        let records: Vec<TagRecord> = children.iter().map(|child| child.tags.clone()).collect();

        let mut tags = consensus::majority_intersection(&records);
        if tags.get("PatientID").is_none() {
            if let Some(patient) = key_str(group, 0) {
                tags.insert("PatientID", TagElement::new("LO", json!([patient])));
            }
        }
        if tags.get("StudyDate").is_none() {
            if let Some(date) = key_str(group, 1) {
                tags.insert("StudyDate", TagElement::new("DA", json!([date])));
            }
        }

        let mut study = RadiologicalStudy::from_consensus(&tags, self.project_name.as_deref())
            .map_err(|err| skip(group, err))?;
        study.fill_unions(&records);
        let computed = study.clone();

        let (study, inserted) = self.studies.insert_or_get(study)?;
        let study_id = study
            .id
            .ok_or_else(|| store::Error::Backend("persisted study has no id".into()))?;
        if !inserted && needs_refresh(&study, &computed) {
            self.studies.entities().update_fields(
                study_id,
                &[
                    ("study_uid".into(), json!(computed.study_uid)),
                    ("series_count".into(), json!(computed.series_count)),
                    ("modality".into(), json!(computed.modality)),
                    ("sop_class".into(), json!(computed.sop_class)),
                    ("accession_number".into(), json!(computed.accession_number)),
                ],
            )?;
        }

        let mut linked_series: HashSet<DocId> = HashSet::new();
        for child in &children {
            let child_id = child
                .id
                .ok_or_else(|| store::Error::Backend("fetched image has no id".into()))?;
            if child.study_id != Some(study_id) {
                self.images.set_study_id(child_id, study_id)?;
            }
            if let Some(series_id) = child.series_id {
                if linked_series.insert(series_id) {
                    let series = self.series.entities().by_id(series_id)?;
                    if series.study_id != Some(study_id) {
                        self.series.set_study_id(series_id, study_id)?;
                    }
                }
            }
        }
        Ok(u64::from(inserted))
    }
}

fn needs_refresh(existing: &RadiologicalStudy, computed: &RadiologicalStudy) -> bool {
    existing.study_uid != computed.study_uid
        || existing.series_count != computed.series_count
        || existing.modality != computed.modality
        || existing.sop_class != computed.sop_class
        || existing.accession_number != computed.accession_number
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Coordinator;
    use crate::grouping::{run_stage, SeriesStage};
    use crate::model::{FileSource, ImageMetadata};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn image(uid: &str, series_uid: &str, patient: &str, date: Option<&str>) -> ImageMetadata {
        let mut tags = TagRecord::new();
        tags.insert("SOPInstanceUID", TagElement::new("UI", json!([uid])));
        tags.insert("SeriesInstanceUID", TagElement::new("UI", json!([series_uid])));
        tags.insert("StudyInstanceUID", TagElement::new("UI", json!(["9.1"])));
        tags.insert("PatientID", TagElement::new("LO", json!([patient])));
        tags.insert("Modality", TagElement::new("CS", json!(["MR"])));
        if let Some(date) = date {
            tags.insert("StudyDate", TagElement::new("DA", json!([date])));
        }
        ImageMetadata::new(tags, FileSource::new("drive_a", format!("{uid}.dcm")), None)
    }

    fn seed(db: &Db, images: &[ImageMetadata]) {
        let store = ImageStore::new(db.clone());
        for image in images {
            store.insert_or_get(image.clone()).unwrap();
        }
    }

    #[test]
    fn test_groups_images_into_studies() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "P1", Some("20200101")),
                image("1.2", "s1", "P1", Some("20200101")),
                image("2.1", "s2", "P1", Some("20200101")),
                image("3.1", "s3", "P2", Some("20200101")),
            ],
        );
        let coordinator = Coordinator::new(2);
        run_stage(&SeriesStage::new(db.clone(), None), &coordinator, 10).unwrap();
        let report = run_stage(&StudyStage::new(db.clone(), None), &coordinator, 10).unwrap();
        assert_eq!(report.seen, 2);
        assert_eq!(report.persisted, 2);

        let studies = StudyStore::new(db.clone())
            .entities()
            .find(&Filter::new().eq("tags.PatientID.Value", json!("P1")))
            .unwrap();
        assert_eq!(studies.len(), 1);
        let study = &studies[0];
        assert_eq!(study.series_count, 2);
        assert_eq!(study.modality, vec!["MR"]);
        assert_eq!(study.study_uid, vec!["9.1"]);

        // both the images and their series point back at the study
        let images = ImageStore::new(db.clone())
            .entities()
            .find(&Filter::new().eq("study_id", json!(study.id.unwrap())))
            .unwrap();
        assert_eq!(images.len(), 3);
        let series = SeriesStore::new(db)
            .entities()
            .find(&Filter::new().eq("study_id", json!(study.id.unwrap())))
            .unwrap();
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_same_patient_different_dates_are_two_studies() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "P1", Some("20200101")),
                image("2.1", "s2", "P1", Some("20210615")),
            ],
        );
        let report =
            run_stage(&StudyStage::new(db, None), &Coordinator::new(1), 10).unwrap();
        assert_eq!(report.persisted, 2);
    }

    #[test]
    fn test_missing_date_group_is_skipped() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "P1", None),
                image("2.1", "s2", "P1", Some("20200101")),
            ],
        );
        let report =
            run_stage(&StudyStage::new(db, None), &Coordinator::new(1), 10).unwrap();
        assert_eq!(report.seen, 2);
        assert_eq!(report.persisted, 1);
    }

    #[test]
    fn test_images_without_patient_id_are_not_grouped() {
        let db: Db = Arc::new(MemoryStore::new());
        let mut tags = TagRecord::new();
        tags.insert("SOPInstanceUID", TagElement::new("UI", json!(["9.9"])));
        tags.insert("StudyDate", TagElement::new("DA", json!(["20200101"])));
        let orphan = ImageMetadata::new(tags, FileSource::new("drive_a", "9.9.dcm"), None);
        seed(&db, &[orphan, image("1.1", "s1", "P1", Some("20200101"))]);
        let report =
            run_stage(&StudyStage::new(db, None), &Coordinator::new(1), 10).unwrap();
        assert_eq!(report.seen, 1);
        assert_eq!(report.persisted, 1);
    }

    #[test]
    fn test_sentinel_date_group_is_skipped() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(&db, &[image("1.1", "s1", "P1", Some("00000000"))]);
        let report =
            run_stage(&StudyStage::new(db, None), &Coordinator::new(1), 10).unwrap();
        assert_eq!(report.seen, 1);
        assert_eq!(report.persisted, 0);
    }

    #[test]
    fn test_rerun_leaves_backlinks_untouched() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "P1", Some("20200101")),
                image("1.2", "s1", "P1", Some("20200101")),
            ],
        );
        let coordinator = Coordinator::new(1);
        run_stage(&SeriesStage::new(db.clone(), None), &coordinator, 10).unwrap();
        let stage = StudyStage::new(db.clone(), None);
        run_stage(&stage, &coordinator, 10).unwrap();

        let series_before = SeriesStore::new(db.clone()).entities().find(&Filter::new()).unwrap();
        let images_before = ImageStore::new(db.clone()).entities().find(&Filter::new()).unwrap();

        run_stage(&stage, &coordinator, 10).unwrap();

        let series_after = SeriesStore::new(db.clone()).entities().find(&Filter::new()).unwrap();
        let images_after = ImageStore::new(db).entities().find(&Filter::new()).unwrap();
        assert_eq!(series_after, series_before);
        assert_eq!(images_after, images_before);
    }

    #[test]
    fn test_rerun_refreshes_counts_without_new_studies() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(&db, &[image("1.1", "s1", "P1", Some("20200101"))]);
        let coordinator = Coordinator::new(1);
        let stage = StudyStage::new(db.clone(), None);
        run_stage(&stage, &coordinator, 10).unwrap();

        seed(&db, &[image("2.1", "s2", "P1", Some("20200101"))]);
        let report = run_stage(&stage, &coordinator, 10).unwrap();
        assert_eq!(report.persisted, 0);
        let studies = StudyStore::new(db).entities().find(&Filter::new()).unwrap();
        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].series_count, 2);
    }
}
