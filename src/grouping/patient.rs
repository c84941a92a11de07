//! Study -> patient stage: groups studies by their PatientID consensus.

use super::{key_str, skip, GroupingStage, Result};
use crate::consensus;
use crate::model::Patient;
use crate::store::{self, Db, Filter, PatientStore, ProtoGroup, StudyStore};
use crate::tags::{TagElement, TagRecord};
use serde_json::json;

const PATIENT_PATH: &str = "tags.PatientID.Value";

pub struct PatientStage {
    studies: StudyStore,
    patients: PatientStore,
}

impl PatientStage {
    pub fn new(db: Db) -> Self {
        Self {
            studies: StudyStore::new(db.clone()),
            patients: PatientStore::new(db),
        }
    }
}

impl GroupingStage for PatientStage {
    fn name(&self) -> &'static str {
        "patient"
    }

    fn default_batch_size(&self) -> usize {
        20
    }

    fn proto_groups(&self) -> store::Result<Vec<ProtoGroup>> {
        self.studies
            .entities()
            .group_by(&Filter::new().exists(PATIENT_PATH, true), &[PATIENT_PATH])
    }

    fn process_group(&self, group: &ProtoGroup) -> Result<u64> {
        let children = self.studies.entities().by_ids(&group.child_ids)?;
        let records: Vec<TagRecord> = children.iter().map(|child| child.tags.clone()).collect();

        let mut tags = consensus::majority_intersection(&records);
        if tags.get("PatientID").is_none() {
            if let Some(patient) = key_str(group, 0) {
                tags.insert("PatientID", TagElement::new("LO", json!([patient])));
            }
        }

        let patient = Patient::from_consensus(&tags).map_err(|err| skip(group, err))?;
        let (patient, inserted) = self.patients.insert_or_get(patient)?;
        let patient_id = patient
            .id
            .ok_or_else(|| store::Error::Backend("persisted patient has no id".into()))?;
        for child in &children {
            if child.patient_id == Some(patient_id) {
                continue;
            }
            let child_id = child
                .id
                .ok_or_else(|| store::Error::Backend("fetched study has no id".into()))?;
            self.studies.set_patient_id(child_id, patient_id)?;
        }
        Ok(u64::from(inserted))
    }
}
