//! Image -> series stage: groups images by SeriesInstanceUID.

use super::{key_str, skip, GroupingStage, Result};
use crate::consensus;
use crate::model::RadiologicalSeries;
use crate::store::{self, Db, Filter, ImageStore, ProtoGroup, SeriesStore};
use crate::tags::{TagElement, TagRecord};
use serde_json::json;

const KEY_PATH: &str = "tags.SeriesInstanceUID.Value";

// scalar fields filled by majority vote when the agreement-based consensus
// drops them, e.g. one mislabeled CT image among MR images
const VOTE_KEYWORDS: &[&str] = &["Modality"];

pub struct SeriesStage {
    images: ImageStore,
    series: SeriesStore,
    project_name: Option<String>,
}

impl SeriesStage {
    pub fn new(db: Db, project_name: Option<String>) -> Self {
        Self {
            images: ImageStore::new(db.clone()),
            series: SeriesStore::new(db),
            project_name,
        }
    }
}

impl GroupingStage for SeriesStage {
    fn name(&self) -> &'static str {
        "series"
    }

    fn default_batch_size(&self) -> usize {
        100
    }

    fn proto_groups(&self) -> store::Result<Vec<ProtoGroup>> {
        self.images
            .entities()
            .group_by(&Filter::new().exists(KEY_PATH, true), &[KEY_PATH])
    }

    fn process_group(&self, group: &ProtoGroup) -> Result<u64> {
        let children = self.images.entities().by_ids(&group.child_ids)?;
        let records: Vec<TagRecord> = children.iter().map(|child| child.tags.clone()).collect();

        let mut tags = consensus::majority_intersection(&records);
        for keyword in VOTE_KEYWORDS {
            if tags.get(keyword).is_none() {
                if let Some(element) = consensus::majority_vote(&records, keyword) {
                    tags.insert(*keyword, element);
                }
            }
        }
        // the grouping key is authoritative even when the full elements of
        // the children disagree
        if tags.get("SeriesInstanceUID").is_none() {
            if let Some(uid) = key_str(group, 0) {
                tags.insert("SeriesInstanceUID", TagElement::new("UI", json!([uid])));
            }
        }

        let mut series = RadiologicalSeries::from_consensus(&tags, self.project_name.as_deref())
            .map_err(|err| skip(group, err))?;
        series.image_count = children.len() as u64;

        let (series, inserted) = self.series.insert_or_get(series)?;
        let series_id = series
            .id
            .ok_or_else(|| store::Error::Backend("persisted series has no id".into()))?;
        if !inserted && series.image_count != children.len() as u64 {
            self.series.entities().update_fields(
                series_id,
                &[("image_count".into(), json!(children.len() as u64))],
            )?;
        }
        for child in &children {
            if child.series_id == Some(series_id) {
                continue;
            }
            let child_id = child
                .id
                .ok_or_else(|| store::Error::Backend("fetched image has no id".into()))?;
            self.images.set_series_id(child_id, series_id)?;
        }
        Ok(u64::from(inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Coordinator;
    use crate::grouping::run_stage;
    use crate::model::{FileSource, ImageMetadata};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn image(uid: &str, series_uid: &str, modality: &str) -> ImageMetadata {
        let mut tags = TagRecord::new();
        tags.insert("SOPInstanceUID", TagElement::new("UI", json!([uid])));
        tags.insert("SeriesInstanceUID", TagElement::new("UI", json!([series_uid])));
        tags.insert("Modality", TagElement::new("CS", json!([modality])));
        tags.insert("Rows", TagElement::new("US", json!([512])));
        tags.insert("Columns", TagElement::new("US", json!([512])));
        ImageMetadata::new(tags, FileSource::new("drive_a", format!("{uid}.dcm")), None)
    }

    fn seed(db: &Db, images: &[ImageMetadata]) {
        let store = ImageStore::new(db.clone());
        for image in images {
            store.insert_or_get(image.clone()).unwrap();
        }
    }

    #[test]
    fn test_groups_images_into_series() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "MR"),
                image("1.2", "s1", "MR"),
                image("2.1", "s2", "CT"),
            ],
        );
        let stage = SeriesStage::new(db.clone(), Some("proj".into()));
        let report = run_stage(&stage, &Coordinator::new(2), 10).unwrap();
        assert_eq!(report.seen, 2);
        assert_eq!(report.persisted, 2);

        let series = SeriesStore::new(db.clone())
            .entities()
            .find(&Filter::new().eq("series_uid", json!("s1")))
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].image_count, 2);
        assert_eq!(series[0].image_shape, Some((512, 512)));
        assert_eq!(series[0].metadata.project_name.as_deref(), Some("proj"));

        let linked = ImageStore::new(db)
            .entities()
            .find(&Filter::new().eq("series_id", json!(series[0].id.unwrap())))
            .unwrap();
        assert_eq!(linked.len(), 2);
    }

    #[test]
    fn test_rerun_persists_nothing() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(&db, &[image("1.1", "s1", "MR"), image("1.2", "s1", "MR")]);
        let stage = SeriesStage::new(db, None);
        let coordinator = Coordinator::new(1);
        let first = run_stage(&stage, &coordinator, 10).unwrap();
        assert_eq!(first.persisted, 1);
        let second = run_stage(&stage, &coordinator, 10).unwrap();
        assert_eq!(second.seen, 1);
        assert_eq!(second.persisted, 0);
    }

    #[test]
    fn test_modality_filled_by_vote() {
        let db: Db = Arc::new(MemoryStore::new());
        seed(
            &db,
            &[
                image("1.1", "s1", "MR"),
                image("1.2", "s1", "MR"),
                image("1.3", "s1", "CT"),
            ],
        );
        let stage = SeriesStage::new(db.clone(), None);
        run_stage(&stage, &Coordinator::new(1), 10).unwrap();
        let series = SeriesStore::new(db)
            .entities()
            .find(&Filter::new())
            .unwrap();
        assert_eq!(series[0].tags.first_str("Modality"), Some("MR"));
    }

    #[test]
    fn test_images_without_series_uid_are_not_grouped() {
        let db: Db = Arc::new(MemoryStore::new());
        let mut tags = TagRecord::new();
        tags.insert("SOPInstanceUID", TagElement::new("UI", json!(["1.1"])));
        let orphan = ImageMetadata::new(tags, FileSource::new("drive_a", "1.1.dcm"), None);
        seed(&db, &[orphan]);
        let stage = SeriesStage::new(db, None);
        let report = run_stage(&stage, &Coordinator::new(1), 10).unwrap();
        assert_eq!(report.seen, 0);
    }
}
