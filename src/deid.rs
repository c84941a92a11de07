//! Field-level de-identification of tag records.
//!
//! A [`Recipe`] maps DICOM keywords to a [`FieldAction`]; the
//! [`Pseudonymizer`] applies the recipe to a record and strips private tags.
//! Hash-based actions go through the configured [`Hasher`], so the same
//! input record under the same salt always yields the same pseudonyms.

use crate::hashing::{self, Hasher};
use crate::tags::{canonical, parse_da, TagElement, TagRecord};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

static TAG_NUMBER: OnceLock<Regex> = OnceLock::new();

// DICOM UI values are capped at 64 chars
const UID_MAX_LENGTH: usize = 64;
const UID_ROOT: &str = "2.25.";
const ANONYMOUS_NAME: &str = "ANONYMOUS";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Hash(#[from] hashing::Error),

    #[error("Invalid value for {keyword}: {}", .reason.to_lowercase())]
    InvalidValue { keyword: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What to do with one keyword during de-identification.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAction {
    /// Replace the value with its 64-char hex digest.
    Hash,
    /// Replace a UID with a hash-derived UID under the `2.25` root.
    HashUid,
    /// Truncate a date to the first of its month.
    RemoveDay,
    /// Round an age string to the nearest multiple of `interval` years.
    RoundAgeTo { interval: u32 },
    /// Replace a person name with a fixed placeholder.
    ReplaceName,
    /// Replace the value with a literal.
    Replace(String),
    /// Keep the keyword with an empty value.
    Empty,
    /// Drop the keyword entirely.
    Remove,
    /// Keep the value unchanged.
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recipe {
    actions: BTreeMap<String, FieldAction>,
}

impl Recipe {
    pub fn builder() -> RecipeBuilder {
        RecipeBuilder::default()
    }

    pub fn action(&self, keyword: &str) -> Option<&FieldAction> {
        self.actions.get(keyword)
    }

    pub fn keywords(&self) -> impl Iterator<Item = &String> {
        self.actions.keys()
    }

    /// Recipe covering the directly identifying fields of radiological
    /// exports. Keywords without a rule pass through unchanged.
    pub fn default_recipe() -> Self {
        Self::builder()
            .action("PatientID", FieldAction::Hash)
            .action("OtherPatientIDs", FieldAction::Remove)
            .action("PatientName", FieldAction::ReplaceName)
            .action("PatientBirthDate", FieldAction::RemoveDay)
            .action("PatientAge", FieldAction::RoundAgeTo { interval: 5 })
            .action("PatientAddress", FieldAction::Remove)
            .action("PatientTelephoneNumbers", FieldAction::Remove)
            .action("AccessionNumber", FieldAction::Hash)
            .action("StudyInstanceUID", FieldAction::HashUid)
            .action("SeriesInstanceUID", FieldAction::HashUid)
            .action("SOPInstanceUID", FieldAction::HashUid)
            .action("FrameOfReferenceUID", FieldAction::HashUid)
            .action("ReferringPhysicianName", FieldAction::ReplaceName)
            .action("PerformingPhysicianName", FieldAction::ReplaceName)
            .action("OperatorsName", FieldAction::Remove)
            .action("InstitutionName", FieldAction::Empty)
            .action("InstitutionAddress", FieldAction::Remove)
            .action("StationName", FieldAction::Remove)
            .action("DeviceSerialNumber", FieldAction::Remove)
            .build()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecipeBuilder {
    actions: BTreeMap<String, FieldAction>,
}

impl RecipeBuilder {
    pub fn action(mut self, keyword: impl Into<String>, action: FieldAction) -> Self {
        self.actions.insert(keyword.into(), action);
        self
    }

    pub fn build(self) -> Recipe {
        Recipe {
            actions: self.actions,
        }
    }
}

/// A flat record uses the bare 8-digit tag number as the key when the tag has
/// no keyword; an odd group number marks a private tag.
fn is_private_tag(keyword: &str) -> bool {
    let regex = TAG_NUMBER.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{8}$").unwrap());
    if !regex.is_match(keyword) {
        return false;
    }
    u32::from_str_radix(&keyword[..4], 16)
        .map(|group| group % 2 == 1)
        .unwrap_or(false)
}

pub struct Pseudonymizer<H> {
    recipe: Recipe,
    hasher: H,
    strip_private: bool,
}

impl<H: Hasher> Pseudonymizer<H> {
    pub fn new(recipe: Recipe, hasher: H) -> Self {
        Self {
            recipe,
            hasher,
            strip_private: true,
        }
    }

    pub fn keep_private_tags(mut self) -> Self {
        self.strip_private = false;
        self
    }

    pub fn pseudonymize(&self, record: &TagRecord) -> Result<TagRecord> {
        let mut result = TagRecord::new();
        for (keyword, element) in &record.0 {
            if self.strip_private && is_private_tag(keyword) {
                continue;
            }
            match self.recipe.action(keyword).unwrap_or(&FieldAction::Keep) {
                FieldAction::Remove => continue,
                FieldAction::Keep => {
                    result.insert(keyword.clone(), element.clone());
                }
                FieldAction::Empty => {
                    result.insert(keyword.clone(), TagElement::empty(element.vr.clone()));
                }
                FieldAction::Replace(literal) => {
                    result.insert(
                        keyword.clone(),
                        TagElement::new(
                            element.vr.clone(),
                            Value::Array(vec![Value::String(literal.clone())]),
                        ),
                    );
                }
                FieldAction::ReplaceName => {
                    result.insert(
                        keyword.clone(),
                        TagElement::new(
                            element.vr.clone(),
                            Value::Array(vec![Value::String(ANONYMOUS_NAME.into())]),
                        ),
                    );
                }
                action => {
                    result.insert(
                        keyword.clone(),
                        self.apply_to_values(keyword, element, action)?,
                    );
                }
            }
        }
        Ok(result)
    }

    fn apply_to_values(
        &self,
        keyword: &str,
        element: &TagElement,
        action: &FieldAction,
    ) -> Result<TagElement> {
        let Some(value) = element.value.as_ref() else {
            return Ok(element.clone());
        };
        let items: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        let mut mapped = Vec::with_capacity(items.len());
        for item in items {
            mapped.push(Value::String(self.apply_to_value(keyword, item, action)?));
        }
        Ok(TagElement::new(element.vr.clone(), Value::Array(mapped)))
    }

    fn apply_to_value(&self, keyword: &str, value: &Value, action: &FieldAction) -> Result<String> {
        let text = canonical(value);
        match action {
            FieldAction::Hash => Ok(self.hasher.hash_hex(&text)?),
            FieldAction::HashUid => {
                let digest = self.hasher.hash_decimal(&text)?;
                let mut uid = format!("{UID_ROOT}{digest}");
                uid.truncate(UID_MAX_LENGTH);
                Ok(uid)
            }
            FieldAction::RemoveDay => match parse_da(&text).map_err(|err| Error::InvalidValue {
                keyword: keyword.to_string(),
                reason: format!("{err}"),
            })? {
                Some(date) => Ok(date.format("%Y%m01").to_string()),
                None => Ok(text),
            },
            FieldAction::RoundAgeTo { interval } => {
                let years = crate::tags::parse_as_years(&text).map_err(|err| Error::InvalidValue {
                    keyword: keyword.to_string(),
                    reason: format!("{err}"),
                })?;
                let interval = (*interval).max(1);
                let rounded = (years + interval / 2) / interval * interval;
                Ok(format!("{rounded:03}Y"))
            }
            // remaining variants never reach here
            _ => Ok(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing;
    use serde_json::json;

    struct FakeHasher;

    impl Hasher for FakeHasher {
        fn hash_hex(&self, input: &str) -> hashing::Result<String> {
            Ok(format!("hex({input})"))
        }

        fn hash_decimal(&self, input: &str) -> hashing::Result<String> {
            Ok(format!("123{}", input.len()))
        }
    }

    fn record(pairs: &[(&str, &str, Value)]) -> TagRecord {
        let mut record = TagRecord::new();
        for (keyword, vr, value) in pairs {
            record.insert(*keyword, TagElement::new(*vr, value.clone()));
        }
        record
    }

    #[test]
    fn test_hash_patient_id() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("PatientID", "LO", json!(["P1"]))]))
            .unwrap();
        assert_eq!(result.first_str("PatientID"), Some("hex(P1)"));
    }

    #[test]
    fn test_hash_uid_has_root_and_fits() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), crate::hashing::Blake3Hasher::new("salt"));
        let result = pseudonymizer
            .pseudonymize(&record(&[("SOPInstanceUID", "UI", json!(["1.2.3"]))]))
            .unwrap();
        let uid = result.first_str("SOPInstanceUID").unwrap();
        assert!(uid.starts_with("2.25."));
        assert!(uid.len() <= 64);
        assert!(uid[5..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_remove_day_keeps_month() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("PatientBirthDate", "DA", json!(["19701231"]))]))
            .unwrap();
        assert_eq!(result.first_str("PatientBirthDate"), Some("19701201"));
    }

    #[test]
    fn test_remove_day_passes_null_sentinel() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("PatientBirthDate", "DA", json!(["00000000"]))]))
            .unwrap();
        assert_eq!(result.first_str("PatientBirthDate"), Some("00000000"));
    }

    #[test]
    fn test_round_age() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("PatientAge", "AS", json!(["043Y"]))]))
            .unwrap();
        assert_eq!(result.first_str("PatientAge"), Some("045Y"));
    }

    #[test]
    fn test_replace_name_and_remove() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[
                ("PatientName", "PN", json!(["Doe^Jane"])),
                ("PatientAddress", "LO", json!(["1 Main St"])),
                ("Modality", "CS", json!(["MR"])),
            ]))
            .unwrap();
        assert_eq!(result.first_str("PatientName"), Some("ANONYMOUS"));
        assert!(result.get("PatientAddress").is_none());
        assert_eq!(result.first_str("Modality"), Some("MR"));
    }

    #[test]
    fn test_empty_keeps_keyword_without_value() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("InstitutionName", "LO", json!(["General Hospital"]))]))
            .unwrap();
        let element = result.get("InstitutionName").unwrap();
        assert!(element.is_missing());
        assert_eq!(element.vr, "LO");
    }

    #[test]
    fn test_private_tags_are_stripped() {
        let pseudonymizer = Pseudonymizer::new(Recipe::default_recipe(), FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[
                ("00091001", "LO", json!(["vendor secret"])),
                ("Modality", "CS", json!(["MR"])),
            ]))
            .unwrap();
        assert!(result.get("00091001").is_none());
        assert!(result.get("Modality").is_some());
    }

    #[test]
    fn test_private_tags_kept_on_request() {
        let pseudonymizer =
            Pseudonymizer::new(Recipe::default_recipe(), FakeHasher).keep_private_tags();
        let result = pseudonymizer
            .pseudonymize(&record(&[("00091001", "LO", json!(["vendor"]))]))
            .unwrap();
        assert!(result.get("00091001").is_some());
    }

    #[test]
    fn test_even_group_tag_number_is_not_private() {
        assert!(!is_private_tag("00080060"));
        assert!(is_private_tag("00091001"));
        assert!(!is_private_tag("Modality"));
    }

    #[test]
    fn test_custom_recipe_replace_literal() {
        let recipe = Recipe::builder()
            .action("StudyDescription", FieldAction::Replace("REDACTED".into()))
            .build();
        let pseudonymizer = Pseudonymizer::new(recipe, FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("StudyDescription", "LO", json!(["brain tumor"]))]))
            .unwrap();
        assert_eq!(result.first_str("StudyDescription"), Some("REDACTED"));
    }

    #[test]
    fn test_multi_valued_elements_map_each_item() {
        let recipe = Recipe::builder()
            .action("OtherPatientNames", FieldAction::Hash)
            .build();
        let pseudonymizer = Pseudonymizer::new(recipe, FakeHasher);
        let result = pseudonymizer
            .pseudonymize(&record(&[("OtherPatientNames", "PN", json!(["A", "B"]))]))
            .unwrap();
        let element = result.get("OtherPatientNames").unwrap();
        assert_eq!(element.value, Some(json!(["hex(A)", "hex(B)"])));
    }
}
