//! Order-independent reducers that compute a consensus tag record from the
//! records of all children sharing a grouping key.

use crate::tags::{canonical, canonical_element, TagElement, TagRecord};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Keeps a keyword only if it is present in every record and all values agree
/// in canonical string form.
pub fn strict_intersection(records: &[TagRecord]) -> TagRecord {
    let mut result = TagRecord::new();
    let Some(first) = records.first() else {
        return result;
    };
    for keyword in first.keywords() {
        let values: Vec<&TagElement> = records
            .iter()
            .filter_map(|record| record.get(keyword))
            .filter(|element| !element.is_missing())
            .collect();
        if values.len() == records.len() && all_agree(&values) {
            result.insert(keyword.clone(), representative(&values).clone());
        }
    }
    result
}

/// Keeps a keyword if it is present in strictly more than half of the records
/// and all records that have it agree on the value in canonical string form.
///
/// A keyword present in exactly half or fewer is dropped even when all present
/// values agree: with `n` records the keyword must appear in at least
/// `n / 2 + 1` of them. Ties favor exclusion.
pub fn majority_intersection(records: &[TagRecord]) -> TagRecord {
    let mut result = TagRecord::new();
    let majority = records.len() / 2 + 1;
    let all_keywords: BTreeSet<&String> = records.iter().flat_map(TagRecord::keywords).collect();
    for keyword in all_keywords {
        let values: Vec<&TagElement> = records
            .iter()
            .filter_map(|record| record.get(keyword))
            .filter(|element| !element.is_missing())
            .collect();
        if values.len() >= majority && all_agree(&values) {
            result.insert(keyword.clone(), representative(&values).clone());
        }
    }
    result
}

/// Majority vote for a single keyword: the value held by strictly more than
/// half of the records wins, even when a minority disagrees. Returns `None`
/// when no value reaches the majority. With `n` records the threshold is
/// `n / 2 + 1`; ties favor exclusion.
pub fn majority_vote(records: &[TagRecord], keyword: &str) -> Option<TagElement> {
    let majority = records.len() / 2 + 1;
    // tally per canonical form, tracking candidate elements per form
    let mut tally: BTreeMap<String, (usize, Vec<&TagElement>)> = BTreeMap::new();
    for record in records {
        let Some(element) = record.get(keyword) else {
            continue;
        };
        let Some(form) = canonical_element(element) else {
            continue;
        };
        let entry = tally.entry(form).or_default();
        entry.0 += 1;
        entry.1.push(element);
    }
    tally
        .values()
        .find(|(count, _)| *count >= majority)
        .map(|(_, elements)| representative(elements).clone())
}

/// Union of all values for a keyword across the records, with multi-valued
/// elements expanded. Returns `None` when no record has the keyword; otherwise
/// a sorted, deduplicated list so the result is reproducible.
pub fn set_union(records: &[TagRecord], keyword: &str) -> Option<Vec<Value>> {
    let mut seen = BTreeSet::new();
    let mut values = Vec::new();
    let mut found = false;
    for record in records {
        let Some(element) = record.get(keyword) else {
            continue;
        };
        if element.is_missing() {
            continue;
        }
        found = true;
        let items: Vec<&Value> = match element.value.as_ref() {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => vec![other],
            None => continue,
        };
        for item in items {
            if seen.insert(canonical(item)) {
                values.push(item.clone());
            }
        }
    }
    if !found {
        return None;
    }
    values.sort_by_key(|value| canonical(value));
    Some(values)
}

fn all_agree(values: &[&TagElement]) -> bool {
    let mut canonicals = values.iter().map(|element| canonical_element(element));
    match canonicals.next() {
        Some(first) => canonicals.all(|value| value == first),
        None => false,
    }
}

// All candidates agree canonically, but their JSON representation may still
// differ (e.g. 1 vs "1"). Picking the one with the smallest serialized form
// keeps the output identical under any permutation of the input records.
fn representative<'a>(values: &[&'a TagElement]) -> &'a TagElement {
    values
        .iter()
        .min_by_key(|element| serde_json::to_string(element).unwrap_or_default())
        .expect("representative requires at least one value")
}
