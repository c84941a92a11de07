//! Progressive grouping of images into series, studies and patients.
//!
//! Each stage enumerates proto-groups (grouping key plus child ids) from the
//! store, then processes them in batches on a worker pool. A malformed group
//! is logged and skipped so one bad export cannot stall the pipeline; store
//! errors abort the stage after in-flight batches drain.

mod patient;
mod series;
mod study;

pub use patient::PatientStage;
pub use series::SeriesStage;
pub use study::StudyStage;

use crate::batch::{batches, Coordinator};
use crate::store::{self, ProtoGroup};
use serde_json::Value;
use std::ops::AddAssign;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The group cannot produce a valid parent entity. Recoverable: the
    /// runner logs it and moves on to the next group.
    #[error("Skipping group {key}: {}", .reason.to_lowercase())]
    SkipGroup { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn group_key(group: &ProtoGroup) -> String {
    serde_json::to_string(&group.key).unwrap_or_default()
}

pub(crate) fn skip(group: &ProtoGroup, reason: impl ToString) -> Error {
    Error::SkipGroup {
        key: group_key(group),
        reason: reason.to_string(),
    }
}

/// Progress counters of one stage run. `seen` counts groups examined,
/// `persisted` counts parent entities newly inserted; a re-run over the same
/// data sees the same groups but persists nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageReport {
    pub seen: u64,
    pub persisted: u64,
}

impl AddAssign for StageReport {
    fn add_assign(&mut self, other: Self) {
        self.seen += other.seen;
        self.persisted += other.persisted;
    }
}

pub trait GroupingStage: Sync {
    fn name(&self) -> &'static str;

    /// Preferred batch size when the caller does not pick one. Stages that
    /// fetch many children per group keep this small.
    fn default_batch_size(&self) -> usize {
        50
    }

    /// Enumerate all groups this stage would process.
    fn proto_groups(&self) -> store::Result<Vec<ProtoGroup>>;

    /// Persist the parent entity of one group and link its children.
    /// Returns the number of newly inserted parents (0 or 1).
    fn process_group(&self, group: &ProtoGroup) -> Result<u64>;
}

fn process_batch<S: GroupingStage + ?Sized>(stage: &S, batch: &[ProtoGroup]) -> Result<StageReport> {
    let mut report = StageReport::default();
    for group in batch {
        report.seen += 1;
        match stage.process_group(group) {
            Ok(persisted) => report.persisted += persisted,
            Err(Error::SkipGroup { key, reason }) => {
                log::error!("{}: skipping group {key}: {reason}", stage.name());
            }
            Err(err @ Error::Store(_)) => return Err(err),
        }
    }
    Ok(report)
}

/// Run one stage to completion: enumerate, batch, fan out.
pub fn run_stage<S: GroupingStage + ?Sized>(
    stage: &S,
    coordinator: &Coordinator,
    batch_size: usize,
) -> Result<StageReport> {
    let groups = stage.proto_groups()?;
    log::info!(
        "{}: {} groups on {} workers",
        stage.name(),
        groups.len(),
        coordinator.workers()
    );
    let (reports, error) = coordinator.run(batches(&groups, batch_size), |batch| {
        process_batch(stage, &batch)
    });
    let mut total = StageReport::default();
    for report in reports {
        total += report;
    }
    log::info!(
        "{}: seen {} groups, persisted {} entities",
        stage.name(),
        total.seen,
        total.persisted
    );
    match error {
        Some(err) => Err(err),
        None => Ok(total),
    }
}

/// Shared helper: the scalar key component at `index`, as a string.
pub(crate) fn key_str(group: &ProtoGroup, index: usize) -> Option<&str> {
    match group.key.get(index) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}
