//! Per-update scratch state
//!
//! Created at the start of one update and dropped at its end. Nothing here
//! outlives the update; the session only keeps what ends up in
//! [`EngineState`](super::EngineState).

use std::collections::{BTreeSet, HashMap};

use crate::cache::{HolderId, Scope};
use crate::model::DefinitionId;
use crate::path::FieldPath;
use crate::resolver::ComputedMemo;

/// One definition instance to process
pub(crate) type Job = HolderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VisitState {
    Processing,
    Processed,
}

#[derive(Default)]
pub(crate) struct ProcessingContext {
    /// Annotation visits of the current pass
    pub visits: HashMap<Job, VisitState>,
    pub dirty_annotations: BTreeSet<Job>,
    /// Annotations re-dirtied after being processed in the current pass
    pub next_annotations: BTreeSet<Job>,
    pub dirty_conditions: BTreeSet<Job>,
    pub evaluated_conditions: BTreeSet<Job>,
    pub next_conditions: BTreeSet<Job>,
    /// Validations run once, after annotations and conditions settled
    pub pending_validations: BTreeSet<Job>,
    pub memo: ComputedMemo,
    /// Resolved field of each array instance
    pub array_fields: HashMap<(DefinitionId, Scope), FieldPath>,
    pub passes: usize,
    pub changed_annotations: BTreeSet<(String, String)>,
    pub changed_errors: BTreeSet<String>,
    pub evaluations: usize,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A job still being visited is evaluated after its prerequisites, so it
    /// stays in the current pass; a processed one waits for the next pass.
    pub fn schedule_annotation(&mut self, job: Job) {
        match self.visits.get(&job) {
            Some(VisitState::Processed) => {
                self.next_annotations.insert(job);
            }
            Some(VisitState::Processing) | None => {
                self.dirty_annotations.insert(job);
            }
        }
    }

    pub fn schedule_condition(&mut self, job: Job) {
        if self.evaluated_conditions.contains(&job) {
            self.next_conditions.insert(job);
        } else {
            self.dirty_conditions.insert(job);
        }
    }

    pub fn schedule_validation(&mut self, job: Job) {
        self.pending_validations.insert(job);
    }

    pub fn has_next_pass(&self) -> bool {
        !self.next_annotations.is_empty() || !self.next_conditions.is_empty()
    }

    /// Start the next pass with everything re-dirtied during this one
    pub fn begin_next_pass(&mut self) {
        self.passes += 1;
        self.visits.clear();
        self.evaluated_conditions.clear();
        self.memo.clear();
        self.dirty_annotations.append(&mut self.next_annotations);
        self.dirty_conditions.append(&mut self.next_conditions);
    }

    /// Values computed so far may read data or annotations that just changed
    pub fn invalidate_memo(&mut self) {
        self.memo.clear();
    }

    pub fn invalidate_arrays(&mut self) {
        self.array_fields.clear();
    }
}
