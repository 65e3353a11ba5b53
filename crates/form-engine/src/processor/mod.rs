//! Incremental processor
//!
//! Drives one update of a session through its phases:
//!
//! 1. **Structure**: on the initial update every reachable definition is
//!    scheduled; afterwards array lengths are synced against the cache tree
//!    and every indexed data path is diffed against the previous data.
//! 2. **Annotations and conditions**: dirty annotations are evaluated, each
//!    after the annotations it reads. Then one dirty condition is evaluated,
//!    outermost first, and the loop starts over, since a condition turning
//!    active schedules its whole subtree. Definitions re-dirtied after they
//!    ran are deferred to another pass; the number of passes is bounded.
//! 3. **Validations**: every scheduled validation in an active scope runs
//!    once.
//!
//! A [`Processor`] borrows the session state for the duration of one update
//! and owns only the short-lived [`ProcessingContext`].

mod annotations;
mod arrays;
mod conditions;
mod context;
mod validations;

use std::collections::BTreeSet;

use serde_json::Value;

use crate::cache::{CacheKey, CacheNode, ResolvedAnnotations, ResolvedErrors};
use crate::config::SessionConfig;
use crate::dependency_cache::ReferenceKind;
use crate::diff::{changed_bindings, EqualityFn};
use crate::error::{EngineError, Result};
use crate::model::{DefinitionId, DefinitionKind, Model};
use crate::path::{CurrentIndices, FieldPath, Origin};
use crate::resolver::{ComputedMemo, Resolver};

use context::ProcessingContext;

/// Everything a session keeps between updates
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineState {
    pub data: Value,
    pub external: Value,
    pub previous_data: Value,
    pub previous_external: Value,
    pub root: CacheNode,
    pub annotations: ResolvedAnnotations,
    pub errors: ResolvedErrors,
    pub initialized: bool,
}

impl EngineState {
    pub fn new(external: Value) -> Self {
        Self {
            external,
            ..Self::default()
        }
    }

    /// Forget every result, keeping nothing but the external data
    pub fn reset(&mut self, external: Value) {
        *self = Self::new(external);
    }
}

/// What an update changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// `(field, key)` pairs whose resolved annotation changed
    pub changed_annotations: BTreeSet<(String, String)>,
    /// Fields whose error list changed
    pub changed_errors: BTreeSet<String>,
    /// Definitions evaluated
    pub evaluations: usize,
    /// Passes taken to stabilize
    pub passes: usize,
}

impl UpdateOutcome {
    pub fn is_empty(&self) -> bool {
        self.changed_annotations.is_empty() && self.changed_errors.is_empty()
    }

    /// Fold a later outcome into this one
    pub fn merge(&mut self, other: UpdateOutcome) {
        self.changed_annotations.extend(other.changed_annotations);
        self.changed_errors.extend(other.changed_errors);
        self.evaluations += other.evaluations;
        self.passes += other.passes;
    }
}

/// A resolver over the current state
fn resolver<'r>(state: &'r EngineState, memo: &'r mut ComputedMemo) -> Resolver<'r> {
    Resolver::new(&state.data, &state.external)
        .with_previous(&state.previous_data, &state.previous_external)
        .with_annotations(state.annotations.resolved())
        .with_memo(memo)
}

pub(crate) struct Processor<'a> {
    model: &'a Model,
    state: &'a mut EngineState,
    config: &'a SessionConfig,
    ctx: ProcessingContext,
}

impl<'a> Processor<'a> {
    pub fn new(model: &'a Model, state: &'a mut EngineState, config: &'a SessionConfig) -> Self {
        Self {
            model,
            state,
            config,
            ctx: ProcessingContext::new(),
        }
    }

    /// Accept new data and bring every result up to date
    pub fn run(mut self, data: Value, external: Value, eq: EqualityFn<'_>) -> Result<UpdateOutcome> {
        let model = self.model;
        let initial = !self.state.initialized;

        let old_data = std::mem::replace(&mut self.state.data, data);
        let old_external = std::mem::replace(&mut self.state.external, external);

        if initial {
            self.state.previous_data = Value::Null;
            self.state.previous_external = Value::Null;
            self.run_subtree(&[], model.roots(), &[])?;
        } else {
            self.state.previous_data = old_data;
            self.state.previous_external = old_external;
            self.sync_arrays(&[], model.roots(), &[])?;
            self.schedule_changed_fields(eq)?;
        }

        self.stabilize()?;
        self.run_validations()?;
        self.state.initialized = true;

        log::trace!(
            "Update processed: {} evaluations over {} passes",
            self.ctx.evaluations,
            self.ctx.passes + 1
        );
        Ok(UpdateOutcome {
            changed_annotations: std::mem::take(&mut self.ctx.changed_annotations),
            changed_errors: std::mem::take(&mut self.ctx.changed_errors),
            evaluations: self.ctx.evaluations,
            passes: self.ctx.passes + 1,
        })
    }

    /// Diff every indexed data path and schedule what references a change
    fn schedule_changed_fields(&mut self, eq: EqualityFn<'_>) -> Result<()> {
        let model = self.model;
        let cache = model.dependency_cache();
        let changes: Vec<(&String, Vec<CurrentIndices>)> = cache
            .dependent_fields()
            .iter()
            .filter_map(|key| {
                let entry = cache.get(key)?;
                let (old, new) = match entry.path.origin {
                    Origin::Internal => (&self.state.previous_data, &self.state.data),
                    Origin::External => (&self.state.previous_external, &self.state.external),
                };
                let bindings = changed_bindings(&entry.path, old, new, eq);
                (!bindings.is_empty()).then_some((key, bindings))
            })
            .collect();

        if !changes.is_empty() {
            log::trace!("{} indexed paths changed", changes.len());
        }
        for (key, bindings) in changes {
            self.schedule_entry(key, &bindings)?;
        }
        Ok(())
    }

    fn stabilize(&mut self) -> Result<()> {
        loop {
            while let Some(job) = self.ctx.dirty_annotations.first().cloned() {
                self.visit_annotation(job)?;
            }

            if let Some(job) = self.ctx.dirty_conditions.pop_first() {
                self.process_condition(job)?;
                continue;
            }

            if !self.ctx.has_next_pass() {
                return Ok(());
            }
            if self.ctx.passes + 1 >= self.config.max_stabilization_passes {
                return Err(EngineError::AnnotationsDidNotStabilize {
                    passes: self.config.max_stabilization_passes,
                });
            }
            self.ctx.begin_next_pass();
        }
    }

    /// Schedule every triggering reference of a dependency cache entry under
    /// each of `bindings`
    fn schedule_entry(&mut self, key: &str, bindings: &[CurrentIndices]) -> Result<()> {
        let model = self.model;
        let Some(entry) = model.dependency_cache().get(key) else {
            return Ok(());
        };

        for (kind, reference) in entry.triggering() {
            for binding in bindings {
                for scope in self.expand_scopes(reference.definition, binding)? {
                    let job = (reference.definition, scope);
                    match kind {
                        ReferenceKind::Annotation => self.ctx.schedule_annotation(job),
                        ReferenceKind::Validation => self.ctx.schedule_validation(job),
                        ReferenceKind::Condition => self.ctx.schedule_condition(job),
                    }
                }
            }
        }
        Ok(())
    }

    /// Record a changed annotation and schedule the definitions reading it
    fn annotation_changed(&mut self, field: &FieldPath, key: &str) -> Result<()> {
        self.ctx
            .changed_annotations
            .insert((field.to_string(), key.to_string()));
        self.ctx.invalidate_memo();

        let model = self.model;
        let cache = model.dependency_cache();
        for dependency in cache.annotation_dependencies() {
            let Some(entry) = cache.get(dependency) else {
                continue;
            };
            if entry.path.annotation.as_deref() != Some(key) {
                continue;
            }
            if let Some(binding) = entry.path.match_field(field, true) {
                self.schedule_entry(dependency, &[binding])?;
            }
        }
        Ok(())
    }

    /// Schedule the definitions reading data at, above or below `field`
    fn data_written(&mut self, field: &FieldPath) -> Result<()> {
        self.ctx.invalidate_memo();
        self.ctx.invalidate_arrays();

        let model = self.model;
        let cache = model.dependency_cache();
        for dependent in cache.dependent_fields() {
            let Some(entry) = cache.get(dependent) else {
                continue;
            };
            if entry.path.origin != Origin::Internal {
                continue;
            }
            if let Some(binding) = entry.path.match_field(field, false) {
                self.schedule_entry(dependent, &[binding])?;
            }
        }
        Ok(())
    }

    /// Cache node path of the container holding the results of `definition`
    fn container_path(&self, definition: DefinitionId, scope: &[usize]) -> Vec<CacheKey> {
        let mut path = Vec::new();
        let mut indices = scope.iter();
        for ancestor in &self.model.node(definition).ancestors {
            path.push(CacheKey::Definition(*ancestor));
            if self.model.node(*ancestor).is_array() {
                if let Some(index) = indices.next() {
                    path.push(CacheKey::Index(*index));
                }
            }
        }
        path
    }

    /// Whether every enclosing condition holds and every enclosing array
    /// element exists
    fn is_container_active(&self, definition: DefinitionId, scope: &[usize]) -> bool {
        let mut node = &self.state.root;
        let mut indices = scope.iter();
        for ancestor in &self.model.node(definition).ancestors {
            let Some(child) = node.child(CacheKey::Definition(*ancestor)) else {
                return false;
            };
            node = child;
            match &self.model.node(*ancestor).kind {
                DefinitionKind::When { .. } if !node.is_path_active => return false,
                DefinitionKind::Array { .. } => {
                    let element = indices
                        .next()
                        .and_then(|index| node.child(CacheKey::Index(*index)));
                    match element {
                        Some(element) => node = element,
                        None => return false,
                    }
                }
                _ => {}
            }
        }
        true
    }

    /// `[current]` bindings of a definition instance
    fn indices_for(&mut self, definition: DefinitionId, scope: &[usize]) -> Result<CurrentIndices> {
        let arrays: Vec<DefinitionId> = self.model.array_ancestors(definition).collect();
        let mut indices = CurrentIndices::new();
        for (depth, array) in arrays.into_iter().enumerate() {
            let Some(index) = scope.get(depth) else {
                break;
            };
            let field = self.array_field(array, &scope[..depth])?;
            indices.insert(field.to_string(), *index);
        }
        Ok(indices)
    }
}
