//! Annotation evaluation

use super::context::{Job, VisitState};
use super::{resolver, Processor};
use crate::error::{EngineError, Result};
use crate::model::DefinitionKind;
use crate::path::{AnnotationKey, FieldPath, PathExpr, Segment, VALUE_ANNOTATION};
use crate::resolver::AnnotationToken;

impl Processor<'_> {
    /// Evaluate `job` if it is dirty, after every annotation it reads.
    ///
    /// A job reached again while its prerequisites are being visited depends
    /// on itself.
    pub(super) fn visit_annotation(&mut self, job: Job) -> Result<()> {
        let was_dirty = self.ctx.dirty_annotations.remove(&job);
        match self.ctx.visits.get(&job) {
            Some(VisitState::Processed) => {
                if was_dirty {
                    self.ctx.next_annotations.insert(job);
                }
                return Ok(());
            }
            Some(VisitState::Processing) => return Err(self.cycle_error(&job)),
            None => {}
        }

        if !self.is_container_active(job.0, &job.1) {
            self.ctx.visits.insert(job, VisitState::Processed);
            return Ok(());
        }

        self.ctx.visits.insert(job.clone(), VisitState::Processing);
        for prerequisite in self.prerequisites(&job)? {
            self.visit_annotation(prerequisite)?;
        }
        if was_dirty | self.ctx.dirty_annotations.remove(&job) {
            self.evaluate_annotation(&job)?;
        }
        self.ctx.visits.insert(job, VisitState::Processed);
        Ok(())
    }

    /// Annotation instances whose values `job` reads
    fn prerequisites(&mut self, job: &Job) -> Result<Vec<Job>> {
        let model = self.model;
        let (definition, scope) = job;
        let DefinitionKind::Annotate { context, value, .. } = &model.node(*definition).kind else {
            return Ok(Vec::new());
        };

        let mut lookups: Vec<(PathExpr, AnnotationKey)> = Vec::new();
        let mut collect = |path: &PathExpr| {
            if let Some(target) = path.annotation_target() {
                lookups.push(target);
            }
        };
        value.for_each_path(&mut collect);
        for segment in context.segments() {
            if let Segment::Filter(filter) = segment {
                if let Some(deps) = &filter.dependencies {
                    deps.for_each_path(&mut collect);
                }
            }
        }
        if lookups.is_empty() {
            return Ok(Vec::new());
        }

        let indices = self.indices_for(*definition, scope)?;
        let mut jobs = Vec::new();
        for (target, key) in lookups {
            let fields = resolver(&*self.state, &mut self.ctx.memo).resolve_fields(&target, &indices)?;
            for field in &fields {
                for &annotator in model.annotators(&key) {
                    let DefinitionKind::Annotate { context, .. } = &model.node(annotator).kind else {
                        continue;
                    };
                    if let Some(binding) = context.canonical().match_field(field, true) {
                        for scope in self.expand_scopes(annotator, &binding)? {
                            jobs.push((annotator, scope));
                        }
                    }
                }
            }
        }
        Ok(jobs)
    }

    fn evaluate_annotation(&mut self, job: &Job) -> Result<()> {
        let model = self.model;
        let (definition, scope) = job;
        let DefinitionKind::Annotate { context, key, value } = &model.node(*definition).kind else {
            return Ok(());
        };
        self.ctx.evaluations += 1;
        log::trace!("Evaluating {} in scope {:?}", model.describe(*definition), scope);

        let indices = self.indices_for(*definition, scope)?;
        let fields = resolver(&*self.state, &mut self.ctx.memo).resolve_fields(context, &indices)?;
        let token = AnnotationToken {
            key: key.clone(),
            fields: fields.iter().map(ToString::to_string).collect(),
        };
        let resolved = resolver(&*self.state, &mut self.ctx.memo)
            .resolving(&token)
            .resolve_dependency(value, &indices)?;

        let container = self.container_path(*definition, scope);
        let node = self.state.root.descendant_or_insert(&container);
        let stale: Vec<FieldPath> = node
            .annotated_fields(*definition)
            .into_iter()
            .filter(|field| !fields.contains(field))
            .collect();
        for field in &stale {
            if let Some(holders) = node.annotations.get_mut(field) {
                holders.remove(definition);
                if holders.is_empty() {
                    node.annotations.remove(field);
                }
            }
        }
        for field in &fields {
            node.annotations
                .entry(field.clone())
                .or_default()
                .insert(*definition, resolved.clone());
        }

        for field in &stale {
            if self.state.annotations.retract(&field.to_string(), key, job) {
                self.annotation_changed(field, key)?;
            }
        }
        for field in &fields {
            if self
                .state
                .annotations
                .set(&field.to_string(), key, job.clone(), resolved.clone())
            {
                self.annotation_changed(field, key)?;
            }
            if key == VALUE_ANNOTATION {
                self.write_back(field)?;
            }
        }
        Ok(())
    }

    /// Patch the live data with the resolved `value` annotation of `field`
    fn write_back(&mut self, field: &FieldPath) -> Result<()> {
        let Some(value) = self
            .state
            .annotations
            .get(&field.to_string(), VALUE_ANNOTATION)
            .cloned()
        else {
            return Ok(());
        };
        if field.set(&mut self.state.data, value) {
            log::trace!("Wrote computed value back to '{}'", field);
            self.data_written(field)?;
        }
        Ok(())
    }

    fn cycle_error(&mut self, job: &Job) -> EngineError {
        let model = self.model;
        let (definition, scope) = job;
        let DefinitionKind::Annotate { context, key, .. } = &model.node(*definition).kind else {
            return EngineError::cycle(model.describe(*definition), "");
        };
        let field = self
            .indices_for(*definition, scope)
            .and_then(|indices| resolver(&*self.state, &mut self.ctx.memo).resolve_fields(context, &indices))
            .map(|fields| {
                fields
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|_| context.to_string());
        EngineError::cycle(field, key.as_str())
    }
}

