//! Validation evaluation

use std::collections::BTreeMap;

use serde_json::Value;

use super::context::Job;
use super::{resolver, Processor};
use crate::error::Result;
use crate::model::DefinitionKind;
use crate::path::FieldPath;

/// Flatten a validator result into a list of errors
pub(crate) fn collect_errors(result: Value) -> Vec<Value> {
    match result {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().filter(|item| !item.is_null()).collect(),
        other => vec![other],
    }
}

impl Processor<'_> {
    /// Run every scheduled validation whose scope is still active
    pub(super) fn run_validations(&mut self) -> Result<()> {
        while let Some(job) = self.ctx.pending_validations.pop_first() {
            self.run_validation(job)?;
        }
        Ok(())
    }

    fn run_validation(&mut self, job: Job) -> Result<()> {
        let model = self.model;
        let (definition, scope) = &job;
        if !self.is_container_active(*definition, scope) {
            return Ok(());
        }
        let DefinitionKind::Validate {
            context,
            dependencies,
            validators,
        } = &model.node(*definition).kind
        else {
            return Ok(());
        };

        self.ctx.evaluations += 1;
        log::trace!("Evaluating {} in scope {:?}", model.describe(*definition), scope);

        let indices = self.indices_for(*definition, scope)?;
        let mut lookup = resolver(&*self.state, &mut self.ctx.memo);
        let subjects = lookup.resolve_entries(context, &indices)?;
        let resolved_deps = match dependencies {
            Some(deps) => lookup.resolve_dependency(deps, &indices)?,
            None => Value::Null,
        };

        let results: BTreeMap<FieldPath, Vec<Value>> = subjects
            .into_iter()
            .map(|(field, value)| {
                let errors = validators
                    .iter()
                    .flat_map(|validate| collect_errors(validate(&value, &resolved_deps)))
                    .collect();
                (field, errors)
            })
            .collect();

        let container = self.container_path(*definition, scope);
        let previous = self
            .state
            .root
            .descendant_or_insert(&container)
            .errors
            .insert(*definition, results.clone())
            .unwrap_or_default();

        for field in previous.keys().filter(|field| !results.contains_key(*field)) {
            let rendered = field.to_string();
            if self.state.errors.retract(&rendered, &job) {
                self.ctx.changed_errors.insert(rendered);
            }
        }
        for (field, errors) in results {
            let rendered = field.to_string();
            if self.state.errors.set(&rendered, job.clone(), errors) {
                self.ctx.changed_errors.insert(rendered);
            }
        }
        Ok(())
    }
}
