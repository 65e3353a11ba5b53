//! Condition evaluation

use super::context::Job;
use super::{resolver, Processor};
use crate::cache::CacheKey;
use crate::error::Result;
use crate::model::DefinitionKind;

impl Processor<'_> {
    /// Evaluate a `When`. Turning active schedules its subtree; turning
    /// inactive prunes it and withdraws everything it held.
    pub(super) fn process_condition(&mut self, job: Job) -> Result<()> {
        let model = self.model;
        self.ctx.evaluated_conditions.insert(job.clone());

        let (definition, scope) = &job;
        if !self.is_container_active(*definition, scope) {
            return Ok(());
        }
        let node = model.node(*definition);
        let DefinitionKind::When { dependencies, test } = &node.kind else {
            return Ok(());
        };

        self.ctx.evaluations += 1;
        let indices = self.indices_for(*definition, scope)?;
        let resolved = resolver(&*self.state, &mut self.ctx.memo).resolve_dependency(dependencies, &indices)?;
        let holds = test(&resolved);

        let mut path = self.container_path(*definition, scope);
        path.push(CacheKey::Definition(*definition));
        let cached = self.state.root.descendant_or_insert(&path);
        if cached.is_path_active == holds {
            return Ok(());
        }
        cached.is_path_active = holds;

        if holds {
            log::debug!("{} became active in scope {:?}", model.describe(*definition), scope);
            self.run_subtree(&path, &node.children, scope)
        } else {
            log::debug!("{} became inactive in scope {:?}", model.describe(*definition), scope);
            let contents = cached.take_contents();
            self.retract(contents, scope)
        }
    }
}
