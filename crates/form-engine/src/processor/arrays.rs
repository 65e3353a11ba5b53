//! Array structure: scheduling subtrees, syncing lengths, pruning

use serde_json::Value;

use super::{resolver, Processor};
use crate::cache::{CacheKey, CacheNode, Scope};
use crate::error::{EngineError, Result};
use crate::model::{DefinitionId, DefinitionKind};
use crate::path::{CurrentIndices, FieldPath, Origin};

fn extend(scope: &[usize], index: usize) -> Scope {
    let mut scope = scope.to_vec();
    scope.push(index);
    scope
}

fn child_path(path: &[CacheKey], key: CacheKey) -> Vec<CacheKey> {
    let mut path = path.to_vec();
    path.push(key);
    path
}

impl Processor<'_> {
    /// Schedule every definition in `definitions` for evaluation, expanding
    /// arrays over the live data. Conditions are scheduled but not entered:
    /// their children are scheduled once they turn active.
    pub(super) fn run_subtree(
        &mut self,
        path: &[CacheKey],
        definitions: &[DefinitionId],
        scope: &[usize],
    ) -> Result<()> {
        let model = self.model;
        for &definition in definitions {
            let job = (definition, scope.to_vec());
            match &model.node(definition).kind {
                DefinitionKind::Annotate { .. } => self.ctx.schedule_annotation(job),
                DefinitionKind::Validate { .. } => self.ctx.schedule_validation(job),
                DefinitionKind::When { .. } => {
                    self.state
                        .root
                        .descendant_or_insert(&child_path(path, CacheKey::Definition(definition)));
                    self.ctx.schedule_condition(job);
                }
                DefinitionKind::Array { .. } => {
                    let array_path = child_path(path, CacheKey::Definition(definition));
                    self.state.root.descendant_or_insert(&array_path);
                    let (_, len) = self.array_len(definition, scope)?;
                    self.grow(&array_path, definition, scope, 0, len)?;
                }
            }
        }
        Ok(())
    }

    fn grow(
        &mut self,
        array_path: &[CacheKey],
        array: DefinitionId,
        scope: &[usize],
        from: usize,
        to: usize,
    ) -> Result<()> {
        let model = self.model;
        let children = &model.node(array).children;
        for index in from..to {
            let element_path = child_path(array_path, CacheKey::Index(index));
            self.state.root.descendant_or_insert(&element_path);
            self.run_subtree(&element_path, children, &extend(scope, index))?;
        }
        Ok(())
    }

    /// Match the cache tree's array elements to the live data: drop the
    /// elements past the new length, schedule the new ones, and recurse
    /// into the ones that stayed.
    pub(super) fn sync_arrays(
        &mut self,
        path: &[CacheKey],
        definitions: &[DefinitionId],
        scope: &[usize],
    ) -> Result<()> {
        let model = self.model;
        for &definition in definitions {
            let node = model.node(definition);
            match &node.kind {
                DefinitionKind::When { .. } => {
                    let when_path = child_path(path, CacheKey::Definition(definition));
                    let active = self
                        .state
                        .root
                        .descendant(&when_path)
                        .is_some_and(|n| n.is_path_active);
                    if active {
                        self.sync_arrays(&when_path, &node.children, scope)?;
                    }
                }
                DefinitionKind::Array { .. } => {
                    let array_path = child_path(path, CacheKey::Definition(definition));
                    let old_len = self
                        .state
                        .root
                        .descendant(&array_path)
                        .map_or(0, CacheNode::element_count);
                    let (field, new_len) = self.array_len(definition, scope)?;

                    if new_len < old_len {
                        log::debug!("Array '{}' shrank from {} to {} elements", field, old_len, new_len);
                        for index in new_len..old_len {
                            let removed = self
                                .state
                                .root
                                .descendant_mut(&array_path)
                                .and_then(|n| n.children.remove(&CacheKey::Index(index)));
                            if let Some(removed) = removed {
                                self.retract(removed, &extend(scope, index))?;
                            }
                        }
                    }

                    for index in 0..old_len.min(new_len) {
                        let element_path = child_path(&array_path, CacheKey::Index(index));
                        self.sync_arrays(&element_path, &node.children, &extend(scope, index))?;
                    }

                    if new_len > old_len {
                        log::debug!("Array '{}' grew from {} to {} elements", field, old_len, new_len);
                        self.state.root.descendant_or_insert(&array_path);
                        self.grow(&array_path, definition, scope, old_len, new_len)?;
                    }
                }
                DefinitionKind::Annotate { .. } | DefinitionKind::Validate { .. } => {}
            }
        }
        Ok(())
    }

    /// Withdraw every annotation and error held by a pruned cache subtree
    pub(super) fn retract(&mut self, node: CacheNode, scope: &[usize]) -> Result<()> {
        let model = self.model;

        for (field, holders) in node.annotations {
            let rendered = field.to_string();
            for definition in holders.into_keys() {
                let Some(key) = model.annotation_key(definition) else {
                    continue;
                };
                let holder = (definition, scope.to_vec());
                if self.state.annotations.retract(&rendered, key, &holder) {
                    self.annotation_changed(&field, key)?;
                }
            }
        }

        for (definition, fields) in node.errors {
            let holder = (definition, scope.to_vec());
            for field in fields.into_keys() {
                let rendered = field.to_string();
                if self.state.errors.retract(&rendered, &holder) {
                    self.ctx.changed_errors.insert(rendered);
                }
            }
        }

        for (key, child) in node.children {
            match key {
                CacheKey::Index(index) => self.retract(child, &extend(scope, index))?,
                CacheKey::Definition(_) => self.retract(child, scope)?,
            }
        }
        Ok(())
    }

    /// Field denoted by the context of an array instance
    pub(super) fn array_field(&mut self, array: DefinitionId, scope: &[usize]) -> Result<FieldPath> {
        let key = (array, scope.to_vec());
        if let Some(field) = self.ctx.array_fields.get(&key) {
            return Ok(field.clone());
        }

        let model = self.model;
        let DefinitionKind::Array { context } = &model.node(array).kind else {
            return Ok(FieldPath::root());
        };
        let indices = self.indices_for(array, scope)?;
        let mut fields = resolver(&*self.state, &mut self.ctx.memo).resolve_fields(context, &indices)?;
        if fields.len() != 1 {
            return Err(EngineError::ArrayContextNotSingular {
                path: context.to_string(),
            });
        }
        let field = fields.remove(0);
        self.ctx.array_fields.insert(key, field.clone());
        Ok(field)
    }

    /// Field and live length of an array instance
    pub(super) fn array_len(&mut self, array: DefinitionId, scope: &[usize]) -> Result<(FieldPath, usize)> {
        let field = self.array_field(array, scope)?;
        let root = match &self.model.node(array).kind {
            DefinitionKind::Array { context } if context.origin() == Origin::External => &self.state.external,
            _ => &self.state.data,
        };
        let len = field.get(root).and_then(Value::as_array).map_or(0, Vec::len);
        Ok((field, len))
    }

    /// Every array scope of `definition` compatible with `bindings`.
    ///
    /// Enclosing arrays bound by `bindings` contribute their bound index,
    /// the others every live index. An empty array yields no scope at all,
    /// so nothing inside it is re-run.
    pub(super) fn expand_scopes(&mut self, definition: DefinitionId, bindings: &CurrentIndices) -> Result<Vec<Scope>> {
        let arrays: Vec<DefinitionId> = self.model.array_ancestors(definition).collect();
        let mut scopes: Vec<Scope> = vec![Vec::new()];

        for array in arrays {
            let mut next = Vec::new();
            for scope in scopes {
                let (field, len) = self.array_len(array, &scope)?;
                match bindings.get(&field.to_string()) {
                    Some(&index) if index < len => next.push(extend(&scope, index)),
                    Some(_) => {}
                    None => next.extend((0..len).map(|index| extend(&scope, index))),
                }
            }
            scopes = next;
        }
        Ok(scopes)
    }
}
