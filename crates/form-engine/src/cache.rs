//! Result caches
//!
//! Two views of the same results are kept in sync by the processor:
//!
//! - A tree of [`CacheNode`]s mirroring the active shape of the definition
//!   tree. Each `When` and each array element gets its own node, so pruning
//!   a subtree finds everything it held.
//! - Flat maps keyed by rendered field path, which are what callers read.
//!
//! Several definitions may annotate or validate the same field. Each one is
//! a holder identified by `(definition, array scope)`; the flat maps keep
//! every holder and expose the result of the last one for annotations and
//! the concatenation of all of them for errors.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::DefinitionId;
use crate::path::FieldPath;
use crate::resolver::AnnotationMap;

/// Array indices of a definition instance, one per enclosing `Array`
pub type Scope = Vec<usize>;

/// A definition instance holding a result
pub type HolderId = (DefinitionId, Scope);

/// Key of a child cache node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// The node of a `When` or `Array` definition
    Definition(DefinitionId),
    /// One element of the enclosing array
    Index(usize),
}

/// One node of the result cache tree
#[derive(Debug, Clone, Default)]
pub struct CacheNode {
    /// Meaningful for `When` nodes only: whether the condition holds
    pub is_path_active: bool,
    /// field -> annotating definition -> value
    pub annotations: BTreeMap<FieldPath, BTreeMap<DefinitionId, Value>>,
    /// validating definition -> field -> errors
    pub errors: BTreeMap<DefinitionId, BTreeMap<FieldPath, Vec<Value>>>,
    pub children: BTreeMap<CacheKey, CacheNode>,
}

impl CacheNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self, key: CacheKey) -> Option<&CacheNode> {
        self.children.get(&key)
    }

    /// Follow `path` from this node
    pub fn descendant(&self, path: &[CacheKey]) -> Option<&CacheNode> {
        path.iter().try_fold(self, |node, key| node.children.get(key))
    }

    pub fn descendant_mut(&mut self, path: &[CacheKey]) -> Option<&mut CacheNode> {
        path.iter().try_fold(self, |node, key| node.children.get_mut(key))
    }

    /// Follow `path`, creating missing nodes
    pub fn descendant_or_insert(&mut self, path: &[CacheKey]) -> &mut CacheNode {
        path.iter()
            .fold(self, |node, key| node.children.entry(*key).or_default())
    }

    /// Number of array elements below an `Array` node
    pub fn element_count(&self) -> usize {
        self.children
            .keys()
            .filter(|key| matches!(key, CacheKey::Index(_)))
            .count()
    }

    /// Fields `definition` currently annotates in this node
    pub fn annotated_fields(&self, definition: DefinitionId) -> Vec<FieldPath> {
        self.annotations
            .iter()
            .filter(|(_, holders)| holders.contains_key(&definition))
            .map(|(field, _)| field.clone())
            .collect()
    }

    /// Remove everything this node holds, leaving its activity flag
    pub fn take_contents(&mut self) -> CacheNode {
        CacheNode {
            is_path_active: false,
            annotations: std::mem::take(&mut self.annotations),
            errors: std::mem::take(&mut self.errors),
            children: std::mem::take(&mut self.children),
        }
    }
}

/// Resolved annotations, flat, with every holder kept
#[derive(Debug, Clone, Default)]
pub struct ResolvedAnnotations {
    holders: BTreeMap<String, BTreeMap<String, BTreeMap<HolderId, Value>>>,
    resolved: AnnotationMap,
}

impl ResolvedAnnotations {
    /// The winning value of every annotated field
    pub fn resolved(&self) -> &AnnotationMap {
        &self.resolved
    }

    pub fn get(&self, field: &str, key: &str) -> Option<&Value> {
        self.resolved.get(field).and_then(|keys| keys.get(key))
    }

    /// Set the value of one holder; returns `true` when the resolved value
    /// of `(field, key)` changed
    pub fn set(&mut self, field: &str, key: &str, holder: HolderId, value: Value) -> bool {
        self.holders
            .entry(field.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(holder, value);
        self.refresh(field, key)
    }

    /// Drop one holder; returns `true` when the resolved value changed
    pub fn retract(&mut self, field: &str, key: &str, holder: &HolderId) -> bool {
        let Some(keys) = self.holders.get_mut(field) else {
            return false;
        };
        let Some(holders) = keys.get_mut(key) else {
            return false;
        };
        if holders.remove(holder).is_none() {
            return false;
        }
        if holders.is_empty() {
            keys.remove(key);
        }
        if keys.is_empty() {
            self.holders.remove(field);
        }
        self.refresh(field, key)
    }

    fn refresh(&mut self, field: &str, key: &str) -> bool {
        let winner = self
            .holders
            .get(field)
            .and_then(|keys| keys.get(key))
            .and_then(|holders| holders.values().next_back())
            .cloned();
        let current = self.get(field, key);
        if current == winner.as_ref() {
            return false;
        }

        match winner {
            Some(value) => {
                self.resolved
                    .entry(field.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
            None => {
                if let Some(keys) = self.resolved.get_mut(field) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.resolved.remove(field);
                    }
                }
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.holders.clear();
        self.resolved.clear();
    }
}

/// Resolved validation errors, flat, with every holder kept
#[derive(Debug, Clone, Default)]
pub struct ResolvedErrors {
    holders: BTreeMap<String, BTreeMap<HolderId, Vec<Value>>>,
}

/// Errors of every field that has any
pub type ErrorMap = BTreeMap<String, Vec<Value>>;

impl ResolvedErrors {
    /// Errors of one field, in holder order
    pub fn field(&self, field: &str) -> Vec<Value> {
        self.holders
            .get(field)
            .map(|holders| holders.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// All fields with at least one error
    pub fn to_map(&self) -> ErrorMap {
        self.holders
            .keys()
            .map(|field| (field.clone(), self.field(field)))
            .filter(|(_, errors)| !errors.is_empty())
            .collect()
    }

    /// Replace the errors of one holder; returns `true` when the field's
    /// aggregate error list changed
    pub fn set(&mut self, field: &str, holder: HolderId, errors: Vec<Value>) -> bool {
        let before = self.field(field);
        if errors.is_empty() {
            if let Some(holders) = self.holders.get_mut(field) {
                holders.remove(&holder);
                if holders.is_empty() {
                    self.holders.remove(field);
                }
            }
        } else {
            self.holders
                .entry(field.to_string())
                .or_default()
                .insert(holder, errors);
        }
        before != self.field(field)
    }

    /// Drop one holder; returns `true` when the field's errors changed
    pub fn retract(&mut self, field: &str, holder: &HolderId) -> bool {
        self.set(field, holder.clone(), Vec::new())
    }

    pub fn clear(&mut self) {
        self.holders.clear();
    }
}
