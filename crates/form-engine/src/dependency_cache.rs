//! Static dependency index
//!
//! Built once per [`Model`]: maps every canonical path mentioned by a
//! definition to the definitions referencing it. The incremental processor
//! only diffs the paths listed here and only re-runs the definitions found
//! under a changed path.

use std::collections::{BTreeMap, BTreeSet};

use crate::dependency::Dependency;
use crate::model::{DefinitionId, DefinitionKind, Model};
use crate::path::{CanonicalPath, Focus, PathExpr, Segment, VALUE_ANNOTATION};

/// Kind of definition holding a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKind {
    Annotation,
    Validation,
    Condition,
}

/// A definition referencing a canonical path
#[derive(Debug, Clone)]
pub struct DependencyRef {
    /// The referencing definition
    pub definition: DefinitionId,
    /// The literal path segments as written
    pub segments: Vec<Segment>,
    /// Enclosing `Array`/`When` definitions, outermost first
    pub parents: Vec<DefinitionId>,
    /// `false` when the path is the subject of the definition
    pub is_dependency: bool,
    /// Passive references are indexed but never re-run their definition
    pub is_passive: bool,
    /// Subject of a `value` annotation: the computed value is written there
    pub is_write_back: bool,
}

impl DependencyRef {
    /// Whether a change of the referenced path re-runs the definition.
    ///
    /// An annotation subject re-runs when the fields it denotes can change
    /// with the data: fan-outs, fixed indices and filters.
    pub fn triggers_rerun(&self, kind: ReferenceKind) -> bool {
        if self.is_passive {
            return false;
        }
        match kind {
            ReferenceKind::Annotation => self.is_dependency || self.is_write_back || self.selects_fields(),
            ReferenceKind::Validation | ReferenceKind::Condition => true,
        }
    }

    /// Whether the set of fields denoted depends on the data
    fn selects_fields(&self) -> bool {
        self.segments.iter().any(|segment| {
            matches!(
                segment,
                Segment::Array(Focus::All | Focus::Index { .. }) | Segment::Filter(_)
            )
        })
    }
}

/// All references to one canonical path
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: CanonicalPath,
    pub annotations: Vec<DependencyRef>,
    pub validations: Vec<DependencyRef>,
    pub conditions: Vec<DependencyRef>,
}

impl CacheEntry {
    fn new(path: CanonicalPath) -> Self {
        Self {
            path,
            annotations: Vec::new(),
            validations: Vec::new(),
            conditions: Vec::new(),
        }
    }

    fn refs_mut(&mut self, kind: ReferenceKind) -> &mut Vec<DependencyRef> {
        match kind {
            ReferenceKind::Annotation => &mut self.annotations,
            ReferenceKind::Validation => &mut self.validations,
            ReferenceKind::Condition => &mut self.conditions,
        }
    }

    /// References of every kind
    pub fn references(&self) -> impl Iterator<Item = (ReferenceKind, &DependencyRef)> {
        self.annotations
            .iter()
            .map(|r| (ReferenceKind::Annotation, r))
            .chain(self.validations.iter().map(|r| (ReferenceKind::Validation, r)))
            .chain(self.conditions.iter().map(|r| (ReferenceKind::Condition, r)))
    }

    /// References whose change re-runs their definition
    pub fn triggering(&self) -> impl Iterator<Item = (ReferenceKind, &DependencyRef)> {
        self.references().filter(|(kind, r)| r.triggers_rerun(*kind))
    }

    fn sort(&mut self) {
        for refs in [&mut self.annotations, &mut self.validations, &mut self.conditions] {
            refs.sort_by_key(|r| (r.definition, r.is_dependency));
        }
    }
}

/// Canonical path string -> references
#[derive(Debug, Clone, Default)]
pub struct DependencyCache {
    entries: BTreeMap<String, CacheEntry>,
    /// Data paths with at least one triggering reference; the only paths
    /// diffed on update
    dependent_fields: BTreeSet<String>,
    /// Annotation paths (`field#key`) with at least one triggering reference
    annotation_dependencies: BTreeSet<String>,
}

impl DependencyCache {
    /// Index every definition of `model`
    pub fn build(model: &Model) -> Self {
        let mut cache = Self::default();

        for id in model.ids() {
            let node = model.node(id);
            match &node.kind {
                DefinitionKind::Array { .. } => {}
                DefinitionKind::When { dependencies, .. } => {
                    cache.register_dependency(ReferenceKind::Condition, id, &node.ancestors, dependencies);
                }
                DefinitionKind::Validate {
                    context,
                    dependencies,
                    ..
                } => {
                    cache.register(ReferenceKind::Validation, id, &node.ancestors, context, false, false);
                    if let Some(deps) = dependencies {
                        cache.register_dependency(ReferenceKind::Validation, id, &node.ancestors, deps);
                    }
                }
                DefinitionKind::Annotate { context, key, value } => {
                    let write_back = key == VALUE_ANNOTATION;
                    cache.register(ReferenceKind::Annotation, id, &node.ancestors, context, false, write_back);
                    cache.register_dependency(ReferenceKind::Annotation, id, &node.ancestors, value);
                }
            }
        }

        for (key, entry) in cache.entries.iter_mut() {
            entry.sort();
            if entry.triggering().next().is_some() {
                if entry.path.is_data() {
                    cache.dependent_fields.insert(key.clone());
                } else {
                    cache.annotation_dependencies.insert(key.clone());
                }
            }
        }

        cache
    }

    fn register_dependency(
        &mut self,
        kind: ReferenceKind,
        definition: DefinitionId,
        parents: &[DefinitionId],
        dependency: &Dependency,
    ) {
        dependency.for_each_path(&mut |path| {
            self.register(kind, definition, parents, path, true, false);
        });
    }

    fn register(
        &mut self,
        kind: ReferenceKind,
        definition: DefinitionId,
        parents: &[DefinitionId],
        path: &PathExpr,
        is_dependency: bool,
        is_write_back: bool,
    ) {
        let canonical = path.canonical();
        let reference = DependencyRef {
            definition,
            segments: path.segments().to_vec(),
            parents: parents.to_vec(),
            is_dependency,
            is_passive: path.is_passive(),
            is_write_back,
        };
        self.entries
            .entry(canonical.to_string())
            .or_insert_with(|| CacheEntry::new(canonical))
            .refs_mut(kind)
            .push(reference);

        // Filter predicates read their own dependencies when the subject is resolved
        if !is_dependency {
            for segment in path.segments() {
                if let Segment::Filter(filter) = segment {
                    if let Some(deps) = &filter.dependencies {
                        self.register_dependency(kind, definition, parents, deps);
                    }
                }
            }
        }
    }

    pub fn get(&self, canonical: &str) -> Option<&CacheEntry> {
        self.entries.get(canonical)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Data paths that anything re-runs on
    pub fn dependent_fields(&self) -> &BTreeSet<String> {
        &self.dependent_fields
    }

    /// Annotation paths that anything re-runs on
    pub fn annotation_dependencies(&self) -> &BTreeSet<String> {
        &self.annotation_dependencies
    }
}
