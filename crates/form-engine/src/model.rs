//! Definition arena
//!
//! [`Model`] owns the flattened definition tree and the dependency cache
//! built from it. Definitions are addressed by [`DefinitionId`], assigned in
//! pre-order, so an enclosing definition always has a smaller id than the
//! definitions it contains. Result caches and per-update memos are keyed by
//! these handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::definition::{Definition, TestFn, ValidatorFn};
use crate::dependency::{ComputedIds, Dependency};
use crate::dependency_cache::DependencyCache;
use crate::path::{AnnotationKey, PathExpr};

/// Stable handle of a definition inside a [`Model`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionId(pub(crate) u32);

impl DefinitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Arena form of a [`Definition`]
pub(crate) enum DefinitionKind {
    Array {
        context: PathExpr,
    },
    When {
        dependencies: Dependency,
        test: TestFn,
    },
    Validate {
        context: PathExpr,
        dependencies: Option<Dependency>,
        validators: Vec<ValidatorFn>,
    },
    Annotate {
        context: PathExpr,
        key: AnnotationKey,
        value: Dependency,
    },
}

pub(crate) struct DefinitionNode {
    pub kind: DefinitionKind,
    pub children: Vec<DefinitionId>,
    /// Enclosing `Array`/`When` definitions, outermost first
    pub ancestors: Vec<DefinitionId>,
}

impl DefinitionNode {
    pub fn is_array(&self) -> bool {
        matches!(self.kind, DefinitionKind::Array { .. })
    }
}

/// The immutable, shareable form of a definition tree
pub struct Model {
    nodes: Vec<DefinitionNode>,
    roots: Vec<DefinitionId>,
    dependencies: DependencyCache,
    /// Annotate definitions by annotation key
    annotators: BTreeMap<AnnotationKey, Vec<DefinitionId>>,
}

impl Model {
    /// Flatten `definitions` and index their dependencies
    pub fn new(definitions: Vec<Definition>) -> Self {
        let mut builder = ArenaBuilder::default();
        let roots = definitions
            .into_iter()
            .map(|definition| builder.push(definition, &[]))
            .collect();

        let mut model = Self {
            nodes: builder.nodes,
            roots,
            dependencies: DependencyCache::default(),
            annotators: BTreeMap::new(),
        };
        model.dependencies = DependencyCache::build(&model);
        let annotators: Vec<(AnnotationKey, DefinitionId)> = model
            .ids()
            .filter_map(|id| match &model.node(id).kind {
                DefinitionKind::Annotate { key, .. } => Some((key.clone(), id)),
                _ => None,
            })
            .collect();
        for (key, id) in annotators {
            model.annotators.entry(key).or_default().push(id);
        }

        log::debug!(
            "Model built: {} definitions, {} computed values, {} indexed paths",
            model.nodes.len(),
            builder.computed_ids.len(),
            model.dependencies.len()
        );
        model
    }

    /// Build and wrap in an `Arc` for sharing between sessions
    pub fn shared(definitions: Vec<Definition>) -> Arc<Self> {
        Arc::new(Self::new(definitions))
    }

    pub fn roots(&self) -> &[DefinitionId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependency_cache(&self) -> &DependencyCache {
        &self.dependencies
    }

    pub(crate) fn node(&self, id: DefinitionId) -> &DefinitionNode {
        &self.nodes[id.index()]
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = DefinitionId> {
        (0..self.nodes.len() as u32).map(DefinitionId)
    }

    /// Annotate definitions producing `key`, in definition order
    pub(crate) fn annotators(&self, key: &str) -> &[DefinitionId] {
        self.annotators.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Key of an `Annotate` definition
    pub(crate) fn annotation_key(&self, id: DefinitionId) -> Option<&str> {
        match &self.node(id).kind {
            DefinitionKind::Annotate { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Array definitions enclosing `id`, outermost first
    pub(crate) fn array_ancestors(&self, id: DefinitionId) -> impl Iterator<Item = DefinitionId> + '_ {
        self.node(id)
            .ancestors
            .iter()
            .copied()
            .filter(|a| self.node(*a).is_array())
    }

    /// Short description of a definition, for logs
    pub(crate) fn describe(&self, id: DefinitionId) -> String {
        match &self.node(id).kind {
            DefinitionKind::Array { context } => format!("array {} ({})", id, context),
            DefinitionKind::When { .. } => format!("when {}", id),
            DefinitionKind::Validate { context, .. } => format!("validate {} ({})", id, context),
            DefinitionKind::Annotate { context, key, .. } => {
                format!("annotate {} ({}#{})", id, context, key)
            }
        }
    }
}

#[derive(Default)]
struct ArenaBuilder {
    nodes: Vec<DefinitionNode>,
    computed_ids: ComputedIds,
}

impl ArenaBuilder {
    fn push(&mut self, definition: Definition, ancestors: &[DefinitionId]) -> DefinitionId {
        let id = DefinitionId(self.nodes.len() as u32);

        let (kind, children) = match definition {
            Definition::Array {
                mut context,
                children,
            } => {
                context.assign_computed_ids(&mut self.computed_ids);
                (DefinitionKind::Array { context }, children)
            }
            Definition::When {
                mut dependencies,
                test,
                children,
            } => {
                dependencies.assign_computed_ids(&mut self.computed_ids);
                (DefinitionKind::When { dependencies, test }, children)
            }
            Definition::Validate {
                mut context,
                mut dependencies,
                validators,
            } => {
                context.assign_computed_ids(&mut self.computed_ids);
                if let Some(deps) = dependencies.as_mut() {
                    deps.assign_computed_ids(&mut self.computed_ids);
                }
                (
                    DefinitionKind::Validate {
                        context,
                        dependencies,
                        validators,
                    },
                    Vec::new(),
                )
            }
            Definition::Annotate {
                mut context,
                key,
                mut value,
            } => {
                context.assign_computed_ids(&mut self.computed_ids);
                value.assign_computed_ids(&mut self.computed_ids);
                (DefinitionKind::Annotate { context, key, value }, Vec::new())
            }
        };

        let is_container = matches!(kind, DefinitionKind::Array { .. } | DefinitionKind::When { .. });
        self.nodes.push(DefinitionNode {
            kind,
            children: Vec::new(),
            ancestors: ancestors.to_vec(),
        });

        if is_container {
            let mut child_ancestors = ancestors.to_vec();
            child_ancestors.push(id);
            let child_ids = children
                .into_iter()
                .map(|child| self.push(child, &child_ancestors))
                .collect();
            self.nodes[id.index()].children = child_ids;
        }

        id
    }
}
