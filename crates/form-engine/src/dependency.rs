//! Dependency expressions
//!
//! A [`Dependency`] is anything a definition can depend on: a path, a plain
//! value, a computed value, the pre-update value of another dependency, or
//! a list/map nest of those. It is resolved by structural recursion.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::path::{PathExpr, Segment};

/// Function applied to the resolved dependencies of a computed value
pub type ComputeFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Stable handle of a computed value inside a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputedId(pub(crate) u32);

impl ComputedId {
    pub(crate) const UNASSIGNED: Self = Self(u32::MAX);
}

/// A value derived from other dependencies
#[derive(Clone)]
pub struct Computed {
    pub(crate) id: ComputedId,
    pub dependencies: Box<Dependency>,
    pub func: ComputeFn,
}

impl Computed {
    pub fn id(&self) -> ComputedId {
        self.id
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Anything a definition can depend on
#[derive(Debug, Clone)]
pub enum Dependency {
    /// A plain value, resolved as-is
    Value(Value),
    /// A path into the form or external data
    Path(PathExpr),
    /// A value computed from other dependencies
    Computed(Computed),
    /// The inner dependency resolved against the data from before the update
    Previous(Box<Dependency>),
    /// Resolves to an array
    List(Vec<Dependency>),
    /// Resolves to an object
    Map(BTreeMap<String, Dependency>),
}

impl Dependency {
    /// A plain value
    pub fn value(value: Value) -> Self {
        Self::Value(value)
    }

    /// A value computed by `func` from the resolved `dependencies`
    pub fn computed<F>(dependencies: impl Into<Dependency>, func: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::Computed(Computed {
            id: ComputedId::UNASSIGNED,
            dependencies: Box::new(dependencies.into()),
            func: Arc::new(func),
        })
    }

    /// The pre-update value of `dependency`
    pub fn previous(dependency: impl Into<Dependency>) -> Self {
        Self::Previous(Box::new(dependency.into()))
    }

    /// An array of dependencies
    pub fn list<I, D>(items: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dependency>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// An object of dependencies
    pub fn map<I, K, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, D)>,
        K: Into<String>,
        D: Into<Dependency>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, d)| (k.into(), d.into()))
                .collect(),
        )
    }

    /// Visit every path reachable from this dependency, including paths
    /// nested in computed values, previous values and filter predicates.
    pub fn for_each_path<'a>(&'a self, visit: &mut dyn FnMut(&'a PathExpr)) {
        match self {
            Self::Value(_) => {}
            Self::Path(path) => {
                visit(path);
                for segment in path.segments() {
                    if let Segment::Filter(filter) = segment {
                        if let Some(deps) = &filter.dependencies {
                            deps.for_each_path(visit);
                        }
                    }
                }
            }
            Self::Computed(computed) => computed.dependencies.for_each_path(visit),
            Self::Previous(inner) => inner.for_each_path(visit),
            Self::List(items) => {
                for item in items {
                    item.for_each_path(visit);
                }
            }
            Self::Map(entries) => {
                for entry in entries.values() {
                    entry.for_each_path(visit);
                }
            }
        }
    }

    /// Give every computed value a handle. Computed values sharing the same
    /// function share the handle, so their results are memoized together.
    pub(crate) fn assign_computed_ids(&mut self, ids: &mut ComputedIds) {
        match self {
            Self::Value(_) => {}
            Self::Path(path) => path.assign_computed_ids(ids),
            Self::Computed(computed) => {
                computed.id = ids.id_for(&computed.func);
                computed.dependencies.assign_computed_ids(ids);
            }
            Self::Previous(inner) => inner.assign_computed_ids(ids),
            Self::List(items) => items.iter_mut().for_each(|d| d.assign_computed_ids(ids)),
            Self::Map(entries) => entries
                .values_mut()
                .for_each(|d| d.assign_computed_ids(ids)),
        }
    }
}

impl PathExpr {
    pub(crate) fn assign_computed_ids(&mut self, ids: &mut ComputedIds) {
        for segment in self.segments_mut() {
            if let Segment::Filter(filter) = segment {
                if let Some(deps) = filter.dependencies.as_mut() {
                    deps.assign_computed_ids(ids);
                }
            }
        }
    }
}

impl From<PathExpr> for Dependency {
    fn from(path: PathExpr) -> Self {
        Self::Path(path)
    }
}

impl From<Value> for Dependency {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl<D: Into<Dependency>> From<Vec<D>> for Dependency {
    fn from(items: Vec<D>) -> Self {
        Self::list(items)
    }
}

/// Allocator of computed handles, keyed by function identity
#[derive(Debug, Default)]
pub(crate) struct ComputedIds {
    by_function: HashMap<usize, ComputedId>,
    next: u32,
}

impl ComputedIds {
    fn id_for(&mut self, func: &ComputeFn) -> ComputedId {
        let key = Arc::as_ptr(func) as *const () as usize;
        let next = &mut self.next;
        *self.by_function.entry(key).or_insert_with(|| {
            let id = ComputedId(*next);
            *next += 1;
            id
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.next as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths_reach_nested_dependencies() {
        let dep = Dependency::map([
            ("a", Dependency::from(PathExpr::internal().field("a"))),
            (
                "sum",
                Dependency::computed(
                    vec![
                        PathExpr::internal().field("x"),
                        PathExpr::external().field("y"),
                    ],
                    |v| v.clone(),
                ),
            ),
            ("prev", Dependency::previous(PathExpr::internal().field("z"))),
            ("lit", Dependency::value(json!(3))),
        ]);

        let rendered = rendered_paths(&dep);
        assert_eq!(rendered, vec!["a", "z", "x", "external:y"]);
    }

    fn rendered_paths(dep: &Dependency) -> Vec<String> {
        let mut rendered = Vec::new();
        dep.for_each_path(&mut |p| rendered.push(p.to_string()));
        rendered
    }

    #[test]
    fn test_filter_dependencies_are_visited() {
        let path = PathExpr::internal().field("list").all().filter_with(
            ["kind"],
            PathExpr::internal().field("selected"),
            |v, selected| &v["kind"] == selected,
        );
        let dep = Dependency::from(path);
        let rendered = rendered_paths(&dep);
        assert_eq!(rendered, vec!["list[all]", "selected"]);
    }

    #[test]
    fn test_shared_computed_shares_id() {
        let shared = Dependency::computed(PathExpr::internal().field("a"), |v| v.clone());
        let mut dep = Dependency::list(vec![
            shared.clone(),
            shared,
            Dependency::computed(PathExpr::internal().field("b"), |v| v.clone()),
        ]);

        let mut ids = ComputedIds::default();
        dep.assign_computed_ids(&mut ids);
        assert_eq!(ids.len(), 2);

        let Dependency::List(items) = &dep else {
            panic!("Expected list");
        };
        let id_of = |d: &Dependency| match d {
            Dependency::Computed(c) => c.id(),
            _ => panic!("Expected computed"),
        };
        assert_eq!(id_of(&items[0]), id_of(&items[1]));
        assert_ne!(id_of(&items[0]), id_of(&items[2]));
    }
}
