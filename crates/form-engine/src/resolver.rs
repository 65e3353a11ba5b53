//! Dependency resolution
//!
//! Evaluates path expressions and dependency nests against concrete data.
//! While folding over the segments of a path the resolver keeps the values
//! in focus together with the field path each one came from. An `all`
//! focus fans the focus out to one entry per element; the result fans back
//! in to an array.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::dependency::{ComputedId, Dependency};
use crate::error::{EngineError, Result};
use crate::path::{CurrentIndices, FieldPath, Focus, Origin, PathExpr, Segment};

static NULL: Value = Value::Null;

/// Resolved annotations: field path -> key -> value
pub type AnnotationMap = BTreeMap<String, BTreeMap<String, Value>>;

/// Memo key of a computed value within one processing pass
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MemoKey {
    id: ComputedId,
    indices: CurrentIndices,
    previous: bool,
}

pub(crate) type ComputedMemo = HashMap<MemoKey, Value>;

/// The annotation currently being computed, to reject self-reads
#[derive(Debug, Clone)]
pub(crate) struct AnnotationToken {
    pub key: String,
    pub fields: BTreeSet<String>,
}

/// Values in focus while folding a path
enum View<'a> {
    Single(Cow<'a, Value>, FieldPath),
    Many(Vec<(Cow<'a, Value>, FieldPath)>),
}

enum Step<'s> {
    Key(&'s str),
    Index(usize),
}

fn step_get<'v>(value: &'v Value, step: &Step<'_>) -> Option<&'v Value> {
    match step {
        Step::Key(name) => value.get(*name),
        Step::Index(index) => value.get(*index),
    }
}

fn child<'a>(value: Cow<'a, Value>, step: Step<'_>) -> Cow<'a, Value> {
    match value {
        Cow::Borrowed(v) => Cow::Borrowed(step_get(v, &step).unwrap_or(&NULL)),
        Cow::Owned(v) => Cow::Owned(step_get(&v, &step).cloned().unwrap_or(Value::Null)),
    }
}

fn elements<'a>(value: Cow<'a, Value>, path: &FieldPath) -> Vec<(Cow<'a, Value>, FieldPath)> {
    match value {
        Cow::Borrowed(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Cow::Borrowed(v), path.at(i)))
            .collect(),
        Cow::Owned(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Cow::Owned(v), path.at(i)))
            .collect(),
        _ => Vec::new(),
    }
}

fn pick(value: &Value, keys: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            keys.iter()
                .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Resolves paths and dependencies against one data snapshot
pub struct Resolver<'a> {
    data: &'a Value,
    external: &'a Value,
    previous_data: &'a Value,
    previous_external: &'a Value,
    annotations: Option<&'a AnnotationMap>,
    resolving: Option<&'a AnnotationToken>,
    memo: Option<&'a mut ComputedMemo>,
    use_previous: bool,
}

impl<'a> Resolver<'a> {
    /// A resolver without annotations and without a previous snapshot
    pub fn new(data: &'a Value, external: &'a Value) -> Self {
        Self {
            data,
            external,
            previous_data: &NULL,
            previous_external: &NULL,
            annotations: None,
            resolving: None,
            memo: None,
            use_previous: false,
        }
    }

    /// Data that `Previous` dependencies resolve against
    pub fn with_previous(mut self, data: &'a Value, external: &'a Value) -> Self {
        self.previous_data = data;
        self.previous_external = external;
        self
    }

    /// Resolved annotations read by `Annotation` segments
    pub fn with_annotations(mut self, annotations: &'a AnnotationMap) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub(crate) fn with_memo(mut self, memo: &'a mut ComputedMemo) -> Self {
        self.memo = Some(memo);
        self
    }

    pub(crate) fn resolving(mut self, token: &'a AnnotationToken) -> Self {
        self.resolving = Some(token);
        self
    }

    fn root(&self, origin: Origin) -> &'a Value {
        match (origin, self.use_previous) {
            (Origin::Internal, false) => self.data,
            (Origin::External, false) => self.external,
            (Origin::Internal, true) => self.previous_data,
            (Origin::External, true) => self.previous_external,
        }
    }

    /// Resolve a path to its value; fanned-out paths resolve to an array
    pub fn resolve_path(&mut self, path: &PathExpr, indices: &CurrentIndices) -> Result<Value> {
        Ok(match self.focus(path, indices)? {
            View::Single(value, _) => value.into_owned(),
            View::Many(items) => Value::Array(items.into_iter().map(|(v, _)| v.into_owned()).collect()),
        })
    }

    /// Resolve a path to the field paths it denotes
    pub fn resolve_fields(&mut self, path: &PathExpr, indices: &CurrentIndices) -> Result<Vec<FieldPath>> {
        Ok(match self.focus(path, indices)? {
            View::Single(_, field) => vec![field],
            View::Many(items) => items.into_iter().map(|(_, field)| field).collect(),
        })
    }

    /// Resolve a path to each field it denotes together with its value
    pub fn resolve_entries(&mut self, path: &PathExpr, indices: &CurrentIndices) -> Result<Vec<(FieldPath, Value)>> {
        Ok(match self.focus(path, indices)? {
            View::Single(value, field) => vec![(field, value.into_owned())],
            View::Many(items) => items
                .into_iter()
                .map(|(value, field)| (field, value.into_owned()))
                .collect(),
        })
    }

    /// Resolve an arbitrary dependency nest
    pub fn resolve_dependency(&mut self, dependency: &Dependency, indices: &CurrentIndices) -> Result<Value> {
        match dependency {
            Dependency::Value(value) => Ok(value.clone()),
            Dependency::Path(path) => self.resolve_path(path, indices),
            Dependency::Computed(computed) => {
                let key = MemoKey {
                    id: computed.id,
                    indices: indices.clone(),
                    previous: self.use_previous,
                };
                if let Some(hit) = self.memo.as_ref().and_then(|memo| memo.get(&key)) {
                    return Ok(hit.clone());
                }
                let input = self.resolve_dependency(&computed.dependencies, indices)?;
                let output = (computed.func)(&input);
                if let Some(memo) = self.memo.as_mut() {
                    memo.insert(key, output.clone());
                }
                Ok(output)
            }
            Dependency::Previous(inner) => {
                let outer = self.use_previous;
                self.use_previous = true;
                let resolved = self.resolve_dependency(inner, indices);
                self.use_previous = outer;
                resolved
            }
            Dependency::List(items) => items
                .iter()
                .map(|item| self.resolve_dependency(item, indices))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Dependency::Map(entries) => entries
                .iter()
                .map(|(key, dep)| -> Result<(String, Value)> {
                    Ok((key.clone(), self.resolve_dependency(dep, indices)?))
                })
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
        }
    }

    fn focus(&mut self, path: &PathExpr, indices: &CurrentIndices) -> Result<View<'a>> {
        let origin = path.origin();
        let mut view = View::Single(Cow::Borrowed(self.root(origin)), FieldPath::root());
        let mut seen_all = false;
        let mut fan_base: Option<FieldPath> = None;

        for segment in path.segments() {
            view = match segment {
                Segment::Field(name) => match view {
                    View::Single(value, field) => View::Single(child(value, Step::Key(name)), field.key(name)),
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(value, field)| (child(value, Step::Key(name)), field.key(name)))
                            .collect(),
                    ),
                },

                Segment::Array(Focus::Current) => {
                    let View::Single(value, field) = view else {
                        return Err(EngineError::CurrentAfterAllFocus {
                            path: path.to_string(),
                        });
                    };
                    if seen_all {
                        return Err(EngineError::CurrentAfterAllFocus {
                            path: path.to_string(),
                        });
                    }
                    if origin == Origin::External {
                        return Err(EngineError::ExternalCurrentFocusUnsupported {
                            path: path.to_string(),
                        });
                    }
                    let rendered = field.to_string();
                    let index = *indices
                        .get(&rendered)
                        .ok_or(EngineError::MissingCurrentIndex { path: rendered })?;
                    View::Single(child(value, Step::Index(index)), field.at(index))
                }

                Segment::Array(Focus::All) => {
                    seen_all = true;
                    match view {
                        View::Single(value, field) => {
                            let items = elements(value, &field);
                            fan_base = Some(field);
                            View::Many(items)
                        }
                        View::Many(items) => {
                            fan_base = None;
                            View::Many(
                                items
                                    .into_iter()
                                    .flat_map(|(value, field)| elements(value, &field))
                                    .collect(),
                            )
                        }
                    }
                }

                Segment::Array(Focus::Index { index, from_all }) => match view {
                    View::Many(items) if *from_all => {
                        let fallback = fan_base
                            .as_ref()
                            .map(|base| base.at(*index))
                            .unwrap_or_else(|| FieldPath::root().at(*index));
                        match items.into_iter().nth(*index) {
                            Some((value, field)) => View::Single(value, field),
                            None => View::Single(Cow::Borrowed(&NULL), fallback),
                        }
                    }
                    View::Single(value, field) => {
                        View::Single(child(value, Step::Index(*index)), field.at(*index))
                    }
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(value, field)| (child(value, Step::Index(*index)), field.at(*index)))
                            .collect(),
                    ),
                },

                Segment::Pick(keys) => match view {
                    View::Single(value, field) => View::Single(Cow::Owned(pick(&value, keys)), field),
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(value, field)| (Cow::Owned(pick(&value, keys)), field))
                            .collect(),
                    ),
                },

                Segment::Filter(filter) => {
                    let deps = match &filter.dependencies {
                        Some(deps) => self.resolve_dependency(deps, indices)?,
                        None => Value::Null,
                    };
                    let items = match view {
                        View::Single(value, field) if value.is_array() => {
                            seen_all = true;
                            let items = elements(value, &field);
                            fan_base = Some(field);
                            items
                        }
                        View::Single(value, field) => vec![(value, field)],
                        View::Many(items) => items,
                    };
                    View::Many(
                        items
                            .into_iter()
                            .filter(|(value, _)| {
                                if filter.keys.is_empty() {
                                    (filter.predicate)(&**value, &deps)
                                } else {
                                    (filter.predicate)(&pick(value, &filter.keys), &deps)
                                }
                            })
                            .collect(),
                    )
                }

                Segment::Annotation { key, default } => match view {
                    View::Single(_, field) => {
                        let value = self.annotation(&field, key, default.as_ref())?;
                        View::Single(value, field)
                    }
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(_, field)| -> Result<(Cow<'a, Value>, FieldPath)> {
                                Ok((self.annotation(&field, key, default.as_ref())?, field))
                            })
                            .collect::<Result<Vec<_>>>()?,
                    ),
                },

                Segment::Path => match view {
                    View::Single(_, field) => View::Single(Cow::Owned(Value::String(field.to_string())), field),
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(_, field)| (Cow::Owned(Value::String(field.to_string())), field))
                            .collect(),
                    ),
                },

                Segment::Index => match view {
                    View::Single(_, field) => View::Single(Cow::Owned(index_of(&field)?), field),
                    View::Many(items) => View::Many(
                        items
                            .into_iter()
                            .map(|(_, field)| -> Result<(Cow<'a, Value>, FieldPath)> {
                                Ok((Cow::Owned(index_of(&field)?), field))
                            })
                            .collect::<Result<Vec<_>>>()?,
                    ),
                },
            };
        }

        Ok(view)
    }

    fn annotation(&self, field: &FieldPath, key: &str, default: Option<&Value>) -> Result<Cow<'a, Value>> {
        let rendered = field.to_string();
        if let Some(token) = self.resolving {
            if token.key == key && token.fields.contains(&rendered) {
                return Err(EngineError::cycle(rendered, key));
            }
        }

        let found = self
            .annotations
            .and_then(|annotations| annotations.get(&rendered))
            .and_then(|keys| keys.get(key));
        match (found, default) {
            (Some(value), _) => Ok(Cow::Borrowed(value)),
            (None, Some(default)) => Ok(Cow::Owned(default.clone())),
            (None, None) => Err(EngineError::missing_annotation(rendered, key)),
        }
    }
}

fn index_of(field: &FieldPath) -> Result<Value> {
    field
        .last_index()
        .map(Value::from)
        .ok_or_else(|| EngineError::IndexOnNonArray {
            path: field.to_string(),
        })
}

/// Resolve `path` against `data` and `external` without annotations
pub fn resolve(path: &PathExpr, indices: &CurrentIndices, data: &Value, external: &Value) -> Result<Value> {
    Resolver::new(data, external).resolve_path(path, indices)
}
