//! Path expressions and field paths
//!
//! A [`PathExpr`] describes how to navigate from the form data (or the
//! external data) to one or more fields. It is resolved against concrete
//! data by the resolver. Two derived forms exist:
//!
//! - [`FieldPath`]: a concrete location in a data tree, rendered `a.b[0].c`.
//!   Resolved annotations and errors are keyed by this rendering.
//! - [`CanonicalPath`]: the static form used to index the dependency cache,
//!   where array foci stay as `[current]` / `[all]` / `[N]` placeholders.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dependency::Dependency;

/// Key of an annotation attached to a field
pub type AnnotationKey = String;

/// Concrete array indices in effect while resolving, keyed by the rendered
/// path of the array they index.
pub type CurrentIndices = BTreeMap<String, usize>;

/// Reserved annotation key whose value is written back into the data
pub const VALUE_ANNOTATION: &str = "value";

/// Prefix of canonical paths rooted in external data
pub const EXTERNAL_PREFIX: &str = "external:";

/// Which data tree a path is rooted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// The form data owned by the session
    Internal,
    /// Read-only data supplied alongside the form data
    External,
}

/// Array focus of a path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Focus {
    /// The element of the enclosing array scope
    Current,
    /// Every element (fan-out)
    All,
    /// A fixed element. `from_all` narrows an existing fan-out instead of
    /// indexing the data again.
    Index { index: usize, from_all: bool },
}

/// Predicate of a filter segment: `(element narrowed to keys, resolved deps)`
pub type FilterFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// A predicate filter over the elements currently in focus
#[derive(Clone)]
pub struct FilterSegment {
    /// Element keys the predicate reads; empty means the whole element
    pub keys: Vec<String>,
    /// The predicate
    pub predicate: FilterFn,
    /// Extra dependencies passed to the predicate
    pub dependencies: Option<Box<Dependency>>,
}

impl fmt::Debug for FilterSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSegment")
            .field("keys", &self.keys)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// One navigation step of a path expression
#[derive(Debug, Clone)]
pub enum Segment {
    /// Object field access
    Field(String),
    /// Array element focus
    Array(Focus),
    /// Keep only the listed object keys
    Pick(Vec<String>),
    /// Keep only the elements matching a predicate
    Filter(FilterSegment),
    /// Read a resolved annotation of the field in focus
    Annotation {
        key: AnnotationKey,
        default: Option<Value>,
    },
    /// Render the field path in focus as a string
    Path,
    /// Read the last array index of the field path in focus
    Index,
}

/// A navigation from the root of the form (or external) data
#[derive(Debug, Clone)]
pub struct PathExpr {
    origin: Origin,
    segments: Vec<Segment>,
    passive: bool,
}

impl PathExpr {
    /// Start a path rooted in the form data
    pub fn internal() -> Self {
        Self {
            origin: Origin::Internal,
            segments: Vec::new(),
            passive: false,
        }
    }

    /// Start a path rooted in the external data
    pub fn external() -> Self {
        Self {
            origin: Origin::External,
            segments: Vec::new(),
            passive: false,
        }
    }

    /// Navigate into an object field
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.segments.push(Segment::Field(name.into()));
        self
    }

    /// Focus the element of the enclosing array scope
    pub fn current(mut self) -> Self {
        self.segments.push(Segment::Array(Focus::Current));
        self
    }

    /// Focus every element of the array
    pub fn all(mut self) -> Self {
        self.segments.push(Segment::Array(Focus::All));
        self
    }

    /// Focus a fixed element of the array
    pub fn index(mut self, index: usize) -> Self {
        self.segments.push(Segment::Array(Focus::Index {
            index,
            from_all: false,
        }));
        self
    }

    /// Narrow a preceding `all` focus to its n-th element
    pub fn nth(mut self, index: usize) -> Self {
        self.segments.push(Segment::Array(Focus::Index {
            index,
            from_all: true,
        }));
        self
    }

    /// Keep only the listed keys of the object(s) in focus
    pub fn pick<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.segments
            .push(Segment::Pick(keys.into_iter().map(Into::into).collect()));
        self
    }

    /// Keep only the elements whose `keys` satisfy `predicate`
    pub fn filter<I, S, F>(self, keys: I, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.push_filter(keys, None, predicate)
    }

    /// Like [`PathExpr::filter`], with extra dependencies handed to the predicate
    pub fn filter_with<I, S, F>(self, keys: I, dependencies: impl Into<Dependency>, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.push_filter(keys, Some(Box::new(dependencies.into())), predicate)
    }

    fn push_filter<I, S, F>(mut self, keys: I, dependencies: Option<Box<Dependency>>, predicate: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.segments.push(Segment::Filter(FilterSegment {
            keys: keys.into_iter().map(Into::into).collect(),
            predicate: Arc::new(predicate),
            dependencies,
        }));
        self
    }

    /// Read an annotation of the field in focus; fails when it is absent
    pub fn annotation(mut self, key: impl Into<String>) -> Self {
        self.segments.push(Segment::Annotation {
            key: key.into(),
            default: None,
        });
        self
    }

    /// Read an annotation of the field in focus, falling back to `default`
    pub fn annotation_or(mut self, key: impl Into<String>, default: Value) -> Self {
        self.segments.push(Segment::Annotation {
            key: key.into(),
            default: Some(default),
        });
        self
    }

    /// Resolve to the rendered field path instead of the value
    pub fn as_path(mut self) -> Self {
        self.segments.push(Segment::Path);
        self
    }

    /// Resolve to the last array index of the field path
    pub fn as_index(mut self) -> Self {
        self.segments.push(Segment::Index);
        self
    }

    /// Mark this path as passive: indexed, but changes do not re-run its owner
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    /// The field path read by an annotation lookup, with the looked-up key
    pub(crate) fn annotation_target(&self) -> Option<(PathExpr, AnnotationKey)> {
        let position = self
            .segments
            .iter()
            .position(|s| matches!(s, Segment::Annotation { .. }))?;
        let Segment::Annotation { key, .. } = &self.segments[position] else {
            return None;
        };
        let target = PathExpr {
            origin: self.origin,
            segments: self.segments[..position].to_vec(),
            passive: self.passive,
        };
        Some((target, key.clone()))
    }

    /// Static form of this path used to index the dependency cache.
    ///
    /// Paths that read an annotation index the annotated field plus the key;
    /// pick and filter steps are transparent there since the annotation is
    /// read per field. Otherwise the path is cut at the first step that is
    /// not plain field/array navigation, which depends on the whole value
    /// at that point.
    pub fn canonical(&self) -> CanonicalPath {
        let annotation_at = self
            .segments
            .iter()
            .position(|s| matches!(s, Segment::Annotation { .. }));

        let mut segments = Vec::new();
        let mut annotation = None;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => segments.push(CanonicalSegment::Field(name.clone())),
                Segment::Array(Focus::Current) => segments.push(CanonicalSegment::Current),
                Segment::Array(Focus::All) => segments.push(CanonicalSegment::All),
                Segment::Array(Focus::Index { index, from_all }) => {
                    if *from_all && segments.last() == Some(&CanonicalSegment::All) {
                        segments.pop();
                    }
                    segments.push(CanonicalSegment::Nth(*index));
                }
                Segment::Pick(_) | Segment::Filter(_) if annotation_at.is_some() => {}
                Segment::Annotation { key, .. } => {
                    annotation = Some(key.clone());
                    break;
                }
                Segment::Pick(_) | Segment::Filter(_) | Segment::Path | Segment::Index => break,
            }
        }

        CanonicalPath {
            origin: self.origin,
            segments,
            annotation,
        }
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// One step of a concrete field path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathPart {
    Key(String),
    Index(usize),
}

/// A concrete location inside a data tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    parts: Vec<PathPart>,
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_parts(parts: Vec<PathPart>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[PathPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Extend with an object key
    pub fn key(&self, name: &str) -> Self {
        let mut parts = self.parts.clone();
        parts.push(PathPart::Key(name.to_string()));
        Self { parts }
    }

    /// Extend with an array index
    pub fn at(&self, index: usize) -> Self {
        let mut parts = self.parts.clone();
        parts.push(PathPart::Index(index));
        Self { parts }
    }

    /// Last array index of the path, if its last step is an index
    pub fn last_index(&self) -> Option<usize> {
        match self.parts.last() {
            Some(PathPart::Index(index)) => Some(*index),
            _ => None,
        }
    }

    /// Render only the first `len` parts
    pub fn render_prefix(&self, len: usize) -> String {
        render_parts(&self.parts[..len.min(self.parts.len())])
    }

    /// Read the value at this path
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for part in &self.parts {
            current = match part {
                PathPart::Key(name) => current.get(name.as_str())?,
                PathPart::Index(index) => current.get(*index)?,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating missing intermediate objects.
    ///
    /// Returns `true` when the data changed. Array steps never grow arrays;
    /// an out-of-range index leaves the data untouched.
    pub fn set(&self, root: &mut Value, value: Value) -> bool {
        let mut current = root;
        for part in &self.parts {
            current = match part {
                PathPart::Key(name) => {
                    if current.is_null() {
                        *current = Value::Object(serde_json::Map::new());
                    }
                    match current {
                        Value::Object(map) => map.entry(name.clone()).or_insert(Value::Null),
                        _ => return false,
                    }
                }
                PathPart::Index(index) => match current.get_mut(*index) {
                    Some(element) => element,
                    None => return false,
                },
            };
        }
        if *current == value {
            return false;
        }
        *current = value;
        true
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_parts(&self.parts))
    }
}

fn render_parts(parts: &[PathPart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            PathPart::Key(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            PathPart::Index(index) => {
                out.push('[');
                out.push_str(&index.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// One step of a canonical path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalSegment {
    Field(String),
    Current,
    All,
    Nth(usize),
}

/// Index-independent form of a path expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath {
    pub origin: Origin,
    pub segments: Vec<CanonicalSegment>,
    /// Set when the path reads an annotation of the field
    pub annotation: Option<AnnotationKey>,
}

impl CanonicalPath {
    /// Whether this path denotes field data rather than an annotation
    pub fn is_data(&self) -> bool {
        self.annotation.is_none()
    }

    /// Match a concrete field path against this canonical path.
    ///
    /// With `exact`, both must have the same length. Otherwise either may be a
    /// prefix of the other: a change to a parent value changes every child,
    /// and a change to a child changes its parents. Returns the indices bound
    /// by `[current]` placeholders, keyed by rendered array path.
    pub fn match_field(&self, field: &FieldPath, exact: bool) -> Option<CurrentIndices> {
        if exact && self.segments.len() != field.len() {
            return None;
        }

        let mut bindings = CurrentIndices::new();
        for (position, (segment, part)) in self.segments.iter().zip(field.parts()).enumerate() {
            match (segment, part) {
                (CanonicalSegment::Field(name), PathPart::Key(key)) if name == key => {}
                (CanonicalSegment::Current, PathPart::Index(index)) => {
                    bindings.insert(field.render_prefix(position), *index);
                }
                (CanonicalSegment::All, PathPart::Index(_)) => {}
                (CanonicalSegment::Nth(n), PathPart::Index(index)) if n == index => {}
                _ => return None,
            }
        }
        Some(bindings)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.origin == Origin::External {
            f.write_str(EXTERNAL_PREFIX)?;
        }
        let mut first = true;
        for segment in &self.segments {
            match segment {
                CanonicalSegment::Field(name) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(name)?;
                }
                CanonicalSegment::Current => f.write_str("[current]")?,
                CanonicalSegment::All => f.write_str("[all]")?,
                CanonicalSegment::Nth(index) => write!(f, "[{}]", index)?,
            }
            first = false;
        }
        if let Some(key) = &self.annotation {
            write!(f, "#{}", key)?;
        }
        Ok(())
    }
}
