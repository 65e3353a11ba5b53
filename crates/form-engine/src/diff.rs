//! Structural diff over canonical paths
//!
//! Compares the old and new data along one canonical path and reports the
//! `[current]` bindings under which the path's value changed:
//!
//! - `[current]` enumerates the indices of the new array, so elements that
//!   were removed never produce a binding.
//! - `[all]` compares the gathered element lists as a whole.
//! - `[N]` follows the fixed element.

use serde_json::Value;

use crate::path::{CanonicalPath, CanonicalSegment, CurrentIndices, FieldPath};

static NULL: Value = Value::Null;

/// Equality used to decide whether a value changed
pub type EqualityFn<'e> = &'e dyn Fn(&Value, &Value) -> bool;

/// Bindings under which the value of `path` differs between `old` and `new`.
///
/// An empty result means nothing changed. A single empty binding means the
/// path changed and binds no `[current]` placeholder.
pub fn changed_bindings(path: &CanonicalPath, old: &Value, new: &Value, eq: EqualityFn<'_>) -> Vec<CurrentIndices> {
    let mut out = Vec::new();
    walk(
        &path.segments,
        old,
        new,
        FieldPath::root(),
        CurrentIndices::new(),
        eq,
        &mut out,
    );
    out
}

fn walk(
    segments: &[CanonicalSegment],
    old: &Value,
    new: &Value,
    field: FieldPath,
    bindings: CurrentIndices,
    eq: EqualityFn<'_>,
    out: &mut Vec<CurrentIndices>,
) {
    let Some((segment, rest)) = segments.split_first() else {
        if !eq(old, new) {
            out.push(bindings);
        }
        return;
    };

    match segment {
        CanonicalSegment::Field(name) => {
            let old = old.get(name.as_str()).unwrap_or(&NULL);
            let new = new.get(name.as_str()).unwrap_or(&NULL);
            walk(rest, old, new, field.key(name), bindings, eq, out);
        }
        CanonicalSegment::Nth(index) => {
            let old = old.get(*index).unwrap_or(&NULL);
            let new = new.get(*index).unwrap_or(&NULL);
            walk(rest, old, new, field.at(*index), bindings, eq, out);
        }
        CanonicalSegment::Current => {
            let Some(elements) = new.as_array() else {
                return;
            };
            let array = field.to_string();
            for (index, element) in elements.iter().enumerate() {
                let mut bound = bindings.clone();
                bound.insert(array.clone(), index);
                let old = old.get(index).unwrap_or(&NULL);
                walk(rest, old, element, field.at(index), bound, eq, out);
            }
        }
        CanonicalSegment::All => {
            let old_items = gather(segments, old);
            let new_items = gather(segments, new);
            let same = old_items.len() == new_items.len()
                && old_items.iter().zip(&new_items).all(|(a, b)| eq(a, b));
            if !same {
                out.push(bindings);
            }
        }
    }
}

/// Values of a canonical path, flattened through every array focus
fn gather<'v>(segments: &[CanonicalSegment], value: &'v Value) -> Vec<&'v Value> {
    let mut values = vec![value];
    for segment in segments {
        values = match segment {
            CanonicalSegment::Field(name) => values
                .into_iter()
                .map(|v| v.get(name.as_str()).unwrap_or(&NULL))
                .collect(),
            CanonicalSegment::Nth(index) => values
                .into_iter()
                .map(|v| v.get(*index).unwrap_or(&NULL))
                .collect(),
            CanonicalSegment::All | CanonicalSegment::Current => values
                .into_iter()
                .flat_map(|v| v.as_array().map(|items| items.iter()).into_iter().flatten())
                .collect(),
        };
    }
    values
}
