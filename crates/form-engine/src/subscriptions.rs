//! Subscriber registry
//!
//! Subscribers are re-checked after every committed update and called only
//! when the value they see differs from the one last delivered to them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resolver::AnnotationMap;

/// Callback of a subscription
pub type Callback = Box<dyn FnMut(&Value) + Send>;

/// Handle returned by the subscribe functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which annotations an annotations subscription sees
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationFilter {
    /// Only fields at or below this path
    pub path_prefix: Option<String>,
    /// Only these keys
    pub keys: Option<Vec<String>>,
}

impl AnnotationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    fn matches_field(&self, field: &str) -> bool {
        let Some(prefix) = &self.path_prefix else {
            return true;
        };
        match field.strip_prefix(prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('['),
            None => false,
        }
    }

    fn matches_key(&self, key: &str) -> bool {
        self.keys
            .as_ref()
            .map_or(true, |keys| keys.iter().any(|k| k == key))
    }

    /// The filtered annotations as a `{field: {key: value}}` object
    pub fn apply(&self, annotations: &AnnotationMap) -> Value {
        let fields = annotations
            .iter()
            .filter(|(field, _)| self.matches_field(field))
            .filter_map(|(field, keys)| {
                let keys: serde_json::Map<String, Value> = keys
                    .iter()
                    .filter(|(key, _)| self.matches_key(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                (!keys.is_empty()).then(|| (field.clone(), Value::Object(keys)))
            })
            .collect();
        Value::Object(fields)
    }
}

enum Target {
    Field {
        field: String,
        key: String,
        default: Option<Value>,
    },
    Annotations(AnnotationFilter),
}

struct Subscription {
    target: Target,
    callback: Callback,
    last: Option<Value>,
    /// Its field has no value to deliver; reported once until it returns
    suppressed: bool,
}

impl Subscription {
    /// The value this subscriber currently sees, `None` if there is none
    fn current(&self, annotations: &AnnotationMap) -> Option<Value> {
        match &self.target {
            Target::Field { field, key, default } => annotations
                .get(field)
                .and_then(|keys| keys.get(key))
                .or(default.as_ref())
                .cloned(),
            Target::Annotations(filter) => Some(filter.apply(annotations)),
        }
    }
}

/// All subscriptions of one session
#[derive(Default)]
pub struct Subscriptions {
    entries: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a field annotation subscription.
    ///
    /// `current` is the value it starts from; it is delivered right away
    /// when `deliver` is set.
    pub fn add_field(
        &mut self,
        field: &str,
        key: &str,
        default: Option<Value>,
        current: Value,
        deliver: bool,
        callback: Callback,
    ) -> SubscriptionId {
        let target = Target::Field {
            field: field.to_string(),
            key: key.to_string(),
            default,
        };
        self.add(target, current, deliver, callback)
    }

    /// Register an annotations subscription
    pub fn add_annotations(
        &mut self,
        filter: AnnotationFilter,
        annotations: &AnnotationMap,
        deliver: bool,
        callback: Callback,
    ) -> SubscriptionId {
        let current = filter.apply(annotations);
        self.add(Target::Annotations(filter), current, deliver, callback)
    }

    fn add(&mut self, target: Target, current: Value, deliver: bool, mut callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        if deliver {
            callback(&current);
        }
        self.entries.insert(
            id,
            Subscription {
                target,
                callback,
                last: Some(current),
                suppressed: false,
            },
        );
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Call every subscriber whose value changed; returns how many were called
    pub fn notify(&mut self, annotations: &AnnotationMap) -> usize {
        let mut notified = 0;
        for (id, subscription) in self.entries.iter_mut() {
            let Some(current) = subscription.current(annotations) else {
                if subscription.suppressed {
                    continue;
                }
                subscription.suppressed = true;
                if let Target::Field { field, key, .. } = &subscription.target {
                    log::warn!(
                        "Subscription {}: annotation '{}' of '{}' is gone and has no default; not notifying",
                        id,
                        key,
                        field
                    );
                }
                continue;
            };
            subscription.suppressed = false;
            if subscription.last.as_ref() == Some(&current) {
                continue;
            }
            (subscription.callback)(&current);
            subscription.last = Some(current);
            notified += 1;
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn annotations(entries: &[(&str, &str, Value)]) -> AnnotationMap {
        let mut map = AnnotationMap::new();
        for (field, key, value) in entries {
            map.entry(field.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        }
        map
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Callback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Callback = Box::new(move |v: &Value| sink.lock().unwrap().push(v.clone()));
        (seen, callback)
    }

    #[test]
    fn test_field_subscription_fires_on_change_only() {
        let mut subs = Subscriptions::new();
        let (seen, callback) = recorder();
        subs.add_field("name", "label", None, json!("Name"), true, callback);

        assert_eq!(subs.notify(&annotations(&[("name", "label", json!("Name"))])), 0);
        assert_eq!(subs.notify(&annotations(&[("name", "label", json!("Full name"))])), 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("Name"), json!("Full name")]);
    }

    #[test]
    fn test_vanished_field_is_suppressed() {
        let mut subs = Subscriptions::new();
        let (seen, callback) = recorder();
        subs.add_field("list[1].v", "label", None, json!("x"), false, callback);

        assert_eq!(subs.notify(&AnnotationMap::new()), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_vanished_field_is_reported_once_until_it_returns() {
        let mut subs = Subscriptions::new();
        let (seen, callback) = recorder();
        let id = subs.add_field("list[1].v", "label", None, json!("x"), false, callback);

        subs.notify(&AnnotationMap::new());
        assert!(subs.entries[&id].suppressed);
        subs.notify(&AnnotationMap::new());
        assert!(subs.entries[&id].suppressed);

        assert_eq!(subs.notify(&annotations(&[("list[1].v", "label", json!("y"))])), 1);
        assert!(!subs.entries[&id].suppressed);
        assert_eq!(*seen.lock().unwrap(), vec![json!("y")]);
    }

    #[test]
    fn test_vanished_field_with_default() {
        let mut subs = Subscriptions::new();
        let (seen, callback) = recorder();
        subs.add_field("list[1].v", "label", Some(json!("-")), json!("x"), false, callback);

        assert_eq!(subs.notify(&AnnotationMap::new()), 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("-")]);
    }

    #[test]
    fn test_annotation_filter() {
        let map = annotations(&[
            ("list", "count", json!(2)),
            ("list[0].v", "label", json!("a")),
            ("list[0].v", "hint", json!("h")),
            ("listing", "label", json!("other")),
        ]);

        let filter = AnnotationFilter::new().with_path_prefix("list").with_keys(["label"]);
        assert_eq!(filter.apply(&map), json!({"list[0].v": {"label": "a"}}));

        let everything = AnnotationFilter::new().apply(&map);
        assert_eq!(everything.as_object().map(|o| o.len()), Some(3));
    }

    #[test]
    fn test_remove() {
        let mut subs = Subscriptions::new();
        let (_, callback) = recorder();
        let id = subs.add_annotations(AnnotationFilter::new(), &AnnotationMap::new(), false, callback);
        assert_eq!(subs.len(), 1);
        assert!(subs.remove(id));
        assert!(!subs.remove(id));
        assert!(subs.is_empty());
    }
}
