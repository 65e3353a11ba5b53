//! Sessions
//!
//! A [`Session`] pairs an immutable, shareable [`Model`] with the mutable
//! state of one form: its data, the result cache tree, the resolved
//! annotations and errors, and the subscribers watching them.
//!
//! All mutation goes through [`Session::update`] and its variants. Calls must
//! be serialized by the caller; nothing inside is locked.

use std::sync::Arc;

use serde_json::Value;

use crate::cache::ErrorMap;
use crate::config::SessionConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventSink, NullEventSink, SessionEvent};
use crate::model::Model;
use crate::processor::{EngineState, Processor, UpdateOutcome};
use crate::resolver::AnnotationMap;
use crate::subscriptions::{AnnotationFilter, SubscriptionId, Subscriptions};

/// Default equality used to diff data between updates
fn deep_equal(a: &Value, b: &Value) -> bool {
    a == b
}

/// Live state of one form over a shared model
pub struct Session {
    pub(crate) session_id: String,
    pub(crate) model: Arc<Model>,
    pub(crate) config: SessionConfig,
    pub(crate) state: EngineState,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) event_sink: Arc<dyn EventSink>,
    /// Changes not yet reported to subscribers and the event sink
    pub(crate) pending: Option<UpdateOutcome>,
    pub(crate) in_transaction: bool,
}

impl Session {
    /// Create a session with no external data
    pub fn new(model: Arc<Model>) -> Self {
        Self::with_external_data(model, Value::Null)
    }

    /// Create a session over the given external data
    pub fn with_external_data(model: Arc<Model>, external: Value) -> Self {
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            model,
            config: SessionConfig::default(),
            state: EngineState::new(external),
            subscriptions: Subscriptions::new(),
            event_sink: Arc::new(NullEventSink),
            pending: None,
            in_transaction: false,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the initial update has run
    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    /// The live data, including computed values written back by `value`
    /// annotations
    pub fn data(&self) -> &Value {
        &self.state.data
    }

    pub fn external_data(&self) -> &Value {
        &self.state.external
    }

    /// Replace the form data, keeping the external data
    pub fn update(&mut self, data: Value) -> Result<()> {
        self.update_with(data, None, deep_equal)
    }

    /// Replace the form data and the external data
    pub fn update_with_external(&mut self, data: Value, external: Value) -> Result<()> {
        self.update_with(data, Some(external), deep_equal)
    }

    /// Replace the data, diffing leaves with `eq` instead of deep equality.
    ///
    /// The first call runs every definition; later calls only re-run what
    /// depends on a changed path.
    pub fn update_with<F>(&mut self, data: Value, external: Option<Value>, eq: F) -> Result<()>
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let external = external.unwrap_or_else(|| self.state.external.clone());
        log::debug!(
            "Session {}: starting {} update",
            self.session_id,
            if self.state.initialized { "incremental" } else { "initial" }
        );

        let outcome = Processor::new(&self.model, &mut self.state, &self.config).run(data, external, &eq)?;
        log::debug!(
            "Session {}: update finished with {} evaluations, {} annotations and {} error fields changed",
            self.session_id,
            outcome.evaluations,
            outcome.changed_annotations.len(),
            outcome.changed_errors.len()
        );

        match &mut self.pending {
            Some(pending) => pending.merge(outcome),
            None => self.pending = Some(outcome),
        }
        if !self.in_transaction {
            self.flush();
        }
        Ok(())
    }

    /// Errors of every field that has any; `None` before the first update
    pub fn errors(&self) -> Option<ErrorMap> {
        self.state.initialized.then(|| self.state.errors.to_map())
    }

    /// Errors of one field, empty when it has none
    pub fn field_errors(&self, field: &str) -> Vec<Value> {
        self.state.errors.field(field)
    }

    /// Every active annotation, by field then key
    pub fn annotations(&self) -> &AnnotationMap {
        self.state.annotations.resolved()
    }

    /// The active value of one annotation, else `default`
    pub fn field_annotation(&self, field: &str, key: &str, default: Option<Value>) -> Result<Value> {
        self.state
            .annotations
            .get(field, key)
            .cloned()
            .or(default)
            .ok_or_else(|| EngineError::AnnotationNotFoundForField {
                field: field.to_string(),
                key: key.to_string(),
            })
    }

    /// Watch one annotation of one field.
    ///
    /// Fails with `AnnotationNotFoundForField` when the annotation is not
    /// active and no default is given.
    pub fn subscribe_to_field_annotation<F>(
        &mut self,
        field: &str,
        key: &str,
        default: Option<Value>,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let current = self.field_annotation(field, key, default.clone())?;
        Ok(self.subscriptions.add_field(
            field,
            key,
            default,
            current,
            self.config.notify_on_subscribe,
            Box::new(callback),
        ))
    }

    /// Watch every annotation passing `filter`, delivered as a
    /// `{field: {key: value}}` object
    pub fn subscribe_to_annotations<F>(&mut self, filter: AnnotationFilter, callback: F) -> SubscriptionId
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.subscriptions.add_annotations(
            filter,
            self.state.annotations.resolved(),
            self.config.notify_on_subscribe,
            Box::new(callback),
        )
    }

    /// Returns `false` if the subscription was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(id)
    }

    /// Report pending changes to the event sink, then to subscribers
    pub(crate) fn flush(&mut self) {
        if let Some(outcome) = self.pending.take() {
            for (field, key) in &outcome.changed_annotations {
                self.emit(SessionEvent::AnnotationChanged {
                    session_id: self.session_id.clone(),
                    field: field.clone(),
                    key: key.clone(),
                    value: self.state.annotations.get(field, key).cloned(),
                });
            }
            for field in &outcome.changed_errors {
                self.emit(SessionEvent::ErrorsChanged {
                    session_id: self.session_id.clone(),
                    field: field.clone(),
                    errors: self.state.errors.field(field),
                });
            }
            self.emit(SessionEvent::UpdateCompleted {
                session_id: self.session_id.clone(),
                changed_annotations: outcome.changed_annotations.len(),
                changed_error_fields: outcome.changed_errors.len(),
                evaluations: outcome.evaluations,
            });
        }

        let notified = self.subscriptions.notify(self.state.annotations.resolved());
        if notified > 0 {
            log::trace!("Session {}: notified {} subscribers", self.session_id, notified);
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Session {}: failed to send event: {}", self.session_id, e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("initialized", &self.state.initialized)
            .field("subscriptions", &self.subscriptions.len())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{validator, Definition};
    use crate::dependency::Dependency;
    use crate::events::VecEventSink;
    use crate::path::PathExpr;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn p() -> PathExpr {
        PathExpr::internal()
    }

    fn session(definitions: Vec<Definition>) -> Session {
        Session::new(Model::shared(definitions))
    }

    fn errors(session: &Session) -> Value {
        serde_json::to_value(session.errors().unwrap_or_default()).unwrap()
    }

    fn echo_element_value() -> Definition {
        Definition::array(
            p().field("list"),
            vec![Definition::validate(
                p().field("list").current().field("v"),
                vec![validator(|v, _| v.clone())],
            )],
        )
    }

    #[test]
    fn test_errors_absent_before_first_update() {
        let mut s = session(vec![echo_element_value()]);
        assert!(s.errors().is_none());
        assert!(!s.is_initialized());

        s.update(json!({"list": []})).unwrap();
        assert_eq!(s.errors(), Some(ErrorMap::new()));
        assert!(s.is_initialized());
    }

    #[test]
    fn test_array_shrink_retracts_only_removed_element() {
        let mut s = session(vec![echo_element_value()]);

        s.update(json!({"list": [{"v": "a"}, {"v": "b"}]})).unwrap();
        assert_eq!(errors(&s), json!({"list[0].v": ["a"], "list[1].v": ["b"]}));

        s.update(json!({"list": [{"v": "a"}]})).unwrap();
        assert_eq!(errors(&s), json!({"list[0].v": ["a"]}));
    }

    #[test]
    fn test_array_grow_runs_new_element_validations() {
        let mut s = session(vec![echo_element_value()]);

        s.update(json!({"list": [{"v": "a"}]})).unwrap();
        s.update(json!({"list": [{"v": "a"}, {"v": "b"}, {"v": null}]}))
            .unwrap();
        assert_eq!(errors(&s), json!({"list[0].v": ["a"], "list[1].v": ["b"]}));
    }

    fn annotations(session: &Session) -> Value {
        serde_json::to_value(session.annotations()).unwrap()
    }

    fn is_done(item: &Value, _: &Value) -> bool {
        item["done"] == json!(true)
    }

    #[test]
    fn test_fan_out_annotation_follows_array_length() {
        let mut s = session(vec![Definition::annotate(
            p().field("list").all().field("v"),
            "marked",
            json!(true),
        )]);

        s.update(json!({"list": [{"v": 1}, {"v": 2}]})).unwrap();
        assert_eq!(
            annotations(&s),
            json!({"list[0].v": {"marked": true}, "list[1].v": {"marked": true}})
        );

        s.update(json!({"list": [{"v": 1}]})).unwrap();
        assert_eq!(annotations(&s), json!({"list[0].v": {"marked": true}}));

        s.update(json!({"list": [{"v": 1}, {"v": 2}]})).unwrap();
        assert_eq!(
            annotations(&s),
            json!({"list[0].v": {"marked": true}, "list[1].v": {"marked": true}})
        );
    }

    #[test]
    fn test_filtered_annotation_follows_filter_key() {
        let mut s = session(vec![Definition::annotate(
            p().field("list").all().filter(["done"], is_done).field("title"),
            "strike",
            json!(true),
        )]);

        s.update(json!({"list": [{"title": "a", "done": false}]})).unwrap();
        assert_eq!(annotations(&s), json!({}));

        s.update(json!({"list": [{"title": "a", "done": true}]})).unwrap();
        assert_eq!(annotations(&s), json!({"list[0].title": {"strike": true}}));

        s.update(json!({"list": [{"title": "a", "done": false}]})).unwrap();
        assert_eq!(annotations(&s), json!({}));
    }

    #[test]
    fn test_array_over_fan_out_is_an_error() {
        let mut s = session(vec![Definition::array(
            p().field("list").all().field("items"),
            vec![Definition::validate(
                p().field("list").all().field("items").current(),
                vec![validator(|v, _| v.clone())],
            )],
        )]);

        let result = s.update(json!({"list": [{"items": [1]}, {"items": [2]}]}));
        assert!(matches!(
            result,
            Err(EngineError::ArrayContextNotSingular { path }) if path == "list[all].items"
        ));
    }

    #[test]
    fn test_element_edit_reruns_that_element() {
        let mut s = session(vec![echo_element_value()]);

        s.update(json!({"list": [{"v": "a"}, {"v": "b"}]})).unwrap();
        s.update(json!({"list": [{"v": "a"}, {"v": "c"}]})).unwrap();
        assert_eq!(errors(&s), json!({"list[0].v": ["a"], "list[1].v": ["c"]}));
    }

    #[test]
    fn test_nested_arrays() {
        let negative = validator(|n, _| {
            if n.as_i64().is_some_and(|n| n < 0) {
                json!("negative")
            } else {
                Value::Null
            }
        });
        let mut s = session(vec![Definition::array(
            p().field("groups"),
            vec![Definition::array(
                p().field("groups").current().field("items"),
                vec![Definition::validate(
                    p().field("groups").current().field("items").current().field("n"),
                    vec![negative],
                )],
            )],
        )]);

        s.update(json!({"groups": [{"items": [{"n": 1}, {"n": -1}]}]}))
            .unwrap();
        assert_eq!(errors(&s), json!({"groups[0].items[1].n": ["negative"]}));

        s.update(json!({"groups": [
            {"items": [{"n": 1}, {"n": -1}]},
            {"items": [{"n": -5}]}
        ]}))
        .unwrap();
        assert_eq!(
            errors(&s),
            json!({"groups[0].items[1].n": ["negative"], "groups[1].items[0].n": ["negative"]})
        );

        s.update(json!({"groups": [{"items": [{"n": 1}]}, {"items": [{"n": -5}]}]}))
            .unwrap();
        assert_eq!(errors(&s), json!({"groups[1].items[0].n": ["negative"]}));
    }

    #[test]
    fn test_fan_out_fan_in() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sibling_runs = Arc::new(AtomicUsize::new(0));
        let counter = sibling_runs.clone();

        let mut s = session(vec![
            Definition::validate_with(
                p().field("name"),
                p().field("list").all().field("value"),
                vec![validator(move |_, deps| {
                    sink.lock().unwrap().push(deps.clone());
                    Value::Null
                })],
            ),
            Definition::validate(
                p().field("other"),
                vec![validator(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Value::Null
                })],
            ),
        ]);

        s.update(json!({"name": "x", "other": 1, "list": [{"value": "a"}, {"value": "b"}]}))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(["a", "b"])]);
        assert_eq!(sibling_runs.load(Ordering::SeqCst), 1);

        s.update(json!({"name": "x", "other": 1, "list": [{"value": "z"}, {"value": "b"}]}))
            .unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&json!(["z", "b"])));
        assert_eq!(sibling_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreferenced_change_evaluates_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (validate_calls, compute_calls, test_calls) = (calls.clone(), calls.clone(), calls.clone());

        let mut s = session(vec![
            Definition::validate(
                p().field("name"),
                vec![validator(move |_, _| {
                    validate_calls.fetch_add(1, Ordering::SeqCst);
                    Value::Null
                })],
            ),
            Definition::annotate(
                p().field("name"),
                "length",
                Dependency::computed(p().field("name"), move |v| {
                    compute_calls.fetch_add(1, Ordering::SeqCst);
                    json!(v.as_str().map_or(0, str::len))
                }),
            ),
            Definition::when(
                p().field("flag"),
                move |v| {
                    test_calls.fetch_add(1, Ordering::SeqCst);
                    v == &json!(true)
                },
                vec![],
            ),
        ]);

        s.update(json!({"name": "ab", "flag": true, "notes": "x"})).unwrap();
        let after_initial = calls.load(Ordering::SeqCst);
        assert_eq!(after_initial, 3);

        s.update(json!({"name": "ab", "flag": true, "notes": "y"})).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_initial);
    }

    #[test]
    fn test_identical_update_is_idempotent() {
        let sink = Arc::new(VecEventSink::new());
        let mut s = session(vec![
            echo_element_value(),
            Definition::annotate(p().field("list"), "count", Dependency::computed(p().field("list"), |l| {
                json!(l.as_array().map_or(0, Vec::len))
            })),
        ])
        .with_event_sink(sink.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        s.subscribe_to_annotations(AnnotationFilter::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let data = json!({"list": [{"v": "a"}]});
        s.update(data.clone()).unwrap();
        let annotations = s.annotations().clone();
        let errors_before = s.errors();
        let fired_before = fired.load(Ordering::SeqCst);
        sink.clear();

        s.update(data).unwrap();
        assert_eq!(s.annotations(), &annotations);
        assert_eq!(s.errors(), errors_before);
        assert_eq!(fired.load(Ordering::SeqCst), fired_before);
        assert_eq!(
            sink.events(),
            vec![SessionEvent::UpdateCompleted {
                session_id: s.session_id().to_string(),
                changed_annotations: 0,
                changed_error_fields: 0,
                evaluations: 0,
            }]
        );
    }

    #[test]
    fn test_incremental_matches_fresh_session() {
        let definitions = || {
            vec![
                echo_element_value(),
                Definition::when(
                    p().field("strict"),
                    |v| v == &json!(true),
                    vec![Definition::array(
                        p().field("list"),
                        vec![Definition::annotate(
                            p().field("list").current().field("v"),
                            "label",
                            Dependency::computed(p().field("list").current().field("v"), |v| {
                                json!(v.as_str().unwrap_or_default().to_uppercase())
                            }),
                        )],
                    )],
                ),
                Definition::annotate(p().field("list").all().field("v"), "marked", json!(true)),
                Definition::annotate(
                    p().field("list").all().filter(["done"], is_done).field("v"),
                    "strike",
                    json!(true),
                ),
            ]
        };
        let steps = [
            json!({"strict": false, "list": [{"v": "a"}, {"v": "b"}]}),
            json!({"strict": true, "list": [{"v": "a"}, {"v": "b", "done": true}]}),
            json!({"strict": true, "list": [{"v": "c"}]}),
            json!({"strict": true, "list": [{"v": "c", "done": true}, {"v": "d"}, {"v": "e"}]}),
            json!({"strict": false, "list": [{"v": "c"}, {"v": "d", "done": true}]}),
            json!({"strict": true, "list": [{"v": "c"}, {"v": "d", "done": true}]}),
        ];

        let mut incremental = session(definitions());
        for step in &steps {
            incremental.update(step.clone()).unwrap();

            let mut fresh = session(definitions());
            fresh.update(step.clone()).unwrap();
            assert_eq!(incremental.annotations(), fresh.annotations(), "at {}", step);
            assert_eq!(incremental.errors(), fresh.errors(), "at {}", step);
        }
    }

    #[test]
    fn test_condition_activation_and_deactivation() {
        let mut s = session(vec![Definition::when(
            p().field("enabled"),
            |v| v == &json!(true),
            vec![
                Definition::annotate(p().field("name"), "required", json!(true)),
                Definition::validate(
                    p().field("name"),
                    vec![validator(|v, _| {
                        if v.as_str().map_or(true, str::is_empty) {
                            json!("required")
                        } else {
                            Value::Null
                        }
                    })],
                ),
            ],
        )]);

        s.update(json!({"enabled": false, "name": ""})).unwrap();
        assert!(s.annotations().is_empty());
        assert_eq!(errors(&s), json!({}));

        s.update(json!({"enabled": true, "name": ""})).unwrap();
        assert_eq!(s.field_annotation("name", "required", None).unwrap(), json!(true));
        assert_eq!(errors(&s), json!({"name": ["required"]}));

        s.update(json!({"enabled": false, "name": ""})).unwrap();
        assert!(s.annotations().is_empty());
        assert_eq!(errors(&s), json!({}));
    }

    #[test]
    fn test_condition_inside_array_is_per_element() {
        let mut s = session(vec![Definition::array(
            p().field("rows"),
            vec![Definition::when(
                p().field("rows").current().field("on"),
                |v| v == &json!(true),
                vec![Definition::annotate(
                    p().field("rows").current().field("on"),
                    "visible",
                    json!(true),
                )],
            )],
        )]);

        s.update(json!({"rows": [{"on": true}, {"on": true}]})).unwrap();
        assert_eq!(s.annotations().len(), 2);

        s.update(json!({"rows": [{"on": true}, {"on": false}]})).unwrap();
        assert_eq!(
            serde_json::to_value(s.annotations()).unwrap(),
            json!({"rows[0].on": {"visible": true}})
        );
    }

    #[test]
    fn test_annotation_read_before_it_is_defined() {
        let mut s = session(vec![
            Definition::annotate(
                p().field("b"),
                "label",
                Dependency::computed(p().field("a").annotation_or("label", json!("")), |v| {
                    json!(v.as_str().unwrap_or_default().to_uppercase())
                }),
            ),
            Definition::annotate(p().field("a"), "label", p().field("a")),
        ]);

        s.update(json!({"a": "x"})).unwrap();
        assert_eq!(s.field_annotation("b", "label", None).unwrap(), json!("X"));

        s.update(json!({"a": "y"})).unwrap();
        assert_eq!(s.field_annotation("b", "label", None).unwrap(), json!("Y"));
    }

    #[test]
    fn test_later_definition_wins() {
        let mut s = session(vec![
            Definition::annotate(p().field("name"), "label", json!("first")),
            Definition::when(
                p().field("override"),
                |v| v == &json!(true),
                vec![Definition::annotate(p().field("name"), "label", json!("second"))],
            ),
        ]);

        s.update(json!({"override": false})).unwrap();
        assert_eq!(s.field_annotation("name", "label", None).unwrap(), json!("first"));

        s.update(json!({"override": true})).unwrap();
        assert_eq!(s.field_annotation("name", "label", None).unwrap(), json!("second"));

        s.update(json!({"override": false})).unwrap();
        assert_eq!(s.field_annotation("name", "label", None).unwrap(), json!("first"));
    }

    #[test]
    fn test_cyclical_annotation_is_an_error() {
        let mut s = session(vec![Definition::annotate(
            p().field("total"),
            "sum",
            Dependency::computed(p().field("total").annotation_or("sum", json!(0)), |v| {
                json!(v.as_i64().unwrap_or_default() + 1)
            }),
        )]);

        let err = s.update(json!({"total": 1})).unwrap_err();
        assert!(matches!(
            err,
            EngineError::CyclicalAnnotationDependency { ref field, ref key } if field == "total" && key == "sum"
        ));
    }

    #[test]
    fn test_mutual_annotation_cycle_is_an_error() {
        let mut s = session(vec![
            Definition::annotate(p().field("a"), "x", p().field("b").annotation_or("y", json!(0))),
            Definition::annotate(p().field("b"), "y", p().field("a").annotation_or("x", json!(0))),
        ]);

        assert!(matches!(
            s.update(json!({})),
            Err(EngineError::CyclicalAnnotationDependency { .. })
        ));
    }

    #[test]
    fn test_missing_annotation_value() {
        let mut s = session(vec![Definition::annotate(
            p().field("b"),
            "label",
            p().field("a").annotation("label"),
        )]);

        assert!(matches!(
            s.update(json!({})),
            Err(EngineError::MissingAnnotationValue { ref field, ref key }) if field == "a" && key == "label"
        ));
    }

    #[test]
    fn test_value_annotation_writes_back() {
        let mut s = session(vec![Definition::annotate(
            p().field("total"),
            "value",
            Dependency::computed(Dependency::list([p().field("a"), p().field("b")]), |v| {
                let sum: i64 = v
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or_default();
                json!(sum)
            }),
        )]);

        s.update(json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(s.data()["total"], json!(3));

        s.update(json!({"a": 5, "b": 2, "total": 3})).unwrap();
        assert_eq!(s.data()["total"], json!(7));

        // user edit of the computed field is overwritten
        s.update(json!({"a": 5, "b": 2, "total": 100})).unwrap();
        assert_eq!(s.data()["total"], json!(7));
    }

    #[test]
    fn test_write_back_feeds_dependents() {
        let mut s = session(vec![
            Definition::annotate(
                p().field("double"),
                "value",
                Dependency::computed(p().field("n"), |v| json!(v.as_i64().unwrap_or_default() * 2)),
            ),
            Definition::validate(
                p().field("double"),
                vec![validator(|v, _| {
                    if v.as_i64().is_some_and(|v| v > 10) {
                        json!("too large")
                    } else {
                        Value::Null
                    }
                })],
            ),
        ]);

        s.update(json!({"n": 1})).unwrap();
        assert_eq!(errors(&s), json!({}));

        s.update(json!({"n": 6, "double": 2})).unwrap();
        assert_eq!(s.data()["double"], json!(12));
        assert_eq!(errors(&s), json!({"double": ["too large"]}));
    }

    #[test]
    fn test_write_back_that_never_settles() {
        let mut s = session(vec![Definition::annotate(
            p().field("n"),
            "value",
            Dependency::computed(p().field("n"), |v| json!(v.as_i64().unwrap_or_default() + 1)),
        )])
        .with_config(SessionConfig::new().with_max_stabilization_passes(5));

        assert!(matches!(
            s.update(json!({"n": 0})),
            Err(EngineError::AnnotationsDidNotStabilize { passes: 5 })
        ));
    }

    #[test]
    fn test_previous_value() {
        let mut s = session(vec![Definition::annotate(
            p().field("count"),
            "before",
            Dependency::previous(p().field("count")),
        )]);

        s.update(json!({"count": 1})).unwrap();
        assert_eq!(s.field_annotation("count", "before", None).unwrap(), Value::Null);

        s.update(json!({"count": 2})).unwrap();
        assert_eq!(s.field_annotation("count", "before", None).unwrap(), json!(1));
    }

    #[test]
    fn test_external_data_changes() {
        let model = Model::shared(vec![Definition::validate_with(
            p().field("choice"),
            PathExpr::external().field("options"),
            vec![validator(|choice, options| {
                let known = options
                    .as_array()
                    .is_some_and(|options| options.contains(choice));
                if known {
                    Value::Null
                } else {
                    json!("unknown option")
                }
            })],
        )]);
        let mut s = Session::with_external_data(model, json!({"options": ["a", "b"]}));

        s.update(json!({"choice": "c"})).unwrap();
        assert_eq!(errors(&s), json!({"choice": ["unknown option"]}));

        s.update_with_external(json!({"choice": "c"}), json!({"options": ["a", "b", "c"]}))
            .unwrap();
        assert_eq!(errors(&s), json!({}));
        assert_eq!(s.external_data(), &json!({"options": ["a", "b", "c"]}));
    }

    #[test]
    fn test_custom_equality() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut s = session(vec![Definition::validate(
            p().field("name"),
            vec![validator(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Value::Null
            })],
        )]);

        let case_insensitive = |a: &Value, b: &Value| match (a.as_str(), b.as_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => a == b,
        };
        s.update_with(json!({"name": "abc"}), None, case_insensitive).unwrap();
        s.update_with(json!({"name": "ABC"}), None, case_insensitive).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        s.update_with(json!({"name": "abd"}), None, case_insensitive).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_field_annotation_lookup() {
        let mut s = session(vec![Definition::annotate(p().field("name"), "label", json!("Name"))]);
        s.update(json!({})).unwrap();

        assert_eq!(s.field_annotation("name", "label", None).unwrap(), json!("Name"));
        assert_eq!(
            s.field_annotation("name", "hint", Some(json!("none"))).unwrap(),
            json!("none")
        );
        assert!(matches!(
            s.field_annotation("name", "hint", None),
            Err(EngineError::AnnotationNotFoundForField { .. })
        ));
    }

    #[test]
    fn test_field_subscription() {
        let mut s = session(vec![Definition::annotate(
            p().field("name"),
            "label",
            Dependency::computed(p().field("title"), |v| v.clone()),
        )]);
        s.update(json!({"title": "A"})).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = s
            .subscribe_to_field_annotation("name", "label", None, move |v| {
                sink.lock().unwrap().push(v.clone());
            })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("A")]);

        s.update(json!({"title": "A", "other": 1})).unwrap();
        s.update(json!({"title": "B"})).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("A"), json!("B")]);

        assert!(s.unsubscribe(id));
        s.update(json!({"title": "C"})).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_subscribing_without_value_or_default() {
        let mut s = session(vec![]);
        s.update(json!({})).unwrap();

        assert!(matches!(
            s.subscribe_to_field_annotation("name", "label", None, |_| {}),
            Err(EngineError::AnnotationNotFoundForField { .. })
        ));
        assert!(s
            .subscribe_to_field_annotation("name", "label", Some(json!("")), |_| {})
            .is_ok());
    }

    #[test]
    fn test_removed_element_suppresses_subscription() {
        let mut s = session(vec![Definition::array(
            p().field("list"),
            vec![Definition::annotate(
                p().field("list").current().field("v"),
                "label",
                p().field("list").current().field("v"),
            )],
        )]);
        s.update(json!({"list": [{"v": "a"}, {"v": "b"}]})).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        s.subscribe_to_field_annotation("list[1].v", "label", None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        s.update(json!({"list": [{"v": "a"}]})).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(s.field_annotation("list[1].v", "label", None).is_err());
    }

    #[test]
    fn test_filtered_annotations_subscription() {
        let mut s = session(vec![
            Definition::annotate(p().field("person").field("name"), "label", p().field("title")),
            Definition::annotate(p().field("person").field("age"), "hint", json!("years")),
            Definition::annotate(p().field("other"), "label", p().field("title")),
        ]);
        s.update(json!({"title": "A"})).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let filter = AnnotationFilter::new()
            .with_path_prefix("person")
            .with_keys(["label"]);
        s.subscribe_to_annotations(filter, move |v| sink.lock().unwrap().push(v.clone()));

        s.update(json!({"title": "B"})).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                json!({"person.name": {"label": "A"}}),
                json!({"person.name": {"label": "B"}}),
            ]
        );
    }

    #[test]
    fn test_subscribe_without_initial_delivery() {
        let mut s = session(vec![Definition::annotate(p().field("name"), "label", p().field("title"))])
            .with_config(SessionConfig::new().with_notify_on_subscribe(false));
        s.update(json!({"title": "A"})).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        s.subscribe_to_field_annotation("name", "label", None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        s.update(json!({"title": "B"})).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_after_update() {
        let sink = Arc::new(VecEventSink::new());
        let mut s = session(vec![
            echo_element_value(),
            Definition::annotate(p().field("list"), "kind", json!("list")),
        ])
        .with_event_sink(sink.clone());

        s.update(json!({"list": [{"v": "a"}]})).unwrap();
        let id = s.session_id().to_string();
        assert!(id.starts_with("session-"));

        let events = sink.events();
        assert!(events.contains(&SessionEvent::AnnotationChanged {
            session_id: id.clone(),
            field: "list".to_string(),
            key: "kind".to_string(),
            value: Some(json!("list")),
        }));
        assert!(events.contains(&SessionEvent::ErrorsChanged {
            session_id: id.clone(),
            field: "list[0].v".to_string(),
            errors: vec![json!("a")],
        }));
        assert!(matches!(
            events.last(),
            Some(SessionEvent::UpdateCompleted { changed_annotations: 1, changed_error_fields: 1, .. })
        ));
    }

    struct RejectingSink;

    impl EventSink for RejectingSink {
        fn send(&self, event: SessionEvent) -> std::result::Result<(), crate::events::EventError> {
            Err(crate::events::EventError::rejected(&event, "disconnected"))
        }
    }

    #[test]
    fn test_rejected_events_do_not_fail_the_update() {
        let mut s = session(vec![echo_element_value()]).with_event_sink(Arc::new(RejectingSink));

        s.update(json!({"list": [{"v": "a"}]})).unwrap();
        assert_eq!(errors(&s), json!({"list[0].v": ["a"]}));
    }
}
