//! Form Engine - Incremental annotations, conditions and validations for
//! nested form data
//!
//! A form is described once by a tree of definitions and then evaluated
//! against successive versions of its data. It supports:
//!
//! - Annotations: keyed, conditionally active metadata attached to fields
//! - Conditions (`When`) gating whole subtrees of definitions
//! - Validations producing per-field error lists
//! - Arrays, with `current`/`all`/indexed foci and filters
//! - Computed fields written back into the data
//! - Subscriptions, events and transactions with rollback
//!
//! # Architecture
//!
//! - `Model`: the immutable definition arena plus the dependency cache,
//!   an index from canonical field path to the definitions reading it.
//!   Shared read-only between sessions.
//! - `Session`: the mutable state of one form. Each update diffs only the
//!   indexed paths and re-runs only the definitions that depend on a change.
//! - `Resolver`: evaluates paths and dependencies against the data,
//!   the external data and the resolved annotations.
//!
//! # Example
//!
//! ```ignore
//! use form_engine::{validator, Definition, Model, PathExpr, Session};
//! use serde_json::{json, Value};
//!
//! let model = Model::shared(vec![Definition::array(
//!     PathExpr::internal().field("list"),
//!     vec![Definition::validate(
//!         PathExpr::internal().field("list").current().field("v"),
//!         vec![validator(|v, _| if v.is_null() { json!("required") } else { Value::Null })],
//!     )],
//! )]);
//!
//! let mut session = Session::new(model);
//! session.update(json!({"list": [{"v": 1}, {"v": null}]}))?;
//! assert_eq!(session.field_errors("list[1].v"), vec![json!("required")]);
//! ```

pub mod cache;
pub mod config;
pub mod definition;
pub mod dependency;
pub mod dependency_cache;
pub mod diff;
pub mod error;
pub mod events;
pub mod model;
pub mod path;
mod processor;
pub mod resolver;
pub mod session;
pub mod snapshot;
pub mod subscriptions;
pub mod transaction;

// Re-export key types
pub use cache::ErrorMap;
pub use config::SessionConfig;
pub use definition::{validator, Definition, TestFn, ValidatorFn};
pub use dependency::Dependency;
pub use error::{EngineError, Result};
pub use events::{EventSink, NullEventSink, SessionEvent, VecEventSink};
pub use model::{DefinitionId, Model};
pub use path::{FieldPath, PathExpr};
pub use resolver::{resolve, AnnotationMap, Resolver};
pub use session::Session;
pub use subscriptions::{AnnotationFilter, SubscriptionId};
pub use transaction::Transaction;
