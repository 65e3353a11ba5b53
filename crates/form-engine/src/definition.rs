//! Definition tree
//!
//! The schema is a tree of four node kinds. It is built once by the caller
//! and handed to [`Model::new`](crate::model::Model::new), which flattens it
//! into an arena and never mutates it again.
//!
//! # Example
//!
//! ```ignore
//! use form_engine::{validator, Definition, PathExpr};
//!
//! let definitions = vec![Definition::array(
//!     PathExpr::internal().field("list"),
//!     vec![Definition::validate(
//!         PathExpr::internal().field("list").current().field("v"),
//!         vec![validator(|v, _| if v.is_null() { "required".into() } else { Value::Null })],
//!     )],
//! )];
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::dependency::Dependency;
use crate::path::{AnnotationKey, PathExpr};

/// Condition test over the resolved dependencies of a `When`
pub type TestFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Validator: `(subject value, resolved dependencies) -> errors`.
///
/// `null` means no error, an array is a list of errors, anything else is a
/// single error.
pub type ValidatorFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Wrap a closure as a [`ValidatorFn`]
pub fn validator<F>(func: F) -> ValidatorFn
where
    F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
{
    Arc::new(func)
}

/// One node of the definition tree
#[derive(Clone)]
pub enum Definition {
    /// `context` denotes an array; `children` apply to each element
    Array {
        context: PathExpr,
        children: Vec<Definition>,
    },
    /// `children` are active only while `test(dependencies)` holds
    When {
        dependencies: Dependency,
        test: TestFn,
        children: Vec<Definition>,
    },
    /// Produces errors for the field denoted by `context`
    Validate {
        context: PathExpr,
        dependencies: Option<Dependency>,
        validators: Vec<ValidatorFn>,
    },
    /// Attaches `value` under `key` to the field denoted by `context`
    Annotate {
        context: PathExpr,
        key: AnnotationKey,
        value: Dependency,
    },
}

impl Definition {
    pub fn array(context: PathExpr, children: Vec<Definition>) -> Self {
        Self::Array { context, children }
    }

    pub fn when<F>(dependencies: impl Into<Dependency>, test: F, children: Vec<Definition>) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::When {
            dependencies: dependencies.into(),
            test: Arc::new(test),
            children,
        }
    }

    pub fn validate(context: PathExpr, validators: Vec<ValidatorFn>) -> Self {
        Self::Validate {
            context,
            dependencies: None,
            validators,
        }
    }

    pub fn validate_with(
        context: PathExpr,
        dependencies: impl Into<Dependency>,
        validators: Vec<ValidatorFn>,
    ) -> Self {
        Self::Validate {
            context,
            dependencies: Some(dependencies.into()),
            validators,
        }
    }

    pub fn annotate(context: PathExpr, key: impl Into<String>, value: impl Into<Dependency>) -> Self {
        Self::Annotate {
            context,
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array { context, children } => f
                .debug_struct("Array")
                .field("context", &context.to_string())
                .field("children", children)
                .finish(),
            Self::When {
                dependencies,
                children,
                ..
            } => f
                .debug_struct("When")
                .field("dependencies", dependencies)
                .field("children", children)
                .finish_non_exhaustive(),
            Self::Validate {
                context,
                dependencies,
                validators,
            } => f
                .debug_struct("Validate")
                .field("context", &context.to_string())
                .field("dependencies", dependencies)
                .field("validators", &validators.len())
                .finish(),
            Self::Annotate { context, key, value } => f
                .debug_struct("Annotate")
                .field("context", &context.to_string())
                .field("key", key)
                .field("value", value)
                .finish(),
        }
    }
}
