//! Declarative subscriber filters.
//!
//! Evaluation is pure: a filter only reads the event and its own
//! configuration, so one event can be checked against many filters from
//! many threads at once.

use crate::types::{ChangeEvent, Namespace, OperationKind};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Failure while evaluating a filter. Counts as "does not match".
#[derive(Clone, Debug, Error)]
pub enum FilterError {
    #[error("Cannot order {path}: {found} is not comparable with {expected}")]
    Incomparable {
        path: String,
        found: String,
        expected: String,
    },

    #[error("Predicate failed: {0}")]
    Predicate(String),

    #[error("Predicate panicked: {0}")]
    Panicked(String),
}

/// Custom predicate over a change event.
pub type Predicate = Arc<dyn Fn(&ChangeEvent) -> Result<bool, FilterError> + Send + Sync>;

/// Which namespaces a subscriber watches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespacePattern {
    /// Every database and collection.
    Cluster,
    /// Every collection of one database.
    Database(String),
    /// A single collection.
    Collection { database: String, collection: String },
}

impl NamespacePattern {
    pub fn collection(database: impl Into<String>, collection: impl Into<String>) -> Self {
        NamespacePattern::Collection {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn matches(&self, ns: &Namespace) -> bool {
        match self {
            NamespacePattern::Cluster => true,
            NamespacePattern::Database(db) => &ns.database == db,
            NamespacePattern::Collection {
                database,
                collection,
            } => &ns.database == database && ns.collection.as_deref() == Some(collection.as_str()),
        }
    }
}

/// Comparison applied to one field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Exists(bool),
    Gt(Value),
    Lt(Value),
}

/// Condition on a dot-separated field path of the event's document.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldMatch {
    pub path: String,
    pub op: FieldOp,
}

impl FieldMatch {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(path, FieldOp::Eq(value.into()))
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(path, FieldOp::Ne(value.into()))
    }

    pub fn one_of(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(path, FieldOp::In(values))
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::new(path, FieldOp::Exists(true))
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(path, FieldOp::Gt(value.into()))
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(path, FieldOp::Lt(value.into()))
    }

    fn new(path: impl Into<String>, op: FieldOp) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }

    fn evaluate(&self, event: &ChangeEvent) -> Result<bool, FilterError> {
        let found = event.document().and_then(|doc| doc.lookup(&self.path));

        match (&self.op, found) {
            (FieldOp::Exists(want), found) => Ok(found.is_some() == *want),
            (FieldOp::Eq(v), Some(found)) => Ok(found == v),
            (FieldOp::Eq(_), None) => Ok(false),
            (FieldOp::Ne(v), Some(found)) => Ok(found != v),
            (FieldOp::Ne(_), None) => Ok(true),
            (FieldOp::In(vs), Some(found)) => Ok(vs.contains(found)),
            (FieldOp::In(_), None) => Ok(false),
            (FieldOp::Gt(v), Some(found)) => Ok(self.compare(found, v)? == Ordering::Greater),
            (FieldOp::Lt(v), Some(found)) => Ok(self.compare(found, v)? == Ordering::Less),
            (FieldOp::Gt(_) | FieldOp::Lt(_), None) => Ok(false),
        }
    }

    fn compare(&self, found: &Value, expected: &Value) -> Result<Ordering, FilterError> {
        let ordering = match (found, expected) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };

        ordering.ok_or_else(|| FilterError::Incomparable {
            path: self.path.clone(),
            found: type_name(found).to_string(),
            expected: type_name(expected).to_string(),
        })
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Filter criteria for a subscriber. All set criteria must hold.
#[derive(Clone, Default)]
pub struct SubscriptionFilter {
    /// Operation kinds to receive (None = all kinds).
    pub operations: Option<Vec<OperationKind>>,

    /// Namespaces to receive (None = all namespaces).
    pub namespaces: Option<Vec<NamespacePattern>>,

    /// Field conditions on the event's document.
    pub fields: Vec<FieldMatch>,

    /// Custom predicate, evaluated last.
    pub predicate: Option<Predicate>,
}

impl SubscriptionFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only these operation kinds.
    pub fn operations(kinds: Vec<OperationKind>) -> Self {
        Self {
            operations: Some(kinds),
            ..Default::default()
        }
    }

    /// Match only events in one namespace pattern.
    pub fn namespace(pattern: NamespacePattern) -> Self {
        Self {
            namespaces: Some(vec![pattern]),
            ..Default::default()
        }
    }

    pub fn with_operations(mut self, kinds: Vec<OperationKind>) -> Self {
        self.operations = Some(kinds);
        self
    }

    pub fn with_field(mut self, condition: FieldMatch) -> Self {
        self.fields.push(condition);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ChangeEvent) -> Result<bool, FilterError> + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Evaluate against one event.
    ///
    /// Panics inside a custom predicate are caught and reported as
    /// [`FilterError::Panicked`].
    pub fn evaluate(&self, event: &ChangeEvent) -> Result<bool, FilterError> {
        if let Some(ref kinds) = self.operations {
            if !kinds.contains(&event.kind()) {
                return Ok(false);
            }
        }

        if let Some(ref patterns) = self.namespaces {
            if !patterns.iter().any(|p| p.matches(&event.namespace)) {
                return Ok(false);
            }
        }

        for condition in &self.fields {
            if !condition.evaluate(event)? {
                return Ok(false);
            }
        }

        match self.predicate {
            Some(ref predicate) => catch_unwind(AssertUnwindSafe(|| predicate(event)))
                .unwrap_or_else(|panic| Err(FilterError::Panicked(panic_message(&*panic)))),
            None => Ok(true),
        }
    }
}

impl fmt::Debug for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionFilter")
            .field("operations", &self.operations)
            .field("namespaces", &self.namespaces)
            .field("fields", &self.fields)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
