//! Server-side change feed filtering.
//!
//! A [`Filter`] restricts a subscription to a set of operation kinds and,
//! optionally, to documents whose fields equal given values. Field paths are
//! dotted and relative to the full document, so `address.city` matches
//! `{"address": {"city": ..}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feed::{ChangeEvent, OperationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    operations: Vec<OperationKind>,
    #[serde(default)]
    equals: Vec<(String, Value)>,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            operations: OperationKind::ALL.to_vec(),
            equals: Vec::new(),
        }
    }
}

impl Filter {
    /// Matches every insert, update and replace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to the given operation kinds.
    pub fn operations(mut self, kinds: impl IntoIterator<Item = OperationKind>) -> Self {
        self.operations = kinds.into_iter().collect();
        self
    }

    /// Additionally requires the document field at `path` to equal `value`.
    pub fn field_eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((path.into(), value.into()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.operations.contains(&event.operation)
            && self
                .equals
                .iter()
                .all(|(path, expected)| lookup(&event.document, path) == Some(expected))
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |value, segment| value.as_object()?.get(segment))
}
