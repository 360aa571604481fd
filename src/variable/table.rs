use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Value, VariableType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableScope {
    /// Provided by the caller or the environment.
    System,
    /// Declared in the front-matter.
    UserDefined,
}

/// One applied pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOperation {
    pub variable: String,
    pub function_name: String,
    pub timestamp: DateTime<Utc>,
    pub value_after: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedVariable {
    pub value_type: VariableType,
    pub value: Value,
    pub scope: VariableScope,
    /// Indices into the table's operation arena, in application order.
    pub history: Vec<usize>,
}

/// Variables of one compilation run. Entries and operations are only ever
/// appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableTable {
    order: Vec<String>,
    variables: HashMap<String, ResolvedVariable>,
    operations: Vec<VariableOperation>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable without history. Returns false if the name is taken.
    pub fn insert(&mut self, name: &str, value: Value, scope: VariableScope) -> bool {
        self.insert_with_history(name, value, scope, Vec::new())
    }

    pub fn insert_with_history(
        &mut self,
        name: &str,
        value: Value,
        scope: VariableScope,
        history: Vec<usize>,
    ) -> bool {
        if self.variables.contains_key(name) {
            return false;
        }
        self.order.push(name.to_string());
        self.variables.insert(
            name.to_string(),
            ResolvedVariable {
                value_type: value.value_type(),
                value,
                scope,
                history,
            },
        );
        true
    }

    /// Appends an operation to the arena and returns its index.
    pub fn record(&mut self, variable: &str, function_name: &str, value_after: Value) -> usize {
        self.operations.push(VariableOperation {
            variable: variable.to_string(),
            function_name: function_name.to_string(),
            timestamp: Utc::now(),
            value_after,
        });
        self.operations.len() - 1
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedVariable> {
        self.variables.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.variables.get(name).map(|v| &v.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedVariable)> {
        self.order
            .iter()
            .filter_map(|name| self.variables.get(name).map(|v| (name.as_str(), v)))
    }

    pub fn operations(&self) -> &[VariableOperation] {
        &self.operations
    }

    /// Operations applied to `name`, in order.
    pub fn history(&self, name: &str) -> Vec<&VariableOperation> {
        self.variables
            .get(name)
            .map(|v| {
                v.history
                    .iter()
                    .filter_map(|&i| self.operations.get(i))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_append_only() {
        let mut table = VariableTable::new();
        assert!(table.insert("a", Value::text("1"), VariableScope::System));
        assert!(!table.insert("a", Value::text("2"), VariableScope::UserDefined));
        assert_eq!(table.value("a"), Some(&Value::text("1")));
        assert_eq!(table.get("a").map(|v| v.scope), Some(VariableScope::System));
    }

    #[test]
    fn test_history_follows_arena() {
        let mut table = VariableTable::new();
        let first = table.record("x", "read", Value::text("a\nb"));
        table.record("y", "print", Value::text("other"));
        let second = table.record("x", "head", Value::lines(["a"]));
        table.insert_with_history(
            "x",
            Value::lines(["a"]),
            VariableScope::UserDefined,
            vec![first, second],
        );

        let names: Vec<&str> = table
            .history("x")
            .iter()
            .map(|op| op.function_name.as_str())
            .collect();
        assert_eq!(names, vec!["read", "head"]);
        assert_eq!(table.operations().len(), 3);
        assert!(table.history("y").is_empty());
    }

    #[test]
    fn test_iter_keeps_insertion_order() {
        let mut table = VariableTable::new();
        table.insert("b", Value::Null, VariableScope::System);
        table.insert("a", Value::Null, VariableScope::System);
        let names: Vec<&str> = table.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
