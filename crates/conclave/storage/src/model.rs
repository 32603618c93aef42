use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

static NULL: Value = Value::Null;

/// A single column value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row keyed by column name. Absent columns read as NULL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn value(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.value(column).as_int()
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.value(column).as_text()
    }

    pub fn bool(&self, column: &str) -> Option<bool> {
        self.value(column).as_bool()
    }

    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.value(column).as_timestamp()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite this row's columns with every column present in `changes`.
    pub fn apply(&mut self, changes: &Row) {
        for (column, value) in changes.columns() {
            self.0.insert(column.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Condition on a single column. Comparisons against NULL follow SQL and never match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    IsNull,
    NotNull,
}

impl Predicate {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::IsNull => value.is_null(),
            Predicate::NotNull => !value.is_null(),
            _ if value.is_null() => false,
            Predicate::Eq(expected) => !expected.is_null() && value == expected,
            Predicate::Ne(expected) => !expected.is_null() && value != expected,
            Predicate::In(options) => options.iter().any(|option| option == value),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub column: String,
    pub predicate: Predicate,
}

/// Conjunction of column predicates. The empty filter matches every row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().eq(column, value)
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, Predicate::Eq(value.into()))
    }

    pub fn ne(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(column, Predicate::Ne(value.into()))
    }

    pub fn one_of(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(column, Predicate::In(values))
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.with(column, Predicate::IsNull)
    }

    pub fn not_null(self, column: impl Into<String>) -> Self {
        self.with(column, Predicate::NotNull)
    }

    pub fn with(mut self, column: impl Into<String>, predicate: Predicate) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            predicate,
        });
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.clauses
            .iter()
            .all(|clause| clause.predicate.matches(row.value(&clause.column)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_columns_read_as_null() {
        let row = Row::new().with("id", 1);
        assert_eq!(row.value("missing"), &Value::Null);
        assert_eq!(row.int("id"), Some(1));
        assert_eq!(row.text("id"), None);
    }

    #[test]
    fn null_never_satisfies_comparisons() {
        let row = Row::new().with("revoked_at", Value::Null).with("kind", "INVITE");

        assert!(!Filter::by("revoked_at", Value::Null).matches(&row));
        assert!(!Filter::all().ne("revoked_at", 3).matches(&row));
        assert!(Filter::all().is_null("revoked_at").matches(&row));
        assert!(Filter::all().ne("kind", "ACCEPT").matches(&row));
        assert!(!Filter::all().ne("kind", "INVITE").matches(&row));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::all().matches(&Row::new()));
    }

    #[test]
    fn one_of_matches_any_option() {
        let row = Row::new().with("group_id", 7);
        let filter = Filter::all().one_of("group_id", vec![Value::Int(3), Value::Int(7)]);
        assert!(filter.matches(&row));
        assert!(!Filter::all()
            .one_of("group_id", vec![Value::Int(3)])
            .matches(&row));
    }
}
