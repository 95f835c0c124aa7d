//! Generic record-store contract shared by the in-memory and Postgres backends.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique key conflict on {table}")]
    Conflict { table: &'static str },
    #[error("unknown field {field} on {table}")]
    UnknownField { table: &'static str, field: String },
    #[error("cannot decode field {field}: expected {expected}")]
    Decode { field: String, expected: &'static str },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A single column value. Comparisons only succeed between like kinds
/// (integers and floats compare numerically).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Sort order with NULL greater than every value, as Postgres sorts ascending.
    fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<&String> for FieldValue {
    fn from(v: &String) -> Self {
        FieldValue::Text(v.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Column name -> value map used as the neutral row representation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(BTreeMap<String, FieldValue>);

static NULL_VALUE: FieldValue = FieldValue::Null;

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> &FieldValue {
        self.0.get(name).unwrap_or(&NULL_VALUE)
    }

    fn decode_err(name: &str, expected: &'static str) -> StoreError {
        StoreError::Decode {
            field: name.to_string(),
            expected,
        }
    }

    pub fn text(&self, name: &str) -> Result<String, StoreError> {
        self.opt_text(name)?.ok_or_else(|| Self::decode_err(name, "text"))
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self.get(name) {
            FieldValue::Null => Ok(None),
            FieldValue::Text(v) => Ok(Some(v.clone())),
            _ => Err(Self::decode_err(name, "text")),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, StoreError> {
        match self.get(name) {
            FieldValue::Int(v) => Ok(*v),
            _ => Err(Self::decode_err(name, "integer")),
        }
    }

    pub fn opt_float(&self, name: &str) -> Result<Option<f64>, StoreError> {
        match self.get(name) {
            FieldValue::Null => Ok(None),
            FieldValue::Float(v) => Ok(Some(*v)),
            FieldValue::Int(v) => Ok(Some(*v as f64)),
            _ => Err(Self::decode_err(name, "float")),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, StoreError> {
        self.opt_float(name)?.ok_or_else(|| Self::decode_err(name, "float"))
    }

    pub fn boolean(&self, name: &str) -> Result<bool, StoreError> {
        match self.get(name) {
            FieldValue::Bool(v) => Ok(*v),
            _ => Err(Self::decode_err(name, "boolean")),
        }
    }

    pub fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, StoreError> {
        match self.get(name) {
            FieldValue::Timestamp(v) => Ok(*v),
            _ => Err(Self::decode_err(name, "timestamp")),
        }
    }

    pub fn uuid(&self, name: &str) -> Result<Uuid, StoreError> {
        match self.get(name) {
            FieldValue::Uuid(v) => Ok(*v),
            _ => Err(Self::decode_err(name, "uuid")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    pub const fn required(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
        }
    }
}

/// Dependent rows removed together with their owner.
#[derive(Debug, Clone, Copy)]
pub struct Cascade {
    pub table: &'static str,
    pub foreign_key: &'static str,
    pub local_key: &'static str,
}

/// A persisted record kind.
pub trait Record: Clone + Send + Sync + Sized + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [Column];
    /// Unique column sets. The first set is the identity used by `upsert`.
    const UNIQUE_KEYS: &'static [&'static [&'static str]];
    const CASCADE: &'static [Cascade] = &[];

    fn to_fields(&self) -> Fields;

    fn from_fields(fields: &Fields) -> Result<Self, StoreError>;

    fn identity_columns() -> &'static [&'static str] {
        Self::UNIQUE_KEYS.first().copied().unwrap_or(&[])
    }

    fn identity_filter(&self) -> Filter {
        let fields = self.to_fields();
        Filter::And(
            Self::identity_columns()
                .iter()
                .map(|name| Filter::Eq(name, fields.get(name).clone()))
                .collect(),
        )
    }

    fn column(name: &str) -> Option<&'static Column> {
        Self::COLUMNS.iter().find(|c| c.name == name)
    }
}

pub(crate) fn validate_field<R: Record>(name: &str) -> Result<(), StoreError> {
    if R::column(name).is_some() {
        Ok(())
    } else {
        Err(StoreError::UnknownField {
            table: R::TABLE,
            field: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(&'static str, FieldValue),
    In(&'static str, Vec<FieldValue>),
    Gt(&'static str, FieldValue),
    Gte(&'static str, FieldValue),
    Lt(&'static str, FieldValue),
    Lte(&'static str, FieldValue),
    /// Case-insensitive substring match on a text column.
    Contains(&'static str, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Filter::Eq(field, value.into())
    }

    pub fn is_in<V: Into<FieldValue>>(field: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(field, values.into_iter().map(Into::into).collect())
    }

    pub fn gt(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Filter::Gt(field, value.into())
    }

    pub fn gte(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Filter::Gte(field, value.into())
    }

    pub fn lt(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Filter::Lt(field, value.into())
    }

    pub fn lte(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Filter::Lte(field, value.into())
    }

    pub fn contains(field: &'static str, needle: impl Into<String>) -> Self {
        Filter::Contains(field, needle.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) => other,
            (this, Filter::All) => this,
            (Filter::And(mut parts), other) => {
                parts.push(other);
                Filter::And(parts)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        let cmp = |name: &str, value: &FieldValue| fields.get(name).compare(value);
        match self {
            Filter::All => true,
            Filter::Eq(name, FieldValue::Null) => fields.get(name).is_null(),
            Filter::Eq(name, value) => cmp(name, value) == Some(Ordering::Equal),
            Filter::In(name, values) => values
                .iter()
                .any(|v| cmp(name, v) == Some(Ordering::Equal)),
            Filter::Gt(name, value) => cmp(name, value) == Some(Ordering::Greater),
            Filter::Gte(name, value) => matches!(
                cmp(name, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(name, value) => cmp(name, value) == Some(Ordering::Less),
            Filter::Lte(name, value) => {
                matches!(cmp(name, value), Some(Ordering::Less | Ordering::Equal))
            }
            Filter::Contains(name, needle) => match fields.get(name) {
                FieldValue::Text(text) => text.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
            Filter::And(parts) => parts.iter().all(|f| f.matches(fields)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(fields)),
        }
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<&'static str>) {
        match self {
            Filter::All => {}
            Filter::Eq(name, _)
            | Filter::In(name, _)
            | Filter::Gt(name, _)
            | Filter::Gte(name, _)
            | Filter::Lt(name, _)
            | Filter::Lte(name, _)
            | Filter::Contains(name, _) => out.push(name),
            Filter::And(parts) | Filter::Or(parts) => {
                for part in parts {
                    part.collect_fields(out);
                }
            }
        }
    }

    pub(crate) fn validate<R: Record>(&self) -> Result<(), StoreError> {
        self.field_names()
            .into_iter()
            .try_for_each(validate_field::<R>)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn all() -> Self {
        Self::new(Filter::All)
    }

    pub fn asc(mut self, field: &'static str) -> Self {
        self.order_by.push(OrderBy {
            field,
            direction: Direction::Asc,
        });
        self
    }

    pub fn desc(mut self, field: &'static str) -> Self {
        self.order_by.push(OrderBy {
            field,
            direction: Direction::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn validate<R: Record>(&self) -> Result<(), StoreError> {
        self.filter.validate::<R>()?;
        self.order_by
            .iter()
            .try_for_each(|o| validate_field::<R>(o.field))
    }

    /// Order rows in memory the way the SQL backend would.
    pub fn sort_rows(&self, rows: &mut [Fields]) {
        if self.order_by.is_empty() {
            return;
        }
        rows.sort_by(|a, b| {
            for order in &self.order_by {
                let ord = a.get(order.field).sort_cmp(b.get(order.field));
                let ord = match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}

/// Column assignments applied by `update` and the update branch of `upsert`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Vec<(&'static str, FieldValue)>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &'static str, value: impl Into<FieldValue>) -> Self {
        self.0.push((field, value.into()));
        self
    }

    /// Every column of `record` except the listed ones.
    pub fn from_record<R: Record>(record: &R, except: &[&str]) -> Self {
        let fields = record.to_fields();
        Patch(
            R::COLUMNS
                .iter()
                .filter(|c| !except.contains(&c.name))
                .map(|c| (c.name, fields.get(c.name).clone()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn assignments(&self) -> &[(&'static str, FieldValue)] {
        &self.0
    }

    pub fn apply(&self, fields: &mut Fields) {
        for (name, value) in &self.0 {
            fields.set(name, value.clone());
        }
    }

    pub(crate) fn validate<R: Record>(&self) -> Result<(), StoreError> {
        self.0.iter().try_for_each(|(name, _)| validate_field::<R>(name))
    }
}

/// The record-store contract the sync core consumes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_many<R: Record>(&self, query: Query) -> Result<Vec<R>, StoreError>;

    async fn find_first<R: Record>(&self, query: Query) -> Result<Option<R>, StoreError> {
        let rows = self.find_many::<R>(query.limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    async fn find_unique<R: Record>(&self, identity: Filter) -> Result<Option<R>, StoreError> {
        self.find_first::<R>(Query::new(identity)).await
    }

    /// Insert a new row. Fails with `Conflict` when any unique key is taken.
    async fn create<R: Record>(&self, record: &R) -> Result<(), StoreError>;

    async fn update<R: Record>(&self, filter: Filter, patch: Patch) -> Result<u64, StoreError>;

    /// Insert `record`, or apply `update` to the row sharing its identity key.
    async fn upsert<R: Record>(&self, record: &R, update: Patch) -> Result<(), StoreError>;

    async fn delete_many<R: Record>(&self, filter: Filter) -> Result<u64, StoreError>;

    async fn count<R: Record>(&self, filter: Filter) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, score: f64) -> Fields {
        Fields::new().with("name", name).with("score", score)
    }

    #[test]
    fn filters_compare_like_kinds_only() {
        let r = row("Peter Pan", 0.4);
        assert!(Filter::gte("score", 0.35).matches(&r));
        assert!(!Filter::gt("score", 0.4).matches(&r));
        assert!(Filter::contains("name", "pan").matches(&r));
        assert!(!Filter::eq("score", "0.4").matches(&r));
        assert!(Filter::eq("missing", FieldValue::Null).matches(&r));
        assert!(!Filter::is_in("name", Vec::<String>::new()).matches(&r));
    }

    #[test]
    fn or_and_compose() {
        let r = row("Snow White", 0.9);
        let f = Filter::Or(vec![
            Filter::contains("name", "peter"),
            Filter::contains("name", "snow"),
        ])
        .and(Filter::lt("score", 1.0));
        assert!(f.matches(&r));
        assert_eq!(f.field_names(), vec!["name", "name", "score"]);
    }

    #[test]
    fn sort_puts_nulls_last_ascending() {
        let mut rows = vec![
            Fields::new().with("n", FieldValue::Null),
            Fields::new().with("n", 2_i64),
            Fields::new().with("n", 1_i64),
        ];
        Query::all().asc("n").sort_rows(&mut rows);
        assert_eq!(rows[0].get("n"), &FieldValue::Int(1));
        assert!(rows[2].get("n").is_null());

        Query::all().desc("n").sort_rows(&mut rows);
        assert!(rows[0].get("n").is_null());
    }
}
