//! In-process `RecordStore` used by tests and dry runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{Fields, Filter, Patch, Query, Record, RecordStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<&'static str, Vec<Fields>>,
    failing_writes: HashSet<&'static str>,
    failing_reads: HashSet<&'static str>,
}

impl MemoryState {
    fn table(&mut self, name: &'static str) -> &mut Vec<Fields> {
        self.tables.entry(name).or_default()
    }

    fn check_writable(&self, table: &'static str) -> Result<(), StoreError> {
        if self.failing_writes.contains(table) {
            Err(StoreError::Unavailable(format!("writes to {table} are failing")))
        } else {
            Ok(())
        }
    }

    fn check_readable(&self, table: &'static str) -> Result<(), StoreError> {
        if self.failing_reads.contains(table) {
            Err(StoreError::Unavailable(format!("reads from {table} are failing")))
        } else {
            Ok(())
        }
    }
}

/// Enforces unique keys and cascades the way the SQL schema does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `table` fail until `restore_writes` is called.
    pub async fn fail_writes_to(&self, table: &'static str) {
        self.state.lock().await.failing_writes.insert(table);
    }

    pub async fn restore_writes(&self, table: &'static str) {
        self.state.lock().await.failing_writes.remove(table);
    }

    /// Make every read of `table` fail until `restore_reads` is called.
    pub async fn fail_reads_from(&self, table: &'static str) {
        self.state.lock().await.failing_reads.insert(table);
    }

    pub async fn restore_reads(&self, table: &'static str) {
        self.state.lock().await.failing_reads.remove(table);
    }

    pub async fn row_count(&self, table: &'static str) -> usize {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn key_of(fields: &Fields, columns: &[&str]) -> Option<String> {
    let mut key = String::new();
    for column in columns {
        let value = fields.get(column);
        if value.is_null() {
            return None;
        }
        key.push_str(&format!("{value:?}\u{1f}"));
    }
    Some(key)
}

fn check_unique<R: Record>(rows: &[Fields]) -> Result<(), StoreError> {
    for columns in R::UNIQUE_KEYS {
        let mut seen = HashSet::new();
        for row in rows {
            if let Some(key) = key_of(row, columns) {
                if !seen.insert(key) {
                    return Err(StoreError::Conflict { table: R::TABLE });
                }
            }
        }
    }
    Ok(())
}

fn normalize<R: Record>(record: &R) -> Fields {
    let fields = record.to_fields();
    let mut out = Fields::new();
    for column in R::COLUMNS {
        out.set(column.name, fields.get(column.name).clone());
    }
    out
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_many<R: Record>(&self, query: Query) -> Result<Vec<R>, StoreError> {
        query.validate::<R>()?;
        let state = self.state.lock().await;
        state.check_readable(R::TABLE)?;
        let mut rows: Vec<Fields> = state
            .tables
            .get(R::TABLE)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(state);

        query.sort_rows(&mut rows);
        let limit = query.limit.unwrap_or(usize::MAX);
        rows.iter()
            .skip(query.offset)
            .take(limit)
            .map(R::from_fields)
            .collect()
    }

    async fn create<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(R::TABLE)?;
        let table = state.table(R::TABLE);
        let mut next = table.clone();
        next.push(normalize(record));
        check_unique::<R>(&next)?;
        *table = next;
        Ok(())
    }

    async fn update<R: Record>(&self, filter: Filter, patch: Patch) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        patch.validate::<R>()?;
        let mut state = self.state.lock().await;
        state.check_writable(R::TABLE)?;
        let table = state.table(R::TABLE);
        let mut next = table.clone();
        let mut touched = 0;
        for row in next.iter_mut().filter(|row| filter.matches(row)) {
            patch.apply(row);
            touched += 1;
        }
        check_unique::<R>(&next)?;
        *table = next;
        Ok(touched)
    }

    async fn upsert<R: Record>(&self, record: &R, update: Patch) -> Result<(), StoreError> {
        update.validate::<R>()?;
        let identity = record.identity_filter();
        let mut state = self.state.lock().await;
        state.check_writable(R::TABLE)?;
        let table = state.table(R::TABLE);
        let mut next = table.clone();
        match next.iter_mut().find(|row| identity.matches(row)) {
            Some(row) => update.apply(row),
            None => next.push(normalize(record)),
        }
        check_unique::<R>(&next)?;
        *table = next;
        Ok(())
    }

    async fn delete_many<R: Record>(&self, filter: Filter) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        let mut state = self.state.lock().await;
        state.check_writable(R::TABLE)?;
        let table = state.table(R::TABLE);
        let (removed, kept): (Vec<Fields>, Vec<Fields>) =
            table.drain(..).partition(|row| filter.matches(row));
        *table = kept;

        for cascade in R::CASCADE {
            let owners: Vec<_> = removed
                .iter()
                .map(|row| row.get(cascade.local_key).clone())
                .collect();
            let dependent = Filter::In(cascade.foreign_key, owners);
            state
                .table(cascade.table)
                .retain(|row| !dependent.matches(row));
        }
        Ok(removed.len() as u64)
    }

    async fn count<R: Record>(&self, filter: Filter) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        let state = self.state.lock().await;
        state.check_readable(R::TABLE)?;
        Ok(state
            .tables
            .get(R::TABLE)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).count())
            .unwrap_or(0) as u64)
    }
}
