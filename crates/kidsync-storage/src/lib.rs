//! Record persistence (in-memory and Postgres) plus the shared HTTP client.

pub mod http;
pub mod memory;
pub mod postgres;
mod records;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::{PgStore, SCHEMA};
pub use store::{
    Cascade, Column, ColumnKind, Direction, FieldValue, Fields, Filter, OrderBy, Patch, Query,
    Record, RecordStore, StoreError,
};

pub const CRATE_NAME: &str = "kidsync-storage";
