//! Postgres-backed `RecordStore`.

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::store::{
    ColumnKind, Direction, FieldValue, Fields, Filter, Patch, Query, Record, RecordStore,
    StoreError,
};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id UUID PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    category TEXT NOT NULL,
    date TIMESTAMPTZ NOT NULL,
    time TEXT,
    venue TEXT NOT NULL,
    city TEXT NOT NULL,
    min_price DOUBLE PRECISION,
    max_price DOUBLE PRECISION,
    image_url TEXT,
    ticket_url TEXT NOT NULL,
    performer_name TEXT,
    is_kids_event BOOLEAN NOT NULL DEFAULT TRUE,
    last_synced TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS events_date_idx ON events (date);
CREATE INDEX IF NOT EXISTS events_city_idx ON events (city);

CREATE TABLE IF NOT EXISTS competitor_matches (
    id UUID PRIMARY KEY,
    event_id UUID NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    competitor_name TEXT NOT NULL,
    competitor_url TEXT NOT NULL,
    match_score DOUBLE PRECISION NOT NULL,
    checked_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    UNIQUE (event_id, competitor_name)
);

CREATE TABLE IF NOT EXISTS youtube_videos (
    id UUID PRIMARY KEY,
    event_id UUID NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    video_id TEXT NOT NULL,
    title TEXT NOT NULL,
    thumbnail_url TEXT NOT NULL,
    channel_title TEXT NOT NULL,
    checked_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    UNIQUE (event_id, video_id)
);
CREATE INDEX IF NOT EXISTS youtube_videos_video_id_idx ON youtube_videos (video_id);

CREATE TABLE IF NOT EXISTS video_comments (
    comment_id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    author_name TEXT NOT NULL,
    author_channel_id TEXT,
    author_profile_url TEXT,
    text_display TEXT NOT NULL,
    like_count BIGINT NOT NULL DEFAULT 0,
    published_at TIMESTAMPTZ NOT NULL,
    is_reply BOOLEAN NOT NULL DEFAULT FALSE,
    parent_comment_id TEXT,
    checked_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS video_comments_video_id_idx ON video_comments (video_id);

CREATE TABLE IF NOT EXISTS search_logs (
    id UUID PRIMARY KEY,
    date TIMESTAMPTZ NOT NULL,
    query_type TEXT NOT NULL,
    queries_used BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS search_logs_date_type_idx ON search_logs (date, query_type);

CREATE TABLE IF NOT EXISTS sync_logs (
    id UUID PRIMARY KEY,
    status TEXT NOT NULL,
    events_total BIGINT NOT NULL,
    events_new BIGINT NOT NULL,
    events_updated BIGINT NOT NULL,
    events_removed BIGINT NOT NULL,
    error_message TEXT,
    synced_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS run_leases (
    name TEXT PRIMARY KEY,
    owner UUID NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("schema applied");
        Ok(())
    }
}

type Builder = QueryBuilder<'static, Postgres>;

fn push_value(qb: &mut Builder, value: &FieldValue) {
    match value.clone() {
        FieldValue::Null => {
            qb.push("NULL");
        }
        FieldValue::Text(v) => {
            qb.push_bind(v);
        }
        FieldValue::Int(v) => {
            qb.push_bind(v);
        }
        FieldValue::Float(v) => {
            qb.push_bind(v);
        }
        FieldValue::Bool(v) => {
            qb.push_bind(v);
        }
        FieldValue::Timestamp(v) => {
            qb.push_bind(v);
        }
        FieldValue::Uuid(v) => {
            qb.push_bind(v);
        }
    }
}

/// Quoted identifier; `date` and `time` are column names here.
fn ident(name: &str) -> String {
    format!("\"{name}\"")
}

fn push_comparison(qb: &mut Builder, field: &str, op: &str, value: &FieldValue) {
    qb.push(ident(field)).push(op);
    push_value(qb, value);
}

fn push_joined(qb: &mut Builder, parts: &[Filter], joiner: &str) {
    qb.push("(");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        push_filter(qb, part);
    }
    qb.push(")");
}

fn push_filter(qb: &mut Builder, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Eq(field, FieldValue::Null) => {
            qb.push(ident(field)).push(" IS NULL");
        }
        Filter::Eq(field, value) => push_comparison(qb, field, " = ", value),
        Filter::In(_, values) if values.is_empty() => {
            qb.push("FALSE");
        }
        Filter::In(field, values) => {
            qb.push(ident(field)).push(" IN (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, value);
            }
            qb.push(")");
        }
        Filter::Gt(field, value) => push_comparison(qb, field, " > ", value),
        Filter::Gte(field, value) => push_comparison(qb, field, " >= ", value),
        Filter::Lt(field, value) => push_comparison(qb, field, " < ", value),
        Filter::Lte(field, value) => push_comparison(qb, field, " <= ", value),
        Filter::Contains(field, needle) => {
            qb.push("strpos(lower(")
                .push(ident(field))
                .push("), lower(")
                .push_bind(needle.clone())
                .push(")) > 0");
        }
        Filter::And(parts) if parts.is_empty() => {
            qb.push("TRUE");
        }
        Filter::And(parts) => push_joined(qb, parts, " AND "),
        Filter::Or(parts) if parts.is_empty() => {
            qb.push("FALSE");
        }
        Filter::Or(parts) => push_joined(qb, parts, " OR "),
    }
}

fn push_assignments(qb: &mut Builder, patch: &Patch) {
    for (i, (field, value)) in patch.assignments().iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(ident(field)).push(" = ");
        push_value(qb, value);
    }
}

fn column_list<R: Record>() -> String {
    R::COLUMNS
        .iter()
        .map(|c| ident(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_row<R: Record>(row: &PgRow) -> Result<R, StoreError> {
    let mut fields = Fields::new();
    for column in R::COLUMNS {
        let name = column.name;
        let value: FieldValue = match column.kind {
            ColumnKind::Uuid => row.try_get::<Option<uuid::Uuid>, _>(name)?.into(),
            ColumnKind::Text => row.try_get::<Option<String>, _>(name)?.into(),
            ColumnKind::Int => row.try_get::<Option<i64>, _>(name)?.into(),
            ColumnKind::Float => row.try_get::<Option<f64>, _>(name)?.into(),
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(name)?.into(),
            ColumnKind::Timestamp => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)?
                .into(),
        };
        fields.set(name, value);
    }
    R::from_fields(&fields)
}

fn map_write_error(table: &'static str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict { table },
        _ => StoreError::Database(err),
    }
}

fn insert_statement<R: Record>(record: &R) -> Builder {
    let fields = record.to_fields();
    let mut qb = Builder::new(format!("INSERT INTO {} ({}) VALUES (", R::TABLE, column_list::<R>()));
    for (i, column) in R::COLUMNS.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, fields.get(column.name));
    }
    qb.push(")");
    qb
}

#[async_trait]
impl RecordStore for PgStore {
    async fn find_many<R: Record>(&self, query: Query) -> Result<Vec<R>, StoreError> {
        query.validate::<R>()?;
        let mut qb = Builder::new(format!("SELECT {} FROM {} WHERE ", column_list::<R>(), R::TABLE));
        push_filter(&mut qb, &query.filter);
        if !query.order_by.is_empty() {
            qb.push(" ORDER BY ");
            for (i, order) in query.order_by.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(ident(order.field)).push(match order.direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
            }
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if query.offset > 0 {
            qb.push(" OFFSET ").push_bind(query.offset as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_row::<R>).collect()
    }

    async fn create<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let mut qb = insert_statement(record);
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(R::TABLE, e))?;
        Ok(())
    }

    async fn update<R: Record>(&self, filter: Filter, patch: Patch) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        patch.validate::<R>()?;
        if patch.is_empty() {
            return self.count::<R>(filter).await;
        }
        let mut qb = Builder::new(format!("UPDATE {} SET ", R::TABLE));
        push_assignments(&mut qb, &patch);
        qb.push(" WHERE ");
        push_filter(&mut qb, &filter);
        let done = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(R::TABLE, e))?;
        Ok(done.rows_affected())
    }

    async fn upsert<R: Record>(&self, record: &R, update: Patch) -> Result<(), StoreError> {
        update.validate::<R>()?;
        let mut qb = insert_statement(record);
        qb.push(" ON CONFLICT (")
            .push(
                R::identity_columns()
                    .iter()
                    .map(|c| ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
            )
            .push(")");
        if update.is_empty() {
            qb.push(" DO NOTHING");
        } else {
            qb.push(" DO UPDATE SET ");
            push_assignments(&mut qb, &update);
        }
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(R::TABLE, e))?;
        Ok(())
    }

    async fn delete_many<R: Record>(&self, filter: Filter) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        let mut qb = Builder::new(format!("DELETE FROM {} WHERE ", R::TABLE));
        push_filter(&mut qb, &filter);
        let done = qb.build().execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn count<R: Record>(&self, filter: Filter) -> Result<u64, StoreError> {
        filter.validate::<R>()?;
        let mut qb = Builder::new(format!("SELECT COUNT(*) AS n FROM {} WHERE ", R::TABLE));
        push_filter(&mut qb, &filter);
        let row = qb.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use kidsync_core::{Event, SearchLog};

    use super::*;

    #[test]
    fn filters_render_to_parameterized_sql() {
        let mut qb = Builder::new("SELECT 1 FROM events WHERE ");
        let filter = Filter::gte("date", chrono::Utc::now())
            .and(Filter::Or(vec![
                Filter::contains("name", "פן"),
                Filter::contains("city", "פן"),
            ]))
            .and(Filter::is_in("city", Vec::<String>::new()));
        push_filter(&mut qb, &filter);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM events WHERE (\"date\" >= $1 AND (strpos(lower(\"name\"), lower($2)) > 0 \
             OR strpos(lower(\"city\"), lower($3)) > 0) AND FALSE)"
        );
    }

    #[test]
    fn null_equality_uses_is_null() {
        let mut qb = Builder::new("");
        push_filter(&mut qb, &Filter::eq("performer_name", FieldValue::Null));
        assert_eq!(qb.sql(), "\"performer_name\" IS NULL");
    }

    #[test]
    fn schema_declares_every_record_table() {
        for table in [Event::TABLE, SearchLog::TABLE, "run_leases", "video_comments"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")));
        }
    }
}
