use futures::future::BoxFuture;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tilegeo::{check_columns, ColumnKind, ImageRecord, LabelRecord, RecordError, SqlValue, TableRow, TileOrigin};

use crate::config::DatabaseArgs;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}")]
    TableName(String),
    #[error("record for {file_path} is invalid: {source}")]
    Invalid {
        file_path: String,
        #[source]
        source: RecordError,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Destination for image and label rows.
pub trait RecordSink: Send + Sync {
    fn insert_image<'a>(&'a self, record: &'a ImageRecord) -> BoxFuture<'a, Result<(), StoreError>>;
    fn insert_label<'a>(&'a self, record: &'a LabelRecord) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and
/// underscores (not starting with a digit). Table names cannot be bound as
/// parameters, so only names passing this check are ever written into SQL.
pub fn validate_table_name(name: &str) -> Result<&str, StoreError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid_part = |part: &&str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if parts.len() > 2 || !parts.iter().all(valid_part) {
        return Err(StoreError::TableName(name.to_string()));
    }
    Ok(name)
}

/// `INSERT` for a row type, with geometry columns wrapped in `ST_GeomFromText`.
pub fn insert_sql<R: TableRow>(table: &str, srid: i32) -> Result<String, StoreError> {
    let table = validate_table_name(table)?;
    let columns: Vec<&str> = R::COLUMNS.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = R::COLUMNS
        .iter()
        .enumerate()
        .map(|(i, c)| match c.kind {
            ColumnKind::Geometry => format!("ST_GeomFromText(${}, {srid})", i + 1),
            _ => format!("${}", i + 1),
        })
        .collect();
    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    ))
}

fn invalid(row: &impl TableRow, source: RecordError) -> StoreError {
    StoreError::Invalid {
        file_path: row.file_path().to_string(),
        source,
    }
}

/// PostGIS-backed record store. The pool lives for one run; every statement
/// checks a connection out and returns it when it completes.
pub struct PgStore {
    pool: PgPool,
    label_table: String,
    image_table: String,
    image_sql: String,
    label_sql: String,
}

impl PgStore {
    pub async fn connect(db: &DatabaseArgs, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(db.acquire_timeout())
            .connect(&db.database_url)
            .await?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self::with_pool(pool, db)?)
    }

    pub fn with_pool(pool: PgPool, db: &DatabaseArgs) -> Result<Self, StoreError> {
        Ok(Self {
            image_sql: insert_sql::<ImageRecord>(&db.image_table, db.srid)?,
            label_sql: insert_sql::<LabelRecord>(&db.label_table, db.srid)?,
            label_table: validate_table_name(&db.label_table)?.to_string(),
            image_table: validate_table_name(&db.image_table)?.to_string(),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Empties the label and image tables.
    pub async fn truncate(&self) -> Result<(), StoreError> {
        for table in [&self.label_table, &self.image_table] {
            sqlx::query(&format!("TRUNCATE TABLE {table}"))
                .execute(&self.pool)
                .await?;
            tracing::info!(table = %table, "Truncated table");
        }
        Ok(())
    }

    /// Tile origins from a precomputed grid table with `latitude` and `longitude` columns.
    pub async fn load_grid(&self, table: &str) -> Result<Vec<TileOrigin>, StoreError> {
        let table = validate_table_name(table)?;
        let rows: Vec<(f64, f64)> = sqlx::query_as(&format!(
            "SELECT latitude::float8, longitude::float8 FROM {table}"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(latitude, longitude)| TileOrigin::new(latitude, longitude))
            .collect())
    }

    async fn insert<R: TableRow>(&self, sql: &str, row: &R) -> Result<(), StoreError> {
        row.validate().map_err(|e| invalid(row, e))?;
        check_columns(row).map_err(|e| invalid(row, e))?;

        let mut query = sqlx::query(sql);
        for value in row.values() {
            query = match value {
                SqlValue::Text(v) => query.bind(v),
                SqlValue::Integer(v) => query.bind(v),
                SqlValue::Float(v) => query.bind(v),
                SqlValue::Geometry(wkt) => query.bind(wkt),
            };
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl RecordSink for PgStore {
    fn insert_image<'a>(&'a self, record: &'a ImageRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.insert(&self.image_sql, record))
    }

    fn insert_label<'a>(&'a self, record: &'a LabelRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.insert(&self.label_sql, record))
    }
}
