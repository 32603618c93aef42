//! PostgreSQL adapter for the store contract.
//!
//! The catalog is introspected from `pg_catalog`: columns, primary keys,
//! unique constraints, unique indexes and foreign keys of one schema. Partial
//! unique indexes are reported without their predicate, which makes them
//! behave as full constraints for migration-safety checks. Foreign tables are
//! reported on the `foreign` partition.

use crate::catalog::{ColumnDef, ColumnType, ForeignKey, SchemaCatalog, TableDescriptor, UniqueConstraint};
use crate::model::{Filter, Predicate, Row, Value};
use crate::traits::{Store, Transaction};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Partition reported for tables hosted by a foreign data wrapper.
pub const FOREIGN_PARTITION: &str = "foreign";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    schema: String,
    partition: String,
}

impl PostgresStore {
    /// Connect with default pool parameters against the `public` schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            partition: crate::catalog::DEFAULT_PARTITION.to_string(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_tables(&self) -> StorageResult<BTreeMap<String, TableDescriptor>> {
        let rows = sqlx::query(
            r#"
            SELECT c.relname AS table_name,
                   c.relkind::text AS relkind,
                   a.attname AS column_name,
                   format_type(a.atttypid, a.atttypmod) AS column_type,
                   a.attnotnull AS not_null
            FROM pg_attribute a
            JOIN pg_class c ON c.oid = a.attrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND c.relkind IN ('r', 'p', 'f')
              AND a.attnum > 0
              AND NOT a.attisdropped
            ORDER BY c.relname, a.attnum
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("table_name").map_err(backend)?;
            let relkind: String = row.try_get("relkind").map_err(backend)?;
            let column: String = row.try_get("column_name").map_err(backend)?;
            let sql_type: String = row.try_get("column_type").map_err(backend)?;
            let not_null: bool = row.try_get("not_null").map_err(backend)?;

            let descriptor = tables.entry(table.clone()).or_insert_with(|| {
                let descriptor = TableDescriptor::new(table);
                if relkind == "f" {
                    descriptor.in_partition(FOREIGN_PARTITION)
                } else {
                    descriptor.in_partition(self.partition.clone())
                }
            });
            descriptor.columns.push(ColumnDef {
                name: column,
                column_type: column_type_of(&sql_type),
                nullable: !not_null,
            });
        }
        Ok(tables)
    }

    async fn load_constraints(
        &self,
        tables: &mut BTreeMap<String, TableDescriptor>,
    ) -> StorageResult<()> {
        let rows = sqlx::query(
            r#"
            SELECT con.contype::text AS kind,
                   con.conname AS name,
                   c.relname AS table_name,
                   ARRAY(
                       SELECT att.attname::text
                       FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute att
                         ON att.attrelid = con.conrelid AND att.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS columns,
                   fc.relname AS foreign_table,
                   ARRAY(
                       SELECT att.attname::text
                       FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute att
                         ON att.attrelid = con.confrelid AND att.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS foreign_columns
            FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            LEFT JOIN pg_class fc ON fc.oid = con.confrelid
            WHERE n.nspname = $1
              AND con.contype IN ('p', 'u', 'f')
            ORDER BY c.relname, con.conname
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        for row in rows {
            let kind: String = row.try_get("kind").map_err(backend)?;
            let name: String = row.try_get("name").map_err(backend)?;
            let table: String = row.try_get("table_name").map_err(backend)?;
            let columns: Vec<String> = row.try_get("columns").map_err(backend)?;
            let foreign_table: Option<String> = row.try_get("foreign_table").map_err(backend)?;
            let foreign_columns: Vec<String> = row.try_get("foreign_columns").map_err(backend)?;

            let Some(descriptor) = tables.get_mut(&table) else {
                continue;
            };
            match kind.as_str() {
                "p" => descriptor.primary_key = columns,
                "u" => descriptor.unique_constraints.push(UniqueConstraint {
                    name,
                    columns,
                    predicate: None,
                }),
                "f" => {
                    let Some(foreign_table) = foreign_table else {
                        continue;
                    };
                    // Composite foreign keys are recorded column by column.
                    for (column, target) in columns.into_iter().zip(foreign_columns) {
                        descriptor.foreign_keys.push(ForeignKey {
                            column,
                            references_table: foreign_table.clone(),
                            references_column: target,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn load_unique_indexes(
        &self,
        tables: &mut BTreeMap<String, TableDescriptor>,
    ) -> StorageResult<()> {
        let rows = sqlx::query(
            r#"
            SELECT i.relname AS name,
                   c.relname AS table_name,
                   ARRAY(
                       SELECT att.attname::text
                       FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                       JOIN pg_attribute att
                         ON att.attrelid = ix.indrelid AND att.attnum = k.attnum
                       ORDER BY k.ord
                   ) AS columns
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_class c ON c.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1
              AND ix.indisunique
              AND NOT ix.indisprimary
              AND NOT EXISTS (
                  SELECT 1 FROM pg_constraint con WHERE con.conindid = ix.indexrelid
              )
            ORDER BY c.relname, i.relname
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        for row in rows {
            let name: String = row.try_get("name").map_err(backend)?;
            let table: String = row.try_get("table_name").map_err(backend)?;
            let columns: Vec<String> = row.try_get("columns").map_err(backend)?;
            if columns.is_empty() {
                continue;
            }
            if let Some(descriptor) = tables.get_mut(&table) {
                descriptor.unique_constraints.push(UniqueConstraint {
                    name,
                    columns,
                    predicate: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn catalog(&self) -> StorageResult<SchemaCatalog> {
        let mut tables = self.load_tables().await?;
        self.load_constraints(&mut tables).await?;
        self.load_unique_indexes(&mut tables).await?;
        debug!(schema = %self.schema, tables = tables.len(), "catalog introspected");
        Ok(tables.into_values().collect())
    }

    async fn begin(&self) -> StorageResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PostgresTransaction {
            inner: Some(tx),
            partition: self.partition.clone(),
        }))
    }
}

/// Transaction on a pooled PostgreSQL connection.
pub struct PostgresTransaction {
    inner: Option<sqlx::Transaction<'static, Postgres>>,
    partition: String,
}

impl PostgresTransaction {
    fn open(&mut self) -> StorageResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.inner.as_mut().ok_or_else(|| {
            StorageError::InvariantViolation("transaction already finished".to_string())
        })
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    fn partition(&self) -> &str {
        &self.partition
    }

    async fn select(&mut self, table: &str, filter: &Filter) -> StorageResult<Vec<Row>> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT * FROM {}{}",
            quote_ident(table),
            where_clause(filter, &mut params, 0)
        );
        let tx = self.open()?;
        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert(&mut self, table: &str, row: Row) -> StorageResult<Row> {
        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        for (column, value) in row.columns() {
            columns.push(quote_ident(column));
            if value.is_null() {
                placeholders.push("NULL".to_string());
            } else {
                params.push(value.clone());
                placeholders.push(format!("${}", params.len()));
            }
        }
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES RETURNING *", quote_ident(table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                quote_ident(table),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        let tx = self.open()?;
        let stored = bind_all(sqlx::query(&sql), &params)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        decode_row(&stored)
    }

    async fn update(&mut self, table: &str, filter: &Filter, changes: &Row) -> StorageResult<u64> {
        if changes.is_empty() {
            return Ok(self.select(table, filter).await?.len() as u64);
        }
        let mut params = Vec::new();
        let assignments: Vec<String> = changes
            .columns()
            .map(|(column, value)| {
                if value.is_null() {
                    format!("{} = NULL", quote_ident(column))
                } else {
                    params.push(value.clone());
                    format!("{} = ${}", quote_ident(column), params.len())
                }
            })
            .collect();
        let offset = params.len();
        let sql = format!(
            "UPDATE {} SET {}{}",
            quote_ident(table),
            assignments.join(", "),
            where_clause(filter, &mut params, offset)
        );
        let tx = self.open()?;
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn delete(&mut self, table: &str, filter: &Filter) -> StorageResult<u64> {
        let mut params = Vec::new();
        let sql = format!(
            "DELETE FROM {}{}",
            quote_ident(table),
            where_clause(filter, &mut params, 0)
        );
        let tx = self.open()?;
        let result = bind_all(sqlx::query(&sql), &params)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.inner.take().ok_or_else(|| {
            StorageError::InvariantViolation("transaction already finished".to_string())
        })?;
        tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.inner.take().ok_or_else(|| {
            StorageError::InvariantViolation("transaction already finished".to_string())
        })?;
        tx.rollback().await.map_err(map_sqlx)
    }
}

fn column_type_of(sql_type: &str) -> ColumnType {
    match sql_type {
        "bigint" | "integer" | "smallint" => ColumnType::Int,
        "boolean" => ColumnType::Bool,
        t if t.starts_with("timestamp") => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render `filter` as a WHERE clause, appending bound values to `params`.
/// Placeholders are numbered after the `offset` values already bound.
fn where_clause(filter: &Filter, params: &mut Vec<Value>, offset: usize) -> String {
    debug_assert_eq!(params.len(), offset);
    if filter.is_empty() {
        return String::new();
    }
    let mut push = |value: &Value| {
        params.push(value.clone());
        format!("${}", params.len())
    };
    let terms: Vec<String> = filter
        .clauses()
        .iter()
        .map(|clause| {
            let column = quote_ident(&clause.column);
            match &clause.predicate {
                Predicate::IsNull => format!("{column} IS NULL"),
                Predicate::NotNull => format!("{column} IS NOT NULL"),
                Predicate::Eq(value) | Predicate::Ne(value) if value.is_null() => {
                    "FALSE".to_string()
                }
                Predicate::Eq(value) => format!("{column} = {}", push(value)),
                Predicate::Ne(value) => format!("{column} <> {}", push(value)),
                Predicate::In(values) => {
                    let options: Vec<String> = values
                        .iter()
                        .filter(|value| !value.is_null())
                        .map(&mut push)
                        .collect();
                    if options.is_empty() {
                        "FALSE".to_string()
                    } else {
                        format!("{column} IN ({})", options.join(", "))
                    }
                }
            }
        })
        .collect();
    format!(" WHERE {}", terms.join(" AND "))
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for value in params {
        query = match value {
            // Nulls are rendered inline and never bound.
            Value::Null => query,
            Value::Int(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Bool(v) => query.bind(*v),
            Value::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

/// How a result column is read back, keyed by the server's type name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Decoder {
    Int8,
    Int4,
    Int2,
    Bool,
    Timestamptz,
    Timestamp,
    Uuid,
    Text,
}

impl Decoder {
    fn for_type(type_name: &str) -> Self {
        match type_name {
            "INT8" => Decoder::Int8,
            "INT4" => Decoder::Int4,
            "INT2" => Decoder::Int2,
            "BOOL" => Decoder::Bool,
            "TIMESTAMPTZ" => Decoder::Timestamptz,
            "TIMESTAMP" => Decoder::Timestamp,
            "UUID" => Decoder::Uuid,
            _ => Decoder::Text,
        }
    }

    /// The catalog type the decoded value belongs to.
    fn column_type(self) -> ColumnType {
        match self {
            Decoder::Int8 | Decoder::Int4 | Decoder::Int2 => ColumnType::Int,
            Decoder::Bool => ColumnType::Bool,
            Decoder::Timestamptz | Decoder::Timestamp => ColumnType::Timestamp,
            Decoder::Uuid | Decoder::Text => ColumnType::Text,
        }
    }
}

fn decode_row(row: &PgRow) -> StorageResult<Row> {
    let mut decoded = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let value = match Decoder::for_type(column.type_info().name()) {
            Decoder::Int8 => row.try_get::<Option<i64>, _>(index).map(Value::from),
            Decoder::Int4 => row
                .try_get::<Option<i32>, _>(index)
                .map(|v| Value::from(v.map(i64::from))),
            Decoder::Int2 => row
                .try_get::<Option<i16>, _>(index)
                .map(|v| Value::from(v.map(i64::from))),
            Decoder::Bool => row.try_get::<Option<bool>, _>(index).map(Value::from),
            Decoder::Timestamptz => row
                .try_get::<Option<DateTime<Utc>>, _>(index)
                .map(Value::from),
            // Naive timestamps are stored as UTC.
            Decoder::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(index)
                .map(|v| Value::from(v.map(|at| at.and_utc()))),
            Decoder::Uuid => row
                .try_get::<Option<Uuid>, _>(index)
                .map(|v| Value::from(v.map(|id| id.to_string()))),
            Decoder::Text => row.try_get::<Option<String>, _>(index).map(Value::from),
        }
        .map_err(|e| StorageError::Serialization(format!("column {}: {e}", column.name())))?;
        decoded.set(column.name(), value);
    }
    Ok(decoded)
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::UniqueViolation {
            table: db.table().unwrap_or_default().to_string(),
            constraint: db.constraint().unwrap_or_default().to_string(),
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StorageError::ReferenceViolation {
                table: db.table().unwrap_or_default().to_string(),
                detail: db.message().to_string(),
            }
        }
        _ => StorageError::Backend(err.to_string()),
    }
}
