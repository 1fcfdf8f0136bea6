pub mod schema;

use self::schema::{Column, ColumnType, TableSchema};
use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use siphon_domain::repositories::object_store::ObjectStore;
use siphon_domain::repositories::warehouse::{
    LoadJob, LoadReport, TransformJob, TransformReport, Warehouse, WriteDisposition,
};
use siphon_domain::value_objects::table_ref::{validate_identifier, TableRef};
use std::sync::Arc;
use std::time::Instant;

pub struct PostgresWarehouse {
    pool: Pool<PostgresConnectionManager<NoTls>>,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for PostgresWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWarehouse").finish_non_exhaustive()
    }
}

impl PostgresWarehouse {
    pub fn new(
        db_url: &str,
        pool_max_size: u32,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, String> {
        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| format!("invalid postgres db url: {err}"))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_max_size)
            .build(manager)
            .map_err(|err| format!("failed to build postgres pool: {err}"))?;

        Ok(Self { pool, store })
    }

    pub fn apply_migrations(&self, sql: &str) -> Result<(), String> {
        let span = tracing::info_span!("infra.postgres.migrate");
        let _enter = span.enter();

        let mut client = self
            .pool
            .get()
            .map_err(|err| format!("failed to checkout postgres connection: {err}"))?;
        client
            .batch_execute(sql)
            .map_err(|err| format!("failed to apply migrations: {err}"))?;
        tracing::info!("migrations applied");
        Ok(())
    }
}

impl Warehouse for PostgresWarehouse {
    fn run_load(&self, job: &LoadJob) -> Result<LoadReport, String> {
        run_load(&self.pool, self.store.as_ref(), job)
    }

    fn run_transform(&self, job: &TransformJob) -> Result<TransformReport, String> {
        run_transform(&self.pool, job)
    }
}

/// Loads a staged NDJSON blob into the destination table. The blob is fetched
/// and type-checked before any connection is taken, so bad input never costs a
/// pool checkout. Missing tables are created when the job autodetects; unknown
/// fields become new columns when the job allows field addition; the whole
/// batch lands in one transaction.
pub fn run_load(
    pool: &Pool<PostgresConnectionManager<NoTls>>,
    store: &dyn ObjectStore,
    job: &LoadJob,
) -> Result<LoadReport, String> {
    let overall_start = Instant::now();
    let span = tracing::info_span!(
        "infra.postgres.load",
        destination = %job.destination,
        source = %job.source
    );
    let _enter = span.enter();

    let body = store
        .get(&job.source)
        .map_err(|err| load_failure("read_blob", err))?;
    let text = String::from_utf8(body).map_err(|err| {
        load_failure(
            "decode",
            format!("staged blob {} is not utf-8: {}", job.source, err),
        )
    })?;
    let rows = schema::parse_ndjson(&text).map_err(|err| load_failure("parse", err))?;
    if rows.is_empty() {
        return Err(load_failure(
            "parse",
            format!("staged blob {} contains no records", job.source),
        ));
    }
    let detected = schema::detect_schema(&rows).map_err(|err| load_failure("detect", err))?;
    if detected.columns.is_empty() {
        return Err(load_failure(
            "detect",
            format!("staged blob {} has no loadable fields", job.source),
        ));
    }

    let get_start = Instant::now();
    let mut client = pool.get().map_err(|err| {
        metrics::counter!("siphon.infra.postgres.pool.get.errors_total", "stage" => "get")
            .increment(1);
        load_failure(
            "pool_get",
            format!("failed to checkout postgres connection: {err}"),
        )
    })?;
    metrics::histogram!("siphon.infra.postgres.pool.get_ms")
        .record(get_start.elapsed().as_secs_f64() * 1000.0);

    let mut txn = client
        .transaction()
        .map_err(|err| load_failure("begin", format!("failed to start transaction: {err}")))?;

    let existing = read_table_schema(&mut txn, &job.destination)
        .map_err(|err| load_failure("schema_read", err))?;
    let mut columns_added: Vec<String> = Vec::new();
    let table_schema = match existing {
        None => {
            if !job.autodetect {
                return Err(load_failure(
                    "create_table",
                    format!(
                        "destination table {} does not exist and autodetect is disabled",
                        job.destination
                    ),
                ));
            }
            create_table(&mut txn, &job.destination, &detected)
                .map_err(|err| load_failure("create_table", err))?;
            tracing::info!(
                destination = %job.destination,
                columns = detected.columns.len(),
                "created destination table from detected schema"
            );
            detected.clone()
        }
        Some(mut current) => {
            for column in &detected.columns {
                match current.column_type(&column.name) {
                    Some(have) => {
                        if !schema::compatible(have, column.column_type) {
                            return Err(load_failure(
                                "schema_check",
                                format!(
                                    "schema conflict on column '{}' of {}: table has {}, blob has {}",
                                    column.name,
                                    job.destination,
                                    have.sql(),
                                    column.column_type.sql()
                                ),
                            ));
                        }
                    }
                    None => {
                        if !job.allows_field_addition() {
                            return Err(load_failure(
                                "schema_check",
                                format!(
                                    "column '{}' is not in {} and field addition is disabled",
                                    column.name, job.destination
                                ),
                            ));
                        }
                        add_column(&mut txn, &job.destination, column)
                            .map_err(|err| load_failure("alter_table", err))?;
                        tracing::info!(
                            destination = %job.destination,
                            column = %column.name,
                            column_type = column.column_type.sql(),
                            "added column to destination table"
                        );
                        current.columns.push(column.clone());
                        columns_added.push(column.name.clone());
                    }
                }
            }
            current
        }
    };

    if job.write_disposition == WriteDisposition::Truncate {
        txn.batch_execute(&format!("TRUNCATE TABLE {}", relation(&job.destination)))
            .map_err(|err| {
                load_failure(
                    "truncate",
                    format!("failed to truncate {}: {}", job.destination, err),
                )
            })?;
    }

    // Insert the detected fields only, typed as the table has them.
    let mut insert_columns: Vec<Column> = Vec::with_capacity(detected.columns.len());
    for column in &detected.columns {
        let column_type = table_schema
            .column_type(&column.name)
            .unwrap_or(column.column_type);
        insert_columns.push(Column {
            name: column.name.clone(),
            column_type,
        });
    }

    let sql = insert_sql(&job.destination, &insert_columns);
    let statement = txn
        .prepare(&sql)
        .map_err(|err| load_failure("prepare", format!("failed to prepare insert: {err}")))?;

    let insert_start = Instant::now();
    let mut rows_loaded = 0u64;
    for row in &rows {
        let mut values: Vec<Box<dyn ToSql + Sync>> = Vec::with_capacity(insert_columns.len());
        for column in &insert_columns {
            values.push(
                bind_value(row.get(&column.name), column.column_type, &column.name)
                    .map_err(|err| load_failure("bind", err))?,
            );
        }
        let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|value| value.as_ref()).collect();
        txn.execute(&statement, &params).map_err(|err| {
            load_failure(
                "insert",
                format!("insert into {} failed: {}", job.destination, err),
            )
        })?;
        rows_loaded += 1;
    }
    metrics::histogram!("siphon.infra.postgres.insert_ms")
        .record(insert_start.elapsed().as_secs_f64() * 1000.0);

    txn.commit()
        .map_err(|err| load_failure("commit", format!("failed to commit load: {err}")))?;

    metrics::counter!("siphon.infra.postgres.load.calls_total", "result" => "ok").increment(1);
    metrics::histogram!("siphon.infra.postgres.load_ms")
        .record(overall_start.elapsed().as_secs_f64() * 1000.0);
    metrics::gauge!("siphon.infra.postgres.load.rows_loaded").set(rows_loaded as f64);
    metrics::counter!("siphon.infra.postgres.load.rows_loaded_total").increment(rows_loaded);
    metrics::gauge!("siphon.infra.postgres.load.columns_added").set(columns_added.len() as f64);

    tracing::debug!(
        rows = rows_loaded,
        columns_added = columns_added.len(),
        "loaded staged blob"
    );
    Ok(LoadReport {
        rows_loaded,
        columns_added,
    })
}

/// Rebuilds the destination from scratch inside one transaction: drop, create
/// as a deduplicated projection of the source, index on the partition column.
/// Readers only ever see the previous table or the finished one.
pub fn run_transform(
    pool: &Pool<PostgresConnectionManager<NoTls>>,
    job: &TransformJob,
) -> Result<TransformReport, String> {
    let overall_start = Instant::now();
    let span = tracing::info_span!(
        "infra.postgres.transform",
        destination = %job.destination,
        source = %job.source
    );
    let _enter = span.enter();

    validate_identifier(&job.partition_column)
        .map_err(|err| transform_failure("validate", format!("invalid partition column: {err}")))?;

    let get_start = Instant::now();
    let mut client = pool.get().map_err(|err| {
        metrics::counter!("siphon.infra.postgres.pool.get.errors_total", "stage" => "get")
            .increment(1);
        transform_failure(
            "pool_get",
            format!("failed to checkout postgres connection: {err}"),
        )
    })?;
    metrics::histogram!("siphon.infra.postgres.pool.get_ms")
        .record(get_start.elapsed().as_secs_f64() * 1000.0);

    let mut txn = client
        .transaction()
        .map_err(|err| transform_failure("begin", format!("failed to start transaction: {err}")))?;

    let scanned = txn
        .query_one(
            &format!("SELECT COUNT(*) FROM {}", relation(&job.source)),
            &[],
        )
        .map_err(|err| {
            transform_failure("scan", format!("failed to scan {}: {}", job.source, err))
        })?;
    let rows_scanned: i64 = scanned.get(0);

    txn.batch_execute(&format!(
        "DROP TABLE IF EXISTS {}",
        relation(&job.destination)
    ))
    .map_err(|err| {
        transform_failure(
            "drop",
            format!("failed to drop {}: {}", job.destination, err),
        )
    })?;

    txn.batch_execute(&transform_sql(job)).map_err(|err| {
        transform_failure(
            "create",
            format!("failed to rebuild {}: {}", job.destination, err),
        )
    })?;

    let index_sql = format!(
        "CREATE INDEX {}_{}_idx ON {} ({})",
        job.destination.table,
        job.partition_column,
        relation(&job.destination),
        job.partition_column
    );
    txn.batch_execute(&index_sql).map_err(|err| {
        transform_failure(
            "index",
            format!("failed to index {}: {}", job.destination, err),
        )
    })?;

    let written = txn
        .query_one(
            &format!("SELECT COUNT(*) FROM {}", relation(&job.destination)),
            &[],
        )
        .map_err(|err| {
            transform_failure(
                "count",
                format!("failed to count {}: {}", job.destination, err),
            )
        })?;
    let rows_written: i64 = written.get(0);

    txn.commit()
        .map_err(|err| transform_failure("commit", format!("failed to commit transform: {err}")))?;

    metrics::counter!("siphon.infra.postgres.transform.calls_total", "result" => "ok").increment(1);
    metrics::histogram!("siphon.infra.postgres.transform_ms")
        .record(overall_start.elapsed().as_secs_f64() * 1000.0);
    metrics::gauge!("siphon.infra.postgres.transform.rows_scanned").set(rows_scanned as f64);
    metrics::gauge!("siphon.infra.postgres.transform.rows_written").set(rows_written as f64);
    metrics::counter!("siphon.infra.postgres.transform.rows_written_total")
        .increment(rows_written as u64);

    tracing::debug!(rows_scanned, rows_written, "rebuilt clean table");
    Ok(TransformReport {
        rows_scanned: rows_scanned as u64,
        rows_written: rows_written as u64,
    })
}

fn load_failure(stage: &'static str, message: String) -> String {
    metrics::counter!("siphon.infra.postgres.load.calls_total", "result" => "err").increment(1);
    metrics::counter!("siphon.infra.postgres.load.errors_total", "stage" => stage).increment(1);
    tracing::error!(error = %message, stage, "load failed");
    message
}

fn transform_failure(stage: &'static str, message: String) -> String {
    metrics::counter!("siphon.infra.postgres.transform.calls_total", "result" => "err").increment(1);
    metrics::counter!("siphon.infra.postgres.transform.errors_total", "stage" => stage).increment(1);
    tracing::error!(error = %message, stage, "transform failed");
    message
}

/// Physical relation name. The project id stays metadata; the database the
/// pool is connected to plays that role here.
fn relation(table: &TableRef) -> String {
    format!("{}.{}", table.dataset, table.table)
}

fn read_table_schema(
    txn: &mut postgres::Transaction<'_>,
    table: &TableRef,
) -> Result<Option<TableSchema>, String> {
    let rows = txn
        .query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[&table.dataset, &table.table],
        )
        .map_err(|err| format!("failed to read schema of {}: {}", table, err))?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut current = TableSchema::default();
    for row in rows {
        let name: String = row.get(0);
        let data_type: String = row.get(1);
        current.columns.push(Column {
            name,
            column_type: ColumnType::from_catalog(&data_type),
        });
    }
    Ok(Some(current))
}

fn create_table(
    txn: &mut postgres::Transaction<'_>,
    table: &TableRef,
    table_schema: &TableSchema,
) -> Result<(), String> {
    let columns: Vec<String> = table_schema
        .columns
        .iter()
        .map(|column| format!("{} {}", column.name, column.column_type.sql()))
        .collect();
    let sql = format!(
        "CREATE TABLE {} ({})",
        relation(table),
        columns.join(", ")
    );
    txn.batch_execute(&sql)
        .map_err(|err| format!("failed to create {}: {}", table, err))
}

fn add_column(
    txn: &mut postgres::Transaction<'_>,
    table: &TableRef,
    column: &Column,
) -> Result<(), String> {
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        relation(table),
        column.name,
        column.column_type.sql()
    );
    txn.batch_execute(&sql)
        .map_err(|err| format!("failed to add column '{}' to {}: {}", column.name, table, err))
}

fn insert_sql(table: &TableRef, columns: &[Column]) -> String {
    let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        relation(table),
        names.join(", "),
        placeholders.join(", ")
    )
}

fn transform_sql(job: &TransformJob) -> String {
    let source_label = job.source_label.replace('\'', "''");
    format!(
        "CREATE TABLE {destination} AS \
         SELECT DISTINCT \
         symbol, \
         price, \
         event_ts AS price_ts, \
         (event_ts AT TIME ZONE 'UTC')::date AS {partition}, \
         EXTRACT(HOUR FROM event_ts AT TIME ZONE 'UTC')::int AS price_hour, \
         '{source_label}' AS source \
         FROM {source} \
         WHERE event_ts IS NOT NULL",
        destination = relation(&job.destination),
        partition = job.partition_column,
        source = relation(&job.source),
    )
}

fn bind_value(
    value: Option<&serde_json::Value>,
    column_type: ColumnType,
    column: &str,
) -> Result<Box<dyn ToSql + Sync>, String> {
    let value = match value {
        None | Some(serde_json::Value::Null) => {
            let null: Box<dyn ToSql + Sync> = match column_type {
                ColumnType::Boolean => Box::new(None::<bool>),
                ColumnType::Float => Box::new(None::<f64>),
                ColumnType::Timestamp => Box::new(None::<DateTime<Utc>>),
                ColumnType::Text => Box::new(None::<String>),
            };
            return Ok(null);
        }
        Some(value) => value,
    };
    let bound: Box<dyn ToSql + Sync> = match column_type {
        ColumnType::Boolean => {
            let flag = value
                .as_bool()
                .ok_or_else(|| format!("column '{column}': expected boolean, got {value}"))?;
            Box::new(flag)
        }
        ColumnType::Float => {
            let number = value
                .as_f64()
                .ok_or_else(|| format!("column '{column}': expected number, got {value}"))?;
            Box::new(number)
        }
        ColumnType::Timestamp => {
            let text = value.as_str().ok_or_else(|| {
                format!("column '{column}': expected timestamp string, got {value}")
            })?;
            let ts = DateTime::parse_from_rfc3339(text).map_err(|err| {
                format!("column '{column}': invalid timestamp '{text}': {err}")
            })?;
            Box::new(ts.with_timezone(&Utc))
        }
        ColumnType::Text => Box::new(render_text(value)),
    };
    Ok(bound)
}

fn render_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
