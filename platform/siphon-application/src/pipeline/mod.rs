use crate::config::Config;
use crate::runner::{run_task, RetryPolicy};
use chrono::Utc;
use serde::Serialize;
use siphon_domain::repositories::market_api::MarketPriceApi;
use siphon_domain::repositories::object_store::ObjectStore;
use siphon_domain::repositories::warehouse::{
    LoadJob, LoadReport, TransformJob, TransformReport, Warehouse,
};
use siphon_domain::services::staging;
use siphon_domain::value_objects::storage_locator::StorageLocator;
use siphon_domain::value_objects::table_ref::TableRef;
use std::time::Instant;
use tracing::info_span;

#[derive(Debug, Clone, Serialize)]
pub struct FetchOutput {
    pub locator: StorageLocator,
    pub record_count: usize,
    pub event_ts: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub run_id: String,
    pub fetch: FetchOutput,
    pub load: LoadReport,
    pub transform: TransformReport,
    pub elapsed_ms: u64,
}

pub fn raw_table(config: &Config) -> Result<TableRef, String> {
    TableRef::new(
        &config.warehouse.project,
        &config.warehouse.dataset,
        &config.warehouse.raw_table,
    )
}

pub fn clean_table(config: &Config) -> Result<TableRef, String> {
    TableRef::new(
        &config.warehouse.project,
        &config.warehouse.dataset,
        &config.warehouse.clean_table,
    )
}

/// Fetches the current top-N listing, prices every listed asset, and stages
/// the batch as one NDJSON blob. Nothing is uploaded unless every asset
/// priced; a partial batch is treated as a failed attempt.
pub fn fetch_and_stage(
    config: &Config,
    api: &dyn MarketPriceApi,
    store: &dyn ObjectStore,
) -> Result<FetchOutput, String> {
    let _span = info_span!("fetch_and_stage", pipeline = %config.pipeline.name).entered();
    let stage_start = Instant::now();

    let fetched_at = Utc::now();
    let ids = api.top_assets(config.api.top_n)?;
    let prices = api.usd_prices(&ids)?;
    let records = staging::build_price_records(&ids, &prices, fetched_at)?;
    let body = staging::to_ndjson(&records)?;
    let key = staging::staging_key(&config.storage.prefix, fetched_at);
    let locator = store.put(&key, body.as_bytes(), "application/json")?;

    metrics::histogram!("siphon.pipeline.fetch_ms")
        .record(stage_start.elapsed().as_millis() as f64);
    metrics::gauge!("siphon.pipeline.staged_records").set(records.len() as f64);
    tracing::info!(records = records.len(), locator = %locator, "staged price batch");
    Ok(FetchOutput {
        locator,
        record_count: records.len(),
        event_ts: staging::event_timestamp(fetched_at),
    })
}

pub fn load_raw(
    config: &Config,
    warehouse: &dyn Warehouse,
    locator: &StorageLocator,
) -> Result<LoadReport, String> {
    let _span = info_span!("load_raw", pipeline = %config.pipeline.name).entered();
    let stage_start = Instant::now();

    let job = LoadJob::append_ndjson(raw_table(config)?, locator.clone());
    let report = warehouse.run_load(&job)?;

    metrics::histogram!("siphon.pipeline.load_ms")
        .record(stage_start.elapsed().as_millis() as f64);
    metrics::gauge!("siphon.pipeline.loaded_rows").set(report.rows_loaded as f64);
    if !report.columns_added.is_empty() {
        tracing::info!(columns = ?report.columns_added, "raw table schema widened");
    }
    tracing::info!(rows = report.rows_loaded, destination = %job.destination, "loaded staged blob");
    Ok(report)
}

pub fn transform_clean(config: &Config, warehouse: &dyn Warehouse) -> Result<TransformReport, String> {
    let _span = info_span!("transform_clean", pipeline = %config.pipeline.name).entered();
    let stage_start = Instant::now();

    let job = TransformJob::hourly_rollup(
        clean_table(config)?,
        raw_table(config)?,
        &config.warehouse.source_label,
    );
    let report = warehouse.run_transform(&job)?;

    metrics::histogram!("siphon.pipeline.transform_ms")
        .record(stage_start.elapsed().as_millis() as f64);
    metrics::gauge!("siphon.pipeline.clean_rows").set(report.rows_written as f64);
    tracing::info!(
        rows_scanned = report.rows_scanned,
        rows_written = report.rows_written,
        destination = %job.destination,
        "rebuilt clean table"
    );
    Ok(report)
}

/// One full pipeline run: the three stages in order, each with its own retry
/// budget. A stage that exhausts its budget fails the run; later stages do
/// not execute.
pub fn run_once(
    config: &Config,
    policy: &RetryPolicy,
    api: &dyn MarketPriceApi,
    store: &dyn ObjectStore,
    warehouse: &dyn Warehouse,
) -> Result<RunSummary, String> {
    let started = Utc::now();
    let run_id = format!("{}_{}", config.pipeline.name, started.format("%Y%m%d%H%M%S"));
    let _span = info_span!("pipeline_run", run_id = %run_id).entered();
    let run_start = Instant::now();

    let fetch = run_task("fetch_prices", policy, || fetch_and_stage(config, api, store))?;
    let load = run_task("load_raw", policy, || {
        load_raw(config, warehouse, &fetch.locator)
    })?;
    let transform = run_task("transform_clean", policy, || {
        transform_clean(config, warehouse)
    })?;

    let summary = RunSummary {
        pipeline: config.pipeline.name.clone(),
        run_id,
        fetch,
        load,
        transform,
        elapsed_ms: run_start.elapsed().as_millis() as u64,
    };
    tracing::info!(elapsed_ms = summary.elapsed_ms, "pipeline run complete");
    Ok(summary)
}
