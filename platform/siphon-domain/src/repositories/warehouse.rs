use crate::value_objects::storage_locator::StorageLocator;
use crate::value_objects::table_ref::TableRef;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    NewlineDelimitedJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Append,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaUpdateOption {
    AllowFieldAddition,
}

#[derive(Debug, Clone)]
pub struct LoadJob {
    pub destination: TableRef,
    pub source: StorageLocator,
    pub source_format: SourceFormat,
    pub write_disposition: WriteDisposition,
    pub autodetect: bool,
    pub schema_update_options: Vec<SchemaUpdateOption>,
}

impl LoadJob {
    /// The load the pipeline submits: append, schema autodetected from the
    /// blob, unknown fields added as new nullable columns.
    pub fn append_ndjson(destination: TableRef, source: StorageLocator) -> Self {
        Self {
            destination,
            source,
            source_format: SourceFormat::NewlineDelimitedJson,
            write_disposition: WriteDisposition::Append,
            autodetect: true,
            schema_update_options: vec![SchemaUpdateOption::AllowFieldAddition],
        }
    }

    pub fn allows_field_addition(&self) -> bool {
        self.schema_update_options
            .contains(&SchemaUpdateOption::AllowFieldAddition)
    }
}

#[derive(Debug, Clone)]
pub struct TransformJob {
    pub destination: TableRef,
    pub source: TableRef,
    pub partition_column: String,
    pub source_label: String,
}

impl TransformJob {
    /// Full rebuild of the deduplicated hourly table, partitioned by the
    /// price date and stamped with the upstream source label.
    pub fn hourly_rollup(destination: TableRef, source: TableRef, source_label: &str) -> Self {
        Self {
            destination,
            source,
            partition_column: "price_date".to_string(),
            source_label: source_label.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub columns_added: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub rows_scanned: u64,
    pub rows_written: u64,
}

pub trait Warehouse {
    fn run_load(&self, job: &LoadJob) -> Result<LoadReport, String>;
    fn run_transform(&self, job: &TransformJob) -> Result<TransformReport, String>;
}
