use chrono::DateTime;
use serde_json::Value;
use siphon_domain::value_objects::table_ref::validate_identifier;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Float,
    Timestamp,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Text => "TEXT",
        }
    }

    /// Maps an information_schema `data_type` back onto the detected set.
    /// Unknown catalog types degrade to TEXT.
    pub fn from_catalog(data_type: &str) -> Self {
        match data_type {
            "boolean" => ColumnType::Boolean,
            "double precision" | "real" | "numeric" | "integer" | "bigint" | "smallint" => {
                ColumnType::Float
            }
            "timestamp with time zone" | "timestamp without time zone" => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.column_type)
    }
}

pub fn parse_ndjson(body: &str) -> Result<Vec<serde_json::Map<String, Value>>, String> {
    let mut rows = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|err| format!("malformed JSON at line {}: {}", idx + 1, err))?;
        match value {
            Value::Object(map) => rows.push(map),
            _ => return Err(format!("line {} is not a JSON object", idx + 1)),
        }
    }
    Ok(rows)
}

/// Type of a single JSON value; `None` for null (carries no type). A string
/// that parses as RFC 3339 is a timestamp, any other string is text. Nested
/// arrays and objects load as serialized text.
pub fn detect_value_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Number(_) => Some(ColumnType::Float),
        Value::String(text) => {
            if DateTime::parse_from_rfc3339(text).is_ok() {
                Some(ColumnType::Timestamp)
            } else {
                Some(ColumnType::Text)
            }
        }
        Value::Array(_) | Value::Object(_) => Some(ColumnType::Text),
    }
}

fn merge_types(column: &str, a: ColumnType, b: ColumnType) -> Result<ColumnType, String> {
    if a == b {
        return Ok(a);
    }
    match (a, b) {
        (ColumnType::Timestamp, ColumnType::Text) | (ColumnType::Text, ColumnType::Timestamp) => {
            Ok(ColumnType::Text)
        }
        _ => Err(format!(
            "conflicting types for column '{}': {} vs {}",
            column,
            a.sql(),
            b.sql()
        )),
    }
}

/// Can a value detected as `incoming` land in an existing `existing` column?
/// Identical types always; TEXT absorbs anything (values are rendered).
pub fn compatible(existing: ColumnType, incoming: ColumnType) -> bool {
    existing == incoming || existing == ColumnType::Text
}

/// Schema detected across every row: columns in first-seen order, per-column
/// types merged over all values. A column that is null in every row defaults
/// to TEXT. Field names must be valid column identifiers.
pub fn detect_schema(rows: &[serde_json::Map<String, Value>]) -> Result<TableSchema, String> {
    let mut order: Vec<String> = Vec::new();
    let mut types: BTreeMap<String, Option<ColumnType>> = BTreeMap::new();

    for row in rows {
        for (name, value) in row {
            match types.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    validate_identifier(name)
                        .map_err(|err| format!("unloadable field name: {err}"))?;
                    order.push(name.clone());
                    slot.insert(detect_value_type(value));
                }
                Entry::Occupied(mut slot) => {
                    if let Some(detected) = detect_value_type(value) {
                        let merged = match *slot.get() {
                            Some(current) => merge_types(name, current, detected)?,
                            None => detected,
                        };
                        slot.insert(Some(merged));
                    }
                }
            }
        }
    }

    let columns = order
        .into_iter()
        .map(|name| {
            let column_type = types
                .get(&name)
                .copied()
                .flatten()
                .unwrap_or(ColumnType::Text);
            Column { name, column_type }
        })
        .collect();
    Ok(TableSchema { columns })
}
