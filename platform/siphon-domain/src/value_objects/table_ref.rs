use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Result<Self, String> {
        validate_project(project)?;
        validate_identifier(dataset)?;
        validate_identifier(table)?;
        Ok(Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        })
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// SQL-safe identifier: lowercase letter or underscore first, then lowercase
/// alphanumerics and underscores. JSON field names that become columns must
/// also pass this.
pub fn validate_identifier(value: &str) -> Result<(), String> {
    let mut chars = value.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if !valid_first || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(format!("invalid identifier: {value}"));
    }
    Ok(())
}

/// Project ids are metadata (never interpolated into SQL), so hyphens are
/// allowed alongside identifier characters.
pub fn validate_project(value: &str) -> Result<(), String> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(format!("invalid project id: {value}"));
    }
    Ok(())
}
