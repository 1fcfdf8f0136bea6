use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocator {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl StorageLocator {
    pub fn new(scheme: &str, bucket: &str, key: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn uri(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, self.key)
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let trimmed = value.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| format!("invalid storage uri (expected scheme://bucket/key): {value}"))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| format!("invalid storage uri (missing key): {value}"))?;
        if scheme.is_empty() || bucket.is_empty() || key.is_empty() {
            return Err(format!("invalid storage uri: {value}"));
        }
        Ok(Self::new(scheme, bucket, key))
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}
