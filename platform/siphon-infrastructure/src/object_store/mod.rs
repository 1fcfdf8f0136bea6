use siphon_domain::repositories::object_store::ObjectStore;
use siphon_domain::value_objects::storage_locator::StorageLocator;
use std::fs;
use std::path::PathBuf;

pub const FILE_SCHEME: &str = "file";

/// Object storage laid out on the local filesystem: `<root>/<bucket>/<key>`,
/// with keys treated as relative paths. Locators use the `file` scheme.
pub struct FilesystemObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Result<Self, String> {
        if bucket.is_empty() || bucket.contains('/') {
            return Err(format!("invalid bucket name: {bucket}"));
        }
        Ok(Self {
            root: root.into(),
            bucket: bucket.to_string(),
        })
    }

    fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf, String> {
        if key.is_empty()
            || key
                .split('/')
                .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(format!("invalid blob key: {key}"));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<StorageLocator, String> {
        let path = self.blob_path(&self.bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create {}: {}", parent.display(), err))?;
        }
        fs::write(&path, body).map_err(|err| {
            metrics::counter!("siphon.infra.object_store.puts_total", "result" => "err")
                .increment(1);
            format!("failed to write blob {}: {}", path.display(), err)
        })?;

        metrics::counter!("siphon.infra.object_store.puts_total", "result" => "ok").increment(1);
        metrics::histogram!("siphon.infra.object_store.put_bytes").record(body.len() as f64);
        tracing::debug!(key, bytes = body.len(), content_type, "blob written");
        Ok(StorageLocator::new(FILE_SCHEME, &self.bucket, key))
    }

    fn get(&self, locator: &StorageLocator) -> Result<Vec<u8>, String> {
        if locator.scheme != FILE_SCHEME {
            return Err(format!(
                "unsupported storage scheme '{}' (expected '{FILE_SCHEME}')",
                locator.scheme
            ));
        }
        let path = self.blob_path(&locator.bucket, &locator.key)?;
        fs::read(&path).map_err(|err| format!("failed to read blob {}: {}", path.display(), err))
    }
}
