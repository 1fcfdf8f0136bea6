use crate::value_objects::storage_locator::StorageLocator;

pub trait ObjectStore {
    /// Writes a blob under `key` and returns its full locator. Re-putting the
    /// same key overwrites (a retried upload lands on its own key).
    fn put(&self, key: &str, body: &[u8], content_type: &str) -> Result<StorageLocator, String>;

    fn get(&self, locator: &StorageLocator) -> Result<Vec<u8>, String>;
}
