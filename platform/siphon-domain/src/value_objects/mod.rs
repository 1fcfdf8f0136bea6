pub mod price_record;
pub mod storage_locator;
pub mod table_ref;
