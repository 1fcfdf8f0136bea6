pub mod market_api;
pub mod object_store;
pub mod warehouse;
