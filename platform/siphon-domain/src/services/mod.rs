pub mod rollup;
pub mod staging;
