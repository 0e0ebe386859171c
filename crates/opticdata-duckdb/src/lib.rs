pub mod attribution;
pub mod backend;
pub mod classify;
pub mod identity;
pub mod reporting;
pub mod schema;
pub mod site;
pub mod summary;
pub mod verification;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `opticdata_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
