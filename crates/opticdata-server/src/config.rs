/// Re-export `Config` from `opticdata-core` for use within this crate.
///
/// All environment-variable parsing lives in `opticdata-core` so it can be
/// shared with integration tests and future crates without depending on the
/// full server.
pub use opticdata_core::config::Config;
