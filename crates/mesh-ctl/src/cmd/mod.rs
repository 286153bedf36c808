//! CLI command modules.

pub mod http;
pub mod status;
pub mod wifi;
