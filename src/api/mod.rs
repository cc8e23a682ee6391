pub mod scan_api;
pub mod simple;
