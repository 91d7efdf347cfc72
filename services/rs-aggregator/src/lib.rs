//!
//! src/lib.rs  Andrew Belles  Oct 5th, 2025
//!
//! Station aggregation service: fans last.fm lookups out over a batch of
//! stations, caches the merged responses and serves them over http
//!

pub mod aggregate;
pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod logging;
pub mod persistent;
pub mod policy;
pub mod types;

#[cfg(test)]
mod testing;
