//! Content-addressed ingest pipeline for user-submitted video.
//!
//! Submitted files are probed, given a content-derived identity, committed
//! into an immutable `videos/<hash>/` layout and transcoded to a
//! browser-friendly rendition when the original is not directly playable.
//! Failures of any stage land the file under `rejected/` and surface as a
//! result message; nothing is ever silently dropped.

pub mod config;
pub mod database;
pub mod error;
pub mod pipeline;

pub use config::IngestConfig;
pub use error::{Error, Result};
