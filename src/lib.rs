//! Embedding similarity and reconciliation engine.
//!
//! Turns stored face, image and era-centroid embeddings into classifications:
//! face reconciliation against an externally owned marker/subject graph,
//! outlier detection, duplicate grouping, album suggestions and era estimates.
//! The engine only reads; applying its recommendations is left to the caller.

pub mod albums;
pub mod config;
pub mod db;
pub mod duplicates;
pub mod era;
pub mod error;
pub mod export;
pub mod faces;
pub mod logging;
pub mod similarity;
pub mod sync;
pub mod tasks;

pub use error::{EngineError, Result};
