// src/lib.rs

//! tierfetch: tiered web fetching under rate and budget limits.
//!
//! - [`pipeline::Orchestrator`] resolves URLs through escalating fetch tiers
//! - [`classify::Classifier`] decides whether a fetched page is usable
//! - [`dedup::Deduplicator`] removes near-duplicate paragraphs
//! - [`ratelimit`] shapes request and token rates across workers
//! - [`dispatch::Dispatcher`] meters tool calls against a session budget

pub mod classify;
pub mod clean;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod ratelimit;
pub mod storage;
pub mod utils;

pub use error::{AppError, Result};
