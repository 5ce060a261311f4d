//! Pipeline entry points.
//!
//! - [`Orchestrator::crawl`]: resolve URLs through the tiered fetch cascade

pub mod cascade;

pub use cascade::{Orchestrator, Tier};
