//! Persistence for the advisory failed-URL hint.
//!
//! The hint only tells the cascade which URLs failed without script rendering
//! last time. Losing it costs one cheap attempt per URL, so callers log and
//! ignore storage errors.

pub mod local;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use local::LocalHintStore;

/// Persisted form of the hint set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureHints {
    pub updated_at: Option<DateTime<Utc>>,
    pub urls: BTreeSet<String>,
}

impl FailureHints {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            updated_at: Some(Utc::now()),
            urls: urls.into_iter().collect(),
        }
    }
}

/// Backend holding the hint between crawls.
#[async_trait]
pub trait HintStore: Send + Sync {
    /// Load the last saved hints; empty when nothing was saved yet.
    async fn load(&self) -> Result<FailureHints>;

    /// Replace the saved hints.
    async fn save(&self, hints: &FailureHints) -> Result<()>;
}
