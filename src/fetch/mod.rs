// src/fetch/mod.rs

//! Fetch strategies: interchangeable ways to turn a URL into HTML.
//!
//! Each tier of the cascade wraps one [`FetchStrategy`]. Strategies return the
//! page whatever its status code; only transport failures are errors.

mod api;
mod http;
mod render;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::StrategyKind;

pub use api::{ApiFetcher, ApiProvider};
pub use http::HttpFetcher;
pub use render::RenderFetcher;

/// What a strategy brought back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub html: String,
    pub status: u16,
    /// URL after redirects, as reported by the strategy
    pub final_url: String,
    /// Scripts were executed before the HTML was captured
    pub rendered: bool,
}

impl RawPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Uniform `fetch(url, timeout, render_scripts)` contract.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Always executes scripts.
    fn renders_scripts(&self) -> bool {
        false
    }

    /// Can execute scripts when asked, usually at extra cost.
    fn renders_on_demand(&self) -> bool {
        false
    }

    async fn fetch(&self, url: &str, timeout: Duration, render_scripts: bool) -> Result<RawPage>;
}
