// src/fetch/http.rs

//! Lightweight HTTP tier: a plain GET with browser-like headers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;
use crate::fetch::{FetchStrategy, RawPage};
use crate::models::{HttpConfig, StrategyKind};
use crate::utils::http::{browser_headers, create_async_client};

/// Cheapest tier; never executes scripts.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = create_async_client(
            &config.user_agent,
            Duration::from_secs(config.timeout_secs),
            browser_headers(&config.accept_language)?,
            config.proxy.as_deref(),
        )?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchStrategy for HttpFetcher {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Http
    }

    async fn fetch(&self, url: &str, timeout: Duration, _render_scripts: bool) -> Result<RawPage> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response.text().await?;
        log::debug!("GET {} -> {} ({} bytes)", url, status, html.len());
        Ok(RawPage {
            html,
            status,
            final_url,
            rendered: false,
        })
    }
}
