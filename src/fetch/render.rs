// src/fetch/render.rs

//! Scripted tier: a headless-browser rendering service.
//!
//! The service takes `{url, gotoOptions: {waitUntil, timeout}}` and answers
//! with the rendered HTML. The upstream status and final URL come back in the
//! `X-Response-Code` and `X-Response-URL` headers when the service sets them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::fetch::{FetchStrategy, RawPage};
use crate::models::{RenderConfig, StrategyKind};
use crate::utils::http::{create_async_client, snippet};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions<'a> {
    wait_until: &'a str,
    timeout: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest<'a> {
    url: &'a str,
    goto_options: GotoOptions<'a>,
}

/// Renders pages through an external browser service.
pub struct RenderFetcher {
    client: Client,
    endpoint: String,
    token: Option<String>,
    wait_until: String,
}

impl RenderFetcher {
    /// Build the fetcher, or `None` when no endpoint is configured.
    pub fn from_config(config: &RenderConfig, user_agent: &str) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };
        let token = match &config.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Some(token),
                _ => {
                    log::warn!("{} is not set, calling the render service without a token", var);
                    None
                }
            },
            None => None,
        };
        let client = create_async_client(
            user_agent,
            Duration::from_secs(config.timeout_secs),
            HeaderMap::new(),
            None,
        )?;
        Ok(Some(Self {
            client,
            endpoint,
            token,
            wait_until: config.wait_until.clone(),
        }))
    }

    fn build_request(&self, url: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let body = RenderRequest {
            url,
            goto_options: GotoOptions {
                wait_until: &self.wait_until,
                timeout: timeout.as_millis() as u64,
            },
        };
        let request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl FetchStrategy for RenderFetcher {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Render
    }

    fn renders_scripts(&self) -> bool {
        true
    }

    async fn fetch(&self, url: &str, timeout: Duration, _render_scripts: bool) -> Result<RawPage> {
        let response = self.build_request(url, timeout).send().await?;
        let service_status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        if !service_status.is_success() {
            return Err(AppError::fetch(
                url,
                format!(
                    "render service returned {}: {}",
                    service_status.as_u16(),
                    snippet(&body, 120)
                ),
            ));
        }

        let status = header_value(&headers, "x-response-code")
            .and_then(|v| v.parse().ok())
            .unwrap_or(service_status.as_u16());
        let final_url = header_value(&headers, "x-response-url").unwrap_or_else(|| url.to_string());
        log::debug!("Rendered {} -> {} ({} bytes)", url, status, body.len());

        Ok(RawPage {
            html: body,
            status,
            final_url,
            rendered: true,
        })
    }
}
