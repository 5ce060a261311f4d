// src/fetch/api.rs

//! Paid tier: third-party scraping APIs, tried in configured order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;
use serde_json::json;

use crate::error::{AppError, Result};
use crate::fetch::{FetchStrategy, RawPage};
use crate::models::{ApiConfig, ApiProviderConfig, RequestStyle, StrategyKind};
use crate::ratelimit::{Acquired, Clock, CounterStore, FixedWindowLimiter};
use crate::utils::http::{create_async_client, snippet};

/// One configured provider with its key and request-rate bucket.
pub struct ApiProvider {
    config: ApiProviderConfig,
    api_key: String,
    limiter: FixedWindowLimiter,
}

impl ApiProvider {
    pub fn new(config: ApiProviderConfig, api_key: String, limiter: FixedWindowLimiter) -> Self {
        Self {
            config,
            api_key,
            limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether a request with this render flag executes scripts.
    fn renders(&self, render_scripts: bool) -> bool {
        render_scripts
            && self.config.style == RequestStyle::Query
            && self.config.render_param.is_some()
    }

    fn build_request(
        &self,
        client: &Client,
        url: &str,
        timeout: Duration,
        render_scripts: bool,
    ) -> reqwest::RequestBuilder {
        match self.config.style {
            RequestStyle::Query => {
                let mut query = vec![
                    ("api_key", self.api_key.clone()),
                    ("url", url.to_string()),
                ];
                if let Some(param) = &self.config.render_param {
                    query.push((param.as_str(), render_scripts.to_string()));
                }
                client.get(&self.config.endpoint).query(&query).timeout(timeout)
            }
            RequestStyle::Json => {
                let zone = self.config.zone.as_deref().unwrap_or_default();
                client
                    .post(&self.config.endpoint)
                    .bearer_auth(&self.api_key)
                    .json(&json!({ "zone": zone, "url": url, "format": "raw" }))
                    .timeout(timeout)
            }
        }
    }
}

/// Last-resort tier over paid scraping providers.
pub struct ApiFetcher {
    client: Client,
    providers: Vec<ApiProvider>,
}

impl ApiFetcher {
    /// Build from configuration. Providers without a key are skipped; `None`
    /// when no provider is usable.
    pub fn from_config(
        config: &ApiConfig,
        user_agent: &str,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
    ) -> Result<Option<Self>> {
        let mut providers = Vec::new();
        for provider in &config.providers {
            let api_key = match std::env::var(&provider.api_key_env) {
                Ok(key) if !key.trim().is_empty() => key,
                _ => {
                    log::warn!(
                        "Skipping API provider {}: {} is not set",
                        provider.name,
                        provider.api_key_env
                    );
                    continue;
                }
            };
            let limiter = FixedWindowLimiter::new(
                store.clone(),
                clock.clone(),
                format!("{}:rps:{}", key_prefix, provider.name),
                provider.rps_limit,
                Duration::from_millis(provider.window_ms),
            );
            providers.push(ApiProvider::new(provider.clone(), api_key, limiter));
        }

        if providers.is_empty() {
            return Ok(None);
        }
        let client = create_async_client(
            user_agent,
            Duration::from_secs(config.timeout_secs),
            HeaderMap::new(),
            None,
        )?;
        Ok(Some(Self::new(client, providers)))
    }

    pub fn new(client: Client, providers: Vec<ApiProvider>) -> Self {
        Self { client, providers }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(ApiProvider::name).collect()
    }

    /// Send and read the whole body; either step failing fails the provider.
    async fn request_page(
        &self,
        provider: &ApiProvider,
        url: &str,
        timeout: Duration,
        render_scripts: bool,
    ) -> reqwest::Result<RawPage> {
        let response = provider
            .build_request(&self.client, url, timeout, render_scripts)
            .send()
            .await?;
        let status = response.status().as_u16();
        let html = response.text().await?;
        Ok(RawPage {
            html,
            status,
            final_url: url.to_string(),
            rendered: provider.renders(render_scripts),
        })
    }
}

#[async_trait]
impl FetchStrategy for ApiFetcher {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Api
    }

    fn renders_on_demand(&self) -> bool {
        true
    }

    async fn fetch(&self, url: &str, timeout: Duration, render_scripts: bool) -> Result<RawPage> {
        let mut last_page = None;
        let mut last_error = None;

        for provider in &self.providers {
            if let Acquired::Admitted { waited } = provider.limiter.acquire().await {
                if !waited.is_zero() {
                    log::debug!("Waited {:?} for {} rate bucket", waited, provider.name());
                }
            }

            match self.request_page(provider, url, timeout, render_scripts).await {
                Ok(page) if page.is_success() => {
                    log::debug!("{} fetched {} ({} bytes)", provider.name(), url, page.html.len());
                    return Ok(page);
                }
                Ok(page) => {
                    log::warn!(
                        "{} returned {} for {}: {}",
                        provider.name(),
                        page.status,
                        url,
                        snippet(&page.html, 120)
                    );
                    last_page = Some(page);
                }
                Err(e) => {
                    log::warn!("{} failed for {}: {}", provider.name(), url, e);
                    last_error = Some(e);
                }
            }
        }

        match (last_page, last_error) {
            (Some(page), _) => Ok(page),
            (None, Some(e)) => Err(AppError::from(e)),
            (None, None) => Err(AppError::fetch(url, "no API provider available")),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::ratelimit::{ManualClock, MemoryCounterStore};

    fn provider(style: RequestStyle) -> ApiProvider {
        let defaults = ApiConfig::default().providers;
        let config = defaults
            .into_iter()
            .find(|p| p.style == style)
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = FixedWindowLimiter::new(store, clock, "t", 5, Duration::from_secs(1));
        ApiProvider::new(config, "secret".into(), limiter)
    }

    #[test]
    fn test_query_style_passes_key_url_and_render_flag() {
        let provider = provider(RequestStyle::Query);
        let request = provider
            .build_request(&Client::new(), "https://example.test/a?b=1", Duration::from_secs(5), true)
            .build()
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("api_key".to_string(), "secret".to_string()),
                ("url".to_string(), "https://example.test/a?b=1".to_string()),
                ("dynamic".to_string(), "true".to_string()),
            ]
        );
        assert!(provider.renders(true));
        assert!(!provider.renders(false));
    }

    #[test]
    fn test_json_style_posts_zone_with_bearer_auth() {
        let provider = provider(RequestStyle::Json);
        let request = provider
            .build_request(&Client::new(), "https://example.test/", Duration::from_secs(5), true)
            .build()
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Bearer secret"
        );
        let body: serde_json::Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["zone"], "web_unlocker1");
        assert_eq!(body["format"], "raw");
        assert!(!provider.renders(true));
    }

    #[test]
    fn test_providers_without_keys_are_skipped() {
        let config = ApiConfig {
            providers: vec![ApiProviderConfig {
                api_key_env: "TIERFETCH_TEST_KEY_THAT_IS_NEVER_SET".into(),
                ..ApiConfig::default().providers[0].clone()
            }],
            ..ApiConfig::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let fetcher = ApiFetcher::from_config(&config, "ua", store, clock, "rate").unwrap();
        assert!(fetcher.is_none());
    }

    fn query_provider_at(endpoint: &str) -> ApiProvider {
        let mut config = ApiConfig::default()
            .providers
            .into_iter()
            .find(|p| p.style == RequestStyle::Query)
            .unwrap();
        config.endpoint = endpoint.to_string();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = FixedWindowLimiter::new(store, clock, "t", 5, Duration::from_secs(1));
        ApiProvider::new(config, "secret".into(), limiter)
    }

    /// Answer one request on a loopback port with a canned response.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_truncated_body_falls_through_to_next_provider() {
        let truncated = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 500\r\nConnection: close\r\n\r\n<html><p>cut",
        )
        .await;
        let healthy = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 25\r\nConnection: close\r\n\r\n<html><p>whole</p></html>",
        )
        .await;
        let client = Client::builder().no_proxy().build().unwrap();
        let fetcher = ApiFetcher::new(
            client,
            vec![query_provider_at(&truncated), query_provider_at(&healthy)],
        );

        let page = fetcher
            .fetch("https://example.test/", Duration::from_secs(5), false)
            .await
            .unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.html, "<html><p>whole</p></html>");
    }
}
