// src/models/config.rs

//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Budget, StrategyKind};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Lightweight HTTP tier
    #[serde(default)]
    pub http: HttpConfig,

    /// Scripted rendering tier
    #[serde(default)]
    pub render: RenderConfig,

    /// Paid scraping API tier
    #[serde(default)]
    pub api: ApiConfig,

    /// Tier order and failure hints
    #[serde(default)]
    pub cascade: CascadeConfig,

    /// Admissibility heuristics
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// HTML to text extraction
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Boilerplate line removal
    #[serde(default)]
    pub clean: CleanConfig,

    /// Near-duplicate paragraph filter
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Shared rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Research session defaults
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Serialize the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 || self.render.timeout_secs == 0 || self.api.timeout_secs == 0
        {
            return Err(AppError::validation("tier timeouts must be > 0"));
        }
        if self.http.concurrency == 0 || self.render.concurrency == 0 || self.api.concurrency == 0 {
            return Err(AppError::validation("tier concurrency must be > 0"));
        }
        if self.cascade.tiers.is_empty() {
            return Err(AppError::validation("cascade.tiers is empty"));
        }
        for provider in &self.api.providers {
            if provider.rps_limit == 0 || provider.window_ms == 0 {
                return Err(AppError::validation(format!(
                    "api provider {} needs rps_limit and window_ms > 0",
                    provider.name
                )));
            }
            url::Url::parse(&provider.endpoint)?;
        }
        if let Some(endpoint) = &self.render.endpoint {
            url::Url::parse(endpoint)?;
        }
        for pattern in &self.clean.spam_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                AppError::validation(format!("clean.spam_patterns: {e}"))
            })?;
        }
        if !(0.0..=1.0).contains(&self.dedup.threshold) {
            return Err(AppError::validation("dedup.threshold must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.classifier.min_visible_ratio) {
            return Err(AppError::validation(
                "classifier.min_visible_ratio must be within 0..=1",
            ));
        }
        if self.rate_limit.token_window_secs == 0 {
            return Err(AppError::validation("rate_limit.token_window_secs must be > 0"));
        }
        if self.session.max_iterations == 0 {
            return Err(AppError::validation("session.max_iterations must be > 0"));
        }
        Ok(())
    }
}

/// Lightweight HTTP tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Accept-Language header
    #[serde(default = "defaults::accept_language")]
    pub accept_language: String,

    /// Per-fetch timeout in seconds
    #[serde(default = "defaults::http_timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent fetches in this tier
    #[serde(default = "defaults::http_concurrency")]
    pub concurrency: usize,

    /// Optional outbound proxy (https preferred)
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            accept_language: defaults::accept_language(),
            timeout_secs: defaults::http_timeout(),
            concurrency: defaults::http_concurrency(),
            proxy: None,
        }
    }
}

/// Scripted rendering tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Rendering service endpoint; the tier is skipped when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the service token, if any
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Page lifecycle event to wait for
    #[serde(default = "defaults::wait_until")]
    pub wait_until: String,

    #[serde(default = "defaults::slow_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "defaults::render_concurrency")]
    pub concurrency: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: None,
            wait_until: defaults::wait_until(),
            timeout_secs: defaults::slow_timeout(),
            concurrency: defaults::render_concurrency(),
        }
    }
}

/// Paid scraping API tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "defaults::slow_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "defaults::http_concurrency")]
    pub concurrency: usize,

    /// Providers, tried in order for each URL
    #[serde(default = "defaults::api_providers")]
    pub providers: Vec<ApiProviderConfig>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::slow_timeout(),
            concurrency: defaults::http_concurrency(),
            providers: defaults::api_providers(),
        }
    }
}

/// How a provider expects to be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStyle {
    /// GET with `api_key`, `url` and render flag query parameters
    Query,
    /// POST JSON `{zone, url, format}` with bearer auth
    Json,
}

/// One paid scraping provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProviderConfig {
    /// Provider name, also the rate bucket name
    pub name: String,

    pub endpoint: String,

    pub style: RequestStyle,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Query parameter toggling script rendering (query style only)
    #[serde(default)]
    pub render_param: Option<String>,

    /// Zone name (json style only)
    #[serde(default)]
    pub zone: Option<String>,

    /// Requests admitted per window across all workers
    #[serde(default = "defaults::rps_limit")]
    pub rps_limit: u64,

    #[serde(default = "defaults::window_ms")]
    pub window_ms: u64,
}

/// Tier order and failure hint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Strategies in cost order
    #[serde(default = "defaults::tiers")]
    pub tiers: Vec<StrategyKind>,

    /// Start previously failed URLs at the second tier
    #[serde(default = "defaults::enabled")]
    pub reuse_failure_hints: bool,

    /// Where the failed-URL hint is persisted between runs
    #[serde(default)]
    pub hint_path: Option<PathBuf>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            tiers: defaults::tiers(),
            reuse_failure_hints: true,
            hint_path: None,
        }
    }
}

/// A named group of phrases indicating the same kind of wall.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhraseFamily {
    pub name: String,
    pub phrases: Vec<String>,
}

impl PhraseFamily {
    fn new(name: &str, phrases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Admissibility heuristics. Phrases are matched case-folded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Extracted text shorter than this is `empty`
    #[serde(default = "defaults::min_text_chars")]
    pub min_text_chars: usize,

    /// Minimum extracted-text to raw-HTML length ratio
    #[serde(default = "defaults::min_visible_ratio")]
    pub min_visible_ratio: f64,

    /// Visible text below this suggests client-side rendering
    #[serde(default = "defaults::js_min_visible_chars")]
    pub js_min_visible_chars: usize,

    /// Bot-wall, cookie-wall, captcha, rate-limit and geo-block phrases
    #[serde(default = "defaults::block_phrases")]
    pub block_phrases: Vec<PhraseFamily>,

    /// Raw HTML fragments only challenge pages carry
    #[serde(default = "defaults::challenge_html_markers")]
    pub challenge_html_markers: Vec<String>,

    /// SPA framework root markers
    #[serde(default = "defaults::spa_markers")]
    pub spa_markers: Vec<String>,

    /// Phrases demanding script execution inside `<noscript>` pages
    #[serde(default = "defaults::noscript_warnings")]
    pub noscript_warnings: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_text_chars: defaults::min_text_chars(),
            min_visible_ratio: defaults::min_visible_ratio(),
            js_min_visible_chars: defaults::js_min_visible_chars(),
            block_phrases: defaults::block_phrases(),
            challenge_html_markers: defaults::challenge_html_markers(),
            spa_markers: defaults::spa_markers(),
            noscript_warnings: defaults::noscript_warnings(),
        }
    }
}

/// HTML to text extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Boilerplate containers dropped from extracted text
    #[serde(default = "defaults::exclude_tags")]
    pub exclude_tags: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            exclude_tags: defaults::exclude_tags(),
        }
    }
}

/// Line-level boilerplate removal run on fetched text before deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Drop a line on any spam phrase; otherwise two distinct phrases are needed
    #[serde(default = "defaults::enabled")]
    pub aggressive: bool,

    /// Case-insensitive substrings marking cookie banners, CTAs and legal lines
    #[serde(default = "defaults::spam_phrases")]
    pub spam_phrases: Vec<String>,

    /// Regular expressions that drop a line whatever the mode
    #[serde(default = "defaults::spam_patterns")]
    pub spam_patterns: Vec<String>,

    /// Short or symbol-heavy lines are kept when they mention one of these
    #[serde(default = "defaults::preserve_keywords")]
    pub preserve_keywords: Vec<String>,

    /// Lines shorter than this are low value unless preserved
    #[serde(default = "defaults::min_line_chars")]
    pub min_line_chars: usize,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            aggressive: defaults::enabled(),
            spam_phrases: defaults::spam_phrases(),
            spam_patterns: defaults::spam_patterns(),
            preserve_keywords: defaults::preserve_keywords(),
            min_line_chars: defaults::min_line_chars(),
        }
    }
}

/// Near-duplicate filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Similarity at or above which two paragraphs are duplicates
    #[serde(default = "defaults::dedup_threshold")]
    pub threshold: f64,

    /// Shorter paragraphs are kept verbatim within a page
    #[serde(default = "defaults::min_paragraph_len")]
    pub min_paragraph_len: usize,

    /// Remove paragraphs repeated across the pages of one crawl
    #[serde(default = "defaults::enabled")]
    pub cross_page: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::dedup_threshold(),
            min_paragraph_len: defaults::min_paragraph_len(),
            cross_page: true,
        }
    }
}

/// Shared rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Shared counter store; process-local counters when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every counter key
    #[serde(default = "defaults::key_prefix")]
    pub key_prefix: String,

    /// Model token quota per window; 0 disables the token limiter
    #[serde(default = "defaults::model_tokens_per_window")]
    pub model_tokens_per_window: u64,

    #[serde(default = "defaults::token_window_secs")]
    pub token_window_secs: u64,

    /// Longest a caller waits for token capacity
    #[serde(default = "defaults::token_max_wait_secs")]
    pub token_max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: defaults::key_prefix(),
            model_tokens_per_window: defaults::model_tokens_per_window(),
            token_window_secs: defaults::token_window_secs(),
            token_max_wait_secs: defaults::token_max_wait_secs(),
        }
    }
}

/// Research session defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard ceiling on dispatched tool calls, independent of budgets
    #[serde(default = "defaults::max_iterations")]
    pub max_iterations: u32,

    /// Budget used when the planner supplies none
    #[serde(default)]
    pub budget: Budget,

    /// Tokens reserved before a model-backed tool call
    #[serde(default = "defaults::model_call_token_estimate")]
    pub model_call_token_estimate: u64,

    /// Results requested per search query
    #[serde(default = "defaults::search_result_count")]
    pub search_result_count: usize,

    #[serde(default = "defaults::search_locale")]
    pub search_locale: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: defaults::max_iterations(),
            budget: Budget::default(),
            model_call_token_estimate: defaults::model_call_token_estimate(),
            search_result_count: defaults::search_result_count(),
            search_locale: defaults::search_locale(),
        }
    }
}

mod defaults {
    use super::{ApiProviderConfig, PhraseFamily, RequestStyle};
    use crate::models::StrategyKind;

    pub fn enabled() -> bool {
        true
    }

    // HTTP tier defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; tierfetch/0.1)".into()
    }
    pub fn accept_language() -> String {
        "en-US,en;q=0.8".into()
    }
    pub fn http_timeout() -> u64 {
        8
    }
    pub fn http_concurrency() -> usize {
        10
    }

    // Render/API tier defaults
    pub fn slow_timeout() -> u64 {
        30
    }
    pub fn render_concurrency() -> usize {
        5
    }
    pub fn wait_until() -> String {
        "domcontentloaded".into()
    }
    pub fn rps_limit() -> u64 {
        5
    }
    pub fn window_ms() -> u64 {
        1000
    }
    pub fn api_providers() -> Vec<ApiProviderConfig> {
        vec![
            ApiProviderConfig {
                name: "scrapingdog".into(),
                endpoint: "https://api.scrapingdog.com/scrape".into(),
                style: RequestStyle::Query,
                api_key_env: "SCRAPING_DOG_API_KEY".into(),
                render_param: Some("dynamic".into()),
                zone: None,
                rps_limit: rps_limit(),
                window_ms: window_ms(),
            },
            ApiProviderConfig {
                name: "brightdata".into(),
                endpoint: "https://api.brightdata.com/request".into(),
                style: RequestStyle::Json,
                api_key_env: "BRIGHT_DATA_API_TOKEN".into(),
                render_param: None,
                zone: Some("web_unlocker1".into()),
                rps_limit: rps_limit(),
                window_ms: window_ms(),
            },
        ]
    }

    // Cascade defaults
    pub fn tiers() -> Vec<StrategyKind> {
        vec![StrategyKind::Http, StrategyKind::Render, StrategyKind::Api]
    }

    // Classifier defaults
    pub fn min_text_chars() -> usize {
        150
    }
    pub fn min_visible_ratio() -> f64 {
        0.02
    }
    pub fn js_min_visible_chars() -> usize {
        200
    }
    pub fn block_phrases() -> Vec<PhraseFamily> {
        vec![
            PhraseFamily::new(
                "browser_challenge",
                &[
                    "checking your browser",
                    "verifying your browser",
                    "just a moment...",
                    "ddos protection by",
                    "ddos-guard",
                    "attention required! | cloudflare",
                    "cf-ray",
                ],
            ),
            PhraseFamily::new(
                "captcha",
                &[
                    "captcha",
                    "i'm not a robot",
                    "im not a robot",
                    "are you a robot",
                    "verify that you are not a robot",
                ],
            ),
            PhraseFamily::new(
                "human_verification",
                &[
                    "verify you are human",
                    "confirm you are human",
                    "prove you are human",
                    "human verification",
                    "complete the security check",
                    "security challenge",
                    "additional verification required",
                ],
            ),
            PhraseFamily::new(
                "bot_protection",
                &[
                    "access denied",
                    "access blocked",
                    "your ip has been blocked",
                    "bot detection",
                    "incapsula incident",
                    "perimeterx",
                    "datadome",
                ],
            ),
            PhraseFamily::new(
                "rate_limit",
                &[
                    "too many requests",
                    "rate limit exceeded",
                    "request limit exceeded",
                    "unusual traffic",
                    "automated requests",
                    "suspicious activity",
                    "temporarily blocked",
                ],
            ),
            PhraseFamily::new(
                "cookie_wall",
                &[
                    "enable cookies",
                    "accept cookies",
                    "cookies required",
                    "please accept cookies",
                    "cookie consent",
                    "this site uses cookies",
                    "manage cookies",
                ],
            ),
            PhraseFamily::new(
                "geo_block",
                &[
                    "not available in your region",
                    "not available in your country",
                    "geo-blocked",
                    "service unavailable in your location",
                ],
            ),
            PhraseFamily::new(
                "script_gate",
                &[
                    "please enable javascript",
                    "javascript is required",
                    "enable javascript to continue",
                    "your browser does not support javascript",
                ],
            ),
        ]
    }
    pub fn challenge_html_markers() -> Vec<String> {
        vec![
            "cf-browser-verification".into(),
            "<title>just a moment".into(),
            "<title>attention required".into(),
            "<title>access denied".into(),
        ]
    }
    pub fn spa_markers() -> Vec<String> {
        vec![
            "data-reactroot".into(),
            "id=\"__next\"".into(),
            "id=\"__nuxt\"".into(),
            "ng-version".into(),
            "ng-app".into(),
            "v-cloak".into(),
            "data-server-rendered=\"false\"".into(),
            "id=\"app\"".into(),
            "id=\"root\"".into(),
        ]
    }
    pub fn noscript_warnings() -> Vec<String> {
        vec![
            "enable javascript".into(),
            "javascript is disabled".into(),
            "requires javascript".into(),
            "turn on javascript".into(),
            "javascript must be enabled".into(),
        ]
    }

    // Extraction defaults
    pub fn exclude_tags() -> Vec<String> {
        vec!["nav".into(), "footer".into(), "aside".into()]
    }

    // Cleaning defaults
    pub fn spam_phrases() -> Vec<String> {
        [
            "we use cookies",
            "this site uses cookies",
            "this website uses cookies",
            "accept cookies",
            "cookie preferences",
            "cookie settings",
            "manage cookies",
            "cookie consent",
            "cookie policy",
            "cookies policy",
            "necessary cookies",
            "privacy policy",
            "privacy notice",
            "terms of service",
            "terms and conditions",
            "do not sell my personal information",
            "by continuing to use",
            "maximum storage duration",
            "legitimate interest",
            "skip to content",
            "back to top",
            "share this",
            "sign up for our newsletter",
            "subscribe to our newsletter",
            "copyright notice",
            "developed by",
            "designed by",
            "lorem ipsum",
            "required field",
            "please fill",
            "coming soon",
            "under construction",
            "page not found",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn spam_patterns() -> Vec<String> {
        [
            r"\bclick here\b",
            r"\b(learn|read|see) more\b",
            r"\b(accept|allow|deny|reject) all\b",
            r"©\s*\d{4}",
            r"\ball rights reserved\b",
            r"\bpowered by\b",
            r"\bcontinue to .*site\b",
            r"\[\s*x\s*\]",
            r"\[\s*\d+\s*\]",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn preserve_keywords() -> Vec<String> {
        [
            "revenue", "profit", "sales", "growth", "market share", "customers", "employees",
            "staff", "headcount", "workforce", "funding", "investment", "valuation", "ipo",
            "acquisition", "merger", "partnership", "contract", "quarterly", "annual",
            "earnings", "ebitda", "net income", "cash flow", "headquarters", "founded", "ceo",
            "founder", "cfo", "cto", "president", "director",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn min_line_chars() -> usize {
        10
    }

    // Dedup defaults
    pub fn dedup_threshold() -> f64 {
        0.85
    }
    pub fn min_paragraph_len() -> usize {
        50
    }

    // Rate limit defaults
    pub fn key_prefix() -> String {
        "rate".into()
    }
    pub fn model_tokens_per_window() -> u64 {
        1_000_000
    }
    pub fn token_window_secs() -> u64 {
        60
    }
    pub fn token_max_wait_secs() -> u64 {
        60
    }

    // Session defaults
    pub fn max_iterations() -> u32 {
        10
    }
    pub fn model_call_token_estimate() -> u64 {
        2_000
    }
    pub fn search_result_count() -> usize {
        10
    }
    pub fn search_locale() -> String {
        "us".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_user_agent() {
        let mut config = Config::default();
        config.http.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.render.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.dedup.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_spam_pattern() {
        let mut config = Config::default();
        config.clean.spam_patterns.push("(unclosed".into());
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [http]
            timeout_secs = 3

            [cascade]
            tiers = ["http", "api"]

            [session.budget]
            pages = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.http.timeout_secs, 3);
        assert_eq!(config.http.concurrency, 10);
        assert_eq!(
            config.cascade.tiers,
            vec![StrategyKind::Http, StrategyKind::Api]
        );
        assert_eq!(config.session.budget.pages, 2);
        assert_eq!(config.session.budget.queries, Budget::default().queries);
        assert_eq!(config.classifier.min_text_chars, 150);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.api.providers.len(), 2);
        assert_eq!(parsed.classifier.block_phrases, defaults::block_phrases());
    }
}
