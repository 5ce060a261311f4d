// src/models/page.rs

//! Fetch attempts and their cascade-resolved outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fetch strategy tier, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Http,
    Render,
    Api,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Render => "render",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "requests" => Ok(Self::Http),
            "render" | "browser" => Ok(Self::Render),
            "api" | "apis" => Ok(Self::Api),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Advisory hint attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchHint {
    /// The URL failed on the previous crawl without script rendering
    PreviouslyFailed,
}

/// One URL to resolve through the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Candidate tiers in the order they will be tried
    pub tiers: Vec<StrategyKind>,
    pub hint: Option<FetchHint>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, tiers: Vec<StrategyKind>) -> Self {
        Self {
            url: url.into(),
            tiers,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: FetchHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Index of the first tier to try. A previously failed URL skips the
    /// cheapest tier when a later one exists.
    pub fn start_tier(&self) -> usize {
        match self.hint {
            Some(FetchHint::PreviouslyFailed) if self.tiers.len() > 1 => 1,
            _ => 0,
        }
    }
}

/// Why an attempt (or a whole cascade) did not produce admissible content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Bot wall, cookie wall, captcha or an empty application shell
    Blocked(String),
    /// Too little extracted text
    Empty,
    /// Content needs script execution this tier cannot provide
    JsRequired(String),
    /// Non-2xx response
    Status(u16),
    Timeout,
    /// Transport failure or a strategy-level error
    Network(String),
    /// No tier was available to try the URL
    NoStrategy,
}

impl FailureReason {
    /// A soft failure whose content may still be used as a last resort.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::JsRequired(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(detail) => write!(f, "blocked: {detail}"),
            Self::Empty => f.write_str("empty content"),
            Self::JsRequired(detail) => write!(f, "javascript required: {detail}"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::Timeout => f.write_str("timed out"),
            Self::Network(message) => write!(f, "network error: {message}"),
            Self::NoStrategy => f.write_str("no fetch strategy available"),
        }
    }
}

/// Outcome of one strategy attempt on one URL.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub final_url: String,
    pub html: String,
    pub text: String,
    pub status: Option<u16>,
    pub success: bool,
    pub failure: Option<FailureReason>,
    pub strategy: StrategyKind,
    pub rendered: bool,
    pub duration: Duration,
}

impl FetchResult {
    /// A failed attempt that produced no content.
    pub fn failed(
        url: impl Into<String>,
        strategy: StrategyKind,
        reason: FailureReason,
        duration: Duration,
    ) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            html: String::new(),
            text: String::new(),
            status: None,
            success: false,
            failure: Some(reason),
            strategy,
            rendered: false,
            duration,
        }
    }
}

/// Metadata carried by a final record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub status: Option<u16>,
    pub strategy: Option<StrategyKind>,
    pub content_length: usize,
    /// Tiers attempted, in order, including the paid render retry
    pub attempts: Vec<StrategyKind>,
    /// Content accepted although it looked script-rendered
    #[serde(default)]
    pub js_required: bool,
    pub failure: Option<FailureReason>,
}

/// Final, cascade-resolved outcome for one input URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// URL as requested
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: PageMetadata,
    pub fetched_at: DateTime<Utc>,
}

impl PageRecord {
    /// Build a successful record from an admissible attempt.
    pub fn from_success(result: FetchResult, attempts: Vec<StrategyKind>) -> Self {
        let js_required = result.failure.as_ref().is_some_and(FailureReason::is_soft);
        Self {
            url: result.url,
            final_url: result.final_url,
            metadata: PageMetadata {
                status: result.status,
                strategy: Some(result.strategy),
                content_length: result.text.chars().count(),
                attempts,
                js_required,
                failure: None,
            },
            text: result.text,
            success: true,
            error: None,
            fetched_at: Utc::now(),
        }
    }

    /// Build a failed record carrying the last failure reason.
    pub fn from_failure(
        url: impl Into<String>,
        last: Option<&FetchResult>,
        reason: FailureReason,
        attempts: Vec<StrategyKind>,
    ) -> Self {
        let url = url.into();
        Self {
            final_url: last.map_or_else(|| url.clone(), |r| r.final_url.clone()),
            url,
            text: String::new(),
            success: false,
            error: Some(reason.to_string()),
            metadata: PageMetadata {
                status: last.and_then(|r| r.status),
                strategy: last.map(|r| r.strategy),
                content_length: 0,
                attempts,
                js_required: false,
                failure: Some(reason),
            },
            fetched_at: Utc::now(),
        }
    }

    /// Replace the text after deduplication, keeping the length in sync.
    pub fn set_text(&mut self, text: String) {
        self.metadata.content_length = text.chars().count();
        self.text = text;
    }
}
