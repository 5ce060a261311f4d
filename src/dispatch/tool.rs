// src/dispatch/tool.rs

//! Tool registry: the closed set of tools, their arguments and cost formulas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::Resource;

/// Every tool the reasoning process may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Search,
    Crawl,
    ExtractLinks,
    AiOverview,
    Pdf,
    AdIntelligence,
    Finalize,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::Search,
        ToolKind::Crawl,
        ToolKind::ExtractLinks,
        ToolKind::AiOverview,
        ToolKind::Pdf,
        ToolKind::AdIntelligence,
        ToolKind::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Crawl => "crawl",
            Self::ExtractLinks => "extract_links",
            Self::AiOverview => "ai_overview",
            Self::Pdf => "pdf",
            Self::AdIntelligence => "ad_intelligence",
            Self::Finalize => "finalize",
        }
    }

    /// Resource charged per unit of this tool, `None` for free tools.
    pub fn resource(&self) -> Option<Resource> {
        match self {
            Self::Search => Some(Resource::Queries),
            Self::Crawl | Self::ExtractLinks => Some(Resource::Pages),
            Self::AiOverview => Some(Resource::AiOverviews),
            Self::Pdf => Some(Resource::Pdf),
            Self::AdIntelligence => Some(Resource::AdIntelligence),
            Self::Finalize => None,
        }
    }

    /// Model-backed tools reserve tokens on the shared token limiter.
    pub fn uses_model(&self) -> bool {
        matches!(self, Self::AiOverview | Self::Pdf)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" | "serp" => Ok(Self::Search),
            "crawl" => Ok(Self::Crawl),
            "extract_links" => Ok(Self::ExtractLinks),
            "ai_overview" => Ok(Self::AiOverview),
            "pdf" => Ok(Self::Pdf),
            "ad_intelligence" | "google_ads" => Ok(Self::AdIntelligence),
            "finalize" => Ok(Self::Finalize),
            _ => Err(AppError::UnknownTool(s.to_string())),
        }
    }
}

/// A parsed, cleaned tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Search { queries: Vec<String> },
    Crawl { urls: Vec<String> },
    ExtractLinks { url: String },
    AiOverview { query: String },
    Pdf { url: String, query: String },
    AdIntelligence { domain: String, region: Option<String> },
    Finalize { reasoning: String },
}

impl ToolCall {
    /// Parse `(name, args)` as sent by the reasoning process.
    ///
    /// A bare string is accepted where a list is expected and blank entries
    /// are dropped. A call left with nothing to do is a tool error.
    pub fn parse(name: &str, args: &Value) -> Result<Self> {
        let kind: ToolKind = name.parse()?;
        let call = match kind {
            ToolKind::Search => {
                let queries: Vec<String> = string_list(args, "queries")
                    .iter()
                    .map(|q| clean_query(q))
                    .filter(|q| !q.is_empty())
                    .collect();
                if queries.is_empty() {
                    return Err(AppError::tool(kind.as_str(), "no search queries provided"));
                }
                Self::Search { queries }
            }
            ToolKind::Crawl => {
                let mut urls = Vec::new();
                for raw in string_list(args, "urls") {
                    match Url::parse(&raw) {
                        Ok(_) => urls.push(raw),
                        Err(e) => log::warn!("Dropping crawl URL {:?}: {}", raw, e),
                    }
                }
                if urls.is_empty() {
                    return Err(AppError::tool(kind.as_str(), "no URLs provided"));
                }
                Self::Crawl { urls }
            }
            ToolKind::ExtractLinks => {
                let url = required(kind, args, "url")?;
                Url::parse(&url).map_err(|e| AppError::tool(kind.as_str(), e))?;
                Self::ExtractLinks { url }
            }
            ToolKind::AiOverview => Self::AiOverview {
                query: clean_query(&required(kind, args, "query")?),
            },
            ToolKind::Pdf => Self::Pdf {
                url: required(kind, args, "url")?,
                query: optional(args, "query").unwrap_or_default(),
            },
            ToolKind::AdIntelligence => Self::AdIntelligence {
                domain: required(kind, args, "domain")?,
                region: optional(args, "region"),
            },
            ToolKind::Finalize => Self::Finalize {
                reasoning: optional(args, "reasoning").unwrap_or_default(),
            },
        };
        Ok(call)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Self::Search { .. } => ToolKind::Search,
            Self::Crawl { .. } => ToolKind::Crawl,
            Self::ExtractLinks { .. } => ToolKind::ExtractLinks,
            Self::AiOverview { .. } => ToolKind::AiOverview,
            Self::Pdf { .. } => ToolKind::Pdf,
            Self::AdIntelligence { .. } => ToolKind::AdIntelligence,
            Self::Finalize { .. } => ToolKind::Finalize,
        }
    }

    /// Up-front charge for this call.
    ///
    /// Searches cost one query each and crawls one page per URL; every other
    /// metered tool costs one unit. Evidence tokens are charged after the
    /// call, from what was actually extracted.
    pub fn cost(&self) -> Vec<(Resource, u64)> {
        let units = match self {
            Self::Search { queries } => queries.len() as u64,
            Self::Crawl { urls } => urls.len() as u64,
            Self::Finalize { .. } => 0,
            _ => 1,
        };
        match self.kind().resource() {
            Some(resource) if units > 0 => vec![(resource, units)],
            _ => Vec::new(),
        }
    }
}

/// Strip characters that break search syntax and collapse whitespace.
pub fn clean_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '\\'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read a list argument. Accepts an array, a single string, a string holding
/// a JSON array, or the bare value when `args` is not an object.
fn string_list(args: &Value, key: &str) -> Vec<String> {
    let value = match args {
        Value::Object(map) => map.get(key).unwrap_or(&Value::Null),
        other => other,
    };
    let items: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) if s.trim_start().starts_with('[') => {
            match serde_json::from_str::<Vec<String>>(s) {
                Ok(items) => items,
                Err(_) => vec![s.clone()],
            }
        }
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn optional(args: &Value, key: &str) -> Option<String> {
    let value = match args {
        Value::Object(map) => map.get(key)?,
        other => other,
    };
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(kind: ToolKind, args: &Value, key: &str) -> Result<String> {
    optional(args, key)
        .ok_or_else(|| AppError::tool(kind.as_str(), format!("missing argument '{key}'")))
}
