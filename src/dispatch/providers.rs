// src/dispatch/providers.rs

//! Collaborators behind the tools, and how their results are shown to the
//! reasoning process.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::extract::Link;
use crate::models::PageRecord;

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// Web search capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, result_count: usize, locale: &str)
    -> Result<Vec<SearchHit>>;
}

/// Model-backed and specialist tools. Each method defaults to "not available"
/// so an implementation only provides what it supports.
#[async_trait]
pub trait SpecialistProvider: Send + Sync {
    async fn ai_overview(&self, query: &str, _locale: &str) -> Result<String> {
        Err(AppError::tool("ai_overview", format!("not available for '{query}'")))
    }

    async fn pdf(&self, url: &str, _query: &str) -> Result<String> {
        Err(AppError::tool("pdf", format!("not available for {url}")))
    }

    async fn ad_intelligence(&self, domain: &str, _region: Option<&str>) -> Result<String> {
        Err(AppError::tool(
            "ad_intelligence",
            format!("not available for {domain}"),
        ))
    }
}

/// Page acquisition for the crawl and link tools.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// One record per URL, failures included.
    async fn crawl(&self, urls: &[String]) -> Vec<PageRecord>;

    async fn links(&self, url: &str) -> Result<Vec<Link>>;
}

/// Turns tool results into the text handed back to the reasoning process.
pub trait ResultRenderer: Send + Sync {
    fn render_search(&self, groups: &[(String, Vec<SearchHit>)]) -> String;

    fn render_pages(&self, records: &[PageRecord]) -> Result<String>;

    fn render_links(&self, links: &[Link]) -> Result<String>;
}

/// Markdown for search results, JSON for pages and links.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl ResultRenderer for MarkdownRenderer {
    fn render_search(&self, groups: &[(String, Vec<SearchHit>)]) -> String {
        let mut out = String::new();
        for (query, hits) in groups {
            out.push_str(&format!("### Query: {query}\n\n"));
            if hits.is_empty() {
                out.push_str("No new results.\n\n");
                continue;
            }
            for hit in hits {
                out.push_str(&format!("- [{}]({})\n", hit.title.trim(), hit.url));
                if !hit.snippet.trim().is_empty() {
                    out.push_str(&format!("  {}\n", hit.snippet.trim()));
                }
                out.push('\n');
            }
        }
        out.trim_end().to_string()
    }

    fn render_pages(&self, records: &[PageRecord]) -> Result<String> {
        Ok(serde_json::to_string_pretty(records)?)
    }

    fn render_links(&self, links: &[Link]) -> Result<String> {
        Ok(serde_json::to_string_pretty(links)?)
    }
}

/// Drop hits whose URL already appeared under an earlier query.
pub fn dedupe_hits(groups: Vec<(String, Vec<SearchHit>)>) -> Vec<(String, Vec<SearchHit>)> {
    let mut seen = HashSet::new();
    groups
        .into_iter()
        .map(|(query, hits)| {
            let hits = hits
                .into_iter()
                .filter(|hit| seen.insert(hit.url.trim_end_matches('/').to_string()))
                .collect();
            (query, hits)
        })
        .collect()
}
