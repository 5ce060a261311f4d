// src/models/budget.rs

//! Per-session resource ceilings and running usage counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A metered, countable resource. Wall-clock time is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Queries,
    Pages,
    EvidenceTokens,
    AiOverviews,
    Pdf,
    AdIntelligence,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Queries,
        Resource::Pages,
        Resource::EvidenceTokens,
        Resource::AiOverviews,
        Resource::Pdf,
        Resource::AdIntelligence,
    ];

    fn index(self) -> usize {
        match self {
            Self::Queries => 0,
            Self::Pages => 1,
            Self::EvidenceTokens => 2,
            Self::AiOverviews => 3,
            Self::Pdf => 4,
            Self::AdIntelligence => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queries => "queries",
            Self::Pages => "pages",
            Self::EvidenceTokens => "evidence_tokens",
            Self::AiOverviews => "ai_overviews",
            Self::Pdf => "pdf",
            Self::AdIntelligence => "ad_intelligence",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource ceilings, fixed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budget {
    pub queries: u64,
    pub pages: u64,
    pub evidence_tokens: u64,
    pub ai_overviews: u64,
    pub pdf: u64,
    pub ad_intelligence: u64,
    /// Wall-clock seconds, checked between dispatches
    pub seconds: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            queries: 3,
            pages: 6,
            evidence_tokens: 3000,
            ai_overviews: 1,
            pdf: 2,
            ad_intelligence: 1,
            seconds: 60,
        }
    }
}

impl Budget {
    pub fn ceiling(&self, resource: Resource) -> u64 {
        match resource {
            Resource::Queries => self.queries,
            Resource::Pages => self.pages,
            Resource::EvidenceTokens => self.evidence_tokens,
            Resource::AiOverviews => self.ai_overviews,
            Resource::Pdf => self.pdf,
            Resource::AdIntelligence => self.ad_intelligence,
        }
    }
}

/// Running counters. Only ever incremented.
#[derive(Debug, Default)]
pub struct Usage {
    counters: [AtomicU64; 6],
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: Resource) -> u64 {
        self.counters[resource.index()].load(Ordering::SeqCst)
    }

    /// Add `amount` and return the new total.
    pub fn add(&self, resource: Resource, amount: u64) -> u64 {
        self.counters[resource.index()].fetch_add(amount, Ordering::SeqCst) + amount
    }

    /// Copy of every counter, in [`Resource::ALL`] order.
    pub fn snapshot(&self) -> Vec<(Resource, u64)> {
        Resource::ALL.iter().map(|&r| (r, self.get(r))).collect()
    }
}
