// src/models/mod.rs

//! Domain models shared across the cascade, limiters and dispatch loop.

mod budget;
mod config;
mod page;

pub use budget::{Budget, Resource, Usage};
pub use config::{
    ApiConfig, ApiProviderConfig, CascadeConfig, ClassifierConfig, CleanConfig, Config, DedupConfig,
    ExtractConfig, HttpConfig, PhraseFamily, RateLimitConfig, RenderConfig, RequestStyle,
    SessionConfig,
};
pub use page::{
    FailureReason, FetchHint, FetchRequest, FetchResult, PageMetadata, PageRecord, StrategyKind,
};
