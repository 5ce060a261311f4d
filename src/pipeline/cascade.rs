// src/pipeline/cascade.rs

//! Tiered crawl orchestrator.
//!
//! Tiers run strictly in order. Within a tier every outstanding URL is fetched
//! concurrently up to the tier's limit and classified; admissible pages are
//! finalized, the rest carry their failure reason into the next tier. Only the
//! paid tier retries in place, once, asking for script rendering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::classify::{Classifier, Verdict};
use crate::clean::TextCleaner;
use crate::dedup::Deduplicator;
use crate::error::{AppError, Result};
use crate::extract::{Link, TextExtractor, extract_links};
use crate::fetch::{ApiFetcher, FetchStrategy, HttpFetcher, RenderFetcher};
use crate::models::{
    Config, FailureReason, FetchHint, FetchRequest, FetchResult, PageRecord, StrategyKind,
};
use crate::ratelimit::{Clock, CounterStore};
use crate::storage::{FailureHints, HintStore, LocalHintStore};

/// One cascade tier: a strategy with its timeout and concurrency bound.
#[derive(Clone)]
pub struct Tier {
    strategy: Arc<dyn FetchStrategy>,
    timeout: Duration,
    concurrency: usize,
}

impl Tier {
    pub fn new(strategy: Arc<dyn FetchStrategy>, timeout: Duration, concurrency: usize) -> Self {
        Self {
            strategy,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }
}

/// Result of one attempt plus the verdict that produced it.
struct Attempt {
    result: FetchResult,
    verdict: Option<Verdict>,
}

/// Per-input-URL progress through the cascade.
struct Slot {
    request: FetchRequest,
    attempts: Vec<StrategyKind>,
    last: Option<FetchResult>,
    fallback: Option<FetchResult>,
    record: Option<PageRecord>,
}

/// Sequences fetch strategies per URL until one yields admissible content.
pub struct Orchestrator {
    tiers: Vec<Tier>,
    classifier: Classifier,
    extractor: TextExtractor,
    cleaner: Option<TextCleaner>,
    dedup: Deduplicator,
    cross_page: bool,
    reuse_hints: bool,
    hint_store: Option<Arc<dyn HintStore>>,
    /// `None` until loaded from the hint store
    hints: Mutex<Option<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(tiers: Vec<Tier>, classifier: Classifier) -> Self {
        Self {
            tiers,
            classifier,
            extractor: TextExtractor::default(),
            cleaner: None,
            dedup: Deduplicator::default(),
            cross_page: true,
            reuse_hints: true,
            hint_store: None,
            hints: Mutex::new(None),
        }
    }

    pub fn with_extractor(mut self, extractor: TextExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Strip boilerplate lines from admitted pages before deduplication.
    pub fn with_cleaner(mut self, cleaner: TextCleaner) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn with_dedup(mut self, dedup: Deduplicator, cross_page: bool) -> Self {
        self.dedup = dedup;
        self.cross_page = cross_page;
        self
    }

    pub fn with_hint_reuse(mut self, enabled: bool) -> Self {
        self.reuse_hints = enabled;
        self
    }

    pub fn with_hint_store(mut self, store: Arc<dyn HintStore>) -> Self {
        self.hint_store = Some(store);
        self
    }

    /// Build every configured tier that is usable.
    ///
    /// The render tier needs an endpoint and the API tier at least one
    /// provider with a key; unusable tiers are left out.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut tiers = Vec::new();
        for kind in &config.cascade.tiers {
            match kind {
                StrategyKind::Http => tiers.push(Tier::new(
                    Arc::new(HttpFetcher::new(&config.http)?),
                    Duration::from_secs(config.http.timeout_secs),
                    config.http.concurrency,
                )),
                StrategyKind::Render => {
                    match RenderFetcher::from_config(&config.render, &config.http.user_agent)? {
                        Some(fetcher) => tiers.push(Tier::new(
                            Arc::new(fetcher),
                            Duration::from_secs(config.render.timeout_secs),
                            config.render.concurrency,
                        )),
                        None => log::info!("Render tier skipped: no render.endpoint configured"),
                    }
                }
                StrategyKind::Api => match ApiFetcher::from_config(
                    &config.api,
                    &config.http.user_agent,
                    store.clone(),
                    clock.clone(),
                    &config.rate_limit.key_prefix,
                )? {
                    Some(fetcher) => {
                        log::info!("API tier providers: {}", fetcher.provider_names().join(", "));
                        tiers.push(Tier::new(
                            Arc::new(fetcher),
                            Duration::from_secs(config.api.timeout_secs),
                            config.api.concurrency,
                        ));
                    }
                    None => log::warn!("API tier skipped: no provider has an API key"),
                },
            }
        }
        if tiers.is_empty() {
            return Err(AppError::config("no usable fetch tier configured"));
        }

        let mut orchestrator = Self::new(tiers, Classifier::new(&config.classifier)?)
            .with_extractor(TextExtractor::new(&config.extract.exclude_tags))
            .with_dedup(Deduplicator::from_config(&config.dedup), config.dedup.cross_page)
            .with_hint_reuse(config.cascade.reuse_failure_hints);
        if config.clean.enabled {
            orchestrator = orchestrator.with_cleaner(TextCleaner::new(&config.clean)?);
        }
        if let Some(path) = &config.cascade.hint_path {
            orchestrator = orchestrator.with_hint_store(Arc::new(LocalHintStore::new(path)));
        }
        Ok(orchestrator)
    }

    pub fn tier_kinds(&self) -> Vec<StrategyKind> {
        self.tiers.iter().map(Tier::kind).collect()
    }

    /// URLs that failed on the most recent crawl.
    pub async fn failure_hints(&self) -> HashSet<String> {
        self.current_hints().await
    }

    async fn current_hints(&self) -> HashSet<String> {
        let mut hints = self.hints.lock().await;
        if hints.is_none() {
            let loaded = match &self.hint_store {
                Some(store) => match store.load().await {
                    Ok(saved) => saved.urls.into_iter().collect(),
                    Err(e) => {
                        log::warn!("Ignoring unreadable failure hints: {}", e);
                        HashSet::new()
                    }
                },
                None => HashSet::new(),
            };
            *hints = Some(loaded);
        }
        hints.clone().unwrap_or_default()
    }

    async fn replace_hints(&self, failed: HashSet<String>) {
        if let Some(store) = &self.hint_store {
            if let Err(e) = store.save(&FailureHints::new(failed.iter().cloned())).await {
                log::warn!("Could not save failure hints: {}", e);
            }
        }
        *self.hints.lock().await = Some(failed);
    }

    /// Resolve every URL to exactly one record, in input order.
    pub async fn crawl(&self, urls: &[String]) -> Vec<PageRecord> {
        let started = Instant::now();
        let kinds = self.tier_kinds();
        let hints = if self.reuse_hints {
            self.current_hints().await
        } else {
            HashSet::new()
        };

        let mut slots: Vec<Slot> = urls
            .iter()
            .map(|url| {
                let mut request = FetchRequest::new(url.clone(), kinds.clone());
                if hints.contains(url) {
                    request = request.with_hint(FetchHint::PreviouslyFailed);
                }
                Slot {
                    request,
                    attempts: Vec::new(),
                    last: None,
                    fallback: None,
                    record: None,
                }
            })
            .collect();

        for (index, tier) in self.tiers.iter().enumerate() {
            let outstanding: Vec<(usize, String)> = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.record.is_none() && s.request.start_tier() <= index)
                .map(|(i, s)| (i, s.request.url.clone()))
                .collect();
            if outstanding.is_empty() {
                continue;
            }
            log::info!(
                "Tier {} ({}): fetching {} URL(s)",
                index + 1,
                tier.kind(),
                outstanding.len()
            );

            let results: Vec<(usize, Vec<Attempt>)> = stream::iter(outstanding)
                .map(|(i, url)| async move { (i, self.run_tier(tier, &url).await) })
                .buffer_unordered(tier.concurrency)
                .collect()
                .await;

            let mut admitted = 0;
            for (i, attempts) in results {
                let slot = &mut slots[i];
                for attempt in attempts {
                    slot.attempts.push(attempt.result.strategy);
                    let result = attempt.result;
                    if result.success {
                        slot.record = Some(PageRecord::from_success(
                            result.clone(),
                            slot.attempts.clone(),
                        ));
                        admitted += 1;
                    } else if matches!(attempt.verdict, Some(Verdict::JsRequired(_))) {
                        slot.fallback = Some(result.clone());
                    }
                    slot.last = Some(result);
                }
            }
            log::info!("Tier {} ({}): {} admitted", index + 1, tier.kind(), admitted);
        }

        let mut records: Vec<PageRecord> = slots.into_iter().map(finalize_slot).collect();
        if let Some(cleaner) = &self.cleaner {
            cleaner.apply(&mut records);
        }
        self.dedup.apply(&mut records, self.cross_page);

        let failed: HashSet<String> = records
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.url.clone())
            .collect();
        let failed_count = records.iter().filter(|r| !r.success).count();
        log::info!(
            "Crawled {} URL(s) in {:.1}s: {} succeeded, {} failed",
            records.len(),
            started.elapsed().as_secs_f64(),
            records.len() - failed_count,
            failed_count
        );
        self.replace_hints(failed).await;
        records
    }

    /// Links on the first admissible copy of `url`, walking the tiers in order.
    pub async fn links(&self, url: &str) -> Result<Vec<Link>> {
        let mut last = None;
        for tier in &self.tiers {
            for attempt in self.run_tier(tier, url).await {
                if attempt.result.success {
                    let result = attempt.result;
                    return Ok(extract_links(&result.final_url, &result.html));
                }
                last = attempt.result.failure;
            }
        }
        let reason = last.unwrap_or(FailureReason::NoStrategy);
        Err(AppError::fetch(url, reason))
    }

    /// Fetch one URL on one tier, with the paid render retry when it applies.
    async fn run_tier(&self, tier: &Tier, url: &str) -> Vec<Attempt> {
        let first = self.attempt(tier, url, false).await;
        let retry = tier.strategy.renders_on_demand()
            && !first.result.success
            && !first.result.rendered
            && first.verdict.as_ref().is_some_and(Verdict::is_challenge);
        if !retry {
            return vec![first];
        }
        log::info!("{} looks like a challenge page, retrying with rendering", url);
        let second = self.attempt(tier, url, true).await;
        vec![first, second]
    }

    async fn attempt(&self, tier: &Tier, url: &str, render_scripts: bool) -> Attempt {
        let kind = tier.kind();
        let started = Instant::now();
        let fetched = tokio::time::timeout(
            tier.timeout,
            tier.strategy.fetch(url, tier.timeout, render_scripts),
        )
        .await;

        let page = match fetched {
            Err(_) => {
                log::warn!("{} timed out on {} tier", url, kind);
                return Attempt {
                    result: FetchResult::failed(url, kind, FailureReason::Timeout, started.elapsed()),
                    verdict: None,
                };
            }
            Ok(Err(e)) => {
                log::warn!("{} failed on {} tier: {}", url, kind, e);
                let reason = match &e {
                    AppError::Http(err) if err.is_timeout() => FailureReason::Timeout,
                    other => FailureReason::Network(other.to_string()),
                };
                return Attempt {
                    result: FetchResult::failed(url, kind, reason, started.elapsed()),
                    verdict: None,
                };
            }
            Ok(Ok(page)) => page,
        };

        if !page.is_success() {
            log::warn!("{} returned HTTP {} on {} tier", url, page.status, kind);
            return Attempt {
                result: FetchResult {
                    url: url.to_string(),
                    final_url: page.final_url,
                    html: page.html,
                    text: String::new(),
                    status: Some(page.status),
                    success: false,
                    failure: Some(FailureReason::Status(page.status)),
                    strategy: kind,
                    rendered: page.rendered,
                    duration: started.elapsed(),
                },
                verdict: None,
            };
        }

        let text = self.extractor.html_to_text(&page.html);
        let verdict = self.classifier.classify(url, &page.html, &text);
        let admissible = match &verdict {
            Verdict::Ok => true,
            Verdict::JsRequired(_) => page.rendered || tier.strategy.renders_scripts(),
            _ => false,
        };
        if !admissible {
            log::info!("{} on {} tier: {}", url, kind, verdict);
        }

        Attempt {
            result: FetchResult {
                url: url.to_string(),
                final_url: page.final_url,
                html: page.html,
                text,
                status: Some(page.status),
                success: admissible,
                failure: if admissible { None } else { verdict.failure_reason() },
                strategy: kind,
                rendered: page.rendered,
                duration: started.elapsed(),
            },
            verdict: Some(verdict),
        }
    }
}

fn finalize_slot(slot: Slot) -> PageRecord {
    if let Some(record) = slot.record {
        return record;
    }
    if let Some(fallback) = slot.fallback {
        log::info!(
            "{} kept from {} tier although it looks script-rendered",
            fallback.url,
            fallback.strategy
        );
        return PageRecord::from_success(fallback, slot.attempts);
    }
    let reason = slot
        .last
        .as_ref()
        .and_then(|r| r.failure.clone())
        .unwrap_or(FailureReason::NoStrategy);
    PageRecord::from_failure(slot.request.url, slot.last.as_ref(), reason, slot.attempts)
}
