// src/dispatch/dispatcher.rs

//! Budget-aware tool dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::dispatch::providers::{
    MarkdownRenderer, PageSource, ResultRenderer, SearchProvider, SpecialistProvider, dedupe_hits,
};
use crate::dispatch::session::{BudgetSnapshot, Session, SessionState, TerminationReason};
use crate::dispatch::tool::{ToolCall, ToolKind};
use crate::error::{AppError, Result};
use crate::extract::Link;
use crate::models::{Budget, PageRecord, Resource, SessionConfig};
use crate::pipeline::Orchestrator;
use crate::ratelimit::{Reservation, TokenRateLimiter};

/// Characters of extracted text per evidence token.
const CHARS_PER_TOKEN: u64 = 4;

/// What one dispatch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The tool ran and its cost is charged
    Executed { tool: ToolKind, content: String },
    /// The tool failed; its cost is still charged and the session goes on
    Failed { tool: ToolKind, error: String },
    /// Unusable call (unknown tool, no arguments, unavailable tool); nothing charged
    Rejected { error: String },
    /// Explicit stop requested by the reasoning process
    Finalizing { reasoning: String },
    /// The session can no longer dispatch; synthesis must follow
    Stopped { reason: TerminationReason },
}

impl Outcome {
    /// Whether the caller must switch to synthesis.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalizing { .. } | Self::Stopped { .. })
    }

    /// Text handed back to the reasoning process as the tool result.
    pub fn message(&self) -> String {
        match self {
            Self::Executed { content, .. } => content.clone(),
            Self::Failed { tool, error } => format!("Error: {tool} failed: {error}"),
            Self::Rejected { error } => format!("Error: {error}"),
            Self::Finalizing { .. } => "Research finalized.".to_string(),
            Self::Stopped { reason } => format!("Session stopped: {reason}"),
        }
    }
}

impl From<SessionState> for Outcome {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Finalizing => Self::Stopped {
                reason: TerminationReason::AgentFinalized,
            },
            SessionState::Exhausted { reason } => Self::Stopped { reason },
            SessionState::Active => Self::Rejected {
                error: "session is still active".to_string(),
            },
        }
    }
}

/// Result of running a tool: content and the evidence it brought in.
struct Executed {
    content: String,
    evidence_chars: u64,
}

/// Runs tool calls for one session against its budget.
pub struct Dispatcher {
    session: Session,
    pages: Arc<dyn PageSource>,
    search: Option<Arc<dyn SearchProvider>>,
    specialist: Option<Arc<dyn SpecialistProvider>>,
    renderer: Arc<dyn ResultRenderer>,
    token_limiter: Option<TokenRateLimiter>,
    model_call_tokens: u64,
    token_max_wait: Duration,
    search_result_count: usize,
    search_locale: String,
    /// Serializes budget check and charge across in-flight calls
    admission: Mutex<()>,
}

impl Dispatcher {
    pub fn new(session: Session, pages: Arc<dyn PageSource>) -> Self {
        Self {
            session,
            pages,
            search: None,
            specialist: None,
            renderer: Arc::new(MarkdownRenderer),
            token_limiter: None,
            model_call_tokens: 0,
            token_max_wait: Duration::ZERO,
            search_result_count: 10,
            search_locale: "us".to_string(),
            admission: Mutex::new(()),
        }
    }

    /// Session from configuration; `budget` overrides the configured default.
    pub fn from_config(
        config: &SessionConfig,
        budget: Option<Budget>,
        pages: Arc<dyn PageSource>,
    ) -> Self {
        let session = Session::new(budget.unwrap_or(config.budget), config.max_iterations);
        let mut dispatcher = Self::new(session, pages);
        dispatcher.model_call_tokens = config.model_call_token_estimate;
        dispatcher.search_result_count = config.search_result_count;
        dispatcher.search_locale = config.search_locale.clone();
        dispatcher
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_specialist(mut self, specialist: Arc<dyn SpecialistProvider>) -> Self {
        self.specialist = Some(specialist);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ResultRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Reserve `tokens_per_call` on `limiter` before each model-backed tool.
    pub fn with_token_limiter(
        mut self,
        limiter: TokenRateLimiter,
        tokens_per_call: u64,
        max_wait: Duration,
    ) -> Self {
        self.token_limiter = Some(limiter);
        self.model_call_tokens = tokens_per_call;
        self.token_max_wait = max_wait;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.session.snapshot()
    }

    /// Dispatch one tool call requested by the reasoning process.
    pub async fn dispatch(&self, name: &str, args: &Value) -> Outcome {
        let state = self.session.state();
        if !state.is_active() {
            return state.into();
        }
        if let Some(reason) = self.session.check_guards() {
            return self.session.exhaust(reason).into();
        }
        let iteration = self.session.count_iteration();

        let call = match ToolCall::parse(name, args) {
            Ok(call) => call,
            Err(e) => {
                log::warn!("Rejected tool call {} (iteration {}): {}", name, iteration, e);
                return Outcome::Rejected {
                    error: e.to_string(),
                };
            }
        };
        let kind = call.kind();

        if let ToolCall::Finalize { reasoning } = &call {
            self.session.terminate(SessionState::Finalizing);
            return Outcome::Finalizing {
                reasoning: reasoning.clone(),
            };
        }
        if let Err(e) = self.ensure_available(kind) {
            return Outcome::Rejected {
                error: e.to_string(),
            };
        }

        let cost = call.cost();
        {
            let _admission = self.admission.lock().await;
            let state = self.session.state();
            if !state.is_active() {
                return state.into();
            }
            if let Some(resource) = self.session.over_budget(&cost) {
                if self.session.budget().ceiling(resource) == 0 {
                    return Outcome::Rejected {
                        error: format!("{kind} is not in this session's budget"),
                    };
                }
                return self
                    .session
                    .exhaust(TerminationReason::BudgetExhausted(resource))
                    .into();
            }
            for (resource, amount) in &cost {
                self.session.charge(*resource, *amount);
            }
        }
        log::info!("Dispatching {} (iteration {})", kind, iteration);

        if kind.uses_model() {
            self.reserve_model_tokens(kind).await;
        }

        let outcome = match self.execute(&call).await {
            Ok(executed) => {
                self.session.charge(
                    Resource::EvidenceTokens,
                    executed.evidence_chars / CHARS_PER_TOKEN,
                );
                Outcome::Executed {
                    tool: kind,
                    content: executed.content,
                }
            }
            Err(e) => {
                log::warn!("{} failed: {}", kind, e);
                Outcome::Failed {
                    tool: kind,
                    error: e.to_string(),
                }
            }
        };

        if let Some(resource) = self.session.reached_ceiling() {
            self.session
                .exhaust(TerminationReason::BudgetExhausted(resource));
        }
        log::info!("{}", self.session.snapshot());
        outcome
    }

    fn ensure_available(&self, kind: ToolKind) -> Result<()> {
        let available = match kind {
            ToolKind::Search => self.search.is_some(),
            ToolKind::AiOverview | ToolKind::Pdf | ToolKind::AdIntelligence => {
                self.specialist.is_some()
            }
            ToolKind::Crawl | ToolKind::ExtractLinks | ToolKind::Finalize => true,
        };
        if available {
            Ok(())
        } else {
            Err(AppError::tool(kind.as_str(), "no provider configured"))
        }
    }

    async fn reserve_model_tokens(&self, kind: ToolKind) {
        let Some(limiter) = &self.token_limiter else {
            return;
        };
        match limiter
            .reserve(self.model_call_tokens, self.token_max_wait)
            .await
        {
            Reservation::TimedOut { usage } => log::warn!(
                "Token quota still full after {:?} ({} of {} used), running {} anyway",
                self.token_max_wait,
                usage,
                limiter.capacity(),
                kind
            ),
            reservation => log::debug!("{} token reservation: {:?}", kind, reservation),
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<Executed> {
        match call {
            ToolCall::Search { queries } => self.run_search(queries).await,
            ToolCall::Crawl { urls } => {
                let records = self.pages.crawl(urls).await;
                let evidence_chars = records
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.metadata.content_length as u64)
                    .sum();
                Ok(Executed {
                    content: self.renderer.render_pages(&records)?,
                    evidence_chars,
                })
            }
            ToolCall::ExtractLinks { url } => {
                let links = self.pages.links(url).await?;
                Ok(Executed {
                    content: self.renderer.render_links(&links)?,
                    evidence_chars: 0,
                })
            }
            ToolCall::AiOverview { query } => {
                let specialist = self.specialist()?;
                let content = specialist.ai_overview(query, &self.search_locale).await?;
                Ok(plain(content))
            }
            ToolCall::Pdf { url, query } => {
                let content = self.specialist()?.pdf(url, query).await?;
                Ok(plain(content))
            }
            ToolCall::AdIntelligence { domain, region } => {
                let content = self
                    .specialist()?
                    .ad_intelligence(domain, region.as_deref())
                    .await?;
                Ok(plain(content))
            }
            ToolCall::Finalize { .. } => Ok(plain(String::new())),
        }
    }

    fn specialist(&self) -> Result<&Arc<dyn SpecialistProvider>> {
        self.specialist
            .as_ref()
            .ok_or_else(|| AppError::tool("specialist", "no provider configured"))
    }

    async fn run_search(&self, queries: &[String]) -> Result<Executed> {
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| AppError::tool("search", "no provider configured"))?;
        let count = self.search_result_count;
        let locale = self.search_locale.as_str();

        let results: Vec<(String, Result<_>)> = stream::iter(queries.iter().cloned())
            .map(|query| async move {
                let hits = search.search(&query, count, locale).await;
                (query, hits)
            })
            .buffered(queries.len().max(1))
            .collect()
            .await;

        let mut groups = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (query, hits) in results {
            match hits {
                Ok(hits) => groups.push((query, hits)),
                Err(e) => {
                    log::warn!("Search for {:?} failed: {}", query, e);
                    first_error.get_or_insert(e);
                    groups.push((query, Vec::new()));
                }
            }
        }
        if let Some(e) = first_error {
            if groups.iter().all(|(_, hits)| hits.is_empty()) {
                return Err(e);
            }
        }
        Ok(plain(self.renderer.render_search(&dedupe_hits(groups))))
    }
}

fn plain(content: String) -> Executed {
    Executed {
        content,
        evidence_chars: 0,
    }
}

#[async_trait]
impl PageSource for Orchestrator {
    async fn crawl(&self, urls: &[String]) -> Vec<PageRecord> {
        Orchestrator::crawl(self, urls).await
    }

    async fn links(&self, url: &str) -> Result<Vec<Link>> {
        Orchestrator::links(self, url).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::dispatch::providers::SearchHit;
    use crate::models::{PageMetadata, StrategyKind};
    use crate::ratelimit::{Clock, ManualClock, MemoryCounterStore};

    #[derive(Default)]
    struct FakePages {
        crawled: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl PageSource for FakePages {
        async fn crawl(&self, urls: &[String]) -> Vec<PageRecord> {
            self.crawled.lock().unwrap().extend(urls.iter().cloned());
            urls.iter()
                .map(|url| {
                    let text = "x".repeat(400);
                    PageRecord {
                        url: url.clone(),
                        final_url: url.clone(),
                        success: true,
                        error: None,
                        metadata: PageMetadata {
                            status: Some(200),
                            strategy: Some(StrategyKind::Http),
                            content_length: text.len(),
                            attempts: vec![StrategyKind::Http],
                            js_required: false,
                            failure: None,
                        },
                        text,
                        fetched_at: Utc::now(),
                    }
                })
                .collect()
        }

        async fn links(&self, url: &str) -> Result<Vec<Link>> {
            Err(AppError::fetch(url, "HTTP 503"))
        }
    }

    struct FakeSearch;

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn search(&self, query: &str, _count: usize, _locale: &str) -> Result<Vec<SearchHit>> {
            if query.contains("broken") {
                return Err(AppError::tool("search", "upstream 502"));
            }
            Ok(vec![SearchHit {
                url: "https://acme.test/about".into(),
                title: format!("Acme for {query}"),
                snippet: String::new(),
            }])
        }
    }

    #[derive(Default)]
    struct FakeSpecialist {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpecialistProvider for FakeSpecialist {
        async fn ai_overview(&self, query: &str, _locale: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Overview of {query}"))
        }
    }

    fn dispatcher(budget: Budget) -> (Dispatcher, Arc<FakePages>) {
        let pages = Arc::new(FakePages::default());
        let dispatcher = Dispatcher::new(Session::new(budget, 10), pages.clone())
            .with_search(Arc::new(FakeSearch))
            .with_specialist(Arc::new(FakeSpecialist::default()));
        (dispatcher, pages)
    }

    fn pages_only(pages: u64) -> Budget {
        Budget {
            pages,
            evidence_tokens: 10_000,
            ..Budget::default()
        }
    }

    #[tokio::test]
    async fn test_crawl_calls_stop_once_pages_run_out() {
        let (dispatcher, pages) = dispatcher(pages_only(2));

        for url in ["https://a.test", "https://b.test"] {
            let outcome = dispatcher.dispatch("crawl", &json!({ "urls": [url] })).await;
            assert!(matches!(outcome, Outcome::Executed { tool: ToolKind::Crawl, .. }));
        }
        let third = dispatcher
            .dispatch("crawl", &json!({ "urls": ["https://c.test"] }))
            .await;

        assert_eq!(
            third,
            Outcome::Stopped {
                reason: TerminationReason::BudgetExhausted(Resource::Pages)
            }
        );
        assert_eq!(pages.crawled.lock().unwrap().len(), 2);
        assert_eq!(dispatcher.session().usage(Resource::Pages), 2);
    }

    #[tokio::test]
    async fn test_exhausted_right_after_a_counter_hits_its_ceiling() {
        let (dispatcher, _) = dispatcher(Budget {
            queries: 3,
            ..pages_only(10)
        });
        let used = |d: &Dispatcher| -> Vec<u64> {
            d.snapshot().resources.iter().map(|(_, used, _)| *used).collect()
        };

        let before = used(&dispatcher);
        let outcome = dispatcher
            .dispatch("search", &json!({ "queries": ["acme", "acme jobs"] }))
            .await;
        assert!(matches!(outcome, Outcome::Executed { .. }));
        assert!(dispatcher.state().is_active());
        let after = used(&dispatcher);
        assert!(before.iter().zip(&after).all(|(b, a)| a >= b));

        let outcome = dispatcher.dispatch("search", &json!({ "queries": "acme funding" })).await;
        assert!(matches!(outcome, Outcome::Executed { .. }));
        assert_eq!(
            dispatcher.state(),
            SessionState::Exhausted {
                reason: TerminationReason::BudgetExhausted(Resource::Queries)
            }
        );

        let outcome = dispatcher
            .dispatch("crawl", &json!({ "urls": ["https://a.test"] }))
            .await;
        assert!(outcome.is_terminal());
        assert_eq!(dispatcher.session().usage(Resource::Pages), 0);
    }

    #[tokio::test]
    async fn test_over_budget_call_is_refused_without_charge() {
        let (dispatcher, pages) = dispatcher(pages_only(2));
        let outcome = dispatcher
            .dispatch(
                "crawl",
                &json!({ "urls": ["https://a.test", "https://b.test", "https://c.test"] }),
            )
            .await;
        assert_eq!(
            outcome,
            Outcome::Stopped {
                reason: TerminationReason::BudgetExhausted(Resource::Pages)
            }
        );
        assert!(pages.crawled.lock().unwrap().is_empty());
        assert_eq!(dispatcher.session().usage(Resource::Pages), 0);
    }

    #[tokio::test]
    async fn test_failed_tool_is_charged_and_session_continues() {
        let (dispatcher, _) = dispatcher(pages_only(5));
        let outcome = dispatcher
            .dispatch("extract_links", &json!({ "url": "https://a.test" }))
            .await;

        assert!(matches!(outcome, Outcome::Failed { tool: ToolKind::ExtractLinks, .. }));
        assert!(outcome.message().starts_with("Error: extract_links failed"));
        assert_eq!(dispatcher.session().usage(Resource::Pages), 1);
        assert!(dispatcher.state().is_active());
    }

    #[tokio::test]
    async fn test_malformed_call_is_not_charged() {
        let (dispatcher, _) = dispatcher(pages_only(5));
        let outcome = dispatcher.dispatch("crawl", &json!({ "urls": ["  "] })).await;
        assert!(matches!(outcome, Outcome::Rejected { .. }));

        let outcome = dispatcher.dispatch("teleport", &json!({})).await;
        assert!(matches!(outcome, Outcome::Rejected { .. }));
        assert_eq!(dispatcher.session().usage(Resource::Pages), 0);
        assert!(dispatcher.state().is_active());
    }

    #[tokio::test]
    async fn test_zero_ceiling_tool_is_unavailable_not_exhausting() {
        let (dispatcher, _) = dispatcher(Budget {
            pdf: 0,
            ..pages_only(5)
        });
        let outcome = dispatcher
            .dispatch("pdf", &json!({ "url": "https://a.test/r.pdf", "query": "revenue" }))
            .await;
        assert!(matches!(outcome, Outcome::Rejected { .. }));
        assert!(dispatcher.state().is_active());
    }

    #[tokio::test]
    async fn test_finalize_is_free_and_terminal() {
        let (dispatcher, _) = dispatcher(pages_only(5));
        let outcome = dispatcher
            .dispatch("finalize", &json!({ "reasoning": "enough evidence" }))
            .await;
        assert_eq!(
            outcome,
            Outcome::Finalizing {
                reasoning: "enough evidence".into()
            }
        );
        let next = dispatcher
            .dispatch("crawl", &json!({ "urls": ["https://a.test"] }))
            .await;
        assert_eq!(
            next,
            Outcome::Stopped {
                reason: TerminationReason::AgentFinalized
            }
        );
    }

    #[tokio::test]
    async fn test_iteration_ceiling_stops_the_loop() {
        let pages = Arc::new(FakePages::default());
        let dispatcher = Dispatcher::new(Session::new(pages_only(100), 2), pages);
        for _ in 0..2 {
            dispatcher
                .dispatch("crawl", &json!({ "urls": ["https://a.test"] }))
                .await;
        }
        let outcome = dispatcher
            .dispatch("crawl", &json!({ "urls": ["https://a.test"] }))
            .await;
        assert_eq!(
            outcome,
            Outcome::Stopped {
                reason: TerminationReason::MaxIterations
            }
        );
    }

    #[tokio::test]
    async fn test_crawl_charges_evidence_tokens_from_extracted_text() {
        let (dispatcher, _) = dispatcher(pages_only(5));
        dispatcher
            .dispatch("crawl", &json!({ "urls": ["https://a.test", "https://b.test"] }))
            .await;
        assert_eq!(dispatcher.session().usage(Resource::EvidenceTokens), 200);
    }

    #[tokio::test]
    async fn test_search_results_are_deduplicated_across_queries() {
        let (dispatcher, _) = dispatcher(pages_only(5));
        let outcome = dispatcher
            .dispatch("search", &json!({ "queries": ["acme", "acme team", "broken"] }))
            .await;
        let content = outcome.message();
        assert_eq!(content.matches("https://acme.test/about").count(), 1);
        assert!(content.contains("### Query: acme team"));
        assert_eq!(dispatcher.session().usage(Resource::Queries), 3);
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_overspend() {
        let (dispatcher, _) = dispatcher(pages_only(3));
        let calls = (0..6).map(|i| {
            let args = json!({ "urls": [format!("https://{i}.test")] });
            let dispatcher = &dispatcher;
            async move { dispatcher.dispatch("crawl", &args).await }
        });
        let outcomes = futures::future::join_all(calls).await;

        let executed = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Executed { .. }))
            .count();
        assert_eq!(executed, 3);
        assert_eq!(dispatcher.session().usage(Resource::Pages), 3);
    }

    #[tokio::test]
    async fn test_model_tools_reserve_tokens() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = TokenRateLimiter::new(
            store.clone(),
            clock.clone(),
            "rate:tokens:test",
            10_000,
            Duration::from_secs(60),
        );
        let observer =
            TokenRateLimiter::new(store, clock, "rate:tokens:test", 10_000, Duration::from_secs(60));

        let (dispatcher, _) = dispatcher(pages_only(5));
        let dispatcher = dispatcher.with_token_limiter(limiter, 2_000, Duration::ZERO);
        let outcome = dispatcher
            .dispatch("ai_overview", &json!({ "query": "acme glassdoor rating" }))
            .await;

        assert_eq!(outcome.message(), "Overview of acme glassdoor rating");
        assert_eq!(observer.current_usage().await.unwrap(), 2_000);
        assert_eq!(dispatcher.session().usage(Resource::AiOverviews), 1);
    }
}
