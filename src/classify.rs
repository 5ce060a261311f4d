// src/classify.rs

//! Admissibility classifier.
//!
//! Decides whether a fetched page is usable or must be escalated to the next
//! tier. Every signal is data from [`ClassifierConfig`]: phrase families,
//! markup markers and ratio thresholds. The checks are heuristics, cheap enough
//! to run on every attempt, and a misclassification only costs one escalation.

use std::fmt;

use regex::{RegexSet, RegexSetBuilder};

use crate::error::{AppError, Result};
use crate::extract::visible_text_len;
use crate::models::{ClassifierConfig, FailureReason};

/// Why a page was judged blocked.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockCause {
    /// Extracted text contains a wall phrase
    Phrase { family: String, phrase: String },
    /// Raw HTML carries challenge-page markup
    ChallengeMarkup(String),
    /// Almost no text relative to the markup size
    LowVisibleRatio(f64),
}

/// Why a page looks client-side rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsSignal {
    SpaMarker(String),
    NoscriptWarning(String),
    LittleVisibleText(usize),
}

/// Classification of one fetched page.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Ok,
    Blocked(BlockCause),
    Empty { chars: usize },
    JsRequired(JsSignal),
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// A challenge page or script shell, which a rendering fetch may get past.
    pub fn is_challenge(&self) -> bool {
        matches!(
            self,
            Self::Blocked(BlockCause::Phrase { .. } | BlockCause::ChallengeMarkup(_))
                | Self::JsRequired(_)
        )
    }

    /// Failure reason to carry forward, `None` for [`Verdict::Ok`].
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Ok => None,
            Self::Empty { .. } => Some(FailureReason::Empty),
            Self::Blocked(cause) => Some(FailureReason::Blocked(cause.to_string())),
            Self::JsRequired(signal) => Some(FailureReason::JsRequired(signal.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Blocked(_) => "blocked",
            Self::Empty { .. } => "empty",
            Self::JsRequired(_) => "js_required",
        }
    }
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phrase { family, phrase } => write!(f, "{family} phrase \"{phrase}\""),
            Self::ChallengeMarkup(marker) => write!(f, "challenge markup \"{marker}\""),
            Self::LowVisibleRatio(ratio) => {
                write!(f, "visible content ratio {:.2}%", ratio * 100.0)
            }
        }
    }
}

impl fmt::Display for JsSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpaMarker(marker) => write!(f, "framework marker \"{marker}\""),
            Self::NoscriptWarning(warning) => write!(f, "noscript warning \"{warning}\""),
            Self::LittleVisibleText(chars) => write!(f, "{chars} visible characters"),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Empty { chars } => write!(f, "empty ({chars} chars)"),
            Self::Blocked(cause) => write!(f, "blocked ({cause})"),
            Self::JsRequired(signal) => write!(f, "js_required ({signal})"),
        }
    }
}

/// Phrase-list and ratio based admissibility check.
#[derive(Debug, Clone)]
pub struct Classifier {
    phrases: RegexSet,
    /// (family, phrase) per pattern index of `phrases`
    labels: Vec<(String, String)>,
    challenge_markers: Vec<String>,
    spa_markers: Vec<String>,
    noscript_warnings: Vec<String>,
    min_text_chars: usize,
    min_visible_ratio: f64,
    js_min_visible_chars: usize,
}

impl Classifier {
    /// Compile a classifier from configuration.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let labels: Vec<(String, String)> = config
            .block_phrases
            .iter()
            .flat_map(|family| {
                family
                    .phrases
                    .iter()
                    .filter(|p| !p.trim().is_empty())
                    .map(move |p| (family.name.clone(), p.trim().to_string()))
            })
            .collect();

        let phrases = RegexSetBuilder::new(labels.iter().map(|(_, p)| regex::escape(p)))
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::config(format!("classifier phrases: {e}")))?;

        let lower = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Ok(Self {
            phrases,
            labels,
            challenge_markers: lower(&config.challenge_html_markers),
            spa_markers: lower(&config.spa_markers),
            noscript_warnings: lower(&config.noscript_warnings),
            min_text_chars: config.min_text_chars,
            min_visible_ratio: config.min_visible_ratio,
            js_min_visible_chars: config.js_min_visible_chars,
        })
    }

    /// Classify a fetched page from its raw HTML and extracted text.
    ///
    /// Order: wall phrases and challenge markup, then minimum length, then the
    /// visible-content ratio, then client-side rendering signals.
    pub fn classify(&self, url: &str, html: &str, text: &str) -> Verdict {
        let verdict = self.evaluate(html, text);
        if !verdict.is_ok() {
            log::debug!("{url}: {verdict}");
        }
        verdict
    }

    fn evaluate(&self, html: &str, text: &str) -> Verdict {
        if let Some(index) = self.phrases.matches(text).iter().next() {
            let (family, phrase) = &self.labels[index];
            return Verdict::Blocked(BlockCause::Phrase {
                family: family.clone(),
                phrase: phrase.clone(),
            });
        }

        let html_lower = html.to_lowercase();
        if let Some(marker) = self
            .challenge_markers
            .iter()
            .find(|m| html_lower.contains(m.as_str()))
        {
            return Verdict::Blocked(BlockCause::ChallengeMarkup(marker.clone()));
        }

        let chars = text.trim().chars().count();
        if chars < self.min_text_chars {
            return Verdict::Empty { chars };
        }

        let html_chars = html.chars().count();
        if html_chars > 0 {
            let ratio = chars as f64 / html_chars as f64;
            if ratio < self.min_visible_ratio {
                return Verdict::Blocked(BlockCause::LowVisibleRatio(ratio));
            }
        }

        if let Some(marker) = self
            .spa_markers
            .iter()
            .find(|m| html_lower.contains(m.as_str()))
        {
            return Verdict::JsRequired(JsSignal::SpaMarker(marker.clone()));
        }

        if html_lower.contains("<noscript") {
            if let Some(warning) = self
                .noscript_warnings
                .iter()
                .find(|w| html_lower.contains(w.as_str()))
            {
                return Verdict::JsRequired(JsSignal::NoscriptWarning(warning.clone()));
            }
        }

        let visible = visible_text_len(html);
        if visible < self.js_min_visible_chars {
            return Verdict::JsRequired(JsSignal::LittleVisibleText(visible));
        }

        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::html_to_text;
    use crate::models::PhraseFamily;

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierConfig::default()).unwrap()
    }

    fn article(paragraph_count: usize) -> String {
        let body: String = (0..paragraph_count)
            .map(|i| {
                format!(
                    "<p>Paragraph {i} describes the quarterly numbers of the company in some detail.</p>"
                )
            })
            .collect();
        format!("<html><head><title>t</title></head><body>{body}</body></html>")
    }

    fn verdict(html: &str) -> Verdict {
        classifier().classify("https://example.test", html, &html_to_text(html))
    }

    #[test]
    fn test_plain_article_is_ok() {
        assert_eq!(verdict(&article(10)), Verdict::Ok);
    }

    #[test]
    fn test_short_text_is_empty() {
        let html = "<html><body><p>Hello there.</p></body></html>";
        assert_eq!(verdict(html), Verdict::Empty { chars: 12 });
    }

    #[test]
    fn test_huge_shell_with_little_text_is_blocked() {
        let text = "x".repeat(300);
        let prefix = format!("<html><body><p>{text}</p><script>");
        let suffix = "</script></body></html>";
        let padding = "y".repeat(50_000 - prefix.len() - suffix.len());
        let html = format!("{prefix}{padding}{suffix}");
        assert_eq!(html.len(), 50_000);

        let extracted = html_to_text(&html);
        assert_eq!(extracted.chars().count(), 300);
        match classifier().classify("https://example.test", &html, &extracted) {
            Verdict::Blocked(BlockCause::LowVisibleRatio(ratio)) => {
                assert!((ratio - 0.006).abs() < 1e-9);
            }
            other => panic!("expected low ratio block, got {other:?}"),
        }
    }

    #[test]
    fn test_wall_phrase_is_blocked_case_insensitively() {
        let html = "<html><body><h1>Just a moment...</h1><p>Checking Your Browser before accessing the site.</p></body></html>";
        let v = verdict(html);
        assert!(matches!(
            v,
            Verdict::Blocked(BlockCause::Phrase { ref family, .. }) if family == "browser_challenge"
        ));
        assert!(v.is_challenge());
    }

    #[test]
    fn test_challenge_markup_blocks_even_short_pages() {
        let html = "<html><head><title>Access Denied</title></head><body></body></html>";
        assert_eq!(
            verdict(html),
            Verdict::Blocked(BlockCause::ChallengeMarkup("<title>access denied".into()))
        );
    }

    #[test]
    fn test_spa_marker_requires_scripts() {
        let html = article(10).replace("<body>", "<body><div id=\"__next\"></div>");
        let v = verdict(&html);
        assert_eq!(v, Verdict::JsRequired(JsSignal::SpaMarker("id=\"__next\"".into())));
        assert!(v.failure_reason().is_some_and(|r| r.is_soft()));
    }

    #[test]
    fn test_noscript_warning_requires_scripts() {
        let html = article(10).replace(
            "<body>",
            "<body><noscript>This site requires JavaScript to work.</noscript>",
        );
        assert_eq!(
            verdict(&html),
            Verdict::JsRequired(JsSignal::NoscriptWarning("requires javascript".into()))
        );
    }

    #[test]
    fn test_phrase_families_are_configurable() {
        let config = ClassifierConfig {
            block_phrases: vec![PhraseFamily {
                name: "paywall".into(),
                phrases: vec!["Subscribe to continue".into()],
            }],
            ..ClassifierConfig::default()
        };
        let classifier = Classifier::new(&config).unwrap();
        let html = article(10).replace("<body>", "<body><p>subscribe to continue reading</p>");
        let v = classifier.classify("https://example.test", &html, &html_to_text(&html));
        assert!(matches!(
            v,
            Verdict::Blocked(BlockCause::Phrase { ref family, .. }) if family == "paywall"
        ));
    }
}
