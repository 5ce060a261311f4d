// src/clean.rs

//! Boilerplate line removal.
//!
//! Runs on extracted text before near-duplicate filtering. Markdown links are
//! reduced to their text, bare URLs and images are dropped, then each line is
//! judged on its own: cookie banners, calls to action and legal footers go,
//! as do very short or symbol-heavy lines unless they carry a business keyword
//! or a figure. Surviving lines are regrouped into paragraphs.

use regex::{Regex, RegexSet, RegexSetBuilder};

use crate::error::{AppError, Result};
use crate::models::{CleanConfig, PageRecord};

/// A run of this many identical characters marks a divider or filler line.
const REPEATED_RUN: usize = 6;

/// Lines longer than this stand as their own paragraph.
const STANDALONE_LEN: usize = 150;

/// Config-driven spam and low-value line filter.
#[derive(Debug, Clone)]
pub struct TextCleaner {
    phrases: RegexSet,
    patterns: RegexSet,
    preserve: RegexSet,
    aggressive: bool,
    min_line_chars: usize,
    image: Regex,
    link: Regex,
    bare_url: Regex,
    spaces: Regex,
}

impl TextCleaner {
    pub fn new(config: &CleanConfig) -> Result<Self> {
        let phrases = RegexSetBuilder::new(
            config
                .spam_phrases
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| regex::escape(p.trim())),
        )
        .case_insensitive(true)
        .build()
        .map_err(|e| AppError::config(format!("clean.spam_phrases: {e}")))?;

        let patterns = RegexSetBuilder::new(&config.spam_patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::config(format!("clean.spam_patterns: {e}")))?;

        let preserve = RegexSetBuilder::new(
            config
                .preserve_keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .map(|k| regex::escape(k.trim()))
                .chain([r"\$[\d,]+|\d+(\.\d+)?%|\d+\s*(million|billion|thousand)".to_string()]),
        )
        .case_insensitive(true)
        .build()
        .map_err(|e| AppError::config(format!("clean.preserve_keywords: {e}")))?;

        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::config(format!("clean: {e}")))
        };

        Ok(Self {
            phrases,
            patterns,
            preserve,
            aggressive: config.aggressive,
            min_line_chars: config.min_line_chars,
            image: compile(r"!\[[^\]]*\]\([^)]*\)")?,
            link: compile(r"\[([^\]]+)\]\([^)]*\)")?,
            bare_url: compile(r"https?://\S+")?,
            spaces: compile(r" {2,}")?,
        })
    }

    /// Clean one text. Returns an empty string when nothing survives.
    pub fn clean(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }
        let text = self.image.replace_all(text, "");
        let text = self.link.replace_all(&text, "$1");
        let text = self.bare_url.replace_all(&text, "");

        let mut lines: Vec<String> = Vec::new();
        for line in text.lines() {
            let line = self.spaces.replace_all(line.trim(), " ");
            if line.is_empty() || self.is_spam(&line) || self.is_low_value(&line) {
                continue;
            }
            if lines.last().is_some_and(|prev| *prev == line) {
                continue;
            }
            lines.push(line.into_owned());
        }
        regroup(lines).join("\n\n")
    }

    /// Clean the text of every successful record.
    pub fn apply(&self, records: &mut [PageRecord]) {
        for record in records.iter_mut().filter(|r| r.success) {
            let before = record.text.chars().count();
            let text = self.clean(&record.text);
            let after = text.chars().count();
            if after < before {
                log::debug!(
                    "Cleaned {}: {} -> {} chars",
                    record.url,
                    before,
                    after
                );
            }
            record.set_text(text);
        }
    }

    fn is_spam(&self, line: &str) -> bool {
        if self.patterns.is_match(line) {
            return true;
        }
        let hits = self.phrases.matches(line).iter().count();
        if self.aggressive { hits > 0 } else { hits > 1 }
    }

    fn is_low_value(&self, line: &str) -> bool {
        let chars = line.chars().count();
        let wordy = line
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .count();
        let weak = chars < self.min_line_chars || wordy * 2 < chars || has_repeated_run(line);
        weak && !self.preserve.is_match(line)
    }
}

fn has_repeated_run(line: &str) -> bool {
    let mut run = 0;
    let mut prev = None;
    for c in line.chars() {
        if Some(c) == prev {
            run += 1;
            if run >= REPEATED_RUN {
                return true;
            }
        } else {
            run = 1;
            prev = Some(c);
        }
    }
    false
}

/// Sentences, headings and long lines stand alone; fragments in between are
/// joined into one paragraph.
fn regroup(lines: Vec<String>) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut fragments: Vec<String> = Vec::new();
    for line in lines {
        let standalone = line.ends_with(['.', '!', '?'])
            || line.starts_with('#')
            || line.chars().count() > STANDALONE_LEN;
        if !standalone {
            fragments.push(line);
            continue;
        }
        if !fragments.is_empty() {
            paragraphs.push(fragments.join(" "));
            fragments.clear();
        }
        paragraphs.push(line);
    }
    if !fragments.is_empty() {
        paragraphs.push(fragments.join(" "));
    }
    paragraphs
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{FailureReason, FetchResult, StrategyKind};

    fn cleaner() -> TextCleaner {
        TextCleaner::new(&CleanConfig::default()).unwrap()
    }

    #[test]
    fn test_cookie_banner_and_cta_lines_are_dropped() {
        let text = "Acme builds warehouse robots for mid-sized retailers.\n\n\
                    We use cookies to improve your experience on our site.\n\n\
                    Click here to book a demo\n\n\
                    © 2024 Acme Robotics. All rights reserved.\n\n\
                    The robots pick and pack orders without changes to shelving.";
        assert_eq!(
            cleaner().clean(text),
            "Acme builds warehouse robots for mid-sized retailers.\n\n\
             The robots pick and pack orders without changes to shelving."
        );
    }

    #[test]
    fn test_links_keep_their_text_and_urls_vanish() {
        let text = "Read the [annual report](https://acme.test/report.pdf) for details.\n\
                    ![logo](https://acme.test/logo.png)\n\
                    Full filing at https://sec.test/acme today.";
        assert_eq!(
            cleaner().clean(text),
            "Read the annual report for details.\n\nFull filing at today."
        );
    }

    #[test]
    fn test_short_lines_survive_only_with_figures_or_keywords() {
        let text = "Menu\n$4.2M\n40% growth\nCEO\n------------\n|| >> ||";
        assert_eq!(cleaner().clean(text), "$4.2M 40% growth CEO");
    }

    #[test]
    fn test_repeated_lines_collapse() {
        let text = "Trusted by retailers across Europe\nTrusted by retailers across Europe\nShips in two days.";
        assert_eq!(
            cleaner().clean(text),
            "Trusted by retailers across Europe\n\nShips in two days."
        );
    }

    #[test]
    fn test_fragments_join_until_a_sentence_ends() {
        let text = "# Products\nPicking arm\nPacking cell\nBoth ship with a three year warranty.";
        assert_eq!(
            cleaner().clean(text),
            "# Products\n\nPicking arm Packing cell\n\nBoth ship with a three year warranty."
        );
    }

    #[test]
    fn test_conservative_mode_needs_two_phrases() {
        let config = CleanConfig {
            aggressive: false,
            ..CleanConfig::default()
        };
        let cleaner = TextCleaner::new(&config).unwrap();
        let text = "Our privacy policy explains what we store about buyers.\n\
                    Read our privacy policy and terms of service before ordering.";
        assert_eq!(
            cleaner.clean(text),
            "Our privacy policy explains what we store about buyers."
        );
    }

    #[test]
    fn test_invalid_pattern_is_a_config_error() {
        let config = CleanConfig {
            spam_patterns: vec!["(unclosed".into()],
            ..CleanConfig::default()
        };
        assert!(matches!(TextCleaner::new(&config), Err(AppError::Config(_))));
    }

    #[test]
    fn test_apply_skips_failed_records() {
        let page = FetchResult {
            url: "https://acme.test/".into(),
            final_url: "https://acme.test/".into(),
            html: String::new(),
            text: "Acme ships robots.\n\nAccept all".into(),
            status: Some(200),
            success: true,
            failure: None,
            strategy: StrategyKind::Http,
            rendered: false,
            duration: Duration::ZERO,
        };
        let mut failed = PageRecord::from_failure(
            "https://down.test/",
            None,
            FailureReason::Timeout,
            vec![StrategyKind::Http],
        );
        failed.text = "Accept all".into();
        let mut records = vec![
            PageRecord::from_success(page, vec![StrategyKind::Http]),
            failed,
        ];

        cleaner().apply(&mut records);
        assert_eq!(records[0].text, "Acme ships robots.");
        assert_eq!(records[0].metadata.content_length, 18);
        assert_eq!(records[1].text, "Accept all");
    }
}
