// src/dedup.rs

//! Near-duplicate paragraph filter.
//!
//! Paragraphs are fingerprinted with a 64-bit simhash over character shingles
//! of their normalized text. Within a page the longer of two near-duplicates
//! survives in the earlier slot; across pages the first occurrence wins.

use std::fmt;

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::models::{DedupConfig, PageRecord};

/// Fingerprint width in bits.
pub const FINGERPRINT_BITS: u32 = 64;

const SHINGLE_LEN: usize = 4;

/// Locality-sensitive fingerprint of one paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Fingerprint a paragraph after normalization.
    pub fn of(paragraph: &str) -> Self {
        simhash(&normalize(paragraph))
    }

    pub fn distance(self, other: Self) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// `1 - distance / width`.
    pub fn similarity(self, other: Self) -> f64 {
        1.0 - f64::from(self.distance(other)) / f64::from(FINGERPRINT_BITS)
    }

    /// Inclusive threshold comparison.
    pub fn is_near(self, other: Self, threshold: f64) -> bool {
        self.similarity(other) >= threshold
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

/// A fingerprint together with the page that owns the paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParagraphFingerprint {
    pub fingerprint: Fingerprint,
    pub url: String,
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn simhash(normalized: &str) -> Fingerprint {
    let graphemes: Vec<&str> = normalized.graphemes(true).collect();
    let mut weights = [0i64; FINGERPRINT_BITS as usize];

    let mut add = |shingle: &str| {
        let digest = Sha256::digest(shingle.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let hash = u64::from_be_bytes(head);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if hash >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    };

    if graphemes.len() < SHINGLE_LEN {
        add(normalized);
    } else {
        for window in graphemes.windows(SHINGLE_LEN) {
            add(&window.concat());
        }
    }

    let bits = weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w > 0)
        .fold(0u64, |acc, (bit, _)| acc | 1 << bit);
    Fingerprint(bits)
}

/// Split on blank lines into trimmed, non-empty paragraphs.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n").trim().to_string());
    }
    paragraphs
}

struct Slot {
    text: String,
    fingerprint: Option<Fingerprint>,
}

/// Intra-page and cross-page paragraph deduplication.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    threshold: f64,
    min_paragraph_len: usize,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(0.85, 50)
    }
}

impl Deduplicator {
    pub fn new(threshold: f64, min_paragraph_len: usize) -> Self {
        Self {
            threshold,
            min_paragraph_len,
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.threshold, config.min_paragraph_len)
    }

    fn fingerprintable(&self, paragraph: &str) -> bool {
        paragraph.chars().count() >= self.min_paragraph_len
    }

    /// Remove near-duplicate paragraphs within one text.
    ///
    /// Applied until the output stops changing, so the result is a fixed point
    /// and a second call returns it unchanged.
    pub fn dedupe(&self, text: &str) -> String {
        let mut paragraphs = split_paragraphs(text);
        loop {
            let before = paragraphs.len();
            paragraphs = self.dedupe_pass(paragraphs);
            if paragraphs.len() == before {
                return paragraphs.join("\n\n");
            }
        }
    }

    fn dedupe_pass(&self, paragraphs: Vec<String>) -> Vec<String> {
        let mut slots: Vec<Slot> = Vec::with_capacity(paragraphs.len());

        for paragraph in paragraphs {
            if !self.fingerprintable(&paragraph) {
                slots.push(Slot {
                    text: paragraph,
                    fingerprint: None,
                });
                continue;
            }

            let fingerprint = Fingerprint::of(&paragraph);
            let earlier = slots.iter_mut().find(|slot| {
                slot.fingerprint
                    .is_some_and(|seen| seen.is_near(fingerprint, self.threshold))
            });

            match earlier {
                Some(slot) => {
                    if paragraph.chars().count() > slot.text.chars().count() {
                        slot.text = paragraph;
                        slot.fingerprint = Some(fingerprint);
                    }
                }
                None => slots.push(Slot {
                    text: paragraph,
                    fingerprint: Some(fingerprint),
                }),
            }
        }

        slots.into_iter().map(|slot| slot.text).collect()
    }

    /// Remove paragraphs already seen on an earlier page.
    ///
    /// `pages` are `(url, text)` pairs in caller order; the first occurrence
    /// always wins and earlier pages are never modified. Short paragraphs are
    /// fingerprinted too.
    pub fn dedupe_across_pages(&self, pages: &[(String, String)]) -> Vec<String> {
        let mut pool: Vec<ParagraphFingerprint> = Vec::new();
        let mut output = Vec::with_capacity(pages.len());

        for (url, text) in pages {
            let mut kept = Vec::new();
            let mut added = Vec::new();

            for paragraph in split_paragraphs(text) {
                let fingerprint = Fingerprint::of(&paragraph);
                if let Some(owner) = pool
                    .iter()
                    .find(|seen| seen.fingerprint.is_near(fingerprint, self.threshold))
                {
                    log::debug!(
                        "Dropping paragraph {} from {} (first seen on {})",
                        fingerprint,
                        url,
                        owner.url
                    );
                    continue;
                }
                added.push(ParagraphFingerprint {
                    fingerprint,
                    url: url.clone(),
                });
                kept.push(paragraph);
            }

            pool.extend(added);
            output.push(kept.join("\n\n"));
        }
        output
    }

    /// Intra-page dedupe each successful record, then cross-page in order.
    pub fn apply(&self, records: &mut [PageRecord], cross_page: bool) {
        for record in records.iter_mut().filter(|r| r.success) {
            let text = self.dedupe(&record.text);
            record.set_text(text);
        }
        if !cross_page {
            return;
        }

        let pages: Vec<(String, String)> = records
            .iter()
            .filter(|r| r.success)
            .map(|r| (r.url.clone(), r.text.clone()))
            .collect();
        let deduped = self.dedupe_across_pages(&pages);
        for (record, text) in records.iter_mut().filter(|r| r.success).zip(deduped) {
            record.set_text(text);
        }
    }
}
