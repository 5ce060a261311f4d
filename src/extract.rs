// src/extract.rs

//! HTML to plain text and link extraction.
//!
//! Text is emitted as one paragraph per block element, paragraphs separated by
//! a blank line, which is the unit the near-duplicate filter works on.

use std::collections::HashSet;

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

/// Subtrees that never contribute visible text.
const INVISIBLE_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "head", "object", "canvas",
];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "blockquote", "pre", "li", "ul", "ol",
    "dl", "dt", "dd", "table", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6", "br", "hr",
    "figure", "figcaption", "form", "fieldset", "address", "details", "summary",
];

/// Link targets that are never worth following.
const JUNK_LINK_PATTERNS: &[&str] = &[
    "/privacy", "/terms", "/cookie", "/legal", "/login", "/signin", "/signup", "/register",
];

const JUNK_LINK_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "#"];

/// Converts HTML into paragraph-separated text.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    exclude: HashSet<String>,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(&["nav", "footer", "aside"])
    }
}

impl TextExtractor {
    /// Create an extractor dropping the given boilerplate containers.
    pub fn new<S: AsRef<str>>(exclude_tags: &[S]) -> Self {
        Self {
            exclude: exclude_tags
                .iter()
                .map(|t| t.as_ref().trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Extract readable text, one paragraph per block element.
    pub fn html_to_text(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let mut collector = Collector::default();
        collector.walk(document.root_element(), &|name: &str| self.exclude.contains(name));
        collector.finish()
    }
}

/// Extract text with the default boilerplate exclusions.
pub fn html_to_text(html: &str) -> String {
    TextExtractor::default().html_to_text(html)
}

/// Count visible characters with only non-visible subtrees removed.
pub fn visible_text_len(html: &str) -> usize {
    let document = Html::parse_document(html);
    let mut collector = Collector::default();
    collector.walk(document.root_element(), &|_: &str| false);
    collector
        .finish()
        .chars()
        .filter(|c| !c.is_whitespace())
        .count()
}

#[derive(Default)]
struct Collector {
    paragraphs: Vec<String>,
    current: String,
    prefix: Option<String>,
}

impl Collector {
    fn walk(&mut self, element: ElementRef<'_>, excluded: &dyn Fn(&str) -> bool) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    self.current.push_str(text);
                    self.current.push(' ');
                }
                Node::Element(el) => {
                    let name = el.name();
                    if INVISIBLE_TAGS.contains(&name) || excluded(name) {
                        continue;
                    }
                    let Some(child_ref) = ElementRef::wrap(child) else {
                        continue;
                    };
                    if BLOCK_TAGS.contains(&name) {
                        self.flush();
                        self.prefix = block_prefix(name);
                        self.walk(child_ref, excluded);
                        self.flush();
                    } else {
                        self.walk(child_ref, excluded);
                    }
                }
                _ => {}
            }
        }
    }

    fn flush(&mut self) {
        let collapsed = self.current.split_whitespace().collect::<Vec<_>>().join(" ");
        self.current.clear();
        let prefix = self.prefix.take();
        if collapsed.is_empty() {
            return;
        }
        match prefix {
            Some(prefix) => self.paragraphs.push(format!("{prefix}{collapsed}")),
            None => self.paragraphs.push(collapsed),
        }
    }

    fn finish(mut self) -> String {
        self.flush();
        self.paragraphs.join("\n\n")
    }
}

fn block_prefix(tag: &str) -> Option<String> {
    match tag {
        "li" => Some("- ".to_string()),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag[1..].parse::<usize>().unwrap_or(1);
            Some(format!("{} ", "#".repeat(level)))
        }
        _ => None,
    }
}

/// A link discovered on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub text: String,
    /// Same host as the page it was found on
    pub internal: bool,
}

/// Collect absolute, fragment-free, de-duplicated links, skipping junk.
pub fn extract_links(base_url: &str, html: &str) -> Vec<Link> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || is_junk_link(href) {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        if is_junk_link(resolved.path()) {
            continue;
        }

        let url = resolved.to_string();
        if !seen.insert(url.clone()) {
            continue;
        }
        let text = anchor
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        links.push(Link {
            internal: resolved.host_str() == base.host_str(),
            url,
            text,
        });
    }
    links
}

fn is_junk_link(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    JUNK_LINK_SCHEMES.iter().any(|s| lower.starts_with(s))
        || JUNK_LINK_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html>
          <head><title>Ignored title</title><style>p { color: red; }</style></head>
          <body>
            <nav><a href="/">Home</a> <a href="/about">About</a></nav>
            <h2>Quarterly   results</h2>
            <p>Revenue grew <b>12%</b> year over year.</p>
            <ul><li>First point</li><li>Second point</li></ul>
            <script>var hidden = "never shown";</script>
            <footer>Copyright notice</footer>
          </body>
        </html>
    "#;

    #[test]
    fn test_html_to_text_emits_block_paragraphs() {
        let text = html_to_text(PAGE);
        assert_eq!(
            text,
            "## Quarterly results\n\nRevenue grew 12% year over year.\n\n- First point\n\n- Second point"
        );
    }

    #[test]
    fn test_exclude_list_is_configurable() {
        let text = TextExtractor::new::<&str>(&[]).html_to_text(PAGE);
        assert!(text.contains("Home About"));
        assert!(text.contains("Copyright notice"));
        assert!(!text.contains("never shown"));
    }

    #[test]
    fn test_visible_text_len_ignores_scripts_and_whitespace() {
        let html = "<html><body><div>ab c</div><script>xxxxxxxx</script></body></html>";
        assert_eq!(visible_text_len(html), 3);
    }

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let html = r##"
            <a href="/pricing#plans">Pricing</a>
            <a href="/pricing">Pricing again</a>
            <a href="https://other.test/blog">Blog</a>
            <a href="/privacy-policy">Privacy</a>
            <a href="mailto:sales@example.test">Mail</a>
            <a href="javascript:void(0)">Noop</a>
            <a href="#top">Top</a>
        "##;
        let links = extract_links("https://example.test/home", html);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].url, "https://example.test/pricing");
        assert!(links[0].internal);
        assert_eq!(links[1].url, "https://other.test/blog");
        assert!(!links[1].internal);
    }
}
