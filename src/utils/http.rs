// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::error::{AppError, Result};

/// Headers a desktop browser sends on a top-level navigation.
pub fn browser_headers(accept_language: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_str(accept_language)
            .map_err(|e| AppError::config(format!("invalid accept_language: {e}")))?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(headers)
}

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(
    user_agent: &str,
    timeout: Duration,
    headers: HeaderMap,
    proxy: Option<&str>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .default_headers(headers);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Shorten a body for log lines.
pub fn snippet(body: &str, max_chars: usize) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out: String = flat.chars().take(max_chars).collect();
    if flat.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_headers_include_language_and_no_cache() {
        let headers = browser_headers("de-DE,de;q=0.9").unwrap();
        assert_eq!(headers[header::ACCEPT_LANGUAGE], "de-DE,de;q=0.9");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    }

    #[test]
    fn test_browser_headers_reject_control_characters() {
        assert!(browser_headers("en\nUS").is_err());
    }

    #[test]
    fn test_snippet_truncates_and_flattens() {
        assert_eq!(snippet("a\n\nb c d", 5), "a b c...");
        assert_eq!(snippet("short", 10), "short");
    }
}
