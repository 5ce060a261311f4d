// src/error.rs

//! Unified error handling for the fetch cascade, rate limiters and dispatch loop.

use std::fmt;

use thiserror::Error;

/// Result type alias for tierfetch operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A fetch strategy could not produce a page
    #[error("Fetch error for {context}: {message}")]
    Fetch { context: String, message: String },

    /// Shared counter store unavailable or returned garbage
    #[error("Counter store error: {0}")]
    Store(String),

    /// A tool collaborator failed
    #[error("Tool {tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// The reasoning process asked for a tool that does not exist
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a fetch error with context.
    pub fn fetch(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fetch {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a counter store error.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}
