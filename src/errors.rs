//! Crate-wide error taxonomy.
//!
//! Compliance blocks and outbound cooldown blocks are decision values, not
//! errors; they never appear here. Everything that crosses a component
//! boundary as a failure does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Transport unavailable or a browser-gateway operation failed.
    #[error("browser error: {0}")]
    Browser(String),

    /// Remote or rule-table quote source failed.
    #[error("quote provider error: {0}")]
    QuoteProvider(String),

    /// Missing or invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Workflow-level retryable job failure.
    #[error("job failure: {0}")]
    Job(String),
}

impl AppError {
    pub fn browser(msg: impl Into<String>) -> Self {
        Self::Browser(msg.into())
    }

    pub fn quote(msg: impl Into<String>) -> Self {
        Self::QuoteProvider(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn job(msg: impl Into<String>) -> Self {
        Self::Job(msg.into())
    }
}
