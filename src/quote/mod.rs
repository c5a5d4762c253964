//! Shipping quote engine: request normalization, cost-table pricing,
//! multi-source fallback, caching, and snapshot traceability.

pub mod cache;
pub mod cost_table;
pub mod engine;
pub mod models;
pub mod providers;
pub mod route;
pub mod snapshot;

pub use cost_table::{CostRecord, CostTableRepository};
pub use engine::AutoQuoteEngine;
pub use models::{QuoteRequest, QuoteResult, QuoteSnapshot};
