//! Idlebot backend library.
//!
//! Core of the marketplace chat automation: dual-mode chat transport,
//! quote engine, compliance center, durable workflow, and SLA monitoring.
//! The `idlebot` binary wires these together behind a JSON-emitting CLI.

pub mod browser;
pub mod compliance;
pub mod config;
pub mod doctor;
pub mod errors;
pub mod messages;
pub mod quote;
pub mod transport;
pub mod workflow;

pub use config::AppConfig;
pub use errors::AppError;
