//! Browser gateway client (DOM transport + listing collaborator surface).

pub mod client;

pub use client::BrowserClient;
