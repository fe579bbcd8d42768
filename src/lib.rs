//! GRADEGAP — trading-card grading arbitrage tracker.
//!
//! Scrapes current marketplace prices and sold graded-auction prices
//! for high-rarity trading cards, reconciles the two into per-card
//! profit metrics, persists the results in SQLite, and serves them
//! over an HTTP API.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod sources;
pub mod storage;
pub mod types;
