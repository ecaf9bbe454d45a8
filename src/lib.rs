//! Traveease payment orchestration and marketplace settlement engine.
//!
//! Routes each checkout to a payment rail by customer region and currency,
//! falls back across rails when one refuses, and splits captured funds
//! between vendors and the platform.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
