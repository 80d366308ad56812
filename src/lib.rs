//! # caseflow
//!
//! Case workflow and assignment-lease engine for a loan-origination back
//! office.
//!
//! Provides the staged case pipeline, time-leased exclusive assignment,
//! an append-only per-case history, and the background sweeper that
//! reclaims expired leases.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod sweeper;
pub mod telemetry;
