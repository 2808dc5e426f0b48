//! cartwatch-core: Core library for cartwatch
//!
//! This crate implements a real-time session-aggregation engine for
//! e-commerce clickstreams: raw interaction events go in, finalized
//! per-session summaries (conversion, cart abandonment with a classified
//! reason, engagement metrics) come out.
//!
//! # Architecture
//!
//! ```text
//! Broker → Intake (validate, rate-limit) → Partition Router
//!                                                │
//!                              Workers (one ShardStore each)
//!                                                │
//!                        finalize → Classifier → Sink (SQLite, retry)
//!                                                │
//!                                     SummaryCache / DeadLetterQueue
//! ```
//!
//! # Modules
//!
//! - `event`: Inbound event schema and validation
//! - `router`: Stable session-key → worker partition routing
//! - `session`: Per-session state machine (browse → cart → checkout)
//! - `store`: Per-worker shard store with timeout sweep and dedupe
//! - `classifier`: Abandonment-reason classification
//! - `summary`: Finalized session summary (durable row, cache value)
//! - `sink`: Idempotent persistence (SQLite) and the dead-letter queue
//! - `cache`: TTL cache for fast summary reads
//! - `broker`: Partitioned at-least-once transport
//! - `engine`: Orchestration: intake, workers, shutdown flush
//! - `retry`: Exponential backoff for sink writes
//! - `token_bucket`: Intake rate ceiling
//! - `config`: TOML configuration
//! - `logging`: Tracing subscriber setup
//! - `metrics`: Atomic counters and health reports
//!
//! # Safety
//!
//! This crate forbids unsafe code.

pub mod broker;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod router;
pub mod session;
pub mod sink;
pub mod store;
pub mod summary;
pub mod token_bucket;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
