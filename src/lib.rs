//! tributary - DAG workflow orchestrator with durable run state
//!
//! Workflows are directed acyclic graphs of tasks. A polling [`scheduler`]
//! materializes runs into the SQLite [`state`] store, and a bounded
//! [`executor`] claims, heartbeats and completes task instances through
//! conditional writes, so several processes can share one database.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod dag;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod templates;
pub mod units;
pub mod workflow;
