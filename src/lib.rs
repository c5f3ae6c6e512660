//! shadowbus: event-sourced signal pipeline with counterfactual execution
//!
//! Every trading signal flows through an append-only event log and a strict
//! lifecycle state machine, while a shadow engine trades all of them
//! virtually so that blocked signals can be priced after the fact.

pub mod analytics;
pub mod config;
pub mod decisions;
pub mod event_log;
pub mod feed;
pub mod logging;
pub mod monitor;
pub mod shadow;
pub mod signal_bus;
pub mod state_machine;
pub mod types;
