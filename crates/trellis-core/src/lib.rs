//! trellis-core
//!
//! Cron-driven DAG scheduler over a shared transactional store.
//!
//! # Modules
//! - **domain**: ids, entities, statuses, errors, time helpers
//! - **ports**: repository traits, transactions, clock, cron, id generation
//! - **app**: services (activation, dispatch, maintenance) and drivers
//! - **impls**: in-memory store and the cron calculator
//! - **catalog**: declarative job definitions and their registration
//! - **config**: TOML settings

pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

#[cfg(test)]
mod testing;
