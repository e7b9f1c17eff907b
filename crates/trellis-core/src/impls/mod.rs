//! Impls - adapters for the ports.
//!
//! # Included
//! - **MemoryStore**: transactional in-memory store (every repository port)
//! - **CronScheduleCalculator**: `CronCalculator` backed by the `cron` crate
//!
//! A database-backed store would live in its own crate and implement the
//! same repository traits for its own transaction type.

pub mod cron;
pub mod memory;

pub use self::cron::CronScheduleCalculator;
pub use self::memory::{MemoryStore, MemoryTx};
