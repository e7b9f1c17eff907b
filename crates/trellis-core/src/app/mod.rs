//! App - services built on the ports.
//!
//! # Main components
//! - **JobActivator**: due schedule slot -> prepared job run
//! - **TaskGraphPreparer**: task runs for a job run, promotion on completion
//! - **TaskDispatcher**: claim, heartbeat, complete, retry
//! - **WorkerSlotPool**: numbered worker identities
//! - **MaintenanceSweeper**: lease recovery and housekeeping
//! - **Orchestrator**: one activation plus claims per tick
//! - **SchedulerBuilder**: wiring and start-up validation
//! - **TickLoop / WorkerLoop / ReaperLoop**: optional periodic drivers

pub mod activator;
pub mod builder;
pub mod dispatcher;
pub mod driver;
pub mod graph;
pub mod maintenance;
pub mod orchestrator;
pub mod reaper_loop;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod tick_loop;
pub mod unit_of_work;
pub mod worker_loop;
pub mod worker_pool;

pub use self::activator::{Activation, JobActivator};
pub use self::builder::{BuildError, Scheduler, SchedulerBuilder};
pub use self::dispatcher::{Completion, RetryOutcome, TaskDispatcher};
pub use self::driver::{DriverOptions, LoopGroup};
pub use self::graph::TaskGraphPreparer;
pub use self::maintenance::{MaintenanceReport, MaintenanceSweeper, ReadyWindow, SweepOptions};
pub use self::orchestrator::{Orchestrator, TickOptions, TickReport};
pub use self::reaper_loop::ReaperLoop;
pub use self::retry::{ExponentialBackoff, FixedBackoff, RetryPolicy};
pub use self::runtime::{HandlerError, HandlerRegistry, Runtime, TaskContext, TaskHandler};
pub use self::status::{RunStatus, TaskRunCounts};
pub use self::tick_loop::TickLoop;
pub use self::unit_of_work::{TransactionBoundary, UnitOfWork};
pub use self::worker_loop::{WorkerLoop, WorkerOptions, WorkerSummary};
pub use self::worker_pool::WorkerSlotPool;
