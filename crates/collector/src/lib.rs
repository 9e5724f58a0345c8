//! Task scheduling and external-process execution for data collection.
//!
//! A [`CollectionTask`](model::CollectionTask) describes where data comes
//! from and where it goes. The [`CollectionScheduler`](scheduler::CollectionScheduler)
//! decides when scheduled tasks are due, the
//! [`ExecutionCoordinator`](coordinator::ExecutionCoordinator) turns a task
//! into a job spec, runs the transfer engine under a
//! [`ProcessSupervisor`](supervisor::ProcessSupervisor), and records the
//! outcome as a [`TaskExecution`](model::TaskExecution).

pub mod adapter;
pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod jobspec;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;
pub mod supervisor;

pub use coordinator::ExecutionCoordinator;
pub use error::CollectionError;
pub use scheduler::{CollectionScheduler, TickReport};
pub use service::{CollectionService, CreateTask, UpdateTask};
