//! Turning a bundle tree into tasks and running them.
//!
//! [`entry`] flattens bundles into generator entries with stable ids,
//! [`graph`] wires task dependencies to exports, and [`runner`] executes the
//! resulting graph on a worker pool.

pub mod entry;
pub mod graph;
pub mod runner;

pub use entry::{GeneratorEntry, ROOT_ENTRY_ID, build_generator_entry};
pub use graph::{DependencyEdge, TaskGraph, TaskNode};
pub use runner::{Diagnostics, RunOptions, RunOutput, TaskExecution, run_task_graph};
