//! The drover scheduling and execution engine.
//!
//! Components, leaves first: the priority [`queue`], the dependency
//! [`graph`], the [`timeout`] supervisor, the [`retry`] controller, the
//! [`cron`] trigger registry, the [`handler`] plug-in seam, the
//! [`executor`] unit of pool work, and the [`scheduler`] loop that ties
//! them together. [`report`] ships aggregated results to an outbound sink,
//! [`ingest`] pulls tasks from external sources, and [`taskfile`] loads
//! declarative TOML task definitions.

pub mod cron;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod ingest;
pub mod queue;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod taskfile;
pub mod timeout;
