//! Runtime scaffolding for running schedulers on their own threads.
//!
//! - `driver`: one OS thread per bus, each looping its scheduler until every
//!   lane closes or it is told to stop.

pub mod driver;

pub use driver::{DriverError, SchedulerThread};
