//! The fulfillment queue workers.
//!
//! Tasks live in the database (see `database::tasks`), so they survive
//! restarts and can be worked off by any number of concurrent workers; the
//! visibility timeout brings tasks claimed by a crashed worker back. This
//! replaces the classic single-process in-memory queue whose tasks die with
//! the process.

pub mod worker;

pub use worker::{Worker, WorkerPool};
