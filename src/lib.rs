//! Recoverable network word count.
//!
//! Lines of text are read from a TCP source, counted in fixed-length
//! ticks and one line of running totals per tick is appended to an
//! output file. The whole pipeline is checkpointed to SQLite so a
//! restarted process carries on from its last checkpoint instead of
//! starting over.
//!
//! Read [`worker::start`] first; it decides between a fresh and a
//! resumed pipeline. [`execution::BatchScheduler`] is the tick loop
//! itself and [`recovery`] describes what gets checkpointed.
//!
//! Delivery to the output is at-least-once: after a restart the last
//! checkpointed tick is written again, so the output can hold a
//! duplicate line at each restart.

pub mod clock;
pub mod errors;
pub mod execution;
pub mod inputs;
pub mod metrics;
pub mod operators;
pub mod outputs;
pub mod pipeline;
pub mod recovery;
pub mod run;
pub mod tracing;
pub mod webserver;
pub mod worker;
