//! The change-propagation pipeline: watchers, fingerprint cache, work
//! queue, workers and pause bookkeeping.

pub mod cache;
pub mod pause;
pub mod queue;
pub mod watch;
pub mod worker;
