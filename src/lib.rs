//! A completion-based I/O runtime on top of io_uring.
//!
//! A [`Scheduler`] runs a fixed set of worker threads. Each worker owns a
//! [`Reactor`] and runs submitted tasks on the same thread that processes the
//! reactor's completions, so callbacks fire without any cross-thread handoff.
//! Results travel through [`Promise`]s, and I/O buffers come out of a shared
//! [`ChunkedAllocator`] arena that is registered with every ring.

pub mod buffer;
pub mod cause;
pub mod config;
pub mod io;
pub mod promise;
pub mod reactor;
pub mod scheduler;
pub mod stack;

pub use buffer::{ChunkedAllocator, FixedBuffer};
pub use cause::{Cause, ErrorKind, Result};
pub use config::Config;
pub use promise::{all2, all3, ActionableThreshold, Promise, ResultCollector};
pub use reactor::{Reactor, UringReactor};
pub use scheduler::{Scheduler, WorkerContext};
