use std::hint;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, trace};

use super::{Task, WorkerContext};
use crate::cause::{Cause, Result};
use crate::promise::{ActionableThreshold, Promise};
use crate::reactor::Reactor;
use crate::stack::{Drain, Stack};

// Idle rounds that only yield before the worker starts parking.
const IDLE_YIELDS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Running,
    ShuttingDown,
    Stopped,
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            0 => State::Running,
            1 => State::ShuttingDown,
            _ => State::Stopped,
        }
    }
}

/// The part of a worker other threads touch.
pub(crate) struct Shared<R> {
    pub queue: Stack<Task<R>>,
    state: AtomicU8,
}

impl<R> Shared<R> {
    pub fn new() -> Self {
        Self {
            queue: Stack::new(),
            state: AtomicU8::new(State::Running as u8),
        }
    }

    pub fn state(&self) -> State {
        self.state.load(Ordering::Acquire).into()
    }

    /// Running -> ShuttingDown. False if the worker was already past Running.
    pub fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(
                State::Running as u8,
                State::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn stop(&self) {
        self.state.store(State::Stopped as u8, Ordering::Release);
    }
}

pub(crate) struct Worker<R> {
    index: usize,
    shared: Arc<Shared<R>>,
    reactor: R,
    idle_spin_limit: usize,
    idle_park: Duration,
}

/// Start a worker thread. The reactor is built on the new thread; `started`
/// reports whether that worked. `exited` is told once the thread is done,
/// whatever happened.
pub(crate) fn spawn<R, F>(
    context: WorkerContext,
    shared: Arc<Shared<R>>,
    factory: Arc<F>,
    started: Promise<()>,
    exited: Arc<ActionableThreshold>,
) -> io::Result<JoinHandle<()>>
where
    R: Reactor,
    F: Fn(&WorkerContext) -> Result<R> + Send + Sync + 'static,
{
    thread::Builder::new()
        .name(format!("proactor-worker-{}", context.index))
        .spawn(move || {
            let built = panic::catch_unwind(AssertUnwindSafe(|| factory(&context)))
                .unwrap_or_else(|_| Err(Cause::fault("reactor factory panicked")));

            match built {
                Ok(reactor) => {
                    started.succeed(());

                    let mut worker = Worker {
                        index: context.index,
                        shared: shared.clone(),
                        reactor,
                        idle_spin_limit: context.config.idle_spin_limit,
                        idle_park: context.config.idle_park,
                    };

                    worker.run();
                }
                Err(cause) => {
                    error!(worker = context.index, %cause, "failed to create reactor");
                    started.fail(cause);
                }
            }

            shared.stop();
            exited.register_event();
        })
}

impl<R: Reactor> Worker<R> {
    fn run(&mut self) {
        debug!(worker = self.index, "worker started");

        let mut idle_rounds = 0;

        while self.shared.state() == State::Running {
            let batch = self.shared.queue.drain();

            if !batch.is_empty() {
                self.run_batch(batch);
                idle_rounds = 0;
                continue;
            }

            if self.spin() {
                idle_rounds = 0;
                continue;
            }

            idle_rounds += 1;

            if idle_rounds < IDLE_YIELDS {
                thread::yield_now();
            } else {
                // Woken early by submit and shutdown.
                thread::park_timeout(self.idle_park);
            }
        }

        // Whatever made it into the queue before sealing still runs.
        let batch = self.shared.queue.seal();
        if !batch.is_empty() {
            self.run_batch(batch);
        }

        self.reactor.shutdown();

        debug!(worker = self.index, "worker stopped");
    }

    fn run_batch(&mut self, batch: Drain<Task<R>>) {
        self.reactor.process_completions();

        let mut count = 0;

        for task in batch {
            let reactor = &mut self.reactor;

            if panic::catch_unwind(AssertUnwindSafe(move || task(reactor))).is_err() {
                error!(worker = self.index, "task panicked");
            }

            count += 1;
        }

        trace!(worker = self.index, tasks = count, "ran batch");

        self.reactor.process_submissions();
    }

    // Poll the reactor for a while. True if anything happened.
    fn spin(&mut self) -> bool {
        for _ in 0..self.idle_spin_limit {
            let completed = self.reactor.process_completions();
            let submitted = self.reactor.process_submissions();

            if completed + submitted > 0 || !self.shared.queue.is_empty() {
                return true;
            }

            hint::spin_loop();
        }

        false
    }
}
