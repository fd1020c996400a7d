//! A fixed pool of worker threads, each running tasks and driving its own
//! reactor on the same thread.
//!
//! Tasks go to workers round-robin. Tasks that land on the same worker run in
//! submission order; there is no ordering across workers.

mod worker;

pub use worker::State;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use self::worker::Shared;
use crate::buffer::ChunkedAllocator;
use crate::cause::Result;
use crate::config::{Config, MIN_THREADS};
use crate::promise::{ActionableThreshold, Promise};
use crate::reactor::{Reactor, UringReactor};

pub type Task<R> = Box<dyn FnOnce(&mut R) + Send>;

/// Handed to the reactor factory on each worker thread.
pub struct WorkerContext {
    pub index: usize,
    pub allocator: Arc<ChunkedAllocator>,
    pub config: Config,
}

struct WorkerHandle<R> {
    shared: Arc<Shared<R>>,
    thread: Option<JoinHandle<()>>,
}

impl<R> WorkerHandle<R> {
    fn wake(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }
}

pub struct Scheduler<R: Reactor = UringReactor> {
    workers: Vec<WorkerHandle<R>>,
    next: AtomicUsize,
    allocator: Arc<ChunkedAllocator>,
    stopped: Promise<()>,
}

impl Scheduler<UringReactor> {
    /// Start `config.threads` workers, each with its own io_uring instance.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_reactor(config, |context: &WorkerContext| {
            UringReactor::new(context.config.ring_entries, context.allocator.clone())
        })
    }
}

impl<R: Reactor> Scheduler<R> {
    /// Start the workers, building each reactor on its worker thread with
    /// `factory`. Returns once every reactor exists; if any of them could not
    /// be built, the workers already running are stopped and the failure is
    /// returned.
    pub fn with_reactor<F>(config: Config, factory: F) -> Result<Self>
    where
        F: Fn(&WorkerContext) -> Result<R> + Send + Sync + 'static,
    {
        let threads = config.threads.max(MIN_THREADS);
        let allocator = ChunkedAllocator::with_chunk_size(config.arena_size, config.chunk_size)?;

        let stopped = Promise::new();
        let exited = Arc::new(ActionableThreshold::new(threads, {
            let stopped = stopped.clone();
            move || {
                stopped.succeed(());
            }
        }));

        // Dropping this on an early return stops and joins whatever was started.
        let mut scheduler = Self {
            workers: Vec::with_capacity(threads),
            next: AtomicUsize::new(0),
            allocator: allocator.clone(),
            stopped,
        };

        let factory = Arc::new(factory);
        let mut started = Vec::with_capacity(threads);

        for index in 0..threads {
            let shared = Arc::new(Shared::new());
            let ready = Promise::new();

            let context = WorkerContext {
                index,
                allocator: allocator.clone(),
                config: config.clone(),
            };

            let thread = worker::spawn(context, shared.clone(), factory.clone(), ready.clone(), exited.clone())?;

            scheduler.workers.push(WorkerHandle {
                shared,
                thread: Some(thread),
            });
            started.push(ready);
        }

        Promise::all(started).join()?;

        debug!(threads, "scheduler started");

        Ok(scheduler)
    }

    /// Queue a task on the next worker. Never blocks.
    pub fn submit<T>(&self, task: T)
    where
        T: FnOnce(&mut R) + Send + 'static,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.push(index, Box::new(task));
    }

    pub fn submit_all<I, T>(&self, tasks: I)
    where
        I: IntoIterator<Item = T>,
        T: FnOnce(&mut R) + Send + 'static,
    {
        for task in tasks {
            self.submit(task);
        }
    }

    /// Run `task` once on every worker.
    pub fn replicate<T>(&self, task: T)
    where
        T: Fn(&mut R) + Send + Sync + 'static,
    {
        let task = Arc::new(task);

        for index in 0..self.workers.len() {
            let task = task.clone();
            self.push(index, Box::new(move |reactor: &mut R| task(reactor)));
        }
    }

    /// Ask every worker to stop. Tasks already queued still run. The returned
    /// promise resolves once every worker thread has left its loop.
    pub fn shutdown(&self) -> Promise<()> {
        for worker in &self.workers {
            if worker.shared.begin_shutdown() {
                worker.wake();
            }
        }

        self.stopped.clone()
    }

    pub fn parallelism(&self) -> usize {
        self.workers.len()
    }

    pub fn allocator(&self) -> &Arc<ChunkedAllocator> {
        &self.allocator
    }

    pub fn worker_states(&self) -> Vec<State> {
        self.workers.iter().map(|worker| worker.shared.state()).collect()
    }

    fn push(&self, index: usize, task: Task<R>) {
        let worker = &self.workers[index];

        if worker.shared.state() != State::Running || worker.shared.queue.push(task).is_err() {
            warn!(worker = index, "task submitted after shutdown, dropping it");
            return;
        }

        worker.wake();
    }
}

impl<R: Reactor> Drop for Scheduler<R> {
    fn drop(&mut self) {
        self.shutdown();

        let current = thread::current().id();

        for worker in &mut self.workers {
            let thread = match worker.thread.take() {
                Some(thread) => thread,
                None => continue,
            };

            // A task dropping the scheduler can't wait for its own thread.
            if thread.thread().id() == current {
                continue;
            }

            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}
