//! An in-memory reactor for exercising the scheduler without io_uring.

use std::collections::VecDeque;
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Reactor;
use crate::buffer::{ChunkedAllocator, FixedBuffer};
use crate::cause::{Cause, Result};

type Callback = Box<dyn FnOnce(&mut ManualReactor)>;

/// Operations become ready on the next `process_submissions` and run on the
/// following `process_completions`. Delays complete immediately with the
/// requested duration; anything touching a descriptor fails.
pub(crate) struct ManualReactor {
    submitted: Vec<Callback>,
    ready: VecDeque<Callback>,
    allocator: Arc<ChunkedAllocator>,
    shutdowns: Arc<AtomicUsize>,
}

impl ManualReactor {
    pub fn new(allocator: Arc<ChunkedAllocator>, shutdowns: Arc<AtomicUsize>) -> Self {
        Self {
            submitted: Vec::new(),
            ready: VecDeque::new(),
            allocator,
            shutdowns,
        }
    }

    pub fn pending(&self) -> usize {
        self.submitted.len() + self.ready.len()
    }

    /// Run until nothing is left, the way a worker loop would.
    pub fn settle(&mut self) {
        while self.pending() > 0 {
            self.process_submissions();
            self.process_completions();
        }
    }

    fn queue<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut ManualReactor) + 'static,
    {
        self.submitted.push(Box::new(callback));
    }

    fn unsupported(operation: &str) -> Cause {
        Cause::fault(format!("{} is not supported by the manual reactor", operation))
    }
}

impl Reactor for ManualReactor {
    fn process_submissions(&mut self) -> usize {
        let submitted = mem::take(&mut self.submitted);
        let count = submitted.len();
        self.ready.extend(submitted);
        count
    }

    fn process_completions(&mut self) -> usize {
        let ready = mem::take(&mut self.ready);
        let count = ready.len();

        for callback in ready {
            callback(self);
        }

        count
    }

    fn nop<F>(&mut self, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Ok(()), reactor))
    }

    fn delay<F>(&mut self, duration: Duration, completion: F)
    where
        F: FnOnce(Result<Duration>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Ok(duration), reactor))
    }

    fn read<F>(&mut self, _fd: RawFd, buffer: Box<[u8]>, _offset: u64, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("read")), buffer, reactor))
    }

    fn write<F>(&mut self, _fd: RawFd, buffer: Box<[u8]>, _offset: u64, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("write")), buffer, reactor))
    }

    fn read_fixed<F>(&mut self, _fd: RawFd, buffer: FixedBuffer, _offset: u64, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("read_fixed")), buffer, reactor))
    }

    fn write_fixed<F>(&mut self, _fd: RawFd, buffer: FixedBuffer, _offset: u64, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("write_fixed")), buffer, reactor))
    }

    fn accept<F>(&mut self, _listener: RawFd, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("accept")), reactor))
    }

    fn connect<F>(&mut self, _addr: SocketAddr, _timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static,
    {
        self.queue(move |reactor| completion(Err(Self::unsupported("connect")), reactor))
    }

    fn close<F>(&mut self, fd: OwnedFd, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static,
    {
        drop(fd);
        self.queue(move |reactor| completion(Ok(()), reactor))
    }

    fn allocate_fixed_buffer(&mut self, size: usize) -> Result<FixedBuffer> {
        self.allocator.allocate(size)
    }

    fn shutdown(&mut self) {
        // Pending callbacks are dropped without running.
        self.submitted.clear();
        self.ready.clear();
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
