use std::collections::{HashSet, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use io_uring::{opcode, types};
use io_uring::squeue::{Entry, Flags};
use io_uring::IoUring;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrStorage};
use slab::Slab;
use tracing::{debug, error, warn};

use super::op::{self, Op, Operation};
use super::Reactor;
use crate::buffer::{ChunkedAllocator, FixedBuffer};
use crate::cause::{Cause, Result};

// User data for entries whose completions nobody waits for (linked
// timeouts, cancellations).
const UNTRACKED: u64 = u64::MAX;

// Bound on submit/wait rounds while draining cancelled operations.
const SHUTDOWN_ROUNDS: usize = 64;

/// A [`Reactor`] backed by one io_uring instance.
pub struct UringReactor {
    ring: IoUring,
    ops: Slab<Op>,
    // Entries that did not fit into the submission queue, with their linked timeout.
    backlog: VecDeque<(Entry, Option<Entry>)>,

    // Keys handed to AsyncCancel whose completion hasn't arrived yet.
    cancelled: HashSet<usize>,

    allocator: Arc<ChunkedAllocator>,
    registered: bool,
    closed: bool,
}

impl UringReactor {
    pub fn new(entries: u32, allocator: Arc<ChunkedAllocator>) -> Result<Self> {
        let ring = IoUring::new(entries)?;

        let arena = libc::iovec {
            iov_base: allocator.arena_ptr() as _,
            iov_len: allocator.arena_size(),
        };

        // The arena outlives the ring: we hold a reference to the allocator.
        let registered = match unsafe { ring.submitter().register_buffers(&[arena]) } {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "fixed buffer registration failed, fixed operations fall back to plain read/write");
                false
            }
        };

        debug!(entries, registered, "io_uring reactor created");

        Ok(Self {
            ring,
            ops: Slab::with_capacity(entries as _),
            backlog: VecDeque::new(),
            cancelled: HashSet::new(),
            allocator,
            registered,
            closed: false,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.ops.len()
    }

    pub fn allocator(&self) -> &Arc<ChunkedAllocator> {
        &self.allocator
    }

    /// Ask the kernel to cancel every in-flight operation. Their callbacks
    /// observe a `Cancelled` failure once completions are processed.
    pub fn cancel_all(&mut self) {
        let keys: Vec<usize> = self.ops.iter().map(|(key, _)| key).collect();

        for key in keys {
            if !self.cancelled.insert(key) {
                continue;
            }

            let entry = opcode::AsyncCancel::new(key as u64)
                .build()
                .user_data(UNTRACKED);

            self.enqueue(entry, None);
        }
    }

    fn submit(&mut self, mut op: Op) {
        if self.closed {
            // Nothing will ever drive this operation; finish it right here.
            op.clear_deadline();
            op.complete(-libc::ECANCELED, self);
            return;
        }

        let entry = op.entry();
        let deadline = op.deadline().map(|timespec| timespec as *const types::Timespec);
        let key = self.ops.insert(op);
        let entry = entry.user_data(key as _);

        match deadline {
            None => self.enqueue(entry, None),
            Some(timespec) => {
                let timeout = opcode::LinkTimeout::new(timespec).build().user_data(UNTRACKED);
                self.enqueue(entry.flags(Flags::IO_LINK), Some(timeout));
            }
        }
    }

    fn enqueue(&mut self, entry: Entry, linked: Option<Entry>) {
        if !self.backlog.is_empty() || !self.push(&entry, linked.as_ref()) {
            self.backlog.push_back((entry, linked));

            if self.backlog.len() % 1024 == 0 {
                warn!(backlog = self.backlog.len(), "submission backlog is growing");
            }
        }
    }

    // Linked entries must land in the queue together or not at all.
    fn push(&mut self, entry: &Entry, linked: Option<&Entry>) -> bool {
        let mut submissions = self.ring.submission();
        let needed = if linked.is_some() { 2 } else { 1 };

        if submissions.capacity() - submissions.len() < needed {
            return false;
        }

        unsafe {
            // Won't fail, space was checked above.
            let _ = submissions.push(entry);

            if let Some(linked) = linked {
                let _ = submissions.push(linked);
            }
        }

        true
    }

    fn run_backlog(&mut self) {
        while let Some((entry, linked)) = self.backlog.pop_front() {
            if !self.push(&entry, linked.as_ref()) {
                self.backlog.push_front((entry, linked));
                return;
            }
        }
    }

    fn timespec(timeout: Option<Duration>) -> Option<Box<types::Timespec>> {
        timeout.map(op::timespec)
    }
}

impl Reactor for UringReactor {
    fn process_submissions(&mut self) -> usize {
        self.run_backlog();

        if self.ring.submission().is_empty() {
            return 0;
        }

        match self.ring.submit() {
            Ok(count) => count,
            Err(err) => {
                // EBUSY/EAGAIN: the completion queue is full, drain it first.
                if !matches!(err.raw_os_error(), Some(libc::EBUSY) | Some(libc::EAGAIN)) {
                    warn!(%err, "io_uring submission failed");
                }
                0
            }
        }
    }

    fn process_completions(&mut self) -> usize {
        let mut processed = 0;

        loop {
            let entry = self.ring.completion().next();
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };

            if entry.user_data() == UNTRACKED {
                continue;
            }

            let key = entry.user_data() as usize;

            if !self.ops.contains(key) {
                warn!(key, "completion for an unknown operation");
                continue;
            }

            let mut op = self.ops.remove(key);
            let ret = entry.result();

            if self.cancelled.remove(&key) && ret == -libc::ECANCELED {
                op.clear_deadline();
            }

            if panic::catch_unwind(AssertUnwindSafe(|| op.complete(ret, self))).is_err() {
                error!("completion callback panicked");
            }

            processed += 1;
        }

        processed
    }

    fn nop<F>(&mut self, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static,
    {
        self.submit(
            op::Nop {
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn delay<F>(&mut self, duration: Duration, completion: F)
    where
        F: FnOnce(Result<Duration>, &mut Self) + 'static,
    {
        self.submit(
            op::Delay {
                timespec: op::timespec(duration),
                started: Instant::now(),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn read<F>(&mut self, fd: RawFd, buffer: Box<[u8]>, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static,
    {
        self.submit(
            op::Read {
                fd,
                buffer,
                offset,
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn write<F>(&mut self, fd: RawFd, buffer: Box<[u8]>, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static,
    {
        self.submit(
            op::Write {
                fd,
                buffer,
                offset,
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn read_fixed<F>(&mut self, fd: RawFd, buffer: FixedBuffer, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static,
    {
        let registered = self.registered && Arc::ptr_eq(buffer.allocator(), &self.allocator);

        self.submit(
            op::ReadFixed {
                fd,
                buffer,
                offset,
                registered,
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn write_fixed<F>(&mut self, fd: RawFd, buffer: FixedBuffer, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static,
    {
        let registered = self.registered && Arc::ptr_eq(buffer.allocator(), &self.allocator);

        self.submit(
            op::WriteFixed {
                fd,
                buffer,
                offset,
                registered,
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn accept<F>(&mut self, listener: RawFd, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static,
    {
        self.submit(
            op::Accept {
                fd: listener,
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn connect<F>(&mut self, addr: SocketAddr, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static,
    {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        let socket = match socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(errno) => {
                // Report through the regular completion path.
                let cause = Cause::from_errno(errno as i32);
                return self.nop(move |_, reactor| completion(Err(cause), reactor));
            }
        };

        self.submit(
            op::Connect {
                socket,
                addr: Box::new(SockaddrStorage::from(addr)),
                timeout: Self::timespec(timeout),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn close<F>(&mut self, fd: OwnedFd, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static,
    {
        self.submit(
            op::Close {
                fd: fd.into_raw_fd(),
                completion: Box::new(completion),
            }
            .into(),
        )
    }

    fn allocate_fixed_buffer(&mut self, size: usize) -> Result<FixedBuffer> {
        self.allocator.allocate(size)
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }

        // Callbacks run below may try to chain more work; refuse it.
        self.closed = true;
        self.cancel_all();

        let mut rounds = 0;

        while !self.ops.is_empty() && rounds < SHUTDOWN_ROUNDS {
            self.process_submissions();

            if let Err(err) = self.ring.submit_and_wait(1) {
                warn!(%err, "waiting for cancelled operations failed");
                break;
            }

            self.process_completions();
            rounds += 1;
        }

        if !self.ops.is_empty() {
            // The kernel may still own these buffers; leaking beats a use-after-free.
            warn!(leaked = self.ops.len(), "operations still in flight at shutdown");

            for op in self.ops.drain() {
                std::mem::forget(op);
            }
        }

        debug!("io_uring reactor closed");
    }
}

impl Drop for UringReactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
