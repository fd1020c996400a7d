//! In-flight io_uring operations.
//!
//! Each operation owns everything the kernel may touch while it runs
//! (buffers, timespecs, socket addresses) behind a stable heap address, and
//! the callback to run once the kernel reports back.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::{Duration, Instant};

use io_uring::{opcode, types};
use io_uring::squeue::Entry;

use enum_dispatch::enum_dispatch;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};

use super::UringReactor;
use crate::buffer::FixedBuffer;
use crate::cause::{Cause, Result};

pub type Completion<T> = Box<dyn FnOnce(Result<T>, &mut UringReactor)>;
pub type Transfer<B> = Box<dyn FnOnce(Result<usize>, B, &mut UringReactor)>;

#[enum_dispatch]
pub trait Operation {
    fn entry(&mut self) -> Entry;

    /// Timeout to link behind the entry, if any.
    fn deadline(&self) -> Option<&types::Timespec> {
        None
    }

    /// Forget the linked timeout once the kernel is done with it, so an
    /// `ECANCELED` result reads as a cancellation rather than an expiry.
    fn clear_deadline(&mut self) {}

    fn complete(self, ret: i32, reactor: &mut UringReactor);
}

#[enum_dispatch(Operation)]
pub enum Op {
    Nop,
    Delay,
    Read,
    Write,
    ReadFixed,
    WriteFixed,
    Accept,
    Connect,
    Close,
}

pub(crate) fn timespec(duration: Duration) -> Box<types::Timespec> {
    Box::new(
        types::Timespec::new()
            .sec(duration.as_secs())
            .nsec(duration.subsec_nanos()),
    )
}

// A negative result carries an errno. An operation cut short by its linked
// timeout reports ECANCELED, as does one cancelled on request; the reactor
// clears the deadline of the latter before completing it.
fn outcome(ret: i32, timed: bool) -> Result<usize> {
    if ret >= 0 {
        Ok(ret as usize)
    } else if timed && -ret == libc::ECANCELED {
        Err(Cause::timed_out("operation timed out"))
    } else {
        Err(Cause::from_errno(-ret))
    }
}

pub struct Nop {
    pub(crate) completion: Completion<()>,
}

impl Operation for Nop {
    fn entry(&mut self) -> Entry {
        opcode::Nop::new().build()
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        (self.completion)(outcome(ret, false).map(drop), reactor)
    }
}

pub struct Delay {
    pub(crate) timespec: Box<types::Timespec>,
    pub(crate) started: Instant,
    pub(crate) completion: Completion<Duration>,
}

impl Operation for Delay {
    fn entry(&mut self) -> Entry {
        opcode::Timeout::new(&*self.timespec).build()
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        // An expired timeout reports ETIME, which is the expected outcome.
        let result = if ret >= 0 || -ret == libc::ETIME {
            Ok(self.started.elapsed())
        } else {
            Err(Cause::from_errno(-ret))
        };

        (self.completion)(result, reactor)
    }
}

pub struct Read {
    pub(crate) fd: RawFd,
    pub(crate) buffer: Box<[u8]>,
    pub(crate) offset: u64,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Transfer<Box<[u8]>>,
}

impl Operation for Read {
    fn entry(&mut self) -> Entry {
        opcode::Read::new(types::Fd(self.fd), self.buffer.as_mut_ptr(), self.buffer.len() as _)
            .offset(self.offset)
            .build()
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        let result = outcome(ret, self.timeout.is_some());
        (self.completion)(result, self.buffer, reactor)
    }
}

pub struct Write {
    pub(crate) fd: RawFd,
    pub(crate) buffer: Box<[u8]>,
    pub(crate) offset: u64,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Transfer<Box<[u8]>>,
}

impl Operation for Write {
    fn entry(&mut self) -> Entry {
        opcode::Write::new(types::Fd(self.fd), self.buffer.as_ptr(), self.buffer.len() as _)
            .offset(self.offset)
            .build()
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        let result = outcome(ret, self.timeout.is_some());
        (self.completion)(result, self.buffer, reactor)
    }
}

pub struct ReadFixed {
    pub(crate) fd: RawFd,
    pub(crate) buffer: FixedBuffer,
    pub(crate) offset: u64,
    // False when the arena could not be registered with the ring.
    pub(crate) registered: bool,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Transfer<FixedBuffer>,
}

impl Operation for ReadFixed {
    fn entry(&mut self) -> Entry {
        let fd = types::Fd(self.fd);
        let len = self.buffer.capacity() as _;
        let ptr = self.buffer.as_mut_ptr();

        if self.registered {
            opcode::ReadFixed::new(fd, ptr, len, self.buffer.buf_index())
                .offset(self.offset)
                .build()
        } else {
            opcode::Read::new(fd, ptr, len).offset(self.offset).build()
        }
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(mut self, ret: i32, reactor: &mut UringReactor) {
        let result = outcome(ret, self.timeout.is_some());

        if let Ok(size) = result {
            self.buffer.set_used(size);
        }

        (self.completion)(result, self.buffer, reactor)
    }
}

pub struct WriteFixed {
    pub(crate) fd: RawFd,
    pub(crate) buffer: FixedBuffer,
    pub(crate) offset: u64,
    pub(crate) registered: bool,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Transfer<FixedBuffer>,
}

impl Operation for WriteFixed {
    fn entry(&mut self) -> Entry {
        let fd = types::Fd(self.fd);
        let len = self.buffer.used() as _;
        let ptr = self.buffer.as_mut_ptr() as *const u8;

        if self.registered {
            opcode::WriteFixed::new(fd, ptr, len, self.buffer.buf_index())
                .offset(self.offset)
                .build()
        } else {
            opcode::Write::new(fd, ptr, len).offset(self.offset).build()
        }
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        let result = outcome(ret, self.timeout.is_some());
        (self.completion)(result, self.buffer, reactor)
    }
}

// Accept a TCP connection.
pub struct Accept {
    pub(crate) fd: RawFd,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Completion<TcpStream>,
}

impl Operation for Accept {
    fn entry(&mut self) -> Entry {
        opcode::Accept::new(types::Fd(self.fd), ptr::null_mut(), ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build()
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        let socket = outcome(ret, self.timeout.is_some())
            .map(|fd| unsafe { TcpStream::from_raw_fd(fd as RawFd) });

        (self.completion)(socket, reactor)
    }
}

// Dial a TCP connection to the given address.
pub struct Connect {
    pub(crate) socket: OwnedFd,
    pub(crate) addr: Box<SockaddrStorage>,
    pub(crate) timeout: Option<Box<types::Timespec>>,
    pub(crate) completion: Completion<TcpStream>,
}

impl Operation for Connect {
    fn entry(&mut self) -> Entry {
        opcode::Connect::new(types::Fd(self.socket.as_raw_fd()), self.addr.as_ptr(), self.addr.len())
            .build()
    }

    fn deadline(&self) -> Option<&types::Timespec> {
        self.timeout.as_deref()
    }

    fn clear_deadline(&mut self) {
        self.timeout = None;
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        // The socket is closed on failure by dropping it.
        let socket = self.socket;
        let result = outcome(ret, self.timeout.is_some()).map(|_| TcpStream::from(socket));

        (self.completion)(result, reactor)
    }
}

// Close a descriptor. Ownership was released when the operation was built.
pub struct Close {
    pub(crate) fd: RawFd,
    pub(crate) completion: Completion<()>,
}

impl Operation for Close {
    fn entry(&mut self) -> Entry {
        opcode::Close::new(types::Fd(self.fd)).build()
    }

    fn complete(self, ret: i32, reactor: &mut UringReactor) {
        (self.completion)(outcome(ret, false).map(drop), reactor)
    }
}
