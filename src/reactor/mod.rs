//! The I/O reactor seam.
//!
//! A worker owns exactly one reactor and drives it from its loop: queued
//! operations are flushed with [`Reactor::process_submissions`] and finished
//! ones are dispatched to their callbacks by [`Reactor::process_completions`],
//! always on the worker thread. Callbacks receive the reactor itself so they
//! can chain the next operation.
//!
//! Operations that move a buffer into the kernel hand it back to the callback
//! together with the outcome, whether it succeeded or not.

pub mod op;
mod uring;

#[cfg(test)]
pub(crate) mod testing;

pub use uring::UringReactor;

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{OwnedFd, RawFd};
use std::time::Duration;

use crate::buffer::FixedBuffer;
use crate::cause::Result;

pub trait Reactor: Sized + 'static {
    /// Flush queued operations to the kernel. Returns how many were flushed.
    fn process_submissions(&mut self) -> usize;

    /// Run the callbacks of finished operations. Returns how many ran.
    fn process_completions(&mut self) -> usize;

    fn nop<F>(&mut self, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static;

    /// Complete after `duration` with the time actually spent waiting.
    fn delay<F>(&mut self, duration: Duration, completion: F)
    where
        F: FnOnce(Result<Duration>, &mut Self) + 'static;

    /// Read into `buffer`. `fd` must stay open until the callback runs.
    fn read<F>(&mut self, fd: RawFd, buffer: Box<[u8]>, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static;

    /// Write all of `buffer`. `fd` must stay open until the callback runs.
    fn write<F>(&mut self, fd: RawFd, buffer: Box<[u8]>, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, Box<[u8]>, &mut Self) + 'static;

    /// Read into a fixed buffer, up to its capacity. On success the buffer's
    /// used length is set to the number of bytes read.
    fn read_fixed<F>(&mut self, fd: RawFd, buffer: FixedBuffer, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static;

    /// Write the used part of a fixed buffer.
    fn write_fixed<F>(&mut self, fd: RawFd, buffer: FixedBuffer, offset: u64, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<usize>, FixedBuffer, &mut Self) + 'static;

    fn accept<F>(&mut self, listener: RawFd, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static;

    fn connect<F>(&mut self, addr: SocketAddr, timeout: Option<Duration>, completion: F)
    where
        F: FnOnce(Result<TcpStream>, &mut Self) + 'static;

    fn close<F>(&mut self, fd: OwnedFd, completion: F)
    where
        F: FnOnce(Result<()>, &mut Self) + 'static;

    fn allocate_fixed_buffer(&mut self, size: usize) -> Result<FixedBuffer>;

    /// Stop accepting work and release kernel resources. Called once by the
    /// worker on its way out.
    fn shutdown(&mut self);
}
