use std::thread;
use std::time::Duration;

use crate::buffer::{CHUNK_SIZE, MIB};

// A scheduler always runs at least this many workers.
pub const MIN_THREADS: usize = 2;

#[derive(Clone, Debug)]
pub struct Config {
    pub threads: usize,
    pub arena_size: usize,
    pub chunk_size: usize,
    pub ring_entries: u32,
    pub idle_spin_limit: usize,
    pub idle_park: Duration,
}

impl Default for Config {
    fn default() -> Self {
        // Leave one core for the rest of the process.
        let threads = thread::available_parallelism()
            .map(|count| count.get().saturating_sub(1))
            .unwrap_or(MIN_THREADS);

        Self {
            threads: threads.max(MIN_THREADS),
            arena_size: 16 * MIB,
            chunk_size: CHUNK_SIZE,
            ring_entries: 256,
            idle_spin_limit: 4096,
            idle_park: Duration::from_micros(50),
        }
    }
}

impl Config {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(MIN_THREADS);
        self
    }

    pub fn arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    pub fn idle_spin_limit(mut self, limit: usize) -> Self {
        self.idle_spin_limit = limit;
        self
    }

    pub fn idle_park(mut self, timeout: Duration) -> Self {
        self.idle_park = timeout;
        self
    }
}
