use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, ops, slice};

use parking_lot::Mutex;

use crate::cause::{Cause, Result};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Default allocation granularity; large enough for most I/O buffers.
pub const CHUNK_SIZE: usize = 16 * KIB;

const ARENA_ALIGN: usize = 4096;

/// Hands out fixed buffers carved from one contiguous arena.
///
/// The arena is split into equally sized chunks and a bitmap tracks which
/// chunks are in use. Allocation is first-fit from the start of the arena,
/// which keeps low addresses dense but fragments under widely varying sizes.
/// Callers that care should allocate uniformly sized buffers, or allocate
/// everything once at startup.
pub struct ChunkedAllocator {
    arena: NonNull<u8>,
    layout: Layout,
    chunk_size: usize,
    total_chunks: usize,
    chunks: Mutex<ChunkMap>,
}

// The arena is only reached through FixedBuffers, which cover disjoint ranges.
unsafe impl Send for ChunkedAllocator {}
unsafe impl Sync for ChunkedAllocator {}

impl ChunkedAllocator {
    pub fn new(arena_size: usize) -> Result<Arc<Self>> {
        Self::with_chunk_size(arena_size, CHUNK_SIZE)
    }

    pub fn with_chunk_size(arena_size: usize, chunk_size: usize) -> Result<Arc<Self>> {
        if chunk_size == 0 {
            return Err(Cause::fault("chunk size must be positive"));
        }

        let total_chunks = arena_size / chunk_size;

        if total_chunks == 0 {
            return Err(Cause::fault(format!(
                "arena of {} bytes cannot hold a single {} byte chunk",
                arena_size, chunk_size
            )));
        }

        let layout = Layout::from_size_align(total_chunks * chunk_size, ARENA_ALIGN)
            .map_err(|err| Cause::fault(err.to_string()))?;

        let arena = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or_else(|| Cause::out_of_memory("failed to allocate the buffer arena"))?;

        Ok(Arc::new(Self {
            arena,
            layout,
            chunk_size,
            total_chunks,
            chunks: Mutex::new(ChunkMap::new(total_chunks)),
        }))
    }

    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<FixedBuffer> {
        let needed = self.chunks_for(size);

        if needed > self.total_chunks {
            return Err(exhausted(size));
        }

        let mut chunks = self.chunks.lock();
        let mut start = 0;

        while let Some(from) = chunks.next_clear(start) {
            if from + needed > self.total_chunks {
                break;
            }

            let free = chunks.clear_run(from, needed);

            if free == needed {
                chunks.set(from, needed);

                return Ok(FixedBuffer {
                    allocator: self.clone(),
                    offset: from * self.chunk_size,
                    capacity: size,
                    used: 0,
                });
            }

            // Chunk `from + free` is taken, resume right after it.
            start = from + free + 1;
        }

        Err(exhausted(size))
    }

    fn release(&self, offset: usize, capacity: usize) {
        let from = offset / self.chunk_size;
        let count = self.chunks_for(capacity);

        self.chunks.lock().clear(from, count);
    }

    fn chunks_for(&self, size: usize) -> usize {
        size.div_ceil(self.chunk_size).max(1)
    }

    /// Release the arena. Fails, handing the allocator back, while any
    /// buffer or other handle still refers to it.
    pub fn close(self: Arc<Self>) -> std::result::Result<(), Arc<Self>> {
        Arc::try_unwrap(self).map(drop)
    }

    /// One character per chunk, `U` for used and `.` for free. Every 64th
    /// chunk ends a line.
    pub fn allocation_map(&self) -> String {
        let chunks = self.chunks.lock();
        let mut map = String::with_capacity(self.total_chunks + self.total_chunks / 64);

        for index in 0..self.total_chunks {
            map.push(if chunks.get(index) { 'U' } else { '.' });

            if index % 64 == 63 {
                map.push('\n');
            }
        }

        map
    }

    pub fn free_chunks(&self) -> usize {
        self.total_chunks - self.chunks.lock().count_set()
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn arena_size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn arena_ptr(&self) -> *mut u8 {
        self.arena.as_ptr()
    }
}

impl Drop for ChunkedAllocator {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.arena.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for ChunkedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkedAllocator({:p})", self.arena)
    }
}

fn exhausted(size: usize) -> Cause {
    Cause::out_of_memory(format!("no room for a {} byte buffer", size))
}

/// A contiguous run of chunks handed out by a [`ChunkedAllocator`].
///
/// The chunks go back to the allocator when the buffer is dropped. The buffer
/// keeps its allocator alive, so it can never outlive the arena.
pub struct FixedBuffer {
    allocator: Arc<ChunkedAllocator>,
    offset: usize,
    capacity: usize,
    used: usize,
}

impl FixedBuffer {
    pub fn dispose(self) {}

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of meaningful bytes, as set by the last read or by the caller.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn set_used(&mut self, used: usize) {
        self.used = used.min(self.capacity);
    }

    pub fn filled(&self) -> &[u8] {
        &self[..self.used]
    }

    pub fn clear(&mut self) {
        self.fill(0);
        self.used = 0;
    }

    /// Byte offset of this buffer within the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Index of the registered buffer backing this one; the whole arena is
    /// registered as a single buffer.
    pub fn buf_index(&self) -> u16 {
        0
    }

    pub fn allocator(&self) -> &Arc<ChunkedAllocator> {
        &self.allocator
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.allocator.arena_ptr().add(self.offset) }
    }
}

impl ops::Deref for FixedBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.allocator.arena_ptr().add(self.offset), self.capacity) }
    }
}

impl ops::DerefMut for FixedBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.capacity) }
    }
}

impl Drop for FixedBuffer {
    fn drop(&mut self) {
        self.allocator.release(self.offset, self.capacity);
    }
}

impl fmt::Debug for FixedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuffer")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

// Occupancy bitmap, one bit per chunk.
struct ChunkMap {
    words: Vec<u64>,
    len: usize,
}

impl ChunkMap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
            len,
        }
    }

    fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn next_clear(&self, from: usize) -> Option<usize> {
        (from..self.len).find(|&index| !self.get(index))
    }

    // Length of the clear run starting at `from`, capped at `limit`.
    fn clear_run(&self, from: usize, limit: usize) -> usize {
        (from..self.len)
            .take(limit)
            .take_while(|&index| !self.get(index))
            .count()
    }

    fn set(&mut self, from: usize, count: usize) {
        for index in from..(from + count).min(self.len) {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    fn clear(&mut self, from: usize, count: usize) {
        for index in from..(from + count).min(self.len) {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    fn count_set(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
