//! Anonymous pipes.
//!
//! A pipe is a fixed-size ring buffer shared by a read end and a write
//! end. Both ends are plain [`File`](crate::file::File)s wrapping the
//! same [`PipeHandle`] index; which end is which is recorded by the
//! `File`'s own `readable`/`writable` flags, exactly as for any other
//! file, so closing one only tears the pipe down once both ends agree
//! it's done with it.
//!
//! Reads and writes block on the pipe's own [`Sleepablelock`], waking the
//! other side whenever they make progress.

use crate::kernel::kernel;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::{NPIPE, PIPESIZE};

struct PipeState {
    data: [u8; PIPESIZE],
    nread: u32,
    nwrite: u32,
    readopen: bool,
    writeopen: bool,
}

impl PipeState {
    const fn new() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }
}

pub struct PipeTable {
    in_use: Spinlock<[bool; NPIPE]>,
    contents: [Sleepablelock<PipeState>; NPIPE],
}

impl PipeTable {
    pub fn new() -> Self {
        use array_macro::array;
        Self {
            in_use: Spinlock::new("pipe.table", [false; NPIPE]),
            contents: array![_ => Sleepablelock::new("pipe", PipeState::new()); NPIPE],
        }
    }

    /// Allocates a fresh pipe, returning one handle for each end.
    pub fn alloc(&'static self) -> Option<(PipeHandle, PipeHandle)> {
        let mut in_use = self.in_use.lock();
        let i = in_use.iter().position(|used| !used)?;
        in_use[i] = true;
        drop(in_use);
        *self.contents[i].lock() = PipeState::new();
        Some((PipeHandle { index: i }, PipeHandle { index: i }))
    }
}

impl Default for PipeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to one end of a pipe. Cheap to copy; carries no read/write
/// direction of its own — the owning `File` decides that.
#[derive(Clone, Copy)]
pub struct PipeHandle {
    index: usize,
}

impl PipeHandle {
    /// Reads up to `dst.len()` bytes, blocking while the pipe is empty
    /// and still has a writer. Returns `Ok(0)` once the last writer has
    /// closed and the buffer has been drained.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let pipes = &kernel().pipes;
        let lock = &pipes.contents[self.index];
        let mut guard = lock.lock();
        loop {
            if guard.nread != guard.nwrite {
                let mut n = 0;
                while n < dst.len() && guard.nread != guard.nwrite {
                    dst[n] = guard.data[guard.nread as usize % PIPESIZE];
                    guard.nread = guard.nread.wrapping_add(1);
                    n += 1;
                }
                drop(guard);
                lock.wake_all();
                return Ok(n);
            }
            if !guard.writeopen {
                return Ok(0);
            }
            lock.sleep(&mut guard);
        }
    }

    /// Writes all of `src`, blocking while the pipe is full and still has
    /// a reader. Fails once the reader has gone away.
    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let pipes = &kernel().pipes;
        let lock = &pipes.contents[self.index];
        let mut guard = lock.lock();
        let mut written = 0;
        while written < src.len() {
            if !guard.readopen {
                return Err(());
            }
            if guard.nwrite.wrapping_sub(guard.nread) as usize == PIPESIZE {
                lock.sleep(&mut guard);
                continue;
            }
            let idx = guard.nwrite as usize % PIPESIZE;
            guard.data[idx] = src[written];
            guard.nwrite = guard.nwrite.wrapping_add(1);
            written += 1;
        }
        drop(guard);
        lock.wake_all();
        Ok(written)
    }

    /// Marks this end closed. `writable` is the closing `File`'s own
    /// flag, i.e. which end is going away. Frees the pipe's slot once
    /// both ends have closed.
    pub fn close(&self, writable: bool) {
        let pipes = &kernel().pipes;
        let lock = &pipes.contents[self.index];
        let mut guard = lock.lock();
        if writable {
            guard.writeopen = false;
        } else {
            guard.readopen = false;
        }
        let both_closed = !guard.readopen && !guard.writeopen;
        drop(guard);
        lock.wake_all();
        if both_closed {
            pipes.in_use.lock()[self.index] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::kernel_init_for_test;

    #[test]
    fn write_then_read_round_trips() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        let (reader, writer) = kernel().pipes.alloc().expect("pipe table exhausted");
        let n = writer.write(b"hi").unwrap();
        assert_eq!(n, 2);
        let mut buf = [0u8; 2];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
        writer.close(true);
        reader.close(false);
    }

    #[test]
    fn read_returns_zero_after_writer_closes() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        let (reader, writer) = kernel().pipes.alloc().expect("pipe table exhausted");
        writer.close(true);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Ok(0));
        reader.close(false);
    }
}
