//! Compile-time configuration of the storage and concurrency core.
//!
//! There is no runtime configuration layer: every knob here is fixed at
//! build time, matching the rest of the teaching kernel this crate is part
//! of. A handful of these (`NPROC`, `NOFILE`, `MAXARG`, `MAXPROCNAME`) exist
//! only because the minimal process scaffolding in `proc.rs` needs them;
//! the scheduler that would make real use of them is out of scope.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size, in bytes.
pub const BSIZE: usize = 1024;

/// Max number of distinct blocks any single FS operation may write.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Number of buffers in the block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Number of hash buckets the block cache is partitioned into.
pub const NBUCKET: usize = 13;

/// Maximum file path name, in bytes.
pub const MAXPATH: usize = 128;

/// Maximum length of a process name.
pub const MAXPROCNAME: usize = 16;

/// Size of a pipe's ring buffer, in bytes.
pub const PIPESIZE: usize = 512;

/// Maximum number of simultaneously open pipes.
pub const NPIPE: usize = 16;
