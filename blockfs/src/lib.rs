//! A small block-based file system stored in a single image file.
//!
//! A [`Volume`] owns a [`BlockStorage`](io::BlockStorage) device and keeps every
//! piece of metadata in memory, writing through to disk on each change. Files are
//! limited to [`NUM_DIRECT`] direct blocks and a directory to a single block of
//! entries.

mod alloc;
mod dir;
mod error;
mod fd;
mod fs;
pub mod io;
mod node;
mod sb;

pub use crate::dir::{DirEntry, MAX_NAME_LEN};
pub use crate::error::{FsError, Resource, Result};
pub use crate::fd::{FileHandle, OpenFlags};
pub use crate::fs::{FormatOptions, Metadata, Volume};
pub use crate::node::{FileType, InodeNumber};
pub use crate::sb::SuperBlock;

pub const BLOCK_SIZE: usize = 4096;
/// Bytes per on-disk inode record.
pub const INODE_SIZE: usize = 256;
pub const INODE_COUNT: u32 = 128;
/// Direct block pointers per inode. Indirect pointers are stored but never used.
pub const NUM_DIRECT: usize = 12;
pub const MAX_FILE_SIZE: usize = NUM_DIRECT * BLOCK_SIZE;
pub const MAX_OPEN_FILES: usize = 32;
/// Inode 0 is never handed out; the root directory is always 1.
pub const ROOT_INODE: InodeNumber = 1;
