use bitflags::bitflags;
use log::debug;

use crate::error::{FsError, Resource, Result};
use crate::node::InodeNumber;

/// Index of an open file in a volume's descriptor table.
pub type FileHandle = usize;

bitflags! {
    /// Encodes open filesystem call options, see open(2).
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        /// read & write
        const RDWR = 1 << 1;
        /// if the file doesn't exist, create it
        const CREATE = 1 << 9;
        /// clear file and return an empty one
        const TRUNC = 1 << 10;
        /// every write lands at the end of the file
        const APPEND = 1 << 11;
    }
}

impl OpenFlags {
    /// Access directions granted by the flags, as `(readable, writable)`. Only
    /// `WRONLY` withholds reads; any flag other than it grants both.
    pub fn rdwr_flags(&self) -> (bool, bool) {
        if self.is_empty() {
            (true, false)
        } else if self.contains(OpenFlags::WRONLY) {
            (false, true)
        } else {
            (true, true)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDescriptor {
    pub inode: InodeNumber,
    /// Generation of `inode` when it was opened. A mismatch means the file was
    /// freed and the number handed to another one.
    pub generation: u32,
    /// Byte offset of the next read or write.
    pub cursor: u64,
    pub flags: OpenFlags,
}

/// Fixed-capacity table of open files. A slot is either empty or holds a live
/// descriptor; handles are slot indices and are reused once closed.
pub struct DescriptorTable {
    slots: Vec<Option<FileDescriptor>>,
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Places a descriptor in the lowest free slot.
    pub fn open(&mut self, inode: InodeNumber, generation: u32, flags: OpenFlags) -> Result<FileHandle> {
        let handle = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::Exhausted(Resource::Descriptors))?;
        self.slots[handle] = Some(FileDescriptor {
            inode,
            generation,
            cursor: 0,
            flags,
        });
        debug!("fd {} -> inode {}", handle, inode);
        Ok(handle)
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<FileDescriptor> {
        self.slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or(FsError::BadDescriptor(handle))
    }

    pub fn get(&self, handle: FileHandle) -> Result<&FileDescriptor> {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadDescriptor(handle))
    }

    pub fn get_mut(&mut self, handle: FileHandle) -> Result<&mut FileDescriptor> {
        self.slots
            .get_mut(handle)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor(handle))
    }

    /// Empties every slot, returning how many were open.
    pub fn close_all(&mut self) -> usize {
        let open = self.open_count();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        open
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
