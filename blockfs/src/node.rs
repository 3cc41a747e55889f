use crate::alloc::{Bitmap, State};
use crate::error::{FsError, Resource, Result};
use crate::io::BlockStorage;
use crate::sb::SuperBlock;
use crate::{BLOCK_SIZE, INODE_SIZE, NUM_DIRECT, ROOT_INODE};

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

const NODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Identifies an inode. 0 never names a file.
pub type InodeNumber = u32;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Device = 4,
    Pipe = 5,
    Socket = 6,
}

impl FileType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(FileType::Regular),
            2 => Some(FileType::Directory),
            3 => Some(FileType::Symlink),
            4 => Some(FileType::Device),
            5 => Some(FileType::Pipe),
            6 => Some(FileType::Socket),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, PartialEq)]
/// This structure __must be exactly 256 bytes.__
pub struct Inode {
    /// [`FileType`] discriminant, 0 while the record is free.
    pub kind: u16,
    /// Permission bits (e.g. 0o644). Stored, never enforced.
    pub mode: u16,
    /// The id of the owning user.
    pub uid: u16,
    /// The id of the owning group.
    pub gid: u16,
    /// The number of directory entries naming this inode.
    pub links_count: u16,
    pub flags: u16,
    /// The total size of the file in bytes.
    pub size: u32,
    /// Data blocks referenced by the direct pointers.
    pub blocks_count: u32,
    /// Seconds since the Unix epoch.
    pub create_time: u32,
    pub update_time: u32,
    pub access_time: u32,
    /// Data block numbers, 0 marks an unused slot.
    pub blocks: [u32; NUM_DIRECT],
    // Indirect pointers are part of the record but no code path fills them.
    pub indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
    /// Reserved for extended attributes up to the 256 byte limit.
    pub xattr: [u8; 164],
}

impl Default for Inode {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Inode {
    /// A fresh record of the given type with every timestamp set to `now`.
    pub fn with_kind(kind: FileType, mode: u16, now: u32) -> Self {
        Self {
            kind: kind as u16,
            mode,
            links_count: 1,
            create_time: now,
            update_time: now,
            access_time: now,
            ..Self::default()
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_raw(self.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }
}

/// Arena of every inode record on the volume, indexed by inode number, with the
/// bitmap that says which records are live. The whole table is held in memory and
/// written through to disk on every change.
pub struct InodeTable {
    nodes: Vec<Inode>,
    alloc_tracker: Bitmap,
    /// Bumped each time a number is freed so handles to the old file can be told
    /// apart from the next one. Memory only.
    generations: Vec<u32>,
    /// Disk block holding inode 0.
    table_start: u32,
    bitmap_start: u32,
}

impl InodeTable {
    /// An empty table with inode 0 reserved.
    pub fn new(count: u32, table_start: u32, bitmap_start: u32) -> Self {
        let mut alloc_tracker = Bitmap::new(count as usize);
        alloc_tracker.set_reserved(0);
        Self {
            nodes: vec![Inode::default(); count as usize],
            alloc_tracker,
            generations: vec![0; count as usize],
            table_start,
            bitmap_start,
        }
    }

    pub fn load<T: BlockStorage>(dev: &mut T, sb: &SuperBlock) -> Result<Self> {
        let alloc_tracker = Bitmap::load(dev, sb.inode_bitmap, sb.inodes_count as usize)?;
        let mut group = Self {
            nodes: vec![Inode::default(); sb.inodes_count as usize],
            alloc_tracker,
            generations: vec![0; sb.inodes_count as usize],
            table_start: sb.inode_table,
            bitmap_start: sb.inode_bitmap,
        };

        let mut block_buf = vec![0; BLOCK_SIZE];
        for i in 0..Self::table_blocks(sb.inodes_count) {
            dev.read_block(sb.inode_table as usize + i, &mut block_buf)?;
            group.load_block(i, &block_buf)?;
        }
        Ok(group)
    }

    /// Disk blocks needed by a table of `count` inodes.
    pub fn table_blocks(count: u32) -> usize {
        (count as usize + NODES_PER_BLOCK - 1) / NODES_PER_BLOCK
    }

    pub fn capacity(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Number of set bits, inode 0 included.
    pub fn used(&self) -> u32 {
        self.alloc_tracker.count_used() as u32
    }

    /// Inode 0 is never allocated, even though its bit is set.
    pub fn is_allocated(&self, inum: InodeNumber) -> bool {
        inum != 0
            && (inum as usize) < self.nodes.len() && self.alloc_tracker.get(inum as usize) == State::Used
    }

    /// Claims the lowest free inode number (never 0) and persists the bitmap. The
    /// record itself is left for the caller to initialize and [`write`](Self::write).
    pub fn allocate<T: BlockStorage>(&mut self, dev: &mut T, sb: &mut SuperBlock) -> Result<InodeNumber> {
        let inum = match self.alloc_tracker.free_slots(1).next() {
            Some(inum) => inum,
            None => {
                warn!("no free inodes left on volume");
                return Err(FsError::Exhausted(Resource::Inodes));
            }
        };
        self.alloc_tracker.set_reserved(inum);
        sb.free_inodes_count = sb.free_inodes_count.saturating_sub(1);
        self.persist_bitmap(dev)?;
        debug!("allocated inode {}", inum);
        Ok(inum as InodeNumber)
    }

    /// Zeroes and releases an inode, then rewrites the whole table and bitmap.
    pub fn free<T: BlockStorage>(&mut self, dev: &mut T, sb: &mut SuperBlock, inum: InodeNumber) -> Result<()> {
        if inum == 0 || inum == ROOT_INODE || inum as usize >= self.nodes.len() {
            return Err(FsError::InvalidArgument(format!("inode {} cannot be freed", inum)));
        }
        if !self.is_allocated(inum) {
            return Err(FsError::NotAllocated(inum));
        }
        self.nodes[inum as usize] = Inode::default();
        self.generations[inum as usize] = self.generations[inum as usize].wrapping_add(1);
        self.alloc_tracker.set_free(inum as usize);
        sb.free_inodes_count += 1;
        self.persist(dev)?;
        debug!("freed inode {}", inum);
        Ok(())
    }

    /// The record for a live inode.
    pub fn get(&self, inum: InodeNumber) -> Result<&Inode> {
        if !self.is_allocated(inum) {
            return Err(FsError::NotFound);
        }
        Ok(&self.nodes[inum as usize])
    }

    pub fn get_mut(&mut self, inum: InodeNumber) -> Result<&mut Inode> {
        if !self.is_allocated(inum) {
            return Err(FsError::NotFound);
        }
        Ok(&mut self.nodes[inum as usize])
    }

    /// How many times `inum` has been freed since the table was loaded.
    pub fn generation(&self, inum: InodeNumber) -> u32 {
        self.generations.get(inum as usize).copied().unwrap_or(0)
    }

    /// Stores `node` at `inum` and persists the table block that holds it. Any
    /// in-range number other than 0 is accepted whether or not it is allocated.
    pub fn write<T: BlockStorage>(&mut self, dev: &mut T, inum: InodeNumber, node: Inode) -> Result<()> {
        if inum == 0 || inum as usize >= self.nodes.len() {
            return Err(FsError::InvalidArgument(format!("inode {} out of range", inum)));
        }
        self.nodes[inum as usize] = node;
        self.sync(dev, inum)
    }

    /// Persists the table block holding the in-memory record of `inum`.
    pub fn sync<T: BlockStorage>(&self, dev: &mut T, inum: InodeNumber) -> Result<()> {
        let disk_block = inum as usize / NODES_PER_BLOCK;
        dev.write_block(
            self.table_start as usize + disk_block,
            &self.serialize_block(disk_block),
        )?;
        Ok(())
    }

    /// Rewrites the entire inode table and bitmap.
    pub fn persist<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
        for i in 0..Self::table_blocks(self.capacity()) {
            dev.write_block(self.table_start as usize + i, &self.serialize_block(i))?;
        }
        self.persist_bitmap(dev)
    }

    pub fn persist_bitmap<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
        self.alloc_tracker.persist(dev, self.bitmap_start)
    }

    /// Marks `inum` live without touching disk or counters. Format-time only.
    pub(crate) fn reserve(&mut self, inum: InodeNumber) {
        self.alloc_tracker.set_reserved(inum as usize);
    }

    /// Serializes an entire disk block of inodes for writing to disk.
    fn serialize_block(&self, disk_block: usize) -> Vec<u8> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        let first = disk_block * NODES_PER_BLOCK;
        let last = (first + NODES_PER_BLOCK).min(self.nodes.len());
        for (slot, node) in self.nodes[first..last].iter().enumerate() {
            let offset = slot * INODE_SIZE;
            block_buf[offset..offset + INODE_SIZE].copy_from_slice(node.as_bytes());
        }
        block_buf
    }

    fn load_block(&mut self, disk_block: usize, buf: &[u8]) -> Result<()> {
        let first = disk_block * NODES_PER_BLOCK;
        let last = (first + NODES_PER_BLOCK).min(self.nodes.len());
        for (slot, inum) in (first..last).enumerate() {
            let offset = slot * INODE_SIZE;
            self.nodes[inum] = Inode::read_from(&buf[offset..offset + INODE_SIZE])
                .ok_or_else(|| FsError::Corrupt(format!("unreadable inode record {}", inum)))?;
        }
        Ok(())
    }
}
