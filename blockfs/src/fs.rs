use std::cmp::min;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::alloc::{blocks_for_bits, BlockAllocator};
use crate::dir::{self, DirEntry, DOT, DOTDOT};
use crate::error::{FsError, Resource, Result};
use crate::fd::{DescriptorTable, FileDescriptor, FileHandle, OpenFlags};
use crate::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use crate::node::{FileType, Inode, InodeNumber, InodeTable};
use crate::sb::{SuperBlock, FEATURE_JOURNAL, STATE_CLEAN, STATE_MOUNTED};
use crate::{BLOCK_SIZE, INODE_COUNT, MAX_FILE_SIZE, MAX_OPEN_FILES, NUM_DIRECT, ROOT_INODE};

/// Known locations.
const SUPERBLOCK_INDEX: usize = 0;
const BLOCK_BMP: u32 = 1;

const ROOT_DEFAULT_MODE: u16 = 0o755;

/// Format-time settings. Everything else about the layout is fixed at compile time.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOptions {
    block_count: usize,
    label: String,
    journaling: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_count: 1024,
            label: "blockfs".to_string(),
            journaling: false,
        }
    }
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of a freshly created image. Ignored when formatting an existing device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    /// Records the journaling feature bit in the superblock. No journal is kept.
    pub fn with_journaling(mut self, journaling: bool) -> Self {
        self.journaling = journaling;
        self
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

/// What `stat` reports about a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub ino: InodeNumber,
    pub file_type: FileType,
    pub perm: u16,
    pub uid: u16,
    pub gid: u16,
    pub links: u16,
    pub size: u64,
    pub blocks: u32,
    pub created: u32,
    pub modified: u32,
    pub accessed: u32,
}

fn system_clock() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Splits an absolute path into its parent path and final component.
fn split_parent(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(
            "path must start with \"/\"".to_string(),
        ));
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => {
            Ok((if parent.is_empty() { "/" } else { parent }, name))
        }
        _ => Err(FsError::InvalidArgument(format!(
            "{:?} does not name an entry",
            path
        ))),
    }
}

/// Checks that every metadata region a loaded superblock records lies on the
/// device, between the superblock and the first data block.
fn check_layout(sb: &SuperBlock, device_blocks: usize) -> Result<()> {
    if sb.blocks_count as usize > device_blocks {
        return Err(FsError::Corrupt(format!(
            "volume spans {} blocks but device holds {}",
            sb.blocks_count, device_blocks
        )));
    }
    if sb.inodes_count != INODE_COUNT {
        return Err(FsError::Corrupt(format!(
            "volume records {} inodes, this build supports {}",
            sb.inodes_count, INODE_COUNT
        )));
    }
    if sb.first_data_block >= sb.blocks_count {
        return Err(FsError::Corrupt(format!(
            "first data block {} is past the end of a {} block volume",
            sb.first_data_block, sb.blocks_count
        )));
    }

    let regions = [
        ("block bitmap", sb.block_bitmap, blocks_for_bits(sb.blocks_count as usize)),
        ("inode bitmap", sb.inode_bitmap, blocks_for_bits(sb.inodes_count as usize)),
        ("inode table", sb.inode_table, InodeTable::table_blocks(sb.inodes_count)),
    ];
    for (name, start, len) in regions {
        if start == SUPERBLOCK_INDEX as u32 || start as u64 + len as u64 > sb.first_data_block as u64 {
            return Err(FsError::Corrupt(format!(
                "{} at block {} ({} blocks) is outside the metadata region",
                name, start, len
            )));
        }
    }
    Ok(())
}

/// A mounted-or-not volume on owned block storage.
///
/// # Layout
/// ===================================================================================
/// | SuperBlock | Bitmap (blocks) | Bitmap (inodes) | Inodes | Root dir | Data Region |
/// ===================================================================================
///
/// All metadata lives in memory and is written through on every change: the full
/// bitmap on each allocate/free, the inode's table block on each inode update, the
/// whole table when an inode is freed. Nothing is atomic across steps.
pub struct Volume<T: BlockStorage> {
    dev: T,
    super_block: SuperBlock,
    blocks: BlockAllocator,
    inodes: InodeTable,
    files: DescriptorTable,
    mounted: bool,
    clock: fn() -> u32,
}

impl Volume<FileBlockEmulator> {
    /// Creates (`create == true`) or reopens the image file at `path`.
    ///
    /// A new image is sized from `options` and formatted; an existing one is sized
    /// from its length and loaded from the layout its superblock records.
    pub fn init<P: AsRef<Path>>(path: P, create: bool, options: &FormatOptions) -> Result<Self> {
        let path = path.as_ref();
        if create {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            let dev = FileBlockEmulatorBuilder::from(file)
                .with_block_count(options.block_count())
                .build()?;
            Volume::format(dev, options)
        } else {
            let nblocks = std::fs::metadata(path)?.len() as usize / BLOCK_SIZE;
            let dev = FileBlockEmulator::open_disk(path, nblocks)?;
            Volume::load(dev)
        }
    }
}

impl<T: BlockStorage> Volume<T> {
    /// Lays a fresh file system onto the whole device.
    pub fn format(mut dev: T, options: &FormatOptions) -> Result<Self> {
        let clock: fn() -> u32 = system_clock;
        let now = clock();
        let total = dev.block_count();
        if total > u32::MAX as usize {
            return Err(FsError::InvalidArgument(format!(
                "{} blocks exceed the addressable range",
                total
            )));
        }

        let inode_bitmap = BLOCK_BMP + blocks_for_bits(total) as u32;
        let inode_table = inode_bitmap + blocks_for_bits(INODE_COUNT as usize) as u32;
        let first_data_block = inode_table + InodeTable::table_blocks(INODE_COUNT) as u32;
        if first_data_block as usize >= total {
            return Err(FsError::InvalidArgument(format!(
                "device of {} blocks cannot hold metadata plus a root directory",
                total
            )));
        }

        let mut super_block = SuperBlock::new();
        super_block.blocks_count = total as u32;
        super_block.inodes_count = INODE_COUNT;
        super_block.first_data_block = first_data_block;
        super_block.inode_table = inode_table;
        super_block.block_bitmap = BLOCK_BMP;
        super_block.inode_bitmap = inode_bitmap;
        super_block.created_at = now as u64;
        super_block.set_label(&options.label);
        if options.journaling {
            super_block.features |= FEATURE_JOURNAL;
        }

        // Metadata and the root directory's block are allocated up front.
        let mut blocks = BlockAllocator::new(total as u32, BLOCK_BMP);
        for blocknr in 0..=first_data_block {
            blocks.reserve(blocknr);
        }
        let mut inodes = InodeTable::new(INODE_COUNT, inode_table, inode_bitmap);
        inodes.reserve(ROOT_INODE);

        let (root_block, used) = dir::new_dir_block(ROOT_INODE, ROOT_INODE)?;
        dev.write_block(first_data_block as usize, &root_block)?;

        let mut root = Inode::with_kind(FileType::Directory, ROOT_DEFAULT_MODE, now);
        root.links_count = 2;
        root.blocks[0] = first_data_block;
        root.blocks_count = 1;
        root.size = used as u32;
        inodes.write(&mut dev, ROOT_INODE, root)?;
        inodes.persist(&mut dev)?;
        blocks.persist(&mut dev)?;

        super_block.free_blocks_count = total as u32 - blocks.bitmap().count_used() as u32;
        super_block.free_inodes_count = INODE_COUNT - inodes.used();

        let mut volume = Volume {
            dev,
            super_block,
            blocks,
            inodes,
            files: DescriptorTable::new(MAX_OPEN_FILES),
            mounted: false,
            clock,
        };
        volume.sync_super_block()?;
        volume.dev.sync_disk()?;
        info!(
            "formatted {:?}: {} blocks, {} inodes, data from block {}",
            options.label, total, INODE_COUNT, first_data_block
        );
        Ok(volume)
    }

    /// Loads an existing volume from the locations its superblock records.
    pub fn load(mut dev: T) -> Result<Self> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        dev.read_block(SUPERBLOCK_INDEX, &mut block_buf)?;
        let super_block = SuperBlock::parse(&block_buf)?;
        check_layout(&super_block, dev.block_count())?;

        let blocks = BlockAllocator::load(&mut dev, &super_block)?;
        let inodes = InodeTable::load(&mut dev, &super_block)?;

        let used_blocks = blocks.bitmap().count_used() as u32;
        if super_block.blocks_count.checked_sub(used_blocks) != Some(super_block.free_blocks_count) {
            return Err(FsError::Corrupt(format!(
                "superblock counts {} free blocks, bitmap marks {} of {} used",
                super_block.free_blocks_count, used_blocks, super_block.blocks_count
            )));
        }
        if super_block.inodes_count.checked_sub(inodes.used()) != Some(super_block.free_inodes_count) {
            return Err(FsError::Corrupt(format!(
                "superblock counts {} free inodes, bitmap marks {} of {} used",
                super_block.free_inodes_count,
                inodes.used(),
                super_block.inodes_count
            )));
        }
        if !inodes.get(ROOT_INODE).map(Inode::is_dir).unwrap_or(false) {
            return Err(FsError::Corrupt("root inode is not a directory".to_string()));
        }
        if super_block.state == STATE_MOUNTED {
            warn!("volume {:?} was not cleanly unmounted", super_block.label());
        }

        info!(
            "opened {:?}: {}/{} blocks free, {}/{} inodes free",
            super_block.label(),
            super_block.free_blocks_count,
            super_block.blocks_count,
            super_block.free_inodes_count,
            super_block.inodes_count
        );
        Ok(Volume {
            dev,
            super_block,
            blocks,
            inodes,
            files: DescriptorTable::new(MAX_OPEN_FILES),
            mounted: false,
            clock: system_clock,
        })
    }

    /// Replaces the wall clock used for every timestamp.
    pub fn with_clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = clock;
        self
    }

    pub fn mount(&mut self) -> Result<()> {
        if self.mounted {
            return Err(FsError::AlreadyMounted);
        }
        self.mounted = true;
        self.super_block.mount_count += 1;
        self.super_block.mounted_at = self.now() as u64;
        self.super_block.state = STATE_MOUNTED;
        self.sync_super_block()?;
        info!(
            "mounted {:?} (mount #{})",
            self.super_block.label(),
            self.super_block.mount_count
        );
        Ok(())
    }

    /// Force-closes every open descriptor and flushes the device.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        let closed = self.files.close_all();
        self.mounted = false;
        self.super_block.state = STATE_CLEAN;
        self.sync_super_block()?;
        self.dev.sync_disk()?;
        info!(
            "unmounted {:?}, closed {} open files",
            self.super_block.label(),
            closed
        );
        Ok(())
    }

    /// Unmounts if needed and hands the backing device back.
    pub fn destroy(mut self) -> Result<T> {
        if self.mounted {
            self.unmount()?;
        } else {
            self.dev.sync_disk()?;
        }
        Ok(self.dev)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    pub fn open_files(&self) -> usize {
        self.files.open_count()
    }

    /// Maps an absolute path to its inode number. `/` is always [`ROOT_INODE`].
    pub fn resolve(&mut self, path: &str) -> Result<InodeNumber> {
        if path == "/" {
            return Ok(ROOT_INODE);
        }
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument(
                "path must start with \"/\"".to_string(),
            ));
        }

        let mut inum = ROOT_INODE;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let (_, block) = self.dir_block(inum)?;
            inum = dir::lookup(&block, part.as_bytes()).ok_or(FsError::NotFound)?;
        }
        // Entries are not trusted: the target must still be live.
        self.inodes.get(inum)?;
        debug!("resolved {} to inode {}", path, inum);
        Ok(inum)
    }

    /// Opens a file descriptor at the path provided. By default, this implementation will return an
    /// error if the file does not exists. Set [`OpenFlags::CREATE`] to create a regular file with
    /// permission bits `mode` and link it into its parent directory.
    pub fn open(&mut self, path: &str, flags: OpenFlags, mode: u16) -> Result<FileHandle> {
        self.ensure_mounted()?;
        let inum = match self.resolve(path) {
            Ok(inum) => inum,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => self.create_file(path, mode)?,
            Err(e) => return Err(e),
        };
        if self.inodes.get(inum)?.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let (_, writable) = flags.rdwr_flags();
        if writable && flags.contains(OpenFlags::TRUNC) {
            self.truncate(inum)?;
        }

        let handle = self.files.open(inum, self.inodes.generation(inum), flags)?;
        let now = self.now();
        self.inodes.get_mut(inum)?.access_time = now;
        self.inodes.sync(&mut self.dev, inum)?;
        Ok(handle)
    }

    /// Writes are durable per call, so closing only releases the slot.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        self.ensure_mounted()?;
        let desc = self.files.close(handle)?;
        debug!("closed fd {} (inode {})", handle, desc.inode);
        Ok(())
    }

    /// Reads from the descriptor's cursor into `buf`. Returns the bytes read, 0 at
    /// end of file. Only the direct blocks are reachable; the read comes back short
    /// at the first unset pointer.
    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let desc = self.descriptor(handle)?;
        if !desc.flags.rdwr_flags().0 {
            return Err(FsError::InvalidArgument(format!(
                "descriptor {} is not open for reading",
                handle
            )));
        }
        let inum = desc.inode;
        let node = *self.inodes.get(inum)?;
        if desc.cursor >= node.size as u64 {
            return Ok(0);
        }

        let want = min(buf.len() as u64, node.size as u64 - desc.cursor) as usize;
        let mut done = 0;
        let mut block_buf = vec![0; BLOCK_SIZE];
        while done < want {
            let pos = desc.cursor as usize + done;
            let index = pos / BLOCK_SIZE;
            if index >= NUM_DIRECT || node.blocks[index] == 0 {
                break;
            }
            if let Err(e) = self.dev.read_block(node.blocks[index] as usize, &mut block_buf) {
                if done == 0 {
                    return Err(e.into());
                }
                warn!("read of inode {} stopped at byte {}: {}", inum, pos, e);
                break;
            }
            let offset = pos % BLOCK_SIZE;
            let n = min(BLOCK_SIZE - offset, want - done);
            buf[done..done + n].copy_from_slice(&block_buf[offset..offset + n]);
            done += n;
        }

        self.files.get_mut(handle)?.cursor += done as u64;
        let now = self.now();
        self.inodes.get_mut(inum)?.access_time = now;
        self.inodes.sync(&mut self.dev, inum)?;
        Ok(done)
    }

    /// Writes `buf` at the descriptor's cursor (at end of file with
    /// [`OpenFlags::APPEND`]), allocating blocks as needed. Returns the bytes
    /// written; anything past the last direct block is dropped, as is the rest of
    /// the buffer if the volume fills up part way.
    pub fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let desc = self.descriptor(handle)?;
        if !desc.flags.rdwr_flags().1 {
            return Err(FsError::InvalidArgument(format!(
                "descriptor {} is not open for writing",
                handle
            )));
        }
        let inum = desc.inode;
        let mut node = *self.inodes.get(inum)?;
        let start = if desc.flags.contains(OpenFlags::APPEND) {
            node.size as u64
        } else {
            desc.cursor
        };

        let (done, failure) = self.write_blocks(&mut node, start, buf);
        let cursor = start + done as u64;
        // A write that lands no bytes leaves the size alone, wherever the cursor is.
        if done > 0 {
            if cursor > node.size as u64 {
                node.size = min(cursor, MAX_FILE_SIZE as u64) as u32;
            }
            node.update_time = self.now();
        }
        *self.inodes.get_mut(inum)? = node;
        self.inodes.sync(&mut self.dev, inum)?;
        self.files.get_mut(handle)?.cursor = cursor;

        match failure {
            Some(e) if done == 0 => Err(e),
            Some(e) => {
                warn!("write to inode {} cut short after {} bytes: {}", inum, done, e);
                Ok(done)
            }
            None => Ok(done),
        }
    }

    /// Copies `buf` into the file's blocks from byte `start`, recording new blocks
    /// in `node`. Returns the bytes copied and the error that stopped it, if any.
    fn write_blocks(&mut self, node: &mut Inode, start: u64, buf: &[u8]) -> (usize, Option<FsError>) {
        let mut done = 0;
        let mut block_buf = vec![0; BLOCK_SIZE];
        while done < buf.len() {
            let pos = start + done as u64;
            if pos >= MAX_FILE_SIZE as u64 {
                warn!(
                    "write truncated at {} bytes, files are limited to {} direct blocks",
                    pos, NUM_DIRECT
                );
                break;
            }
            let (index, offset) = (pos as usize / BLOCK_SIZE, pos as usize % BLOCK_SIZE);
            let n = min(BLOCK_SIZE - offset, buf.len() - done);

            let blocknr = if node.blocks[index] == 0 {
                let blocknr = match self.alloc_block() {
                    Ok(blocknr) => blocknr,
                    Err(e) => return (done, Some(e)),
                };
                node.blocks[index] = blocknr;
                node.blocks_count += 1;
                block_buf.fill(0);
                blocknr
            } else {
                let blocknr = node.blocks[index];
                if n < BLOCK_SIZE {
                    if let Err(e) = self.dev.read_block(blocknr as usize, &mut block_buf) {
                        return (done, Some(e.into()));
                    }
                }
                blocknr
            };

            block_buf[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            if let Err(e) = self.dev.write_block(blocknr as usize, &block_buf) {
                return (done, Some(e.into()));
            }
            done += n;
        }
        (done, None)
    }

    /// Moves the descriptor's cursor. Positions past the end of file are allowed.
    pub fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64> {
        self.ensure_mounted()?;
        let desc = self.descriptor(handle)?;
        let size = self.inodes.get(desc.inode)?.size as i64;
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).ok(),
            SeekFrom::Current(delta) => (desc.cursor as i64).checked_add(delta),
            SeekFrom::End(delta) => size.checked_add(delta),
        };
        match target {
            Some(target) if target >= 0 => {
                self.files.get_mut(handle)?.cursor = target as u64;
                Ok(target as u64)
            }
            _ => Err(FsError::InvalidArgument(
                "seek to a negative or overflowing position".to_string(),
            )),
        }
    }

    pub fn fstat(&self, handle: FileHandle) -> Result<Metadata> {
        self.ensure_mounted()?;
        let desc = self.descriptor(handle)?;
        self.metadata(desc.inode)
    }

    pub fn stat(&mut self, path: &str) -> Result<Metadata> {
        self.ensure_mounted()?;
        let inum = self.resolve(path)?;
        self.metadata(inum)
    }

    /// Lists a directory's entries in on-disk order, `.` and `..` included.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.ensure_mounted()?;
        let inum = self.resolve(path)?;
        let (_, block) = self.dir_block(inum)?;
        Ok(dir::entries(&block).map(|(_, entry)| entry).collect())
    }

    /// Creates an empty directory holding `.` and `..`.
    pub fn mkdir(&mut self, path: &str, mode: u16) -> Result<InodeNumber> {
        self.ensure_mounted()?;
        let (parent_path, name) = split_parent(path)?;
        dir::validate_name(name.as_bytes())?;
        let parent = self.resolve(parent_path)?;
        self.check_room(parent, name)?;

        let inum = self.alloc_inode()?;
        let blocknr = match self.alloc_block() {
            Ok(blocknr) => blocknr,
            Err(e) => {
                self.free_inode(inum)?;
                return Err(e);
            }
        };
        let (block, used) = dir::new_dir_block(inum, parent)?;
        self.dev.write_block(blocknr as usize, &block)?;

        let mut node = Inode::with_kind(FileType::Directory, mode, self.now());
        node.links_count = 2;
        node.blocks[0] = blocknr;
        node.blocks_count = 1;
        node.size = used as u32;
        self.inodes.write(&mut self.dev, inum, node)?;

        self.link_entry(parent, name, inum, FileType::Directory)?;
        self.inodes.get_mut(parent)?.links_count += 1;
        self.inodes.sync(&mut self.dev, parent)?;
        debug!("mkdir {} -> inode {}", path, inum);
        Ok(inum)
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = split_parent(path)?;
        if name.as_bytes() == DOT || name.as_bytes() == DOTDOT {
            return Err(FsError::InvalidArgument(format!("cannot remove {:?}", path)));
        }
        let inum = self.resolve(path)?;
        if inum == ROOT_INODE {
            return Err(FsError::InvalidArgument(
                "cannot remove the root directory".to_string(),
            ));
        }
        let (_, block) = self.dir_block(inum)?;
        if dir::entries(&block).any(|(_, e)| e.name != DOT && e.name != DOTDOT) {
            return Err(FsError::NotEmpty);
        }

        let parent = self.resolve(parent_path)?;
        self.unlink_entry(parent, name)?;
        let mut node = *self.inodes.get(inum)?;
        self.release_blocks(&mut node)?;
        self.free_inode(inum)?;

        let parent_node = self.inodes.get_mut(parent)?;
        parent_node.links_count = parent_node.links_count.saturating_sub(1);
        self.inodes.sync(&mut self.dev, parent)?;
        debug!("rmdir {} (inode {})", path, inum);
        Ok(())
    }

    /// Removes a name. The file's blocks and inode are released with its last link.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.ensure_mounted()?;
        let (parent_path, name) = split_parent(path)?;
        let inum = self.resolve(path)?;
        let mut node = *self.inodes.get(inum)?;
        if node.is_dir() {
            return Err(FsError::IsADirectory);
        }

        let parent = self.resolve(parent_path)?;
        self.unlink_entry(parent, name)?;
        node.links_count = node.links_count.saturating_sub(1);
        if node.links_count == 0 {
            self.release_blocks(&mut node)?;
            self.free_inode(inum)?;
        } else {
            node.update_time = self.now();
            self.inodes.write(&mut self.dev, inum, node)?;
        }
        debug!("unlinked {} (inode {})", path, inum);
        Ok(())
    }

    fn create_file(&mut self, path: &str, mode: u16) -> Result<InodeNumber> {
        let (parent_path, name) = split_parent(path)?;
        dir::validate_name(name.as_bytes())?;
        let parent = self.resolve(parent_path)?;
        self.check_room(parent, name)?;

        let inum = self.alloc_inode()?;
        let node = Inode::with_kind(FileType::Regular, mode, self.now());
        self.inodes.write(&mut self.dev, inum, node)?;
        self.link_entry(parent, name, inum, FileType::Regular)?;
        debug!("created {} as inode {}", path, inum);
        Ok(inum)
    }

    fn truncate(&mut self, inum: InodeNumber) -> Result<()> {
        let mut node = *self.inodes.get(inum)?;
        self.release_blocks(&mut node)?;
        node.size = 0;
        node.update_time = self.now();
        self.inodes.write(&mut self.dev, inum, node)
    }

    /// Frees every direct block of `node` and clears its pointers.
    fn release_blocks(&mut self, node: &mut Inode) -> Result<()> {
        for slot in node.blocks.iter_mut() {
            if *slot != 0 {
                self.blocks.free(&mut self.dev, &mut self.super_block, *slot)?;
                *slot = 0;
            }
        }
        node.blocks_count = 0;
        self.sync_super_block()
    }

    /// The directory's first (and only) data block.
    fn dir_block(&mut self, inum: InodeNumber) -> Result<(u32, Vec<u8>)> {
        let node = self.inodes.get(inum)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let blocknr = node.blocks[0];
        if blocknr == 0 {
            return Err(FsError::Corrupt(format!("directory inode {} has no data block", inum)));
        }
        let mut block = vec![0; BLOCK_SIZE];
        self.dev.read_block(blocknr as usize, &mut block)?;
        Ok((blocknr, block))
    }

    /// Fails unless `name` could be linked into `parent` right now.
    fn check_room(&mut self, parent: InodeNumber, name: &str) -> Result<()> {
        let (_, block) = self.dir_block(parent)?;
        if dir::lookup(&block, name.as_bytes()).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if dir::used_len(&block) + DirEntry::encoded_len(name.len()) > BLOCK_SIZE {
            return Err(FsError::Exhausted(Resource::DirectorySpace));
        }
        Ok(())
    }

    fn link_entry(&mut self, parent: InodeNumber, name: &str, child: InodeNumber, kind: FileType) -> Result<()> {
        let (blocknr, mut block) = self.dir_block(parent)?;
        let used = dir::append(&mut block, &DirEntry::new(child, name.as_bytes(), kind)?)?;
        self.dev.write_block(blocknr as usize, &block)?;
        self.touch_dir(parent, used)
    }

    fn unlink_entry(&mut self, parent: InodeNumber, name: &str) -> Result<DirEntry> {
        let (blocknr, mut block) = self.dir_block(parent)?;
        let (removed, used) = dir::remove(&mut block, name.as_bytes())?;
        self.dev.write_block(blocknr as usize, &block)?;
        self.touch_dir(parent, used)?;
        Ok(removed)
    }

    fn touch_dir(&mut self, inum: InodeNumber, used: usize) -> Result<()> {
        let now = self.now();
        let node = self.inodes.get_mut(inum)?;
        node.size = used as u32;
        node.update_time = now;
        self.inodes.sync(&mut self.dev, inum)
    }

    /// Allocates a data block, zero-fills it and persists the counters.
    fn alloc_block(&mut self) -> Result<u32> {
        let blocknr = self.blocks.allocate(&mut self.dev, &mut self.super_block)?;
        self.sync_super_block()?;
        self.dev.write_block(blocknr as usize, &vec![0; BLOCK_SIZE])?;
        Ok(blocknr)
    }

    fn alloc_inode(&mut self) -> Result<InodeNumber> {
        let inum = self.inodes.allocate(&mut self.dev, &mut self.super_block)?;
        self.sync_super_block()?;
        Ok(inum)
    }

    fn free_inode(&mut self, inum: InodeNumber) -> Result<()> {
        self.inodes.free(&mut self.dev, &mut self.super_block, inum)?;
        self.sync_super_block()
    }

    fn metadata(&self, inum: InodeNumber) -> Result<Metadata> {
        let node = self.inodes.get(inum)?;
        let file_type = node
            .file_type()
            .ok_or_else(|| FsError::Corrupt(format!("inode {} has unknown type {}", inum, node.kind)))?;
        Ok(Metadata {
            ino: inum,
            file_type,
            perm: node.mode,
            uid: node.uid,
            gid: node.gid,
            links: node.links_count,
            size: node.size as u64,
            blocks: node.blocks_count,
            created: node.create_time,
            modified: node.update_time,
            accessed: node.access_time,
        })
    }

    fn sync_super_block(&mut self) -> Result<()> {
        self.super_block.written_at = self.now() as u64;
        self.dev
            .write_block(SUPERBLOCK_INDEX, &self.super_block.serialize())?;
        Ok(())
    }

    /// The open descriptor behind `handle`, provided its file still exists.
    fn descriptor(&self, handle: FileHandle) -> Result<FileDescriptor> {
        let desc = *self.files.get(handle)?;
        if !self.inodes.is_allocated(desc.inode) || self.inodes.generation(desc.inode) != desc.generation {
            return Err(FsError::NotFound);
        }
        Ok(desc)
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(FsError::NotMounted)
        }
    }

    fn now(&self) -> u32 {
        (self.clock)()
    }
}
