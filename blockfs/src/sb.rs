use crate::error::{FsError, Result};
use crate::BLOCK_SIZE;

pub const SB_MAGIC: u32 = 0x4246_5342; // BFSB
pub const FS_VERSION: u32 = 1;
pub const LABEL_LEN: usize = 32;

/// Volume was cleanly unmounted (or never mounted).
pub const STATE_CLEAN: u16 = 1;
/// Volume is mounted; seeing this on load means it was not unmounted.
pub const STATE_MOUNTED: u16 = 2;

/// Journaling was requested at format time. Recorded only, nothing journals.
pub const FEATURE_JOURNAL: u16 = 0x0001;

const ENCODED_LEN: usize = 108;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Besides capacity counters it records where every metadata region lives, so a
/// volume can be reopened without knowing how it was formatted.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case BFSB.
    pub sb_magic: u32,
    pub version: u32,
    pub block_size: u32,
    /// Every block on the device, metadata included.
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    /// The first block handed out by the block allocator. At format time it holds
    /// the root directory.
    pub first_data_block: u32,
    pub inode_table: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub mount_count: u32,
    pub state: u16,
    pub features: u16,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub mounted_at: u64,
    pub written_at: u64,
    pub label: [u8; LABEL_LEN],
}

impl Default for SuperBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl SuperBlock {
    pub fn new() -> Self {
        Self {
            sb_magic: SB_MAGIC,
            version: FS_VERSION,
            block_size: BLOCK_SIZE as u32,
            blocks_count: 0,
            free_blocks_count: 0,
            inodes_count: 0,
            free_inodes_count: 0,
            first_data_block: 0,
            inode_table: 0,
            block_bitmap: 0,
            inode_bitmap: 0,
            mount_count: 0,
            state: STATE_CLEAN,
            features: 0,
            created_at: 0,
            mounted_at: 0,
            written_at: 0,
            label: [0; LABEL_LEN],
        }
    }

    /// Reads the super block from a buffer of exactly size BLOCK_SIZE.
    ///
    /// # Errors
    ///
    /// Fails on a buffer of the wrong size, a magic number other than [`SB_MAGIC`],
    /// or a recorded block size this build cannot address.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidArgument(format!(
                "superblock buffer must be {} bytes, got {}",
                BLOCK_SIZE,
                buf.len()
            )));
        }

        let read_magic = be_u32(buf, 0);
        if read_magic != SB_MAGIC {
            return Err(FsError::BadMagic(read_magic));
        }

        let mut label = [0; LABEL_LEN];
        label.copy_from_slice(&buf[76..76 + LABEL_LEN]);
        let sb = Self {
            sb_magic: read_magic,
            version: be_u32(buf, 4),
            block_size: be_u32(buf, 8),
            blocks_count: be_u32(buf, 12),
            free_blocks_count: be_u32(buf, 16),
            inodes_count: be_u32(buf, 20),
            free_inodes_count: be_u32(buf, 24),
            first_data_block: be_u32(buf, 28),
            inode_table: be_u32(buf, 32),
            block_bitmap: be_u32(buf, 36),
            inode_bitmap: be_u32(buf, 40),
            mount_count: be_u32(buf, 44),
            state: be_u16(buf, 48),
            features: be_u16(buf, 50),
            created_at: be_u64(buf, 52),
            mounted_at: be_u64(buf, 60),
            written_at: be_u64(buf, 68),
            label,
        };

        if sb.block_size != BLOCK_SIZE as u32 {
            return Err(FsError::Corrupt(format!(
                "volume uses {} byte blocks, expected {}",
                sb.block_size, BLOCK_SIZE
            )));
        }
        Ok(sb)
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    /// The encoding is a series of struct fields with big endian alignment.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sb_encoded = Vec::with_capacity(BLOCK_SIZE);
        for word in [
            self.sb_magic,
            self.version,
            self.block_size,
            self.blocks_count,
            self.free_blocks_count,
            self.inodes_count,
            self.free_inodes_count,
            self.first_data_block,
            self.inode_table,
            self.block_bitmap,
            self.inode_bitmap,
            self.mount_count,
        ] {
            sb_encoded.extend_from_slice(&word.to_be_bytes());
        }
        sb_encoded.extend_from_slice(&self.state.to_be_bytes());
        sb_encoded.extend_from_slice(&self.features.to_be_bytes());
        sb_encoded.extend_from_slice(&self.created_at.to_be_bytes());
        sb_encoded.extend_from_slice(&self.mounted_at.to_be_bytes());
        sb_encoded.extend_from_slice(&self.written_at.to_be_bytes());
        sb_encoded.extend_from_slice(&self.label);
        debug_assert_eq!(sb_encoded.len(), ENCODED_LEN);
        sb_encoded.resize(BLOCK_SIZE, 0);
        sb_encoded
    }

    /// The volume label with trailing padding removed.
    pub fn label(&self) -> String {
        let end = self.label.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }

    /// Stores `label`, cut at [`LABEL_LEN`] bytes.
    pub fn set_label(&mut self, label: &str) {
        self.label = [0; LABEL_LEN];
        let bytes = label.as_bytes();
        let len = bytes.len().min(LABEL_LEN);
        self.label[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn journaling(&self) -> bool {
        self.features & FEATURE_JOURNAL != 0
    }
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    let mut raw = [0; 2];
    raw.copy_from_slice(&buf[at..at + 2]);
    u16::from_be_bytes(raw)
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}
