use crate::error::{FsError, Resource, Result};
use crate::io::BlockStorage;
use crate::sb::SuperBlock;
use crate::BLOCK_SIZE;

use log::{debug, warn};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One bit per tracked unit (block or inode), packed least significant bit first.
/// Occupies `ceil(len / 8)` bytes, spread over as many disk blocks as needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; (len + 7) / 8],
            len,
        }
    }

    /// Reads a bitmap of `len` bits from the front of `buf`.
    pub fn parse(buf: &[u8], len: usize) -> Result<Self> {
        let bytes = (len + 7) / 8;
        if buf.len() < bytes {
            return Err(FsError::Corrupt(format!(
                "bitmap of {} bits needs {} bytes, found {}",
                len,
                bytes,
                buf.len()
            )));
        }
        let mut bits = buf[..bytes].to_vec();
        // Padding past `len` is not part of the map.
        if len % 8 != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << (len % 8)) - 1;
            }
        }
        Ok(Self { bits, len })
    }

    /// Encodes the bitmap padded out to whole disk blocks.
    pub fn serialize(&self) -> Vec<u8> {
        let mut encoded = self.bits.clone();
        encoded.resize(self.blocks_spanned() * BLOCK_SIZE, 0);
        encoded
    }

    /// Number of disk blocks the bitmap occupies.
    pub fn blocks_spanned(&self) -> usize {
        blocks_for_bits(self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> State {
        assert!(index < self.len, "bit {} outside bitmap of {}", index, self.len);
        match (self.bits[index / 8] >> (index % 8)) & 1 {
            0 => State::Free,
            _ => State::Used,
        }
    }

    pub fn set_reserved(&mut self, index: usize) {
        assert!(index < self.len, "bit {} outside bitmap of {}", index, self.len);
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn set_free(&mut self, index: usize) {
        assert!(index < self.len, "bit {} outside bitmap of {}", index, self.len);
        self.bits[index / 8] &= !(1 << (index % 8));
    }

    /// Population count of set bits.
    pub fn count_used(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Free positions at or after `from`, lowest first.
    pub fn free_slots(&self, from: usize) -> NextAvailableAllocation<'_> {
        NextAvailableAllocation {
            marker: from,
            bitmap: self,
        }
    }

    pub fn load<T: BlockStorage>(dev: &mut T, start: u32, len: usize) -> Result<Self> {
        let nblocks = blocks_for_bits(len);
        let mut raw = vec![0; nblocks * BLOCK_SIZE];
        for (i, chunk) in raw.chunks_mut(BLOCK_SIZE).enumerate() {
            dev.read_block(start as usize + i, chunk)?;
        }
        Bitmap::parse(&raw, len)
    }

    /// Rewrites every block of the bitmap starting at disk block `start`.
    pub fn persist<T: BlockStorage>(&self, dev: &mut T, start: u32) -> Result<()> {
        for (i, chunk) in self.serialize().chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(start as usize + i, chunk)?;
        }
        Ok(())
    }
}

/// Disk blocks needed to hold a bitmap of `bits` bits.
pub fn blocks_for_bits(bits: usize) -> usize {
    let bytes = (bits + 7) / 8;
    ((bytes + BLOCK_SIZE - 1) / BLOCK_SIZE).max(1)
}

/// Walks a bitmap from a starting position and yields each free slot in order. This
/// is the first-fit policy: there is no allocation cursor carried between calls, every
/// allocation scans from the same floor.
pub struct NextAvailableAllocation<'a> {
    /// Keeps track of the next starting place for looking for available slots.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl<'a> Iterator for NextAvailableAllocation<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len() {
            let i = self.marker;
            self.marker += 1;
            if let State::Free = self.bitmap.get(i) {
                return Some(i);
            }
        }
        None
    }
}

/// Data block allocator backed by the on-disk block bitmap. Allocation never hands
/// out a block below the superblock's first data block.
pub struct BlockAllocator {
    bitmap: Bitmap,
    /// First disk block of the persisted bitmap.
    location: u32,
}

impl BlockAllocator {
    pub fn new(total_blocks: u32, location: u32) -> Self {
        Self {
            bitmap: Bitmap::new(total_blocks as usize),
            location,
        }
    }

    pub fn load<T: BlockStorage>(dev: &mut T, sb: &SuperBlock) -> Result<Self> {
        Ok(Self {
            bitmap: Bitmap::load(dev, sb.block_bitmap, sb.blocks_count as usize)?,
            location: sb.block_bitmap,
        })
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Marks a block used without touching counters or disk. Used while laying out
    /// metadata at format time.
    pub(crate) fn reserve(&mut self, blocknr: u32) {
        self.bitmap.set_reserved(blocknr as usize);
    }

    pub fn is_allocated(&self, blocknr: u32) -> bool {
        (blocknr as usize) < self.bitmap.len() && self.bitmap.get(blocknr as usize) == State::Used
    }

    /// Claims the lowest free block at or above the first data block, decrements
    /// the free counter and rewrites the whole bitmap. The caller persists the
    /// superblock.
    pub fn allocate<T: BlockStorage>(&mut self, dev: &mut T, sb: &mut SuperBlock) -> Result<u32> {
        let blocknr = match self.bitmap.free_slots(sb.first_data_block as usize).next() {
            Some(blocknr) => blocknr,
            None => {
                warn!("no free data blocks left on volume");
                return Err(FsError::Exhausted(Resource::Blocks));
            }
        };
        self.bitmap.set_reserved(blocknr);
        sb.free_blocks_count = sb.free_blocks_count.saturating_sub(1);
        self.persist(dev)?;
        debug!("allocated block {}", blocknr);
        Ok(blocknr as u32)
    }

    /// Releases a data block. The block's contents are left as they are.
    pub fn free<T: BlockStorage>(&mut self, dev: &mut T, sb: &mut SuperBlock, blocknr: u32) -> Result<()> {
        if blocknr < sb.first_data_block || blocknr as usize >= self.bitmap.len() {
            return Err(FsError::InvalidArgument(format!(
                "block {} is outside the data region",
                blocknr
            )));
        }
        if self.bitmap.get(blocknr as usize) == State::Free {
            return Err(FsError::NotAllocated(blocknr));
        }
        self.bitmap.set_free(blocknr as usize);
        sb.free_blocks_count += 1;
        self.persist(dev)?;
        debug!("freed block {}", blocknr);
        Ok(())
    }

    pub fn persist<T: BlockStorage>(&self, dev: &mut T) -> Result<()> {
        self.bitmap.persist(dev, self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileBlockEmulator, FileBlockEmulatorBuilder};

    fn device(blocks: usize) -> FileBlockEmulator {
        FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
            .with_block_count(blocks)
            .build()
            .unwrap()
    }

    fn data_super_block(total: u32, first_data: u32) -> SuperBlock {
        let mut sb = SuperBlock::new();
        sb.blocks_count = total;
        sb.first_data_block = first_data;
        sb.block_bitmap = 1;
        sb.free_blocks_count = total - first_data;
        sb
    }

    fn allocator(sb: &SuperBlock) -> BlockAllocator {
        let mut alloc = BlockAllocator::new(sb.blocks_count, sb.block_bitmap);
        for blocknr in 0..sb.first_data_block {
            alloc.reserve(blocknr);
        }
        alloc
    }

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new(64);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(0);
        bmp.set_reserved(4095);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(4095), State::Used);
        assert_eq!(bmp.count_used(), 2);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new(16);
        bmp.set_reserved(9);
        bmp.set_reserved(10);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits in the same byte survive.
        assert_eq!(bmp.get(9), State::Used);
    }

    #[test]
    fn serialized_bitmap_fills_whole_blocks() {
        let mut bmp = Bitmap::new(1024);
        bmp.set_reserved(10);
        bmp.set_reserved(1023);

        let encoded = bmp.serialize();
        assert_eq!(encoded.len(), BLOCK_SIZE);
        assert_eq!(Bitmap::parse(&encoded, 1024).unwrap(), bmp);

        let wide = Bitmap::new(BLOCK_SIZE * 8 + 1);
        assert_eq!(wide.blocks_spanned(), 2);
    }

    #[test]
    fn parsing_ignores_bits_past_the_end() {
        let bmp = Bitmap::parse(&[0xff, 0xff], 10).unwrap();
        assert_eq!(bmp.count_used(), 10);
        assert_eq!(bmp.serialize()[1], 0b11);
    }

    #[test]
    fn free_slots_skip_used_bits() {
        let mut bmp = Bitmap::new(8);
        for i in [0, 1, 3] {
            bmp.set_reserved(i);
        }
        let slots: Vec<usize> = bmp.free_slots(1).collect();
        assert_eq!(slots, vec![2, 4, 5, 6, 7]);
    }

    #[test]
    fn allocation_is_first_fit_above_data_floor() {
        let mut dev = device(16);
        let mut sb = data_super_block(16, 4);
        let mut alloc = allocator(&sb);

        assert_eq!(alloc.allocate(&mut dev, &mut sb).unwrap(), 4);
        assert_eq!(alloc.allocate(&mut dev, &mut sb).unwrap(), 5);
        alloc.free(&mut dev, &mut sb, 4).unwrap();
        assert_eq!(alloc.allocate(&mut dev, &mut sb).unwrap(), 4);
        assert_eq!(
            sb.free_blocks_count as usize,
            16 - alloc.bitmap().count_used()
        );
    }

    #[test]
    fn exhausted_allocator_reports_it() {
        let mut dev = device(6);
        let mut sb = data_super_block(6, 4);
        let mut alloc = allocator(&sb);

        alloc.allocate(&mut dev, &mut sb).unwrap();
        alloc.allocate(&mut dev, &mut sb).unwrap();
        assert!(matches!(
            alloc.allocate(&mut dev, &mut sb),
            Err(FsError::Exhausted(Resource::Blocks))
        ));
        assert_eq!(sb.free_blocks_count, 0);
    }

    #[test]
    fn freeing_unallocated_or_metadata_blocks_fails() {
        let mut dev = device(16);
        let mut sb = data_super_block(16, 4);
        let mut alloc = allocator(&sb);

        assert!(matches!(
            alloc.free(&mut dev, &mut sb, 7),
            Err(FsError::NotAllocated(7))
        ));
        assert!(matches!(
            alloc.free(&mut dev, &mut sb, 0),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            alloc.free(&mut dev, &mut sb, 16),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn every_change_rewrites_the_bitmap_on_disk() {
        let mut dev = device(16);
        let mut sb = data_super_block(16, 4);
        let mut alloc = allocator(&sb);

        alloc.allocate(&mut dev, &mut sb).unwrap();
        let reloaded = BlockAllocator::load(&mut dev, &sb).unwrap();
        assert_eq!(reloaded.bitmap(), alloc.bitmap());
        assert!(reloaded.is_allocated(4));
    }
}
