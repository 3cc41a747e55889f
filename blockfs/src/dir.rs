//! Packed directory-entry records.
//!
//! A directory's entries live in its first data block as back-to-back records:
//!
//! ```text
//! | inode: u32 | rec_len: u16 | name_len: u8 | file_type: u8 | name ... | pad to 4 |
//! ```
//!
//! All integers are little endian. `rec_len` is the distance to the next record; a
//! zero `rec_len` (zeroed space) or the end of the block terminates the list.

use std::borrow::Cow;

use crate::error::{FsError, Resource, Result};
use crate::node::{FileType, InodeNumber};
use crate::BLOCK_SIZE;

pub const DIRENT_HEADER: usize = 8;
pub const MAX_NAME_LEN: usize = 255;
pub const DOT: &[u8] = b".";
pub const DOTDOT: &[u8] = b"..";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Builds an entry sized to fit `name`.
    ///
    /// # Errors
    ///
    /// Names must be non-empty, at most [`MAX_NAME_LEN`] bytes, and free of `/`
    /// and NUL.
    pub fn new(inode: InodeNumber, name: &[u8], kind: FileType) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            inode,
            rec_len: Self::encoded_len(name.len()) as u16,
            file_type: kind as u16 as u8,
            name: name.to_vec(),
        })
    }

    /// Record length for a name of `name_len` bytes, rounded up to 4.
    pub fn encoded_len(name_len: usize) -> usize {
        (DIRENT_HEADER + name_len + 3) & !3
    }

    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_raw(self.file_type as u16)
    }

    /// Writes the record at the start of `buf`, which must hold `rec_len` bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let rec_len = self.rec_len as usize;
        buf[..rec_len].fill(0);
        buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
        buf[4..6].copy_from_slice(&self.rec_len.to_le_bytes());
        buf[6] = self.name.len() as u8;
        buf[7] = self.file_type;
        buf[DIRENT_HEADER..DIRENT_HEADER + self.name.len()].copy_from_slice(&self.name);
    }

    /// Reads the record at the start of `buf`. Returns `None` for a terminator
    /// (zero `rec_len`) or a record whose lengths do not fit.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DIRENT_HEADER {
            return None;
        }
        let inode = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let rec_len = u16::from_le_bytes([buf[4], buf[5]]);
        let name_len = buf[6] as usize;
        let rec = rec_len as usize;
        if rec < DIRENT_HEADER || rec > buf.len() || DIRENT_HEADER + name_len > rec {
            return None;
        }
        Some(Self {
            inode,
            rec_len,
            file_type: buf[7],
            name: buf[DIRENT_HEADER..DIRENT_HEADER + name_len].to_vec(),
        })
    }
}

pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty file name".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong(name.len()));
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(FsError::InvalidArgument(format!(
            "file name {:?} contains a separator or NUL",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// Iterator over the records of one directory block, yielding each record with
/// its byte offset.
pub struct Entries<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (usize, DirEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = DirEntry::decode(self.block.get(self.offset..)?)?;
        let at = self.offset;
        self.offset += entry.rec_len as usize;
        Some((at, entry))
    }
}

pub fn entries(block: &[u8]) -> Entries<'_> {
    Entries { block, offset: 0 }
}

/// Inode number recorded under `name`, compared byte for byte.
pub fn lookup(block: &[u8], name: &[u8]) -> Option<InodeNumber> {
    entries(block)
        .find(|(_, e)| e.inode != 0 && e.name == name)
        .map(|(_, e)| e.inode)
}

/// Bytes occupied by the packed records.
pub fn used_len(block: &[u8]) -> usize {
    entries(block)
        .last()
        .map(|(at, e)| at + e.rec_len as usize)
        .unwrap_or(0)
}

/// Appends `entry` after the last record and returns the new used length.
pub fn append(block: &mut [u8], entry: &DirEntry) -> Result<usize> {
    if lookup(block, &entry.name).is_some() {
        return Err(FsError::AlreadyExists);
    }
    let used = used_len(block);
    let end = used + entry.rec_len as usize;
    if end > block.len() {
        return Err(FsError::Exhausted(Resource::DirectorySpace));
    }
    entry.encode_into(&mut block[used..end]);
    Ok(end)
}

/// Drops the record named `name` and repacks the rest. Returns the removed entry
/// and the new used length.
pub fn remove(block: &mut [u8], name: &[u8]) -> Result<(DirEntry, usize)> {
    let mut kept: Vec<DirEntry> = Vec::new();
    let mut removed = None;
    for (_, entry) in entries(block) {
        if removed.is_none() && entry.name == name {
            removed = Some(entry);
        } else {
            kept.push(entry);
        }
    }
    let removed = removed.ok_or(FsError::NotFound)?;

    block.fill(0);
    let mut offset = 0;
    for entry in &kept {
        let end = offset + entry.rec_len as usize;
        entry.encode_into(&mut block[offset..end]);
        offset = end;
    }
    Ok((removed, offset))
}

/// First block of a new directory: `.` naming itself, `..` naming its parent.
pub fn new_dir_block(this: InodeNumber, parent: InodeNumber) -> Result<(Vec<u8>, usize)> {
    let mut block = vec![0; BLOCK_SIZE];
    append(&mut block, &DirEntry::new(this, DOT, FileType::Directory)?)?;
    let used = append(&mut block, &DirEntry::new(parent, DOTDOT, FileType::Directory)?)?;
    Ok((block, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_four_byte_aligned() {
        assert_eq!(DirEntry::encoded_len(1), 12);
        assert_eq!(DirEntry::encoded_len(4), 12);
        assert_eq!(DirEntry::encoded_len(5), 16);
    }

    #[test]
    fn new_directory_block_holds_dot_entries() {
        let (block, used) = new_dir_block(1, 1).unwrap();
        let names: Vec<(Vec<u8>, u32)> = entries(&block).map(|(_, e)| (e.name, e.inode)).collect();
        assert_eq!(names, vec![(b".".to_vec(), 1), (b"..".to_vec(), 1)]);
        assert_eq!(used, 24);
        assert_eq!(used_len(&block), used);
    }

    #[test]
    fn lookup_matches_whole_names_only() {
        let (mut block, _) = new_dir_block(3, 1).unwrap();
        append(&mut block, &DirEntry::new(9, b"notes", FileType::Regular).unwrap()).unwrap();

        assert_eq!(lookup(&block, b"notes"), Some(9));
        assert_eq!(lookup(&block, b"note"), None);
        assert_eq!(lookup(&block, b"notes2"), None);
        assert_eq!(lookup(&block, b".."), Some(1));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (mut block, _) = new_dir_block(3, 1).unwrap();
        let entry = DirEntry::new(9, b"a", FileType::Regular).unwrap();
        append(&mut block, &entry).unwrap();
        assert!(matches!(append(&mut block, &entry), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn full_block_reports_no_space() {
        let (mut block, _) = new_dir_block(1, 1).unwrap();
        let mut appended = 0;
        let err = loop {
            let name = format!("{:0>200}", appended);
            match append(&mut block, &DirEntry::new(5, name.as_bytes(), FileType::Regular).unwrap()) {
                Ok(_) => appended += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, FsError::Exhausted(Resource::DirectorySpace)));
        // (4096 - 24) / 208
        assert_eq!(appended, 19);
    }

    #[test]
    fn remove_repacks_remaining_entries() {
        let (mut block, _) = new_dir_block(2, 1).unwrap();
        append(&mut block, &DirEntry::new(5, b"first", FileType::Regular).unwrap()).unwrap();
        append(&mut block, &DirEntry::new(6, b"second", FileType::Regular).unwrap()).unwrap();

        let (gone, used) = remove(&mut block, b"first").unwrap();
        assert_eq!(gone.inode, 5);
        assert_eq!(lookup(&block, b"first"), None);
        assert_eq!(lookup(&block, b"second"), Some(6));
        assert_eq!(used, used_len(&block));
        assert!(matches!(remove(&mut block, b"first"), Err(FsError::NotFound)));
    }

    #[test]
    fn corrupt_record_length_stops_the_scan() {
        let (mut block, _) = new_dir_block(1, 1).unwrap();
        // Point the second record past the end of the block.
        block[12 + 4..12 + 6].copy_from_slice(&5000u16.to_le_bytes());
        assert_eq!(entries(&block).count(), 1);
        assert_eq!(lookup(&block, b".."), None);
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(DirEntry::new(1, b"", FileType::Regular).is_err());
        assert!(DirEntry::new(1, b"a/b", FileType::Regular).is_err());
        assert!(matches!(
            DirEntry::new(1, &[b'x'; 256], FileType::Regular),
            Err(FsError::NameTooLong(256))
        ));
    }
}
