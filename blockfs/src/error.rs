use std::fmt;

use thiserror::Error;

/// The finite resources a volume can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Blocks,
    Inodes,
    Descriptors,
    /// The first (and only) block of a directory has no room for another entry.
    DirectorySpace,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Blocks => "data blocks",
            Resource::Inodes => "inodes",
            Resource::Descriptors => "file descriptors",
            Resource::DirectorySpace => "directory entry space",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("name of {0} bytes exceeds the directory entry limit")]
    NameTooLong(usize),
    #[error("found no file at path")]
    NotFound,
    #[error("descriptor {0} is not open")]
    BadDescriptor(usize),
    #[error("{0} is not allocated")]
    NotAllocated(u32),
    #[error("out of {0}")]
    Exhausted(Resource),
    #[error("block device failure")]
    Io(#[from] std::io::Error),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("an entry with that name already exists")]
    AlreadyExists,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("volume is not mounted")]
    NotMounted,
    #[error("volume is already mounted")]
    AlreadyMounted,
    #[error("superblock magic {0:#010x} does not identify a blockfs volume")]
    BadMagic(u32),
    #[error("invalid file system layout: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, FsError>;
