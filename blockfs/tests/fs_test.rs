use blockfs::io::{BlockStorage, FileBlockEmulatorBuilder};
use blockfs::{FileType, FormatOptions, FsError, OpenFlags, Volume, BLOCK_SIZE, NUM_DIRECT, ROOT_INODE};
use tempfile::NamedTempFile;

fn mounted(tf: &NamedTempFile, blocks: usize) -> Volume<blockfs::io::FileBlockEmulator> {
    let options = FormatOptions::new().with_block_count(blocks).with_label("scratch");
    let mut fs = Volume::init(tf.path(), true, &options).unwrap();
    fs.mount().unwrap();
    fs
}

#[test]
fn can_initialize_disk_with_filesystem() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 1024);

    assert_eq!(fs.resolve("/").unwrap(), ROOT_INODE);
    let names: Vec<(String, u32)> = fs
        .read_dir("/")
        .unwrap()
        .iter()
        .map(|e| (e.name_str().into_owned(), e.inode))
        .collect();
    assert_eq!(names, vec![(".".to_string(), 1), ("..".to_string(), 1)]);

    // The root directory's block is the first data block.
    let first_data = fs.super_block().first_data_block as usize;
    let mut dev = fs.destroy().unwrap();
    let mut block = vec![0; BLOCK_SIZE];
    dev.read_block(first_data, &mut block).unwrap();
    assert_eq!(&block[0..4], &1u32.to_le_bytes());
    assert_eq!(block[6], 1);
    assert_eq!(&block[8..9], b".");
    assert_eq!(&block[12..16], &1u32.to_le_bytes());
    assert_eq!(block[18], 2);
    assert_eq!(&block[20..22], b"..");
}

#[test]
fn unformatted_image_is_rejected() {
    let tf = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_block_count(64)
        .build()
        .unwrap();
    assert!(matches!(Volume::load(dev), Err(FsError::BadMagic(0))));
}

#[test]
fn written_data_reads_back_exactly() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 256);

    let data: Vec<u8> = (0..3 * BLOCK_SIZE + 100).map(|i| (i % 251) as u8).collect();
    let fd = fs.open("/data.bin", OpenFlags::CREATE, 0o644).unwrap();
    assert_eq!(fs.write(fd, &data).unwrap(), data.len());
    fs.close(fd).unwrap();

    let fd = fs.open("/data.bin", OpenFlags::RDONLY, 0).unwrap();
    let mut out = vec![0; data.len()];
    assert_eq!(fs.read(fd, &mut out).unwrap(), data.len());
    assert_eq!(out, data);
    // End of file.
    assert_eq!(fs.read(fd, &mut out).unwrap(), 0);
    fs.close(fd).unwrap();
}

#[test]
fn reopened_image_keeps_files_and_counters() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 256);
    fs.mkdir("/etc", 0o755).unwrap();
    let fd = fs.open("/etc/motd", OpenFlags::CREATE, 0o644).unwrap();
    fs.write(fd, b"welcome back").unwrap();
    let before = fs.super_block().clone();
    fs.destroy().unwrap();

    let mut fs = Volume::init(tf.path(), false, &FormatOptions::new()).unwrap();
    assert!(!fs.is_mounted());
    assert_eq!(fs.super_block().label(), "scratch");
    assert_eq!(fs.super_block().free_blocks_count, before.free_blocks_count);
    assert_eq!(fs.super_block().free_inodes_count, before.free_inodes_count);

    fs.mount().unwrap();
    let meta = fs.stat("/etc/motd").unwrap();
    assert_eq!(meta.file_type, FileType::Regular);
    assert_eq!(meta.size, 12);

    let fd = fs.open("/etc/motd", OpenFlags::RDONLY, 0).unwrap();
    let mut out = [0u8; 32];
    let n = fs.read(fd, &mut out).unwrap();
    assert_eq!(&out[..n], b"welcome back");
}

#[test]
fn created_files_show_up_in_their_directory() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 128);
    fs.mkdir("/src", 0o755).unwrap();
    for name in ["main.rs", "lib.rs"] {
        let fd = fs.open(&format!("/src/{}", name), OpenFlags::CREATE, 0o644).unwrap();
        fs.close(fd).unwrap();
    }

    let entries = fs.read_dir("/src").unwrap();
    let names: Vec<String> = entries.iter().map(|e| e.name_str().into_owned()).collect();
    assert_eq!(names, vec![".", "..", "main.rs", "lib.rs"]);
    assert_eq!(entries[2].file_type(), Some(FileType::Regular));
    assert!(matches!(
        fs.open("/src/missing", OpenFlags::RDONLY, 0),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.open("/nowhere/file", OpenFlags::CREATE, 0o644),
        Err(FsError::NotFound)
    ));
    assert!(matches!(
        fs.open("relative", OpenFlags::CREATE, 0o644),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn unlink_returns_blocks_and_inodes() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 128);
    let blocks = fs.super_block().free_blocks_count;
    let inodes = fs.super_block().free_inodes_count;

    let fd = fs.open("/big", OpenFlags::CREATE, 0o600).unwrap();
    let data = vec![0xAB; NUM_DIRECT * BLOCK_SIZE];
    assert_eq!(fs.write(fd, &data).unwrap(), data.len());
    fs.close(fd).unwrap();
    assert_eq!(fs.super_block().free_blocks_count, blocks - NUM_DIRECT as u32);

    fs.unlink("/big").unwrap();
    assert_eq!(fs.super_block().free_blocks_count, blocks);
    assert_eq!(fs.super_block().free_inodes_count, inodes);
    assert!(matches!(fs.stat("/big"), Err(FsError::NotFound)));
    assert!(matches!(fs.unlink("/big"), Err(FsError::NotFound)));
}

#[test]
fn unmount_closes_every_descriptor() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = mounted(&tf, 64);
    let a = fs.open("/a", OpenFlags::CREATE, 0o644).unwrap();
    let b = fs.open("/b", OpenFlags::CREATE, 0o644).unwrap();
    assert_eq!(fs.open_files(), 2);

    fs.unmount().unwrap();
    assert!(matches!(fs.read(a, &mut [0u8; 1]), Err(FsError::NotMounted)));
    fs.mount().unwrap();
    assert_eq!(fs.open_files(), 0);
    assert!(matches!(fs.write(b, b"x"), Err(FsError::BadDescriptor(_))));
}
