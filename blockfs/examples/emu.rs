use std::io::SeekFrom;

use blockfs::io::FileBlockEmulatorBuilder;
use blockfs::{FormatOptions, OpenFlags, Volume};

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let options = FormatOptions::new().with_label("emu");
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(options.block_count())
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new fs on the device, mount it and write a file under /home
    let mut fs = Volume::format(dev, &options).expect("should format");
    fs.mount().unwrap();
    fs.mkdir("/home", 0o755).unwrap();

    let fd = fs.open("/home/hello.txt", OpenFlags::CREATE, 0o644).unwrap();
    fs.write(fd, b"hello from a block device\n").unwrap();
    fs.seek(fd, SeekFrom::Start(0)).unwrap();
    let mut buf = [0u8; 64];
    let n = fs.read(fd, &mut buf).unwrap();
    print!("{}", String::from_utf8_lossy(&buf[..n]));
    fs.close(fd).unwrap();

    for entry in fs.read_dir("/home").unwrap() {
        let meta = fs.stat(&format!("/home/{}", entry.name_str())).unwrap();
        println!("{:>6} {:?} {}", meta.size, meta.file_type, entry.name_str());
    }
    println!(
        "{} of {} blocks free",
        fs.super_block().free_blocks_count,
        fs.super_block().blocks_count
    );
    fs.destroy().unwrap();
}
