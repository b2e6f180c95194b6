use std::io::{Read, Write};
use std::sync::Arc;

use diskstage::disk::fs::{detect_filesystem, mkfs_ext4, Ext4Capability, FilesystemCapability};
use diskstage::disk::types::{Extent, FilesystemType};
use diskstage::{MemoryDevice, RawDevice};

const MIB: u64 = 1024 * 1024;

#[test]
fn disk_ext4_workflow() {
    let device: Arc<dyn RawDevice> = Arc::new(MemoryDevice::new((34 * MIB) as usize, 512));
    let extent = Extent {
        offset: MIB,
        len: 32 * MIB,
    };
    mkfs_ext4(device.clone(), extent).expect("mkfs ext4");

    let (fs_type, _) = detect_filesystem(device.as_ref(), extent).expect("detect");
    assert!(matches!(
        fs_type,
        FilesystemType::Ext2 | FilesystemType::Ext3 | FilesystemType::Ext4
    ));

    let fs = Ext4Capability::new(device.clone(), extent);
    fs.create_dir_all("etc").expect("mkdir");

    let mut stream = fs.open_write("etc/hello.txt").expect("open_write");
    stream.write_all(b"hello ext4").expect("write");
    stream.finish().expect("finish");

    let entries = fs.list_dir("etc").expect("ls");
    assert!(entries.iter().any(|e| e.name == "hello.txt" && !e.is_dir));
    assert!(fs.exists("etc/hello.txt").expect("exists"));
    assert_eq!(fs.length("etc/hello.txt").expect("length"), 10);

    let mut data = Vec::new();
    fs.open_read("etc/hello.txt")
        .expect("open_read")
        .read_to_end(&mut data)
        .expect("read");
    assert_eq!(data, b"hello ext4");
}

#[test]
fn write_creates_missing_parents() {
    let device: Arc<dyn RawDevice> = Arc::new(MemoryDevice::new((34 * MIB) as usize, 512));
    let extent = Extent {
        offset: MIB,
        len: 32 * MIB,
    };
    mkfs_ext4(device.clone(), extent).expect("mkfs ext4");

    let fs = Ext4Capability::new(device, extent);
    let mut stream = fs.open_write("var/log/boot.log").expect("open_write");
    stream.write_all(b"ok").expect("write");
    stream.finish().expect("finish");

    let root = fs.list_dir("").expect("ls root");
    assert!(root.iter().any(|e| e.name == "var" && e.is_dir));
    assert_eq!(fs.length("var/log/boot.log").expect("length"), 2);
}
