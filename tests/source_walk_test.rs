mod common;

use std::fs;
use std::sync::Arc;

use common::{gpt_geometry, MemoryProvider, RecordingDevice, MIB};
use diskstage::disk::commands::{backup, restore};
use diskstage::disk::fs::NativeFilesystems;
use diskstage::disk::source::EntryClass;
use diskstage::{CancelToken, DiskError, DiskImageTarget, RestoreOptions, SourceDisk, StoreState};
use gpt::{disk::LogicalBlockSize, partition_types, GptConfig};
use std::io::Read;
use tempfile::TempDir;

const DISK_SIZE: u64 = 4 * MIB;

fn make_gpt_image(path: &std::path::Path) {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .expect("create image");
    file.set_len(DISK_SIZE).expect("size image");

    let mut gdisk = GptConfig::new()
        .writable(true)
        .logical_block_size(LogicalBlockSize::Lb512)
        .create_from_device(file, None)
        .expect("create gpt");
    gdisk
        .add_partition_at("data", 1, 2048, 2048, partition_types::LINUX_FS, 0)
        .expect("add partition");
    gdisk.write().expect("write gpt");
}

#[test]
fn walks_gpt_image_in_order() {
    let temp = TempDir::new().expect("temp dir");
    let disk = temp.path().join("disk.img");
    make_gpt_image(&disk);

    let source = SourceDisk::open(&disk, 512, Arc::new(NativeFilesystems)).expect("open");
    let geometry = source.geometry();
    assert_eq!(geometry.partitions.len(), 1);
    assert_eq!(geometry.partitions[0].start_offset, MIB);
    assert_eq!(geometry.partitions[0].size, MIB);
    assert!(geometry.filesystems.is_empty());

    let paths: Vec<String> = source.walk().map(|e| e.path).collect();
    assert_eq!(
        paths,
        vec![
            "root/geometry.json",
            "root",
            "root/mbr.bin",
            "root/gpt_primary.bin",
            "root/gpt_backup.bin",
            "root/part_GPT_1",
            "root/part_GPT_1/raw.bin",
        ]
    );
}

#[test]
fn raw_partition_reads_device_bytes() {
    let temp = TempDir::new().expect("temp dir");
    let disk = temp.path().join("disk.img");
    make_gpt_image(&disk);
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = fs::OpenOptions::new().write(true).open(&disk).expect("open");
        f.seek(SeekFrom::Start(MIB)).expect("seek");
        f.write_all(b"payload").expect("write");
    }

    let source = SourceDisk::open(&disk, 512, Arc::new(NativeFilesystems)).expect("open");
    let raw = source
        .walk()
        .find(|e| e.path == "root/part_GPT_1/raw.bin")
        .expect("raw item");
    assert_eq!(raw.metadata.size, Some(MIB));

    let mut data = Vec::new();
    source
        .open_read(&raw)
        .expect("open raw")
        .read_to_end(&mut data)
        .expect("read raw");
    assert_eq!(data.len() as u64, MIB);
    assert_eq!(&data[..7], b"payload");
}

#[test]
fn unreadable_directory_is_skipped() {
    let provider = Arc::new(MemoryProvider::default());
    let volume = provider.volume(1);
    volume.insert("docs/report.txt", b"quarterly");
    volume.insert("secret/key.bin", b"k");
    volume.insert("zeta.txt", b"z");
    volume.break_dir("secret");

    let device = Arc::new(RecordingDevice::new(DISK_SIZE));
    let source =
        SourceDisk::from_parts(device, gpt_geometry(DISK_SIZE), provider).expect("source");
    let entries: Vec<_> = source.walk().collect();
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();

    assert!(paths.contains(&"root/part_GPT_1/fs_NTFS"));
    assert!(paths.contains(&"root/part_GPT_1/fs_NTFS/docs/report.txt"));
    assert!(paths.contains(&"root/part_GPT_1/fs_NTFS/secret"));
    assert!(!paths.contains(&"root/part_GPT_1/fs_NTFS/secret/key.bin"));
    assert!(paths.contains(&"root/part_GPT_1/fs_NTFS/zeta.txt"));
    // A partition with a filesystem backend has no raw item.
    assert!(!paths.contains(&"root/part_GPT_1/raw.bin"));
    assert!(paths.contains(&"root/part_GPT_2/raw.bin"));

    let report = entries
        .iter()
        .find(|e| e.path.ends_with("report.txt"))
        .expect("report");
    assert_eq!(report.metadata.class, EntryClass::File);
    assert_eq!(report.metadata.size, Some(9));
}

#[test]
fn backup_then_restore_reproduces_the_device() {
    let mut image = vec![0u8; DISK_SIZE as usize];
    image[..512].fill(0x11);
    image[(2 * MIB) as usize..(2 * MIB + 4096) as usize].fill(0x22);
    let source_device = Arc::new(RecordingDevice::from_bytes(image));

    let source_fs = Arc::new(MemoryProvider::default());
    source_fs.volume(1).insert("docs/report.txt", b"quarterly");
    source_fs.volume(1).insert("readme.txt", b"hello");
    let source = SourceDisk::from_parts(
        source_device.clone(),
        gpt_geometry(DISK_SIZE),
        source_fs,
    )
    .expect("source");

    let temp = TempDir::new().expect("temp dir");
    let out = temp.path().join("backup");
    fs::create_dir_all(&out).expect("out dir");
    let summary = backup::backup_source(&source, &out).expect("backup");
    assert_eq!(summary.skipped, 0);
    assert!(out.join("root/geometry.json").is_file());
    assert!(out.join("root/part_GPT_1/fs_NTFS/docs/report.txt").is_file());

    let target_device = Arc::new(RecordingDevice::new(DISK_SIZE));
    let target_fs = Arc::new(MemoryProvider::default());
    let mut target = DiskImageTarget::with_device(
        target_device.clone(),
        RestoreOptions::default(),
        target_fs.clone(),
    );
    restore::restore_into(&target, &out, &CancelToken::new()).expect("restore");
    assert_eq!(target.state(), Some(StoreState::Finalized));
    target.dispose();

    let restored = target_device.snapshot();
    let original = source_device.snapshot();
    assert_eq!(restored[..512], original[..512]);
    let p2 = (2 * MIB) as usize..(2 * MIB + 512 * 1024) as usize;
    assert_eq!(restored[p2.clone()], original[p2]);
    assert_eq!(
        target_fs.volume(1).get("docs/report.txt").as_deref(),
        Some(&b"quarterly"[..])
    );
    assert_eq!(target_fs.volume(1).get("readme.txt").as_deref(), Some(&b"hello"[..]));
}

#[test]
fn cancelled_restore_stops_before_first_item() {
    let source_fs = Arc::new(MemoryProvider::default());
    source_fs.volume(1).insert("readme.txt", b"hello");
    let source = SourceDisk::from_parts(
        Arc::new(RecordingDevice::new(DISK_SIZE)),
        gpt_geometry(DISK_SIZE),
        source_fs,
    )
    .expect("source");
    let temp = TempDir::new().expect("temp dir");
    backup::backup_source(&source, temp.path()).expect("backup");

    let target_device = Arc::new(RecordingDevice::new(DISK_SIZE));
    let target_fs = Arc::new(MemoryProvider::default());
    let target = DiskImageTarget::with_device(
        target_device.clone(),
        RestoreOptions::default(),
        target_fs.clone(),
    );
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = restore::restore_into(&target, temp.path(), &cancel).expect_err("cancelled");
    assert!(matches!(
        err.downcast_ref::<DiskError>(),
        Some(DiskError::Cancelled)
    ));
    assert_eq!(target.state(), Some(StoreState::Open));
    let store = target.store().expect("store");
    assert!(store.geometry().is_none());
    assert_eq!(store.pending_count(), 0);
    assert_eq!(target_fs.volume(1).get("readme.txt"), None);
    assert_eq!(target_device.writes(), 0);
}

#[test]
fn backup_refuses_non_empty_directory() {
    let temp = TempDir::new().expect("temp dir");
    let disk = temp.path().join("disk.img");
    make_gpt_image(&disk);
    let out = temp.path().join("out");
    fs::create_dir_all(&out).expect("out dir");
    fs::write(out.join("stale.txt"), b"x").expect("stale file");

    let err = backup::backup(&disk, 512, Arc::new(NativeFilesystems), &out, false);
    assert!(err.is_err());

    let summary =
        backup::backup(&disk, 512, Arc::new(NativeFilesystems), &out, true).expect("overwrite");
    assert_eq!(summary.items, 5);
}
