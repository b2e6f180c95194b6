use anyhow::{anyhow, bail, Result};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, PoisonError};

use rsext4::{
    entries::DirEntryIterator,
    file::{read_file, truncate, write_file},
    loopfile::{get_file_inode, resolve_inode_block_allextend},
    mkfs, Ext4FileSystem, Jbd2Dev, BLOCK_SIZE,
};
use rsext4::disknode::Ext4Inode;

use super::super::device::RawDevice;
use super::super::io::PartitionBlockDev;
use super::super::path::normalize_path;
use super::super::types::{DirEntry, Extent, FilesystemType};
use super::{FilesystemCapability, FsStream};

struct Ext4Ops<'a> {
    jbd: &'a mut Jbd2Dev<PartitionBlockDev>,
    fs: &'a mut Ext4FileSystem,
}

fn block_dev(device: Arc<dyn RawDevice>, extent: Extent, min_blocks: u64) -> Result<PartitionBlockDev> {
    let block_size = BLOCK_SIZE as u64;
    let usable = extent.len - (extent.len % block_size);
    if usable < block_size * min_blocks {
        bail!("partition too small for ext4");
    }
    let total_blocks = usable / block_size;
    Ok(PartitionBlockDev::new(device, extent.offset, total_blocks, BLOCK_SIZE as u32))
}

/// Formats `extent` of `device` as ext4.
pub fn mkfs_ext4(device: Arc<dyn RawDevice>, extent: Extent) -> Result<()> {
    let dev = block_dev(device, extent, 16)?;
    let mut jbd = Jbd2Dev::initial_jbd2dev(0, dev, false);
    mkfs(&mut jbd).map_err(|e| anyhow!("mkfs ext4 failed: {e:?}"))?;
    jbd.cantflush()
        .map_err(|e| anyhow!("flush failed: {e:?}"))?;
    Ok(())
}

/// One ext4 volume. Every operation mounts, works and unmounts; sessions are
/// serialized so two streams never mount the same volume at once.
struct Ext4Volume {
    device: Arc<dyn RawDevice>,
    extent: Extent,
    session: Mutex<()>,
}

impl Ext4Volume {
    fn with_ext4<R>(&self, f: impl for<'a> FnOnce(Ext4Ops<'a>) -> Result<R>) -> Result<R> {
        let _session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let dev = block_dev(self.device.clone(), self.extent, 2)?;
        let mut jbd = Jbd2Dev::initial_jbd2dev(0, dev, false);
        let mut fs = Ext4FileSystem::mount(&mut jbd)
            .map_err(|e| anyhow!("mount ext4 failed: {e:?}"))?;

        let result = f(Ext4Ops { jbd: &mut jbd, fs: &mut fs });

        fs.umount(&mut jbd)
            .map_err(|e| anyhow!("umount failed: {e:?}"))?;
        jbd.cantflush()
            .map_err(|e| anyhow!("flush failed: {e:?}"))?;
        result
    }
}

pub struct Ext4Capability {
    volume: Arc<Ext4Volume>,
}

impl Ext4Capability {
    pub fn new(device: Arc<dyn RawDevice>, extent: Extent) -> Self {
        Self {
            volume: Arc::new(Ext4Volume {
                device,
                extent,
                session: Mutex::new(()),
            }),
        }
    }
}

fn image_path(path: &str) -> String {
    format!("/{}", normalize_path(path))
}

impl FilesystemCapability for Ext4Capability {
    fn fs_type(&self) -> FilesystemType {
        FilesystemType::Ext4
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = image_path(path);
        self.volume.with_ext4(|mut ops| ops.list_dir(&path))
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let path = image_path(path);
        let data = self.volume.with_ext4(|mut ops| ops.read_file(&path))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn FsStream>> {
        Ok(Box::new(Ext4WriteStream {
            volume: self.volume.clone(),
            path: image_path(path),
            buf: Cursor::new(Vec::new()),
        }))
    }

    fn open_read_write(&self, path: &str) -> Result<Box<dyn FsStream>> {
        let path = image_path(path);
        let existing = self.volume.with_ext4(|mut ops| {
            if ops.resolve_path(&path).is_ok() {
                ops.read_file(&path)
            } else {
                Ok(Vec::new())
            }
        })?;
        Ok(Box::new(Ext4WriteStream {
            volume: self.volume.clone(),
            path,
            buf: Cursor::new(existing),
        }))
    }

    fn length(&self, path: &str) -> Result<u64> {
        let path = image_path(path);
        let data = self.volume.with_ext4(|mut ops| ops.read_file(&path))?;
        Ok(data.len() as u64)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = image_path(path);
        self.volume
            .with_ext4(|mut ops| Ok(ops.resolve_path(&path).is_ok()))
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        let path = image_path(path);
        self.volume.with_ext4(|mut ops| ops.mkdir_all(&path))
    }
}

/// Buffers content and writes the whole file on `finish`, the only write
/// granularity rsext4 offers.
struct Ext4WriteStream {
    volume: Arc<Ext4Volume>,
    path: String,
    buf: Cursor<Vec<u8>>,
}

impl Read for Ext4WriteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buf.read(buf)
    }
}

impl Write for Ext4WriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Ext4WriteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buf.seek(pos)
    }
}

impl FsStream for Ext4WriteStream {
    fn finish(self: Box<Self>) -> Result<()> {
        let Ext4WriteStream { volume, path, buf } = *self;
        let data = buf.into_inner();
        volume.with_ext4(|mut ops| {
            if let Some((parent, _)) = path.rsplit_once('/')
                && !parent.is_empty()
            {
                ops.mkdir_all(parent)?;
            }
            ops.write_file(&path, &data)
        })
    }
}

impl<'a> Ext4Ops<'a> {
    fn get_dir_entries(&mut self, inode: &mut Ext4Inode) -> Result<Vec<(u32, String, bool)>> {
        let blocks = resolve_inode_block_allextend(self.fs, self.jbd, inode)
            .map_err(|e| anyhow!("resolve dir blocks failed: {e:?}"))?;

        let mut entries = Vec::new();
        for phys in blocks.values() {
            let mut raw_entries = Vec::new();
            {
                let cached = self
                    .fs
                    .datablock_cache
                    .get_or_load(self.jbd, *phys)
                    .map_err(|e| anyhow!("load block failed: {e:?}"))?;
                let data = &cached.data[..BLOCK_SIZE];
                for (entry, _) in DirEntryIterator::new(data) {
                    if entry.is_dot() || entry.is_dotdot() || entry.inode == 0 {
                        continue;
                    }
                    let name = entry
                        .name_str()
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| String::from_utf8_lossy(entry.name).to_string());
                    raw_entries.push((entry.inode, name));
                }
            }

            for (inode_num, name) in raw_entries {
                let child_inode = self
                    .fs
                    .get_inode_by_num(self.jbd, inode_num)
                    .map_err(|e| anyhow!("inode read failed: {e:?}"))?;
                entries.push((inode_num, name, child_inode.is_dir()));
            }
        }
        Ok(entries)
    }

    fn root(&mut self) -> Result<Ext4Inode> {
        let (_, root) = get_file_inode(self.fs, self.jbd, "/")
            .map_err(|e| anyhow!("root lookup failed: {e:?}"))?
            .ok_or_else(|| anyhow!("root not found"))?;
        Ok(root)
    }

    fn resolve_path(&mut self, path: &str) -> Result<Ext4Inode> {
        let mut current = self.root()?;
        let normalized = normalize_path(path);
        for part in normalized.split('/').filter(|s| !s.is_empty()) {
            if !current.is_dir() {
                bail!("not a directory");
            }
            let found = self
                .get_dir_entries(&mut current)?
                .into_iter()
                .find(|(_, name, _)| name == part)
                .map(|(inum, _, _)| inum);
            match found {
                Some(num) => {
                    current = self
                        .fs
                        .get_inode_by_num(self.jbd, num)
                        .map_err(|e| anyhow!("inode read failed: {e:?}"))?;
                }
                None => bail!("path not found: {}", path),
            }
        }
        Ok(current)
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let mut inode = self.resolve_path(path)?;
        if !inode.is_dir() {
            bail!("not a directory");
        }

        let mut res: Vec<DirEntry> = self
            .get_dir_entries(&mut inode)?
            .into_iter()
            .map(|(_, name, is_dir)| DirEntry {
                name,
                is_dir,
                size: None,
            })
            .collect();
        res.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(res)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let inode = self.resolve_path(path)?;
        if inode.is_dir() {
            bail!("{path} is a directory");
        }
        read_file(self.jbd, self.fs, path)
            .map_err(|e| anyhow!("read failed: {e:?}"))?
            .ok_or_else(|| anyhow!("file not found: {path}"))
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if self.resolve_path(path).is_ok() {
            truncate(self.jbd, self.fs, path, 0).map_err(|e| anyhow!("truncate failed: {e:?}"))?;
        } else {
            rsext4::mkfile(self.jbd, self.fs, path, None, None)
                .ok_or_else(|| anyhow!("mkfile failed for path: {}", path))?;
        }
        write_file(self.jbd, self.fs, path, 0, data)
            .map_err(|e| anyhow!("write failed: {e:?}"))?;
        Ok(())
    }

    fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in normalize_path(path).split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.resolve_path(&current) {
                Ok(inode) if inode.is_dir() => continue,
                Ok(_) => bail!("{current} exists and is not a directory"),
                Err(_) => {
                    rsext4::mkdir(self.jbd, self.fs, &current)
                        .ok_or_else(|| anyhow!("mkdir failed: {current}"))?;
                }
            }
        }
        Ok(())
    }
}
