//! Restore side: classifies incoming items and stages every disk- and
//! partition-level write until [`RestoreStore::finalize`].
//!
//! The physical device is written only from `finalize`. File content is the
//! exception and goes straight to the owning filesystem backend.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::device::RawDevice;
use super::error::{DiskError, Result};
use super::fs::{FilesystemCapability, FilesystemProvider, FilesystemTable, FsStream};
use super::geometry::{FilesystemGeometry, GeometryMetadata, PartitionGeometry};
use super::layout::{DiskItem, PARTITION_RAW_ITEM};
use super::path::{self, ResolvedPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Open,
    Finalized,
    Disposed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Drop staged disk and partition writes instead of applying them.
    pub skip_partition_table: bool,
    /// Refuse a geometry whose disk is larger than the target device.
    pub validate_target_size: bool,
}

/// Cooperative cancellation flag shared between a driver and the store.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CaptureTarget {
    Geometry,
    Disk(DiskItem),
    Partition(PartitionGeometry),
}

/// In-memory buffer for one staged item. Nothing is recorded until the
/// buffer is completed and handed back to the store.
#[derive(Debug)]
pub struct CaptureBuffer {
    path: String,
    target: CaptureTarget,
    buf: Cursor<Vec<u8>>,
}

impl CaptureBuffer {
    fn new(path: &str, target: CaptureTarget, initial: Vec<u8>) -> Self {
        Self {
            path: path::normalize_path(path),
            target,
            buf: Cursor::new(initial),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn complete(self) -> CapturedItem {
        CapturedItem {
            path: self.path,
            target: self.target,
            data: self.buf.into_inner(),
        }
    }
}

impl Read for CaptureBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buf.read(buf)
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for CaptureBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buf.seek(pos)
    }
}

#[derive(Debug)]
pub struct CapturedItem {
    path: String,
    target: CaptureTarget,
    data: Vec<u8>,
}

impl CapturedItem {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stream returned by the store's open calls. Must be passed to
/// [`RestoreStore::close`]; a dropped stream contributes nothing.
pub enum WriteStream {
    Staged(CaptureBuffer),
    Direct(Box<dyn FsStream>),
}

impl WriteStream {
    pub fn is_staged(&self) -> bool {
        matches!(self, WriteStream::Staged(_))
    }
}

impl Read for WriteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WriteStream::Staged(b) => b.read(buf),
            WriteStream::Direct(s) => s.read(buf),
        }
    }
}

impl Write for WriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteStream::Staged(b) => b.write(buf),
            WriteStream::Direct(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WriteStream::Staged(b) => b.flush(),
            WriteStream::Direct(s) => s.flush(),
        }
    }
}

impl Seek for WriteStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            WriteStream::Staged(b) => b.seek(pos),
            WriteStream::Direct(s) => s.seek(pos),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingLevel {
    Disk(DiskItem),
    Partition(PartitionGeometry),
}

/// A captured disk- or partition-level write awaiting `finalize`.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub path: String,
    pub level: PendingLevel,
    pub data: Arc<Vec<u8>>,
}

/// Pending writes keyed by normalized path; a later capture of the same
/// path replaces the earlier one.
#[derive(Default)]
struct PendingTable {
    entries: Mutex<BTreeMap<String, PendingWrite>>,
}

impl PendingTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PendingWrite>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn upsert(&self, write: PendingWrite) -> Option<PendingWrite> {
        self.lock().insert(write.path.clone(), write)
    }

    fn get(&self, path: &str) -> Option<PendingWrite> {
        self.lock().get(path).cloned()
    }

    fn snapshot(&self) -> Vec<PendingWrite> {
        self.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Number of groups `plan` would build: one for the disk level, one per
/// partition.
fn group_count(pending: &[PendingWrite]) -> usize {
    let disk = pending
        .iter()
        .any(|w| matches!(w.level, PendingLevel::Disk(_)));
    let partitions: HashSet<u32> = pending
        .iter()
        .filter_map(|w| match &w.level {
            PendingLevel::Partition(p) => Some(p.number),
            PendingLevel::Disk(_) => None,
        })
        .collect();
    usize::from(disk) + partitions.len()
}

struct PlannedWrite {
    path: String,
    offset: u64,
    data: Arc<Vec<u8>>,
}

struct WriteGroup {
    label: String,
    writes: Vec<PlannedWrite>,
}

pub struct RestoreStore {
    device: Arc<dyn RawDevice>,
    options: RestoreOptions,
    // Captures hold a read guard while recording; finalize and dispose take
    // the write guard so no capture lands mid-commit.
    state: RwLock<StoreState>,
    geometry: RwLock<Option<Arc<GeometryMetadata>>>,
    pending: PendingTable,
    filesystems: FilesystemTable,
}

impl RestoreStore {
    pub fn new(
        device: Arc<dyn RawDevice>,
        provider: Arc<dyn FilesystemProvider>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            filesystems: FilesystemTable::new(provider, device.clone()),
            device,
            options,
            state: RwLock::new(StoreState::Open),
            geometry: RwLock::new(None),
            pending: PendingTable::default(),
        }
    }

    pub fn state(&self) -> StoreState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> RestoreOptions {
        self.options
    }

    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Current geometry; replaced wholesale, never edited in place.
    pub fn geometry(&self) -> Option<Arc<GeometryMetadata>> {
        self.geometry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        let geometry = self.geometry();
        path::resolve(path, geometry.as_deref())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.pending.snapshot()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            StoreState::Open => Ok(()),
            StoreState::Finalized => Err(DiskError::InvalidState("restore already finalized")),
            StoreState::Disposed => Err(DiskError::InvalidState("restore target disposed")),
        }
    }

    pub(crate) fn filesystem(
        &self,
        partition: &PartitionGeometry,
        filesystem: &FilesystemGeometry,
    ) -> Result<Arc<dyn FilesystemCapability>> {
        self.filesystems
            .get(partition, filesystem)?
            .ok_or(DiskError::NoMatchingFilesystem {
                partition: partition.number,
                fs_type: filesystem.fs_type,
            })
    }

    fn serialized_geometry(&self) -> Result<Vec<u8>> {
        self.geometry()
            .ok_or(DiskError::MissingGeometryMetadata)?
            .serialize()
    }

    fn capture_target(&self, resolved: &ResolvedPath) -> Result<Option<CaptureTarget>> {
        match resolved {
            ResolvedPath::Geometry => Ok(Some(CaptureTarget::Geometry)),
            ResolvedPath::Disk { item } => DiskItem::from_name(item)
                .map(|i| Some(CaptureTarget::Disk(i)))
                .ok_or_else(|| DiskError::segment(item, "not a known disk-level item")),
            ResolvedPath::Partition { partition, item } => {
                if item.eq_ignore_ascii_case(PARTITION_RAW_ITEM) {
                    Ok(Some(CaptureTarget::Partition(partition.clone())))
                } else {
                    Err(DiskError::segment(item, "not a known partition-level item"))
                }
            }
            ResolvedPath::File { .. } => Ok(None),
        }
    }

    fn open_file(&self, resolved: ResolvedPath, read_existing: bool) -> Result<WriteStream> {
        let ResolvedPath::File {
            partition,
            filesystem,
            path,
        } = resolved
        else {
            return Err(DiskError::InvalidState("not a file path"));
        };
        if path.is_empty() {
            return Err(DiskError::UnsupportedOperation(format!(
                "{} filesystem root is not a file",
                filesystem.fs_type
            )));
        }
        let fs = self.filesystem(&partition, &filesystem)?;
        debug!(
            "direct write to {path} on partition {} ({})",
            partition.number, filesystem.fs_type
        );
        let stream = if read_existing {
            fs.open_read_write(&path)?
        } else {
            fs.open_write(&path)?
        };
        Ok(WriteStream::Direct(stream))
    }

    pub fn open_write(&self, path: &str) -> Result<WriteStream> {
        self.ensure_open()?;
        let resolved = self.resolve(path)?;
        match self.capture_target(&resolved)? {
            Some(target) => {
                debug!("staging {path}");
                Ok(WriteStream::Staged(CaptureBuffer::new(path, target, Vec::new())))
            }
            None => self.open_file(resolved, false),
        }
    }

    /// Like [`open_write`](Self::open_write), but staged streams start with
    /// the current content (the serialized geometry, or a previous capture of
    /// the same path) positioned at offset 0.
    pub fn open_read_write(&self, path: &str) -> Result<WriteStream> {
        self.ensure_open()?;
        let resolved = self.resolve(path)?;
        match self.capture_target(&resolved)? {
            Some(CaptureTarget::Geometry) => {
                let current = match self.geometry() {
                    Some(g) => g.serialize()?,
                    None => Vec::new(),
                };
                Ok(WriteStream::Staged(CaptureBuffer::new(
                    path,
                    CaptureTarget::Geometry,
                    current,
                )))
            }
            Some(target) => {
                let key = path::normalize_path(path);
                let current = self
                    .pending
                    .get(&key)
                    .map(|w| w.data.as_ref().clone())
                    .unwrap_or_default();
                Ok(WriteStream::Staged(CaptureBuffer::new(path, target, current)))
            }
            None => self.open_file(resolved, true),
        }
    }

    /// Reads current content: the geometry or a staged item.
    pub fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self.resolve(path)? {
            ResolvedPath::Geometry => Ok(Box::new(Cursor::new(self.serialized_geometry()?))),
            ResolvedPath::File {
                partition,
                filesystem,
                path,
            } => Ok(self.filesystem(&partition, &filesystem)?.open_read(&path)?),
            _ => {
                let key = path::normalize_path(path);
                let staged = self.pending.get(&key).ok_or_else(|| {
                    DiskError::UnsupportedOperation(format!("{key} has not been staged"))
                })?;
                Ok(Box::new(Cursor::new(staged.data.as_ref().clone())))
            }
        }
    }

    /// Ends a stream. Staged content is recorded, direct content is handed
    /// to the filesystem backend.
    pub fn close(&self, stream: WriteStream) -> Result<()> {
        match stream {
            WriteStream::Staged(buffer) => self.commit(buffer.complete()),
            WriteStream::Direct(stream) => Ok(stream.finish()?),
        }
    }

    /// Records a completed capture.
    pub fn commit(&self, item: CapturedItem) -> Result<()> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if *state != StoreState::Open {
            return Err(DiskError::InvalidState("restore is no longer accepting writes"));
        }

        let CapturedItem { path, target, data } = item;
        match target {
            CaptureTarget::Geometry => {
                let geometry = GeometryMetadata::deserialize(&data)?;
                self.check_target_size(&geometry)?;
                info!(
                    "geometry restored: {} table, {} partitions, {} filesystems",
                    geometry.table_type(),
                    geometry.partitions.len(),
                    geometry.filesystems.len()
                );
                *self.geometry.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::new(geometry));
                self.filesystems.clear();
            }
            CaptureTarget::Disk(item) => {
                self.stage(path, PendingLevel::Disk(item), data);
            }
            CaptureTarget::Partition(partition) => {
                self.stage(path, PendingLevel::Partition(partition), data);
            }
        }
        Ok(())
    }

    fn stage(&self, path: String, level: PendingLevel, data: Vec<u8>) {
        let len = data.len();
        let previous = self.pending.upsert(PendingWrite {
            path: path.clone(),
            level,
            data: Arc::new(data),
        });
        if previous.is_some() {
            warn!("{path} staged twice, keeping the latest capture");
        }
        debug!("staged {path} ({len} bytes)");
    }

    fn check_target_size(&self, geometry: &GeometryMetadata) -> Result<()> {
        if !self.options.validate_target_size {
            return Ok(());
        }
        let required = geometry.required_size();
        let available = self.device.size();
        if required > available {
            return Err(DiskError::SizeValidationFailed {
                required,
                available,
            });
        }
        Ok(())
    }

    pub fn get_length(&self, path: &str) -> Result<u64> {
        match self.resolve(path)? {
            ResolvedPath::Geometry => Ok(self.serialized_geometry()?.len() as u64),
            ResolvedPath::File {
                partition,
                filesystem,
                path,
            } => Ok(self.filesystem(&partition, &filesystem)?.length(&path)?),
            _ => Err(DiskError::UnsupportedOperation(format!(
                "length of disk or partition item {path}"
            ))),
        }
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        match self.resolve(path)? {
            ResolvedPath::Geometry => Ok(self.geometry().is_some()),
            ResolvedPath::File {
                partition,
                filesystem,
                path,
            } => Ok(self.filesystem(&partition, &filesystem)?.exists(&path)?),
            _ => Ok(self.pending.get(&path::normalize_path(path)).is_some()),
        }
    }

    fn plan(&self, pending: Vec<PendingWrite>) -> Result<Vec<WriteGroup>> {
        let geometry = self.geometry().ok_or(DiskError::MissingGeometryMetadata)?;
        let device_size = self.device.size();
        let fits = |path: &str, offset: u64, len: usize| -> Result<()> {
            let end = offset.saturating_add(len as u64);
            if end > device_size {
                return Err(DiskError::SizeValidationFailed {
                    required: end,
                    available: device_size,
                });
            }
            debug!("{path}: {len} bytes at {offset}");
            Ok(())
        };

        let mut disk = Vec::new();
        let mut partitions: BTreeMap<u32, Vec<PlannedWrite>> = BTreeMap::new();
        for write in pending {
            match &write.level {
                PendingLevel::Disk(item) => {
                    let extent = item.extent(&geometry).ok_or_else(|| {
                        DiskError::InvalidGeometry(format!(
                            "{} has no location in a {} layout",
                            item.file_name(),
                            geometry.table_type()
                        ))
                    })?;
                    if write.data.len() as u64 > extent.len {
                        return Err(DiskError::InvalidGeometry(format!(
                            "{} holds {} bytes, layout reserves {}",
                            write.path,
                            write.data.len(),
                            extent.len
                        )));
                    }
                    fits(&write.path, extent.offset, write.data.len())?;
                    disk.push((
                        *item,
                        PlannedWrite {
                            path: write.path.clone(),
                            offset: extent.offset,
                            data: write.data.clone(),
                        },
                    ));
                }
                PendingLevel::Partition(partition) => {
                    if write.data.len() as u64 > partition.size {
                        return Err(DiskError::InvalidGeometry(format!(
                            "{} holds {} bytes, partition {} is {} bytes",
                            write.path,
                            write.data.len(),
                            partition.number,
                            partition.size
                        )));
                    }
                    fits(&write.path, partition.start_offset, write.data.len())?;
                    partitions
                        .entry(partition.number)
                        .or_default()
                        .push(PlannedWrite {
                            path: write.path.clone(),
                            offset: partition.start_offset,
                            data: write.data.clone(),
                        });
                }
            }
        }

        let mut groups = Vec::new();
        if !disk.is_empty() {
            disk.sort_by_key(|(item, _)| *item);
            groups.push(WriteGroup {
                label: "disk".to_string(),
                writes: disk.into_iter().map(|(_, w)| w).collect(),
            });
        }
        for (number, writes) in partitions {
            groups.push(WriteGroup {
                label: format!("partition {number}"),
                writes,
            });
        }
        Ok(groups)
    }

    fn apply_group(&self, group: &WriteGroup) -> Result<()> {
        for write in &group.writes {
            self.device.write_at(write.offset, &write.data)?;
            debug!("wrote {} ({} bytes)", write.path, write.data.len());
        }
        self.device.flush()?;
        Ok(())
    }

    /// Applies every staged write: the disk-level group first, then one
    /// group per partition in partition order.
    ///
    /// `progress` receives the completed fraction after each group, and the
    /// fraction reached before a failure. Cancellation is checked between
    /// groups; a cancelled finalize leaves the store open with its pending
    /// writes and may be retried.
    pub fn finalize(&self, progress: &mut dyn FnMut(f32), cancel: &CancelToken) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match *state {
            StoreState::Open => {}
            StoreState::Finalized => return Ok(()),
            StoreState::Disposed => {
                return Err(DiskError::InvalidState("restore target disposed"));
            }
        }

        let pending = self.pending.snapshot();
        if self.options.skip_partition_table {
            if !pending.is_empty() {
                info!(
                    "skipping partition table restore, discarding {} staged items",
                    pending.len()
                );
            }
            self.pending.clear();
            *state = StoreState::Finalized;
            progress(1.0);
            return Ok(());
        }

        let groups = if pending.is_empty() {
            Vec::new()
        } else {
            let total = group_count(&pending);
            match self.plan(pending) {
                Ok(groups) => groups,
                Err(e) => {
                    progress(0.0);
                    return Err(DiskError::FinalizeFailed {
                        applied: 0,
                        total,
                        source: Box::new(e),
                    });
                }
            }
        };

        let total = groups.len();
        for (i, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("finalize cancelled after {i} of {total} groups");
                progress(i as f32 / total as f32);
                return Err(DiskError::Cancelled);
            }
            if let Err(e) = self.apply_group(group) {
                progress(i as f32 / total as f32);
                return Err(DiskError::FinalizeFailed {
                    applied: i,
                    total,
                    source: Box::new(e),
                });
            }
            info!("applied {} ({}/{total})", group.label, i + 1);
            progress((i + 1) as f32 / total as f32);
        }
        if total == 0 {
            progress(1.0);
        }

        self.pending.clear();
        *state = StoreState::Finalized;
        Ok(())
    }

    /// Releases geometry, staged data and filesystem handles.
    pub fn dispose(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == StoreState::Open && !self.pending.is_empty() {
            warn!(
                "disposing restore target with {} staged items never applied",
                self.pending.len()
            );
        }
        self.pending.clear();
        self.filesystems.clear();
        *self.geometry.write().unwrap_or_else(PoisonError::into_inner) = None;
        *state = StoreState::Disposed;
    }
}
