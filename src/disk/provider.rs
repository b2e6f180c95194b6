//! Pipeline-facing restore destination backed by a raw device.

use log::{debug, info};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::device::{open_device, RawDevice};
use super::error::{DiskError, Result};
use super::fs::FilesystemProvider;
use super::path::{ResolvedPath, GEOMETRY_PATH};
use super::stage::{CancelToken, RestoreOptions, RestoreStore, StoreState, WriteStream};

pub struct DiskImageTarget {
    device_path: PathBuf,
    sector_size: u32,
    options: RestoreOptions,
    provider: Arc<dyn FilesystemProvider>,
    store: Option<RestoreStore>,
}

impl DiskImageTarget {
    pub fn new(
        device_path: impl Into<PathBuf>,
        sector_size: u32,
        options: RestoreOptions,
        provider: Arc<dyn FilesystemProvider>,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            sector_size,
            options,
            provider,
            store: None,
        }
    }

    /// Builds an initialized target around an already open device.
    pub fn with_device(
        device: Arc<dyn RawDevice>,
        options: RestoreOptions,
        provider: Arc<dyn FilesystemProvider>,
    ) -> Self {
        let store = RestoreStore::new(device.clone(), provider.clone(), options);
        Self {
            device_path: PathBuf::from(device.path()),
            sector_size: device.sector_size(),
            options,
            provider,
            store: Some(store),
        }
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Opens the device for exclusive read-write use.
    pub fn initialize(&mut self) -> Result<()> {
        if self.store.is_some() {
            return Ok(());
        }
        let device = open_device(&self.device_path, true, self.sector_size)?;
        info!(
            "restore target {} ({} bytes, sector {})",
            device.path(),
            device.size(),
            device.sector_size()
        );
        self.store = Some(RestoreStore::new(device, self.provider.clone(), self.options));
        Ok(())
    }

    pub fn store(&self) -> Result<&RestoreStore> {
        match &self.store {
            Some(store) if store.state() == StoreState::Disposed => {
                Err(DiskError::InvalidState("restore target disposed"))
            }
            Some(store) => Ok(store),
            None => Err(DiskError::InvalidState("restore target not initialized")),
        }
    }

    /// Checks that the device is open, writable and readable at sector 0.
    pub fn test(&self) -> Result<()> {
        let store = self.store()?;
        let device = store.device();
        if !device.is_writable() {
            return Err(DiskError::DiskInitializeFailed {
                path: device.path().to_string(),
                mode: "read-write",
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "device is read-only",
                ),
            });
        }
        let mut sector = vec![0u8; device.sector_size() as usize];
        device.read_at(0, &mut sector)?;
        Ok(())
    }

    /// The geometry must be restored before anything that resolves against
    /// it.
    pub fn get_priority_files(&self) -> Vec<String> {
        vec![GEOMETRY_PATH.to_string()]
    }

    pub fn create_folder_if_not_exists(&self, path: &str) -> Result<()> {
        let store = self.store()?;
        if let ResolvedPath::File {
            partition,
            filesystem,
            path,
        } = store.resolve(path)?
            && !path.is_empty()
        {
            store.filesystem(&partition, &filesystem)?.create_dir_all(&path)?;
        }
        Ok(())
    }

    pub fn file_exists(&self, path: &str) -> Result<bool> {
        self.store()?.file_exists(path)
    }

    pub fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.store()?.open_read(path)
    }

    pub fn open_write(&self, path: &str) -> Result<WriteStream> {
        self.store()?.open_write(path)
    }

    pub fn open_read_write(&self, path: &str) -> Result<WriteStream> {
        self.store()?.open_read_write(path)
    }

    pub fn close(&self, stream: WriteStream) -> Result<()> {
        self.store()?.close(stream)
    }

    pub fn get_file_length(&self, path: &str) -> Result<u64> {
        self.store()?.get_length(path)
    }

    pub fn delete_file(&self, path: &str) -> Result<()> {
        debug!("ignoring delete of {path}");
        Ok(())
    }

    pub fn delete_folder(&self, path: &str) -> Result<()> {
        debug!("ignoring folder delete of {path}");
        Ok(())
    }

    pub fn finalize(&self, progress: &mut dyn FnMut(f32), cancel: &CancelToken) -> Result<()> {
        self.store()?.finalize(progress, cancel)
    }

    pub fn state(&self) -> Option<StoreState> {
        self.store.as_ref().map(RestoreStore::state)
    }

    pub fn dispose(&mut self) {
        if let Some(store) = &self.store {
            store.dispose();
        }
    }
}
