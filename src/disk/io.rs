use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use rsext4::error::{BlockDevError, BlockDevResult};
use rsext4::BlockDevice;

use super::device::RawDevice;
use super::types::Extent;

/// Block view of one partition for the ext4 backend.
pub struct PartitionBlockDev {
    device: Arc<dyn RawDevice>,
    offset: u64,
    total_blocks: u64,
    block_size: u32,
    opened: bool,
}

impl PartitionBlockDev {
    pub fn new(device: Arc<dyn RawDevice>, offset: u64, total_blocks: u64, block_size: u32) -> Self {
        Self {
            device,
            offset,
            total_blocks,
            block_size,
            opened: true,
        }
    }

    fn check_range(&self, block_id: u32, count: u32) -> BlockDevResult<()> {
        let end = block_id as u64 + count as u64;
        if end > self.total_blocks {
            return Err(BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks: self.total_blocks,
            });
        }
        Ok(())
    }

    fn span(&self, buffer_len: usize, block_id: u32, count: u32) -> BlockDevResult<(u64, usize)> {
        if !self.opened {
            return Err(BlockDevError::DeviceClosed);
        }
        self.check_range(block_id, count)?;

        let required = self.block_size as usize * count as usize;
        if buffer_len < required {
            return Err(BlockDevError::BufferTooSmall {
                provided: buffer_len,
                required,
            });
        }
        Ok((self.offset + block_id as u64 * self.block_size as u64, required))
    }
}

impl BlockDevice for PartitionBlockDev {
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let (offset, required) = self.span(buffer.len(), block_id, count)?;
        self.device
            .write_at(offset, &buffer[..required])
            .map_err(|_| BlockDevError::WriteError)
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let (offset, required) = self.span(buffer.len(), block_id, count)?;
        self.device
            .read_at(offset, &mut buffer[..required])
            .map_err(|_| BlockDevError::ReadError)
    }

    fn open(&mut self) -> BlockDevResult<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> BlockDevResult<()> {
        self.opened = false;
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn flush(&mut self) -> BlockDevResult<()> {
        self.device.flush().map_err(|_| BlockDevError::IoError)
    }

    fn is_open(&self) -> bool {
        self.opened
    }
}

/// Read-only byte stream over a window of a device.
pub struct PartitionIo {
    device: Arc<dyn RawDevice>,
    start: u64,
    len: u64,
    pos: u64,
}

impl PartitionIo {
    pub fn new(device: Arc<dyn RawDevice>, target: Extent) -> Self {
        Self {
            device,
            start: target.offset,
            len: target.len,
            pos: 0,
        }
    }

    fn clamp_pos(&self, pos: i128) -> io::Result<u64> {
        if pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid seek"));
        }
        let pos = pos as u64;
        if pos > self.len {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"));
        }
        Ok(pos)
    }
}

impl Read for PartitionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remain = self.len - self.pos;
        let to_read = remain.min(buf.len() as u64) as usize;
        self.device
            .read_at(self.start + self.pos, &mut buf[..to_read])?;
        self.pos += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for PartitionIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => self.clamp_pos(off as i128)?,
            SeekFrom::End(off) => self.clamp_pos(self.len as i128 + off as i128)?,
            SeekFrom::Current(off) => self.clamp_pos(self.pos as i128 + off as i128)?,
        };
        self.pos = new_pos;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::device::MemoryDevice;

    #[test]
    fn partition_io_stays_inside_window() {
        let mut bytes = vec![0u8; 4096];
        bytes[1024..2048].fill(0xAB);
        let device: Arc<dyn RawDevice> = Arc::new(MemoryDevice::from_bytes(bytes, 512));
        let mut io = PartitionIo::new(
            device,
            Extent {
                offset: 1024,
                len: 1024,
            },
        );
        let mut out = Vec::new();
        io.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 1024);
        assert!(out.iter().all(|b| *b == 0xAB));
        assert!(io.seek(SeekFrom::Start(1025)).is_err());
        assert_eq!(io.seek(SeekFrom::End(-24)).unwrap(), 1000);
    }
}
