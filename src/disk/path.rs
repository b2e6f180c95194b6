//! Virtual path grammar.
//!
//! ```text
//! root/geometry.json                                geometry
//! root/part_<TableType>_<Number>/...                partition item
//! root/part_<TableType>_<Number>/fs_<FsType>/<rest> file inside a filesystem
//! root/...                                          disk item
//! ```
//!
//! Keywords are matched case-insensitively. Resolution never touches a
//! device: it only reads the geometry handed in by the caller.

use super::error::{DiskError, Result};
use super::geometry::{FilesystemGeometry, GeometryMetadata, PartitionGeometry};
use super::types::{FilesystemType, TableType};

pub const ROOT: &str = "root";
pub const GEOMETRY_FILE: &str = "geometry.json";
pub const GEOMETRY_PATH: &str = "root/geometry.json";

const PARTITION_PREFIX: &str = "part_";
const FILESYSTEM_PREFIX: &str = "fs_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Geometry,
    Disk,
    Partition,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Geometry,
    /// `item` is the path below the root, empty for the root itself.
    Disk { item: String },
    Partition {
        partition: PartitionGeometry,
        item: String,
    },
    File {
        partition: PartitionGeometry,
        filesystem: FilesystemGeometry,
        /// Path inside the filesystem, without leading slash.
        path: String,
    },
}

impl ResolvedPath {
    pub fn kind(&self) -> PathKind {
        match self {
            ResolvedPath::Geometry => PathKind::Geometry,
            ResolvedPath::Disk { .. } => PathKind::Disk,
            ResolvedPath::Partition { .. } => PathKind::Partition,
            ResolvedPath::File { .. } => PathKind::File,
        }
    }
}

/// Turns `\` into `/`, drops empty segments and surrounding slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_prefix_ci<'a>(segment: &'a str, prefix: &str) -> Option<&'a str> {
    let head = segment.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        segment.get(prefix.len()..)
    } else {
        None
    }
}

/// Classifies `path` against the current geometry.
///
/// Disk paths and the geometry path resolve without geometry; anything below
/// a `part_` segment requires it.
pub fn resolve(path: &str, geometry: Option<&GeometryMetadata>) -> Result<ResolvedPath> {
    let normalized = normalize_path(path);
    let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    if segments
        .first()
        .is_some_and(|s| s.eq_ignore_ascii_case(ROOT))
    {
        segments.remove(0);
    }

    if segments.len() == 1 && segments[0].eq_ignore_ascii_case(GEOMETRY_FILE) {
        return Ok(ResolvedPath::Geometry);
    }

    let Some(part_idx) = segments
        .iter()
        .position(|s| strip_prefix_ci(s, PARTITION_PREFIX).is_some())
    else {
        return Ok(ResolvedPath::Disk {
            item: segments.join("/"),
        });
    };

    let (table_type, number) = parse_partition_segment(segments[part_idx])?;
    let geometry = geometry.ok_or(DiskError::MissingGeometryMetadata)?;
    let partition = geometry
        .partition(number)
        .ok_or(DiskError::PartitionNotFound { table_type, number })?;
    if partition.table_type != table_type {
        return Err(DiskError::PartitionTableTypeMismatch {
            number,
            recorded: partition.table_type,
            requested: table_type,
        });
    }

    let fs_segment = segments
        .get(part_idx + 1)
        .and_then(|s| strip_prefix_ci(s, FILESYSTEM_PREFIX).map(|rest| (*s, rest)));
    let Some((segment, fs_name)) = fs_segment else {
        return Ok(ResolvedPath::Partition {
            partition: partition.clone(),
            item: segments[part_idx + 1..].join("/"),
        });
    };

    // Filesystem names may carry underscores of their own; the whole tail
    // after the prefix is the type name.
    let fs_type: FilesystemType = fs_name
        .parse()
        .map_err(|reason: String| DiskError::segment(segment, reason))?;
    let filesystem = geometry
        .filesystem(number, fs_type)
        .ok_or(DiskError::NoMatchingFilesystem {
            partition: number,
            fs_type,
        })?;

    Ok(ResolvedPath::File {
        partition: partition.clone(),
        filesystem: filesystem.clone(),
        path: segments[part_idx + 2..].join("/"),
    })
}

fn parse_partition_segment(segment: &str) -> Result<(TableType, u32)> {
    let tokens: Vec<&str> = segment.split('_').collect();
    if tokens.len() != 3 {
        return Err(DiskError::segment(
            segment,
            "expected part_<TableType>_<Number>",
        ));
    }
    let table_type: TableType = tokens[1]
        .parse()
        .map_err(|reason: String| DiskError::segment(segment, reason))?;
    let number: u32 = tokens[2]
        .parse()
        .map_err(|_| DiskError::segment(segment, "partition number is not an integer"))?;
    if number == 0 {
        return Err(DiskError::segment(segment, "partition numbers are 1-based"));
    }
    Ok((table_type, number))
}

pub fn disk_item_path(item: &str) -> String {
    let item = normalize_path(item);
    if item.is_empty() {
        ROOT.to_string()
    } else {
        format!("{ROOT}/{item}")
    }
}

pub fn partition_path(partition: &PartitionGeometry) -> String {
    format!(
        "{ROOT}/{PARTITION_PREFIX}{}_{}",
        partition.table_type, partition.number
    )
}

pub fn partition_item_path(partition: &PartitionGeometry, item: &str) -> String {
    format!("{}/{}", partition_path(partition), normalize_path(item))
}

pub fn filesystem_path(partition: &PartitionGeometry, fs_type: FilesystemType) -> String {
    format!("{}/{FILESYSTEM_PREFIX}{}", partition_path(partition), fs_type)
}

pub fn file_path(partition: &PartitionGeometry, fs_type: FilesystemType, path: &str) -> String {
    let path = normalize_path(path);
    let base = filesystem_path(partition, fs_type);
    if path.is_empty() {
        base
    } else {
        format!("{base}/{path}")
    }
}
