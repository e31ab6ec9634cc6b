use crate::common::types::MOUNT_MAP_MAGIC;
use crate::errors::{BlockFsError, Result};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::path::Path;

/// Mount map size
pub(crate) const META_SIZE: usize = mem::size_of::<Meta>();

// The mount map is the only file read during every mount: a fixed magic
// marker followed by the version number of the active data file.
//
//   |<magic: u32><version: u32>|
//
#[derive(Debug, Default, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct Meta {
    /// filesystem mime header
    magic: u32,
    /// active data file version, bumped on each rotation
    version: u32,
}

impl Meta {
    pub(crate) fn new(version: u32) -> Self {
        Self {
            magic: MOUNT_MAP_MAGIC,
            version,
        }
    }

    // Validate checks the marker bytes of the mount map to ensure it
    // matches this binary.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != MOUNT_MAP_MAGIC {
            return Err(BlockFsError::Corrupt(format!(
                "mount map magic mismatch: 0x{:08x}",
                self.magic
            )));
        }
        Ok(())
    }

    // Reads and validates the mount map stored at path.
    pub(crate) fn read_from(path: &Path) -> Result<Self> {
        let mut stream = File::open(path)?;
        let mut buf = [0u8; META_SIZE];
        stream.read_exact(&mut buf).map_err(|_| {
            BlockFsError::Corrupt(format!("mount map {} is truncated", path.display()))
        })?;

        let meta: Meta = bytemuck::pod_read_unaligned(&buf);
        meta.validate()?;
        Ok(meta)
    }

    // Writes the mount map to path, replacing any previous content.
    pub(crate) fn write_to(&self, path: &Path) -> Result<()> {
        let mut stream = File::create(path)?;
        stream.write_all(bytemuck::bytes_of(self))?;
        stream.sync_all()?;
        Ok(())
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta {{ Magic: 0x{:08x}, Version: {} }}",
            self.magic, self.version
        )
    }
}
