//! Tool definition (`.rom`) files, uploaded to the device 64 bytes at a time
//! when registering a wireless tool.

use crate::error::{NdiError, Result};

use std::{fs, path::Path};

/// Bytes per `PVWR` upload.
pub const CHUNK_SIZE: usize = 64;

/// The raw contents of a tool definition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    bytes: Vec<u8>,
}

impl ToolDefinition {
    /// Wrap bytes that are already in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ToolDefinition {
            bytes: bytes.into(),
        }
    }

    /// Read a tool definition file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        fs::read(path).map(Self::from_bytes).map_err(NdiError::Io)
    }

    /// Length of the definition in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the definition is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The definition split into [CHUNK_SIZE] byte chunks, the last one
    /// padded with zeros.
    pub fn chunks(&self) -> impl Iterator<Item = [u8; CHUNK_SIZE]> + '_ {
        self.bytes.chunks(CHUNK_SIZE).map(|c| {
            let mut chunk = [0; CHUNK_SIZE];
            chunk[..c.len()].copy_from_slice(c);
            chunk
        })
    }
}
