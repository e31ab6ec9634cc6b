//! File node: the descriptor of one allocation unit in the data file.
//!
//! On-disk layout of a node region:
//!
//! ```text
//! |<status: u32><name len: u32><name bytes + NUL><node_size: u32><data_size: u32>| payload ... <end tag: u32>|
//! |<status: u32><node_size: u32><data_size: u32>|            ...             <end tag: u32>|
//!
//! /|\                                                                         /|\
//!  |                                                                           |
//! node_offset                                                           node_offset + node_size
//! ```
//!
//! The first form is a live node, the second a free node. The node_offset
//! and data_offset values are not stored on disk, but rather implicitly
//! recovered from the stream position while parsing.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;

use crate::common::types::{NODE_END_TAG, NODE_WRITE_ACTIVE_END, NODE_WRITE_ACTIVE_START};
use crate::errors::Result;

/// End tag size
pub(crate) const END_TAG_SIZE: u64 = mem::size_of::<u32>() as u64;

/// The smallest region that can hold a free node header plus the end tag.
/// Anything claiming less is structural damage.
pub(crate) const MIN_NODE_SIZE: u32 = 16;

/// Node status word. The first two values repeat a single byte over all
/// four positions so a linear scan can resynchronize on them; the last
/// two must never appear in a cleanly shut down data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum NodeStatus {
    InUse = 0x5555_5555,
    Free = 0xAAAA_AAAA,
    WriteActive = NODE_WRITE_ACTIVE_START,
    /// This should __never__ be written to disk.
    Invalid = 13,
}

impl NodeStatus {
    // Everything which is not a recognized on-disk status collapses to
    // Invalid, the same way an unreadable region does.
    pub(crate) fn from_word(word: u32) -> NodeStatus {
        match word {
            w if w == NodeStatus::InUse as u32 => NodeStatus::InUse,
            w if w == NodeStatus::Free as u32 => NodeStatus::Free,
            w if w == NodeStatus::WriteActive as u32 => NodeStatus::WriteActive,
            _ => NodeStatus::Invalid,
        }
    }
}

/// Header size for a node holding `name`, end tag included:
/// status + name length prefix + name bytes + NUL + node_size + data_size
/// + end tag.
pub(crate) fn header_size(name: &str) -> usize {
    4 + 4 + name.len() + 1 + 4 + 4 + 4
}

/// One contiguous region in the data file, either live (holding a named
/// payload) or free (reusable).
///
/// data_size, status and data_offset are manipulated by the write path,
/// the unlink path and the fix-up pass; node_offset and node_size are
/// fixed for the lifetime of the region.
#[derive(Debug)]
pub(crate) struct FileNode {
    /// The offset into the data file of this node. NEVER changed.
    node_offset: u64,
    /// The size in bytes of this node. NEVER changed once allocated.
    node_size: u32,
    /// The offset into the data file where the actual data starts.
    data_offset: u64,
    /// The size of the data stored in this node.
    data_size: u32,
    status: NodeStatus,
    cache: Option<Vec<u8>>,
    /// Doubly linked list behaviour WHEN the node is in the free list.
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
}

impl FileNode {
    pub(crate) fn new(status: NodeStatus, node_offset: u64, node_size: u32) -> Self {
        Self {
            node_offset,
            node_size,
            data_offset: 0,
            data_size: 0,
            status,
            cache: None,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn node_offset(&self) -> u64 {
        self.node_offset
    }

    pub(crate) fn node_size(&self) -> u32 {
        self.node_size
    }

    pub(crate) fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub(crate) fn data_size(&self) -> u32 {
        self.data_size
    }

    pub(crate) fn status(&self) -> NodeStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub(crate) fn set_data_size(&mut self, data_size: u32) {
        self.data_size = data_size;
    }

    pub(crate) fn set_node_size(&mut self, node_size: u32) {
        self.node_size = node_size;
    }

    /// The payload starts right after the header; the end tag is not part
    /// of the header on disk.
    pub(crate) fn set_data_offset(&mut self, name: &str) {
        self.data_offset = self.node_offset + header_size(name) as u64 - END_TAG_SIZE;
    }

    pub(crate) fn end_tag_offset(&self) -> u64 {
        self.node_offset + self.node_size as u64 - END_TAG_SIZE
    }

    pub(crate) fn node_end(&self) -> u64 {
        self.node_offset + self.node_size as u64
    }

    /// Turns the node into a free node: no payload, no name, no cache.
    pub(crate) fn reset_free(&mut self) {
        self.status = NodeStatus::Free;
        self.data_size = 0;
        self.data_offset = 0;
        self.cache = None;
    }

    pub(crate) fn cache(&self) -> Option<&[u8]> {
        self.cache.as_deref()
    }

    pub(crate) fn update_cache(&mut self, data: &[u8]) {
        match &mut self.cache {
            Some(cache) => {
                cache.clear();
                cache.extend_from_slice(data);
            }
            None => self.cache = Some(data.to_vec()),
        }
    }

    pub(crate) fn clear_cache(&mut self) {
        self.cache = None;
    }

    /// Parses one node starting at the current stream position. Returns
    /// `None` at end of file. A region whose status word is not
    /// recognized, or whose header fields can not be read in full, comes
    /// back with status `WriteActive` or `Invalid` and node_size 0; the
    /// caller decides how to reclaim it.
    pub(crate) fn read_from(stream: &mut File) -> Result<Option<(FileNode, Option<String>)>> {
        let node_offset = stream.stream_position()?;
        let word = match try_read_u32(stream)? {
            Some(word) => word,
            None => return Ok(None),
        };

        let status = NodeStatus::from_word(word);
        if status != NodeStatus::InUse && status != NodeStatus::Free {
            // We did not recognize the status identifier; the node will
            // eventually be marked as free.
            return Ok(Some((FileNode::new(status, node_offset, 0), None)));
        }

        let key = if status == NodeStatus::InUse {
            match read_name(stream)? {
                Some(key) => Some(key),
                None => return Ok(Some((FileNode::new(NodeStatus::Invalid, node_offset, 0), None))),
            }
        } else {
            None
        };

        let node_size = match try_read_u32(stream)? {
            Some(node_size) => node_size,
            None => return Ok(Some((FileNode::new(NodeStatus::Invalid, node_offset, 0), None))),
        };

        let mut node = FileNode::new(status, node_offset, node_size);
        if status == NodeStatus::InUse {
            node.data_size = match try_read_u32(stream)? {
                Some(data_size) => data_size,
                None => {
                    return Ok(Some((FileNode::new(NodeStatus::Invalid, node_offset, 0), None)));
                }
            };
            node.data_offset = stream.stream_position()?;
        }
        Ok(Some((node, key)))
    }

    /// Writes the node header to the data file, including the end tag at
    /// the end of the region. Free nodes persist no name.
    pub(crate) fn write_header(&self, key: Option<&str>, stream: &mut File) -> Result<()> {
        assert!(self.node_size > 0, "trying to write node with zero size");

        stream.seek(SeekFrom::Start(self.node_offset))?;
        write_u32(stream, self.status as u32)?;
        if self.status == NodeStatus::InUse {
            match key {
                Some(key) => write_name(stream, key)?,
                None => panic!("live node written without a name"),
            }
        }
        write_u32(stream, self.node_size)?;
        write_u32(stream, self.data_size)?;
        stream.seek(SeekFrom::Start(self.end_tag_offset()))?;
        write_u32(stream, NODE_END_TAG)?;
        Ok(())
    }

    /// Marks the start and end of the region as 'work in progress'. A
    /// crash before `write_header` replaces these markers leaves a region
    /// the recovery scan discards.
    pub(crate) fn begin_write(&self, stream: &mut File) -> Result<()> {
        stream.seek(SeekFrom::Start(self.node_offset))?;
        write_u32(stream, NODE_WRITE_ACTIVE_START)?;
        stream.seek(SeekFrom::Start(self.end_tag_offset()))?;
        write_u32(stream, NODE_WRITE_ACTIVE_END)?;
        Ok(())
    }

    /// Checks the end tag at the last four bytes of the region. A short
    /// read counts as a failed check, not an error.
    pub(crate) fn verify_end_tag(&self, stream: &mut File) -> Result<bool> {
        stream.seek(SeekFrom::Start(self.end_tag_offset()))?;
        match try_read_u32(stream)? {
            Some(tag) => Ok(tag == NODE_END_TAG),
            None => Ok(false),
        }
    }
}

pub(crate) fn write_u32(stream: &mut File, value: u32) -> io::Result<()> {
    stream.write_all(&value.to_ne_bytes())
}

/// Reads one u32, returning `None` if the stream ends before four bytes
/// could be read.
pub(crate) fn try_read_u32(stream: &mut File) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    if read_full(stream, &mut buf)? {
        Ok(Some(u32::from_ne_bytes(buf)))
    } else {
        Ok(None)
    }
}

fn read_full(stream: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

// Names are written with a length prefix and a trailing NUL; the prefix
// does not count the NUL.
fn write_name(stream: &mut File, name: &str) -> io::Result<()> {
    write_u32(stream, name.len() as u32)?;
    stream.write_all(name.as_bytes())?;
    stream.write_all(&[0u8])?;
    Ok(())
}

// Returns Ok(None) when the name bytes can not be read in full or do not
// form a NUL-terminated UTF-8 string; the caller treats the node as
// damaged.
fn read_name(stream: &mut File) -> Result<Option<String>> {
    let len = match try_read_u32(stream)? {
        Some(len) => len as u64,
        None => return Ok(None),
    };
    let mut raw = Vec::new();
    let read = stream.take(len + 1).read_to_end(&mut raw)?;
    if read as u64 != len + 1 || raw.pop() != Some(0) {
        return Ok(None);
    }
    match String::from_utf8(raw) {
        Ok(name) => Ok(Some(name)),
        Err(_) => Ok(None),
    }
}
