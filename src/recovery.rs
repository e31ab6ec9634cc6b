//! Recovery: the mount-time pass that rebuilds the index and the free
//! list by reading the data file sequentially and validating the node
//! sentinels. Regions that fail validation are collected and later
//! rewritten in place as free nodes by the fix-up pass.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::common::types::{NODE_FREE_BYTE, NODE_IN_USE_BYTE};
use crate::db::Inner;
use crate::errors::Result;
use crate::node::{try_read_u32, FileNode, NodeStatus, MIN_NODE_SIZE};

/// Walks the data file from offset 0 and installs every intact node into
/// the store state. Returns the offsets of regions which could not be
/// validated; the caller hands them to [`fix_nodes`].
pub(crate) fn build_index(
    state: &mut Inner,
    stream: &mut File,
    fragmentation_limit: f64,
) -> Result<Vec<u64>> {
    let mut error_offsets = Vec::new();

    while let Some((node, key)) = FileNode::read_from(stream)? {
        match node.status() {
            NodeStatus::Invalid => {
                log::warn!(
                    "invalid node found at offset:{} in the data file - data will be lost",
                    node.node_offset()
                );
                error_offsets.push(node.node_offset());
                seek_valid_node(stream)?;
            }
            NodeStatus::WriteActive => {
                log::warn!(
                    "file system was prematurely shut down while writing node at offset:{} - will be discarded",
                    node.node_offset()
                );
                error_offsets.push(node.node_offset());
                seek_valid_node(stream)?;
            }
            _ => {
                if node.node_size() >= MIN_NODE_SIZE && node.verify_end_tag(stream)? {
                    // Position the stream at the end of the node so the
                    // next read starts at a region boundary.
                    stream.seek(SeekFrom::Start(node.node_end()))?;
                    let status = node.status();
                    let id = state.install_node(node);
                    match status {
                        NodeStatus::InUse => {
                            if let Some(key) = key {
                                state.index.insert(key, id);
                            }
                        }
                        NodeStatus::Free => state.insert_free_node(id, fragmentation_limit),
                        _ => unreachable!(),
                    }
                } else {
                    // No valid end tag - the filesystem was shut down
                    // during the write of this node. It is not added to
                    // the index; fix-up turns it into a free node.
                    log::warn!(
                        "found node:{} at offset:{} which was incomplete - discarded",
                        key.as_deref().unwrap_or("--FREE--"),
                        node.node_offset()
                    );
                    error_offsets.push(node.node_offset());
                    seek_valid_node(stream)?;
                }
            }
        }
    }
    Ok(error_offsets)
}

/// Reads through the data file looking for the next region boundary. The
/// two self-synchronizing status bytes flag a candidate; the full four
/// byte word decides. On a hit the stream is repositioned at the start of
/// the status word and true is returned; otherwise the stream ends up at
/// end of file.
pub(crate) fn seek_valid_node(stream: &mut File) -> Result<bool> {
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte)? == 0 {
            break; // EOF
        }
        if byte[0] != NODE_IN_USE_BYTE && byte[0] != NODE_FREE_BYTE {
            continue;
        }

        // One interesting byte; back up and try the whole word. Either
        // status byte may also appear inside payload data, so only the
        // full repeated pattern counts.
        let pos = stream.stream_position()?;
        stream.seek(SeekFrom::Start(pos - 1))?;
        match try_read_u32(stream)? {
            None => break, // EOF
            Some(word) => {
                if word == NodeStatus::InUse as u32 || word == NodeStatus::Free as u32 {
                    stream.seek(SeekFrom::Current(-4))?;
                    return Ok(true);
                }
                // Not a valid id; go back and continue reading single
                // bytes.
                stream.seek(SeekFrom::Start(pos))?;
            }
        }
    }
    stream.seek(SeekFrom::End(0))?;
    Ok(false)
}

/// Rewrites each damaged region as a well formed free node, in place:
///
///   1. The node is updated on disk to become a free node.
///   2. The node is installed in the store state as a free node, so the
///      space can be recycled at a later stage.
///
/// Regions whose own header is unusable get their extent measured by
/// resynchronizing to the next valid region boundary (or end of file).
pub(crate) fn fix_nodes(
    state: &mut Inner,
    stream: &mut File,
    error_offsets: &[u64],
    fragmentation_limit: f64,
) -> Result<()> {
    if error_offsets.is_empty() {
        return Ok(());
    }

    stream.sync_all()?;
    for &node_offset in error_offsets {
        stream.seek(SeekFrom::Start(node_offset))?;
        let mut node = match FileNode::read_from(stream)? {
            Some((node, _)) => node,
            None => FileNode::new(NodeStatus::Invalid, node_offset, 0),
        };

        if node.status() == NodeStatus::Invalid
            || node.status() == NodeStatus::WriteActive
            || node.node_size() < MIN_NODE_SIZE
        {
            // This node is really quite broken; measure its extent.
            seek_valid_node(stream)?;
            let node_end = stream.stream_position()?;
            node.set_node_size((node_end - node_offset) as u32);
        }

        if node.node_size() < MIN_NODE_SIZE {
            // Too small to hold even a free header; nothing can be
            // reclaimed here.
            log::warn!(
                "damaged region at offset:{} is only {} bytes - left alone",
                node_offset,
                node.node_size()
            );
            continue;
        }

        node.reset_free();
        if state.free_list.find_offset(&state.nodes, node_offset).is_none() {
            let id = state.install_node(node);
            state.insert_free_node(id, fragmentation_limit);
            state.nodes[id].write_header(None, stream)?;
        } else {
            // Already on the free list - only the on-disk header needs
            // the refresh.
            node.write_header(None, stream)?;
        }
    }
    stream.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{NODE_WRITE_ACTIVE_END, NODE_WRITE_ACTIVE_START};
    use crate::node::{header_size, write_u32};
    use std::io::Write;

    fn temp_stream() -> File {
        tempfile::tempfile().unwrap()
    }

    // Lays down a committed live node at `offset` and returns its size.
    fn put_live_node(stream: &mut File, offset: u64, name: &str, data: &[u8], node_size: u32) {
        let mut node = FileNode::new(NodeStatus::InUse, offset, node_size);
        node.set_data_size(data.len() as u32);
        node.set_data_offset(name);
        stream.seek(SeekFrom::Start(node.data_offset())).unwrap();
        stream.write_all(data).unwrap();
        node.write_header(Some(name), stream).unwrap();
    }

    fn put_free_node(stream: &mut File, offset: u64, node_size: u32) {
        let node = FileNode::new(NodeStatus::Free, offset, node_size);
        node.write_header(None, stream).unwrap();
    }

    #[test]
    fn test_build_index_clean_file() {
        let mut stream = temp_stream();
        put_live_node(&mut stream, 0, "first", &[1, 2, 3], 64);
        put_free_node(&mut stream, 64, 128);
        put_live_node(&mut stream, 192, "second", &[4; 30], 64);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut state = Inner::new();
        let errors = build_index(&mut state, &mut stream, 1.0).unwrap();

        assert!(errors.is_empty());
        assert_eq!(2, state.index.len());
        assert_eq!(1, state.free_list.len());
        assert_eq!(256, state.data_file_size);
        assert_eq!(128, state.free_size);

        let first = &state.nodes[state.index["first"]];
        assert_eq!(3, first.data_size());
        assert_eq!(header_size("first") as u64 - 4, first.data_offset());
    }

    #[test]
    fn test_build_index_discards_torn_write() {
        let mut stream = temp_stream();
        put_live_node(&mut stream, 0, "keep", &[7; 10], 64);

        // A region that crashed between the write-active markers and the
        // committing header flip.
        stream.seek(SeekFrom::Start(64)).unwrap();
        write_u32(&mut stream, NODE_WRITE_ACTIVE_START).unwrap();
        stream.seek(SeekFrom::Start(188)).unwrap();
        write_u32(&mut stream, NODE_WRITE_ACTIVE_END).unwrap();

        put_live_node(&mut stream, 192, "after", &[9; 10], 64);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut state = Inner::new();
        let errors = build_index(&mut state, &mut stream, 1.0).unwrap();

        // The scan recovers both intact neighbours and reports the torn
        // region.
        assert_eq!(vec![64], errors);
        assert!(state.index.contains_key("keep"));
        assert!(state.index.contains_key("after"));
        assert_eq!(0, state.free_list.len());

        fix_nodes(&mut state, &mut stream, &errors, 1.0).unwrap();
        assert_eq!(1, state.free_list.len());
        assert_eq!(128, state.free_size);
        assert_eq!(256, state.data_file_size);

        // A second scan sees a clean file: two live nodes and one free
        // node where the torn region used to be.
        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut rescan = Inner::new();
        let errors = build_index(&mut rescan, &mut stream, 1.0).unwrap();
        assert!(errors.is_empty());
        assert_eq!(2, rescan.index.len());
        assert_eq!(1, rescan.free_list.len());
    }

    #[test]
    fn test_seek_valid_node_skips_garbage() {
        let mut stream = temp_stream();
        // Garbage containing lone status bytes which must not resync.
        stream
            .write_all(&[0x00, 0x55, 0x13, 0xAA, 0x55, 0x20])
            .unwrap();
        put_free_node(&mut stream, 6, 64);

        stream.seek(SeekFrom::Start(0)).unwrap();
        assert!(seek_valid_node(&mut stream).unwrap());
        assert_eq!(6, stream.stream_position().unwrap());
    }

    #[test]
    fn test_seek_valid_node_eof() {
        let mut stream = temp_stream();
        stream.write_all(&[0x00, 0x55, 0x13]).unwrap();

        stream.seek(SeekFrom::Start(0)).unwrap();
        assert!(!seek_valid_node(&mut stream).unwrap());
        assert_eq!(3, stream.stream_position().unwrap());
    }
}
