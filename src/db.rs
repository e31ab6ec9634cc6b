//! BlockFs: a single-file keyed blob store. Arbitrary string names map
//! to opaque byte payloads stored contiguously in one backing data file,
//! with an in-memory index, a size-sorted free-space recycler and a
//! crash-recovery scan run at mount.
//!
//! All public operations go through the store's reader-writer lock:
//! reads take the shared side, writes and unlinks take the exclusive
//! side. A second mutex serializes the seek+read pairs of concurrent
//! readers over the single stream cursor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use fnv::FnvHashMap;
use fs4::fs_std::FileExt;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::common::Meta;
use crate::common::types::{
    DEFAULT_BLOCK_SIZE, DEFAULT_FRAGMENTATION_LIMIT, DEFAULT_MAX_CACHE_SIZE,
};
use crate::errors::{BlockFsError, Result};
use crate::freelist::FreeList;
use crate::node::{self, FileNode, NodeStatus};
use crate::recovery;

// Ensures that only one thread (from the same process) is trying to
// mount a filesystem at a time; the critical section creates the mount
// map and takes the advisory lock.
static MOUNT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

// Options represents the options that can be set when mounting a
// filesystem.
#[derive(Debug, Clone)]
pub struct Options {
    /// Allocation quantum: newly carved node sizes round up to a
    /// multiple of this. 0 selects the OS page size.
    pub block_size: usize,

    /// Largest payload kept in memory per node. Payloads above this are
    /// always read back from disk.
    pub max_cache_size: usize,

    /// Free-space ratio above which the data file would be rotated.
    /// Accepted for compatibility; the mount pins the effective limit to
    /// 1.0, so automatic rotation never triggers.
    pub fragmentation_limit: f64,

    /// Read the entire data file at mount and populate the cache of
    /// every node whose payload fits.
    pub preload: bool,

    /// Fail with [`BlockFsError::AlreadyMounted`] when another process
    /// holds the write lock, instead of degrading to read-only access.
    pub exclusive: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            block_size: 0,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            fragmentation_limit: DEFAULT_FRAGMENTATION_LIMIT,
            preload: false,
            exclusive: false,
        }
    }
}

// Stats represents statistics about the filesystem. This is a snapshot
// taken under the read lock.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    write_count: u64,
    disk_read_count: u64,
    file_count: usize,
    free_node_count: usize,
    free_size: u64,
    data_file_size: u64,
}

impl Stats {
    /// Number of writes that reached the data file since the mount.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// Number of reads served from disk rather than from a node cache.
    pub fn disk_read_count(&self) -> u64 {
        self.disk_read_count
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn free_node_count(&self) -> usize {
        self.free_node_count
    }

    /// Size of the 'holes' in the data file.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// The total number of bytes in the data file - i.e. the next
    /// available offset.
    pub fn data_file_size(&self) -> u64 {
        self.data_file_size
    }

    pub fn fragmentation_ratio(&self) -> f64 {
        if self.data_file_size == 0 {
            return 0.0;
        }
        self.free_size as f64 / self.data_file_size as f64
    }
}

/// The mutable store state guarded by the reader-writer lock. The nodes
/// vector owns all node records; index and free list only hold handles
/// into it.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) nodes: Vec<FileNode>,
    /// THE hash table of all the nodes/files which have been stored.
    pub(crate) index: FnvHashMap<String, usize>,
    pub(crate) free_list: FreeList,
    pub(crate) data_file_size: u64,
    pub(crate) free_size: u64,
    pub(crate) write_count: u64,
}

impl Inner {
    pub(crate) fn new() -> Self {
        Inner {
            nodes: Vec::new(),
            index: FnvHashMap::default(),
            free_list: FreeList::new(),
            data_file_size: 0,
            free_size: 0,
            write_count: 0,
        }
    }

    fn lookup(&self, name: &str) -> Result<&FileNode> {
        let id = self
            .index
            .get(name)
            .ok_or_else(|| BlockFsError::NotFound(name.to_string()))?;
        Ok(&self.nodes[*id])
    }

    /// Takes ownership of the node and updates the file tail.
    pub(crate) fn install_node(&mut self, node: FileNode) -> usize {
        self.data_file_size = self.data_file_size.max(node.node_end());
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub(crate) fn insert_free_node(&mut self, id: usize, fragmentation_limit: f64) {
        self.free_list.insert(&mut self.nodes, id);
        self.free_size += self.nodes[id].node_size() as u64;

        // The mount pins the limit to 1.0, so this can not trigger
        // today; an explicit rotate() reclaims the holes instead.
        if self.fragmentation_ratio() > fragmentation_limit {
            log::warn!(
                "fragmentation ratio {:.2} above limit {:.2} - the data file should be rotated",
                self.fragmentation_ratio(),
                fragmentation_limit
            );
        }
    }

    fn fragmentation_ratio(&self) -> f64 {
        if self.data_file_size == 0 {
            return 0.0;
        }
        self.free_size as f64 / self.data_file_size as f64
    }

    /// First checks the free nodes for one that fits, otherwise carves a
    /// brand new node at end of file, rounded up to the block size.
    fn get_new_node(&mut self, min_size: u64, block_size: u32) -> usize {
        if let Some(id) = self.free_list.first_fit(&self.nodes, min_size) {
            // 1. Remove it from the free list. 2. The caller inserts it
            // into the index once the content is in place.
            self.free_list.unlink(&mut self.nodes, id);
            self.free_size -= self.nodes[id].node_size() as u64;
            return id;
        }

        let node_size = min_size.div_ceil(block_size as u64) * block_size as u64;
        debug_assert!(node_size <= u32::MAX as u64);
        let offset = self.data_file_size;
        let node = FileNode::new(NodeStatus::InUse, offset, node_size as u32);
        self.install_node(node)
    }

    /// The single lowest-level write routine. All write operations are
    /// sandwiched between two fsync calls; that guarantees the read
    /// access (the fast path) never needs one, and that the file on disk
    /// is always either the pre-state or the post-state modulo one
    /// write-active region the recovery scan reclaims.
    fn write_node(
        &mut self,
        id: usize,
        name: &str,
        data: &[u8],
        stream: &mut File,
        max_cache_size: usize,
    ) -> Result<()> {
        stream.sync_all()?;

        let node = &mut self.nodes[id];
        node.set_status(NodeStatus::InUse);
        node.set_data_size(data.len() as u32);
        node.set_data_offset(name);

        // Marks the region as write in progress; a crash from here on
        // leaves markers the next mount discards.
        node.begin_write(stream)?;

        // The actual data content.
        stream.seek(SeekFrom::Start(node.data_offset()))?;
        stream.write_all(data)?;

        // The node header including the end tag; this flips the region
        // from write-active to committed.
        node.write_header(Some(name), stream)?;
        stream.sync_all()?;

        if data.len() <= max_cache_size {
            node.update_cache(data);
        } else {
            node.clear_cache();
        }
        self.write_count += 1;
        Ok(())
    }

    /// Pops the name from the index and turns the node into a free node,
    /// on disk and in memory.
    fn unlink_file(
        &mut self,
        name: &str,
        stream: &mut File,
        fragmentation_limit: f64,
    ) -> Result<()> {
        let id = self
            .index
            .remove(name)
            .ok_or_else(|| BlockFsError::NotFound(name.to_string()))?;

        self.nodes[id].reset_free();

        stream.sync_all()?;
        self.nodes[id].write_header(None, stream)?;
        stream.sync_all()?;

        self.insert_free_node(id, fragmentation_limit);
        Ok(())
    }
}

/// A mounted single-file keyed blob store.
#[derive(Debug)]
pub struct BlockFs {
    /// The full path to the file with the mount information - input to
    /// the mount routine.
    mount_file: PathBuf,
    /// Path plus base name: unique for this filesystem.
    mount_point: PathBuf,
    /// Bumped each time the filesystem is rotated.
    version: u32,

    data_file: PathBuf,
    lock_file: PathBuf,

    block_size: u32,
    max_cache_size: usize,
    fragmentation_limit: f64,

    /// Whether this instance holds the advisory lock. Set to false if
    /// another process got there first; all mutations then fail fast.
    data_owner: bool,
    lock_handle: File,

    inner: RwLock<Inner>,
    /// Lock held during reads of the data file: many readers share the
    /// rw lock, the stream cursor is single.
    io_lock: Mutex<File>,
    disk_read_count: AtomicU64,
}

impl BlockFs {
    /// Mounts the filesystem described by the given mount map with
    /// default options, creating it if it does not exist.
    pub fn mount<P: AsRef<Path>>(mount_file: P) -> Result<BlockFs> {
        BlockFs::mount_with(mount_file, Options::default())
    }

    /// Mounts the filesystem described by the given mount map, creating
    /// it if it does not exist. The index and the free list are rebuilt
    /// from the header information embedded in the data file; damaged
    /// regions are reclaimed as free space before the mount returns.
    pub fn mount_with<P: AsRef<Path>>(mount_file: P, options: Options) -> Result<BlockFs> {
        let mount_file = mount_file.as_ref().to_path_buf();
        let _guard = MOUNT_LOCK.lock();

        if !mount_file.exists() {
            // A brand new filesystem - create the mount map first.
            Meta::new(0).write_to(&mount_file)?;
        }
        let meta = Meta::read_from(&mount_file)?;
        let version = meta.version();

        let path = mount_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let base_name = mount_file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mount_point = path.join(&base_name);
        let data_file = path.join(format!("{base_name}.data_{version}"));
        let lock_file = path.join(format!("{base_name}.lock_{version}"));

        let lock_handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_file)?;
        let data_owner = match lock_handle.try_lock_exclusive() {
            Ok(locked) => locked,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => return Err(e.into()),
        };
        if !data_owner {
            if options.exclusive {
                return Err(BlockFsError::AlreadyMounted);
            }
            log::warn!(
                "another program has already opened {} read-write - this instance will be read-only",
                mount_file.display()
            );
        }

        let block_size = if options.block_size == 0 {
            *DEFAULT_BLOCK_SIZE
        } else {
            options.block_size
        } as u32;
        let fragmentation_limit = 1.0; // options.fragmentation_limit: never rotate currently

        // Build up the index and free list based on the header
        // information embedded in the data file.
        let mut state = Inner::new();
        let mut error_offsets = Vec::new();
        if data_file.exists() {
            let mut stream = File::open(&data_file)?;
            error_offsets = recovery::build_index(&mut state, &mut stream, fragmentation_limit)?;
        }

        // Reopen the data stream for reading AND writing - IFF we are
        // data owner, otherwise it stays read only.
        let mut stream = if data_owner {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&data_file)?
        } else {
            File::open(&data_file)?
        };

        if data_owner {
            recovery::fix_nodes(&mut state, &mut stream, &error_offsets, fragmentation_limit)?;
        }

        if options.preload {
            preload(&mut state, &data_file, options.max_cache_size)?;
        }

        Ok(BlockFs {
            mount_file,
            mount_point,
            version,
            data_file,
            lock_file,
            block_size,
            max_cache_size: options.max_cache_size,
            fragmentation_limit,
            data_owner,
            lock_handle,
            inner: RwLock::new(state),
            io_lock: Mutex::new(stream),
            disk_read_count: AtomicU64::new(0),
        })
    }

    /// Stores bytes under name, overwriting any prior payload. The
    /// existing node is reused in place when large enough; otherwise the
    /// smallest fitting free node is recycled, or a fresh block-aligned
    /// node is carved at end of file.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        if !self.data_owner {
            return Err(BlockFsError::ReadOnly);
        }
        assert!(
            node::header_size(name) + data.len() <= u32::MAX as usize,
            "payload does not fit in a node"
        );

        let mut state = self.inner.write();
        let mut stream = self.io_lock.lock();

        let min_size = (node::header_size(name) + data.len()) as u64;
        let (id, new_node) = match state.index.get(name).copied() {
            Some(id) if state.nodes[id].node_size() as u64 >= min_size => (id, false),
            Some(_) => {
                // The current node is too small for the new content:
                // move it to the free list and get a new one.
                state.unlink_file(name, &mut stream, self.fragmentation_limit)?;
                (state.get_new_node(min_size, self.block_size), true)
            }
            None => (state.get_new_node(min_size, self.block_size), true),
        };

        // A cache holding exactly these bytes means the node content is
        // already current - leave without touching the disk.
        if state.nodes[id].cache() != Some(data) {
            state.write_node(id, name, data, &mut stream, self.max_cache_size)?;
        }

        if new_node {
            state.index.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Convenience wrapper storing the content of a buffer.
    pub fn write_buffer(&self, name: &str, buffer: &BytesMut) -> Result<()> {
        self.write(name, &buffer[..])
    }

    /// Reads the full payload stored under name.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let state = self.inner.read();
        let node = state.lookup(name)?;

        if let Some(cache) = node.cache() {
            return Ok(cache.to_vec());
        }
        let mut out = vec![0u8; node.data_size() as usize];
        self.read_node(node, &mut out)?;
        Ok(out)
    }

    /// Reads the full payload stored under name into the buffer. The
    /// buffer is cleared first and holds exactly the payload afterwards.
    pub fn read_into_buffer(&self, name: &str, buffer: &mut BytesMut) -> Result<()> {
        let state = self.inner.read();
        let node = state.lookup(name)?;

        buffer.clear();
        if let Some(cache) = node.cache() {
            buffer.extend_from_slice(cache);
            return Ok(());
        }
        buffer.resize(node.data_size() as usize, 0);
        self.read_node(node, &mut buffer[..])
    }

    // Needs extra locking - the rw lock allows many concurrent readers
    // over a single stream cursor.
    fn read_node(&self, node: &FileNode, out: &mut [u8]) -> Result<()> {
        let mut stream = self.io_lock.lock();
        self.disk_read_count.fetch_add(1, Ordering::Relaxed);
        stream.seek(SeekFrom::Start(node.data_offset()))?;
        stream.read_exact(out)?;
        Ok(())
    }

    /// Removes name; the node region becomes recyclable free space.
    pub fn unlink(&self, name: &str) -> Result<()> {
        if !self.data_owner {
            return Err(BlockFsError::ReadOnly);
        }
        let mut state = self.inner.write();
        let mut stream = self.io_lock.lock();
        state.unlink_file(name, &mut stream, self.fragmentation_limit)
    }

    /// Whether a payload is stored under name.
    pub fn has(&self, name: &str) -> bool {
        self.inner.read().index.contains_key(name)
    }

    /// Payload size stored under name.
    pub fn filesize(&self, name: &str) -> Result<u64> {
        let state = self.inner.read();
        Ok(state.lookup(name)?.data_size() as u64)
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn data_owner(&self) -> bool {
        self.data_owner
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.read();
        Stats {
            write_count: state.write_count,
            disk_read_count: self.disk_read_count.load(Ordering::Relaxed),
            file_count: state.index.len(),
            free_node_count: state.free_list.len(),
            free_size: state.free_size,
            data_file_size: state.data_file_size,
        }
    }

    /// Defragments the filesystem: bumps the version in the mount map,
    /// mounts the successor store, copies every live name across, swaps
    /// identities and retires the predecessor. The old data file is left
    /// on disk.
    pub fn rotate(&mut self) -> Result<()> {
        if !self.data_owner {
            return Err(BlockFsError::ReadOnly);
        }

        // The successor mounts from the same mount map with a bumped
        // version, so it gets its own data and lock files.
        Meta::new(self.version + 1).write_to(&self.mount_file)?;
        let mut new_fs = BlockFs::mount_with(
            &self.mount_file,
            Options {
                block_size: self.block_size as usize,
                max_cache_size: self.max_cache_size,
                fragmentation_limit: self.fragmentation_limit,
                preload: false,
                exclusive: false,
            },
        )?;

        let names: Vec<String> = self.inner.read().index.keys().cloned().collect();
        let mut buffer = BytesMut::with_capacity(1024);
        for name in &names {
            self.read_into_buffer(name, &mut buffer)?;
            new_fs.write_buffer(name, &buffer)?;
        }

        std::mem::swap(self, &mut new_fs);
        log::info!("retiring data file: {}", new_fs.data_file.display());
        new_fs.close(false)
    }

    /// Closes the filesystem and releases the advisory lock. With
    /// unlink_empty set, the mount map and the data file are removed if
    /// no names are stored; the lock file is always removed.
    pub fn close(self, unlink_empty: bool) -> Result<()> {
        log::info!("shutting down filesystem: {}", self.mount_file.display());

        let BlockFs {
            mount_file,
            data_file,
            lock_file,
            lock_handle,
            inner,
            io_lock,
            ..
        } = self;

        let state = inner.into_inner();
        drop(io_lock.into_inner()); // closes the data stream
        drop(lock_handle); // releases the advisory lock

        if unlink_empty && state.index.is_empty() {
            remove_existing(&mount_file)?;
            remove_existing(&data_file)?;
        }
        remove_existing(&lock_file)?;
        Ok(())
    }
}

// Reads the whole data file in one large go and fills up the cache of
// every indexed node whose payload fits.
fn preload(state: &mut Inner, data_file: &Path, max_cache_size: usize) -> Result<()> {
    if max_cache_size == 0 {
        return Ok(());
    }
    let buffer = fs::read(data_file)?;
    let ids: Vec<usize> = state.index.values().copied().collect();
    for id in ids {
        let node = &mut state.nodes[id];
        let start = node.data_offset() as usize;
        let end = start + node.data_size() as usize;
        if (node.data_size() as usize) < max_cache_size && end <= buffer.len() {
            node.update_cache(&buffer[start..end]);
        }
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFs;

    #[test]
    fn test_write_read_roundtrip() {
        let fs = TestFs::new().unwrap();

        fs.write("config", b"payload bytes").unwrap();

        assert!(fs.has("config"));
        assert_eq!(13, fs.filesize("config").unwrap());
        assert_eq!(b"payload bytes".to_vec(), fs.read("config").unwrap());
    }

    #[test]
    fn test_read_missing_name() {
        let fs = TestFs::new().unwrap();

        assert!(!fs.has("missing"));
        assert_eq!(
            Err(BlockFsError::NotFound("missing".to_string())),
            fs.read("missing")
        );
        assert_eq!(
            Err(BlockFsError::NotFound("missing".to_string())),
            fs.filesize("missing")
        );
    }

    #[test]
    fn test_overwrite_reuses_node() {
        let fs = TestFs::new().unwrap();

        fs.write("a", &[1; 100]).unwrap();
        let size = fs.stats().data_file_size();

        fs.write("a", &[2; 50]).unwrap();
        assert_eq!(size, fs.stats().data_file_size());
        assert_eq!(vec![2; 50], fs.read("a").unwrap());
    }

    #[test]
    fn test_same_bytes_write_is_noop() {
        let fs = TestFs::new().unwrap();

        fs.write("a", &[1, 2, 3]).unwrap();
        assert_eq!(1, fs.stats().write_count());

        fs.write("a", &[1, 2, 3]).unwrap();
        assert_eq!(1, fs.stats().write_count());

        fs.write("a", &[1, 2, 4]).unwrap();
        assert_eq!(2, fs.stats().write_count());
    }

    #[test]
    fn test_unlink() {
        let fs = TestFs::new().unwrap();

        fs.write("a", &[1, 2, 3]).unwrap();
        fs.unlink("a").unwrap();

        assert!(!fs.has("a"));
        assert_eq!(
            Err(BlockFsError::NotFound("a".to_string())),
            fs.read("a")
        );
        assert_eq!(
            Err(BlockFsError::NotFound("a".to_string())),
            fs.unlink("a")
        );
        assert_eq!(1, fs.stats().free_node_count());
    }

    #[test]
    fn test_remount_preserves_index() {
        let mut fs = TestFs::new().unwrap();

        fs.write("kept", &[5u8; 80]).unwrap();
        fs.write("gone", &[6u8; 80]).unwrap();
        fs.unlink("gone").unwrap();

        fs.remount().unwrap();

        assert_eq!(vec![5u8; 80], fs.read("kept").unwrap());
        assert!(!fs.has("gone"));
        assert_eq!(1, fs.stats().free_node_count());
    }

    #[test]
    fn test_buffer_roundtrip() {
        let fs = TestFs::new().unwrap();

        let mut buffer = BytesMut::from(&b"buffered payload"[..]);
        fs.write_buffer("buf", &buffer).unwrap();

        buffer.clear();
        buffer.extend_from_slice(b"stale content to be replaced");
        fs.read_into_buffer("buf", &mut buffer).unwrap();
        assert_eq!(&b"buffered payload"[..], &buffer[..]);
    }

    #[test]
    fn test_second_mount_is_read_only() {
        let fs = TestFs::new().unwrap();
        fs.write("a", &[1]).unwrap();

        let second = BlockFs::mount(fs.mount_file()).unwrap();
        assert!(!second.data_owner());
        assert_eq!(Err(BlockFsError::ReadOnly), second.write("b", &[2]));
        assert_eq!(Err(BlockFsError::ReadOnly), second.unlink("a"));
        assert_eq!(vec![1], second.read("a").unwrap());
    }

    #[test]
    fn test_exclusive_mount_fails_when_locked() {
        let fs = TestFs::new().unwrap();

        let err = BlockFs::mount_with(
            fs.mount_file(),
            Options {
                exclusive: true,
                ..Options::default()
            },
        )
        .unwrap_err();
        assert_eq!(BlockFsError::AlreadyMounted, err);
    }

    #[test]
    fn test_mount_point() {
        let fs = TestFs::new().unwrap();
        let mount_point = fs.mount_point().to_path_buf();

        // The mount point is the mount file path minus its extension.
        assert_eq!(fs.mount_file().with_extension(""), mount_point);
    }

    #[test]
    fn test_corrupt_mount_map() {
        let dir = tempfile::tempdir().unwrap();
        let mount_file = dir.path().join("store.mnt");
        std::fs::write(&mount_file, b"not a mount map").unwrap();

        let err = BlockFs::mount(&mount_file).unwrap_err();
        assert!(matches!(err, BlockFsError::Corrupt(_)));
    }
}
