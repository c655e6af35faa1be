//! Shared region management using mmap.
//!
//! Creates or opens a memory-mapped file that holds the entire table:
//! header, line-lock words, slot arrays and cell matrices. A peer
//! attaching to an existing file reads (N, K, V) back out of the header.
//! An anonymous variant backs single-process multi-thread tables.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use memmap2::MmapMut;
use tracing::info;

use super::layout::{
    self, Header, FREE_CURSOR_OFFSET, MAGIC, READER_GATE_OFFSET, SIZE_OFFSET, VERSION,
    WRITER_GATE_OFFSET,
};

/// Where to store the backing files.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("weft_map")
    }
}

/// The full shared region, owning the mapping and providing raw
/// accessors to the structures within.
pub struct TableRegion {
    mmap: MmapMut,
    path: Option<PathBuf>,
}

impl TableRegion {
    /// Create a new named region, initializing all structures.
    pub fn create(name: &str, capacity: u32, max_key_len: u32, max_value_len: u32) -> io::Result<Self> {
        validate_dims(capacity, max_key_len, max_value_len)?;

        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = dir.join(format!("{name}.map"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let total_size = layout::region_size(capacity, max_key_len, max_value_len);
        file.set_len(total_size as u64)?;

        // Safety: we just created and truncated this file and own it
        // exclusively until the header is published.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        init_region(&mut mmap, capacity, max_key_len, max_value_len);
        mmap.flush()?;

        info!(name, capacity, max_key_len, max_value_len, "created shared table region");
        Ok(TableRegion {
            mmap,
            path: Some(path),
        })
    }

    /// Open an existing named region, validating magic and version.
    pub fn open(name: &str) -> io::Result<Self> {
        let path = shm_dir().join(format!("{name}.map"));
        let region = Self::open_path(&path)?;
        let h = region.header();
        info!(
            name,
            capacity = h.capacity,
            max_key_len = h.max_key_len,
            max_value_len = h.max_value_len,
            "attached to shared table region"
        );
        Ok(region)
    }

    fn open_path(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < layout::HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared table file too small for header",
            ));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const Header) };
        if header.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared table file: bad magic",
            ));
        }
        if header.version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported shared table version {}", header.version),
            ));
        }
        let expected = layout::region_size(header.capacity, header.max_key_len, header.max_value_len);
        if mmap.len() < expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared table file truncated",
            ));
        }

        Ok(TableRegion {
            mmap,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open if a compatible region exists, otherwise (re)create.
    pub fn create_or_open(
        name: &str,
        capacity: u32,
        max_key_len: u32,
        max_value_len: u32,
    ) -> io::Result<Self> {
        let path = shm_dir().join(format!("{name}.map"));
        if path.exists() {
            if let Ok(region) = Self::open_path(&path) {
                let h = region.header();
                if h.capacity == capacity
                    && h.max_key_len == max_key_len
                    && h.max_value_len == max_value_len
                {
                    return Ok(region);
                }
                // Parameters don't match; fall through and recreate.
            }
        }
        Self::create(name, capacity, max_key_len, max_value_len)
    }

    /// Create an anonymous region for single-process sharing.
    pub fn anonymous(capacity: u32, max_key_len: u32, max_value_len: u32) -> io::Result<Self> {
        validate_dims(capacity, max_key_len, max_value_len)?;
        let total_size = layout::region_size(capacity, max_key_len, max_value_len);
        let mut mmap = MmapMut::map_anon(total_size)?;
        init_region(&mut mmap, capacity, max_key_len, max_value_len);
        Ok(TableRegion { mmap, path: None })
    }

    /// Remove the backing file, if any.
    pub fn unlink(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.mmap.as_ptr() as *const Header) }
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Mutable base pointer. Callers uphold the locking protocol; the
    /// mapping itself is always writable.
    pub fn base_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    // --- Atomic header word accessors ---

    fn atomic_u32_at(&self, offset: usize) -> &AtomicU32 {
        unsafe { &*(self.base_ptr().add(offset) as *const AtomicU32) }
    }

    /// Occupied-slot counter.
    pub fn size_word(&self) -> &AtomicU32 {
        self.atomic_u32_at(SIZE_OFFSET)
    }

    /// Advisory free-slot scan cursor.
    pub fn free_cursor(&self) -> &AtomicU32 {
        self.atomic_u32_at(FREE_CURSOR_OFFSET)
    }

    /// Writer-side global gate word.
    pub fn writer_gate(&self) -> &AtomicU32 {
        self.atomic_u32_at(WRITER_GATE_OFFSET)
    }

    /// Reader-side global gate word (the traversal marker).
    pub fn reader_gate(&self) -> &AtomicU32 {
        self.atomic_u32_at(READER_GATE_OFFSET)
    }

    /// Line-lock word for one slot.
    pub fn line_lock(&self, slot: u32) -> &AtomicI32 {
        debug_assert!(slot < self.capacity());
        unsafe {
            &*(self
                .base_ptr()
                .add(layout::locks_offset() + slot as usize * 4) as *const AtomicI32)
        }
    }
}

// The region is a bag of atomics and lock-protected cells; all mutation
// goes through the locking protocol in `lock.rs`.
unsafe impl Send for TableRegion {}
unsafe impl Sync for TableRegion {}

fn validate_dims(capacity: u32, max_key_len: u32, max_value_len: u32) -> io::Result<()> {
    if capacity == 0 || max_key_len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "capacity and max key length must be non-zero",
        ));
    }
    // INVALID = capacity must be representable alongside slot indexes.
    if capacity == u32::MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "capacity too large",
        ));
    }
    let _ = max_value_len;
    Ok(())
}

/// Zero the mapping, write the header and reset every slot to empty
/// (key length 0, next = INVALID).
fn init_region(mmap: &mut MmapMut, capacity: u32, max_key_len: u32, max_value_len: u32) {
    mmap.fill(0);

    let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut Header) };
    header.magic = MAGIC;
    header.version = VERSION;
    header.capacity = capacity;
    header.max_key_len = max_key_len;
    header.max_value_len = max_value_len;
    header.size = 0;
    header.free_cursor = 0;
    header.writer_gate = 0;
    header.reader_gate = 0;

    // key lengths and lock words are already correct (zeroed); next
    // pointers start at the INVALID sentinel.
    let nexts = layout::nexts_offset(capacity);
    for i in 0..capacity as usize {
        let word = unsafe { &mut *(mmap.as_mut_ptr().add(nexts + i * 4) as *mut u32) };
        *word = capacity;
    }

    // Publish the fill before any peer maps the file.
    std::sync::atomic::fence(Ordering::SeqCst);
}
