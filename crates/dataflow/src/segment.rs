use crate::errors::NodeError;
use crate::header::{self, NodeHeader, SlotRecord};
use crate::names::{self, NodeConfig};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A file-backed shared segment holding one node: header, slot table and
/// payload region.
///
/// Whichever endpoint arrives first creates the file at the minimum extent
/// (header plus slot table) and wins the in-segment initialization race;
/// the sink later grows the file to cover the payload and every endpoint
/// remaps to the full extent.
pub struct Segment {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    name: String,
}

unsafe impl Send for Segment {}

impl Segment {
    pub fn open_or_create(cfg: &NodeConfig, name: &str) -> Result<Self, NodeError> {
        names::validate(name)?;
        let path = cfg.segment_path(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;

        // Only resize if the file is smaller than needed.
        if file.metadata()?.len() < header::REGION_MIN_BYTES as u64 {
            file.set_len(header::REGION_MIN_BYTES as u64)?;
        }

        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let segment = Self {
            file,
            mmap,
            path,
            name: name.to_string(),
        };
        segment.init_or_validate(cfg)?;

        Ok(segment)
    }

    /// One-time header construction, gated by an init flag stored in the
    /// segment so concurrent creators resolve to a single winner.
    fn init_or_validate(&self, cfg: &NodeConfig) -> Result<(), NodeError> {
        let header = self.header();

        match header.init_state.compare_exchange(
            header::init_state::RAW,
            header::init_state::INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let ptr = self.mmap.as_ptr() as *mut NodeHeader;
                unsafe {
                    std::ptr::addr_of_mut!((*ptr).magic).write(header::MAGIC);
                    std::ptr::addr_of_mut!((*ptr).version).write(header::VERSION);
                    std::ptr::addr_of_mut!((*ptr).payload_offset)
                        .write(header::PAYLOAD_OFFSET as u64);
                }
                header
                    .max_sources
                    .store(cfg.max_sources, Ordering::Relaxed);
                header
                    .init_state
                    .store(header::init_state::READY, Ordering::Release);
            }
            Err(state) => {
                let mut state = state;
                while state != header::init_state::READY {
                    std::thread::sleep(Duration::from_millis(1));
                    state = header.init_state.load(Ordering::Acquire);
                }
            }
        }

        if header.magic != header::MAGIC
            || header.version != header::VERSION
            || header.payload_offset != header::PAYLOAD_OFFSET as u64
        {
            return Err(NodeError::Corrupt(self.name.clone()));
        }

        Ok(())
    }

    /// Grow the backing file to at least `total` bytes and remap.
    ///
    /// Existing mappings held by other endpoints stay valid for the region
    /// they cover; they remap once the sink publishes the payload extent.
    pub fn ensure_len(&mut self, total: u64) -> Result<(), NodeError> {
        if self.file.metadata()?.len() < total {
            self.file.set_len(total)?;
        }
        self.remap()
    }

    pub fn remap(&mut self) -> Result<(), NodeError> {
        self.mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }

    pub fn header(&self) -> &NodeHeader {
        unsafe { &*(self.mmap.as_ptr() as *const NodeHeader) }
    }

    pub fn slot(&self, index: u32) -> &SlotRecord {
        debug_assert!((index as usize) < header::SLOT_CAP);
        unsafe {
            let table = self.mmap.as_ptr().add(header::HEADER_BYTES) as *const SlotRecord;
            &*table.add(index as usize)
        }
    }

    /// Base of the payload region. Valid once the mapping covers
    /// `payload_offset + payload_bytes`.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(header::PAYLOAD_OFFSET) }
    }

    pub fn mapped_payload_bytes(&self) -> usize {
        self.mmap.len().saturating_sub(header::PAYLOAD_OFFSET)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing file. Called by whichever endpoint observes the
    /// stream drained (sink END with zero attached sources).
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Could not remove segment {}: {}", self.path.display(), e);
        }
    }
}
