//! Spill store implementation
//!
//! Directory layout:
//! - `<digest:016x>.frame`: one self-describing entry per cached frame
//! - `<digest:016x>.tmp`: in-flight write, renamed into place on completion
//!
//! The entry headers are the durable index. Opening a store scans them to
//! rebuild the in-memory map, so there is nothing to flush on drop and a
//! crashed process costs at most the entry it was writing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use memmap2::Mmap;
use parking_lot::RwLock;

use reelcache::{
    CacheKey, CacheStage, DiskTier, DiskTierProvider, FrameBuffer, MemoryBudget, StageMask, Strip,
};

use crate::error::{Error, Result};
use crate::format::{create_header, parse_header, FrameHeader, FIXED_HEADER_LEN, FORMAT_VERSION};

/// What the index keeps per entry: enough to invalidate and trim without
/// reopening files.
struct IndexEntry {
    stage: CacheStage,
    timeline_frame: i32,
    strip_name: String,
    payload_len: u64,
    write_order: u64,
}

/// File-per-frame spill store.
///
/// Implements [`DiskTier`] for a cache session. Entries are named by their
/// key's stable digest, so the same frame resolves to the same file across
/// process restarts. Reads go through a memory map and allocate a fresh
/// [`FrameBuffer`] charged to the session budget.
pub struct DiskStore {
    /// Directory holding the entry files
    root: PathBuf,

    /// Budget read-back frames are charged against
    budget: Arc<MemoryBudget>,

    /// Total payload bytes allowed before trimming
    size_limit: u64,

    /// In-memory index: key digest -> entry metadata
    index: RwLock<HashMap<u64, IndexEntry>>,

    /// Next write order number
    write_seq: AtomicU64,
}

impl DiskStore {
    /// Open or create a spill store at the given directory
    ///
    /// # Arguments
    /// * `root` - Directory for the entry files, created if missing
    /// * `budget` - Session budget that read-back frames are charged to
    /// * `size_limit` - Payload byte total `trim_to_limit` keeps the store under
    ///
    /// # Returns
    /// * `Result<DiskStore>` - Store handle with the index rebuilt from disk
    pub fn open<P: AsRef<Path>>(
        root: P,
        budget: Arc<MemoryBudget>,
        size_limit: u64,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut index = HashMap::new();
        let mut write_seq = 0u64;
        for (digest, header) in scan_entries(&root)? {
            index.insert(
                digest,
                IndexEntry {
                    stage: header.stage,
                    timeline_frame: header.timeline_frame,
                    strip_name: header.strip_name,
                    payload_len: header.payload_len,
                    write_order: write_seq,
                },
            );
            write_seq += 1;
        }

        Ok(Self {
            root,
            budget,
            size_limit,
            index: RwLock::new(index),
            write_seq: AtomicU64::new(write_seq),
        })
    }

    /// A provider closure for lazy store creation, as the cache core expects.
    ///
    /// Open failures surface as `None`, leaving that session RAM-only until
    /// the next attempt.
    pub fn provider(root: PathBuf, budget: Arc<MemoryBudget>, size_limit: u64) -> DiskTierProvider {
        Box::new(move || {
            DiskStore::open(&root, Arc::clone(&budget), size_limit)
                .ok()
                .map(|store| Arc::new(store) as Arc<dyn DiskTier>)
        })
    }

    /// Read a frame back from disk
    ///
    /// # Arguments
    /// * `key` - Cache key the frame was written under
    ///
    /// # Returns
    /// * `Result<Option<Arc<FrameBuffer>>>` - The frame, or `None` on a miss.
    ///   A damaged entry reads as a miss and is deleted so it cannot serve
    ///   garbage twice.
    pub fn read_frame(&self, key: &CacheKey) -> Result<Option<Arc<FrameBuffer>>> {
        let digest = key.stable_digest();
        if !self.index.read().contains_key(&digest) {
            return Ok(None);
        }

        let path = self.entry_path(digest);
        let (header, header_len, map) = match map_entry(&path, digest) {
            Ok(mapped) => mapped,
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                // Index got ahead of the directory; forget the entry.
                self.index.write().remove(&digest);
                return Ok(None);
            }
            Err(Error::Format(_)) => {
                self.index.write().remove(&digest);
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let payload = map[header_len..].to_vec();
        let frame = FrameBuffer::alloc(&self.budget, header.width, header.height, payload);
        Ok(Some(Arc::new(frame)))
    }

    /// Write a frame to disk
    ///
    /// # Arguments
    /// * `key` - Cache key to store the frame under
    /// * `frame` - Payload to persist
    ///
    /// # Returns
    /// * `Result<()>` - Ok once the entry file is in place. A key that is
    ///   already stored keeps its first copy, mirroring the RAM tier.
    pub fn write_frame(&self, key: &CacheKey, frame: &Arc<FrameBuffer>) -> Result<()> {
        let digest = key.stable_digest();
        let mut index = self.index.write();
        if index.contains_key(&digest) {
            return Ok(());
        }

        let header = FrameHeader {
            version: FORMAT_VERSION,
            stage: key.stage(),
            frame_index_bits: key.frame_index().to_bits(),
            timeline_frame: key.timeline_frame(),
            key_digest: digest,
            width: frame.width(),
            height: frame.height(),
            payload_len: frame.size_bytes() as u64,
            strip_name: key.strip().name().to_string(),
        };
        let header_bytes = create_header(&header)?;

        let path = self.entry_path(digest);
        let tmp = path.with_extension("tmp");
        if let Err(err) = persist_entry(&tmp, &path, &header_bytes, frame.data()) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }

        let write_order = self.write_seq.fetch_add(1, Ordering::Relaxed);
        index.insert(
            digest,
            IndexEntry {
                stage: header.stage,
                timeline_frame: header.timeline_frame,
                strip_name: header.strip_name,
                payload_len: header.payload_len,
                write_order,
            },
        );
        Ok(())
    }

    /// Delete entries invalidated by an edit, following the same rules as the
    /// RAM tier: final-output frames for any strip inside the affected range
    /// intersection, and earlier-stage frames of `strip` itself inside the
    /// changed strip's range. Strips match by name since entries outlive the
    /// handles that wrote them.
    ///
    /// Returns how many entries were deleted.
    pub fn invalidate_entries(
        &self,
        strip: &Arc<Strip>,
        changed_strip: &Arc<Strip>,
        stages: StageMask,
    ) -> Result<usize> {
        let changed_start = changed_strip.left_handle();
        let changed_end = changed_strip.right_handle();
        let range_start = changed_start.max(strip.left_handle());
        let range_end = changed_end.min(strip.right_handle());

        let final_mask = stages & StageMask::FINAL_OUTPUT;
        let source_mask = stages & StageMask::SOURCE;

        let mut index = self.index.write();
        let doomed: Vec<u64> = index
            .iter()
            .filter(|(_, entry)| {
                let stage = entry.stage.mask();
                let tf = entry.timeline_frame;
                if stage.intersects(final_mask) && tf >= range_start && tf <= range_end {
                    return true;
                }
                stage.intersects(source_mask)
                    && entry.strip_name == strip.name()
                    && tf >= changed_start
                    && tf <= changed_end
            })
            .map(|(digest, _)| *digest)
            .collect();

        let mut removed = 0;
        for digest in doomed {
            remove_entry_file(&self.entry_path(digest))?;
            index.remove(&digest);
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete oldest-written entries until total payload bytes fit the limit.
    ///
    /// Returns how many entries were deleted.
    pub fn trim_to_limit(&self) -> Result<usize> {
        let mut index = self.index.write();
        let mut total: u64 = index.values().map(|entry| entry.payload_len).sum();
        if total <= self.size_limit {
            return Ok(0);
        }

        let mut by_age: Vec<(u64, u64, u64)> = index
            .iter()
            .map(|(digest, entry)| (entry.write_order, *digest, entry.payload_len))
            .collect();
        by_age.sort_unstable_by_key(|(write_order, ..)| *write_order);

        let mut removed = 0;
        for (_, digest, payload_len) in by_age {
            if total <= self.size_limit {
                break;
            }
            remove_entry_file(&self.entry_path(digest))?;
            index.remove(&digest);
            total -= payload_len;
            removed += 1;
        }
        Ok(removed)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Check if the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Total payload bytes currently stored
    pub fn total_payload_bytes(&self) -> u64 {
        self.index.read().values().map(|entry| entry.payload_len).sum()
    }

    /// Configured payload byte limit
    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Directory holding the entry files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, digest: u64) -> PathBuf {
        self.root.join(format!("{:016x}.frame", digest))
    }
}

impl DiskTier for DiskStore {
    fn read(&self, key: &CacheKey) -> Option<Arc<FrameBuffer>> {
        self.read_frame(key).ok().flatten()
    }

    fn write(&self, key: &CacheKey, frame: &Arc<FrameBuffer>) {
        let _ = self.write_frame(key, frame);
    }

    fn invalidate(&self, strip: &Arc<Strip>, changed_strip: &Arc<Strip>, stages: StageMask) {
        let _ = self.invalidate_entries(strip, changed_strip, stages);
    }

    fn enforce_size_limit(&self) {
        let _ = self.trim_to_limit();
    }
}

/// Scan the directory and return `(digest, header)` per valid entry, oldest
/// write first. Damaged entries and leftover temp files are deleted.
fn scan_entries(root: &Path) -> Result<Vec<(u64, FrameHeader)>> {
    let mut found: Vec<(u64, FrameHeader, SystemTime)> = Vec::new();

    for dir_entry in fs::read_dir(root)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let path = dir_entry.path();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("frame") => {}
            // A leftover temp file is an interrupted write.
            Some("tmp") => {
                let _ = fs::remove_file(&path);
                continue;
            }
            _ => continue,
        }

        let digest = match digest_from_path(&path) {
            Some(digest) => digest,
            None => {
                let _ = fs::remove_file(&path);
                continue;
            }
        };

        match map_entry(&path, digest) {
            Ok((header, _, _)) => {
                let modified = dir_entry
                    .metadata()?
                    .modified()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((digest, header, modified));
            }
            Err(_) => {
                let _ = fs::remove_file(&path);
            }
        }
    }

    // Write order across restarts comes from file times.
    found.sort_by_key(|(_, _, modified)| *modified);
    Ok(found
        .into_iter()
        .map(|(digest, header, _)| (digest, header))
        .collect())
}

/// Map an entry file and parse its header, validating it against the digest
/// the file is named after and the actual file size.
fn map_entry(path: &Path, digest: u64) -> Result<(FrameHeader, usize, Mmap)> {
    let file = File::open(path)?;
    if file.metadata()?.len() < FIXED_HEADER_LEN as u64 {
        return Err(Error::Format("entry shorter than fixed header".to_string()));
    }

    // SAFETY: entry files are written to a temp name and renamed into place,
    // never rewritten, so the mapping cannot observe a mutation.
    let map = unsafe { Mmap::map(&file)? };

    let (header, header_len) = parse_header(&map)?;
    if header.key_digest != digest {
        return Err(Error::Format("digest does not match file name".to_string()));
    }
    if header.payload_len != (map.len() - header_len) as u64 {
        return Err(Error::Format(
            "payload length disagrees with file size".to_string(),
        ));
    }
    Ok((header, header_len, map))
}

fn persist_entry(tmp: &Path, path: &Path, header: &[u8], payload: &[u8]) -> Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(header)?;
    file.write_all(payload)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn remove_entry_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Already gone is what we wanted.
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn digest_from_path(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    u64::from_str_radix(stem, 16).ok()
}
