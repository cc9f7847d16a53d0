//! Dyld shared cache context and file handling.
//!
//! This module provides the main interface for working with dyld shared
//! caches, including memory mapping, address conversion, and subcache
//! management. The context is the collaborator the prebuilt loader decoder
//! uses to translate cache VM addresses into readable byte windows.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use super::structs::*;
use crate::error::{Error, Result};

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry that works with both basic and extended mapping
/// formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// Mapping flags
    pub flags: u64,
    /// Index of the subcache containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: 0,
            subcache_index,
        }
    }

    /// Creates a mapping entry from extended mapping info.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo, subcache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            flags: info.flags,
            subcache_index,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Returns true if this mapping is readable.
    #[inline]
    pub fn is_readable(&self) -> bool {
        (self.init_prot & 1) != 0
    }

    /// Returns true if this mapping is writable.
    #[inline]
    pub fn is_writable(&self) -> bool {
        (self.init_prot & 2) != 0
    }

    /// Returns true if this mapping is executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        (self.init_prot & 4) != 0
    }

    /// Returns the mapping flags.
    #[inline]
    pub fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded subcache file.
#[derive(Debug)]
pub struct SubcacheFile {
    /// Memory-mapped file data
    pub mmap: Mmap,
    /// Path to the file
    pub path: PathBuf,
    /// UUID of the subcache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub vm_offset: u64,
    /// Parsed header
    pub header: DyldCacheHeader,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// This struct holds all the state needed to read prebuilt loader data out
/// of a dyld shared cache, including handling of subcaches. Decoded records
/// never borrow from the mapped files.
#[derive(Debug)]
pub struct DyldContext {
    /// Main cache file (memory-mapped)
    pub mmap: Mmap,
    /// Path to the main cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// All mappings (including from subcaches)
    pub mappings: Vec<MappingEntry>,
    /// All images
    pub images: Vec<ImageEntry>,
    /// Subcache files
    pub subcaches: Vec<SubcacheFile>,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// This will automatically detect and load any subcaches.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Memory-map the main cache file
        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        // Parse and validate the header
        let header = Self::parse_header(&mmap)?;

        // Parse mappings
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;

        // Create initial context
        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
        };

        // Load subcaches if present
        ctx.load_subcaches(&path)?;

        // Parse images (after subcaches are loaded)
        ctx.images = ctx.parse_images()?;

        debug!(
            "opened cache: {} mappings, {} images, {} subcaches",
            ctx.mappings.len(),
            ctx.images.len(),
            ctx.subcaches.len()
        );

        Ok(ctx)
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < std::mem::size_of::<DyldCacheHeader>() {
            return Err(Error::BufferTooSmall {
                needed: std::mem::size_of::<DyldCacheHeader>(),
                available: data.len(),
            });
        }

        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| Error::Parse {
                offset: 0,
                reason: "failed to parse dyld cache header".into(),
            })?
            .0;

        // Validate magic
        if !header.is_valid() {
            return Err(Error::InvalidMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Parses mapping entries from the cache.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let mut mappings = Vec::with_capacity(header.mapping_count as usize);

        // Check if we have extended mapping info
        let use_extended = header.contains_field(std::mem::offset_of!(
            DyldCacheHeader,
            mapping_with_slide_offset
        )) && header.mapping_with_slide_offset != 0;

        if use_extended {
            let offset = header.mapping_with_slide_offset as usize;
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
                let info = DyldCacheMappingAndSlideInfo::read_from_prefix(&data[entry_offset..])
                    .map_err(|_| Error::Parse {
                        offset: entry_offset,
                        reason: "failed to parse extended mapping".into(),
                    })?
                    .0;
                mappings.push(MappingEntry::from_extended(&info, subcache_index));
            }
        } else {
            let offset = header.mapping_offset as usize;
            for i in 0..header.mapping_count as usize {
                let entry_offset = offset + i * std::mem::size_of::<DyldCacheMappingInfo>();
                let info = DyldCacheMappingInfo::read_from_prefix(&data[entry_offset..])
                    .map_err(|_| Error::Parse {
                        offset: entry_offset,
                        reason: "failed to parse mapping".into(),
                    })?
                    .0;
                mappings.push(MappingEntry::from_basic(&info, subcache_index));
            }
        }

        Ok(mappings)
    }

    /// Loads subcache files.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let parent_dir = main_path.parent().unwrap_or(Path::new("."));
        let main_name = main_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;

        // Determine entry size (v1 vs v2)
        let entry_size = if self.has_v2_subcache_entries() {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        for i in 0..count {
            let entry_offset = offset + i * entry_size;

            let (uuid, vm_offset, suffix) = if self.has_v2_subcache_entries() {
                let entry = DyldSubcacheEntry2::read_from_prefix(&self.mmap[entry_offset..])
                    .map_err(|_| Error::Parse {
                        offset: entry_offset,
                        reason: "failed to parse subcache entry v2".into(),
                    })?
                    .0;
                (
                    entry.uuid,
                    entry.cache_vm_offset,
                    entry.suffix_str().to_string(),
                )
            } else {
                let entry = DyldSubcacheEntry::read_from_prefix(&self.mmap[entry_offset..])
                    .map_err(|_| Error::Parse {
                        offset: entry_offset,
                        reason: "failed to parse subcache entry".into(),
                    })?
                    .0;
                (entry.uuid, entry.cache_vm_offset, format!(".{}", i + 1))
            };

            // Load subcache file
            let subcache_path = parent_dir.join(format!("{}{}", main_name, suffix));
            self.load_subcache_file(&subcache_path, uuid, vm_offset, i + 1)?;
        }

        Ok(())
    }

    /// Loads a single subcache file.
    fn load_subcache_file(
        &mut self,
        path: &Path,
        expected_uuid: [u8; 16],
        vm_offset: u64,
        subcache_index: usize,
    ) -> Result<()> {
        let file = File::open(path).map_err(|_| Error::SubcacheNotFound {
            path: path.to_path_buf(),
        })?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        let header = Self::parse_header(&mmap)?;

        // Validate UUID
        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        // Parse and add mappings from this subcache
        let subcache_mappings = Self::parse_mappings(&mmap, &header, subcache_index)?;
        self.mappings.extend(subcache_mappings);

        self.subcaches.push(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            uuid: header.uuid,
            vm_offset,
            header,
        });

        Ok(())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let mut images = Vec::with_capacity(count);

        for i in 0..count {
            let entry_offset = offset + i * std::mem::size_of::<DyldCacheImageInfo>();
            let info = DyldCacheImageInfo::read_from_prefix(&self.mmap[entry_offset..])
                .map_err(|_| Error::Parse {
                    offset: entry_offset,
                    reason: "failed to parse image info".into(),
                })?
                .0;

            // Read the path string
            let path = self.read_string(info.path_file_offset as usize)?;

            images.push(ImageEntry {
                index: i,
                address: info.address,
                path,
                mod_time: info.mod_time,
                inode: info.inode,
            });
        }

        Ok(images)
    }

    /// Checks if this cache uses v2 subcache entries.
    fn has_v2_subcache_entries(&self) -> bool {
        if self.header.sub_cache_array_count == 0 {
            return false;
        }

        // Check by trying to read a v2 entry and seeing if the suffix looks valid
        let offset = self.header.sub_cache_array_offset as usize;
        if offset + std::mem::size_of::<DyldSubcacheEntry2>() > self.mmap.len() {
            return false;
        }

        if let Ok((entry, _)) = DyldSubcacheEntry2::read_from_prefix(&self.mmap[offset..]) {
            // V2 entries have ASCII suffix starting with '.'
            entry.file_suffix[0] == b'.'
        } else {
            false
        }
    }

    /// Reads a null-terminated string from the main cache file.
    ///
    /// Uses SIMD-accelerated null byte search (memchr).
    pub fn read_string(&self, offset: usize) -> Result<String> {
        if offset >= self.mmap.len() {
            return Err(Error::Parse {
                offset,
                reason: "string offset out of bounds".into(),
            });
        }

        let bytes = &self.mmap[offset..];
        let end = crate::util::memchr_null(bytes);
        String::from_utf8(bytes[..end].to_vec()).map_err(|_| Error::Parse {
            offset,
            reason: "invalid UTF-8 string".into(),
        })
    }

    /// Returns the mapping for a given virtual address.
    /// Uses binary search for O(log n) lookup.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self
            .mappings
            .partition_point(|m| m.address + m.size <= addr);
        if idx < self.mappings.len() {
            let mapping = &self.mappings[idx];
            if mapping.contains_addr(addr) {
                return Some(mapping);
            }
        }
        // Fallback to linear search for caches with unsorted mappings
        self.mappings.iter().find(|m| m.contains_addr(addr))
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.mapping_for_addr(addr).map(|m| m.addr_to_offset(addr))
    }

    /// Returns exactly `len` bytes of file data at the given address.
    ///
    /// This handles both the main cache and subcaches.
    #[inline]
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let window = self.window_at_addr(addr)?;
        if len > window.len() {
            return Err(Error::buffer_too_small(len, window.len()));
        }
        Ok(&window[..len])
    }

    /// Returns the remainder of the containing cache file starting at `addr`.
    ///
    /// This is the positioned window the prebuilt loader decoders consume:
    /// byte 0 of the returned slice is the byte at `addr`, and the window
    /// extends to the end of the containing subcache file.
    pub fn window_at_addr(&self, addr: u64) -> Result<&[u8]> {
        let mapping = self
            .mapping_for_addr(addr)
            .ok_or(Error::AddressNotFound { addr })?;
        let offset = mapping.addr_to_offset(addr) as usize;
        let data = self.data_for_subcache(mapping.subcache_index);
        if offset > data.len() {
            return Err(Error::buffer_too_small(offset, data.len()));
        }
        Ok(&data[offset..])
    }

    /// Returns the mmap data for a given subcache index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else if let Some(subcache) = self.subcaches.get(index - 1) {
            &subcache.mmap[..]
        } else {
            &[]
        }
    }

    /// Returns an iterator over all images.
    pub fn iter_images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Finds an image by path or basename substring.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.matches_filter(name))
    }

    /// Returns the image table index for an exact install path, if present.
    pub fn image_index(&self, path: &str) -> Option<usize> {
        self.images.iter().position(|img| img.path == path)
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns true if this cache has subcaches.
    pub fn has_subcaches(&self) -> bool {
        !self.subcaches.is_empty()
    }

    /// Returns the total size of all cache files.
    pub fn total_size(&self) -> u64 {
        let main_size = self.mmap.len() as u64;
        let subcache_size: u64 = self.subcaches.iter().map(|s| s.mmap.len() as u64).sum();
        main_size + subcache_size
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }
}
