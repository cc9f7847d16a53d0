//! Prebuilt loader set decoding.
//!
//! dyld4-era shared caches carry pre-computed launch state: for each known
//! executable a `PrebuiltLoaderSet`, an mmap()ed read-only graph of
//! `PrebuiltLoader` records describing an image's segments, dependents,
//! bind targets, and ObjC fixups. At launch dyld uses these to skip
//! just-in-time binding; this module decodes them for inspection.
//!
//! The on-disk format is untyped and offset-based: every 16- or 32-bit
//! offset inside a loader record is relative to the start of that record,
//! every offset inside a set header is relative to the start of the set,
//! and the ObjC fixup sub-tables are relative to the `ObjCBinaryInfo`
//! block. Sub-byte state is packed into integer flag words and decoded
//! through accessor functions. Decoded records own their variable-length
//! data and never borrow from the source window.

use std::fmt;
use std::mem::{offset_of, size_of};

use tracing::debug;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::context::{DyldContext, ImageEntry};
use super::structs::{uuid_to_string, DyldCacheHeader};
use super::trie::ProgramTrie;
use crate::error::{Error, Result};
use crate::util::{
    extract_bits, memchr_null, read_u16_le_at, read_u32_le_at, read_u64_le_at, read_uleb128_fast,
    sign_extend,
};

/// Magic of a `Loader` record ("l4yd").
pub const LOADER_MAGIC: u32 = 0x6c34_7964;
/// Magic of a `PrebuiltLoaderSet` ("sp4d").
pub const PREBUILT_LOADER_SET_MAGIC: u32 = 0x7370_3464;
/// `index_of_twin` value meaning the image has no unzippered twin.
pub const NO_UNZIPPERED_TWIN: u16 = 0xFFFF;

// =============================================================================
// Loader References
// =============================================================================

/// Packed 16-bit reference to a loader within a set.
///
/// Bits 0-14 are the index into the `PrebuiltLoaderSet`; bit 15 selects
/// the app-side set over the dyld cache set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct LoaderRef(pub u16);

impl LoaderRef {
    /// Index into the referenced `PrebuiltLoaderSet`.
    #[inline]
    pub fn index(self) -> u16 {
        extract_bits(self.0 as u64, 0, 15) as u16
    }

    /// App-side set vs dyld cache set.
    #[inline]
    pub fn is_app(self) -> bool {
        extract_bits(self.0 as u64, 15, 1) != 0
    }

    /// Returns true for the sentinel denoting a missing weak image.
    #[inline]
    pub fn is_missing_weak_image(self) -> bool {
        self.index() == 0x7fff && !self.is_app()
    }
}

impl fmt::Display for LoaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index: {}", self.index())?;
        if self.is_app() {
            write!(f, ", type: app")?;
        }
        if self.is_missing_weak_image() {
            write!(f, " (missing weak image)")?;
        }
        Ok(())
    }
}

/// Header common to prebuilt and just-in-time loaders.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Loader {
    /// Record magic, "l4yd"
    pub magic: u32,
    /// Packed flag word, decoded through the accessors
    pub info: u16,
    /// This loader's own reference within its set
    pub loader_ref: LoaderRef,
}

impl Loader {
    /// PrebuiltLoader vs JustInTimeLoader.
    #[inline]
    pub fn is_prebuilt(&self) -> bool {
        extract_bits(self.info as u64, 0, 1) != 0
    }

    /// Image lives in the dyld shared cache.
    #[inline]
    pub fn dylib_in_dyld_cache(&self) -> bool {
        extract_bits(self.info as u64, 1, 1) != 0
    }

    /// Image contains ObjC metadata.
    #[inline]
    pub fn has_objc(&self) -> bool {
        extract_bits(self.info as u64, 2, 1) != 0
    }

    /// Image may have ObjC +load methods.
    #[inline]
    pub fn may_have_plus_load(&self) -> bool {
        extract_bits(self.info as u64, 3, 1) != 0
    }

    /// Image has a __DATA_CONST segment.
    #[inline]
    pub fn has_read_only_data(&self) -> bool {
        extract_bits(self.info as u64, 4, 1) != 0
    }

    /// Part of launch, or has non-unloadable data (e.g. objc, tlv).
    #[inline]
    pub fn never_unload(&self) -> bool {
        extract_bits(self.info as u64, 5, 1) != 0
    }

    /// RTLD_NODELETE.
    #[inline]
    pub fn leave_mapped(&self) -> bool {
        extract_bits(self.info as u64, 6, 1) != 0
    }

    /// Has a __DATA_CONST,__objc_selrefs section.
    #[inline]
    pub fn has_read_only_objc(&self) -> bool {
        extract_bits(self.info as u64, 7, 1) != 0
    }

    /// Binary was built before the 2022 toolchains.
    #[inline]
    pub fn pre_2022_binary(&self) -> bool {
        extract_bits(self.info as u64, 8, 1) != 0
    }
}

impl fmt::Display for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        flags.push(if self.is_prebuilt() { "prebuilt" } else { "jit" });
        if self.dylib_in_dyld_cache() {
            flags.push("in-cache-dylib");
        }
        if self.has_objc() {
            flags.push("objc");
        }
        if self.may_have_plus_load() {
            flags.push("+load");
        }
        if self.has_read_only_data() {
            flags.push("ro-data");
        }
        if self.never_unload() {
            flags.push("never-unload");
        }
        if self.leave_mapped() {
            flags.push("leave-mapped");
        }
        if self.has_read_only_objc() {
            flags.push("ro-objc");
        }
        if self.pre_2022_binary() {
            flags.push("pre-2022");
        }
        write!(f, "{}, ref: {}", flags.join("|"), self.loader_ref)
    }
}

// =============================================================================
// Dependents
// =============================================================================

/// How a loader links one of its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentKind {
    /// Regular link
    Normal,
    /// Weak link
    WeakLink,
    /// Re-exported dependency
    Reexport,
    /// Upward link
    Upward,
    /// Value not known to this decoder
    Unknown(u8),
}

impl DependentKind {
    /// Decodes the on-disk kind byte.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => DependentKind::Normal,
            1 => DependentKind::WeakLink,
            2 => DependentKind::Reexport,
            3 => DependentKind::Upward,
            other => DependentKind::Unknown(other),
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependentKind::Normal => write!(f, "regular"),
            DependentKind::WeakLink => write!(f, "weak link"),
            DependentKind::Reexport => write!(f, "reexport"),
            DependentKind::Upward => write!(f, "upward"),
            DependentKind::Unknown(v) => write!(f, "unknown {}", v),
        }
    }
}

/// A resolved dependent of a prebuilt loader.
#[derive(Debug, Clone)]
pub struct Dependent {
    /// Image name, resolved from the cache image table when possible
    pub name: String,
    /// Link kind
    pub kind: DependentKind,
}

// =============================================================================
// Bind Targets
// =============================================================================

/// Packed 64-bit reference to a bind target.
///
/// Encodes either an offset into another loader of the same set (kind 0:
/// loader ref in bits 0-15, high8 in bits 16-23, signed 39-bit offset in
/// bits 24-62) or an absolute value (kind 1: 63-bit payload sign-extended
/// from bit 62). Bit 63 is the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, KnownLayout, Immutable)]
#[repr(transparent)]
pub struct BindTargetRef(pub u64);

impl BindTargetRef {
    /// The loader this target points into (kind 0 only).
    #[inline]
    pub fn loader_ref(self) -> LoaderRef {
        LoaderRef(extract_bits(self.0, 0, 16) as u16)
    }

    #[inline]
    fn high8(self) -> u64 {
        extract_bits(self.0, 16, 8)
    }

    #[inline]
    fn low39(self) -> u64 {
        extract_bits(self.0, 24, 39)
    }

    /// The encoding kind: 0 = loader-relative, 1 = absolute.
    #[inline]
    pub fn kind(self) -> u8 {
        extract_bits(self.0, 63, 1) as u8
    }

    /// Returns true if this target encodes an absolute value.
    #[inline]
    pub fn is_absolute(self) -> bool {
        self.kind() == 1
    }

    /// The decoded absolute value (kind 1 only).
    #[inline]
    pub fn absolute_value(self) -> u64 {
        deserialize_absolute_value(extract_bits(self.0, 0, 63))
    }

    /// The decoded target offset.
    ///
    /// For a relative target the signed 39-bit offset is extended into the
    /// low 56 bits before the high byte is merged back in.
    pub fn offset(self) -> u64 {
        if self.is_absolute() {
            return self.absolute_value();
        }
        let mut offset = self.low39();
        if offset & 0x0000_0040_0000_0000 != 0 {
            // sign bits stop below the high8 field
            offset |= 0x00ff_ff80_0000_0000;
        }
        (self.high8() << 56) | offset
    }
}

impl fmt::Display for BindTargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_absolute() {
            write!(f, "{:#010x}: (absolute)", self.offset())
        } else {
            write!(f, "{:#010x}: ({})", self.offset(), self.loader_ref())
        }
    }
}

/// Sign-extends a serialized 63-bit absolute value into 64 bits.
#[inline]
fn deserialize_absolute_value(value: u64) -> u64 {
    sign_extend(value, 63)
}

/// How a symbol resolution was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSymbolKind {
    /// Target is a location in the same image
    Rebase,
    /// Target is a location in another image
    BindToImage,
    /// Target is an absolute value
    BindAbsolute,
}

impl fmt::Display for ResolvedSymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSymbolKind::Rebase => write!(f, "rebase"),
            ResolvedSymbolKind::BindToImage => write!(f, "bind to image"),
            ResolvedSymbolKind::BindAbsolute => write!(f, "bind absolute"),
        }
    }
}

/// The decoded view of a symbol resolution.
///
/// Consumers interpreting bind targets against export tries produce these;
/// the target loader stays a [`LoaderRef`] resolved by set lookup.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol {
    /// Loader the symbol resolved into, if any
    pub target_loader: Option<LoaderRef>,
    /// Name of the resolved symbol
    pub target_symbol_name: String,
    /// Runtime offset of the symbol within the target
    pub target_runtime_offset: u64,
    /// Resolution kind
    pub kind: ResolvedSymbolKind,
    /// Symbol is code (vs data)
    pub is_code: bool,
    /// Symbol is a weak definition
    pub is_weak_def: bool,
    /// Symbol is a missing flat-namespace lazy lookup
    pub is_missing_flat_lazy: bool,
}

// =============================================================================
// Patches
// =============================================================================

/// A patch replacing a cache dylib location with a bind target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CachePatch {
    /// Index of the cache dylib being patched
    pub dylib_index: u32,
    /// VM offset of the patched location within that dylib
    pub dylib_vm_offset: u32,
    /// Replacement target
    pub patch_to: BindTargetRef,
}

/// `DylibPatch.kind`: terminates the patch table.
pub const PATCH_KIND_END_OF_TABLE: i64 = -1;
/// `DylibPatch.kind`: patched symbol is a missing weak import.
pub const PATCH_KIND_MISSING_WEAK_IMPORT: i64 = 0;
/// `DylibPatch.kind`: patched symbol is an ObjC class.
pub const PATCH_KIND_OBJC_CLASS: i64 = 1;
/// `DylibPatch.kind`: patched symbol is a singleton.
pub const PATCH_KIND_SINGLETON: i64 = 2;

/// One entry of a loader's patch table.
///
/// The table is terminated by an in-band sentinel entry with
/// `kind == PATCH_KIND_END_OF_TABLE`; the sentinel is kept in the decoded
/// list so callers can tell an absent table from an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DylibPatch {
    /// Offset of the overriding implementation
    pub override_offset_of_impl: i64,
    /// Patch kind, one of the `PATCH_KIND_*` constants
    pub kind: i64,
}

impl DylibPatch {
    /// Returns true for the table-terminating sentinel.
    #[inline]
    pub fn is_end_of_table(&self) -> bool {
        self.kind == PATCH_KIND_END_OF_TABLE
    }

    /// Human-readable name of the patch kind.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            PATCH_KIND_END_OF_TABLE => "end-of-table",
            PATCH_KIND_MISSING_WEAK_IMPORT => "missing-weak-import",
            PATCH_KIND_OBJC_CLASS => "objc-class",
            PATCH_KIND_SINGLETON => "singleton",
            _ => "unknown",
        }
    }
}

impl fmt::Display for DylibPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "impl-offset: {:#x}, kind: {}",
            self.override_offset_of_impl,
            self.kind_name()
        )
    }
}

// =============================================================================
// Regions
// =============================================================================

/// One contiguous piece of an image's VM layout.
///
/// Mach-O files are limited to 4GB so `file_size` is 32 bits, but the VM
/// span may be larger through zero fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Region {
    /// Packed word: vm_offset (59 bits), perms (3), is_zero_fill (1),
    /// read_only_data (1)
    pub info: u64,
    /// File offset of the backing bytes
    pub file_offset: u32,
    /// Size of the backing bytes
    pub file_size: u32,
}

impl Region {
    /// VM offset of this region within the image.
    #[inline]
    pub fn vm_offset(&self) -> u64 {
        extract_bits(self.info, 0, 59)
    }

    /// VM protection bits (r=1, w=2, x=4).
    #[inline]
    pub fn perms(&self) -> u8 {
        extract_bits(self.info, 59, 3) as u8
    }

    /// Region is zero fill rather than file backed.
    #[inline]
    pub fn is_zero_fill(&self) -> bool {
        extract_bits(self.info, 62, 1) != 0
    }

    /// Region holds read-only data (__DATA_CONST).
    #[inline]
    pub fn read_only_data(&self) -> bool {
        extract_bits(self.info, 63, 1) != 0
    }

    /// Returns true if this region is readable.
    #[inline]
    pub fn is_readable(&self) -> bool {
        (self.perms() & 1) != 0
    }

    /// Returns true if this region is writable.
    #[inline]
    pub fn is_writable(&self) -> bool {
        (self.perms() & 2) != 0
    }

    /// Returns true if this region is executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        (self.perms() & 4) != 0
    }

    /// Protection bits rendered as "rwx".
    pub fn perms_string(&self) -> String {
        format!(
            "{}{}{}",
            if self.is_readable() { "r" } else { "-" },
            if self.is_writable() { "w" } else { "-" },
            if self.is_executable() { "x" } else { "-" },
        )
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file_off: {:#x}, file_siz: {:#x}, vm_off: {:#x}, perms: {}, is_zerofill: {}, ro_data: {}",
            self.file_offset,
            self.file_size,
            self.vm_offset(),
            self.perms_string(),
            self.is_zero_fill(),
            self.read_only_data()
        )
    }
}

// =============================================================================
// File Validation
// =============================================================================

/// Validation info stored when a prebuilt loader references a file on disk.
///
/// Either the inode/mtime pair or the code-directory hash (or both, or
/// neither) may be authoritative; check the flag accessors.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FileValidation {
    /// Offset of the used slice within a fat file
    pub slice_offset: u64,
    /// Expected inode
    pub inode: u64,
    /// Expected modification time
    pub mtime: u64,
    /// Code directory hash of the file when the loader was built
    pub cd_hash: [u8; 20],
    /// UUID of the file when the loader was built
    pub uuid: [u8; 16],
    check_inode_mtime: u8,
    check_cd_hash: u8,
}

impl FileValidation {
    /// Inode and mtime must match at load time.
    #[inline]
    pub fn validates_inode_mtime(&self) -> bool {
        self.check_inode_mtime != 0
    }

    /// Code directory hash must match at load time.
    #[inline]
    pub fn validates_cd_hash(&self) -> bool {
        self.check_cd_hash != 0
    }

    /// Returns true if a file UUID was recorded.
    #[inline]
    pub fn has_uuid(&self) -> bool {
        self.uuid != [0u8; 16]
    }
}

/// Location of the code signature within the image file.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CodeSignatureInFile {
    /// File offset of the signature blob
    pub file_offset: u32,
    /// Size of the signature blob
    pub size: u32,
}

// =============================================================================
// ObjC Binary Info
// =============================================================================

/// Layout of the ObjC sections in a binary, plus the serialized fixups.
///
/// `protocol_fixups_offset` and `selector_references_fixups_offset` are
/// relative to the start of this block.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ObjCBinaryInfo {
    /// Offset to the __objc_imageinfo section
    pub image_info_runtime_offset: u64,
    /// Offset to the __objc_selrefs section
    pub sel_refs_runtime_offset: u64,
    /// Offset to the __objc_classlist section
    pub class_list_runtime_offset: u64,
    /// Offset to the __objc_catlist section
    pub category_list_runtime_offset: u64,
    /// Offset to the __objc_protolist section
    pub protocol_list_runtime_offset: u64,
    /// Number of selector references
    pub sel_refs_count: u32,
    /// Number of classes
    pub class_list_count: u32,
    /// Number of categories
    pub category_count: u32,
    /// Number of protocols
    pub protocol_list_count: u32,
    has_class_stable_swift_fixups: u8,
    has_class_method_lists_to_set_uniqued: u8,
    has_category_method_lists_to_set_uniqued: u8,
    has_protocol_method_lists_to_set_uniqued: u8,
    has_class_method_lists_to_unique: u8,
    has_category_method_lists_to_unique: u8,
    has_protocol_method_lists_to_unique: u8,
    _pad: u8,
    /// Offset to one bool per protocol; zero if no fixups
    pub protocol_fixups_offset: u32,
    /// Offset to one `BindTargetRef` per selector reference to fix up
    pub selector_references_fixups_offset: u32,
    /// Number of selector reference fixups
    pub selector_references_fixups_count: u32,
}

impl ObjCBinaryInfo {
    /// Stable Swift fixups apply to at least one class.
    #[inline]
    pub fn has_class_stable_swift_fixups(&self) -> bool {
        self.has_class_stable_swift_fixups != 0
    }

    /// Class method lists to mark uniqued.
    #[inline]
    pub fn has_class_method_lists_to_set_uniqued(&self) -> bool {
        self.has_class_method_lists_to_set_uniqued != 0
    }

    /// Category method lists to mark uniqued.
    #[inline]
    pub fn has_category_method_lists_to_set_uniqued(&self) -> bool {
        self.has_category_method_lists_to_set_uniqued != 0
    }

    /// Protocol method lists to mark uniqued.
    #[inline]
    pub fn has_protocol_method_lists_to_set_uniqued(&self) -> bool {
        self.has_protocol_method_lists_to_set_uniqued != 0
    }

    /// Class method lists with selector references to unique.
    #[inline]
    pub fn has_class_method_lists_to_unique(&self) -> bool {
        self.has_class_method_lists_to_unique != 0
    }

    /// Category method lists with selector references to unique.
    #[inline]
    pub fn has_category_method_lists_to_unique(&self) -> bool {
        self.has_category_method_lists_to_unique != 0
    }

    /// Protocol method lists with selector references to unique.
    #[inline]
    pub fn has_protocol_method_lists_to_unique(&self) -> bool {
        self.has_protocol_method_lists_to_unique != 0
    }
}

impl fmt::Display for ObjCBinaryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  __objc_imageinfo: {:#010x}", self.image_info_runtime_offset)?;
        writeln!(
            f,
            "  __objc_selrefs:   {:#010x} (count={})",
            self.sel_refs_runtime_offset, self.sel_refs_count
        )?;
        writeln!(
            f,
            "  __objc_classlist: {:#010x} (count={})",
            self.class_list_runtime_offset, self.class_list_count
        )?;
        writeln!(
            f,
            "  __objc_catlist:   {:#010x} (count={})",
            self.category_list_runtime_offset, self.category_count
        )?;
        writeln!(
            f,
            "  __objc_protolist: {:#010x} (count={})",
            self.protocol_list_runtime_offset, self.protocol_list_count
        )?;
        let mut flags = Vec::new();
        if self.has_class_stable_swift_fixups() {
            flags.push("class-stable-swift-fixups");
        }
        if self.has_class_method_lists_to_set_uniqued() {
            flags.push("class-method-lists-to-set-uniqued");
        }
        if self.has_category_method_lists_to_set_uniqued() {
            flags.push("category-method-lists-to-set-uniqued");
        }
        if self.has_protocol_method_lists_to_set_uniqued() {
            flags.push("protocol-method-lists-to-set-uniqued");
        }
        if self.has_class_method_lists_to_unique() {
            flags.push("class-method-lists-to-unique");
        }
        if self.has_category_method_lists_to_unique() {
            flags.push("category-method-lists-to-unique");
        }
        if self.has_protocol_method_lists_to_unique() {
            flags.push("protocol-method-lists-to-unique");
        }
        if !flags.is_empty() {
            writeln!(f, "  flags:")?;
            for flag in flags {
                writeln!(f, "    - {}", flag)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Prebuilt Loader
// =============================================================================

/// Fixed header of a `PrebuiltLoader` record.
///
/// All 16-bit offsets are relative to the start of the record. Offsets
/// past `bind_target_refs_count` are 32 bits because the bind target
/// array can push trailing data beyond 64KB. `exports_trie_loader_offset`
/// is the odd one out: it lies in the loader's VM image, not the record.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PrebuiltLoaderHeader {
    /// Common loader header
    pub loader: Loader,
    /// Offset to the NUL-terminated install path
    pub path_offset: u16,
    /// Offset to the dependent `LoaderRef` array
    pub dependent_loader_refs_array_offset: u16,
    /// Offset to the dependent kind array; zero if all deps are normal
    pub dependent_kind_array_offset: u16,
    /// Offset of the fixups load command in the image
    pub fixups_load_command_offset: u16,
    /// Offset to an alternate path when install_name differs from the real path
    pub alt_path_offset: u16,
    /// Zero, or offset to a `FileValidation` record
    pub file_validation_offset: u16,
    /// Packed word: has_initializers, is_overridable, supports_catalyst,
    /// is_catalyst_override (bits 0-3), regions count (bits 4-15)
    pub info: u16,
    /// Offset to the `Region` array
    pub regions_offset: u16,
    /// Number of dependents
    pub dep_count: u16,
    /// Offset to the bind target array
    pub bind_target_refs_offset: u16,
    /// Number of bind targets
    pub bind_target_refs_count: u32,
    /// Zero, or offset to an `ObjCBinaryInfo` block
    pub objc_binary_info_offset: u32,
    /// Index of the other side of an unzippered twin, 0xFFFF if none
    pub index_of_twin: u16,
    _pad: u16,
    /// VM offset of the exports trie within the loader's image
    pub exports_trie_loader_offset: u64,
    /// Size of the exports trie
    pub exports_trie_loader_size: u32,
    /// Total VM size of the image
    pub vm_size: u32,
    /// Code signature location in the image file
    pub code_signature: CodeSignatureInFile,
    /// Zero, or offset to the sentinel-terminated patch table
    pub patch_table_offset: u32,
    /// Offset to the override bind target array
    pub override_bind_target_refs_offset: u32,
    /// Number of override bind targets
    pub override_bind_target_refs_count: u32,
}

impl PrebuiltLoaderHeader {
    /// Image has initializers to run.
    #[inline]
    pub fn has_initializers(&self) -> bool {
        extract_bits(self.info as u64, 0, 1) != 0
    }

    /// If in the dyld cache, roots may override this image.
    #[inline]
    pub fn is_overridable(&self) -> bool {
        extract_bits(self.info as u64, 1, 1) != 0
    }

    /// Image may be used in a Catalyst process.
    #[inline]
    pub fn supports_catalyst(&self) -> bool {
        extract_bits(self.info as u64, 2, 1) != 0
    }

    /// Catalyst side of an unzippered twin.
    #[inline]
    pub fn is_catalyst_override(&self) -> bool {
        extract_bits(self.info as u64, 3, 1) != 0
    }

    /// Number of regions in the region array.
    #[inline]
    pub fn regions_count(&self) -> u16 {
        extract_bits(self.info as u64, 4, 12) as u16
    }

    fn info_string(&self) -> String {
        let mut flags = Vec::new();
        if self.has_initializers() {
            flags.push("initializers");
        }
        if self.is_overridable() {
            flags.push("overridable");
        }
        if self.supports_catalyst() {
            flags.push("catalyst");
        }
        if self.is_catalyst_override() {
            flags.push("catalyst_override");
        }
        flags.join("|")
    }
}

/// A fully materialized prebuilt loader record.
///
/// All variable-length data is owned; nothing borrows from the decode
/// window. Cross-loader references (bind targets, the twin) stay as
/// indices into the owning set and are resolved by lookup at query time.
#[derive(Debug, Clone)]
pub struct PrebuiltLoader {
    /// The fixed on-disk header
    pub header: PrebuiltLoaderHeader,
    /// Install path
    pub path: Option<String>,
    /// Alternate path when install_name differs from the real path
    pub alt_path: Option<String>,
    /// Name of the unzippered twin, if any
    pub twin: Option<String>,
    /// Dependents with resolved names and link kinds
    pub dependents: Vec<Dependent>,
    /// On-disk file validation info, if present
    pub file_validation: Option<FileValidation>,
    /// VM regions of the image
    pub regions: Vec<Region>,
    /// Bind targets
    pub bind_targets: Vec<BindTargetRef>,
    /// Override bind targets
    pub override_bind_targets: Vec<BindTargetRef>,
    /// ObjC section layout and fixup info, if present
    pub objc_fixup_info: Option<ObjCBinaryInfo>,
    /// One flag per protocol: definition is canonical
    pub objc_canonical_protocol_fixups: Vec<bool>,
    /// Selector reference fixups
    pub objc_selector_fixups: Vec<BindTargetRef>,
    /// Patch table including its terminating sentinel
    pub dylib_patches: Vec<DylibPatch>,
}

impl PrebuiltLoader {
    /// Translates an image VM offset to a file offset using the regions.
    ///
    /// Returns `None` when the offset falls outside every file-backed
    /// range (e.g. into zero fill).
    pub fn file_offset_for_vm_offset(&self, vm_offset: u64) -> Option<u64> {
        self.regions.iter().find_map(|region| {
            let start = region.vm_offset();
            if vm_offset >= start && vm_offset < start + region.file_size as u64 {
                Some(region.file_offset as u64 + (vm_offset - start))
            } else {
                None
            }
        })
    }
}

impl fmt::Display for PrebuiltLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            writeln!(f, "Path:    {}", path)?;
        }
        if let Some(alt_path) = &self.alt_path {
            writeln!(f, "AltPath: {}", alt_path)?;
        }
        if let Some(twin) = &self.twin {
            writeln!(f, "Twin:    {}", twin)?;
        }
        writeln!(f, "VM Size:       {:#x}", self.header.vm_size)?;
        if self.header.code_signature.size > 0 {
            writeln!(
                f,
                "CodeSignature: off={:#010x}, sz={:#x}",
                self.header.code_signature.file_offset, self.header.code_signature.size
            )?;
        }
        if let Some(fv) = &self.file_validation {
            if fv.validates_cd_hash() {
                writeln!(f, "CDHash:        {}", hex_string(&fv.cd_hash))?;
            }
            if fv.validates_inode_mtime() {
                writeln!(f, "slice-offset:  {:#x}", fv.slice_offset)?;
                writeln!(f, "inode:         {:#x}", fv.inode)?;
                writeln!(f, "mod-time:      {:#x}", fv.mtime)?;
            }
            if fv.has_uuid() {
                writeln!(f, "UUID:          {}", uuid_to_string(&fv.uuid))?;
            }
        }
        writeln!(f, "Loader:        {}", self.header.loader)?;
        let info = self.header.info_string();
        if !info.is_empty() {
            writeln!(f, "Info:          {}", info)?;
        }
        if self.header.exports_trie_loader_size > 0 {
            let file_off = self
                .file_offset_for_vm_offset(self.header.exports_trie_loader_offset)
                .unwrap_or(0);
            writeln!(
                f,
                "ExportsTrie:   off={:#010x}, sz={:#x}",
                file_off, self.header.exports_trie_loader_size
            )?;
        }
        if self.header.fixups_load_command_offset > 0 {
            writeln!(
                f,
                "FixupsLoadCmd: off={:#010x}",
                self.header.fixups_load_command_offset
            )?;
        }
        if !self.regions.is_empty() {
            writeln!(f, "\nRegions:")?;
            writeln!(
                f,
                "  {:>10} {:>10} {:>10}  perms  zerofill  ro-data",
                "file-off", "file-sz", "vm-off"
            )?;
            for region in &self.regions {
                writeln!(
                    f,
                    "  {:#010x} {:#010x} {:#010x}  {:<5}  {:<8}  {:<7}",
                    region.file_offset,
                    region.file_size,
                    region.vm_offset(),
                    region.perms_string(),
                    region.is_zero_fill(),
                    region.read_only_data()
                )?;
            }
        }
        if !self.dependents.is_empty() {
            writeln!(f, "\nDependents:")?;
            for dep in &self.dependents {
                writeln!(f, "  {:<10} {}", dep.kind.to_string(), dep.name)?;
            }
        }
        if !self.bind_targets.is_empty() {
            writeln!(f, "\nBindTargets:")?;
            for target in &self.bind_targets {
                writeln!(f, "  {}", target)?;
            }
        }
        if !self.override_bind_targets.is_empty() {
            writeln!(f, "\nOverride BindTargets:")?;
            for target in &self.override_bind_targets {
                writeln!(f, "  {}", target)?;
            }
        }
        if let Some(objc) = &self.objc_fixup_info {
            writeln!(f, "\nObjC Fixup Info:")?;
            write!(f, "{}", objc)?;
        }
        if !self.objc_canonical_protocol_fixups.is_empty() {
            writeln!(f, "ObjC Canonical ProtocolFixups:")?;
            for fixup in &self.objc_canonical_protocol_fixups {
                writeln!(f, "  {}", fixup)?;
            }
        }
        if !self.objc_selector_fixups.is_empty() {
            writeln!(f, "\nObjC SelectorFixups:")?;
            for target in &self.objc_selector_fixups {
                writeln!(f, "  {}", target)?;
            }
        }
        if !self.dylib_patches.is_empty() {
            writeln!(f, "\nPatches:")?;
            for patch in &self.dylib_patches {
                writeln!(f, "  {}", patch)?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Prebuilt Loader Set
// =============================================================================

/// Fixed header of a `PrebuiltLoaderSet`.
///
/// All offsets are relative to the start of the set. The ObjC hash table
/// and Swift conformance table offsets are surfaced but their contents
/// are not decoded here.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PrebuiltLoaderSetHeader {
    /// Set magic, "sp4d"
    pub magic: u32,
    /// Hash of the serialization format version
    pub version_hash: u32,
    /// Total length of the set in bytes
    pub length: u32,
    /// Number of entries in the loader offset table
    pub loaders_array_count: u32,
    /// Offset to the loader offset table (u32 per loader)
    pub loaders_array_offset: u32,
    /// Number of cache patches
    pub cache_patch_count: u32,
    /// Offset to the cache patch array
    pub cache_patch_offset: u32,
    /// Zero, or offset to the 16-byte dyld cache UUID
    pub dyld_cache_uuid_offset: u32,
    /// Number of must-be-missing paths
    pub must_be_missing_paths_count: u32,
    /// Offset to the concatenated NUL-terminated must-be-missing paths
    pub must_be_missing_paths_offset: u32,
    /// ObjC selector hash table offset (not decoded)
    pub objc_selector_hash_table_offset: u32,
    /// ObjC class hash table offset (not decoded)
    pub objc_class_hash_table_offset: u32,
    /// ObjC protocol hash table offset (not decoded)
    pub objc_protocol_hash_table_offset: u32,
    /// Reserved
    pub reserved: u32,
    /// ObjC protocol class cache offset (not decoded)
    pub objc_protocol_class_cache_offset: u64,
    /// Swift type conformance table offset (not decoded)
    pub swift_type_conformance_table_offset: u32,
    /// Swift metadata conformance table offset (not decoded)
    pub swift_metadata_conformance_table_offset: u32,
    /// Swift foreign type conformance table offset (not decoded)
    pub swift_foreign_type_conformance_table_offset: u32,
}

impl PrebuiltLoaderSetHeader {
    /// Returns true if any Swift conformance table is present.
    pub fn has_optimized_swift(&self) -> bool {
        self.swift_foreign_type_conformance_table_offset != 0
            || self.swift_metadata_conformance_table_offset != 0
            || self.swift_type_conformance_table_offset != 0
    }

    /// Returns true if any ObjC hash table is present.
    pub fn has_optimized_objc(&self) -> bool {
        self.objc_selector_hash_table_offset != 0
            || self.objc_class_hash_table_offset != 0
            || self.objc_protocol_hash_table_offset != 0
    }
}

/// A fully materialized prebuilt loader set.
#[derive(Debug, Clone)]
pub struct PrebuiltLoaderSet {
    /// The fixed on-disk header
    pub header: PrebuiltLoaderSetHeader,
    /// Loaders, in loader-offset-table order
    pub loaders: Vec<PrebuiltLoader>,
    /// Cache patches
    pub patches: Vec<CachePatch>,
    /// UUID of the dyld cache the set was built against, if recorded
    pub dyld_cache_uuid: Option<[u8; 16]>,
    /// Paths whose absence is a precondition for using this set
    pub must_be_missing_paths: Vec<String>,
}

impl fmt::Display for PrebuiltLoaderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PrebuiltLoaderSet:")?;
        writeln!(f, "  Version: {:x}", self.header.version_hash)?;
        if let Some(uuid) = &self.dyld_cache_uuid {
            writeln!(f, "  DyldCacheUUID: {}", uuid_to_string(uuid))?;
        }
        if !self.loaders.is_empty() {
            writeln!(f, "\nLoaders:")?;
            for loader in &self.loaders {
                if self.loaders.len() > 1 {
                    writeln!(f, "---")?;
                }
                writeln!(f, "{}", loader)?;
            }
        }
        if !self.must_be_missing_paths.is_empty() {
            writeln!(f, "MustBeMissing:")?;
            for path in &self.must_be_missing_paths {
                writeln!(f, "    {}", path)?;
            }
        }
        if !self.patches.is_empty() {
            writeln!(f, "Cache Overrides:")?;
            for patch in &self.patches {
                if self.patches.len() > 1 {
                    writeln!(f, "---")?;
                }
                writeln!(f, "  cache-dylib-index: {}", patch.dylib_index)?;
                writeln!(f, "  dylib-offset:      {:#010x}", patch.dylib_vm_offset)?;
                writeln!(f, "  replace-loader:    {}", patch.patch_to.loader_ref())?;
                writeln!(f, "  replace-offset:    {:#010x}", patch.patch_to.offset())?;
            }
        }
        Ok(())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// =============================================================================
// Window Reads
// =============================================================================

/// Reads a fixed-size record at `offset` within the window.
fn read_record<T: FromBytes + KnownLayout + Immutable>(window: &[u8], offset: usize) -> Result<T> {
    if offset > window.len() {
        return Err(Error::InvalidOffset {
            offset,
            window: window.len(),
        });
    }
    T::read_from_prefix(&window[offset..])
        .map(|(value, _)| value)
        .map_err(|_| Error::buffer_too_small(offset + size_of::<T>(), window.len()))
}

/// Reads `count` fixed-size elements at `offset` within the window.
fn read_elements<T>(
    window: &[u8],
    offset: usize,
    count: usize,
    element_size: usize,
    read: impl Fn(&[u8], usize) -> T,
) -> Result<Vec<T>> {
    let total = count.checked_mul(element_size).ok_or(Error::InvalidCount {
        count,
        element_size,
    })?;
    if offset > window.len() {
        return Err(Error::InvalidOffset {
            offset,
            window: window.len(),
        });
    }
    if total > window.len() - offset {
        return Err(Error::InvalidCount {
            count,
            element_size,
        });
    }
    Ok((0..count)
        .map(|i| read(window, offset + i * element_size))
        .collect())
}

/// Reads a NUL-terminated string at `offset`, returning it with the NUL
/// stripped plus the offset just past the terminator.
fn read_cstring(window: &[u8], offset: usize) -> Result<(String, usize)> {
    if offset >= window.len() {
        return Err(Error::InvalidOffset {
            offset,
            window: window.len(),
        });
    }
    let bytes = &window[offset..];
    let end = memchr_null(bytes);
    if end == bytes.len() {
        return Err(Error::parse(offset, "unterminated string"));
    }
    let string = String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))?;
    Ok((string, offset + end + 1))
}

// =============================================================================
// Record Decoder
// =============================================================================

/// Decodes one `PrebuiltLoader` record.
///
/// `window` must be positioned so byte 0 is the start of the record;
/// `images` is the owning cache's image table, used to resolve dependent
/// and twin names for display.
pub fn parse_prebuilt_loader(window: &[u8], images: &[ImageEntry]) -> Result<PrebuiltLoader> {
    let header: PrebuiltLoaderHeader = read_record(window, 0)?;
    if header.loader.magic != LOADER_MAGIC {
        return Err(Error::InvalidLoaderMagic(header.loader.magic));
    }

    let mut pbl = PrebuiltLoader {
        header,
        path: None,
        alt_path: None,
        twin: None,
        dependents: Vec::new(),
        file_validation: None,
        regions: Vec::new(),
        bind_targets: Vec::new(),
        override_bind_targets: Vec::new(),
        objc_fixup_info: None,
        objc_canonical_protocol_fixups: Vec::new(),
        objc_selector_fixups: Vec::new(),
        dylib_patches: Vec::new(),
    };

    if header.path_offset != 0 {
        pbl.path = Some(read_cstring(window, header.path_offset as usize)?.0);
    }
    if header.alt_path_offset != 0 {
        pbl.alt_path = Some(read_cstring(window, header.alt_path_offset as usize)?.0);
    }
    if header.file_validation_offset != 0 {
        pbl.file_validation = Some(read_record(window, header.file_validation_offset as usize)?);
    }

    let regions_count = header.regions_count() as usize;
    if regions_count > 0 {
        pbl.regions = read_elements(
            window,
            header.regions_offset as usize,
            regions_count,
            size_of::<Region>(),
            |data, off| Region {
                info: read_u64_le_at(data, off),
                file_offset: read_u32_le_at(data, off + 8),
                file_size: read_u32_le_at(data, off + 12),
            },
        )?;
    }

    if header.dependent_loader_refs_array_offset != 0 {
        let dep_count = header.dep_count as usize;
        let refs = read_elements(
            window,
            header.dependent_loader_refs_array_offset as usize,
            dep_count,
            size_of::<LoaderRef>(),
            |data, off| LoaderRef(read_u16_le_at(data, off)),
        )?;
        let kinds: Vec<DependentKind> = if header.dependent_kind_array_offset != 0 {
            read_elements(
                window,
                header.dependent_kind_array_offset as usize,
                dep_count,
                1,
                |data, off| DependentKind::from_raw(data[off]),
            )?
        } else {
            vec![DependentKind::Normal; dep_count]
        };
        pbl.dependents = refs
            .into_iter()
            .zip(kinds)
            .map(|(dep_ref, kind)| Dependent {
                name: match images.get(dep_ref.index() as usize) {
                    Some(image) => image.path.clone(),
                    None => dep_ref.to_string(),
                },
                kind,
            })
            .collect();
    }

    if header.bind_target_refs_count > 0 {
        pbl.bind_targets = read_elements(
            window,
            header.bind_target_refs_offset as usize,
            header.bind_target_refs_count as usize,
            size_of::<BindTargetRef>(),
            |data, off| BindTargetRef(read_u64_le_at(data, off)),
        )?;
    }
    if header.override_bind_target_refs_count > 0 {
        pbl.override_bind_targets = read_elements(
            window,
            header.override_bind_target_refs_offset as usize,
            header.override_bind_target_refs_count as usize,
            size_of::<BindTargetRef>(),
            |data, off| BindTargetRef(read_u64_le_at(data, off)),
        )?;
    }

    if header.objc_binary_info_offset != 0 {
        let base = header.objc_binary_info_offset as usize;
        let objc: ObjCBinaryInfo = read_record(window, base)?;
        pbl.objc_canonical_protocol_fixups = read_elements(
            window,
            base + objc.protocol_fixups_offset as usize,
            objc.protocol_list_count as usize,
            1,
            |data, off| data[off] != 0,
        )?;
        pbl.objc_selector_fixups = read_elements(
            window,
            base + objc.selector_references_fixups_offset as usize,
            objc.selector_references_fixups_count as usize,
            size_of::<BindTargetRef>(),
            |data, off| BindTargetRef(read_u64_le_at(data, off)),
        )?;
        pbl.objc_fixup_info = Some(objc);
    }

    if header.index_of_twin != NO_UNZIPPERED_TWIN {
        pbl.twin = images
            .get(header.index_of_twin as usize)
            .map(|image| image.path.clone());
    }

    if header.patch_table_offset != 0 {
        let mut offset = header.patch_table_offset as usize;
        loop {
            if offset > window.len() || window.len() - offset < size_of::<DylibPatch>() {
                return Err(Error::buffer_too_small(
                    offset + size_of::<DylibPatch>(),
                    window.len(),
                ));
            }
            let patch = DylibPatch {
                override_offset_of_impl: read_u64_le_at(window, offset) as i64,
                kind: read_u64_le_at(window, offset + 8) as i64,
            };
            offset += size_of::<DylibPatch>();
            let done = patch.is_end_of_table();
            pbl.dylib_patches.push(patch);
            if done {
                break;
            }
        }
    }

    Ok(pbl)
}

// =============================================================================
// Set Decoder
// =============================================================================

/// Decodes a `PrebuiltLoaderSet`.
///
/// `window` must be positioned so byte 0 is the start of the set header.
pub fn parse_prebuilt_loader_set(
    window: &[u8],
    images: &[ImageEntry],
) -> Result<PrebuiltLoaderSet> {
    let header: PrebuiltLoaderSetHeader = read_record(window, 0)?;
    if header.magic != PREBUILT_LOADER_SET_MAGIC {
        return Err(Error::InvalidLoaderSetMagic(header.magic));
    }

    let loader_offsets = read_loader_offsets(window, &header)?;

    let mut set = PrebuiltLoaderSet {
        header,
        loaders: Vec::with_capacity(loader_offsets.len()),
        patches: Vec::new(),
        dyld_cache_uuid: None,
        must_be_missing_paths: Vec::new(),
    };

    for loader_offset in loader_offsets {
        let loader_offset = loader_offset as usize;
        if loader_offset >= window.len() {
            return Err(Error::InvalidOffset {
                offset: loader_offset,
                window: window.len(),
            });
        }
        set.loaders
            .push(parse_prebuilt_loader(&window[loader_offset..], images)?);
    }

    if header.cache_patch_count > 0 {
        set.patches = read_elements(
            window,
            header.cache_patch_offset as usize,
            header.cache_patch_count as usize,
            size_of::<CachePatch>(),
            |data, off| CachePatch {
                dylib_index: read_u32_le_at(data, off),
                dylib_vm_offset: read_u32_le_at(data, off + 4),
                patch_to: BindTargetRef(read_u64_le_at(data, off + 8)),
            },
        )?;
    }

    if header.dyld_cache_uuid_offset != 0 {
        set.dyld_cache_uuid = Some(read_record(window, header.dyld_cache_uuid_offset as usize)?);
    }

    if header.must_be_missing_paths_count > 0 {
        let mut offset = header.must_be_missing_paths_offset as usize;
        for _ in 0..header.must_be_missing_paths_count {
            let (path, next) = read_cstring(window, offset)?;
            set.must_be_missing_paths.push(path);
            offset = next;
        }
    }

    Ok(set)
}

/// Reads the set's loader offset table.
fn read_loader_offsets(window: &[u8], header: &PrebuiltLoaderSetHeader) -> Result<Vec<u32>> {
    read_elements(
        window,
        header.loaders_array_offset as usize,
        header.loaders_array_count as usize,
        size_of::<u32>(),
        |data, off| read_u32_le_at(data, off),
    )
}

// =============================================================================
// Trie-Index Facade
// =============================================================================

impl DyldContext {
    /// Returns true if this cache carries launch prebuilt loader sets.
    ///
    /// Requires the header to be new enough to declare the program trie
    /// fields, and the trie to actually be present.
    pub fn supports_prebuilt_loaders(&self) -> bool {
        self.header.mapping_offset as usize >= offset_of!(DyldCacheHeader, program_trie_size)
            && self.header.program_trie_addr != 0
    }

    fn launch_sets_gate(&self) -> Result<()> {
        if !self.supports_prebuilt_loaders() {
            return Err(Error::PrebuiltLoaderSetNotSupported);
        }
        Ok(())
    }

    fn dylib_set_gate(&self) -> Result<()> {
        let mapping_offset = self.header.mapping_offset as usize;
        if mapping_offset < offset_of!(DyldCacheHeader, program_trie_size)
            || mapping_offset < offset_of!(DyldCacheHeader, dylibs_pbl_set_addr)
            || self.header.dylibs_pbl_set_addr == 0
        {
            return Err(Error::PrebuiltLoaderSetNotSupported);
        }
        Ok(())
    }

    /// Returns the raw program trie bytes.
    fn program_trie_data(&self) -> Result<&[u8]> {
        self.data_at_addr(
            self.header.program_trie_addr,
            self.header.program_trie_size as usize,
        )
    }

    /// Decodes the launch set whose pool offset is serialized at
    /// `payload_offset` within the trie buffer.
    fn launch_loader_set_at(
        &self,
        trie_data: &[u8],
        payload_offset: usize,
    ) -> Result<PrebuiltLoaderSet> {
        if payload_offset >= trie_data.len() {
            return Err(Error::InvalidUleb128 {
                offset: payload_offset,
            });
        }
        let (pool_offset, _) = read_uleb128_fast(&trie_data[payload_offset..]).ok_or(
            Error::InvalidUleb128 {
                offset: payload_offset,
            },
        )?;
        let window = self.window_at_addr(self.header.programs_pbl_set_pool_addr + pool_offset)?;
        parse_prebuilt_loader_set(window, &self.images)
    }

    /// Invokes `handler` with every (exec path, launch loader set) pair.
    ///
    /// Sets are delivered in program trie order. Enumeration stops at the
    /// first decode error.
    pub fn for_each_launch_loader_set(
        &self,
        mut handler: impl FnMut(&str, &PrebuiltLoaderSet),
    ) -> Result<()> {
        self.launch_sets_gate()?;
        let trie_data = self.program_trie_data()?;
        let entries = ProgramTrie::new(trie_data).parse_all()?;
        debug!("program trie contains {} launch entries", entries.len());
        for entry in entries {
            let set = self.launch_loader_set_at(trie_data, entry.offset)?;
            handler(&entry.name, &set);
        }
        Ok(())
    }

    /// Invokes `handler` with every executable path in the program trie.
    ///
    /// Identical ordering to [`Self::for_each_launch_loader_set`] without
    /// decoding any set.
    pub fn for_each_launch_loader_set_path(
        &self,
        mut handler: impl FnMut(&str),
    ) -> Result<()> {
        self.launch_sets_gate()?;
        let trie_data = self.program_trie_data()?;
        for entry in ProgramTrie::new(trie_data).parse_all()? {
            handler(&entry.name);
        }
        Ok(())
    }

    /// Returns the launch loader set for the given executable path.
    pub fn get_launch_loader_set(&self, executable_path: &str) -> Result<PrebuiltLoaderSet> {
        self.launch_sets_gate()?;
        let trie_data = self.program_trie_data()?;
        let payload_offset = ProgramTrie::new(trie_data)
            .lookup(executable_path)?
            .ok_or_else(|| Error::ExecutablePathNotFound {
                path: executable_path.to_string(),
            })?;
        self.launch_loader_set_at(trie_data, payload_offset)
    }

    /// Returns the prebuilt loader of a cached dylib by install path.
    ///
    /// The dylibs set is indexed by the cache image table, so only exact
    /// install paths resolve.
    pub fn get_dylib_prebuilt_loader(&self, image_path: &str) -> Result<PrebuiltLoader> {
        self.dylib_set_gate()?;

        let window = self.window_at_addr(self.header.dylibs_pbl_set_addr)?;
        let header: PrebuiltLoaderSetHeader = read_record(window, 0)?;
        if header.magic != PREBUILT_LOADER_SET_MAGIC {
            return Err(Error::InvalidLoaderSetMagic(header.magic));
        }
        let loader_offsets = read_loader_offsets(window, &header)?;

        let image_index = self
            .image_index(image_path)
            .ok_or_else(|| Error::ImageNotFound {
                name: image_path.to_string(),
            })?;
        let loader_offset = loader_offsets
            .get(image_index)
            .copied()
            .ok_or(Error::ImageIndexOutOfBounds {
                index: image_index,
                total: loader_offsets.len(),
            })? as usize;
        if loader_offset >= window.len() {
            return Err(Error::InvalidOffset {
                offset: loader_offset,
                window: window.len(),
            });
        }

        parse_prebuilt_loader(&window[loader_offset..], &self.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::structs::{DyldCacheImageInfo, DyldCacheMappingInfo};

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
    fn put_bytes(buf: &mut [u8], off: usize, v: &[u8]) {
        buf[off..off + v.len()].copy_from_slice(v);
    }

    fn img(index: usize, path: &str) -> ImageEntry {
        ImageEntry {
            index,
            address: 0,
            path: path.into(),
            mod_time: 0,
            inode: 0,
        }
    }

    /// Writes the fields every valid loader fixture needs.
    fn put_loader_base(buf: &mut [u8]) {
        put_u32(buf, 0, LOADER_MAGIC);
        put_u16(
            buf,
            offset_of!(PrebuiltLoaderHeader, index_of_twin),
            NO_UNZIPPERED_TWIN,
        );
    }

    #[test]
    fn test_on_disk_layout() {
        assert_eq!(size_of::<Loader>(), 8);
        assert_eq!(size_of::<Region>(), 16);
        assert_eq!(size_of::<CachePatch>(), 16);
        assert_eq!(size_of::<DylibPatch>(), 16);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, path_offset), 8);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, info), 20);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, dep_count), 24);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, bind_target_refs_count), 28);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, objc_binary_info_offset), 32);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, index_of_twin), 36);
        assert_eq!(
            offset_of!(PrebuiltLoaderHeader, exports_trie_loader_offset),
            40
        );
        assert_eq!(offset_of!(PrebuiltLoaderHeader, code_signature), 56);
        assert_eq!(offset_of!(PrebuiltLoaderHeader, patch_table_offset), 64);
        assert_eq!(
            offset_of!(PrebuiltLoaderHeader, override_bind_target_refs_count),
            72
        );
        assert_eq!(offset_of!(PrebuiltLoaderSetHeader, loaders_array_offset), 16);
        assert_eq!(
            offset_of!(PrebuiltLoaderSetHeader, must_be_missing_paths_offset),
            36
        );
        assert_eq!(
            offset_of!(PrebuiltLoaderSetHeader, objc_protocol_class_cache_offset),
            56
        );
        assert_eq!(
            offset_of!(
                PrebuiltLoaderSetHeader,
                swift_foreign_type_conformance_table_offset
            ),
            72
        );
        assert_eq!(offset_of!(FileValidation, cd_hash), 24);
        assert_eq!(offset_of!(FileValidation, uuid), 44);
        assert_eq!(offset_of!(ObjCBinaryInfo, protocol_fixups_offset), 64);
    }

    #[test]
    fn test_loader_ref_missing_weak_classification() {
        let missing = LoaderRef(0x7FFF);
        assert_eq!(missing.index(), 0x7FFF);
        assert!(!missing.is_app());
        assert!(missing.is_missing_weak_image());

        let app = LoaderRef(0xFFFF);
        assert_eq!(app.index(), 0x7FFF);
        assert!(app.is_app());
        assert!(!app.is_missing_weak_image());

        let normal = LoaderRef(42);
        assert!(!normal.is_missing_weak_image());
        assert_eq!(normal.to_string(), "index: 42");
    }

    #[test]
    fn test_loader_flags() {
        let loader = Loader {
            magic: LOADER_MAGIC,
            info: 0x01A5,
            loader_ref: LoaderRef(0x8002),
        };
        assert!(loader.is_prebuilt());
        assert!(!loader.dylib_in_dyld_cache());
        assert!(loader.has_objc());
        assert!(!loader.may_have_plus_load());
        assert!(!loader.has_read_only_data());
        assert!(loader.never_unload());
        assert!(!loader.leave_mapped());
        assert!(loader.has_read_only_objc());
        assert!(loader.pre_2022_binary());
        assert_eq!(loader.loader_ref.index(), 2);
        assert!(loader.loader_ref.is_app());
    }

    #[test]
    fn test_dependent_kind_from_raw() {
        assert_eq!(DependentKind::from_raw(0), DependentKind::Normal);
        assert_eq!(DependentKind::from_raw(1), DependentKind::WeakLink);
        assert_eq!(DependentKind::from_raw(2), DependentKind::Reexport);
        assert_eq!(DependentKind::from_raw(3), DependentKind::Upward);
        assert_eq!(DependentKind::from_raw(9), DependentKind::Unknown(9));
    }

    #[test]
    fn test_resolved_symbol_kind_display() {
        assert_eq!(ResolvedSymbolKind::Rebase.to_string(), "rebase");
        assert_eq!(ResolvedSymbolKind::BindToImage.to_string(), "bind to image");
        assert_eq!(ResolvedSymbolKind::BindAbsolute.to_string(), "bind absolute");
    }

    #[test]
    fn test_absolute_bind_target() {
        let target = BindTargetRef(0x8000_0000_0000_002A);
        assert_eq!(target.kind(), 1);
        assert!(target.is_absolute());
        assert_eq!(target.offset(), 0x2A);
    }

    #[test]
    fn test_absolute_bind_target_sign_extension() {
        // Bit 62 of the 63-bit payload propagates into bit 63
        let target = BindTargetRef(0xC000_0000_0000_0010);
        assert!(target.is_absolute());
        assert_eq!(target.offset(), 0xC000_0000_0000_0010);
    }

    #[test]
    fn test_relative_bind_target_sign_extension() {
        // low39 with bit 38 set reconstructs with bits 39-55 filled
        let target = BindTargetRef(0x40_0000_0000u64 << 24);
        assert!(!target.is_absolute());
        assert_eq!(target.offset(), 0x00FF_FFC0_0000_0000);
    }

    #[test]
    fn test_relative_bind_target_composition() {
        let raw = 7u64 | (0xABu64 << 16) | (0x1000u64 << 24);
        let target = BindTargetRef(raw);
        assert_eq!(target.loader_ref().index(), 7);
        assert!(!target.loader_ref().is_app());
        assert_eq!(target.offset(), (0xABu64 << 56) | 0x1000);
    }

    #[test]
    fn test_region_accessors() {
        let region = Region {
            info: 0x4000 | (5u64 << 59) | (1u64 << 62),
            file_offset: 0x1000,
            file_size: 0x4000,
        };
        assert_eq!(region.vm_offset(), 0x4000);
        assert_eq!(region.perms(), 5);
        assert!(region.is_readable());
        assert!(!region.is_writable());
        assert!(region.is_executable());
        assert_eq!(region.perms_string(), "r-x");
        assert!(region.is_zero_fill());
        assert!(!region.read_only_data());
    }

    #[test]
    fn test_minimal_loader() {
        let mut buf = vec![0u8; 0x60];
        put_loader_base(&mut buf);
        put_u16(&mut buf, offset_of!(PrebuiltLoaderHeader, path_offset), 0x50);
        put_bytes(&mut buf, 0x50, b"/a\0");

        let pbl = parse_prebuilt_loader(&buf, &[]).unwrap();
        assert_eq!(pbl.path.as_deref(), Some("/a"));
        assert!(pbl.alt_path.is_none());
        assert!(pbl.twin.is_none());
        assert!(pbl.file_validation.is_none());
        assert!(pbl.regions.is_empty());
        assert!(pbl.dependents.is_empty());
        assert!(pbl.bind_targets.is_empty());
        assert!(pbl.dylib_patches.is_empty());
    }

    fn loader_with_deps(kind_bytes: Option<&[u8]>) -> Vec<u8> {
        let mut buf = vec![0u8; 0x70];
        put_loader_base(&mut buf);
        put_u16(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, dependent_loader_refs_array_offset),
            0x50,
        );
        put_u16(&mut buf, offset_of!(PrebuiltLoaderHeader, dep_count), 2);
        put_u16(&mut buf, 0x50, 3);
        put_u16(&mut buf, 0x52, 5);
        if let Some(kinds) = kind_bytes {
            put_u16(
                &mut buf,
                offset_of!(PrebuiltLoaderHeader, dependent_kind_array_offset),
                0x54,
            );
            put_bytes(&mut buf, 0x54, kinds);
        }
        buf
    }

    #[test]
    fn test_loader_with_normal_deps() {
        let images: Vec<ImageEntry> = (0..6)
            .map(|i| img(i, &format!("/usr/lib/lib{}.dylib", i)))
            .collect();
        let pbl = parse_prebuilt_loader(&loader_with_deps(None), &images).unwrap();
        assert_eq!(pbl.dependents.len(), 2);
        assert_eq!(pbl.dependents[0].name, "/usr/lib/lib3.dylib");
        assert_eq!(pbl.dependents[1].name, "/usr/lib/lib5.dylib");
        assert!(pbl
            .dependents
            .iter()
            .all(|d| d.kind == DependentKind::Normal));
    }

    #[test]
    fn test_loader_with_mixed_dep_kinds() {
        let images: Vec<ImageEntry> = (0..6)
            .map(|i| img(i, &format!("/usr/lib/lib{}.dylib", i)))
            .collect();
        let pbl = parse_prebuilt_loader(&loader_with_deps(Some(&[0, 2])), &images).unwrap();
        assert_eq!(pbl.dependents[0].kind, DependentKind::Normal);
        assert_eq!(pbl.dependents[1].kind, DependentKind::Reexport);
    }

    #[test]
    fn test_dep_name_falls_back_to_ref_rendering() {
        let pbl = parse_prebuilt_loader(&loader_with_deps(None), &[]).unwrap();
        assert_eq!(pbl.dependents[0].name, "index: 3");
        assert_eq!(pbl.dependents[1].name, "index: 5");
    }

    #[test]
    fn test_loader_with_regions() {
        let mut buf = vec![0u8; 0x80];
        put_loader_base(&mut buf);
        put_u16(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, info),
            (2 << 4) | 1,
        );
        put_u16(&mut buf, offset_of!(PrebuiltLoaderHeader, regions_offset), 0x50);
        put_u64(&mut buf, 0x50, 5u64 << 59);
        put_u32(&mut buf, 0x58, 0);
        put_u32(&mut buf, 0x5C, 0x4000);
        put_u64(&mut buf, 0x60, 0x8000 | (3u64 << 59) | (1u64 << 62));
        put_u32(&mut buf, 0x68, 0x4000);
        put_u32(&mut buf, 0x6C, 0);

        let pbl = parse_prebuilt_loader(&buf, &[]).unwrap();
        assert!(pbl.header.has_initializers());
        assert!(!pbl.header.is_overridable());
        assert_eq!(pbl.header.regions_count(), 2);
        assert_eq!(pbl.regions.len(), 2);
        assert_eq!(pbl.regions[0].perms(), 5);
        assert_eq!(pbl.regions[0].file_size, 0x4000);
        assert_eq!(pbl.regions[1].vm_offset(), 0x8000);
        assert!(pbl.regions[1].is_zero_fill());
        assert_eq!(pbl.file_offset_for_vm_offset(0x10), Some(0x10));
        assert_eq!(pbl.file_offset_for_vm_offset(0x9000), None);
    }

    #[test]
    fn test_twin_resolution() {
        let mut buf = vec![0u8; 0x50];
        put_u32(&mut buf, 0, LOADER_MAGIC);
        put_u16(&mut buf, offset_of!(PrebuiltLoaderHeader, index_of_twin), 1);
        let images = [img(0, "/a.dylib"), img(1, "/b.dylib")];
        let pbl = parse_prebuilt_loader(&buf, &images).unwrap();
        assert_eq!(pbl.twin.as_deref(), Some("/b.dylib"));
    }

    #[test]
    fn test_file_validation() {
        let mut buf = vec![0u8; 0xA0];
        put_loader_base(&mut buf);
        put_u16(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, file_validation_offset),
            0x50,
        );
        let base = 0x50;
        put_u64(&mut buf, base + offset_of!(FileValidation, slice_offset), 0x8000);
        put_u64(&mut buf, base + offset_of!(FileValidation, inode), 42);
        put_u64(&mut buf, base + offset_of!(FileValidation, mtime), 1234);
        buf[base + offset_of!(FileValidation, check_inode_mtime)] = 1;

        let pbl = parse_prebuilt_loader(&buf, &[]).unwrap();
        let fv = pbl.file_validation.unwrap();
        assert_eq!(fv.slice_offset, 0x8000);
        assert_eq!(fv.inode, 42);
        assert_eq!(fv.mtime, 1234);
        assert!(fv.validates_inode_mtime());
        assert!(!fv.validates_cd_hash());
        assert!(!fv.has_uuid());
    }

    #[test]
    fn test_objc_binary_info() {
        let mut buf = vec![0u8; 0x100];
        put_loader_base(&mut buf);
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, objc_binary_info_offset),
            0x50,
        );
        let base = 0x50;
        put_u32(
            &mut buf,
            base + offset_of!(ObjCBinaryInfo, protocol_list_count),
            2,
        );
        put_u32(
            &mut buf,
            base + offset_of!(ObjCBinaryInfo, protocol_fixups_offset),
            0x50,
        );
        put_u32(
            &mut buf,
            base + offset_of!(ObjCBinaryInfo, selector_references_fixups_offset),
            0x58,
        );
        put_u32(
            &mut buf,
            base + offset_of!(ObjCBinaryInfo, selector_references_fixups_count),
            1,
        );
        buf[base + 0x50] = 1;
        buf[base + 0x51] = 0;
        put_u64(&mut buf, base + 0x58, 0x8000_0000_0000_002A);

        let pbl = parse_prebuilt_loader(&buf, &[]).unwrap();
        let objc = pbl.objc_fixup_info.unwrap();
        assert_eq!(objc.protocol_list_count, 2);
        assert_eq!(pbl.objc_canonical_protocol_fixups, vec![true, false]);
        assert_eq!(pbl.objc_selector_fixups.len(), 1);
        assert!(pbl.objc_selector_fixups[0].is_absolute());
        assert_eq!(pbl.objc_selector_fixups[0].offset(), 0x2A);
    }

    #[test]
    fn test_patch_list_termination() {
        let mut buf = vec![0u8; 0x90];
        put_loader_base(&mut buf);
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, patch_table_offset),
            0x50,
        );
        put_u64(&mut buf, 0x50, 0x100);
        put_u64(&mut buf, 0x58, PATCH_KIND_OBJC_CLASS as u64);
        put_u64(&mut buf, 0x60, 0x200);
        put_u64(&mut buf, 0x68, PATCH_KIND_SINGLETON as u64);
        put_u64(&mut buf, 0x70, 0);
        put_u64(&mut buf, 0x78, PATCH_KIND_END_OF_TABLE as u64);
        // Trailing bytes past the sentinel must not be consumed
        put_u64(&mut buf, 0x80, 0xDEAD_BEEF);

        let pbl = parse_prebuilt_loader(&buf, &[]).unwrap();
        assert_eq!(pbl.dylib_patches.len(), 3);
        assert_eq!(pbl.dylib_patches[0].override_offset_of_impl, 0x100);
        assert_eq!(pbl.dylib_patches[0].kind_name(), "objc-class");
        assert!(!pbl.dylib_patches[0].is_end_of_table());
        assert!(!pbl.dylib_patches[1].is_end_of_table());
        assert!(pbl.dylib_patches[2].is_end_of_table());
    }

    #[test]
    fn test_patch_list_missing_terminator_errors() {
        let mut buf = vec![0u8; 0x60];
        put_loader_base(&mut buf);
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, patch_table_offset),
            0x50,
        );
        put_u64(&mut buf, 0x50, 0x100);
        put_u64(&mut buf, 0x58, PATCH_KIND_MISSING_WEAK_IMPORT as u64);
        assert!(matches!(
            parse_prebuilt_loader(&buf, &[]),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_loader_magic() {
        let buf = vec![0u8; 0x50];
        assert!(matches!(
            parse_prebuilt_loader(&buf, &[]),
            Err(Error::InvalidLoaderMagic(0))
        ));
    }

    #[test]
    fn test_truncated_record() {
        let buf = vec![0u8; 16];
        assert!(matches!(
            parse_prebuilt_loader(&buf, &[]),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_out_of_window_path_offset() {
        let mut buf = vec![0u8; 0x50];
        put_loader_base(&mut buf);
        put_u16(&mut buf, offset_of!(PrebuiltLoaderHeader, path_offset), 0x4000);
        assert!(matches!(
            parse_prebuilt_loader(&buf, &[]),
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn test_oversized_bind_target_count() {
        let mut buf = vec![0u8; 0x50];
        put_loader_base(&mut buf);
        put_u16(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, bind_target_refs_offset),
            0x40,
        );
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderHeader, bind_target_refs_count),
            0x1000_0000,
        );
        assert!(matches!(
            parse_prebuilt_loader(&buf, &[]),
            Err(Error::InvalidCount { .. })
        ));
    }

    #[test]
    fn test_set_must_be_missing_paths() {
        let mut buf = vec![0u8; 0x70];
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, magic),
            PREBUILT_LOADER_SET_MAGIC,
        );
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, must_be_missing_paths_count),
            1,
        );
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, must_be_missing_paths_offset),
            0x50,
        );
        put_bytes(&mut buf, 0x50, b"/x\0");

        let set = parse_prebuilt_loader_set(&buf, &[]).unwrap();
        assert!(set.loaders.is_empty());
        assert_eq!(set.must_be_missing_paths, vec!["/x"]);
        assert!(set.dyld_cache_uuid.is_none());
        assert!(set.patches.is_empty());
        assert!(!set.header.has_optimized_swift());
        assert!(!set.header.has_optimized_objc());
    }

    #[test]
    fn test_set_with_cache_patches_and_uuid() {
        let mut buf = vec![0u8; 0x80];
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, magic),
            PREBUILT_LOADER_SET_MAGIC,
        );
        put_u32(&mut buf, offset_of!(PrebuiltLoaderSetHeader, cache_patch_count), 1);
        put_u32(&mut buf, offset_of!(PrebuiltLoaderSetHeader, cache_patch_offset), 0x50);
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, dyld_cache_uuid_offset),
            0x60,
        );
        put_u32(&mut buf, 0x50, 2);
        put_u32(&mut buf, 0x54, 0x10);
        put_u64(&mut buf, 0x58, 0x8000_0000_0000_002A);
        put_bytes(&mut buf, 0x60, &[0x11; 16]);

        let set = parse_prebuilt_loader_set(&buf, &[]).unwrap();
        assert_eq!(set.patches.len(), 1);
        assert_eq!(set.patches[0].dylib_index, 2);
        assert_eq!(set.patches[0].dylib_vm_offset, 0x10);
        assert!(set.patches[0].patch_to.is_absolute());
        assert_eq!(set.dyld_cache_uuid, Some([0x11; 16]));
    }

    #[test]
    fn test_set_with_loader() {
        let mut buf = vec![0u8; 0x100];
        put_u32(
            &mut buf,
            offset_of!(PrebuiltLoaderSetHeader, magic),
            PREBUILT_LOADER_SET_MAGIC,
        );
        put_u32(&mut buf, offset_of!(PrebuiltLoaderSetHeader, loaders_array_count), 1);
        put_u32(&mut buf, offset_of!(PrebuiltLoaderSetHeader, loaders_array_offset), 0x50);
        put_u32(&mut buf, 0x50, 0x60);
        // Loader record at 0x60; its offsets are window-relative
        put_u32(&mut buf, 0x60, LOADER_MAGIC);
        put_u16(
            &mut buf,
            0x60 + offset_of!(PrebuiltLoaderHeader, index_of_twin),
            NO_UNZIPPERED_TWIN,
        );
        put_u16(&mut buf, 0x60 + offset_of!(PrebuiltLoaderHeader, path_offset), 0x50);
        put_bytes(&mut buf, 0xB0, b"/usr/lib/libz.dylib\0");

        let set = parse_prebuilt_loader_set(&buf, &[]).unwrap();
        assert_eq!(set.loaders.len(), 1);
        assert_eq!(set.loaders[0].path.as_deref(), Some("/usr/lib/libz.dylib"));
    }

    #[test]
    fn test_bad_set_magic() {
        let buf = vec![0u8; 0x50];
        assert!(matches!(
            parse_prebuilt_loader_set(&buf, &[]),
            Err(Error::InvalidLoaderSetMagic(0))
        ));
    }

    #[test]
    fn test_loader_display_smoke() {
        let images: Vec<ImageEntry> = (0..6)
            .map(|i| img(i, &format!("/usr/lib/lib{}.dylib", i)))
            .collect();
        let pbl = parse_prebuilt_loader(&loader_with_deps(Some(&[0, 2])), &images).unwrap();
        let rendered = pbl.to_string();
        assert!(rendered.contains("Dependents:"));
        assert!(rendered.contains("reexport"));
        assert!(rendered.contains("/usr/lib/lib5.dylib"));
    }

    // =========================================================================
    // Facade tests over a synthetic cache file
    // =========================================================================

    const BASE: u64 = 0x1_8000_0000;

    fn align8(value: usize) -> usize {
        (value + 7) & !7
    }

    /// One-entry program trie: "/usr/bin/true" -> pool offset 0.
    fn launch_trie() -> Vec<u8> {
        let mut trie = Vec::new();
        trie.push(0x00);
        trie.push(0x01);
        trie.extend_from_slice(b"/usr/bin/true\0");
        trie.push(0x11);
        trie.push(0x01); // terminal size
        trie.push(0x00); // payload: uleb(0)
        trie.push(0x00); // no children
        trie
    }

    /// A launch set with one app loader exercising deps, bind targets,
    /// regions, and the patch table.
    fn build_launch_set() -> Vec<u8> {
        let mut set = vec![0u8; 0x110];
        put_u32(
            &mut set,
            offset_of!(PrebuiltLoaderSetHeader, magic),
            PREBUILT_LOADER_SET_MAGIC,
        );
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, version_hash), 0x2bcd);
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, length), 0x110);
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, loaders_array_count), 1);
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, loaders_array_offset), 0x50);
        put_u32(
            &mut set,
            offset_of!(PrebuiltLoaderSetHeader, must_be_missing_paths_count),
            1,
        );
        put_u32(
            &mut set,
            offset_of!(PrebuiltLoaderSetHeader, must_be_missing_paths_offset),
            0x54,
        );
        put_u32(
            &mut set,
            offset_of!(PrebuiltLoaderSetHeader, dyld_cache_uuid_offset),
            0x58,
        );
        put_u32(&mut set, 0x50, 0x68);
        put_bytes(&mut set, 0x54, b"/x\0");
        put_bytes(&mut set, 0x58, &[0x22; 16]);

        // App loader at 0x68; offsets below are loader-relative
        let base = 0x68;
        put_u32(&mut set, base, LOADER_MAGIC);
        put_u16(&mut set, base + 4, 0x0005); // prebuilt | objc
        put_u16(&mut set, base + 6, 0x8000); // ref: index 0, app
        put_u16(&mut set, base + offset_of!(PrebuiltLoaderHeader, path_offset), 0x50);
        put_u16(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, dependent_loader_refs_array_offset),
            0x60,
        );
        put_u16(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, dependent_kind_array_offset),
            0x64,
        );
        put_u16(&mut set, base + offset_of!(PrebuiltLoaderHeader, dep_count), 2);
        put_u16(&mut set, base + offset_of!(PrebuiltLoaderHeader, info), 1 << 4);
        put_u16(&mut set, base + offset_of!(PrebuiltLoaderHeader, regions_offset), 0x78);
        put_u16(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, bind_target_refs_offset),
            0x68,
        );
        put_u32(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, bind_target_refs_count),
            2,
        );
        put_u16(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, index_of_twin),
            NO_UNZIPPERED_TWIN,
        );
        put_u32(&mut set, base + offset_of!(PrebuiltLoaderHeader, vm_size), 0x8000);
        put_u32(
            &mut set,
            base + offset_of!(PrebuiltLoaderHeader, patch_table_offset),
            0x88,
        );
        put_bytes(&mut set, base + 0x50, b"/usr/bin/true\0");
        put_u16(&mut set, base + 0x60, 0); // dep -> image 0
        put_u16(&mut set, base + 0x62, 1); // dep -> image 1
        put_bytes(&mut set, base + 0x64, &[0, 2]);
        put_u64(&mut set, base + 0x68, 0x8000_0000_0000_002A); // absolute
        put_u64(&mut set, base + 0x70, 1 | (8u64 << 24)); // image 1, offset 8
        put_u64(&mut set, base + 0x78, 5u64 << 59); // region: r-x
        put_u32(&mut set, base + 0x80, 0);
        put_u32(&mut set, base + 0x84, 0x4000);
        put_u64(&mut set, base + 0x88, 0x100);
        put_u64(&mut set, base + 0x90, PATCH_KIND_OBJC_CLASS as u64);
        put_u64(&mut set, base + 0x98, 0);
        put_u64(&mut set, base + 0xA0, PATCH_KIND_END_OF_TABLE as u64);
        set
    }

    fn build_dylib_loader(path: &str) -> Vec<u8> {
        let mut loader = vec![0u8; 0x50 + path.len() + 1];
        put_u32(&mut loader, 0, LOADER_MAGIC);
        put_u16(&mut loader, 4, 0x0023); // prebuilt | in-cache | never-unload
        put_u16(&mut loader, offset_of!(PrebuiltLoaderHeader, path_offset), 0x50);
        put_u16(
            &mut loader,
            offset_of!(PrebuiltLoaderHeader, index_of_twin),
            NO_UNZIPPERED_TWIN,
        );
        put_bytes(&mut loader, 0x50, path.as_bytes());
        loader
    }

    /// The dylibs set: one loader per cache image, indexed by image table
    /// position.
    fn build_dylib_set() -> Vec<u8> {
        let loader0 = build_dylib_loader("/usr/lib/libSystem.B.dylib");
        let loader1 = build_dylib_loader("/usr/lib/libobjc.A.dylib");
        let mut set = vec![0u8; 0x58];
        put_u32(
            &mut set,
            offset_of!(PrebuiltLoaderSetHeader, magic),
            PREBUILT_LOADER_SET_MAGIC,
        );
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, loaders_array_count), 2);
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, loaders_array_offset), 0x50);
        put_u32(&mut set, 0x50, 0x58);
        put_u32(&mut set, 0x54, (0x58 + loader0.len()) as u32);
        set.extend_from_slice(&loader0);
        set.extend_from_slice(&loader1);
        let length = set.len() as u32;
        put_u32(&mut set, offset_of!(PrebuiltLoaderSetHeader, length), length);
        set
    }

    /// Builds a minimal single-file cache. When `supported` is false the
    /// header claims a pre-prebuilt-loader layout and carries no mappings,
    /// images, or trie.
    fn build_synthetic_cache(supported: bool) -> Vec<u8> {
        let header_size = size_of::<DyldCacheHeader>();
        let mapping_off = header_size;
        let images_off = mapping_off + size_of::<DyldCacheMappingInfo>();
        let paths_off = images_off + 2 * size_of::<DyldCacheImageInfo>();
        let path0 = b"/usr/lib/libSystem.B.dylib\0";
        let path1 = b"/usr/lib/libobjc.A.dylib\0";
        let trie = launch_trie();
        let trie_off = align8(paths_off + path0.len() + path1.len());
        let pool_off = align8(trie_off + trie.len());
        let launch_set = build_launch_set();
        let dylib_set_off = align8(pool_off + launch_set.len());
        let dylib_set = build_dylib_set();
        let total = align8(dylib_set_off + dylib_set.len()) + 64;

        let mut buf = vec![0u8; total];
        put_bytes(&mut buf, 0, b"dyld_v1  arm64e\0");

        if !supported {
            // Old cache layout: header ends before the program trie fields
            put_u32(
                &mut buf,
                offset_of!(DyldCacheHeader, mapping_offset),
                offset_of!(DyldCacheHeader, dylibs_pbl_set_addr) as u32,
            );
            return buf;
        }

        put_u32(
            &mut buf,
            offset_of!(DyldCacheHeader, mapping_offset),
            header_size as u32,
        );
        put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
        // Single mapping covering the whole file
        put_u64(&mut buf, mapping_off, BASE);
        put_u64(&mut buf, mapping_off + 8, total as u64);
        put_u64(&mut buf, mapping_off + 16, 0);
        put_u32(&mut buf, mapping_off + 24, 5);
        put_u32(&mut buf, mapping_off + 28, 5);
        // Image table
        put_u32(
            &mut buf,
            offset_of!(DyldCacheHeader, images_offset),
            images_off as u32,
        );
        put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count), 2);
        put_u64(&mut buf, images_off, BASE + 0x1000);
        put_u32(
            &mut buf,
            images_off + offset_of!(DyldCacheImageInfo, path_file_offset),
            paths_off as u32,
        );
        put_u64(&mut buf, images_off + 32, BASE + 0x2000);
        put_u32(
            &mut buf,
            images_off + 32 + offset_of!(DyldCacheImageInfo, path_file_offset),
            (paths_off + path0.len()) as u32,
        );
        put_bytes(&mut buf, paths_off, path0);
        put_bytes(&mut buf, paths_off + path0.len(), path1);
        // Prebuilt loader plumbing
        put_u64(
            &mut buf,
            offset_of!(DyldCacheHeader, program_trie_addr),
            BASE + trie_off as u64,
        );
        put_u32(
            &mut buf,
            offset_of!(DyldCacheHeader, program_trie_size),
            trie.len() as u32,
        );
        put_bytes(&mut buf, trie_off, &trie);
        put_u64(
            &mut buf,
            offset_of!(DyldCacheHeader, programs_pbl_set_pool_addr),
            BASE + pool_off as u64,
        );
        put_bytes(&mut buf, pool_off, &launch_set);
        put_u64(
            &mut buf,
            offset_of!(DyldCacheHeader, dylibs_pbl_set_addr),
            BASE + dylib_set_off as u64,
        );
        put_bytes(&mut buf, dylib_set_off, &dylib_set);
        buf
    }

    fn write_temp_cache(name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("pblex-{}-{}", name, std::process::id()));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_facade_end_to_end() {
        let path = write_temp_cache("supported", &build_synthetic_cache(true));
        let ctx = DyldContext::open(&path).unwrap();
        assert!(ctx.supports_prebuilt_loaders());

        let mut paths = Vec::new();
        ctx.for_each_launch_loader_set_path(|p| paths.push(p.to_string()))
            .unwrap();
        assert_eq!(paths, ["/usr/bin/true"]);

        // Full enumeration yields the same paths in the same order
        let mut launched = Vec::new();
        ctx.for_each_launch_loader_set(|p, set| {
            launched.push((p.to_string(), set.loaders.len()));
        })
        .unwrap();
        assert_eq!(launched, [("/usr/bin/true".to_string(), 1)]);

        // Every enumerated path resolves through the direct lookup
        let set = ctx.get_launch_loader_set("/usr/bin/true").unwrap();
        assert_eq!(set.header.version_hash, 0x2bcd);
        assert_eq!(set.dyld_cache_uuid, Some([0x22; 16]));
        assert_eq!(set.must_be_missing_paths, ["/x"]);

        let pbl = &set.loaders[0];
        assert_eq!(pbl.path.as_deref(), Some("/usr/bin/true"));
        assert!(pbl.header.loader.is_prebuilt());
        assert!(pbl.header.loader.has_objc());
        assert!(pbl.header.loader.loader_ref.is_app());
        assert_eq!(pbl.dependents.len(), 2);
        assert_eq!(pbl.dependents[0].name, "/usr/lib/libSystem.B.dylib");
        assert_eq!(pbl.dependents[0].kind, DependentKind::Normal);
        assert_eq!(pbl.dependents[1].name, "/usr/lib/libobjc.A.dylib");
        assert_eq!(pbl.dependents[1].kind, DependentKind::Reexport);
        assert_eq!(pbl.bind_targets.len(), 2);
        assert!(pbl.bind_targets[0].is_absolute());
        assert_eq!(pbl.bind_targets[0].offset(), 0x2A);
        assert_eq!(pbl.bind_targets[1].loader_ref().index(), 1);
        assert_eq!(pbl.bind_targets[1].offset(), 8);
        assert_eq!(pbl.regions.len(), 1);
        assert_eq!(pbl.regions[0].perms(), 5);
        assert_eq!(pbl.dylib_patches.len(), 2);
        assert!(pbl.dylib_patches.last().unwrap().is_end_of_table());

        assert!(matches!(
            ctx.get_launch_loader_set("/usr/bin/false"),
            Err(Error::ExecutablePathNotFound { .. })
        ));

        // Dylib loaders resolve through the image table index
        let dylib = ctx
            .get_dylib_prebuilt_loader("/usr/lib/libobjc.A.dylib")
            .unwrap();
        assert_eq!(dylib.path.as_deref(), Some("/usr/lib/libobjc.A.dylib"));
        assert!(dylib.header.loader.dylib_in_dyld_cache());
        assert!(dylib.header.loader.never_unload());

        let dylib = ctx
            .get_dylib_prebuilt_loader("/usr/lib/libSystem.B.dylib")
            .unwrap();
        assert_eq!(dylib.path.as_deref(), Some("/usr/lib/libSystem.B.dylib"));

        assert!(matches!(
            ctx.get_dylib_prebuilt_loader("/usr/lib/libmissing.dylib"),
            Err(Error::ImageNotFound { .. })
        ));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_facade_unsupported_cache() {
        let path = write_temp_cache("unsupported", &build_synthetic_cache(false));
        let ctx = DyldContext::open(&path).unwrap();
        assert!(!ctx.supports_prebuilt_loaders());

        assert!(matches!(
            ctx.for_each_launch_loader_set(|_, _| {}),
            Err(Error::PrebuiltLoaderSetNotSupported)
        ));
        assert!(matches!(
            ctx.for_each_launch_loader_set_path(|_| {}),
            Err(Error::PrebuiltLoaderSetNotSupported)
        ));
        assert!(matches!(
            ctx.get_launch_loader_set("/usr/bin/true"),
            Err(Error::PrebuiltLoaderSetNotSupported)
        ));
        assert!(matches!(
            ctx.get_dylib_prebuilt_loader("/usr/lib/libobjc.A.dylib"),
            Err(Error::PrebuiltLoaderSetNotSupported)
        ));

        std::fs::remove_file(&path).ok();
    }
}
