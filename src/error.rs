//! Error types for dyld cache and prebuilt loader inspection.
//!
//! This module provides error handling for all inspection operations,
//! including cache parsing, address translation, trie walking, and
//! prebuilt loader decoding.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for dyld cache inspection operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Prebuilt Loader Errors ====================
    #[error("dyld cache has no prebuilt loader set info")]
    PrebuiltLoaderSetNotSupported,

    #[error("invalid prebuilt loader magic: expected 0x6c347964, got {0:#x}")]
    InvalidLoaderMagic(u32),

    #[error("invalid prebuilt loader set magic: expected 0x73703464, got {0:#x}")]
    InvalidLoaderSetMagic(u32),

    #[error("offset {offset:#x} outside record window (size {window:#x})")]
    InvalidOffset { offset: usize, window: usize },

    #[error("invalid element count {count} (element size {element_size})")]
    InvalidCount { count: usize, element_size: usize },

    #[error("executable '{path}' not found in program trie")]
    ExecutablePathNotFound { path: String },

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    #[error("image at index {index} out of bounds (total: {total})")]
    ImageIndexOutOfBounds { index: usize, total: usize },

    // ==================== Trie Errors ====================
    #[error("invalid trie node at offset {offset:#x}")]
    InvalidTrie { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for dyld cache inspection operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
