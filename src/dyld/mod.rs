//! Dyld shared cache handling.
//!
//! This module provides types and utilities for reading Apple's dyld shared
//! cache format and the prebuilt loader sets embedded in it.
//!
//! # Cache Structure
//!
//! A dyld shared cache consists of:
//! - A header with metadata about the cache
//! - Mappings that describe how regions of the cache map to virtual memory
//! - Image information for each dylib in the cache
//! - On newer caches: a dylibs `PrebuiltLoaderSet`, a pool of per-program
//!   `PrebuiltLoaderSet`s, and a program trie mapping executable paths into
//!   that pool
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.01`, `.02`, etc.

mod context;
mod structs;
pub mod pblset;
pub mod trie;

pub use context::*;
pub use pblset::*;
pub use structs::*;
pub use trie::*;
