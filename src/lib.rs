//! pblex - a dyld shared cache prebuilt loader inspector.
//!
//! This library decodes the `PrebuiltLoaderSet` graphs that dyld4-era
//! shared caches carry: pre-computed launch state the dynamic linker uses
//! to bypass just-in-time binding at process launch. The decoder
//! materializes the packed, offset-based on-disk records into owned,
//! immutable Rust values suitable for inspection and rendering.
//!
//! # Features
//!
//! - Fast memory-mapped file I/O
//! - Support for split caches (iOS 15+, macOS 12+)
//! - Program trie enumeration and path lookup
//! - Full `PrebuiltLoader` decoding: regions, dependents, bind targets,
//!   ObjC fixups, and dylib patch tables
//!
//! # Example
//!
//! ```no_run
//! use pblex::DyldContext;
//!
//! fn main() -> pblex::Result<()> {
//!     let cache = DyldContext::open("/path/to/dyld_shared_cache_arm64e")?;
//!
//!     // Every executable with a prebuilt launch closure
//!     cache.for_each_launch_loader_set_path(|path| println!("{}", path))?;
//!
//!     // Decode one launch closure
//!     let set = cache.get_launch_loader_set("/usr/bin/true")?;
//!     for loader in &set.loaders {
//!         println!("{}", loader);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dyld;
pub mod error;
pub mod util;

// Re-export main types
pub use dyld::{
    parse_prebuilt_loader, parse_prebuilt_loader_set, DyldContext, ImageEntry, MappingEntry,
    PrebuiltLoader, PrebuiltLoaderSet,
};
pub use error::{Error, Result};
