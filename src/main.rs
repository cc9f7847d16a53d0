//! pblex - inspect prebuilt loader sets in Apple's dyld shared cache.
//!
//! Lists, looks up, and renders the pre-computed launch closures newer
//! caches carry for executables and cached dylibs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use pblex::DyldContext;

/// Default locations to search for dyld shared caches on macOS.
const DEFAULT_CACHE_PATHS: &[&str] = &[
    // macOS Ventura+ (cryptex)
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    // Traditional location
    "/System/Library/dyld",
    // Alternative location
    "/var/db/dyld",
];

/// A dyld shared cache prebuilt loader inspector.
#[derive(Parser, Debug)]
#[command(name = "pblex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show cache information and prebuilt loader availability
    Info {
        /// Architecture to use (e.g., "arm64e", "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// List every executable path with a prebuilt launch closure
    List {
        /// Architecture to use (e.g., "arm64e", "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// Show the launch loader set for an executable path
    Show {
        /// Executable path as recorded in the program trie
        /// (e.g., "/usr/bin/true")
        exec_path: String,

        /// Architecture to use (e.g., "arm64e", "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// Show every launch loader set in the cache
    Dump {
        /// Architecture to use (e.g., "arm64e", "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// Show the prebuilt loader for a cached dylib
    Dylib {
        /// Install path or basename of the dylib
        /// (e.g., "libSystem" or "/usr/lib/libSystem.B.dylib")
        image_path: String,

        /// Architecture to use (e.g., "arm64e", "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// List available cache architectures
    Arches {
        /// Path to the dyld shared cache directory.
        /// If not specified, searches default system locations.
        path: Option<PathBuf>,
    },
}

/// Information about a discovered cache file.
#[derive(Debug, Clone)]
struct CacheInfo {
    /// Path to the cache file
    path: PathBuf,
    /// Architecture string (e.g., "arm64e")
    arch: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Info { cache, arch } => cmd_info(cache, arch),
        Commands::List { cache, arch } => cmd_list(cache, arch),
        Commands::Show {
            exec_path,
            cache,
            arch,
        } => cmd_show(cache, arch, exec_path),
        Commands::Dump { cache, arch } => cmd_dump(cache, arch),
        Commands::Dylib {
            image_path,
            cache,
            arch,
        } => cmd_dylib(cache, arch, image_path),
        Commands::Arches { path } => cmd_arches(path),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Finds the default dyld cache directory by checking known locations.
fn find_default_cache_dir() -> Result<PathBuf> {
    for path_str in DEFAULT_CACHE_PATHS {
        let path = Path::new(path_str);
        if path.is_dir() {
            // Check if it actually contains cache files
            if let Ok(caches) = discover_caches(path) {
                if !caches.is_empty() {
                    return Ok(path.to_path_buf());
                }
            }
        }
    }

    bail!(
        "No dyld shared cache found in default locations:\n  {}",
        DEFAULT_CACHE_PATHS.join("\n  ")
    );
}

/// Gets the cache path, using defaults if not specified.
fn get_cache_path(cache: Option<PathBuf>) -> Result<PathBuf> {
    match cache {
        Some(path) => Ok(path),
        None => find_default_cache_dir(),
    }
}

/// Discovers all dyld shared cache files in a directory.
fn discover_caches(dir: &Path) -> Result<Vec<CacheInfo>> {
    let mut caches = Vec::new();

    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        // Look for dyld_shared_cache_* files
        if !name.starts_with("dyld_shared_cache_") {
            continue;
        }

        // Skip subcache files (have extensions like .01, .02, .symbols)
        if name.contains('.') {
            continue;
        }

        // Format: dyld_shared_cache_<arch> (e.g., dyld_shared_cache_arm64e)
        if let Some(arch) = name.strip_prefix("dyld_shared_cache_") {
            caches.push(CacheInfo {
                path: path.clone(),
                arch: arch.to_string(),
            });
        }
    }

    // Sort by architecture name for consistent ordering
    caches.sort_by(|a, b| a.arch.cmp(&b.arch));

    Ok(caches)
}

/// Resolves a cache path with optional architecture filter.
///
/// If path is a file, returns it directly.
/// If path is a directory, discovers caches and filters by arch.
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if !path.is_dir() {
        bail!("Cache path does not exist: {}", path.display());
    }

    let caches = discover_caches(path)?;

    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    // Filter by architecture if specified
    let matching: Vec<_> = if let Some(arch_filter) = arch {
        caches
            .iter()
            .filter(|c| c.arch.contains(arch_filter))
            .collect()
    } else {
        caches.iter().collect()
    };

    if matching.is_empty() {
        let available: Vec<_> = caches.iter().map(|c| c.arch.as_str()).collect();
        bail!(
            "No cache matches architecture '{}'. Available: {}",
            arch.unwrap_or(""),
            available.join(", ")
        );
    }

    if matching.len() > 1 {
        let available: Vec<_> = matching.iter().map(|c| c.arch.as_str()).collect();
        bail!(
            "Multiple caches match. Please specify --arch. Available: {}",
            available.join(", ")
        );
    }

    Ok(matching[0].path.clone())
}

/// Opens the cache identified by the common (cache, arch) arguments.
fn open_cache(cache: Option<PathBuf>, arch: Option<String>) -> Result<DyldContext> {
    let cache_path = get_cache_path(cache)?;
    let resolved_path = resolve_cache_path(&cache_path, arch.as_deref())?;

    DyldContext::open(&resolved_path)
        .with_context(|| format!("Failed to open cache: {}", resolved_path.display()))
}

fn cmd_info(cache: Option<PathBuf>, arch: Option<String>) -> Result<()> {
    let cache = open_cache(cache, arch)?;

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:         {}", cache.path.display());
    println!("Architecture: {}", cache.architecture());
    println!("Images:       {}", cache.image_count());
    println!("Mappings:     {}", cache.mappings.len());
    println!("Subcaches:    {}", cache.subcaches.len());
    println!(
        "Total size:   {:.2} MB",
        cache.total_size() as f64 / 1024.0 / 1024.0
    );

    if cache.supports_prebuilt_loaders() {
        let mut launch_count = 0usize;
        cache.for_each_launch_loader_set_path(|_| launch_count += 1)?;
        println!("Prebuilt:     {} launch loader sets", launch_count);
    } else {
        println!("Prebuilt:     not supported by this cache");
    }

    println!("\nMappings:");
    for (i, mapping) in cache.mappings.iter().enumerate() {
        let prot = format!(
            "{}{}{}",
            if mapping.is_readable() { "r" } else { "-" },
            if mapping.is_writable() { "w" } else { "-" },
            if mapping.is_executable() { "x" } else { "-" },
        );
        let flags = mapping.mapping_flags();
        println!(
            "  [{:2}] {:#018x} - {:#018x} ({:>8}) {} {}",
            i,
            mapping.address,
            mapping.address + mapping.size,
            format_size(mapping.size),
            prot,
            if flags.is_empty() {
                String::new()
            } else {
                format!("{:?}", flags)
            }
        );
    }

    if !cache.subcaches.is_empty() {
        println!("\nSubcaches:");
        for (i, sc) in cache.subcaches.iter().enumerate() {
            println!(
                "  [{:2}] {} ({:.2} MB)",
                i + 1,
                sc.path.file_name().unwrap_or_default().to_string_lossy(),
                sc.mmap.len() as f64 / 1024.0 / 1024.0
            );
        }
    }

    Ok(())
}

fn cmd_list(cache: Option<PathBuf>, arch: Option<String>) -> Result<()> {
    let cache = open_cache(cache, arch)?;

    cache
        .for_each_launch_loader_set_path(|path| println!("{}", path))
        .context("Failed to enumerate launch loader sets")?;

    Ok(())
}

fn cmd_show(cache: Option<PathBuf>, arch: Option<String>, exec_path: String) -> Result<()> {
    let cache = open_cache(cache, arch)?;

    let set = cache
        .get_launch_loader_set(&exec_path)
        .with_context(|| format!("Failed to load launch loader set for {}", exec_path))?;

    println!("{}", set);
    Ok(())
}

fn cmd_dump(cache: Option<PathBuf>, arch: Option<String>) -> Result<()> {
    let cache = open_cache(cache, arch)?;

    cache
        .for_each_launch_loader_set(|path, set| {
            println!("=== {}", path);
            println!("{}", set);
        })
        .context("Failed to enumerate launch loader sets")?;

    Ok(())
}

fn cmd_dylib(cache: Option<PathBuf>, arch: Option<String>, image_path: String) -> Result<()> {
    let cache = open_cache(cache, arch)?;

    // The dylibs set is indexed by exact install path; fall back to a
    // substring match to resolve shorthand names like "libSystem".
    let resolved = if cache.image_index(&image_path).is_some() {
        image_path.clone()
    } else if let Some(image) = cache.find_image(&image_path) {
        image.path.clone()
    } else {
        image_path.clone()
    };

    let loader = cache
        .get_dylib_prebuilt_loader(&resolved)
        .with_context(|| format!("Failed to load prebuilt loader for {}", resolved))?;

    println!("{}", loader);
    Ok(())
}

fn cmd_arches(path: Option<PathBuf>) -> Result<()> {
    let cache_path = get_cache_path(path)?;
    let caches = discover_caches(&cache_path)?;

    if caches.is_empty() {
        println!("No dyld shared caches found in: {}", cache_path.display());
        return Ok(());
    }

    println!("Available architectures in {}:", cache_path.display());
    for cache in &caches {
        println!("  {} - {}", cache.arch, cache.path.display());
    }

    Ok(())
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
