//! Process-wide cache manager.
//!
//! The manager owns the memory and disk budgets shared by all cache readers,
//! keeps a registry of live readers and evicts least recently read readers
//! when a new tile buffer does not fit. It also names cache files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::geometry::{DataInfo, GeoReference};
use crate::memory_budget::{MemoryBudget, MemoryBudgetConfig};
use crate::reader::{CacheReader, SourceReader};
use crate::stats::ManagerStats;

/// Extension of cache files.
pub const CACHE_FILE_EXTENSION: &str = "rcache";

/// Marker suffix that disables caching for a data file.
pub const NO_CACHE_MARKER: &str = "no-cache";

static GLOBAL: OnceCell<Arc<CacheManager>> = OnceCell::new();

/// Shared budgets and registry of cache readers.
pub struct CacheManager {
    config: Mutex<CacheConfig>,
    memory: MemoryBudget,
    disk: MemoryBudget,
    /// Registered readers; also serializes eviction
    readers: Mutex<Vec<Weak<CacheReader>>>,
    /// Unique cache ids by absolute data file path
    unique_ids: Mutex<HashMap<String, PathBuf>>,
    /// Cache files without a stable id, removed when the manager goes away
    temporary_files: Mutex<Vec<PathBuf>>,
    evictions: AtomicU64,
    files_deleted: AtomicU64,
}

impl CacheManager {
    /// Creates a manager and its cache directory.
    pub fn new(config: CacheConfig) -> Arc<Self> {
        if let Err(e) = fs::create_dir_all(&config.cache_dir) {
            warn!(dir = %config.cache_dir.display(), error = %e, "Could not create cache directory");
        }
        info!(
            dir = %config.cache_dir.display(),
            memory_budget = config.memory_budget,
            disk_budget = config.disk_budget,
            "Raster cache initialized"
        );
        Arc::new(Self {
            memory: MemoryBudget::new(
                MemoryBudgetConfig::new(config.memory_budget_bytes())
                    .with_target_utilization(config.target_utilization),
            ),
            disk: MemoryBudget::with_limit(config.disk_budget_bytes()),
            config: Mutex::new(config),
            readers: Mutex::new(Vec::new()),
            unique_ids: Mutex::new(HashMap::new()),
            temporary_files: Mutex::new(Vec::new()),
            evictions: AtomicU64::new(0),
            files_deleted: AtomicU64::new(0),
        })
    }

    /// The process-wide manager, configured from the environment on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let config = CacheConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "Invalid cache configuration in environment, using defaults");
                CacheConfig::default()
            });
            Self::new(config)
        }))
    }

    /// Manager for `dir`, configured from the environment otherwise. A
    /// missing directory is created if `create` is set; if it cannot be used
    /// the default cache directory is taken instead.
    pub fn with_directory(dir: impl AsRef<Path>, create: bool) -> Arc<Self> {
        let dir = dir.as_ref();
        let config = CacheConfig::from_env().unwrap_or_default();
        let usable = dir.is_dir() || (create && fs::create_dir_all(dir).is_ok());
        if usable {
            Self::new(config.with_cache_dir(dir))
        } else {
            warn!(
                dir = %dir.display(),
                fallback = %config.cache_dir.display(),
                "Cache directory unusable, using the default"
            );
            Self::new(config)
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config.lock().clone()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.lock().cache_dir.clone()
    }

    /// Charges `required` bytes to the memory budget, first evicting least
    /// recently read readers if they would not fit. Returns the memory in
    /// use afterwards.
    pub fn free_memory(&self, required: usize) -> usize {
        let readers = self.readers.lock();
        if !self.memory.can_allocate(required) {
            self.evict(&readers, required);
        }
        self.memory.record_allocation(required);
        self.memory.current_usage()
    }

    /// Evicts readers in least-recently-read order until `required` more
    /// bytes stay below the memory target and the disk is within budget.
    fn evict(&self, readers: &[Weak<CacheReader>], required: usize) {
        let mut candidates: Vec<Arc<CacheReader>> =
            readers.iter().filter_map(Weak::upgrade).collect();
        candidates.sort_by_key(|reader| reader.last_read_access());

        let mut freed = 0;
        for reader in candidates {
            let disk_over = self.disk_over_budget();
            if !disk_over && self.memory.is_below_target(required) {
                break;
            }
            if disk_over && reader.cache_file_size() > 0 {
                freed += reader.clear(true);
                self.files_deleted.fetch_add(1, Ordering::Relaxed);
            } else if reader.in_memory_size() > 0 {
                freed += reader.release_memory();
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            required,
            freed,
            memory_used = self.memory.current_usage(),
            disk_used = self.disk.current_usage(),
            "Evicted cache readers"
        );
    }

    fn disk_over_budget(&self) -> bool {
        self.disk.current_usage() > self.disk.total_budget()
    }

    /// Returns bytes to the memory budget.
    pub fn release_memory(&self, bytes: usize) {
        self.memory.record_deallocation(bytes);
    }

    pub(crate) fn record_memory(&self, bytes: usize) {
        self.memory.record_allocation(bytes);
    }

    pub(crate) fn record_disk(&self, bytes: usize) {
        self.disk.record_allocation(bytes);
    }

    pub(crate) fn release_disk(&self, bytes: usize) {
        self.disk.record_deallocation(bytes);
    }

    /// Registers a reader. Its cache file counts against the disk budget.
    pub fn add_reader(&self, reader: &Arc<CacheReader>) {
        let mut readers = self.readers.lock();
        readers.retain(|r| r.strong_count() > 0);
        if readers.iter().any(|r| std::ptr::eq(r.as_ptr(), Arc::as_ptr(reader))) {
            debug!("Cache reader already registered");
            return;
        }
        self.disk.record_allocation(reader.cache_file_size() as usize);
        readers.push(Arc::downgrade(reader));
    }

    /// Number of live registered readers.
    pub fn size(&self) -> usize {
        self.readers.lock().iter().filter(|r| r.strong_count() > 0).count()
    }

    fn live_readers(readers: &[Weak<CacheReader>]) -> Vec<Arc<CacheReader>> {
        readers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Flushes every registered reader. Returns the number of tiles written.
    pub fn flush_all(&self) -> usize {
        let readers = self.readers.lock();
        Self::live_readers(&readers).iter().map(|r| r.flush()).sum()
    }

    /// Disposes every registered reader. Returns the freed bytes.
    pub fn dispose_all(&self) -> usize {
        let readers = self.readers.lock();
        Self::live_readers(&readers).iter().map(|r| r.dispose(true)).sum()
    }

    /// Clears every reader and empties the registry. With `delete_files`
    /// cache files and temporary files are removed too.
    pub fn clear(&self, delete_files: bool) {
        let mut readers = self.readers.lock();
        for reader in Self::live_readers(&readers) {
            reader.clear(delete_files);
        }
        readers.clear();
        self.memory.set_usage(0);
        self.disk.set_usage(0);
        if delete_files {
            self.delete_temporary_files();
        }
        info!(delete_files, "Cleared raster cache");
    }

    /// Clears the cache and applies a new configuration.
    pub fn reset(&self, config: CacheConfig, delete_files: bool) {
        self.clear(delete_files);
        if let Err(e) = fs::create_dir_all(&config.cache_dir) {
            warn!(dir = %config.cache_dir.display(), error = %e, "Could not create cache directory");
        }
        self.memory.set_total_budget(config.memory_budget_bytes());
        self.memory.set_target_utilization(config.target_utilization);
        self.disk.set_total_budget(config.disk_budget_bytes());
        *self.config.lock() = config;
    }

    /// Sets both budgets to zero, so every new tile first evicts all others.
    pub fn disable(&self) {
        self.memory.set_total_budget(0);
        self.disk.set_total_budget(0);
        let mut config = self.config.lock();
        config.memory_budget = 0;
        config.disk_budget = 0;
        info!("Raster caching disabled");
    }

    pub fn currently_used_memory(&self) -> usize {
        self.memory.current_usage()
    }

    pub fn currently_used_disk(&self) -> usize {
        self.disk.current_usage()
    }

    /// Recounts memory and disk usage from the registered readers.
    pub fn recalculate_usage(&self) {
        let readers = self.readers.lock();
        let live = Self::live_readers(&readers);
        let memory: usize = live.iter().map(|r| r.in_memory_size()).sum();
        let disk: u64 = live.iter().map(|r| r.cache_file_size()).sum();
        self.memory.set_usage(memory);
        self.disk.set_usage(disk as usize);
        debug!(memory, disk, readers = live.len(), "Recalculated cache usage");
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            readers: self.size(),
            memory_used: self.memory.current_usage(),
            memory_budget: self.memory.total_budget(),
            disk_used: self.disk.current_usage(),
            disk_budget: self.disk.total_budget(),
            evictions: self.evictions.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            pressure: self.memory.pressure(),
        }
    }

    /// Deterministic cache id of a raster, usable as a file name.
    pub fn create_id(width: u32, height: u32, data_info: &DataInfo, geo_reference: &GeoReference) -> String {
        let id = format!(
            "{}_bands_{}_datatype_{}_w_{}_h_{}",
            geo_reference.to_outer(),
            data_info.bands,
            data_info.data_type,
            width,
            height
        );
        id.chars()
            .map(|c| match c {
                '{' | '}' | ':' | '/' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect()
    }

    /// Path of the cache file for `id`. Without an id a random name is used
    /// and the file is removed when the manager is dropped or cleared.
    pub fn create_cache_file(&self, id: Option<&str>) -> PathBuf {
        let dir = self.cache_dir();
        match id {
            Some(id) => dir.join(format!("{id}.{CACHE_FILE_EXTENSION}")),
            None => {
                let path = dir.join(format!("{}.{CACHE_FILE_EXTENSION}", uuid::Uuid::new_v4()));
                self.temporary_files.lock().push(path.clone());
                path
            }
        }
    }

    /// Re-opens the cache file of `id` if it exists.
    pub fn create_from_cache(
        self: &Arc<Self>,
        source: Option<Box<dyn SourceReader>>,
        id: &str,
    ) -> Option<Arc<CacheReader>> {
        let path = self.cache_dir().join(format!("{id}.{CACHE_FILE_EXTENSION}"));
        if !path.exists() {
            debug!(path = %path.display(), "No cache file to re-open");
            return None;
        }
        match CacheReader::from_cache_file(source, path, Arc::clone(self)) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(id, error = %e, "Could not re-open cache file");
                None
            }
        }
    }

    /// Cache id for a data file: its file stem, prefixed with a counter if a
    /// different file with the same stem already took it.
    pub fn unique_cache_identifier(&self, path: &Path) -> String {
        let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "raster".to_string());

        let mut ids = self.unique_ids.lock();
        if let Some((id, _)) = ids.iter().find(|(_, p)| **p == absolute) {
            return id.clone();
        }
        let mut id = stem.clone();
        let mut index = 0;
        while ids.contains_key(&id) {
            id = format!("{index}_{stem}");
            index += 1;
        }
        ids.insert(id.clone(), absolute);
        id
    }

    /// Whether a marker file next to `path` disables caching of it, either
    /// for all levels (`<file>.no-cache`) or for `level` only
    /// (`<file>.no-cache-<level>`).
    pub fn has_no_cache_marker(path: &Path, level: u32) -> bool {
        if !path.exists() {
            return false;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{name}.{NO_CACHE_MARKER}")).exists()
            || dir.join(format!("{name}.{NO_CACHE_MARKER}-{level}")).exists()
    }

    fn delete_temporary_files(&self) {
        for path in self.temporary_files.lock().drain(..) {
            for file in [path.clone(), crate::meta::sidecar_path(&path)] {
                match fs::remove_file(&file) {
                    Ok(()) => debug!(path = %file.display(), "Deleted temporary cache file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %file.display(), error = %e, "Could not delete temporary cache file"),
                }
            }
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.delete_temporary_files();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("stats", &self.stats())
            .field("cache_dir", &self.cache_dir())
            .finish()
    }
}
