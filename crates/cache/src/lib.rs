//! Raster Cache Library
//!
//! Tiled, memory-bounded cache for large rasters with write-back to a
//! single fixed-slot file per raster and least-recently-read eviction.

pub mod buffer;
pub mod config;
pub mod error;
pub mod geometry;
pub mod grid_file;
pub mod manager;
pub mod memory_budget;
pub mod meta;
pub mod reader;
pub mod source;
pub mod stats;

pub use buffer::ByteBufferAllocator;
pub use config::{parse_byte_size, CacheConfig, ConfigError};
pub use error::{CacheError, CacheResult};
pub use geometry::{DataInfo, DataType, GeoReference, GridGeometry, OriginLocation, RasterRect};
pub use grid_file::{GridFile, StorageBatch, TileReadResult, TileStorage};
pub use manager::{CacheManager, CACHE_FILE_EXTENSION};
pub use memory_budget::{MemoryBudget, MemoryBudgetConfig, MemoryPressure};
pub use meta::{sidecar_path, CacheInfo, CacheInfoFile, TileBitmap};
pub use reader::{BufferResult, CacheReader, CacheReaderBuilder, SourceReader, TileState};
pub use source::RawRasterSource;
pub use stats::{ManagerStats, ReaderStats};
