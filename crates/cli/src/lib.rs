use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use raster_cache::{
    sidecar_path, CacheConfig, CacheInfoFile, CacheManager, CacheReader, DataInfo, DataType,
    RasterRect, RawRasterSource, CACHE_FILE_EXTENSION,
};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "raster-cache-cli")]
#[command(about = "Raster tile cache CLI")]
pub struct Cli {
    /// Log cache activity to stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable cache file metadata.
    Info {
        #[arg(value_name = "CACHE_FILE")]
        file: PathBuf,
    },
    /// Read a rectangle of a raw raster through the cache.
    Read {
        #[arg(value_name = "RAW_FILE")]
        file: PathBuf,
        #[arg(long)]
        width: u32,
        #[arg(long)]
        height: u32,
        #[arg(long, default_value_t = 1)]
        bands: u32,
        #[arg(long, default_value = "byte")]
        data_type: DataType,
        /// Rectangle as x,y,width,height.
        #[arg(long, allow_hyphen_values = true)]
        rect: RasterRect,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        tile_size: Option<u32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete every cache file and sidecar in a directory.
    Purge {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    raster_width: u32,
    raster_height: u32,
    rows: u32,
    columns: u32,
    tile_width: u32,
    tile_height: u32,
    bands: u32,
    data_type: String,
    tiles_on_file: usize,
    tile_count: usize,
    cache_file_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ReadOutput {
    rect: String,
    bytes: usize,
    output: String,
    cache_file: Option<String>,
    tiles_written: usize,
}

#[derive(Debug, Serialize)]
struct PurgeOutput {
    dir: String,
    deleted: usize,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { file } => run_info(&file),
        Commands::Read {
            file,
            width,
            height,
            bands,
            data_type,
            rect,
            cache_dir,
            tile_size,
            output,
        } => {
            let data_info = DataInfo::new(bands, data_type);
            run_read(&file, width, height, data_info, rect, cache_dir, tile_size, output.as_deref())
        }
        Commands::Purge { dir } => run_purge(&dir),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // a second initialization in the same process keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn run_info(file: &Path) -> Result<()> {
    ensure_file_exists(file)?;

    let sidecar = if file.extension().is_some_and(|ext| ext == "info") {
        file.to_path_buf()
    } else {
        sidecar_path(file)
    };
    let info = CacheInfoFile::read(&sidecar)
        .with_context(|| format!("no readable cache info at {}", sidecar.display()))?;
    let geometry = info.geometry();

    let payload = InfoOutput {
        path: file.display().to_string(),
        raster_width: info.raster_width(),
        raster_height: info.raster_height(),
        rows: geometry.rows,
        columns: geometry.columns,
        tile_width: geometry.tile_width,
        tile_height: geometry.tile_height,
        bands: geometry.data_info.bands,
        data_type: geometry.data_info.data_type.to_string(),
        tiles_on_file: info.tiles_on_file().count(),
        tile_count: geometry.tile_count(),
        cache_file_bytes: fs::metadata(sidecar.with_extension(CACHE_FILE_EXTENSION))
            .map(|m| m.len())
            .unwrap_or(0),
    };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_read(
    file: &Path,
    width: u32,
    height: u32,
    data_info: DataInfo,
    rect: RasterRect,
    cache_dir: Option<PathBuf>,
    tile_size: Option<u32>,
    output: Option<&Path>,
) -> Result<()> {
    ensure_file_exists(file)?;

    let mut config = CacheConfig::from_env().context("invalid cache configuration")?;
    if let Some(dir) = cache_dir {
        config = config.with_cache_dir(dir);
    }
    if let Some(tile_size) = tile_size {
        config = config.with_tile_size(tile_size);
    }
    let manager = CacheManager::new(config);

    let source = RawRasterSource::open(file, width, height, data_info)
        .with_context(|| format!("failed to open raster {}", file.display()))?;
    let reader = CacheReader::new(Box::new(source), None, manager)
        .context("failed to create cache reader")?;

    let result = reader
        .read(&rect, None)
        .context("failed to read rectangle")?
        .with_context(|| format!("rectangle {rect} does not intersect the {width}x{height} raster"))?;
    let tiles_written = reader.flush();
    debug!(stats = ?reader.stats(), "Read finished");

    let output = output
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_read_output(file, &result.rect()));
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&output, result.data())
        .with_context(|| format!("failed to write pixels to {}", output.display()))?;

    let payload = ReadOutput {
        rect: result.rect().to_string(),
        bytes: result.data().len(),
        output: output.display().to_string(),
        cache_file: reader.path().map(|p| p.display().to_string()),
        tiles_written,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    reader.dispose(true);

    Ok(())
}

fn run_purge(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let mut deleted = 0;
    let entries = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let is_cache_file = path
            .extension()
            .is_some_and(|ext| ext == CACHE_FILE_EXTENSION || ext == "info");
        if path.is_file() && is_cache_file {
            fs::remove_file(&path).with_context(|| format!("failed to delete {}", path.display()))?;
            deleted += 1;
        }
    }

    let payload = PurgeOutput { dir: dir.display().to_string(), deleted };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    Ok(())
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_read_output(file: &Path, rect: &RasterRect) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("raster");

    file.with_file_name(format!("{stem}-{}x{}+{}+{}.raw", rect.width, rect.height, rect.x, rect.y))
}
