use crate::config::{MosaicConfig, OutputFormat};
use crate::core::budget::MosaicResult;
use crate::io::archive::{encode_mosaic, ARCHIVE_FORMAT};
use crate::types::{CloudlessError, CloudlessResult, MeasurementRef, MosaicDescriptor};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Catalog product name of written mosaics
pub const MOSAIC_PRODUCT_NAME: &str = "cloudless_mosaic";

/// Where a mosaic is written
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Local(PathBuf),
    Object { bucket: String, key: String },
}

impl Destination {
    /// Conventional location of `mosaic` for `config`:
    /// `<product>/<tile>/<date>_<product>_mosaic.<ext>` under the output dir or bucket
    pub fn for_mosaic(config: &MosaicConfig, mosaic: &MosaicResult) -> Self {
        let key = format!(
            "{}/{}/{}_{}_mosaic.{}",
            mosaic.product,
            mosaic.grid.tile_id,
            mosaic.target_date.format("%Y-%m-%d"),
            mosaic.product,
            config.output_format.extension()
        );
        match &config.output_bucket {
            Some(bucket) => Destination::Object {
                bucket: bucket.clone(),
                key,
            },
            None => Destination::Local(config.output_dir.join(key)),
        }
    }

    pub fn uri(&self) -> String {
        match self {
            Destination::Local(path) => format!("file://{}", path.display()),
            Destination::Object { bucket, key } => format!("s3://{}/{}", bucket, key),
        }
    }

    /// Key used to serialize catalog registration
    pub fn registration_key(&self) -> String {
        self.uri()
    }
}

/// Minimal put-only object store
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> CloudlessResult<()>;
}

/// Object store backed by a local directory (`<root>/<bucket>/<key>`)
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> CloudlessResult<()> {
        if key.split('/').any(|part| part == "..") {
            return Err(CloudlessError::Storage(format!("refusing object key {}", key)));
        }
        write_file_atomic(&self.object_path(bucket, key), bytes)
    }
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> CloudlessResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            log::info!("Creating output directory {}", parent.display());
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut partial = path.as_os_str().to_os_string();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    std::fs::write(&partial, bytes)?;
    std::fs::rename(&partial, path)?;
    Ok(())
}

/// A mosaic that reached its destination
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenMosaic {
    pub destination: Destination,
    pub uri: String,
    pub format: OutputFormat,
    pub bytes: Option<usize>,
}

/// Serializes finished mosaics to local files or an object store
pub struct OutputWriter<'a> {
    format: OutputFormat,
    object_store: Option<&'a dyn ObjectStore>,
}

impl<'a> OutputWriter<'a> {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            object_store: None,
        }
    }

    pub fn with_object_store(mut self, store: &'a dyn ObjectStore) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn write(&self, mosaic: &MosaicResult, destination: &Destination) -> CloudlessResult<WrittenMosaic> {
        log::info!(
            "Writing {} mosaic for {} ({} bands, {} recentness planes) to {}",
            mosaic.product,
            mosaic.target_date,
            mosaic.bands.len(),
            mosaic.recentness.len(),
            destination.uri()
        );
        let bytes = match self.format {
            OutputFormat::Archive => {
                let encoded = encode_mosaic(mosaic)?;
                self.put_bytes(destination, &encoded)?;
                Some(encoded.len())
            }
            OutputFormat::GeoTiff => {
                self.write_geotiff(mosaic, destination)?;
                None
            }
        };

        log::info!("✅ Mosaic written to {}", destination.uri());
        Ok(WrittenMosaic {
            destination: destination.clone(),
            uri: destination.uri(),
            format: self.format,
            bytes,
        })
    }

    fn put_bytes(&self, destination: &Destination, bytes: &[u8]) -> CloudlessResult<()> {
        match destination {
            Destination::Local(path) => write_file_atomic(path, bytes),
            Destination::Object { bucket, key } => match self.object_store {
                Some(store) => store.put(bucket, key, bytes),
                None => Err(CloudlessError::Storage(format!(
                    "no object store configured for {}",
                    destination.uri()
                ))),
            },
        }
    }

    #[cfg(feature = "gdal")]
    fn write_geotiff(&self, mosaic: &MosaicResult, destination: &Destination) -> CloudlessResult<()> {
        match destination {
            Destination::Local(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                crate::io::geotiff::write_geotiff(path, mosaic)
            }
            Destination::Object { .. } => Err(CloudlessError::Storage(format!(
                "GeoTIFF output requires a local destination, got {}",
                destination.uri()
            ))),
        }
    }

    #[cfg(not(feature = "gdal"))]
    fn write_geotiff(&self, _mosaic: &MosaicResult, _destination: &Destination) -> CloudlessResult<()> {
        Err(CloudlessError::Config(
            "GeoTIFF output requires building with the `gdal` feature".to_string(),
        ))
    }
}

/// Catalog descriptor for a written mosaic; the id is the SHA-256 of its URI
pub fn describe(mosaic: &MosaicResult, written: &WrittenMosaic) -> MosaicDescriptor {
    let id = format!("{:x}", Sha256::digest(written.uri.as_bytes()));
    let measurements: BTreeMap<String, MeasurementRef> = mosaic
        .bands
        .iter()
        .chain(mosaic.recentness.iter())
        .enumerate()
        .map(|(index, band)| {
            (
                band.name.clone(),
                MeasurementRef {
                    path: written.uri.clone(),
                    band: index + 1,
                },
            )
        })
        .collect();
    let format = match written.format {
        OutputFormat::Archive => ARCHIVE_FORMAT.to_string(),
        OutputFormat::GeoTiff => "GeoTIFF".to_string(),
    };

    MosaicDescriptor {
        id,
        product: MOSAIC_PRODUCT_NAME.to_string(),
        mask_product: mosaic.product,
        uri: written.uri.clone(),
        format,
        datetime: mosaic.target_date,
        grid: mosaic.grid.clone(),
        measurements,
    }
}
