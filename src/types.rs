use chrono::{DateTime, NaiveDate, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sentinel-2 surface reflectance digital number
pub type Reflectance = u16;

/// 2D single-band raster (rows x cols)
pub type BandImage = Array2<Reflectance>;

/// Nodata marker written for pixels no candidate could fill
pub const NODATA: Reflectance = 0;

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Build from a GDAL-style six element array
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Pixel grid identity shared by every raster of one compositing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub tile_id: String,          // MGRS tile, e.g. "35VLG"
    pub width: usize,             // columns
    pub height: usize,            // rows
    pub epsg: u32,
    pub geo_transform: GeoTransform,
}

impl GridSpec {
    /// Array shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Fail with `GridMismatch` unless `other` is pixel-aligned with this grid
    pub fn ensure_aligned(&self, other: &GridSpec, what: &str) -> CloudlessResult<()> {
        if self == other {
            return Ok(());
        }
        Err(CloudlessError::GridMismatch(format!(
            "{} grid {} ({}x{}, EPSG:{}) does not match output grid {} ({}x{}, EPSG:{})",
            what,
            other.tile_id,
            other.width,
            other.height,
            other.epsg,
            self.tile_id,
            self.width,
            self.height,
            self.epsg,
        )))
    }

    /// Fail with `GridMismatch` unless an array of `shape` covers this grid exactly
    pub fn ensure_shape(&self, shape: (usize, usize), what: &str) -> CloudlessResult<()> {
        if shape == self.shape() {
            return Ok(());
        }
        Err(CloudlessError::GridMismatch(format!(
            "{} has shape {}x{}, expected {}x{} for tile {}",
            what, shape.0, shape.1, self.height, self.width, self.tile_id
        )))
    }
}

/// Catalogued Sentinel-2 overpass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub id: String,
    pub acquired: DateTime<Utc>,
    pub grid: GridSpec,
    /// Band name -> raster reference (path or URI)
    pub bands: BTreeMap<String, String>,
    /// Cloudy pixel percentage from the granule metadata
    pub cloud_cover: f64,
    #[serde(default)]
    pub nodata: Reflectance,
}

impl SceneRecord {
    pub fn acquisition_date(&self) -> NaiveDate {
        self.acquired.date_naive()
    }

    /// Raster reference for `band`, or `RasterRead` if the scene lacks it
    pub fn band_ref(&self, band: &str) -> CloudlessResult<&str> {
        self.bands.get(band).map(String::as_str).ok_or_else(|| {
            CloudlessError::RasterRead(format!("scene {} has no band {}", self.id, band))
        })
    }
}

/// Method used to decide per-pixel validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskProduct {
    /// Model-based cloud and shadow masks
    S2cloudless,
    /// Rule-based Fmask classification
    Fmask,
    /// Sentinel-2 L2A scene classification layer
    Scl,
    /// Raw reflectance compositing, every pixel valid
    None,
}

impl MaskProduct {
    pub fn name(&self) -> &'static str {
        match self {
            MaskProduct::S2cloudless => "s2cloudless",
            MaskProduct::Fmask => "fmask",
            MaskProduct::Scl => "scl",
            MaskProduct::None => "none",
        }
    }
}

impl std::fmt::Display for MaskProduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for MaskProduct {
    type Err = CloudlessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s2cloudless" => Ok(MaskProduct::S2cloudless),
            "fmask" => Ok(MaskProduct::Fmask),
            "scl" => Ok(MaskProduct::Scl),
            "none" => Ok(MaskProduct::None),
            other => Err(CloudlessError::Config(format!("unknown mask product: {}", other))),
        }
    }
}

/// Where one band of a registered mosaic lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRef {
    pub path: String,
    pub band: usize, // 1-based
}

/// Catalog entry describing a written mosaic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicDescriptor {
    pub id: String,
    pub product: String,
    pub mask_product: MaskProduct,
    pub uri: String,
    pub format: String,
    pub datetime: NaiveDate,
    pub grid: GridSpec,
    pub measurements: BTreeMap<String, MeasurementRef>,
}

/// Error types for mosaic processing
#[derive(Debug, thiserror::Error)]
pub enum CloudlessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Grid mismatch: {0}")]
    GridMismatch(String),

    #[error("Mask product '{product}' not found for scene {scene_id}")]
    MaskNotFound { scene_id: String, product: MaskProduct },

    #[error("Raster read error: {0}")]
    RasterRead(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for mosaic operations
pub type CloudlessResult<T> = Result<T, CloudlessError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(tile: &str, width: usize) -> GridSpec {
        GridSpec {
            tile_id: tile.to_string(),
            width,
            height: 4,
            epsg: 32635,
            geo_transform: GeoTransform::from_gdal([300000.0, 10.0, 0.0, 6900000.0, 0.0, -10.0]),
        }
    }

    #[test]
    fn test_grid_alignment() {
        let a = grid("35VLG", 8);
        assert!(a.ensure_aligned(&grid("35VLG", 8), "scene").is_ok());

        let err = a.ensure_aligned(&grid("35VLG", 9), "scene").unwrap_err();
        assert!(matches!(err, CloudlessError::GridMismatch(_)));
        assert!(a.ensure_shape((4, 8), "mask").is_ok());
        assert!(a.ensure_shape((8, 4), "mask").is_err());
    }

    #[test]
    fn test_mask_product_names() {
        for product in [MaskProduct::S2cloudless, MaskProduct::Fmask, MaskProduct::Scl, MaskProduct::None] {
            assert_eq!(product.name().parse::<MaskProduct>().unwrap(), product);
        }
        assert!("sen2cor".parse::<MaskProduct>().is_err());
        assert_eq!(serde_json::to_string(&MaskProduct::S2cloudless).unwrap(), "\"s2cloudless\"");
    }

    #[test]
    fn test_geo_transform_roundtrip() {
        let gt = [399960.0, 10.0, 0.0, 7000020.0, 0.0, -10.0];
        assert_eq!(GeoTransform::from_gdal(gt).to_gdal(), gt);
    }
}
