//! GDAL-backed raster access (feature `gdal`)
//!
//! Scene bands and mask artifacts are addressed through `SceneRecord::bands`;
//! mask layers use the reserved keys below.

use crate::core::budget::MosaicResult;
use crate::io::raster::{MaskSource, RasterSource, RawMask};
use crate::types::{BandImage, CloudlessError, CloudlessResult, MaskProduct, SceneRecord};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::path::{Path, PathBuf};

pub const S2CLOUDLESS_CLOUD_KEY: &str = "s2cloudless_cloud";
pub const S2CLOUDLESS_SHADOW_KEY: &str = "s2cloudless_shadow";
pub const FMASK_KEY: &str = "fmask";
pub const SCL_KEY: &str = "SCL";

fn read_first_band<T: GdalType + Copy>(path: &str) -> CloudlessResult<Array2<T>> {
    let dataset = Dataset::open(Path::new(path))?;
    let (width, height) = dataset.raster_size();
    let rasterband = dataset.rasterband(1)?;
    let buffer = rasterband.read_as::<T>((0, 0), (width, height), (width, height), None)?;

    Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| CloudlessError::RasterRead(format!("Failed to reshape {}: {}", path, e)))
}

/// Reads reflectance bands from the paths listed on each scene
#[derive(Debug, Clone, Default)]
pub struct GdalRasterSource;

impl GdalRasterSource {
    pub fn new() -> Self {
        Self
    }
}

impl RasterSource for GdalRasterSource {
    fn read_band(&self, scene: &SceneRecord, band: &str) -> CloudlessResult<BandImage> {
        let path = scene.band_ref(band)?;
        log::debug!("Reading band {} of {} from {}", band, scene.id, path);
        read_first_band::<u16>(path)
    }
}

/// Reads mask artifacts stored next to the scene bands
#[derive(Debug, Clone, Default)]
pub struct GdalMaskSource;

impl GdalMaskSource {
    pub fn new() -> Self {
        Self
    }

    fn artifact<'s>(scene: &'s SceneRecord, product: MaskProduct, key: &str) -> CloudlessResult<&'s str> {
        scene
            .bands
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CloudlessError::MaskNotFound {
                scene_id: scene.id.clone(),
                product,
            })
    }
}

impl MaskSource for GdalMaskSource {
    fn load_mask(&self, scene: &SceneRecord, product: MaskProduct) -> CloudlessResult<RawMask> {
        match product {
            MaskProduct::S2cloudless => {
                let cloud = Self::artifact(scene, product, S2CLOUDLESS_CLOUD_KEY)?;
                let shadow = Self::artifact(scene, product, S2CLOUDLESS_SHADOW_KEY)?;
                Ok(RawMask::CloudShadow {
                    cloud: read_first_band::<u8>(cloud)?,
                    shadow: read_first_band::<u8>(shadow)?,
                })
            }
            MaskProduct::Fmask => Ok(RawMask::Classification(read_first_band::<u8>(
                Self::artifact(scene, product, FMASK_KEY)?,
            )?)),
            MaskProduct::Scl => Ok(RawMask::Classification(read_first_band::<u8>(
                Self::artifact(scene, product, SCL_KEY)?,
            )?)),
            MaskProduct::None => Err(CloudlessError::Config(
                "mask product none has no artifact to load".to_string(),
            )),
        }
    }
}

/// Write all planes of `mosaic` as one multi-band u16 GeoTIFF
pub fn write_geotiff<P: AsRef<Path>>(output_path: P, mosaic: &MosaicResult) -> CloudlessResult<()> {
    let output_path = output_path.as_ref();
    log::info!("Saving mosaic as GeoTIFF: {}", output_path.display());

    let mut partial = output_path.as_os_str().to_os_string();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let planes: Vec<_> = mosaic.bands.iter().chain(mosaic.recentness.iter()).collect();
    let (height, width) = mosaic.grid.shape();
    {
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<u16, _>(
            &partial,
            width as isize,
            height as isize,
            planes.len() as isize,
        )?;
        dataset.set_geo_transform(&mosaic.grid.geo_transform.to_gdal())?;
        dataset.set_spatial_ref(&SpatialRef::from_epsg(mosaic.grid.epsg)?)?;

        for (index, plane) in planes.iter().enumerate() {
            mosaic.grid.ensure_shape(plane.data.dim(), &format!("plane {}", plane.name))?;
            let mut rasterband = dataset.rasterband(index as isize + 1)?;
            let flat: Vec<u16> = plane.data.iter().copied().collect();
            rasterband.write((0, 0), (width, height), &Buffer::new((width, height), flat))?;
            rasterband.set_description(&plane.name)?;
            if index < mosaic.bands.len() {
                rasterband.set_no_data_value(Some(f64::from(mosaic.nodata)))?;
            }
        }
        dataset.set_metadata_item("TIFFTAG_DATETIME", &mosaic.target_date.format("%Y:%m:%d 00:00:00").to_string(), "")?;
    }

    std::fs::rename(&partial, output_path)?;
    Ok(())
}
