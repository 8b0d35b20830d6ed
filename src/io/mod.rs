//! Catalog, raster and output collaborators

pub mod archive;
pub mod catalog;
#[cfg(feature = "gdal")]
pub mod geotiff;
pub mod raster;
pub mod writer;

pub use archive::{decode_mosaic, encode_mosaic};
pub use catalog::{CatalogQuery, InMemoryCatalog, JsonCatalog, Registration, RegistrationGate, SceneCatalog};
#[cfg(feature = "gdal")]
pub use geotiff::{write_geotiff, GdalMaskSource, GdalRasterSource};
pub use raster::{InMemoryMaskSource, InMemoryRasterSource, MaskSource, RasterSource, RawMask};
pub use writer::{describe, Destination, FsObjectStore, ObjectStore, OutputWriter, WrittenMosaic};
