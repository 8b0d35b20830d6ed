//! cloudless: cloud-free temporal compositing of Sentinel-2 imagery
//!
//! For each target date and mask product the engine selects the scenes of a
//! look-back window, applies them newest first so every pixel keeps the most
//! recent clear observation, rejects mosaics with too many unfilled pixels,
//! and writes the survivors (optionally registering them in the catalog).

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{DateSpec, MissingMaskPolicy, MosaicConfig, OutputFormat, RecentnessMode};
pub use types::{
    BandImage, CloudlessError, CloudlessResult, GeoTransform, GridSpec, MaskProduct, MosaicDescriptor,
    SceneRecord, NODATA,
};

pub use crate::core::{BatchReport, BatchRunner, MosaicResult, TemporalCompositor, UnitStatus};
pub use io::{InMemoryCatalog, JsonCatalog, MaskSource, RasterSource, SceneCatalog};

/// Run every unit of `config` against local collaborators, resolving `today`
/// from the system clock
pub fn run_batch(
    config: MosaicConfig,
    catalog: &dyn SceneCatalog,
    rasters: &dyn RasterSource,
    masks: &dyn MaskSource,
) -> CloudlessResult<BatchReport> {
    let today = chrono::Utc::now().date_naive();
    BatchRunner::new(config, catalog, rasters, masks)?.run(today)
}
