//! Raster and mask source collaborators
//!
//! The compositor pulls pixel payloads through these traits one candidate at
//! a time; implementations decide where the pixels actually live.

use crate::types::{BandImage, CloudlessError, CloudlessResult, MaskProduct, SceneRecord};
use ndarray::Array2;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Reads one band of one scene as a full-tile pixel buffer
pub trait RasterSource: Send + Sync {
    fn read_band(&self, scene: &SceneRecord, band: &str) -> CloudlessResult<BandImage>;
}

/// Mask artifact as produced by the mask-generation process
#[derive(Debug, Clone, PartialEq)]
pub enum RawMask {
    /// Binary cloud and cloud-shadow layers, nonzero = masked
    CloudShadow { cloud: Array2<u8>, shadow: Array2<u8> },
    /// Categorical per-pixel classification (Fmask, SCL)
    Classification(Array2<u8>),
}

impl RawMask {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            RawMask::CloudShadow { cloud, .. } => cloud.dim(),
            RawMask::Classification(classes) => classes.dim(),
        }
    }
}

/// Loads previously generated mask artifacts
pub trait MaskSource: Send + Sync {
    /// Mask of `product` for `scene`, or `MaskNotFound` if it was never generated
    fn load_mask(&self, scene: &SceneRecord, product: MaskProduct) -> CloudlessResult<RawMask>;
}

/// Band buffers keyed by (scene id, band name)
#[derive(Debug, Default)]
pub struct InMemoryRasterSource {
    bands: RwLock<HashMap<(String, String), BandImage>>,
}

impl InMemoryRasterSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, scene_id: &str, band: &str, data: BandImage) {
        self.bands
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((scene_id.to_string(), band.to_string()), data);
    }
}

impl RasterSource for InMemoryRasterSource {
    fn read_band(&self, scene: &SceneRecord, band: &str) -> CloudlessResult<BandImage> {
        let bands = self.bands.read().unwrap_or_else(PoisonError::into_inner);
        bands
            .get(&(scene.id.clone(), band.to_string()))
            .cloned()
            .ok_or_else(|| {
                CloudlessError::RasterRead(format!("no pixels for band {} of scene {}", band, scene.id))
            })
    }
}

/// Mask artifacts keyed by (scene id, mask product)
#[derive(Debug, Default)]
pub struct InMemoryMaskSource {
    masks: RwLock<HashMap<(String, MaskProduct), RawMask>>,
}

impl InMemoryMaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, scene_id: &str, product: MaskProduct, mask: RawMask) {
        self.masks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((scene_id.to_string(), product), mask);
    }
}

impl MaskSource for InMemoryMaskSource {
    fn load_mask(&self, scene: &SceneRecord, product: MaskProduct) -> CloudlessResult<RawMask> {
        let masks = self.masks.read().unwrap_or_else(PoisonError::into_inner);
        masks
            .get(&(scene.id.clone(), product))
            .cloned()
            .ok_or_else(|| CloudlessError::MaskNotFound {
                scene_id: scene.id.clone(),
                product,
            })
    }
}
