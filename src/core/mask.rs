use crate::io::raster::{MaskSource, RawMask};
use crate::types::{CloudlessError, CloudlessResult, MaskProduct, SceneRecord};
use ndarray::{Array2, ArrayView2, Zip};

/// Fmask classes accepted as clear: land (1) and water (5)
pub const FMASK_VALID_CLASSES: [u8; 2] = [1, 5];

/// SCL classes accepted as clear: vegetation, not vegetated, water, unclassified
pub const SCL_VALID_CLASSES: [u8; 4] = [4, 5, 6, 7];

/// Per-pixel validity aligned with one scene grid
#[derive(Debug, Clone, PartialEq)]
pub struct MaskRaster {
    valid: Array2<bool>,
}

impl MaskRaster {
    pub fn from_valid(valid: Array2<bool>) -> Self {
        Self { valid }
    }

    /// Synthetic mask with every pixel valid
    pub fn all_valid(shape: (usize, usize)) -> Self {
        Self::from_valid(Array2::from_elem(shape, true))
    }

    pub fn shape(&self) -> (usize, usize) {
        self.valid.dim()
    }

    pub fn view(&self) -> ArrayView2<'_, bool> {
        self.valid.view()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.valid.iter().any(|v| *v)
    }
}

fn classes_valid(classes: &Array2<u8>, accepted: &[u8]) -> Array2<bool> {
    classes.mapv(|c| accepted.contains(&c))
}

/// Reduce a raw mask artifact of `product` to validity
pub fn interpret_mask(product: MaskProduct, raw: &RawMask) -> CloudlessResult<MaskRaster> {
    let valid = match (product, raw) {
        (MaskProduct::S2cloudless, RawMask::CloudShadow { cloud, shadow }) => {
            if cloud.dim() != shadow.dim() {
                return Err(CloudlessError::GridMismatch(format!(
                    "cloud layer {:?} and shadow layer {:?} differ in shape",
                    cloud.dim(),
                    shadow.dim()
                )));
            }
            let mut valid = Array2::from_elem(cloud.dim(), false);
            Zip::from(&mut valid)
                .and(cloud)
                .and(shadow)
                .for_each(|v, &c, &s| *v = c == 0 && s == 0);
            valid
        }
        (MaskProduct::Fmask, RawMask::Classification(classes)) => {
            classes_valid(classes, &FMASK_VALID_CLASSES)
        }
        (MaskProduct::Scl, RawMask::Classification(classes)) => {
            classes_valid(classes, &SCL_VALID_CLASSES)
        }
        (MaskProduct::None, raw) => Array2::from_elem(raw.shape(), true),
        (product, _) => {
            return Err(CloudlessError::RasterRead(format!(
                "mask artifact layout does not match product {}",
                product
            )))
        }
    };
    Ok(MaskRaster::from_valid(valid))
}

/// Resolves the validity mask of one candidate on demand
pub struct MaskResolver<'a> {
    source: &'a dyn MaskSource,
}

impl<'a> MaskResolver<'a> {
    pub fn new(source: &'a dyn MaskSource) -> Self {
        Self { source }
    }

    /// Load and interpret the mask of `product` for `scene`.
    ///
    /// `MaskProduct::None` never touches the source and yields an all-valid
    /// mask over the scene grid. Missing artifacts surface as `MaskNotFound`.
    pub fn resolve(&self, scene: &SceneRecord, product: MaskProduct) -> CloudlessResult<MaskRaster> {
        if product == MaskProduct::None {
            return Ok(MaskRaster::all_valid(scene.grid.shape()));
        }

        let raw = self.source.load_mask(scene, product)?;
        scene
            .grid
            .ensure_shape(raw.shape(), &format!("{} mask of scene {}", product, scene.id))?;
        let mask = interpret_mask(product, &raw)?;

        log::debug!(
            "Resolved {} mask for {}: {}/{} valid pixels",
            product,
            scene.id,
            mask.valid_count(),
            scene.grid.pixel_count()
        );
        Ok(mask)
    }
}
