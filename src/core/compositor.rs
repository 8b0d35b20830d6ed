//! Temporal compositing engine
//!
//! Candidates are applied newest first onto a `CompositeAccumulator`. Each
//! pixel of each band takes the value of the first candidate whose mask marks
//! it valid; later (older) candidates only ever touch pixels that are still
//! empty. Application of one candidate is data-parallel over rows, while the
//! candidate sequence itself stays strictly ordered.

use crate::config::{MissingMaskPolicy, MosaicConfig, RecentnessMode};
use crate::core::mask::{MaskRaster, MaskResolver};
use crate::io::raster::{MaskSource, RasterSource};
use crate::types::{
    BandImage, CloudlessError, CloudlessResult, GridSpec, MaskProduct, Reflectance, SceneRecord,
    NODATA,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Zip};
use std::time::{Duration, Instant};

/// Recentness rank recorded per pixel (1-based, 0 = empty)
pub type Rank = u16;

macro_rules! for_each_row {
    ($zip:expr, $body:expr) => {{
        #[cfg(feature = "parallel")]
        $zip.par_for_each($body);
        #[cfg(not(feature = "parallel"))]
        $zip.for_each($body);
    }};
}

/// Compositor behaviour switches
#[derive(Debug, Clone, PartialEq)]
pub struct CompositorParams {
    pub recentness: RecentnessMode,
    pub missing_mask: MissingMaskPolicy,
    /// Source pixels equal to the scene nodata value are not observations
    pub check_source_nodata: bool,
    /// Load candidate N+1 while candidate N is applied
    pub prefetch: bool,
    pub max_candidates: Option<usize>,
    pub time_limit: Option<Duration>,
}

impl Default for CompositorParams {
    fn default() -> Self {
        Self {
            recentness: RecentnessMode::Single,
            missing_mask: MissingMaskPolicy::Skip,
            check_source_nodata: true,
            prefetch: true,
            max_candidates: None,
            time_limit: None,
        }
    }
}

impl CompositorParams {
    pub fn from_config(config: &MosaicConfig) -> Self {
        Self {
            recentness: config.recentness,
            missing_mask: config.missing_mask,
            check_source_nodata: config.check_source_nodata,
            prefetch: config.prefetch,
            max_candidates: config.max_candidates,
            time_limit: config.unit_timeout(),
        }
    }
}

/// Mutable state of one in-progress mosaic
#[derive(Debug, Clone)]
pub struct CompositeAccumulator {
    grid: GridSpec,
    band_names: Vec<String>,
    data: Vec<BandImage>,
    filled: Vec<Array2<bool>>,
    unfilled: Vec<usize>,
    recentness_mode: RecentnessMode,
    recentness: Vec<Array2<Rank>>,
}

impl CompositeAccumulator {
    pub fn new(grid: GridSpec, band_names: Vec<String>, recentness_mode: RecentnessMode) -> Self {
        let shape = grid.shape();
        let band_count = band_names.len();
        let recentness_count = match recentness_mode {
            RecentnessMode::Off => 0,
            RecentnessMode::Single => band_count.min(1),
            RecentnessMode::PerBand => band_count,
        };

        Self {
            data: (0..band_count).map(|_| Array2::from_elem(shape, NODATA)).collect(),
            filled: (0..band_count).map(|_| Array2::from_elem(shape, false)).collect(),
            unfilled: vec![grid.pixel_count(); band_count],
            recentness: (0..recentness_count).map(|_| Array2::zeros(shape)).collect(),
            recentness_mode,
            band_names,
            grid,
        }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn band_names(&self) -> &[String] {
        &self.band_names
    }

    pub fn recentness_mode(&self) -> RecentnessMode {
        self.recentness_mode
    }

    fn band_index(&self, band: &str) -> Option<usize> {
        self.band_names.iter().position(|b| b == band)
    }

    pub fn band(&self, band: &str) -> Option<&BandImage> {
        self.band_index(band).map(|i| &self.data[i])
    }

    pub fn filled(&self, band: &str) -> Option<&Array2<bool>> {
        self.band_index(band).map(|i| &self.filled[i])
    }

    /// Recentness buffers: empty, one tracking the first band, or one per band
    pub fn recentness(&self) -> &[Array2<Rank>] {
        &self.recentness
    }

    /// Unfilled pixel count per band, in output band order
    pub fn unfilled_counts(&self) -> Vec<(String, usize)> {
        self.band_names
            .iter()
            .cloned()
            .zip(self.unfilled.iter().copied())
            .collect()
    }

    /// Unfilled (pixel, band) slots across all bands
    pub fn remaining_unfilled(&self) -> usize {
        self.unfilled.iter().sum()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_unfilled() == 0
    }

    /// Merge one candidate into the accumulator under rank `rank`.
    ///
    /// Only pixels that are valid in the mask and still empty in a band are
    /// written; filled pixels are never touched. Returns the number of newly
    /// filled pixels per band.
    pub fn apply(&mut self, rank: usize, candidate: &CandidateLayers) -> CloudlessResult<Vec<usize>> {
        if candidate.bands.len() != self.data.len() {
            return Err(CloudlessError::RasterRead(format!(
                "candidate {} carries {} bands, accumulator expects {}",
                candidate.scene_id,
                candidate.bands.len(),
                self.data.len()
            )));
        }
        let rank = Rank::try_from(rank).map_err(|_| {
            CloudlessError::Config(format!("candidate rank {} exceeds recentness range", rank))
        })?;
        self.grid.ensure_shape(candidate.mask.shape(), "candidate mask")?;
        for source in &candidate.bands {
            self.grid.ensure_shape(source.dim(), "candidate band")?;
        }

        let rule = FillRule {
            rank,
            nodata: candidate.nodata,
            check_nodata: candidate.check_nodata,
        };
        let mode = self.recentness_mode;
        let mut newly_filled = Vec::with_capacity(self.data.len());

        for (index, source) in candidate.bands.iter().enumerate() {
            let tracker = match mode {
                RecentnessMode::Off => None,
                RecentnessMode::Single if index == 0 => self.recentness.get_mut(0),
                RecentnessMode::Single => None,
                RecentnessMode::PerBand => self.recentness.get_mut(index),
            };
            let count = fill_band(
                &mut self.data[index],
                &mut self.filled[index],
                tracker,
                &candidate.mask,
                source,
                rule,
            );
            self.unfilled[index] -= count;
            newly_filled.push(count);
        }
        Ok(newly_filled)
    }

    pub(crate) fn into_parts(self) -> AccumulatorParts {
        AccumulatorParts {
            grid: self.grid,
            band_names: self.band_names,
            data: self.data,
            unfilled: self.unfilled,
            recentness_mode: self.recentness_mode,
            recentness: self.recentness,
        }
    }
}

pub(crate) struct AccumulatorParts {
    pub grid: GridSpec,
    pub band_names: Vec<String>,
    pub data: Vec<BandImage>,
    pub unfilled: Vec<usize>,
    pub recentness_mode: RecentnessMode,
    pub recentness: Vec<Array2<Rank>>,
}

#[derive(Debug, Clone, Copy)]
struct FillRule {
    rank: Rank,
    nodata: Reflectance,
    check_nodata: bool,
}

fn fill_band(
    data: &mut BandImage,
    filled: &mut Array2<bool>,
    recentness: Option<&mut Array2<Rank>>,
    mask: &MaskRaster,
    source: &BandImage,
    rule: FillRule,
) -> usize {
    let mut row_counts = Array1::<usize>::zeros(data.nrows());
    let mask = mask.view();
    match recentness {
        Some(recentness) => {
            let zip = Zip::from(&mut row_counts)
                .and(data.rows_mut())
                .and(filled.rows_mut())
                .and(recentness.rows_mut())
                .and(mask.rows())
                .and(source.rows());
            for_each_row!(zip, |count, data, filled, recentness, mask, source| {
                *count = fill_row(data, filled, Some(recentness), mask, source, rule);
            });
        }
        None => {
            let zip = Zip::from(&mut row_counts)
                .and(data.rows_mut())
                .and(filled.rows_mut())
                .and(mask.rows())
                .and(source.rows());
            for_each_row!(zip, |count, data, filled, mask, source| {
                *count = fill_row(data, filled, None, mask, source, rule);
            });
        }
    }
    row_counts.sum()
}

fn fill_row(
    mut data: ArrayViewMut1<'_, Reflectance>,
    mut filled: ArrayViewMut1<'_, bool>,
    mut recentness: Option<ArrayViewMut1<'_, Rank>>,
    mask: ArrayView1<'_, bool>,
    source: ArrayView1<'_, Reflectance>,
    rule: FillRule,
) -> usize {
    let mut count = 0;
    for col in 0..data.len() {
        if filled[col] || !mask[col] {
            continue;
        }
        let value = source[col];
        if rule.check_nodata && value == rule.nodata {
            continue;
        }
        data[col] = value;
        filled[col] = true;
        if let Some(recentness) = recentness.as_mut() {
            recentness[col] = rule.rank;
        }
        count += 1;
    }
    count
}

/// Pixel payload of one candidate, loaded just before it is applied
#[derive(Debug, Clone)]
pub struct CandidateLayers {
    pub scene_id: String,
    pub mask: MaskRaster,
    /// One buffer per output band, in accumulator band order
    pub bands: Vec<BandImage>,
    pub nodata: Reflectance,
    pub check_nodata: bool,
}

/// What one candidate did to the accumulator
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateContribution {
    pub rank: usize,
    pub scene_id: String,
    pub newly_filled: Vec<usize>, // per band
    pub skipped: bool,
}

/// Why the candidate loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every candidate was considered
    Exhausted,
    /// No unfilled pixels remained
    Complete,
    /// `max_candidates` reached
    CandidateBudget,
    /// Wall-clock limit reached
    TimeBudget,
}

impl StopReason {
    /// Whether candidates were left unconsidered because of a resource budget
    pub fn is_truncated(&self) -> bool {
        matches!(self, StopReason::CandidateBudget | StopReason::TimeBudget)
    }
}

/// Result of running the candidate loop for one mosaic
#[derive(Debug, Clone)]
pub struct CompositeOutcome {
    pub accumulator: CompositeAccumulator,
    pub contributions: Vec<CandidateContribution>,
    pub candidate_count: usize,
    pub stop_reason: StopReason,
}

impl CompositeOutcome {
    /// Scene ids in rank order (index 0 = rank 1)
    pub fn ranked_scene_ids(&self) -> Vec<String> {
        self.contributions.iter().map(|c| c.scene_id.clone()).collect()
    }
}

type Loaded = CloudlessResult<Option<CandidateLayers>>;

/// Folds ordered candidates into a composite
pub struct TemporalCompositor<'a> {
    rasters: &'a dyn RasterSource,
    masks: MaskResolver<'a>,
    params: CompositorParams,
}

impl<'a> TemporalCompositor<'a> {
    pub fn new(rasters: &'a dyn RasterSource, masks: &'a dyn MaskSource, params: CompositorParams) -> Self {
        Self {
            rasters,
            masks: MaskResolver::new(masks),
            params,
        }
    }

    pub fn params(&self) -> &CompositorParams {
        &self.params
    }

    /// Composite `candidates` (already in precedence order) onto `grid`.
    ///
    /// Candidates are never reordered. A candidate on a different grid aborts
    /// the run; a candidate without a mask is skipped or aborts according to
    /// the missing-mask policy.
    pub fn composite(
        &self,
        grid: &GridSpec,
        bands: &[String],
        product: MaskProduct,
        candidates: &[SceneRecord],
    ) -> CloudlessResult<CompositeOutcome> {
        log::info!(
            "Compositing {} candidates onto tile {} ({}x{}), product {}, bands {:?}",
            candidates.len(),
            grid.tile_id,
            grid.width,
            grid.height,
            product,
            bands
        );
        if candidates.len() > usize::from(Rank::MAX) {
            return Err(CloudlessError::Config(format!(
                "{} candidates exceed the recentness rank range",
                candidates.len()
            )));
        }

        let started = Instant::now();
        let mut accumulator = CompositeAccumulator::new(grid.clone(), bands.to_vec(), self.params.recentness);
        let mut contributions = Vec::new();
        let mut stop_reason = StopReason::Exhausted;
        let mut prefetched: Option<Loaded> = None;

        for (index, scene) in candidates.iter().enumerate() {
            if let Some(reason) = self.stop_before(index, started, &accumulator) {
                stop_reason = reason;
                break;
            }
            let rank = index + 1;

            let current = match prefetched.take() {
                Some(loaded) => loaded?,
                None => self.load_candidate(scene, grid, bands, product)?,
            };
            // Never load ahead past the candidate budget
            let within_budget = self.params.max_candidates.map_or(true, |max| index + 1 < max);
            let next_scene = if self.params.prefetch && within_budget {
                candidates.get(index + 1)
            } else {
                None
            };

            let (applied, next) = match next_scene {
                Some(next_scene) => rayon::join(
                    || apply_loaded(&mut accumulator, rank, current.as_ref()),
                    || self.load_candidate(next_scene, grid, bands, product),
                ),
                None => (apply_loaded(&mut accumulator, rank, current.as_ref()), Ok(None)),
            };
            if next_scene.is_some() {
                prefetched = Some(next);
            }

            let newly_filled = applied?;
            let contribution = CandidateContribution {
                rank,
                scene_id: scene.id.clone(),
                skipped: current.is_none(),
                newly_filled,
            };
            log::debug!(
                "Candidate {} ({}) filled {:?}, {} slots remaining",
                rank,
                scene.id,
                contribution.newly_filled,
                accumulator.remaining_unfilled()
            );
            contributions.push(contribution);
        }

        match stop_reason {
            StopReason::CandidateBudget | StopReason::TimeBudget => log::warn!(
                "Compositing of tile {} stopped early ({:?}) after {}/{} candidates",
                grid.tile_id,
                stop_reason,
                contributions.len(),
                candidates.len()
            ),
            _ => log::info!(
                "Compositing finished ({:?}) after {}/{} candidates in {:.2}s, {} slots unfilled",
                stop_reason,
                contributions.len(),
                candidates.len(),
                started.elapsed().as_secs_f64(),
                accumulator.remaining_unfilled()
            ),
        }

        Ok(CompositeOutcome {
            accumulator,
            contributions,
            candidate_count: candidates.len(),
            stop_reason,
        })
    }

    fn stop_before(&self, index: usize, started: Instant, accumulator: &CompositeAccumulator) -> Option<StopReason> {
        if accumulator.is_complete() {
            return Some(StopReason::Complete);
        }
        if self.params.max_candidates.map_or(false, |max| index >= max) {
            return Some(StopReason::CandidateBudget);
        }
        if self.params.time_limit.map_or(false, |limit| started.elapsed() >= limit) {
            return Some(StopReason::TimeBudget);
        }
        None
    }

    /// Load mask and band payload of one candidate.
    ///
    /// Returns `Ok(None)` when the candidate can contribute nothing: its mask
    /// is missing under the skip policy, or no pixel of it is valid.
    pub fn load_candidate(
        &self,
        scene: &SceneRecord,
        grid: &GridSpec,
        bands: &[String],
        product: MaskProduct,
    ) -> Loaded {
        grid.ensure_aligned(&scene.grid, &format!("scene {}", scene.id))?;

        let mask = match self.masks.resolve(scene, product) {
            Ok(mask) => mask,
            Err(CloudlessError::MaskNotFound { scene_id, product })
                if self.params.missing_mask == MissingMaskPolicy::Skip =>
            {
                log::warn!("No {} mask for scene {}, skipping candidate", product, scene_id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if mask.is_empty() {
            log::debug!("Scene {} has no valid pixels under {}, skipping band reads", scene.id, product);
            return Ok(None);
        }

        let mut layers = Vec::with_capacity(bands.len());
        for band in bands {
            let data = self.rasters.read_band(scene, band)?;
            grid.ensure_shape(data.dim(), &format!("band {} of scene {}", band, scene.id))?;
            layers.push(data);
        }

        Ok(Some(CandidateLayers {
            scene_id: scene.id.clone(),
            mask,
            bands: layers,
            nodata: scene.nodata,
            check_nodata: self.params.check_source_nodata,
        }))
    }
}

fn apply_loaded(
    accumulator: &mut CompositeAccumulator,
    rank: usize,
    candidate: Option<&CandidateLayers>,
) -> CloudlessResult<Vec<usize>> {
    match candidate {
        Some(layers) => accumulator.apply(rank, layers),
        None => Ok(vec![0; accumulator.band_names().len()]),
    }
}
