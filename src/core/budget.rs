use crate::config::RecentnessMode;
use crate::core::compositor::{CompositeAccumulator, CompositeOutcome, Rank};
use crate::types::{BandImage, GridSpec, MaskProduct, Reflectance, NODATA};
use chrono::NaiveDate;
use ndarray::Array2;
use serde::Serialize;

/// One named output plane of a finished mosaic
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicBand {
    pub name: String,
    pub data: BandImage,
}

/// Finalized mosaic, ready for the output writer
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicResult {
    pub target_date: NaiveDate,
    pub product: MaskProduct,
    pub grid: GridSpec,
    pub nodata: Reflectance,
    pub bands: Vec<MosaicBand>,
    /// `recentness` (single) or `<band>_recentness` (per band) planes
    pub recentness: Vec<MosaicBand>,
    pub recentness_mode: RecentnessMode,
    pub unfilled: Vec<(String, usize)>,
    /// Candidate scene ids in rank order (index 0 = rank 1)
    pub candidates: Vec<String>,
    /// Candidate loop ended on a resource budget
    pub truncated: bool,
}

impl MosaicResult {
    pub fn band(&self, name: &str) -> Option<&BandImage> {
        self.bands.iter().find(|b| b.name == name).map(|b| &b.data)
    }

    pub fn total_unfilled(&self) -> usize {
        self.unfilled.iter().map(|(_, n)| n).sum()
    }
}

/// Unfilled pixels of one band
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandUnfilled {
    pub band: String,
    pub unfilled: usize,
    /// How far over the cutoff, 0 if within budget
    pub excess: usize,
}

/// Per-band unfilled counts measured against the cutoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    pub cutoff: usize,
    pub bands: Vec<BandUnfilled>,
}

impl BudgetReport {
    pub fn failing_bands(&self) -> impl Iterator<Item = &BandUnfilled> {
        self.bands.iter().filter(|b| b.excess > 0)
    }

    pub fn within_budget(&self) -> bool {
        self.failing_bands().next().is_none()
    }

    pub fn max_unfilled(&self) -> usize {
        self.bands.iter().map(|b| b.unfilled).max().unwrap_or(0)
    }
}

/// Mosaic turned down by the budget gate
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetRejection {
    pub target_date: NaiveDate,
    pub product: MaskProduct,
    pub report: BudgetReport,
    pub truncated: bool,
}

/// Outcome of the budget gate
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetVerdict {
    Accepted(MosaicResult),
    Rejected(BudgetRejection),
}

/// Policy gate on the number of pixels left unfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodataBudgetEvaluator {
    cutoff: usize,
}

impl NodataBudgetEvaluator {
    /// `cutoff` is the maximum tolerated unfilled pixel count per band
    pub fn new(cutoff: usize) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> usize {
        self.cutoff
    }

    /// Count unfilled pixels per band without consuming the accumulator
    pub fn inspect(&self, accumulator: &CompositeAccumulator) -> BudgetReport {
        let bands = accumulator
            .unfilled_counts()
            .into_iter()
            .map(|(band, unfilled)| BandUnfilled {
                band,
                unfilled,
                excess: unfilled.saturating_sub(self.cutoff),
            })
            .collect();
        BudgetReport {
            cutoff: self.cutoff,
            bands,
        }
    }

    /// Accept the composite as a `MosaicResult` or reject it with diagnostics.
    /// Pixel contents pass through unchanged.
    pub fn evaluate(&self, outcome: CompositeOutcome, target_date: NaiveDate, product: MaskProduct) -> BudgetVerdict {
        let report = self.inspect(&outcome.accumulator);
        let truncated = outcome.stop_reason.is_truncated();

        if !report.within_budget() {
            for band in report.failing_bands() {
                log::warn!(
                    "Band {} of {} mosaic for {} has {} unfilled pixels ({} over cutoff {})",
                    band.band,
                    product,
                    target_date,
                    band.unfilled,
                    band.excess,
                    self.cutoff
                );
            }
            return BudgetVerdict::Rejected(BudgetRejection {
                target_date,
                product,
                report,
                truncated,
            });
        }

        log::info!(
            "Mosaic for {} ({}) accepted: at most {} unfilled pixels per band (cutoff {})",
            target_date,
            product,
            report.max_unfilled(),
            self.cutoff
        );
        let candidates = outcome.ranked_scene_ids();
        let parts = outcome.accumulator.into_parts();
        let recentness = name_recentness(parts.recentness_mode, &parts.band_names, parts.recentness);
        let bands = parts
            .band_names
            .into_iter()
            .zip(parts.data)
            .map(|(name, data)| MosaicBand { name, data })
            .collect();
        let unfilled = report.bands.into_iter().map(|b| (b.band, b.unfilled)).collect();

        BudgetVerdict::Accepted(MosaicResult {
            target_date,
            product,
            grid: parts.grid,
            nodata: NODATA,
            bands,
            recentness,
            recentness_mode: parts.recentness_mode,
            unfilled,
            candidates,
            truncated,
        })
    }
}

fn name_recentness(mode: RecentnessMode, band_names: &[String], planes: Vec<Array2<Rank>>) -> Vec<MosaicBand> {
    match mode {
        RecentnessMode::Off => Vec::new(),
        RecentnessMode::Single => planes
            .into_iter()
            .map(|data| MosaicBand {
                name: "recentness".to_string(),
                data,
            })
            .collect(),
        RecentnessMode::PerBand => band_names
            .iter()
            .zip(planes)
            .map(|(band, data)| MosaicBand {
                name: format!("{}_recentness", band),
                data,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compositor::{CandidateLayers, StopReason};
    use crate::core::mask::MaskRaster;
    use crate::types::GeoTransform;
    use ndarray::array;

    fn grid() -> GridSpec {
        GridSpec {
            tile_id: "35VLG".to_string(),
            width: 2,
            height: 2,
            epsg: 32635,
            geo_transform: GeoTransform::from_gdal([0.0, 10.0, 0.0, 0.0, 0.0, -10.0]),
        }
    }

    fn outcome(mask: Array2<bool>, mode: RecentnessMode) -> CompositeOutcome {
        let mut accumulator =
            CompositeAccumulator::new(grid(), vec!["B04".to_string(), "B08".to_string()], mode);
        accumulator
            .apply(
                1,
                &CandidateLayers {
                    scene_id: "S2A_1".to_string(),
                    mask: MaskRaster::from_valid(mask),
                    bands: vec![Array2::from_elem((2, 2), 900), Array2::from_elem((2, 2), 3000)],
                    nodata: 0,
                    check_nodata: true,
                },
            )
            .unwrap();
        CompositeOutcome {
            accumulator,
            contributions: Vec::new(),
            candidate_count: 1,
            stop_reason: StopReason::Exhausted,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 6, 30).unwrap()
    }

    #[test]
    fn test_single_unfilled_pixel_rejected_at_zero_cutoff() {
        let outcome = outcome(array![[true, true], [true, false]], RecentnessMode::Single);
        let verdict = NodataBudgetEvaluator::new(0).evaluate(outcome, date(), MaskProduct::S2cloudless);
        match verdict {
            BudgetVerdict::Rejected(rejection) => {
                assert_eq!(rejection.report.cutoff, 0);
                assert_eq!(rejection.report.bands[0].unfilled, 1);
                assert_eq!(rejection.report.bands[0].excess, 1);
                assert_eq!(rejection.report.failing_bands().count(), 2);
                assert!(!rejection.truncated);
            }
            BudgetVerdict::Accepted(_) => panic!("mosaic with an unfilled pixel accepted at cutoff 0"),
        }
    }

    #[test]
    fn test_within_cutoff_accepted_unchanged() {
        let outcome = outcome(array![[true, true], [true, false]], RecentnessMode::PerBand);
        let expected_b04 = outcome.accumulator.band("B04").unwrap().clone();
        let report = NodataBudgetEvaluator::new(1).inspect(&outcome.accumulator);
        assert!(report.within_budget());

        let verdict = NodataBudgetEvaluator::new(1).evaluate(outcome, date(), MaskProduct::Fmask);
        let mosaic = match verdict {
            BudgetVerdict::Accepted(mosaic) => mosaic,
            BudgetVerdict::Rejected(r) => panic!("unexpected rejection: {:?}", r),
        };
        assert_eq!(mosaic.band("B04").unwrap(), &expected_b04);
        assert_eq!(mosaic.band("B04").unwrap()[[1, 1]], NODATA);
        assert_eq!(mosaic.total_unfilled(), 2);
        let names: Vec<&str> = mosaic.recentness.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["B04_recentness", "B08_recentness"]);
    }

    #[test]
    fn test_single_recentness_named_once() {
        let outcome = outcome(Array2::from_elem((2, 2), true), RecentnessMode::Single);
        let verdict = NodataBudgetEvaluator::new(0).evaluate(outcome, date(), MaskProduct::Scl);
        let BudgetVerdict::Accepted(mosaic) = verdict else {
            panic!("complete mosaic rejected");
        };
        assert_eq!(mosaic.recentness.len(), 1);
        assert_eq!(mosaic.recentness[0].name, "recentness");
        assert_eq!(mosaic.recentness[0].data, Array2::from_elem((2, 2), 1u16));
    }
}
