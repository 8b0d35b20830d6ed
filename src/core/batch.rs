//! Batch driver: one independent mosaic unit per (product, date)

use crate::config::MosaicConfig;
use crate::core::budget::{BudgetVerdict, NodataBudgetEvaluator};
use crate::core::compositor::{CompositorParams, TemporalCompositor};
use crate::core::selector::{SceneCandidateSelector, SelectionParams};
use crate::io::catalog::{RegistrationGate, SceneCatalog};
use crate::io::raster::{MaskSource, RasterSource};
use crate::io::writer::{describe, Destination, ObjectStore, OutputWriter};
use crate::types::{CloudlessError, CloudlessResult, MaskProduct, SceneRecord};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

/// One mosaic to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MosaicUnit {
    pub date: NaiveDate,
    pub product: MaskProduct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Written,
    RejectedByBudget,
    FailedIo,
    SkippedNoCandidates,
    /// Grid mismatch, mask abort, raster read or catalog failure
    Aborted,
}

/// Outcome of one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub date: NaiveDate,
    pub product: MaskProduct,
    /// MGRS tile of the mosaic; absent when no candidate was found
    pub tile: Option<String>,
    pub status: UnitStatus,
    pub candidates: usize,
    pub unfilled: BTreeMap<String, usize>,
    pub uri: Option<String>,
    pub registered: bool,
    pub truncated: bool,
    pub detail: Option<String>,
}

impl UnitReport {
    fn new(unit: MosaicUnit, tile: Option<&str>, status: UnitStatus) -> Self {
        Self {
            date: unit.date,
            product: unit.product,
            tile: tile.map(str::to_string),
            status,
            candidates: 0,
            unfilled: BTreeMap::new(),
            uri: None,
            registered: false,
            truncated: false,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Per-unit results of a batch run, in unit order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub run_date: NaiveDate,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// First report for (`date`, `product`), whatever its tile
    pub fn unit(&self, date: NaiveDate, product: MaskProduct) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.date == date && u.product == product)
    }

    pub fn unit_for_tile(&self, date: NaiveDate, product: MaskProduct, tile: &str) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.date == date && u.product == product && u.tile.as_deref() == Some(tile))
    }

    pub fn to_json(&self) -> CloudlessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Expand configured products and dates into units, products outermost.
/// Dates equal after resolving `today` yield a single unit.
pub fn plan_units(config: &MosaicConfig, today: NaiveDate) -> Vec<MosaicUnit> {
    let mut units = Vec::new();
    for product in &config.products {
        for spec in &config.dates {
            let unit = MosaicUnit {
                date: spec.resolve(today),
                product: *product,
            };
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
    }
    units
}

/// Split ordered candidates per MGRS tile, keeping their order within a tile.
/// Tiles come out sorted by id.
pub fn group_by_tile(candidates: Vec<SceneRecord>) -> Vec<(String, Vec<SceneRecord>)> {
    let mut tiles: BTreeMap<String, Vec<SceneRecord>> = BTreeMap::new();
    for scene in candidates {
        tiles.entry(scene.grid.tile_id.clone()).or_default().push(scene);
    }
    tiles.into_iter().collect()
}

/// Runs every unit of a configuration against shared collaborators
pub struct BatchRunner<'a> {
    config: MosaicConfig,
    catalog: &'a dyn SceneCatalog,
    rasters: &'a dyn RasterSource,
    masks: &'a dyn MaskSource,
    object_store: Option<&'a dyn ObjectStore>,
    gate: RegistrationGate,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        config: MosaicConfig,
        catalog: &'a dyn SceneCatalog,
        rasters: &'a dyn RasterSource,
        masks: &'a dyn MaskSource,
    ) -> CloudlessResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            rasters,
            masks,
            object_store: None,
            gate: RegistrationGate::new(),
        })
    }

    pub fn with_object_store(mut self, store: &'a dyn ObjectStore) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn config(&self) -> &MosaicConfig {
        &self.config
    }

    /// Run all units on a dedicated pool of `workers` threads.
    /// A failing unit is reported and never affects its siblings.
    pub fn run(&self, today: NaiveDate) -> CloudlessResult<BatchReport> {
        let units = plan_units(&self.config, today);
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(workers) = self.config.workers {
            builder = builder.num_threads(workers);
        }
        let pool = builder
            .build()
            .map_err(|e| CloudlessError::Config(format!("Failed to build worker pool: {}", e)))?;

        log::info!(
            "🚀 Starting batch of {} mosaic units on {} workers",
            units.len(),
            pool.current_num_threads()
        );
        let started = Instant::now();
        let reports: Vec<UnitReport> =
            pool.install(|| units.par_iter().flat_map_iter(|unit| self.run_unit(*unit)).collect());

        let report = BatchReport {
            run_date: today,
            units: reports,
        };
        log::info!(
            "Batch finished in {:.2}s: {} written, {} rejected, {} skipped, {} failed, {} aborted",
            started.elapsed().as_secs_f64(),
            report.count(UnitStatus::Written),
            report.count(UnitStatus::RejectedByBudget),
            report.count(UnitStatus::SkippedNoCandidates),
            report.count(UnitStatus::FailedIo),
            report.count(UnitStatus::Aborted)
        );
        Ok(report)
    }

    /// Select candidates for one unit and build one mosaic per tile they cover
    pub fn run_unit(&self, unit: MosaicUnit) -> Vec<UnitReport> {
        log::info!("Processing unit {} / {}", unit.date, unit.product);

        let params = SelectionParams::from_config(&self.config, unit.date);
        let candidates = match SceneCandidateSelector::new(self.catalog).select(&params) {
            Ok(candidates) => candidates,
            Err(e) => {
                log::error!("Candidate selection for {} / {} failed: {}", unit.date, unit.product, e);
                return vec![UnitReport::new(unit, None, UnitStatus::Aborted).with_detail(e.to_string())];
            }
        };
        if candidates.is_empty() {
            log::warn!("No candidates for {} / {}", unit.date, unit.product);
            return vec![UnitReport::new(unit, None, UnitStatus::SkippedNoCandidates)];
        }

        group_by_tile(candidates)
            .into_par_iter()
            .map(|(tile, candidates)| self.run_tile(unit, &tile, &candidates))
            .collect()
    }

    /// Composite, evaluate and write the mosaic of one tile
    fn run_tile(&self, unit: MosaicUnit, tile: &str, candidates: &[SceneRecord]) -> UnitReport {
        let Some(first) = candidates.first() else {
            return UnitReport::new(unit, Some(tile), UnitStatus::SkippedNoCandidates);
        };
        let grid = first.grid.clone();

        let compositor = TemporalCompositor::new(
            self.rasters,
            self.masks,
            CompositorParams::from_config(&self.config),
        );
        let outcome = match compositor.composite(&grid, &self.config.output_bands, unit.product, candidates) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Compositing {} / {} / {} aborted: {}", unit.date, unit.product, tile, e);
                let mut report = UnitReport::new(unit, Some(tile), UnitStatus::Aborted).with_detail(e.to_string());
                report.candidates = candidates.len();
                return report;
            }
        };

        let evaluator = NodataBudgetEvaluator::new(self.config.nodata_cutoff);
        let mosaic = match evaluator.evaluate(outcome, unit.date, unit.product) {
            BudgetVerdict::Accepted(mosaic) => mosaic,
            BudgetVerdict::Rejected(rejection) => {
                let failing: Vec<String> = rejection
                    .report
                    .failing_bands()
                    .map(|b| format!("{} (+{})", b.band, b.excess))
                    .collect();
                let mut report = UnitReport::new(unit, Some(tile), UnitStatus::RejectedByBudget).with_detail(format!(
                    "unfilled pixels over cutoff {} in {}",
                    rejection.report.cutoff,
                    failing.join(", ")
                ));
                report.candidates = candidates.len();
                report.truncated = rejection.truncated;
                report.unfilled = rejection.report.bands.into_iter().map(|b| (b.band, b.unfilled)).collect();
                return report;
            }
        };

        let mut report = UnitReport::new(unit, Some(tile), UnitStatus::Written);
        report.candidates = candidates.len();
        report.truncated = mosaic.truncated;
        report.unfilled = mosaic.unfilled.iter().cloned().collect();

        let destination = Destination::for_mosaic(&self.config, &mosaic);
        let mut writer = OutputWriter::new(self.config.output_format);
        if let Some(store) = self.object_store {
            writer = writer.with_object_store(store);
        }
        let written = match writer.write(&mosaic, &destination) {
            Ok(written) => written,
            Err(e) => {
                log::error!("Writing {} failed: {}", destination.uri(), e);
                report.status = UnitStatus::FailedIo;
                report.detail = Some(e.to_string());
                return report;
            }
        };
        report.uri = Some(written.uri.clone());

        if self.config.register {
            let descriptor = describe(&mosaic, &written);
            match self
                .gate
                .register_once(self.catalog, &destination.registration_key(), &descriptor)
            {
                Ok(registered) => report.registered = registered,
                Err(e) => {
                    log::error!("Registering {} failed: {}", written.uri, e);
                    report.status = UnitStatus::FailedIo;
                    report.detail = Some(format!("registration failed: {}", e));
                }
            }
        }
        report
    }
}
