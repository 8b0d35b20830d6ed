//! Core compositing modules

pub mod batch;
pub mod budget;
pub mod compositor;
pub mod mask;
pub mod selector;

// Re-export main types
pub use batch::{plan_units, BatchReport, BatchRunner, MosaicUnit, UnitReport, UnitStatus};
pub use budget::{BudgetReport, BudgetVerdict, MosaicBand, MosaicResult, NodataBudgetEvaluator};
pub use compositor::{
    CandidateLayers, CompositeAccumulator, CompositeOutcome, CompositorParams, StopReason, TemporalCompositor,
};
pub use mask::{interpret_mask, MaskRaster, MaskResolver};
pub use selector::{order_candidates, SceneCandidateSelector, SelectionParams};
