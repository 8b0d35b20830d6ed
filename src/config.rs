//! Mosaic run configuration
//!
//! Loaded from JSON; every field has a default so partial documents are valid.

use crate::types::{CloudlessError, CloudlessResult, MaskProduct};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which recentness bands the compositor emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecentnessRepr", into = "u8")]
pub enum RecentnessMode {
    /// No recentness output
    Off,
    /// One `recentness` band tracking the first output band
    Single,
    /// One `<band>_recentness` band per output band
    PerBand,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecentnessRepr {
    Level(u8),
    Name(String),
}

impl TryFrom<RecentnessRepr> for RecentnessMode {
    type Error = String;

    fn try_from(repr: RecentnessRepr) -> Result<Self, Self::Error> {
        match repr {
            RecentnessRepr::Level(0) => Ok(RecentnessMode::Off),
            RecentnessRepr::Level(1) => Ok(RecentnessMode::Single),
            RecentnessRepr::Level(2) => Ok(RecentnessMode::PerBand),
            RecentnessRepr::Level(n) => Err(format!("recentness must be 0, 1 or 2, got {}", n)),
            RecentnessRepr::Name(name) => match name.as_str() {
                "off" => Ok(RecentnessMode::Off),
                "single" => Ok(RecentnessMode::Single),
                "per_band" => Ok(RecentnessMode::PerBand),
                other => Err(format!("unknown recentness mode: {}", other)),
            },
        }
    }
}

impl From<RecentnessMode> for u8 {
    fn from(mode: RecentnessMode) -> u8 {
        match mode {
            RecentnessMode::Off => 0,
            RecentnessMode::Single => 1,
            RecentnessMode::PerBand => 2,
        }
    }
}

/// Target date of a mosaic, either fixed or resolved at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DateSpec {
    Today,
    Fixed(NaiveDate),
}

impl DateSpec {
    pub fn resolve(&self, today: NaiveDate) -> NaiveDate {
        match self {
            DateSpec::Today => today,
            DateSpec::Fixed(date) => *date,
        }
    }
}

impl TryFrom<String> for DateSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("today") {
            return Ok(DateSpec::Today);
        }
        NaiveDate::parse_from_str(&value, "%Y-%m-%d")
            .map(DateSpec::Fixed)
            .map_err(|e| format!("invalid date '{}': {}", value, e))
    }
}

impl From<DateSpec> for String {
    fn from(spec: DateSpec) -> String {
        match spec {
            DateSpec::Today => "today".to_string(),
            DateSpec::Fixed(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// What to do when a candidate has no mask for the requested product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingMaskPolicy {
    /// Candidate contributes nothing
    Skip,
    /// Whole unit aborts
    Abort,
}

/// Serialization format of written mosaics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Zip container with JSON manifest and raw band planes
    Archive,
    /// Multi-band GeoTIFF (requires the `gdal` feature)
    GeoTiff,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Archive => "cldm",
            OutputFormat::GeoTiff => "tif",
        }
    }
}

/// Longest accepted look-back window (ten years)
pub const MAX_RANGE_DAYS: u32 = 3650;

/// Complete mosaic run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    /// Look-back window in days
    pub range: u32,
    pub recentness: RecentnessMode,
    pub output_bands: Vec<String>,
    /// Maximum unfilled pixels tolerated per band
    pub nodata_cutoff: usize,
    pub min_cloud_threshold: f64,  // percent
    pub max_cloud_threshold: f64,  // percent
    pub products: Vec<MaskProduct>,
    pub dates: Vec<DateSpec>,

    /// Restrict candidates to one MGRS tile
    pub tile: Option<String>,
    /// Worker threads for batch units (None = rayon default)
    pub workers: Option<usize>,
    /// Load the next candidate while the current one is applied
    pub prefetch: bool,
    pub max_candidates: Option<usize>,
    pub unit_timeout_secs: Option<u64>,
    pub missing_mask: MissingMaskPolicy,
    /// Treat source pixels equal to the scene nodata value as invalid
    pub check_source_nodata: bool,

    pub output_dir: PathBuf,
    /// Write to this object-store bucket instead of `output_dir`
    pub output_bucket: Option<String>,
    pub output_format: OutputFormat,
    /// Register written mosaics in the catalog
    pub register: bool,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            range: 30,
            recentness: RecentnessMode::Single,
            output_bands: vec![
                "B02".to_string(),
                "B03".to_string(),
                "B04".to_string(),
                "B08".to_string(),
            ],
            nodata_cutoff: 0,
            min_cloud_threshold: 0.0,
            max_cloud_threshold: 100.0,
            products: vec![MaskProduct::S2cloudless],
            dates: vec![DateSpec::Today],

            tile: None,
            workers: None,
            prefetch: true,
            max_candidates: None,
            unit_timeout_secs: None,
            missing_mask: MissingMaskPolicy::Skip,
            check_source_nodata: true,

            output_dir: PathBuf::from("mosaics"),
            output_bucket: None,
            output_format: OutputFormat::Archive,
            register: true,
        }
    }
}

impl MosaicConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> CloudlessResult<Self> {
        let config: MosaicConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CloudlessResult<Self> {
        log::info!("Loading mosaic configuration from {}", path.as_ref().display());
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> CloudlessResult<()> {
        let in_percent = |v: f64| (0.0..=100.0).contains(&v);
        if !in_percent(self.min_cloud_threshold) || !in_percent(self.max_cloud_threshold) {
            return Err(CloudlessError::Config(format!(
                "cloud thresholds must lie in [0, 100], got [{}, {}]",
                self.min_cloud_threshold, self.max_cloud_threshold
            )));
        }
        if self.min_cloud_threshold > self.max_cloud_threshold {
            return Err(CloudlessError::Config(format!(
                "min_cloud_threshold {} exceeds max_cloud_threshold {}",
                self.min_cloud_threshold, self.max_cloud_threshold
            )));
        }
        if self.range > MAX_RANGE_DAYS {
            return Err(CloudlessError::Config(format!(
                "range of {} days exceeds the maximum of {}",
                self.range, MAX_RANGE_DAYS
            )));
        }
        if self.output_bands.is_empty() {
            return Err(CloudlessError::Config("output_bands must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for band in &self.output_bands {
            if !seen.insert(band.as_str()) {
                return Err(CloudlessError::Config(format!("duplicate output band {}", band)));
            }
        }
        if self.products.is_empty() {
            return Err(CloudlessError::Config("products must not be empty".to_string()));
        }
        if self.dates.is_empty() {
            return Err(CloudlessError::Config("dates must not be empty".to_string()));
        }
        if self.workers == Some(0) {
            return Err(CloudlessError::Config("workers must be at least 1".to_string()));
        }
        if self.max_candidates == Some(0) {
            return Err(CloudlessError::Config("max_candidates must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = MosaicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recentness, RecentnessMode::Single);
        assert_eq!(config.dates, vec![DateSpec::Today]);
    }

    #[test]
    fn test_partial_document() {
        let json = r#"{
            "range": 45,
            "recentness": 2,
            "output_bands": ["B04", "B03", "B02"],
            "nodata_cutoff": 1000,
            "max_cloud_threshold": 35.5,
            "products": ["s2cloudless", "fmask"],
            "dates": ["2020-06-01", "today"]
        }"#;
        let config = MosaicConfig::from_json_str(json).unwrap();
        assert_eq!(config.range, 45);
        assert_eq!(config.recentness, RecentnessMode::PerBand);
        assert_eq!(config.nodata_cutoff, 1000);
        assert_relative_eq!(config.max_cloud_threshold, 35.5);
        assert_relative_eq!(config.min_cloud_threshold, 0.0);
        assert_eq!(config.products, vec![MaskProduct::S2cloudless, MaskProduct::Fmask]);
        assert_eq!(
            config.dates,
            vec![DateSpec::Fixed(NaiveDate::from_ymd_opt(2020, 6, 1).unwrap()), DateSpec::Today]
        );
        assert!(config.prefetch);
    }

    #[test]
    fn test_recentness_by_name() {
        let config = MosaicConfig::from_json_str(r#"{"recentness": "off"}"#).unwrap();
        assert_eq!(config.recentness, RecentnessMode::Off);
        assert!(MosaicConfig::from_json_str(r#"{"recentness": 3}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"recentness": "sometimes"}"#).is_err());
    }

    #[test]
    fn test_invalid_documents() {
        assert!(MosaicConfig::from_json_str(r#"{"dates": ["2020-13-01"]}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"products": ["sen2cor"]}"#).is_err());

        let err = MosaicConfig::from_json_str(
            r#"{"min_cloud_threshold": 50.0, "max_cloud_threshold": 10.0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CloudlessError::Config(_)));

        assert!(MosaicConfig::from_json_str(r#"{"output_bands": ["B02", "B02"]}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"output_bands": []}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"workers": 0}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"max_cloud_threshold": 120.0}"#).is_err());
        assert!(MosaicConfig::from_json_str(r#"{"range": 3650}"#).is_ok());
        let err = MosaicConfig::from_json_str(r#"{"range": 4294967295}"#).unwrap_err();
        assert!(matches!(err, CloudlessError::Config(_)));
    }

    #[test]
    fn test_date_spec_resolution() {
        let today = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        assert_eq!(DateSpec::Today.resolve(today), today);
        let fixed = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_eq!(DateSpec::Fixed(fixed).resolve(today), fixed);
        assert_eq!(String::from(DateSpec::Fixed(fixed)), "2020-01-01");
    }

    #[test]
    fn test_serialized_config_reloads() {
        let mut config = MosaicConfig::default();
        config.recentness = RecentnessMode::PerBand;
        config.tile = Some("35VLG".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"recentness\":2"));
        assert_eq!(MosaicConfig::from_json_str(&json).unwrap(), config);
    }
}
