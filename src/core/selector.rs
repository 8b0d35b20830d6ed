use crate::config::MosaicConfig;
use crate::io::catalog::{CatalogQuery, SceneCatalog};
use crate::types::{CloudlessError, CloudlessResult, SceneRecord};
use chrono::{Duration, NaiveDate};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Candidate selection parameters for one target date
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    pub target_date: NaiveDate,
    pub range_days: u32,       // look-back window
    pub min_cloud: f64,        // percent, inclusive
    pub max_cloud: f64,        // percent, inclusive
    pub tile: Option<String>,
}

impl SelectionParams {
    pub fn from_config(config: &MosaicConfig, target_date: NaiveDate) -> Self {
        Self {
            target_date,
            range_days: config.range,
            min_cloud: config.min_cloud_threshold,
            max_cloud: config.max_cloud_threshold,
            tile: config.tile.clone(),
        }
    }

    /// First day of the look-back window
    pub fn window_start(&self) -> CloudlessResult<NaiveDate> {
        self.target_date
            .checked_sub_signed(Duration::days(i64::from(self.range_days)))
            .ok_or_else(|| {
                CloudlessError::Config(format!(
                    "look-back of {} days from {} leaves the supported date range",
                    self.range_days, self.target_date
                ))
            })
    }

    fn to_query(&self) -> CloudlessResult<CatalogQuery> {
        if self.min_cloud > self.max_cloud {
            return Err(CloudlessError::Config(format!(
                "cloud bounds [{}, {}] are empty",
                self.min_cloud, self.max_cloud
            )));
        }
        Ok(CatalogQuery {
            tile: self.tile.clone(),
            from: self.window_start()?,
            to: self.target_date,
            min_cloud: self.min_cloud,
            max_cloud: self.max_cloud,
        })
    }
}

/// Candidate precedence: acquisition date descending, then scene id descending
pub fn candidate_order(a: &SceneRecord, b: &SceneRecord) -> Ordering {
    b.acquisition_date()
        .cmp(&a.acquisition_date())
        .then_with(|| b.id.cmp(&a.id))
}

/// Sort scenes into compositing order in place
pub fn order_candidates(scenes: &mut [SceneRecord]) {
    scenes.sort_by(candidate_order);
}

/// Produces the ordered candidate list for one mosaic
pub struct SceneCandidateSelector<'a> {
    catalog: &'a dyn SceneCatalog,
}

impl<'a> SceneCandidateSelector<'a> {
    pub fn new(catalog: &'a dyn SceneCatalog) -> Self {
        Self { catalog }
    }

    /// Query the catalog and return candidates most recent first.
    ///
    /// The window and cloud filters are re-applied locally, so a catalog that
    /// over-returns never widens the candidate set. An empty list is a valid
    /// result.
    pub fn select(&self, params: &SelectionParams) -> CloudlessResult<Vec<SceneRecord>> {
        let query = params.to_query()?;
        log::debug!(
            "Selecting candidates for {} ({} .. {}, cloud {}..{}%, tile {:?})",
            params.target_date,
            query.from,
            query.to,
            query.min_cloud,
            query.max_cloud,
            query.tile
        );

        // One record per scene id; the copy that ranks first wins
        let mut by_id: BTreeMap<String, SceneRecord> = BTreeMap::new();
        for scene in self.catalog.query(&query)?.into_iter().filter(|scene| query.matches(scene)) {
            match by_id.get(&scene.id) {
                Some(kept) if candidate_order(kept, &scene) != Ordering::Greater => {}
                _ => {
                    by_id.insert(scene.id.clone(), scene);
                }
            }
        }
        let mut candidates: Vec<SceneRecord> = by_id.into_values().collect();
        order_candidates(&mut candidates);

        log::info!(
            "Selected {} candidate scenes for {} (look-back {} days)",
            candidates.len(),
            params.target_date,
            params.range_days
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::catalog::{InMemoryCatalog, Registration};
    use crate::types::{GeoTransform, GridSpec};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn scene(id: &str, month: u32, day: u32, hour: u32, cloud: f64) -> SceneRecord {
        SceneRecord {
            id: id.to_string(),
            acquired: Utc.with_ymd_and_hms(2020, month, day, hour, 0, 0).unwrap(),
            grid: GridSpec {
                tile_id: "35VLG".to_string(),
                width: 1,
                height: 1,
                epsg: 32635,
                geo_transform: GeoTransform::from_gdal([0.0, 10.0, 0.0, 0.0, 0.0, -10.0]),
            },
            bands: BTreeMap::new(),
            cloud_cover: cloud,
            nodata: 0,
        }
    }

    fn params(range_days: u32) -> SelectionParams {
        SelectionParams {
            target_date: NaiveDate::from_ymd_opt(2020, 6, 30).unwrap(),
            range_days,
            min_cloud: 0.0,
            max_cloud: 60.0,
            tile: None,
        }
    }

    /// Catalog that ignores the query entirely
    struct LeakyCatalog(Vec<SceneRecord>);

    impl SceneCatalog for LeakyCatalog {
        fn query(&self, _query: &CatalogQuery) -> CloudlessResult<Vec<SceneRecord>> {
            Ok(self.0.clone())
        }

        fn register(&self, _descriptor: &crate::types::MosaicDescriptor) -> CloudlessResult<Registration> {
            Ok(Registration::Added)
        }
    }

    #[test]
    fn test_window_and_order() {
        let catalog = InMemoryCatalog::new(vec![
            scene("S2A_0610", 6, 10, 10, 5.0),
            scene("S2B_0630", 6, 30, 9, 20.0),
            scene("S2A_0625", 6, 25, 10, 0.0),
            scene("S2A_0531", 5, 31, 10, 0.0),   // 30 days back, inclusive
            scene("S2A_0530", 5, 30, 10, 0.0),   // outside window
            scene("S2B_0701", 7, 1, 10, 0.0),    // after target
        ]);
        let selector = SceneCandidateSelector::new(&catalog);
        let ids: Vec<String> = selector.select(&params(30)).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["S2B_0630", "S2A_0625", "S2A_0610", "S2A_0531"]);
    }

    #[test]
    fn test_same_day_tie_break_by_id_descending() {
        let catalog = InMemoryCatalog::new(vec![
            scene("T35VLG_b", 6, 20, 9, 1.0),
            scene("T35VLG_c", 6, 20, 8, 1.0),
            scene("T35VLG_a", 6, 20, 11, 1.0),
        ]);
        let selector = SceneCandidateSelector::new(&catalog);
        let ids: Vec<String> = selector.select(&params(30)).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["T35VLG_c", "T35VLG_b", "T35VLG_a"]);
    }

    #[test]
    fn test_filters_reapplied_to_catalog_output() {
        let catalog = LeakyCatalog(vec![
            scene("cloudy", 6, 28, 10, 90.0),
            scene("old", 1, 1, 10, 0.0),
            scene("ok", 6, 29, 10, 10.0),
            scene("ok", 6, 29, 10, 10.0),
        ]);
        let selector = SceneCandidateSelector::new(&catalog);
        let ids: Vec<String> = selector.select(&params(30)).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let catalog = InMemoryCatalog::default();
        let selector = SceneCandidateSelector::new(&catalog);
        assert!(selector.select(&params(10)).unwrap().is_empty());
    }

    #[test]
    fn test_inverted_cloud_bounds_rejected() {
        let catalog = InMemoryCatalog::default();
        let selector = SceneCandidateSelector::new(&catalog);
        let mut p = params(10);
        p.min_cloud = 70.0;
        assert!(matches!(selector.select(&p), Err(CloudlessError::Config(_))));
    }

    #[test]
    fn test_zero_range_selects_target_day_only() {
        let catalog = InMemoryCatalog::new(vec![scene("a", 6, 30, 23, 0.0), scene("b", 6, 29, 23, 0.0)]);
        let selector = SceneCandidateSelector::new(&catalog);
        let selected = selector.select(&params(0)).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "a");
    }

    #[test]
    fn test_window_beyond_calendar_is_config_error() {
        let catalog = InMemoryCatalog::new(vec![scene("a", 6, 30, 10, 0.0)]);
        let selector = SceneCandidateSelector::new(&catalog);
        assert!(matches!(params(u32::MAX).window_start(), Err(CloudlessError::Config(_))));
        assert!(matches!(selector.select(&params(u32::MAX)), Err(CloudlessError::Config(_))));
    }

    #[test]
    fn test_repeated_id_keeps_most_recent_copy() {
        let newer = scene("dup", 6, 25, 10, 0.0);
        let between = scene("x", 6, 22, 10, 0.0);
        let older = scene("dup", 6, 20, 10, 0.0);

        for listing in [
            vec![newer.clone(), between.clone(), older.clone()],
            vec![older.clone(), between.clone(), newer.clone()],
        ] {
            let catalog = LeakyCatalog(listing);
            let selected = SceneCandidateSelector::new(&catalog).select(&params(30)).unwrap();
            let ids: Vec<&str> = selected.iter().map(|s| s.id.as_str()).collect();
            assert_eq!(ids, vec!["dup", "x"]);
            assert_eq!(selected[0].acquired, newer.acquired);
        }
    }
}
