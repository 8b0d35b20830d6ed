use chrono::{Duration, NaiveDate, TimeZone, Utc};
use cloudless::config::RecentnessMode;
use cloudless::core::budget::{BudgetVerdict, MosaicResult, NodataBudgetEvaluator};
use cloudless::core::compositor::{CompositorParams, TemporalCompositor};
use cloudless::core::selector::{SceneCandidateSelector, SelectionParams};
use cloudless::io::archive::{decode_mosaic, encode_mosaic};
use cloudless::io::catalog::InMemoryCatalog;
use cloudless::io::raster::{InMemoryMaskSource, InMemoryRasterSource, RawMask};
use cloudless::types::{GeoTransform, GridSpec, MaskProduct, SceneRecord, NODATA};
use ndarray::{array, Array2};
use proptest::prelude::*;
use std::collections::BTreeMap;

const BANDS: [&str; 2] = ["B04", "B08"];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn target_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 6, 30).unwrap()
}

fn grid() -> GridSpec {
    GridSpec {
        tile_id: "35VLG".to_string(),
        width: 4,
        height: 2,
        epsg: 32635,
        geo_transform: GeoTransform::from_gdal([300000.0, 10.0, 0.0, 6900000.0, 0.0, -10.0]),
    }
}

fn scene(id: &str, days_back: i64) -> SceneRecord {
    SceneRecord {
        id: id.to_string(),
        acquired: Utc.with_ymd_and_hms(2020, 6, 30, 9, 50, 0).unwrap() - Duration::days(days_back),
        grid: grid(),
        bands: BANDS
            .iter()
            .map(|b| (b.to_string(), format!("mem://{}/{}", id, b)))
            .collect::<BTreeMap<_, _>>(),
        cloud_cover: 20.0,
        nodata: 0,
    }
}

/// Scene store where every band of `scene` holds `value` and clouds cover `cloudy`
struct Fixture {
    catalog: InMemoryCatalog,
    rasters: InMemoryRasterSource,
    masks: InMemoryMaskSource,
}

impl Fixture {
    fn new() -> Self {
        Self {
            catalog: InMemoryCatalog::default(),
            rasters: InMemoryRasterSource::new(),
            masks: InMemoryMaskSource::new(),
        }
    }

    fn add(&self, scene: SceneRecord, value: u16, cloudy: Array2<u8>) {
        for (offset, band) in BANDS.iter().enumerate() {
            self.rasters
                .insert(&scene.id, band, Array2::from_elem((2, 4), value + offset as u16));
        }
        self.masks.insert(
            &scene.id,
            MaskProduct::S2cloudless,
            RawMask::CloudShadow {
                shadow: Array2::zeros(cloudy.dim()),
                cloud: cloudy,
            },
        );
        self.catalog.add_scene(scene);
    }

    fn mosaic(&self, product: MaskProduct, recentness: RecentnessMode, cutoff: usize) -> BudgetVerdict {
        let params = SelectionParams {
            target_date: target_date(),
            range_days: 30,
            min_cloud: 0.0,
            max_cloud: 100.0,
            tile: Some("35VLG".to_string()),
        };
        let candidates = SceneCandidateSelector::new(&self.catalog).select(&params).unwrap();
        let compositor = TemporalCompositor::new(
            &self.rasters,
            &self.masks,
            CompositorParams {
                recentness,
                ..CompositorParams::default()
            },
        );
        let bands: Vec<String> = BANDS.iter().map(|b| b.to_string()).collect();
        let outcome = compositor.composite(&grid(), &bands, product, &candidates).unwrap();
        NodataBudgetEvaluator::new(cutoff).evaluate(outcome, target_date(), product)
    }
}

fn accepted(verdict: BudgetVerdict) -> MosaicResult {
    match verdict {
        BudgetVerdict::Accepted(mosaic) => mosaic,
        BudgetVerdict::Rejected(rejection) => panic!("mosaic rejected: {:?}", rejection.report),
    }
}

#[test]
fn test_most_recent_clear_observation_wins() {
    init_logging();
    let fixture = Fixture::new();
    fixture.add(scene("S2A_day0", 0), 100, Array2::ones((2, 4)));
    fixture.add(scene("S2B_day5", 5), 200, array![[0, 0, 1, 1], [0, 0, 1, 1]]);
    fixture.add(scene("S2A_day20", 20), 300, Array2::zeros((2, 4)));

    let mosaic = accepted(fixture.mosaic(MaskProduct::S2cloudless, RecentnessMode::Single, 0));

    assert_eq!(mosaic.band("B04").unwrap(), &array![[200, 200, 300, 300], [200, 200, 300, 300]]);
    assert_eq!(mosaic.band("B08").unwrap(), &array![[201, 201, 301, 301], [201, 201, 301, 301]]);
    assert_eq!(mosaic.recentness.len(), 1);
    assert_eq!(mosaic.recentness[0].data, array![[2u16, 2, 3, 3], [2, 2, 3, 3]]);
    assert_eq!(mosaic.candidates, vec!["S2A_day0", "S2B_day5", "S2A_day20"]);
    assert_eq!(mosaic.total_unfilled(), 0);
    assert!(!mosaic.truncated);
}

#[test]
fn test_single_unfilled_pixel_rejected_at_zero_cutoff() {
    init_logging();
    let fixture = Fixture::new();
    fixture.add(scene("S2A_day0", 0), 100, array![[0, 0, 0, 0], [0, 0, 0, 1]]);

    match fixture.mosaic(MaskProduct::S2cloudless, RecentnessMode::Single, 0) {
        BudgetVerdict::Rejected(rejection) => {
            assert_eq!(rejection.report.bands.len(), 2);
            for band in &rejection.report.bands {
                assert_eq!(band.unfilled, 1);
                assert_eq!(band.excess, 1);
            }
        }
        BudgetVerdict::Accepted(_) => panic!("mosaic with an unfilled pixel passed cutoff 0"),
    }

    let mosaic = accepted(fixture.mosaic(MaskProduct::S2cloudless, RecentnessMode::Single, 1));
    assert_eq!(mosaic.band("B04").unwrap()[[1, 3]], NODATA);
    assert_eq!(mosaic.recentness[0].data[[1, 3]], 0);
}

#[test]
fn test_unmasked_compositing_uses_newest_scene_only() {
    init_logging();
    let fixture = Fixture::new();
    fixture.add(scene("S2A_day3", 3), 111, Array2::ones((2, 4)));
    fixture.add(scene("S2A_day9", 9), 999, Array2::zeros((2, 4)));

    let mosaic = accepted(fixture.mosaic(MaskProduct::None, RecentnessMode::PerBand, 0));
    assert!(mosaic.band("B04").unwrap().iter().all(|v| *v == 111));
    assert_eq!(mosaic.recentness.len(), 2);
    assert!(mosaic.recentness.iter().all(|plane| plane.data.iter().all(|r| *r == 1)));
    assert_eq!(mosaic.recentness[1].name, "B08_recentness");
}

#[test]
fn test_identical_inputs_encode_identically() {
    init_logging();
    let build = || {
        let fixture = Fixture::new();
        fixture.add(scene("S2A_day1", 1), 10, array![[1, 0, 1, 0], [0, 1, 0, 1]]);
        fixture.add(scene("S2B_day4", 4), 20, Array2::zeros((2, 4)));
        encode_mosaic(&accepted(fixture.mosaic(MaskProduct::S2cloudless, RecentnessMode::Single, 0))).unwrap()
    };
    let first = build();
    let second = build();
    assert_eq!(first, second);

    let decoded = decode_mosaic(&first).unwrap();
    assert_eq!(decoded.band("B04").unwrap(), &array![[20, 10, 20, 10], [10, 20, 10, 20]]);
}

#[test]
fn test_same_day_scenes_break_ties_by_id() {
    init_logging();
    let fixture = Fixture::new();
    fixture.add(scene("S2A_same", 2), 1, Array2::zeros((2, 4)));
    fixture.add(scene("S2B_same", 2), 2, Array2::zeros((2, 4)));

    let mosaic = accepted(fixture.mosaic(MaskProduct::S2cloudless, RecentnessMode::Single, 0));
    assert_eq!(mosaic.candidates[0], "S2B_same");
    assert!(mosaic.band("B04").unwrap().iter().all(|v| *v == 2));
}

fn catalog_entries() -> Vec<(SceneRecord, u16, Array2<u8>)> {
    vec![
        (scene("S2A_a", 0), 10, array![[1, 1, 0, 0], [1, 0, 0, 1]]),
        (scene("S2B_b", 3), 20, array![[0, 1, 1, 0], [1, 1, 0, 0]]),
        (scene("S2A_c", 3), 30, array![[1, 0, 1, 0], [0, 1, 1, 0]]),
        (scene("S2A_d", 11), 40, array![[0, 0, 0, 1], [1, 1, 1, 1]]),
        (scene("S2B_e", 25), 50, Array2::zeros((2, 4))),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_catalog_order_does_not_change_mosaic(entries in Just(catalog_entries()).prop_shuffle()) {
        let reference = Fixture::new();
        for (scene, value, cloudy) in catalog_entries() {
            reference.add(scene, value, cloudy);
        }
        let shuffled = Fixture::new();
        for (scene, value, cloudy) in entries {
            shuffled.add(scene, value, cloudy);
        }

        let expected = accepted(reference.mosaic(MaskProduct::S2cloudless, RecentnessMode::PerBand, 0));
        let actual = accepted(shuffled.mosaic(MaskProduct::S2cloudless, RecentnessMode::PerBand, 0));
        prop_assert_eq!(encode_mosaic(&expected).unwrap(), encode_mosaic(&actual).unwrap());
    }
}
