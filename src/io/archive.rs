//! Self-describing mosaic archive
//!
//! A zip container holding `manifest.json` plus one raw little-endian `u16`
//! plane per band under `bands/`. Entry timestamps are pinned so that equal
//! mosaics always encode to identical bytes.

use crate::config::RecentnessMode;
use crate::core::budget::{MosaicBand, MosaicResult};
use crate::types::{CloudlessError, CloudlessResult, GridSpec, MaskProduct, Reflectance};
use chrono::NaiveDate;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const ARCHIVE_FORMAT: &str = "cloudless-archive";
const FORMAT_VERSION: u32 = 1;
const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PlaneKind {
    Data,
    Recentness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlaneEntry {
    name: String,
    kind: PlaneKind,
    file: String,
    dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    format: String,
    version: u32,
    target_date: NaiveDate,
    product: MaskProduct,
    grid: GridSpec,
    nodata: Reflectance,
    recentness_mode: RecentnessMode,
    planes: Vec<PlaneEntry>,
    unfilled: BTreeMap<String, usize>,
    candidates: Vec<String>,
    truncated: bool,
}

fn plane_file(kind: PlaneKind, name: &str) -> String {
    match kind {
        PlaneKind::Data => format!("bands/{}.u16le", name),
        PlaneKind::Recentness => format!("recentness/{}.u16le", name),
    }
}

fn entry_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
}

/// Encode a mosaic into archive bytes
pub fn encode_mosaic(mosaic: &MosaicResult) -> CloudlessResult<Vec<u8>> {
    let planes: Vec<(PlaneKind, &MosaicBand)> = mosaic
        .bands
        .iter()
        .map(|b| (PlaneKind::Data, b))
        .chain(mosaic.recentness.iter().map(|b| (PlaneKind::Recentness, b)))
        .collect();

    let manifest = Manifest {
        format: ARCHIVE_FORMAT.to_string(),
        version: FORMAT_VERSION,
        target_date: mosaic.target_date,
        product: mosaic.product,
        grid: mosaic.grid.clone(),
        nodata: mosaic.nodata,
        recentness_mode: mosaic.recentness_mode,
        planes: planes
            .iter()
            .map(|(kind, band)| PlaneEntry {
                name: band.name.clone(),
                kind: *kind,
                file: plane_file(*kind, &band.name),
                dtype: "u16le".to_string(),
            })
            .collect(),
        unfilled: mosaic.unfilled.iter().cloned().collect(),
        candidates: mosaic.candidates.clone(),
        truncated: mosaic.truncated,
    };

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(MANIFEST_NAME, entry_options())?;
    writer.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

    for (kind, band) in &planes {
        mosaic.grid.ensure_shape(band.data.dim(), &format!("plane {}", band.name))?;
        writer.start_file(plane_file(*kind, &band.name), entry_options())?;
        let mut bytes = Vec::with_capacity(band.data.len() * 2);
        for value in band.data.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&bytes)?;
    }

    let cursor = writer.finish()?;
    Ok(cursor.into_inner())
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> CloudlessResult<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn decode_plane(bytes: &[u8], grid: &GridSpec, name: &str) -> CloudlessResult<Array2<Reflectance>> {
    if bytes.len() != grid.pixel_count() * 2 {
        return Err(CloudlessError::Storage(format!(
            "plane {} holds {} bytes, expected {}",
            name,
            bytes.len(),
            grid.pixel_count() * 2
        )));
    }
    let values: Vec<Reflectance> = bytes
        .chunks_exact(2)
        .map(|pair| Reflectance::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Array2::from_shape_vec(grid.shape(), values)
        .map_err(|e| CloudlessError::Storage(format!("failed to reshape plane {}: {}", name, e)))
}

/// Decode archive bytes back into a mosaic
pub fn decode_mosaic(bytes: &[u8]) -> CloudlessResult<MosaicResult> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let manifest: Manifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST_NAME)?)?;
    if manifest.format != ARCHIVE_FORMAT || manifest.version != FORMAT_VERSION {
        return Err(CloudlessError::Storage(format!(
            "unsupported archive {} v{}",
            manifest.format, manifest.version
        )));
    }

    let mut bands = Vec::new();
    let mut recentness = Vec::new();
    for plane in &manifest.planes {
        let data = decode_plane(&read_entry(&mut archive, &plane.file)?, &manifest.grid, &plane.name)?;
        let band = MosaicBand {
            name: plane.name.clone(),
            data,
        };
        match plane.kind {
            PlaneKind::Data => bands.push(band),
            PlaneKind::Recentness => recentness.push(band),
        }
    }

    let unfilled = bands
        .iter()
        .map(|b| (b.name.clone(), manifest.unfilled.get(&b.name).copied().unwrap_or(0)))
        .collect();

    Ok(MosaicResult {
        target_date: manifest.target_date,
        product: manifest.product,
        grid: manifest.grid,
        nodata: manifest.nodata,
        bands,
        recentness,
        recentness_mode: manifest.recentness_mode,
        unfilled,
        candidates: manifest.candidates,
        truncated: manifest.truncated,
    })
}
