//! Raw DICOM series inventory and experimental-run selection.
//!
//! Siemens scanners can emit an online motion-corrected copy of every BOLD run
//! (`MoCoSeries`), so run selection filters on that as well as on volume count.

use anyhow::{Context, Result};
use dicom_object::open_file;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

pub const MOCO_DESCRIPTION: &str = "MoCoSeries";

/// One acquired series, aggregated over its instances.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesSummary {
    pub series_uid: String,
    pub series_number: Option<i32>,
    pub description: String,
    /// Instances found on disk. For mosaic BOLD data this is the volume count.
    pub instance_count: usize,
    /// `AcquisitionDate` + `AcquisitionTime` of the earliest instance.
    pub acquisition: Option<String>,
    pub directory: PathBuf,
}

impl SeriesSummary {
    pub fn is_moco(&self) -> bool {
        is_moco(&self.description)
    }
}

/// Header fields read from one instance.
struct InstanceHeader {
    series_uid: String,
    series_number: Option<i32>,
    description: String,
    acquisition: Option<String>,
}

// ============================================================================
// DICOM Tag Reading
// ============================================================================

fn read_string(obj: &dicom_object::DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_instance_header(path: &Path) -> Result<InstanceHeader> {
    let obj = open_file(path).context("Failed to open DICOM file")?;

    let series_uid =
        read_string(&obj, "SeriesInstanceUID").context("SeriesInstanceUID not found")?;
    let series_number = obj
        .element_by_name("SeriesNumber")
        .ok()
        .and_then(|e| e.to_int::<i32>().ok());
    let description = read_string(&obj, "SeriesDescription")
        .or_else(|| read_string(&obj, "ProtocolName"))
        .unwrap_or_default();
    let acquisition = match (
        read_string(&obj, "AcquisitionDate"),
        read_string(&obj, "AcquisitionTime"),
    ) {
        (Some(d), Some(t)) => Some(format!("{}{}", d, t)),
        (None, Some(t)) => Some(t),
        _ => None,
    };

    Ok(InstanceHeader {
        series_uid,
        series_number,
        description,
        acquisition,
    })
}

// ============================================================================
// Inventory
// ============================================================================

/// List every regular file under `dir`, recursively.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .with_context(|| format!("Failed to read directory {}", current.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Groups every readable DICOM file under `dir` by series.
///
/// Files that are not DICOM (or lack a SeriesInstanceUID) are skipped. Series are
/// returned ordered by series number.
pub async fn scan_series(dir: &Path) -> Result<Vec<SeriesSummary>> {
    let files = list_files(dir).await?;
    let mut by_uid: HashMap<String, SeriesSummary> = HashMap::new();

    for file in &files {
        let header = match read_instance_header(file) {
            Ok(h) => h,
            Err(e) => {
                debug!(path = %file.display(), "skipping non-DICOM file: {:#}", e);
                continue;
            }
        };

        let directory = file.parent().unwrap_or(dir).to_path_buf();
        let summary = by_uid
            .entry(header.series_uid.clone())
            .or_insert_with(|| SeriesSummary {
                series_uid: header.series_uid.clone(),
                series_number: header.series_number,
                description: header.description.clone(),
                instance_count: 0,
                acquisition: None,
                directory,
            });

        summary.instance_count += 1;
        if let Some(acq) = header.acquisition {
            let earlier = summary
                .acquisition
                .as_ref()
                .map(|cur| acq < *cur)
                .unwrap_or(true);
            if earlier {
                summary.acquisition = Some(acq);
            }
        }
    }

    let mut series: Vec<SeriesSummary> = by_uid.into_values().collect();
    series.sort_by(|a, b| {
        a.series_number
            .cmp(&b.series_number)
            .then_with(|| a.series_uid.cmp(&b.series_uid))
    });
    Ok(series)
}

// ============================================================================
// Run Selection
// ============================================================================

/// True for Siemens motion-corrected series.
pub fn is_moco(description: &str) -> bool {
    description.trim() == MOCO_DESCRIPTION
}

/// Checks a dcm2niix JSON sidecar for a motion-corrected series.
///
/// A sidecar without `SeriesDescription` is reported as not MoCo, with a warning.
pub fn sidecar_is_moco(path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sidecar {}", path.display()))?;
    let metadata: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sidecar {}", path.display()))?;

    match metadata.get("SeriesDescription").and_then(|v| v.as_str()) {
        Some(desc) => Ok(is_moco(desc)),
        None => {
            warn!(path = %path.display(), "sidecar has no SeriesDescription; please verify JSON key");
            Ok(false)
        }
    }
}

/// Picks the experimental runs in acquisition order.
///
/// A series qualifies when its instance count is one of `volumes` and its MoCo status
/// matches `use_moco`. Series without an acquisition time sort after timed ones, then
/// by series number.
pub fn select_runs<'a>(
    series: &'a [SeriesSummary],
    volumes: &[usize],
    use_moco: bool,
) -> Vec<&'a SeriesSummary> {
    let mut runs: Vec<&SeriesSummary> = series
        .iter()
        .filter(|s| s.is_moco() == use_moco)
        .filter(|s| volumes.contains(&s.instance_count))
        .collect();

    runs.sort_by(|a, b| {
        let key_a = (a.acquisition.is_none(), a.acquisition.as_deref());
        let key_b = (b.acquisition.is_none(), b.acquisition.as_deref());
        key_a
            .cmp(&key_b)
            .then_with(|| a.series_number.cmp(&b.series_number))
    });
    runs
}
