use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/dicom_bids_cli.toml";
/// Default BIDS output root.
pub const DEFAULT_BIDS_ROOT: &str = "bids";
/// Default dcm2bids configuration descriptor.
pub const DEFAULT_DCM2BIDS_CONFIG: &str = "config/dcm2bids_config.json";
/// Default CSV path for the batch report.
pub const DEFAULT_REPORT_CSV: &str = "bids_report.csv";
/// Default JSON path for the batch report.
pub const DEFAULT_REPORT_JSON: &str = "bids_report.json";
/// Default number of subjects processed at once.
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Deserialize, Default)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    pub bids_root: Option<PathBuf>,
    pub dcm2bids_config: Option<PathBuf>,
    pub dcm2bids: Option<String>,
    pub dcm2niix: Option<String>,
    pub strict_tools: Option<bool>,
    pub compress: Option<bool>,
    pub concurrency: Option<usize>,
    pub report_csv: Option<PathBuf>,
    pub report_json: Option<PathBuf>,
    pub participant_columns: Option<Vec<String>>,
}

/// Final configuration used by every subcommand.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub bids_root: PathBuf,
    pub dcm2bids_config: PathBuf,
    pub dcm2bids: String,
    pub dcm2niix: String,
    pub strict_tools: bool,
    pub compress: bool,
    pub concurrency: usize,
    pub report_csv: PathBuf,
    pub report_json: PathBuf,
    pub participant_columns: Vec<String>,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            bids_root: PathBuf::from(DEFAULT_BIDS_ROOT),
            dcm2bids_config: PathBuf::from(DEFAULT_DCM2BIDS_CONFIG),
            dcm2bids: crate::tools::DEFAULT_DCM2BIDS.to_string(),
            dcm2niix: crate::tools::DEFAULT_DCM2NIIX.to_string(),
            strict_tools: false,
            compress: true,
            concurrency: DEFAULT_CONCURRENCY,
            report_csv: PathBuf::from(DEFAULT_REPORT_CSV),
            report_json: PathBuf::from(DEFAULT_REPORT_JSON),
            participant_columns: Vec::new(),
        }
    }
}

/// Attempts to read the runtime config file and deserialize CLI overrides.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&Path>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).context("Failed to read runtime config")?;
    let parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    Ok(Some(parsed))
}

/// Trims whitespace and drops empty strings from optional overrides.
pub fn sanitize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

/// One subject listed in a batch manifest.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SubjectEntry {
    #[serde(alias = "participant", alias = "pid")]
    pub subject: String,
    #[serde(alias = "dicom_path", alias = "dicom")]
    pub dicom_dir: PathBuf,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub session: Option<String>,
    #[serde(default, deserialize_with = "empty_path_as_none")]
    pub events: Option<PathBuf>,
}

fn empty_as_none<'de, D>(de: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(sanitize_optional_string(raw))
}

fn empty_path_as_none<'de, D>(de: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(empty_as_none(de)?.map(PathBuf::from))
}

/// Reads the subject manifest from CSV, TSV or a JSON array of objects.
///
/// Rows with an empty subject are dropped.
pub fn parse_manifest(path: &Path) -> Result<Vec<SubjectEntry>> {
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let entries: Vec<SubjectEntry> = match extension.to_lowercase().as_str() {
        "csv" | "tsv" => {
            let delimiter = if extension.eq_ignore_ascii_case("tsv") { b'\t' } else { b',' };
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .trim(csv::Trim::All)
                .from_path(path)
                .with_context(|| format!("Failed to open manifest {}", path.display()))?;
            let mut entries = Vec::new();
            for result in rdr.deserialize() {
                let entry: SubjectEntry = result.context("Invalid manifest row")?;
                entries.push(entry);
            }
            entries
        }
        "json" => {
            let file = File::open(path)?;
            serde_json::from_reader(file).context("JSON manifest must be an array of subjects")?
        }
        _ => return Err(anyhow!("Unsupported manifest extension. Use .csv, .tsv or .json")),
    };

    Ok(entries
        .into_iter()
        .filter(|e| !e.subject.trim().is_empty())
        .map(|mut e| {
            e.subject = e.subject.trim().to_string();
            e
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_runtime_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_runtime_config(Some(dir.path().join("absent.toml").as_path())).unwrap();
        assert!(cfg.is_none());
    }

    #[test]
    fn test_runtime_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(
            &path,
            "bids_root = \"/data/bids\"\nstrict_tools = true\nparticipant_columns = [\"group\"]\n",
        )
        .unwrap();
        let cfg = load_runtime_config(Some(path.as_path())).unwrap().unwrap();
        assert_eq!(cfg.bids_root, Some(PathBuf::from("/data/bids")));
        assert_eq!(cfg.strict_tools, Some(true));
        assert_eq!(cfg.participant_columns, Some(vec!["group".to_string()]));
        assert!(cfg.dcm2niix.is_none());
    }

    #[test]
    fn test_sanitize_optional_string() {
        assert_eq!(sanitize_optional_string(Some("  ".into())), None);
        assert_eq!(sanitize_optional_string(Some(" a ".into())), Some("a".into()));
        assert_eq!(sanitize_optional_string(None), None);
    }

    #[test]
    fn test_parse_csv_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subjects.csv");
        fs::write(
            &path,
            "subject,dicom_dir,session,events\n3,/raw/s3,,/ev/s3.csv\n12,/raw/s12,2,\n,/raw/x,,\n",
        )
        .unwrap();
        let entries = parse_manifest(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].session, None);
        assert_eq!(entries[0].events, Some(PathBuf::from("/ev/s3.csv")));
        assert_eq!(entries[1].session, Some("2".into()));
        assert_eq!(entries[1].events, None);
    }

    #[test]
    fn test_parse_json_manifest_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subjects.json");
        fs::write(
            &path,
            r#"[{"pid": "P1", "dicom": "/raw/p1"}, {"subject": "P2", "dicom_dir": "/raw/p2", "session": "1"}]"#,
        )
        .unwrap();
        let entries = parse_manifest(&path).unwrap();
        assert_eq!(entries[0].subject, "P1");
        assert_eq!(entries[0].dicom_dir, PathBuf::from("/raw/p1"));
        assert_eq!(entries[1].session, Some("1".into()));
    }

    #[test]
    fn test_unsupported_manifest_extension() {
        assert!(parse_manifest(Path::new("subjects.xlsx")).is_err());
    }
}
