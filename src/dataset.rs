//! BIDS dataset builder.
//!
//! Owns the output root, the dcm2bids configuration descriptor, the tool settings and
//! the participant roster. Every step is explicit; there is no hidden global state.

use crate::error::{BidsError, Result};
use crate::events::split_events;
use crate::naming::{session_id, session_label, subject_id, subject_label, task_sidecar_filename};
use crate::participants::write_participants;
use crate::roster::ParticipantRoster;
use crate::table::Table;
use crate::tools::{
    convert_to_nifti, run_dcm2bids, ConversionResult, Dcm2BidsRequest, ToolPolicy,
    DEFAULT_DCM2BIDS, DEFAULT_DCM2NIIX,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const BIDS_VERSION: &str = "1.8.0";
pub const DATASET_DESCRIPTION_FILE: &str = "dataset_description.json";

/// Locations of the external converters.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub dcm2bids: String,
    pub dcm2niix: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            dcm2bids: DEFAULT_DCM2BIDS.to_string(),
            dcm2niix: DEFAULT_DCM2NIIX.to_string(),
        }
    }
}

/// What happened when a subject was handed to dcm2bids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectOutcome {
    Converted,
    /// This (subject, session) was already laid out; dcm2bids was not run again.
    Skipped,
    /// dcm2bids failed under a tolerant policy. Holds the tool's error text.
    ToolFailed(String),
}

/// Dataset-level task metadata for `task-<name>_bold.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetadata {
    #[serde(rename = "TaskName")]
    pub name: String,
    #[serde(rename = "RepetitionTime", skip_serializing_if = "Option::is_none")]
    pub repetition_time: Option<f64>,
    #[serde(rename = "Instructions", skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Serialize)]
struct DatasetDescription<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "BIDSVersion")]
    bids_version: &'a str,
}

pub struct BidsDataset {
    root: PathBuf,
    config: PathBuf,
    tools: ToolSettings,
    roster: ParticipantRoster,
    laid_out: HashSet<LayoutKey>,
}

/// Padded (subject, session) ids of a dcm2bids run.
pub(crate) type LayoutKey = (String, Option<String>);

pub(crate) fn layout_key(subject: &str, session: Option<&str>) -> LayoutKey {
    (subject_id(subject), session.map(session_id))
}

impl BidsDataset {
    pub fn new(root: impl Into<PathBuf>, config: impl Into<PathBuf>, tools: ToolSettings) -> Self {
        Self {
            root: root.into(),
            config: config.into(),
            tools,
            roster: ParticipantRoster::new(),
            laid_out: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn tools(&self) -> &ToolSettings {
        &self.tools
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut ParticipantRoster {
        &mut self.roster
    }

    /// Where BIDS keeps this subject's events files.
    pub fn func_dir(&self, subject: &str, session: Option<&str>) -> PathBuf {
        func_dir(&self.root, subject, session)
    }

    /// True once dcm2bids has converted this (subject, session) for the dataset.
    pub fn is_laid_out(&self, subject: &str, session: Option<&str>) -> bool {
        self.laid_out.contains(&layout_key(subject, session))
    }

    /// Records a converted (subject, session) and puts the subject on the roster.
    ///
    /// `3` and `sub-03` share one roster entry. Returns false when the pair was
    /// already recorded.
    pub fn record_layout(&mut self, subject: &str, session: Option<&str>) -> bool {
        let label = subject_label(subject);
        if !self.roster.entries().iter().any(|e| e.assigned == label) {
            self.roster.add(subject, &label);
        }
        self.laid_out.insert(layout_key(subject, session))
    }

    /// Lays a subject out with dcm2bids and registers it on the roster.
    ///
    /// Each (subject, session) pair is converted once; a second session of a known
    /// subject still runs. Nothing is recorded unless dcm2bids succeeds, so failed
    /// subjects can be retried. Under `ToolPolicy::Tolerate` a dcm2bids failure is
    /// logged and reported as `ToolFailed`.
    pub async fn add_subject(
        &mut self,
        dicom_dir: &Path,
        subject: &str,
        session: Option<&str>,
        policy: ToolPolicy,
    ) -> Result<SubjectOutcome> {
        if self.is_laid_out(subject, session) {
            info!(subject = %subject, session = ?session, "already laid out; skipping");
            return Ok(SubjectOutcome::Skipped);
        }
        let outcome = convert_subject(
            &self.tools.dcm2bids,
            &self.config,
            &self.root,
            dicom_dir,
            subject,
            session,
            policy,
        )
        .await?;
        if outcome == SubjectOutcome::Converted {
            self.record_layout(subject, session);
        }
        Ok(outcome)
    }

    /// Splits an events table into the subject's `func` directory.
    pub fn set_events(
        &self,
        subject: &str,
        table: &Table,
        session: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        split_events(table, subject, &self.func_dir(subject, session), session)
    }

    /// Writes `participants.tsv`, degrading a schema violation to a warning.
    ///
    /// Returns `Ok(None)` and writes nothing when required columns are missing.
    pub fn set_participants(
        &self,
        table: &Table,
        extra_columns: &[String],
    ) -> Result<Option<PathBuf>> {
        match write_participants(table, &self.root, extra_columns, &self.roster) {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.is_invalid_input() => {
                warn!("participants.tsv not written: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes `<root>/task-<name>_bold.json`.
    pub fn set_task(&self, task: &TaskMetadata) -> Result<PathBuf> {
        let path = self.root.join(task_sidecar_filename(&task.name));
        write_json(&path, task)?;
        Ok(path)
    }

    /// Writes `dataset_description.json`.
    pub fn write_description(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(DATASET_DESCRIPTION_FILE);
        let desc = DatasetDescription {
            name,
            bids_version: BIDS_VERSION,
        };
        write_json(&path, &desc)?;
        Ok(path)
    }

    /// Converts a raw DICOM directory to NIfTI under the configured policy.
    pub async fn convert_nifti(
        &self,
        raw: &Path,
        dest: &Path,
        compress: bool,
        policy: ToolPolicy,
    ) -> Result<Option<ConversionResult>> {
        policy.apply(convert_to_nifti(&self.tools.dcm2niix, raw, dest, compress).await)
    }
}

/// `<root>/sub-XX[/ses-YY]/func` for any root.
pub fn func_dir(root: &Path, subject: &str, session: Option<&str>) -> PathBuf {
    let mut dir = root.join(subject_label(subject));
    if let Some(ses) = session {
        dir.push(session_label(ses));
    }
    dir.join("func")
}

/// Runs dcm2bids for one subject without touching any roster.
///
/// The batch runner calls this concurrently and records the results afterwards.
pub async fn convert_subject(
    program: &str,
    config: &Path,
    root: &Path,
    dicom_dir: &Path,
    subject: &str,
    session: Option<&str>,
    policy: ToolPolicy,
) -> Result<SubjectOutcome> {
    let participant = subject_id(subject);
    let session = session.map(session_id);
    let req = Dcm2BidsRequest {
        participant: &participant,
        config,
        dicom_dir,
        bids_root: root,
        session: session.as_deref(),
    };

    match run_dcm2bids(program, &req).await {
        Ok(_) => {
            info!(subject = %subject, "dcm2bids finished");
            Ok(SubjectOutcome::Converted)
        }
        Err(e @ BidsError::ExternalTool { .. }) if policy == ToolPolicy::Tolerate => {
            warn!(subject = %subject, "{}; continuing with remaining subjects", e);
            Ok(SubjectOutcome::ToolFailed(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BidsError::io(parent, e))?;
    }
    let mut json = serde_json::to_string_pretty(value).map_err(|e| BidsError::json(path, e))?;
    json.push('\n');
    std::fs::write(path, json).map_err(|e| BidsError::io(path, e))
}
