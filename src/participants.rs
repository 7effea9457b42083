//! `participants.tsv` generation from a caller-supplied demographics table.

use crate::error::{BidsError, Result};
use crate::naming::participant_id;
use crate::roster::ParticipantRoster;
use crate::table::Table;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PARTICIPANTS_FILE: &str = "participants.tsv";
pub const REQUIRED_PARTICIPANT_COLUMNS: [&str; 3] = ["participant_id", "sex", "age"];

/// Projects `table` onto the participant columns plus `extra_columns`.
///
/// Ids registered in `roster` are replaced with their assigned id; the rest are
/// normalised to `sub-<id>`.
pub fn project_participants(
    table: &Table,
    extra_columns: &[String],
    roster: &ParticipantRoster,
) -> Result<Table> {
    let mut columns: Vec<&str> = REQUIRED_PARTICIPANT_COLUMNS.to_vec();
    for extra in extra_columns {
        if !columns.contains(&extra.as_str()) {
            columns.push(extra.as_str());
        }
    }
    table.require_columns("participant table", &columns)?;

    let mut projected = table.select(&columns)?;
    projected.map_column("participant_id", |raw| match roster.assigned_for(raw) {
        Some(assigned) => assigned.to_string(),
        None => participant_id(raw),
    });
    Ok(projected)
}

/// Writes `<bids_root>/participants.tsv`. Missing columns fail before anything is written.
pub fn write_participants(
    table: &Table,
    bids_root: &Path,
    extra_columns: &[String],
    roster: &ParticipantRoster,
) -> Result<PathBuf> {
    let projected = project_participants(table, extra_columns, roster)?;

    std::fs::create_dir_all(bids_root).map_err(|e| BidsError::io(bids_root, e))?;
    let path = bids_root.join(PARTICIPANTS_FILE);
    projected.write_tsv(&path)?;

    info!(rows = projected.len(), path = %path.display(), "wrote participants table");
    Ok(path)
}
