//! Splits a tidy behavioural events table into one BIDS `*_events.tsv` per (run, task).

use crate::error::{BidsError, Result};
use crate::naming::{events_filename, is_valid_label, session_id, subject_id, zero_pad};
use crate::table::Table;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Columns every events table must carry.
pub const REQUIRED_EVENT_COLUMNS: [&str; 5] = ["run", "onset", "duration", "trial_type", "task"];

/// One (run, task) slice of an events table, `run` already removed.
#[derive(Debug, Clone)]
pub struct Partition {
    pub run: String,
    pub task: String,
    pub filename: String,
    pub table: Table,
}

/// Validates `table` and computes every partition and its file name without touching disk.
///
/// Partitions come out in order of first appearance of each (run, task) pair. Entity
/// labels must be alphanumeric, and two pairs that format to the same file name
/// (run `1` and run `01`) are rejected rather than overwriting each other.
pub fn partition_events(
    table: &Table,
    subject: &str,
    session: Option<&str>,
) -> Result<Vec<Partition>> {
    table.require_columns("event table", &REQUIRED_EVENT_COLUMNS)?;
    check_label("subject", &subject_id(subject))?;
    if let Some(ses) = session {
        check_label("session", &session_id(ses))?;
    }

    let mut partitions = Vec::new();
    let mut names = HashSet::new();
    for (key, group) in table.group_by(&["run", "task"])? {
        let (run, task) = (key[0].clone(), key[1].clone());
        check_label("run", &zero_pad(&run))?;
        check_label("task", &task)?;

        let filename = events_filename(subject, session, &task, &run);
        if !names.insert(filename.clone()) {
            return Err(BidsError::InvalidLabel {
                context: "event table".into(),
                value: run,
                reason: format!("run collides with another run of task {task} in {filename}"),
            });
        }
        partitions.push(Partition {
            filename,
            table: group.drop_column("run"),
            run,
            task,
        });
    }

    Ok(partitions)
}

fn check_label(entity: &str, label: &str) -> Result<()> {
    if is_valid_label(label) {
        Ok(())
    } else {
        Err(BidsError::InvalidLabel {
            context: "event table".into(),
            value: label.to_string(),
            reason: format!("{entity} labels must be non-empty and alphanumeric"),
        })
    }
}

/// Writes one TSV per (run, task) pair into `output_dir` and returns the written paths.
///
/// Validation happens before the first write, so a schema error leaves the directory
/// untouched. Writes themselves are not transactional.
pub fn split_events(
    table: &Table,
    subject: &str,
    output_dir: &Path,
    session: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let partitions = partition_events(table, subject, session)?;

    std::fs::create_dir_all(output_dir).map_err(|e| BidsError::io(output_dir, e))?;

    let mut written = Vec::with_capacity(partitions.len());
    for part in &partitions {
        let path = output_dir.join(&part.filename);
        part.table.write_tsv(&path)?;
        debug!(path = %path.display(), rows = part.table.len(), "wrote events partition");
        written.push(path);
    }

    info!(
        subject = %subject,
        files = written.len(),
        dir = %output_dir.display(),
        "split events table"
    );
    Ok(written)
}

/// Reads a CSV/TSV events file and splits it.
pub fn split_events_file(
    input: &Path,
    subject: &str,
    output_dir: &Path,
    session: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let table = Table::read_path(input)?;
    split_events(&table, subject, output_dir, session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn scenario_table() -> Table {
        Table::new(
            row(&["run", "task", "onset", "duration", "trial_type"]),
            vec![
                row(&["1", "A", "0.5", "1.0", "go"]),
                row(&["1", "A", "2.0", "1.0", "stop"]),
                row(&["2", "A", "0.0", "1.0", "go"]),
            ],
        )
    }

    #[test]
    fn test_split_two_runs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = split_events(&scenario_table(), "3", dir.path(), None).unwrap();

        assert_eq!(
            paths,
            vec![
                dir.path().join("sub-03_task-A_run-01_events.tsv"),
                dir.path().join("sub-03_task-A_run-02_events.tsv"),
            ]
        );

        let first = Table::read_path(&paths[0]).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.column_index("run").is_none());
        assert_eq!(first.column("trial_type").unwrap(), vec!["go", "stop"]);

        let second = Table::read_path(&paths[1]).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(
            std::fs::read_to_string(&paths[1]).unwrap(),
            "task\tonset\tduration\ttrial_type\nA\t0.0\t1.0\tgo\n"
        );
    }

    #[test]
    fn test_split_with_session() {
        let dir = tempfile::tempdir().unwrap();
        let paths = split_events(&scenario_table(), "12", dir.path(), Some("1")).unwrap();
        assert_eq!(
            paths[0].file_name().unwrap(),
            "sub-12_ses-01_task-A_run-01_events.tsv"
        );
    }

    #[test]
    fn test_missing_columns_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("func");
        let table = scenario_table().drop_column("duration");

        let err = split_events(&table, "3", &out, None).unwrap_err();
        match err {
            BidsError::InvalidInput { missing, required, .. } => {
                assert_eq!(missing, vec!["duration".to_string()]);
                assert_eq!(required.len(), 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_runs_formatting_alike_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("func");
        let table = Table::new(
            row(&["run", "task", "onset", "duration", "trial_type"]),
            vec![
                row(&["1", "A", "0.5", "1", "go"]),
                row(&["01", "A", "9.0", "1", "stop"]),
            ],
        );

        let err = split_events(&table, "3", &out, None).unwrap_err();
        assert!(err.is_invalid_input());
        assert!(err.to_string().contains("sub-03_task-A_run-01_events.tsv"));
        assert!(!out.exists());
    }

    #[test]
    fn test_bad_task_label_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("func");
        let table = Table::new(
            row(&["run", "task", "onset", "duration", "trial_type"]),
            vec![
                row(&["1", "A", "0.5", "1", "go"]),
                row(&["1", "x/y", "2.0", "1", "go"]),
            ],
        );

        match split_events(&table, "3", &out, None).unwrap_err() {
            BidsError::InvalidLabel { value, .. } => assert_eq!(value, "x/y"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!out.exists());

        let spaced = Table::new(
            row(&["run", "task", "onset", "duration", "trial_type"]),
            vec![row(&["1", "go nogo", "0.5", "1", "go"])],
        );
        assert!(partition_events(&spaced, "3", None).is_err());
    }

    #[test]
    fn test_prefixed_subject_is_not_doubled() {
        let dir = tempfile::tempdir().unwrap();
        let paths = split_events(&scenario_table(), "sub-03", dir.path(), Some("ses-1")).unwrap();
        assert_eq!(
            paths[0].file_name().unwrap(),
            "sub-03_ses-01_task-A_run-01_events.tsv"
        );
    }

    #[test]
    fn test_rows_recombine_to_input() {
        let table = Table::new(
            row(&["run", "task", "onset", "duration", "trial_type", "resp"]),
            vec![
                row(&["1", "A", "0", "1", "go", "L"]),
                row(&["1", "B", "1", "1", "go", "R"]),
                row(&["2", "A", "2", "1", "stop", ""]),
                row(&["1", "A", "3", "1", "stop", "L"]),
                row(&["10", "B", "4", "1", "go", "R"]),
            ],
        );
        let dir = tempfile::tempdir().unwrap();
        let paths = split_events(&table, "7", dir.path(), None).unwrap();
        assert_eq!(paths.len(), 4);
        assert!(dir
            .path()
            .join("sub-07_task-B_run-10_events.tsv")
            .exists());

        let parts = partition_events(&table, "7", None).unwrap();
        let mut rebuilt: Vec<Vec<String>> = Vec::new();
        for part in &parts {
            for r in part.table.rows() {
                let mut full = vec![part.run.clone()];
                full.extend(r.iter().cloned());
                rebuilt.push(full);
            }
        }
        let mut original: Vec<Vec<String>> = table.rows().to_vec();
        original.sort();
        rebuilt.sort();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let first = split_events(&scenario_table(), "3", dir.path(), None).unwrap();
        let before: Vec<Vec<u8>> = first.iter().map(|p| std::fs::read(p).unwrap()).collect();

        let second = split_events(&scenario_table(), "3", dir.path(), None).unwrap();
        let after: Vec<Vec<u8>> = second.iter().map(|p| std::fs::read(p).unwrap()).collect();

        assert_eq!(first, second);
        assert_eq!(before, after);
    }

    #[test]
    fn test_split_events_file_reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tidy.csv");
        std::fs::write(
            &src,
            "run,task,onset,duration,trial_type\n1,rest,0,10,fix\n",
        )
        .unwrap();
        let paths = split_events_file(&src, "P1", &dir.path().join("out"), None).unwrap();
        assert_eq!(
            paths[0].file_name().unwrap(),
            "sub-P1_task-rest_run-01_events.tsv"
        );
    }
}
