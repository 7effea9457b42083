//! Per-subject pipeline over a manifest: dcm2bids layout, then events splitting.

use crate::config::SubjectEntry;
use crate::dataset::{convert_subject, func_dir, layout_key, BidsDataset, SubjectOutcome};
use crate::events::split_events_file;
use crate::tools::ToolPolicy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Default, Debug, Clone)]
pub struct SubjectResult {
    pub subject: String,
    pub session: Option<String>,
    pub status: String,
    pub reason: Vec<String>,
    pub event_files: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub converted: bool,
}

/// Everything a subject job needs, shared read-only across workers.
pub struct BatchContext {
    pub dcm2bids: String,
    pub config: PathBuf,
    pub bids_root: PathBuf,
    pub policy: ToolPolicy,
}

impl BatchContext {
    pub fn from_dataset(dataset: &BidsDataset, policy: ToolPolicy) -> Self {
        Self {
            dcm2bids: dataset.tools().dcm2bids.clone(),
            config: dataset.config().to_path_buf(),
            bids_root: dataset.root().to_path_buf(),
            policy,
        }
    }
}

/// Runs every manifest entry, at most `concurrency` subjects at a time.
///
/// dcm2bids runs once per (subject, session) pair; an exact repeat, in the manifest or
/// already on the dataset, is reported as `Skipped` for the layout step but still gets
/// its events split. Converted subjects join the roster afterwards, in manifest order.
/// One subject's failure never stops the others.
pub async fn run_batch(
    dataset: &mut BidsDataset,
    entries: Vec<SubjectEntry>,
    policy: ToolPolicy,
    concurrency: usize,
) -> Vec<SubjectResult> {
    let ctx = Arc::new(BatchContext::from_dataset(dataset, policy));
    let mp = Arc::new(MultiProgress::new());

    let mut pending = HashSet::new();
    let jobs: Vec<(SubjectEntry, bool)> = entries
        .into_iter()
        .map(|entry| {
            let session = entry.session.as_deref();
            let fresh = !dataset.is_laid_out(&entry.subject, session)
                && pending.insert(layout_key(&entry.subject, session));
            (entry, fresh)
        })
        .collect();

    let results: Vec<(usize, SubjectResult)> = stream::iter(jobs.into_iter().enumerate())
        .map(|(idx, (entry, fresh))| {
            let ctx = ctx.clone();
            let mp = mp.clone();
            async move { (idx, process_subject(ctx, entry, fresh, mp).await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut converted: Vec<&(usize, SubjectResult)> =
        results.iter().filter(|(_, r)| r.converted).collect();
    converted.sort_by_key(|(idx, _)| *idx);
    for (_, r) in converted {
        dataset.record_layout(&r.subject, r.session.as_deref());
    }

    results.into_iter().map(|(_, r)| r).collect()
}

/// Lays out one subject and splits its events file, collecting every failure as a reason.
pub async fn process_subject(
    ctx: Arc<BatchContext>,
    entry: SubjectEntry,
    fresh: bool,
    mp: Arc<MultiProgress>,
) -> SubjectResult {
    let pb = setup_progress_bar(&mp, &entry.subject);
    let mut res = SubjectResult {
        subject: entry.subject.clone(),
        session: entry.session.clone(),
        timestamp: Utc::now(),
        ..Default::default()
    };

    let mut skipped = false;
    if fresh {
        pb.set_message("Running dcm2bids...");
        match convert_subject(
            &ctx.dcm2bids,
            &ctx.config,
            &ctx.bids_root,
            &entry.dicom_dir,
            &entry.subject,
            entry.session.as_deref(),
            ctx.policy,
        )
        .await
        {
            Ok(SubjectOutcome::Converted) => res.converted = true,
            Ok(SubjectOutcome::ToolFailed(msg)) => res.reason.push(msg),
            Ok(SubjectOutcome::Skipped) => skipped = true,
            Err(e) => return finish_with_error(pb, &mut res, format!("Layout failed: {}", e)),
        }
    } else {
        skipped = true;
    }

    if let Some(events) = &entry.events {
        pb.set_message("Splitting events...");
        let func_dir = func_dir(&ctx.bids_root, &entry.subject, entry.session.as_deref());
        match split_events_file(events, &entry.subject, &func_dir, entry.session.as_deref()) {
            Ok(paths) => res.event_files = paths,
            Err(e) => res.reason.push(format!("Events failed: {}", e)),
        }
    }

    res.status = summarize_status(skipped, !res.event_files.is_empty(), &res.reason);
    if res.reason.is_empty() {
        pb.finish_with_message(format!("{} {}", "✓".green(), res.status));
    } else {
        pb.finish_with_message(format!("{} {}", "!".yellow(), res.reason.join("; ")));
    }
    res
}

fn setup_progress_bar(mp: &MultiProgress, prefix: &str) -> ProgressBar {
    let pb = mp.add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{prefix}] {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn finish_with_error(pb: ProgressBar, res: &mut SubjectResult, err: String) -> SubjectResult {
    pb.finish_with_message(format!("{} {}", "✗".red(), err));
    res.status = "Failed".into();
    res.reason.push(err);
    std::mem::take(res)
}

/// `Skipped` when the layout step was skipped cleanly, otherwise Success/Partial/Failed.
pub fn summarize_status(skipped: bool, produced_events: bool, reasons: &[String]) -> String {
    if reasons.is_empty() {
        if skipped && !produced_events {
            "Skipped".into()
        } else {
            "Success".into()
        }
    } else if produced_events {
        "Partial".into()
    } else {
        "Failed".into()
    }
}

pub fn write_reports(csv_path: &Path, json_path: &Path, results: &[SubjectResult]) -> Result<()> {
    write_csv_report(csv_path, results)?;
    write_json_report(json_path, results)?;
    Ok(())
}

fn write_json_report(path: &Path, results: &[SubjectResult]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

fn write_csv_report(path: &Path, results: &[SubjectResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Subject", "Session", "Status", "Reason", "EventFiles", "Timestamp"])?;
    for r in results {
        wtr.write_record(&[
            r.subject.clone(),
            r.session.clone().unwrap_or_default(),
            r.status.clone(),
            r.reason.join("; "),
            r.event_files.len().to_string(),
            r.timestamp.to_rfc3339(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ToolSettings;

    #[test]
    fn test_summarize_status() {
        assert_eq!(summarize_status(false, false, &[]), "Success");
        assert_eq!(summarize_status(true, false, &[]), "Skipped");
        assert_eq!(summarize_status(true, true, &[]), "Success");
        assert_eq!(summarize_status(false, true, &["x".to_string()]), "Partial");
        assert_eq!(summarize_status(false, false, &["x".to_string()]), "Failed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_isolates_subject_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, "{}").unwrap();

        let good_events = dir.path().join("s3.csv");
        std::fs::write(
            &good_events,
            "run,task,onset,duration,trial_type\n1,A,0.5,1.0,go\n2,A,0.0,1.0,go\n",
        )
        .unwrap();
        let bad_events = dir.path().join("s4.csv");
        std::fs::write(&bad_events, "run,task,onset\n1,A,0.5\n").unwrap();

        let root = dir.path().join("bids");
        let tools = ToolSettings {
            dcm2bids: "true".into(),
            dcm2niix: "true".into(),
        };
        let mut dataset = BidsDataset::new(&root, &config, tools);

        let entries = vec![
            SubjectEntry {
                subject: "3".into(),
                dicom_dir: dir.path().to_path_buf(),
                session: None,
                events: Some(good_events),
            },
            SubjectEntry {
                subject: "4".into(),
                dicom_dir: dir.path().to_path_buf(),
                session: None,
                events: Some(bad_events),
            },
            SubjectEntry {
                subject: "3".into(),
                dicom_dir: dir.path().to_path_buf(),
                session: None,
                events: None,
            },
            SubjectEntry {
                subject: "sub-03".into(),
                dicom_dir: dir.path().to_path_buf(),
                session: Some("2".into()),
                events: None,
            },
        ];

        let results = run_batch(&mut dataset, entries, ToolPolicy::Tolerate, 2).await;
        assert_eq!(results.len(), 4);

        let find = |subject: &str, session: Option<&str>, status: &str| {
            results
                .iter()
                .find(|r| {
                    r.subject == subject && r.session.as_deref() == session && r.status == status
                })
                .unwrap_or_else(|| panic!("no {status} result for {subject} {session:?}"))
        };

        assert!(!find("3", None, "Skipped").converted);
        let first = find("3", None, "Success");
        assert!(first.converted);
        assert_eq!(first.event_files.len(), 2);
        assert!(root.join("sub-03/func/sub-03_task-A_run-02_events.tsv").exists());
        assert!(find("sub-03", Some("2"), "Success").converted);

        let failed = find("4", None, "Failed");
        assert!(failed.reason[0].contains("duration"));

        assert_eq!(dataset.roster().len(), 2);
        assert_eq!(dataset.roster().entries()[0].original, "3");
        assert!(dataset.is_laid_out("3", Some("02")));
        assert!(dataset.is_laid_out("4", None));

        let csv_path = dir.path().join("report.csv");
        let json_path = dir.path().join("report.json");
        write_reports(&csv_path, &json_path, &results).unwrap();
        let csv = std::fs::read_to_string(csv_path).unwrap();
        assert!(csv.starts_with("Subject,Session,Status,Reason,EventFiles,Timestamp\n"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_layout_stays_off_the_roster() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, "{}").unwrap();
        let tools = ToolSettings {
            dcm2bids: "false".into(),
            dcm2niix: "false".into(),
        };
        let mut dataset = BidsDataset::new(dir.path().join("bids"), &config, tools);
        let entry = SubjectEntry {
            subject: "5".into(),
            dicom_dir: dir.path().to_path_buf(),
            session: None,
            events: None,
        };

        for _ in 0..2 {
            let results = run_batch(&mut dataset, vec![entry.clone()], ToolPolicy::Fail, 1).await;
            assert_eq!(results[0].status, "Failed");
            assert!(results[0].reason[0].starts_with("Layout failed"));
        }
        assert!(dataset.roster().is_empty());
        assert!(!dataset.is_laid_out("5", None));
    }
}
