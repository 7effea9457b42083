//! BIDS entity formatting.
//!
//! Identifiers that are plain integers below 10 get one leading zero; anything else
//! (two or more digits, already padded, alphanumeric) is used as given.

/// Applies the single-leading-zero rule to a subject, session or run identifier.
pub fn zero_pad(id: &str) -> String {
    let trimmed = id.trim();
    match trimmed.parse::<u64>() {
        Ok(n) if n < 10 && trimmed.len() == 1 => format!("0{}", n),
        _ => trimmed.to_string(),
    }
}

/// Bare padded participant id; an existing `sub-` prefix is dropped.
pub fn subject_id(subject: &str) -> String {
    let trimmed = subject.trim();
    zero_pad(trimmed.strip_prefix("sub-").unwrap_or(trimmed))
}

/// Bare padded session id; an existing `ses-` prefix is dropped.
pub fn session_id(session: &str) -> String {
    let trimmed = session.trim();
    zero_pad(trimmed.strip_prefix("ses-").unwrap_or(trimmed))
}

/// `sub-XX` label for a participant identifier.
pub fn subject_label(subject: &str) -> String {
    format!("sub-{}", subject_id(subject))
}

/// `ses-XX` label for a session identifier.
pub fn session_label(session: &str) -> String {
    format!("ses-{}", session_id(session))
}

/// Normalises a participant id for `participants.tsv`.
pub fn participant_id(raw: &str) -> String {
    subject_label(raw)
}

/// BIDS labels are non-empty and ASCII alphanumeric.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Builds `sub-<ZPID>[_ses-<ZSES>]_task-<TASK>_run-<ZRUN>_events.tsv`.
pub fn events_filename(subject: &str, session: Option<&str>, task: &str, run: &str) -> String {
    let mut name = subject_label(subject);
    if let Some(ses) = session {
        name.push('_');
        name.push_str(&session_label(ses));
    }
    format!("{}_task-{}_run-{}_events.tsv", name, task.trim(), zero_pad(run))
}

/// `task-<name>_bold.json`, the dataset-level task sidecar.
pub fn task_sidecar_filename(task: &str) -> String {
    format!("task-{}_bold.json", task.trim())
}
