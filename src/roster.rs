//! Participant roster: which subjects a dataset holds and the ids they were given.
//!
//! The roster only records subjects whose layout step went through, so a failed
//! conversion can be retried.

use serde::Serialize;

/// A subject as it was supplied and the identifier it carries in the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub original: String,
    pub assigned: String,
}

/// Subjects added to a dataset, in the order they were added.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParticipantRoster {
    entries: Vec<RosterEntry>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a subject unless its original id is already present.
    ///
    /// Returns `false` for a repeat, e.g. a second session of the same subject.
    pub fn add(&mut self, original: &str, assigned: &str) -> bool {
        if self.contains(original) {
            return false;
        }
        self.entries.push(RosterEntry {
            original: original.trim().to_string(),
            assigned: assigned.to_string(),
        });
        true
    }

    pub fn contains(&self, original: &str) -> bool {
        let original = original.trim();
        self.entries.iter().any(|e| e.original == original)
    }

    /// Assigned id for an original id, if registered.
    pub fn assigned_for(&self, original: &str) -> Option<&str> {
        let original = original.trim();
        self.entries
            .iter()
            .find(|e| e.original == original)
            .map(|e| e.assigned.as_str())
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rejects_repeat_before_insert() {
        let mut roster = ParticipantRoster::new();
        assert!(roster.add("3", "sub-03"));
        assert!(roster.add("12", "sub-12"));
        assert!(!roster.add("3", "sub-03"));
        assert!(!roster.add(" 3 ", "sub-03"));
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.entries()[0].original, "3");
        assert_eq!(roster.entries()[1].assigned, "sub-12");
    }

    #[test]
    fn test_lookup_and_clear() {
        let mut roster = ParticipantRoster::new();
        roster.add("P7", "sub-P7");
        assert_eq!(roster.assigned_for("P7"), Some("sub-P7"));
        assert_eq!(roster.assigned_for("P8"), None);

        roster.clear();
        assert!(roster.is_empty());
        assert!(!roster.contains("P7"));
    }
}
