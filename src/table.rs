//! Small in-memory table of text cells used for events and demographics.
//!
//! Cells keep the exact text read from disk so re-written files never reformat numbers.

use crate::error::{BidsError, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Builds a table from headers and rows. Short rows are padded with empty cells and
    /// long rows cut to the header width; `read_path` rejects long rows before this.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { headers, rows }
    }

    /// Reads a delimited file. `.csv` uses commas, everything else tabs.
    ///
    /// Short records are padded; a record wider than the header is an error.
    pub fn read_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter_for(path))
            .flexible(true)
            .from_path(path)
            .map_err(|e| BidsError::table(path, e))?;

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| BidsError::table(path, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| BidsError::table(path, e))?;
            // Blank lines come through as a single empty field.
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }
            if record.len() > headers.len() {
                return Err(BidsError::RaggedRow {
                    path: path.to_path_buf(),
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    fields: record.len(),
                    columns: headers.len(),
                });
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::new(headers, rows))
    }

    /// Writes the table as tab-separated values with a header row.
    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .terminator(csv::Terminator::Any(b'\n'))
            .from_path(path)
            .map_err(|e| BidsError::table(path, e))?;

        wtr.write_record(&self.headers)
            .map_err(|e| BidsError::table(path, e))?;
        for row in &self.rows {
            wtr.write_record(row).map_err(|e| BidsError::table(path, e))?;
        }
        wtr.flush().map_err(|e| BidsError::io(path, e))?;
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Returns the cells of one column, or `None` if it does not exist.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// Fails with `InvalidInput` naming every absent column.
    pub fn require_columns(&self, context: &str, required: &[&str]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|c| self.column_index(c).is_none())
            .map(|c| c.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BidsError::InvalidInput {
                context: context.to_string(),
                missing,
                required: required.iter().map(|c| c.to_string()).collect(),
            })
        }
    }

    /// Keeps only `columns`, in that order.
    pub fn select(&self, columns: &[&str]) -> Result<Self> {
        self.require_columns("table", columns)?;
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();

        Ok(Self {
            headers: columns.iter().map(|c| c.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| indices.iter().map(|&i| r[i].clone()).collect())
                .collect(),
        })
    }

    /// Removes a column if present.
    pub fn drop_column(&self, name: &str) -> Self {
        let Some(idx) = self.column_index(name) else {
            return self.clone();
        };

        let mut out = self.clone();
        out.headers.remove(idx);
        for row in &mut out.rows {
            row.remove(idx);
        }
        out
    }

    /// Rewrites every cell of `column` through `f`.
    pub fn map_column(&mut self, column: &str, f: impl Fn(&str) -> String) {
        if let Some(idx) = self.column_index(column) {
            for row in &mut self.rows {
                row[idx] = f(&row[idx]);
            }
        }
    }

    /// Partitions rows by the values of `keys`, in order of first appearance.
    ///
    /// Each group keeps every column and the original relative row order.
    pub fn group_by(&self, keys: &[&str]) -> Result<Vec<(Vec<String>, Table)>> {
        self.require_columns("table", keys)?;
        let key_idx: Vec<usize> = keys.iter().filter_map(|k| self.column_index(k)).collect();

        let mut order: Vec<Vec<String>> = Vec::new();
        let mut groups: HashMap<Vec<String>, Vec<Vec<String>>> = HashMap::new();

        for row in &self.rows {
            let key: Vec<String> = key_idx.iter().map(|&i| row[i].trim().to_string()).collect();
            let bucket = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            bucket.push(row.clone());
        }

        Ok(order
            .into_iter()
            .map(|key| {
                let rows = groups.remove(&key).unwrap_or_default();
                let table = Table {
                    headers: self.headers.clone(),
                    rows,
                };
                (key, table)
            })
            .collect())
    }
}

fn delimiter_for(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("csv") => b',',
        _ => b'\t',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(
            vec!["run".into(), "task".into(), "onset".into()],
            vec![
                vec!["2".into(), "A".into(), "0.0".into()],
                vec!["1".into(), "A".into(), "0.5".into()],
                vec!["2".into(), "A".into(), "3.0".into()],
                vec!["1".into(), "B".into(), "1.5".into()],
            ],
        )
    }

    #[test]
    fn test_group_by_first_appearance_order() {
        let groups = sample().group_by(&["run", "task"]).unwrap();
        let keys: Vec<Vec<String>> = groups.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                vec!["2".to_string(), "A".to_string()],
                vec!["1".to_string(), "A".to_string()],
                vec!["1".to_string(), "B".to_string()],
            ]
        );
        assert_eq!(groups[0].1.column("onset").unwrap(), vec!["0.0", "3.0"]);
    }

    #[test]
    fn test_require_columns_reports_all_missing() {
        let err = sample()
            .require_columns("event table", &["run", "duration", "trial_type"])
            .unwrap_err();
        match err {
            BidsError::InvalidInput { missing, .. } => {
                assert_eq!(missing, vec!["duration".to_string(), "trial_type".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_select_and_drop() {
        let t = sample();
        let picked = t.select(&["onset", "run"]).unwrap();
        assert_eq!(picked.headers(), &["onset".to_string(), "run".to_string()]);
        assert_eq!(picked.rows()[1], vec!["0.5".to_string(), "1".to_string()]);

        let dropped = t.drop_column("run");
        assert_eq!(dropped.headers(), &["task".to_string(), "onset".to_string()]);
        assert_eq!(dropped.len(), 4);
        assert_eq!(t.drop_column("missing"), t);
    }

    #[test]
    fn test_read_csv_and_write_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("events.csv");
        std::fs::write(&src, "run,task,onset\n1,A,0.50\n\n2,B,1\n").unwrap();

        let table = Table::read_path(&src).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("onset").unwrap(), vec!["0.50", "1"]);

        let out = dir.path().join("events.tsv");
        table.write_tsv(&out).unwrap();
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "run\ttask\tonset\n1\tA\t0.50\n2\tB\t1\n"
        );

        let back = Table::read_path(&out).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let t = Table::new(vec!["a".into(), "b".into()], vec![vec!["1".into()]]);
        assert_eq!(t.rows()[0], vec!["1".to_string(), String::new()]);
    }

    #[test]
    fn test_wide_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("wide.csv");
        std::fs::write(&src, "a,b\n1,2\n1,2,3\n").unwrap();

        match Table::read_path(&src).unwrap_err() {
            BidsError::RaggedRow { line, fields, columns, .. } => {
                assert_eq!((line, fields, columns), (3, 3, 2));
            }
            other => panic!("unexpected error: {other}"),
        }

        let short = dir.path().join("short.csv");
        std::fs::write(&short, "a,b\n1\n").unwrap();
        assert_eq!(Table::read_path(&short).unwrap().rows()[0], vec!["1", ""]);
    }
}
