//! Header-addressed tabs and the CSV-directory store used for local runs.
//!
//! A tab is a header row plus data rows. Cells are addressed by header name,
//! compared trimmed and case-insensitively; column order never matters.

use std::fs;
use std::path::{Path, PathBuf};

use lead_core::ledger::Row;

use crate::error::StoreError;

/// Row-oriented access to named tabs.
pub trait TabularStore {
    /// Creates `tab` with `headers` when it does not exist or has no header
    /// row. Existing tabs are left alone.
    fn ensure_tab(&self, tab: &str, headers: &[&str]) -> Result<(), StoreError>;

    /// Every non-blank data row, keyed by the tab's header cells.
    fn read_all_rows(&self, tab: &str) -> Result<Vec<Row>, StoreError>;

    /// Appends `row`. Keys the tab has no column for are dropped.
    fn append_row(&self, tab: &str, row: &Row) -> Result<(), StoreError>;

    /// Overwrites `fields` on the first row whose cells equal every value in
    /// `criteria`. A blank criterion also matches a missing cell.
    fn update_first_matching(
        &self,
        tab: &str,
        criteria: &Row,
        fields: &Row,
    ) -> Result<(), StoreError>;

    /// Overwrites `fields` on the first row whose `key_column` equals `key`.
    fn update_row(
        &self,
        tab: &str,
        key_column: &str,
        key: &str,
        fields: &Row,
    ) -> Result<(), StoreError> {
        let criteria = Row::from([(key_column.to_string(), key.to_string())]);
        self.update_first_matching(tab, &criteria, fields)
    }
}

pub fn column_index(headers: &[String], name: &str) -> Option<usize> {
    let name = name.trim();
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}

/// In-memory image of one tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn with_headers(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|header| (*header).to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// First record is the header row.
    pub fn from_records(records: Vec<Vec<String>>) -> Self {
        let mut records = records.into_iter();
        let headers = records.next().unwrap_or_default();
        Self {
            headers,
            rows: records.collect(),
        }
    }

    pub fn to_rows(&self) -> Vec<Row> {
        self.rows
            .iter()
            .filter(|cells| cells.iter().any(|cell| !cell.trim().is_empty()))
            .map(|cells| {
                self.headers
                    .iter()
                    .enumerate()
                    .filter(|(_, header)| !header.trim().is_empty())
                    .map(|(index, header)| {
                        (
                            header.clone(),
                            cells.get(index).cloned().unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Cells of `row` laid out in header order.
    pub fn cells_for(&self, row: &Row) -> Vec<String> {
        let mut cells = vec![String::new(); self.headers.len()];
        for (key, value) in row {
            match column_index(&self.headers, key) {
                Some(index) => cells[index] = value.clone(),
                None => tracing::debug!(column = %key, "dropping value for unknown column"),
            }
        }
        cells
    }

    /// Index into `rows` of the first non-blank row matching every criterion.
    pub fn find_row(&self, tab: &str, criteria: &Row) -> Result<usize, StoreError> {
        let checks = criteria
            .iter()
            .map(|(column, value)| {
                column_index(&self.headers, column)
                    .map(|index| (index, value.trim()))
                    .ok_or_else(|| StoreError::MissingColumn {
                        tab: tab.to_string(),
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.rows
            .iter()
            .position(|cells| {
                cells.iter().any(|cell| !cell.trim().is_empty())
                    && checks.iter().all(|(index, value)| {
                        cells.get(*index).map(|cell| cell.trim()).unwrap_or_default() == *value
                    })
            })
            .ok_or_else(|| StoreError::RowNotFound {
                tab: tab.to_string(),
                column: criteria.keys().cloned().collect::<Vec<_>>().join(","),
                key: criteria.values().cloned().collect::<Vec<_>>().join(","),
            })
    }

    /// Column index for each updated field, checked before anything is written.
    pub fn update_targets(
        &self,
        tab: &str,
        fields: &Row,
    ) -> Result<Vec<(usize, String)>, StoreError> {
        fields
            .iter()
            .map(|(column, value)| {
                column_index(&self.headers, column)
                    .map(|index| (index, value.clone()))
                    .ok_or_else(|| StoreError::MissingColumn {
                        tab: tab.to_string(),
                        column: column.clone(),
                    })
            })
            .collect()
    }

    pub fn update(&mut self, tab: &str, criteria: &Row, fields: &Row) -> Result<(), StoreError> {
        let position = self.find_row(tab, criteria)?;
        let targets = self.update_targets(tab, fields)?;
        let width = self.headers.len();
        let cells = &mut self.rows[position];
        if cells.len() < width {
            cells.resize(width, String::new());
        }
        for (index, value) in targets {
            cells[index] = value;
        }
        Ok(())
    }
}

/// One `<tab>.csv` file per tab inside a directory.
#[derive(Debug, Clone)]
pub struct CsvTabularStore {
    dir: PathBuf,
}

impl CsvTabularStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, tab: &str) -> PathBuf {
        self.dir.join(format!("{tab}.csv"))
    }

    fn load(&self, tab: &str) -> Result<Option<Table>, StoreError> {
        let path = self.path(tab);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&path)?;
        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            records.push(record.iter().map(str::to_string).collect());
        }
        Ok(Some(Table::from_records(records)))
    }

    fn load_existing(&self, tab: &str) -> Result<Table, StoreError> {
        match self.load(tab)? {
            Some(table) if !table.headers.is_empty() => Ok(table),
            _ => Err(StoreError::MissingHeader(tab.to_string())),
        }
    }

    /// Rewrites the whole file through a sibling temp file.
    fn save(&self, tab: &str, table: &Table) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(tab);
        let staging = staging_path(&path);
        {
            let mut writer = csv::WriterBuilder::new()
                .flexible(true)
                .from_path(&staging)?;
            writer.write_record(&table.headers)?;
            for cells in &table.rows {
                writer.write_record(cells)?;
            }
            writer.flush()?;
        }
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

impl TabularStore for CsvTabularStore {
    fn ensure_tab(&self, tab: &str, headers: &[&str]) -> Result<(), StoreError> {
        match self.load(tab)? {
            Some(table) if !table.headers.is_empty() => Ok(()),
            _ => self.save(tab, &Table::with_headers(headers)),
        }
    }

    fn read_all_rows(&self, tab: &str) -> Result<Vec<Row>, StoreError> {
        Ok(self
            .load(tab)?
            .map(|table| table.to_rows())
            .unwrap_or_default())
    }

    fn append_row(&self, tab: &str, row: &Row) -> Result<(), StoreError> {
        let mut table = self.load_existing(tab)?;
        let cells = table.cells_for(row);
        table.rows.push(cells);
        self.save(tab, &table)
    }

    fn update_first_matching(
        &self,
        tab: &str,
        criteria: &Row,
        fields: &Row,
    ) -> Result<(), StoreError> {
        let mut table = self.load_existing(tab)?;
        table.update(tab, criteria, fields)?;
        self.save(tab, &table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn creates_tab_and_appends_by_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CsvTabularStore::new(dir.path());

        store.ensure_tab("leads", &["Identity", "Name", "Team"]).expect("ensure");
        store
            .append_row("leads", &row(&[("team", "A"), ("identity", "k1"), ("Extra", "x")]))
            .expect("append");

        let rows = store.read_all_rows("leads").expect("read");
        assert_eq!(rows, vec![row(&[("Identity", "k1"), ("Name", ""), ("Team", "A")])]);
    }

    #[test]
    fn ensure_tab_keeps_existing_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("meta.csv"), "Status,id,Full Name\n,7,Ana\n").expect("seed");
        let store = CsvTabularStore::new(dir.path());

        store.ensure_tab("meta", &["Identity"]).expect("ensure");
        let rows = store.read_all_rows("meta").expect("read");
        assert_eq!(rows[0].get("Full Name").map(String::as_str), Some("Ana"));
    }

    #[test]
    fn updates_only_named_cells_of_matching_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("meta.csv"),
            "id,Full Name,Status\n1,Ana,\n2,Bruno\n",
        )
        .expect("seed");
        let store = CsvTabularStore::new(dir.path());

        store
            .update_row("meta", "ID", "2", &row(&[("status", "imported")]))
            .expect("update");

        let rows = store.read_all_rows("meta").expect("read");
        assert_eq!(rows[0].get("Status").map(String::as_str), Some(""));
        assert_eq!(rows[1].get("Status").map(String::as_str), Some("imported"));
        assert_eq!(rows[1].get("Full Name").map(String::as_str), Some("Bruno"));
    }

    #[test]
    fn update_can_require_a_blank_cell() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("meta.csv"), "id,Status\n7,imported\n7\n").expect("seed");
        let store = CsvTabularStore::new(dir.path());
        let criteria = row(&[("id", "7"), ("Status", "")]);

        store
            .update_first_matching("meta", &criteria, &row(&[("Status", "duplicate")]))
            .expect("update");

        let statuses: Vec<String> = store
            .read_all_rows("meta")
            .expect("read")
            .iter()
            .map(|row| row["Status"].clone())
            .collect();
        assert_eq!(statuses, vec!["imported", "duplicate"]);
        assert!(matches!(
            store.update_first_matching("meta", &criteria, &row(&[("Status", "x")])),
            Err(StoreError::RowNotFound { .. })
        ));
    }

    #[test]
    fn update_reports_missing_rows_and_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("meta.csv"), "id,Status\n1,\n").expect("seed");
        let store = CsvTabularStore::new(dir.path());

        assert!(matches!(
            store.update_row("meta", "id", "9", &row(&[("Status", "x")])),
            Err(StoreError::RowNotFound { .. })
        ));
        assert!(matches!(
            store.update_row("meta", "id", "1", &row(&[("Owner", "x")])),
            Err(StoreError::MissingColumn { .. })
        ));
    }

    #[test]
    fn missing_tab_reads_as_empty_but_cannot_be_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CsvTabularStore::new(dir.path());

        assert!(store.read_all_rows("leads").expect("read").is_empty());
        assert!(matches!(
            store.append_row("leads", &row(&[("Identity", "k")])),
            Err(StoreError::MissingHeader(_))
        ));
    }

    #[test]
    fn column_lookup_ignores_case_and_padding() {
        let headers = vec![" Raw Fields ".to_string(), "Team".to_string()];
        assert_eq!(column_index(&headers, "raw fields"), Some(0));
        assert_eq!(column_index(&headers, "Status"), None);
    }
}
