use crate::error::Result;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// A loosely-typed table of strings, used between extraction and cleaning
/// where source column sets are ragged and differ per hospital.
///
/// Missing cells are represented as empty strings; every row has exactly
/// `columns.len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Columns from `required` that are absent from this table.
    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|c| self.column_index(c).is_none())
            .map(|c| c.to_string())
            .collect()
    }

    /// Cell value by column name; empty string when the column is absent.
    pub fn value(&self, row: usize, column: &str) -> &str {
        match self.column_index(column) {
            Some(idx) => self.rows[row].get(idx).map(String::as_str).unwrap_or(""),
            None => "",
        }
    }

    /// Lowercase and trim every column name, pandas-style header hygiene.
    pub fn normalize_columns(&mut self) {
        for col in &mut self.columns {
            *col = col.trim().to_lowercase();
        }
    }

    /// Apply a source-name → canonical-name map to the header.
    pub fn rename_columns(&mut self, map: &[(&str, &str)]) {
        for col in &mut self.columns {
            if let Some((_, to)) = map.iter().find(|(from, _)| from == col) {
                *col = (*to).to_string();
            }
        }
    }

    /// Ensure every required column exists, synthesizing empty ones.
    pub fn ensure_columns(&mut self, required: &[&str]) {
        for name in required {
            if self.column_index(name).is_none() {
                debug!("Synthesizing missing column '{}'", name);
                self.push_column(name, vec![String::new(); self.rows.len()]);
            }
        }
    }

    /// Append a column with one value per row.
    pub fn push_column(&mut self, name: &str, values: Vec<String>) {
        assert_eq!(values.len(), self.rows.len());
        self.columns.push(name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    /// Append a column holding the same value in every row.
    pub fn push_constant_column(&mut self, name: &str, value: &str) {
        let n = self.rows.len();
        self.push_column(name, vec![value.to_string(); n]);
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    /// Union of several tables, aligning columns by name. Column order is
    /// first-appearance order; cells absent from a source table are empty.
    pub fn concat(tables: Vec<RawTable>) -> RawTable {
        let mut columns: Vec<String> = Vec::new();
        for table in &tables {
            for col in &table.columns {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
        }

        let mut out = RawTable::new(columns);
        for table in tables {
            let index: HashMap<&str, usize> = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| (c.as_str(), i))
                .collect();
            for row in &table.rows {
                let aligned: Vec<String> = out
                    .columns
                    .iter()
                    .map(|col| {
                        index
                            .get(col.as_str())
                            .and_then(|&i| row.get(i))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect();
                out.rows.push(aligned);
            }
        }
        out
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let mut table = RawTable::new(columns);
        for record in reader.records() {
            let record = record?;
            table.push_row(record.iter().map(|f| f.to_string()).collect());
        }
        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        crate::store::write_raw_csv_atomic(path, &self.columns, &self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawTable {
        let mut t = RawTable::new(vec!["ID".to_string(), " F_Name ".to_string()]);
        t.push_row(vec!["1".to_string(), "amy".to_string()]);
        t.push_row(vec!["2".to_string(), "bob".to_string()]);
        t
    }

    #[test]
    fn normalize_and_rename_headers() {
        let mut t = sample();
        t.normalize_columns();
        assert_eq!(t.columns, vec!["id", "f_name"]);

        t.rename_columns(&[("id", "patientid"), ("f_name", "firstname")]);
        assert_eq!(t.columns, vec!["patientid", "firstname"]);
        assert_eq!(t.value(0, "patientid"), "1");
    }

    #[test]
    fn ensure_columns_synthesizes_empty_cells() {
        let mut t = sample();
        t.normalize_columns();
        t.ensure_columns(&["id", "insurance"]);
        assert_eq!(t.missing_columns(&["insurance"]), Vec::<String>::new());
        assert_eq!(t.value(1, "insurance"), "");
    }

    #[test]
    fn concat_aligns_by_column_name() {
        let mut a = RawTable::new(vec!["id".to_string(), "name".to_string()]);
        a.push_row(vec!["1".to_string(), "amy".to_string()]);
        let mut b = RawTable::new(vec!["name".to_string(), "npi".to_string()]);
        b.push_row(vec!["bob".to_string(), "999".to_string()]);

        let merged = RawTable::concat(vec![a, b]);
        assert_eq!(merged.columns, vec!["id", "name", "npi"]);
        assert_eq!(merged.value(0, "npi"), "");
        assert_eq!(merged.value(1, "id"), "");
        assert_eq!(merged.value(1, "npi"), "999");
    }
}
