use crate::cell::{CellPos, col_to_letter, get_cell_name};
use crate::config::CollabConfig;
use crate::error::{Result, SheetError};
use crate::format::SheetFormatting;
use crate::formula::{self, CellSource};
use crate::inventory;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type SheetId = i64;

pub const DEFAULT_ROW_LABEL: &str = "#";

/// One grid row: a value per declared column, stored positionally.
///
/// Rows are only created and reshaped by [`Sheet`], which keeps every row the
/// same width as the column registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<String>,
}

impl Row {
    fn blank(width: usize) -> Self {
        Row {
            cells: vec![String::new(); width],
        }
    }

    pub fn values(&self) -> &[String] {
        &self.cells
    }

    /// True when every cell is empty (such rows are dropped on save).
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

/// Predefined column sets offered when creating a sheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SheetTemplate {
    Blank,
    Inventory,
    Budget,
}

#[derive(Clone, Copy, Debug)]
struct GridLimits {
    min_rows: usize,
    min_columns: usize,
    column_width: u32,
    row_height: u32,
    collapsed_row_height: u32,
}

impl From<&CollabConfig> for GridLimits {
    fn from(config: &CollabConfig) -> Self {
        GridLimits {
            min_rows: config.min_rows,
            min_columns: config.min_columns,
            column_width: config.default_column_width,
            row_height: config.default_row_height,
            collapsed_row_height: config.collapsed_row_height,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sheet {
    pub id: SheetId,
    pub name: String,
    columns: Vec<String>,
    rows: Vec<Row>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Whether read-only viewers can see this sheet.
    pub visible_to_viewers: bool,
    pub password_protected: bool,
    row_label_header: String,
    row_labels: BTreeMap<usize, String>,
    column_widths: BTreeMap<usize, u32>,
    row_heights: BTreeMap<usize, u32>,
    collapsed_rows: BTreeSet<usize>,
    collapsed_columns: BTreeSet<usize>,
    selection: Option<CellPos>,
    formatting: SheetFormatting,
    limits: GridLimits,
}

impl Sheet {
    /// Empty sheet with the configured number of blank rows and single-letter
    /// columns (A, B, C, ...).
    pub fn new(id: SheetId, name: &str, config: &CollabConfig) -> Self {
        let columns = (0..config.default_columns).map(col_to_letter).collect();
        Self::build(id, name, columns, config.default_rows, config)
    }

    /// Sheet with an explicit column list. Names must be unique and non-empty.
    pub fn with_columns(
        id: SheetId,
        name: &str,
        columns: Vec<String>,
        rows: usize,
        config: &CollabConfig,
    ) -> Result<Self> {
        if columns.len() < config.min_columns {
            return Err(SheetError::TooFewColumns {
                min: config.min_columns,
            });
        }
        for (i, column) in columns.iter().enumerate() {
            if column.trim().is_empty() {
                return Err(SheetError::UnknownColumn(column.clone()));
            }
            if columns[..i].contains(column) {
                return Err(SheetError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self::build(id, name, columns, rows.max(config.min_rows), config))
    }

    /// Sheet from a template: its column set, sample rows, then blank rows up to
    /// the configured default.
    pub fn from_template(
        id: SheetId,
        name: &str,
        template: SheetTemplate,
        config: &CollabConfig,
        today: NaiveDate,
    ) -> Self {
        let (columns, samples): (Vec<String>, Vec<Vec<&str>>) = match template {
            SheetTemplate::Blank => return Self::new(id, name, config),
            SheetTemplate::Inventory => {
                let (ins, outs) = inventory::ledger_column_names(today);
                (
                    vec![
                        "Item".to_string(),
                        "Unit".to_string(),
                        config.baseline_column.clone(),
                        ins,
                        outs,
                        config.total_column.clone(),
                    ],
                    vec![
                        vec!["Gloves", "box", "40", "", "", "40"],
                        vec!["Syringes", "pack", "120", "", "", "120"],
                        vec!["Bandages", "roll", "60", "", "", "60"],
                    ],
                )
            }
            SheetTemplate::Budget => (
                ["Category", "Planned", "Actual", "Difference"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                vec![
                    vec!["Rent", "1200", "1200", ""],
                    vec!["Supplies", "300", "", ""],
                    vec!["Travel", "450", "", ""],
                ],
            ),
        };

        let rows = config.default_rows.max(samples.len());
        let mut sheet = Self::build(id, name, columns, rows, config);
        for (r, sample) in samples.iter().enumerate() {
            for (c, value) in sample.iter().enumerate() {
                sheet.rows[r].cells[c] = value.to_string();
            }
        }
        sheet
    }

    fn build(
        id: SheetId,
        name: &str,
        columns: Vec<String>,
        rows: usize,
        config: &CollabConfig,
    ) -> Self {
        let now = Utc::now();
        let width = columns.len();
        Sheet {
            id,
            name: name.to_string(),
            columns,
            rows: (0..rows).map(|_| Row::blank(width)).collect(),
            created_at: now,
            updated_at: now,
            visible_to_viewers: true,
            password_protected: false,
            row_label_header: DEFAULT_ROW_LABEL.to_string(),
            row_labels: BTreeMap::new(),
            column_widths: BTreeMap::new(),
            row_heights: BTreeMap::new(),
            collapsed_rows: BTreeSet::new(),
            collapsed_columns: BTreeSet::new(),
            selection: None,
            formatting: SheetFormatting::new(),
            limits: GridLimits::from(config),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| SheetError::UnknownColumn(name.to_string()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.columns.get(index).map(String::as_str)
    }

    /// Raw stored value. Out-of-range access is an error, never an empty string.
    pub fn get_cell(&self, row: usize, column: &str) -> Result<&str> {
        let col = self.require_column(column)?;
        self.get_cell_at(CellPos::new(row, col))
    }

    pub fn get_cell_at(&self, pos: CellPos) -> Result<&str> {
        self.rows
            .get(pos.row)
            .and_then(|r| r.cells.get(pos.col))
            .map(String::as_str)
            .ok_or_else(|| self.out_of_range(pos))
    }

    /// Store a raw value. Formulas are not evaluated here.
    pub fn set_cell(&mut self, row: usize, column: &str, value: &str) -> Result<()> {
        let col = self.require_column(column)?;
        self.set_cell_at(CellPos::new(row, col), value)
    }

    pub fn set_cell_at(&mut self, pos: CellPos, value: &str) -> Result<()> {
        if pos.row >= self.rows.len() || pos.col >= self.columns.len() {
            return Err(self.out_of_range(pos));
        }
        let cell = &mut self.rows[pos.row].cells[pos.col];
        if cell != value {
            *cell = value.to_string();
            self.touch();
        }
        Ok(())
    }

    fn out_of_range(&self, pos: CellPos) -> SheetError {
        SheetError::OutOfRange {
            row: pos.row,
            column: self
                .column_name(pos.col)
                .map(str::to_string)
                .unwrap_or_else(|| col_to_letter(pos.col)),
        }
    }

    /// Value as shown to the user: formulas are evaluated on every read.
    pub fn display_value(&self, row: usize, column: &str) -> Result<String> {
        let col = self.require_column(column)?;
        self.display_value_at(CellPos::new(row, col))
    }

    pub fn display_value_at(&self, pos: CellPos) -> Result<String> {
        let raw = self.get_cell_at(pos)?;
        if formula::is_formula(raw) {
            Ok(formula::evaluate(raw, self))
        } else {
            Ok(raw.to_string())
        }
    }

    /// Reference string ("C7") for a row and column name.
    pub fn cell_ref(&self, row: usize, column: &str) -> Result<String> {
        let col = self.require_column(column)?;
        Ok(get_cell_name(row, col))
    }

    fn check_new_column_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SheetError::UnknownColumn(name.to_string()));
        }
        if self.has_column(name) {
            return Err(SheetError::DuplicateColumn(name.to_string()));
        }
        Ok(())
    }

    /// Append a column, back-filling every row with an empty value.
    pub fn add_column(&mut self, name: &str) -> Result<usize> {
        let index = self.columns.len();
        self.insert_column(index, name)?;
        Ok(index)
    }

    /// Insert a column before `index` (or append when `index == column_count`).
    pub fn insert_column(&mut self, index: usize, name: &str) -> Result<()> {
        self.check_new_column_name(name)?;
        if index > self.columns.len() {
            return Err(SheetError::OutOfRange {
                row: 0,
                column: col_to_letter(index),
            });
        }
        self.columns.insert(index, name.to_string());
        for row in &mut self.rows {
            row.cells.insert(index, String::new());
        }
        shift_keys_up(&mut self.column_widths, index);
        shift_set_up(&mut self.collapsed_columns, index);
        self.formatting.column_inserted(index);
        if let Some(sel) = self.selection.as_mut() {
            if sel.col >= index {
                sel.col += 1;
            }
        }
        self.touch();
        Ok(())
    }

    /// Remove a column from the registry and every row. Refused at the minimum
    /// column count.
    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        let index = self.require_column(name)?;
        if self.columns.len() <= self.limits.min_columns {
            return Err(SheetError::TooFewColumns {
                min: self.limits.min_columns,
            });
        }
        self.columns.remove(index);
        for row in &mut self.rows {
            row.cells.remove(index);
        }
        shift_keys_down(&mut self.column_widths, index);
        shift_set_down(&mut self.collapsed_columns, index);
        self.formatting.column_removed(index);
        self.selection = match self.selection {
            Some(sel) if sel.col == index => None,
            Some(sel) if sel.col > index => Some(CellPos::new(sel.row, sel.col - 1)),
            other => other,
        };
        self.touch();
        Ok(())
    }

    /// Rename a column in place; values stay attached to it.
    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        let index = self.require_column(old)?;
        if old == new {
            return Ok(());
        }
        self.check_new_column_name(new)?;
        self.columns[index] = new.to_string();
        self.touch();
        Ok(())
    }

    /// Append a blank row and return its index.
    pub fn add_row(&mut self) -> usize {
        self.rows.push(Row::blank(self.columns.len()));
        self.touch();
        self.rows.len() - 1
    }

    /// Append blank rows until there are at least `count`. Returns how many were added.
    pub fn ensure_rows(&mut self, count: usize) -> usize {
        let before = self.rows.len();
        while self.rows.len() < count {
            self.rows.push(Row::blank(self.columns.len()));
        }
        if self.rows.len() != before {
            self.touch();
        }
        self.rows.len() - before
    }

    /// Remove a row. Refused at or below the minimum row count.
    pub fn remove_row(&mut self, index: usize) -> Result<()> {
        if self.rows.len() <= self.limits.min_rows {
            return Err(SheetError::TooFewRows {
                min: self.limits.min_rows,
            });
        }
        if index >= self.rows.len() {
            return Err(SheetError::OutOfRange {
                row: index,
                column: String::new(),
            });
        }
        self.rows.remove(index);
        shift_keys_down(&mut self.row_labels, index);
        shift_keys_down(&mut self.row_heights, index);
        shift_set_down(&mut self.collapsed_rows, index);
        self.formatting.row_removed(index);
        self.selection = match self.selection {
            Some(sel) if sel.row == index => None,
            Some(sel) if sel.row > index => Some(CellPos::new(sel.row - 1, sel.col)),
            other => other,
        };
        self.touch();
        Ok(())
    }

    /// Replace the whole grid with `columns` and `rows` (used on full reload).
    /// Missing values become empty and unknown keys are dropped.
    pub(crate) fn replace_grid(&mut self, columns: Vec<String>, rows: Vec<Vec<String>>) {
        let width = columns.len();
        self.columns = columns;
        self.rows = rows
            .into_iter()
            .map(|mut cells| {
                cells.resize(width, String::new());
                Row { cells }
            })
            .collect();
        let min = self.limits.min_rows;
        self.ensure_rows(min);
        self.selection = self
            .selection
            .filter(|s| s.row < self.rows.len() && s.col < width);
        self.touch();
    }

    /// Every row's key set equals the column list.
    pub fn is_rectangular(&self) -> bool {
        self.rows.iter().all(|r| r.cells.len() == self.columns.len())
    }

    pub fn row_label_header(&self) -> &str {
        &self.row_label_header
    }

    pub fn rename_row_label_header(&mut self, header: &str) {
        self.row_label_header = header.to_string();
        self.touch();
    }

    /// Custom label for a row, or its 1-based number.
    pub fn row_label(&self, index: usize) -> String {
        self.row_labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| (index + 1).to_string())
    }

    pub fn custom_row_labels(&self) -> &BTreeMap<usize, String> {
        &self.row_labels
    }

    pub fn clear_row_labels(&mut self) {
        self.row_labels.clear();
    }

    pub fn set_row_label(&mut self, index: usize, label: Option<&str>) {
        match label {
            Some(l) if !l.is_empty() => {
                self.row_labels.insert(index, l.to_string());
            }
            _ => {
                self.row_labels.remove(&index);
            }
        }
    }

    pub fn column_width(&self, index: usize) -> u32 {
        if self.collapsed_columns.contains(&index) {
            return 0;
        }
        self.column_widths
            .get(&index)
            .copied()
            .unwrap_or(self.limits.column_width)
    }

    pub fn set_column_width(&mut self, index: usize, width: u32) {
        self.column_widths.insert(index, width);
    }

    pub fn row_height(&self, index: usize) -> u32 {
        if self.collapsed_rows.contains(&index) {
            return self.limits.collapsed_row_height;
        }
        self.row_heights
            .get(&index)
            .copied()
            .unwrap_or(self.limits.row_height)
    }

    pub fn set_row_height(&mut self, index: usize, height: u32) {
        self.row_heights.insert(index, height);
    }

    /// Visually compress a row. Data is kept; a selection anchored on the row is cleared.
    pub fn collapse_row(&mut self, index: usize) {
        self.collapsed_rows.insert(index);
        if self.selection.is_some_and(|s| s.row == index) {
            self.selection = None;
        }
    }

    pub fn expand_row(&mut self, index: usize) {
        self.collapsed_rows.remove(&index);
    }

    pub fn is_row_collapsed(&self, index: usize) -> bool {
        self.collapsed_rows.contains(&index)
    }

    pub fn collapse_column(&mut self, index: usize) {
        self.collapsed_columns.insert(index);
        if self.selection.is_some_and(|s| s.col == index) {
            self.selection = None;
        }
    }

    pub fn expand_column(&mut self, index: usize) {
        self.collapsed_columns.remove(&index);
    }

    pub fn is_column_collapsed(&self, index: usize) -> bool {
        self.collapsed_columns.contains(&index)
    }

    pub fn select(&mut self, pos: CellPos) -> Result<()> {
        self.get_cell_at(pos)?;
        self.selection = Some(pos);
        Ok(())
    }

    pub fn selection(&self) -> Option<CellPos> {
        self.selection
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    pub fn formatting(&self) -> &SheetFormatting {
        &self.formatting
    }

    pub fn formatting_mut(&mut self) -> &mut SheetFormatting {
        &mut self.formatting
    }

    pub(crate) fn set_formatting(&mut self, formatting: SheetFormatting) {
        self.formatting = formatting;
    }
}

impl CellSource for Sheet {
    fn raw(&self, pos: CellPos) -> Option<&str> {
        self.get_cell_at(pos).ok()
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }
}

/// Re-key an index map after an insertion at `at`.
fn shift_keys_up<T>(map: &mut BTreeMap<usize, T>, at: usize) {
    let tail = map.split_off(&at);
    map.extend(tail.into_iter().map(|(k, v)| (k + 1, v)));
}

/// Re-key an index map after removing index `at`; the entry for `at` is dropped.
fn shift_keys_down<T>(map: &mut BTreeMap<usize, T>, at: usize) {
    let mut tail = map.split_off(&at);
    tail.remove(&at);
    map.extend(tail.into_iter().map(|(k, v)| (k - 1, v)));
}

fn shift_set_up(set: &mut BTreeSet<usize>, at: usize) {
    let tail = set.split_off(&at);
    set.extend(tail.into_iter().map(|k| k + 1));
}

fn shift_set_down(set: &mut BTreeSet<usize>, at: usize) {
    let mut tail = set.split_off(&at);
    tail.remove(&at);
    set.extend(tail.into_iter().map(|k| k - 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sheet() -> Sheet {
        Sheet::new(1, "Test", &CollabConfig::default())
    }

    #[test]
    fn test_new_sheet_defaults() {
        let sheet = sheet();
        assert_eq!(sheet.row_count(), 100);
        assert_eq!(sheet.columns(), &["A", "B", "C", "D", "E", "F", "G", "H"]);
        assert!(sheet.is_rectangular());
        assert_eq!(sheet.row_label(0), "1");
        assert_eq!(sheet.row_label_header(), "#");
    }

    #[test]
    fn test_get_out_of_range_is_an_error() {
        let sheet = sheet();
        assert!(matches!(
            sheet.get_cell(100, "A"),
            Err(SheetError::OutOfRange { row: 100, .. })
        ));
        assert!(matches!(
            sheet.get_cell(0, "Z"),
            Err(SheetError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_add_column_backfills_and_rejects_duplicates() {
        let mut sheet = sheet();
        sheet.set_cell(3, "B", "x").unwrap();
        assert_eq!(sheet.add_column("Notes").unwrap(), 8);
        assert_eq!(sheet.get_cell(99, "Notes").unwrap(), "");
        assert!(matches!(
            sheet.add_column("Notes"),
            Err(SheetError::DuplicateColumn(_))
        ));
        // Exact match only
        sheet.add_column("notes").unwrap();
        assert!(sheet.is_rectangular());
        assert_eq!(sheet.get_cell(3, "B").unwrap(), "x");
    }

    #[test]
    fn test_remove_last_column_refused() {
        let config = CollabConfig::default();
        let mut sheet =
            Sheet::with_columns(1, "One", vec!["Only".to_string()], 10, &config).unwrap();
        assert!(matches!(
            sheet.remove_column("Only"),
            Err(SheetError::TooFewColumns { min: 1 })
        ));
    }

    #[test]
    fn test_remove_row_respects_minimum() {
        let config = CollabConfig::default();
        let mut sheet = Sheet::with_columns(1, "S", vec!["A".to_string()], 11, &config).unwrap();
        sheet.remove_row(0).unwrap();
        assert_eq!(sheet.row_count(), 10);
        assert!(matches!(
            sheet.remove_row(0),
            Err(SheetError::TooFewRows { min: 10 })
        ));
    }

    #[test]
    fn test_rename_column_keeps_values() {
        let mut sheet = sheet();
        sheet.set_cell(0, "C", "42").unwrap();
        sheet.rename_column("C", "Qty").unwrap();
        assert_eq!(sheet.get_cell(0, "Qty").unwrap(), "42");
        assert!(!sheet.has_column("C"));
        assert!(matches!(
            sheet.rename_column("Qty", "A"),
            Err(SheetError::DuplicateColumn(_))
        ));
    }

    #[test]
    fn test_insert_column_shifts_widths_and_formats() {
        let mut sheet = sheet();
        sheet.set_column_width(2, 300);
        sheet
            .formatting_mut()
            .update(CellPos::new(0, 2), |f| f.bold = true);
        sheet.insert_column(1, "New").unwrap();
        assert_eq!(sheet.column_width(3), 300);
        assert_eq!(sheet.column_width(2), 120);
        assert!(sheet.formatting().get(CellPos::new(0, 3)).is_some());
        assert_eq!(sheet.column_name(1), Some("New"));
    }

    #[test]
    fn test_collapse_row_clears_selection() {
        let mut sheet = sheet();
        sheet.select(CellPos::new(4, 0)).unwrap();
        sheet.collapse_row(4);
        assert_eq!(sheet.selection(), None);
        assert_eq!(sheet.row_height(4), 4);
        assert_eq!(sheet.get_cell(4, "A").unwrap(), "");
        sheet.expand_row(4);
        assert_eq!(sheet.row_height(4), 24);
    }

    #[test]
    fn test_row_labels_follow_removed_rows() {
        let mut sheet = sheet();
        sheet.set_row_label(5, Some("Totals"));
        sheet.remove_row(2).unwrap();
        assert_eq!(sheet.row_label(4), "Totals");
        assert_eq!(sheet.row_label(5), "6");
    }

    #[test]
    fn test_display_value_evaluates_formula() {
        let mut sheet = sheet();
        sheet.set_cell(0, "A", "10").unwrap();
        sheet.set_cell(1, "A", "=A1*3").unwrap();
        assert_eq!(sheet.display_value(1, "A").unwrap(), "30");
        assert_eq!(sheet.get_cell(1, "A").unwrap(), "=A1*3");
    }

    #[test]
    fn test_budget_template() {
        let config = CollabConfig::default();
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let sheet = Sheet::from_template(2, "Budget", SheetTemplate::Budget, &config, today);
        assert_eq!(sheet.columns(), &["Category", "Planned", "Actual", "Difference"]);
        assert_eq!(sheet.get_cell(0, "Planned").unwrap(), "1200");
        assert_eq!(sheet.row_count(), 100);
    }
}
