//! Running stock totals for inventory sheets.
//!
//! An inventory sheet has a baseline column ("Maintaining"), a derived total
//! column ("Total") and any number of dated ledger pairs named `IN YYYY-MM-DD`
//! and `OUT YYYY-MM-DD`. For every row:
//!
//! ```text
//! total = baseline + sum(IN columns) - sum(OUT columns)
//! ```
//!
//! and a blank baseline gives a blank total.

use crate::cell::CellPos;
use crate::config::CollabConfig;
use crate::error::{Result, SheetError};
use crate::spreadsheet::Sheet;
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

const DATE_FORMAT: &str = "%Y-%m-%d";

lazy_static! {
    static ref LEDGER_REGEX: Regex = Regex::new(r"^(IN|OUT) (\d{4}-\d{2}-\d{2})$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerKind {
    In,
    Out,
}

/// Column names of the ledger pair for `date`, increment first.
pub fn ledger_column_names(date: NaiveDate) -> (String, String) {
    let day = date.format(DATE_FORMAT);
    (format!("IN {}", day), format!("OUT {}", day))
}

/// Recognise a ledger column name.
pub fn parse_ledger_column(name: &str) -> Option<(LedgerKind, NaiveDate)> {
    let captures = LEDGER_REGEX.captures(name.trim())?;
    let kind = match &captures[1] {
        "IN" => LedgerKind::In,
        _ => LedgerKind::Out,
    };
    let date = NaiveDate::parse_from_str(&captures[2], DATE_FORMAT).ok()?;
    Some((kind, date))
}

/// A ledger column dated before `today`.
pub fn is_historical_column(name: &str, today: NaiveDate) -> bool {
    parse_ledger_column(name).is_some_and(|(_, date)| date < today)
}

/// Column indices that make up the inventory pattern of a sheet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryLayout {
    pub baseline: usize,
    pub total: usize,
    pub ins: Vec<usize>,
    pub outs: Vec<usize>,
}

impl InventoryLayout {
    /// `None` unless the sheet has both the baseline and the total column.
    pub fn detect(sheet: &Sheet, config: &CollabConfig) -> Option<Self> {
        let baseline = sheet.column_index(&config.baseline_column)?;
        let total = sheet.column_index(&config.total_column)?;
        let mut ins = Vec::new();
        let mut outs = Vec::new();
        for (index, name) in sheet.columns().iter().enumerate() {
            match parse_ledger_column(name) {
                Some((LedgerKind::In, _)) => ins.push(index),
                Some((LedgerKind::Out, _)) => outs.push(index),
                None => {}
            }
        }
        Some(InventoryLayout {
            baseline,
            total,
            ins,
            outs,
        })
    }

    /// True when a change to column `col` affects the derived total.
    pub fn affects_total(&self, col: usize) -> bool {
        col == self.baseline || self.ins.contains(&col) || self.outs.contains(&col)
    }

    fn derive_row(&self, sheet: &Sheet, row: usize) -> String {
        let cell = |col: usize| {
            sheet
                .get_cell_at(CellPos::new(row, col))
                .unwrap_or_default()
        };
        let ins: Vec<&str> = self.ins.iter().map(|&c| cell(c)).collect();
        let outs: Vec<&str> = self.outs.iter().map(|&c| cell(c)).collect();
        derive_total(cell(self.baseline), &ins, &outs)
    }
}

pub fn is_inventory(sheet: &Sheet, config: &CollabConfig) -> bool {
    InventoryLayout::detect(sheet, config).is_some()
}

/// Integer value of a ledger entry; anything non-numeric counts as 0.
fn ledger_value(raw: &str) -> i64 {
    let trimmed = raw.trim();
    trimmed.parse::<i64>().unwrap_or_else(|_| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map_or(0, |n| n.trunc() as i64)
    })
}

/// Derived total of one row.
pub fn derive_total(baseline: &str, ins: &[&str], outs: &[&str]) -> String {
    if baseline.trim().is_empty() {
        return String::new();
    }
    // saturating: a huge entry pins the total instead of overflowing
    let sum = |values: &[&str]| values.iter().fold(0i64, |acc, v| acc.saturating_add(ledger_value(v)));
    ledger_value(baseline)
        .saturating_add(sum(ins))
        .saturating_sub(sum(outs))
        .to_string()
}

/// Rewrite the total column of every row. Returns how many cells changed;
/// non-inventory sheets are left alone.
pub fn recompute_totals(sheet: &mut Sheet, config: &CollabConfig) -> usize {
    let Some(layout) = InventoryLayout::detect(sheet, config) else {
        return 0;
    };
    let mut changed = 0;
    for row in 0..sheet.row_count() {
        let total = layout.derive_row(sheet, row);
        let pos = CellPos::new(row, layout.total);
        if sheet.get_cell_at(pos).is_ok_and(|current| current != total)
            && sheet.set_cell_at(pos, &total).is_ok()
        {
            changed += 1;
        }
    }
    changed
}

/// Recompute the total of a single row.
pub fn recompute_row(sheet: &mut Sheet, config: &CollabConfig, row: usize) -> Result<bool> {
    let Some(layout) = InventoryLayout::detect(sheet, config) else {
        return Ok(false);
    };
    let pos = CellPos::new(row, layout.total);
    let total = layout.derive_row(sheet, row);
    if sheet.get_cell_at(pos)? == total {
        return Ok(false);
    }
    sheet.set_cell_at(pos, &total)?;
    Ok(true)
}

/// Dates that already have a ledger column.
pub fn ledger_dates(sheet: &Sheet) -> BTreeSet<NaiveDate> {
    sheet
        .columns()
        .iter()
        .filter_map(|name| parse_ledger_column(name).map(|(_, date)| date))
        .collect()
}

/// Add the `IN`/`OUT` pair for `date` just before the total column (or at the
/// end when there is none) and recompute totals.
///
/// A date that already has ledger columns is rejected with
/// [`SheetError::LedgerDayExists`] and the sheet is untouched.
pub fn add_ledger_day(sheet: &mut Sheet, config: &CollabConfig, date: NaiveDate) -> Result<()> {
    if ledger_dates(sheet).contains(&date) {
        return Err(SheetError::LedgerDayExists(date.format(DATE_FORMAT).to_string()));
    }
    let (ins, outs) = ledger_column_names(date);
    if sheet.has_column(&ins) || sheet.has_column(&outs) {
        return Err(SheetError::LedgerDayExists(date.format(DATE_FORMAT).to_string()));
    }
    let at = sheet
        .column_index(&config.total_column)
        .unwrap_or(sheet.column_count());
    sheet.insert_column(at, &ins)?;
    sheet.insert_column(at + 1, &outs)?;
    recompute_totals(sheet, config);
    Ok(())
}

/// Fraction of the baseline consumed reached `threshold`.
///
/// Blank, non-numeric or non-positive baselines are never critical.
pub fn is_critical(baseline: &str, total: &str, threshold: f64) -> bool {
    let Ok(baseline) = baseline.trim().parse::<f64>() else {
        return false;
    };
    let Ok(total) = total.trim().parse::<f64>() else {
        return false;
    };
    if !(baseline > 0.0) || !total.is_finite() {
        return false;
    }
    (baseline - total) / baseline >= threshold
}

/// Indices of the rows whose stock is critical.
pub fn critical_rows(sheet: &Sheet, config: &CollabConfig) -> Vec<usize> {
    let Some(layout) = InventoryLayout::detect(sheet, config) else {
        return Vec::new();
    };
    (0..sheet.row_count())
        .filter(|&row| {
            let baseline = sheet
                .get_cell_at(CellPos::new(row, layout.baseline))
                .unwrap_or_default();
            let total = sheet
                .get_cell_at(CellPos::new(row, layout.total))
                .unwrap_or_default();
            is_critical(baseline, total, config.critical_threshold)
        })
        .collect()
}
