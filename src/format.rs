//! Cell formatting and merged ranges.

use crate::cell::CellPos;
use crate::error::{Result, SheetError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

/// Which edges of a cell carry a border.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borders {
    pub top: bool,
    pub right: bool,
    pub bottom: bool,
    pub left: bool,
}

impl Borders {
    pub fn all() -> Self {
        Borders {
            top: true,
            right: true,
            bottom: true,
            left: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.top || self.right || self.bottom || self.left)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFormat {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub font_size: Option<u8>,
    pub align: Option<Alignment>,
    /// Text colour as a CSS-style string, e.g. `#c0392b`
    pub color: Option<String>,
    pub background: Option<String>,
    pub borders: Borders,
}

impl CellFormat {
    /// A format with nothing set carries no information and is not stored.
    pub fn is_plain(&self) -> bool {
        *self == CellFormat::default()
    }
}

/// Inclusive rectangle of merged cells. Only the top-left cell holds content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRange {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

impl MergedRange {
    pub fn new(a: CellPos, b: CellPos) -> Self {
        MergedRange {
            min_row: a.row.min(b.row),
            min_col: a.col.min(b.col),
            max_row: a.row.max(b.row),
            max_col: a.col.max(b.col),
        }
    }

    pub fn anchor(&self) -> CellPos {
        CellPos::new(self.min_row, self.min_col)
    }

    pub fn contains(&self, pos: CellPos) -> bool {
        pos.row >= self.min_row
            && pos.row <= self.max_row
            && pos.col >= self.min_col
            && pos.col <= self.max_col
    }

    pub fn overlaps(&self, other: &MergedRange) -> bool {
        self.min_row <= other.max_row
            && other.min_row <= self.max_row
            && self.min_col <= other.max_col
            && other.min_col <= self.max_col
    }

    fn is_single_cell(&self) -> bool {
        self.min_row == self.max_row && self.min_col == self.max_col
    }
}

/// Per-cell formats plus the list of merged ranges of one sheet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetFormatting {
    cells: BTreeMap<CellPos, CellFormat>,
    merges: Vec<MergedRange>,
}

impl SheetFormatting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pos: CellPos) -> Option<&CellFormat> {
        self.cells.get(&pos)
    }

    pub fn set(&mut self, pos: CellPos, format: CellFormat) {
        if format.is_plain() {
            self.cells.remove(&pos);
        } else {
            self.cells.insert(pos, format);
        }
    }

    /// Apply `edit` to the cell's current format (or a plain one).
    pub fn update(&mut self, pos: CellPos, edit: impl FnOnce(&mut CellFormat)) {
        let mut format = self.cells.get(&pos).cloned().unwrap_or_default();
        edit(&mut format);
        self.set(pos, format);
    }

    pub fn clear(&mut self, pos: CellPos) {
        self.cells.remove(&pos);
    }

    pub fn formatted_cells(&self) -> impl Iterator<Item = (&CellPos, &CellFormat)> {
        self.cells.iter()
    }

    pub fn merges(&self) -> &[MergedRange] {
        &self.merges
    }

    /// Add a merged range. Single-cell ranges and ranges overlapping an existing
    /// merge are rejected.
    pub fn merge(&mut self, range: MergedRange) -> Result<()> {
        if range.is_single_cell() {
            return Err(SheetError::InvalidMerge(
                "a merge must span at least two cells".to_string(),
            ));
        }
        if let Some(existing) = self.merges.iter().find(|m| m.overlaps(&range)) {
            return Err(SheetError::InvalidMerge(format!(
                "overlaps the merge anchored at {}",
                existing.anchor()
            )));
        }
        self.merges.push(range);
        Ok(())
    }

    /// Remove the merge containing `pos`, returning it.
    pub fn unmerge(&mut self, pos: CellPos) -> Option<MergedRange> {
        let idx = self.merges.iter().position(|m| m.contains(pos))?;
        Some(self.merges.remove(idx))
    }

    pub fn merge_at(&self, pos: CellPos) -> Option<&MergedRange> {
        self.merges.iter().find(|m| m.contains(pos))
    }

    /// True when `pos` lies inside a merge but is not its top-left cell, i.e. it is
    /// suppressed from individual rendering.
    pub fn is_covered(&self, pos: CellPos) -> bool {
        self.merge_at(pos).is_some_and(|m| m.anchor() != pos)
    }

    /// Shift state after column `col` was inserted. Merges straddling the insertion
    /// point are widened.
    pub(crate) fn column_inserted(&mut self, col: usize) {
        self.cells = std::mem::take(&mut self.cells)
            .into_iter()
            .map(|(pos, f)| {
                let shifted = if pos.col >= col { pos.col + 1 } else { pos.col };
                (CellPos::new(pos.row, shifted), f)
            })
            .collect();
        for m in &mut self.merges {
            if m.min_col >= col {
                m.min_col += 1;
                m.max_col += 1;
            } else if m.max_col >= col {
                m.max_col += 1;
            }
        }
    }

    /// Shift state after column `col` was removed. Merges touching the column are dropped.
    pub(crate) fn column_removed(&mut self, col: usize) {
        self.cells = std::mem::take(&mut self.cells)
            .into_iter()
            .filter(|(pos, _)| pos.col != col)
            .map(|(pos, f)| {
                let shifted = if pos.col > col { pos.col - 1 } else { pos.col };
                (CellPos::new(pos.row, shifted), f)
            })
            .collect();
        self.merges.retain(|m| col < m.min_col || col > m.max_col);
        for m in &mut self.merges {
            if m.min_col > col {
                m.min_col -= 1;
                m.max_col -= 1;
            }
        }
    }

    /// Shift state after row `row` was removed. Merges touching the row are dropped.
    pub(crate) fn row_removed(&mut self, row: usize) {
        self.cells = std::mem::take(&mut self.cells)
            .into_iter()
            .filter(|(pos, _)| pos.row != row)
            .map(|(pos, f)| {
                let shifted = if pos.row > row { pos.row - 1 } else { pos.row };
                (CellPos::new(shifted, pos.col), f)
            })
            .collect();
        self.merges.retain(|m| row < m.min_row || row > m.max_row);
        for m in &mut self.merges {
            if m.min_row > row {
                m.min_row -= 1;
                m.max_row -= 1;
            }
        }
    }
}
