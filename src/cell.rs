use serde::{Deserialize, Serialize};
use std::fmt;

/// Zero-based position of a cell in the grid.
///
/// Ordering is row-major, which is also the scan order used for ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub row: usize,
    pub col: usize,
}

impl CellPos {
    pub fn new(row: usize, col: usize) -> Self {
        CellPos { row, col }
    }

    /// Spreadsheet-style reference, e.g. `B4` for row 3, column 1.
    pub fn to_ref(&self) -> String {
        get_cell_name(self.row, self.col)
    }

    /// Parse a reference such as `AB12` into a position.
    pub fn parse(reference: &str) -> Option<Self> {
        parse_cell_name(reference)
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ref())
    }
}

/// Convert a 0-based column index to bijective base-26 letters (A..Z, AA, AB, ...).
pub fn col_to_letter(col: usize) -> String {
    let mut n = col as u128 + 1;
    let mut result = Vec::new();
    while n > 0 {
        n -= 1;
        result.push((b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    result.iter().rev().collect()
}

/// Inverse of [`col_to_letter`]. Accepts upper or lower case; `None` for empty,
/// non-alphabetic or overflowing input.
pub fn letter_to_col(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut acc: usize = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = (c.to_ascii_uppercase() as u8 - b'A' + 1) as usize;
        acc = acc.checked_mul(26)?.checked_add(digit)?;
    }
    Some(acc - 1)
}

/// Reference string for a 0-based (row, col) pair.
pub fn get_cell_name(row: usize, col: usize) -> String {
    format!("{}{}", col_to_letter(col), row + 1)
}

/// Split a reference into column letters and a 1-based row number, then
/// convert to a 0-based position. Rejects `1A`, `A0`, `A`, `12`.
pub fn parse_cell_name(cell_name: &str) -> Option<CellPos> {
    let cell_name = cell_name.trim();
    let split = cell_name.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cell_name.split_at(split);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let col = letter_to_col(letters)?;
    let row = digits.parse::<usize>().ok()?;
    if row == 0 {
        return None;
    }
    Some(CellPos::new(row - 1, col))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_letter_conversion() {
        assert_eq!(col_to_letter(0), "A");
        assert_eq!(col_to_letter(25), "Z");
        assert_eq!(col_to_letter(26), "AA");
        assert_eq!(col_to_letter(51), "AZ");
        assert_eq!(col_to_letter(99), "CV");
        assert_eq!(col_to_letter(702), "AAA");
        assert_eq!(col_to_letter(16383), "XFD");
    }

    #[test]
    fn test_letters_back_to_columns() {
        assert_eq!(letter_to_col("A"), Some(0));
        assert_eq!(letter_to_col("z"), Some(25));
        assert_eq!(letter_to_col("AA"), Some(26));
        assert_eq!(letter_to_col("XFD"), Some(16383));
        assert_eq!(letter_to_col(""), None);
        assert_eq!(letter_to_col("A1"), None);
    }

    #[test]
    fn test_round_trip_full_practical_range() {
        for col in 0..16384 {
            let letters = col_to_letter(col);
            assert_eq!(letter_to_col(&letters), Some(col), "column {}", letters);
        }
        for row in [0usize, 1, 9, 99, 1_048_575] {
            let name = get_cell_name(row, 27);
            assert_eq!(parse_cell_name(&name), Some(CellPos::new(row, 27)));
            assert_eq!(get_cell_name(row, 27), CellPos::parse(&name).unwrap().to_ref());
        }
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert_eq!(parse_cell_name("B4"), Some(CellPos::new(3, 1)));
        assert_eq!(parse_cell_name("1A"), None);
        assert_eq!(parse_cell_name("A0"), None);
        assert_eq!(parse_cell_name("A"), None);
        assert_eq!(parse_cell_name("12"), None);
        assert_eq!(parse_cell_name("A1B"), None);
    }

    #[test]
    fn test_parse_overflowing_letters_returns_none() {
        let huge = format!("{}1", "Z".repeat(40));
        assert!(parse_cell_name(&huge).is_none());
    }
}
