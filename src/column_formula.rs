//! Column-level formulas such as `Total = Price * Quantity`, applied to every row.

use crate::cell::CellPos;
use crate::error::{Result, SheetError};
use crate::formula;
use crate::spreadsheet::Sheet;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    /// Copy the single operand column verbatim.
    Assign,
}

impl ColumnOperator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "+" => Some(ColumnOperator::Add),
            "-" => Some(ColumnOperator::Subtract),
            "*" => Some(ColumnOperator::Multiply),
            "/" => Some(ColumnOperator::Divide),
            "=" => Some(ColumnOperator::Assign),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ColumnOperator::Add => "+",
            ColumnOperator::Subtract => "-",
            ColumnOperator::Multiply => "*",
            ColumnOperator::Divide => "/",
            ColumnOperator::Assign => "=",
        }
    }

    fn combine(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ColumnOperator::Add => lhs + rhs,
            ColumnOperator::Subtract => lhs - rhs,
            ColumnOperator::Multiply => lhs * rhs,
            ColumnOperator::Divide if rhs == 0.0 => f64::NAN,
            ColumnOperator::Divide => lhs / rhs,
            ColumnOperator::Assign => rhs,
        }
    }
}

/// A declared column formula. Columns are optional because a formula can be
/// declared before all of its columns are picked; such a formula fails validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFormula {
    pub result_column: Option<String>,
    pub operator: ColumnOperator,
    pub operands: Vec<Option<String>>,
}

/// What an apply did to the result column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Rows whose result cell was written.
    pub written: usize,
    /// Rows left unchanged because an operand was not numeric or the result was
    /// not finite.
    pub skipped: usize,
}

impl ColumnFormula {
    pub fn new(result_column: &str, operator: ColumnOperator, operands: &[&str]) -> Self {
        ColumnFormula {
            result_column: Some(result_column.to_string()),
            operator,
            operands: operands.iter().map(|o| Some(o.to_string())).collect(),
        }
    }

    /// Every problem with this formula against `sheet`, empty when it can be applied.
    pub fn problems(&self, sheet: &Sheet) -> Vec<String> {
        let mut problems = Vec::new();
        match &self.result_column {
            None => problems.push("no result column selected".to_string()),
            Some(name) if !sheet.has_column(name) => {
                problems.push(format!("unknown result column '{}'", name))
            }
            Some(_) => {}
        }

        let arity_ok = match self.operator {
            ColumnOperator::Assign => self.operands.len() == 1,
            _ => self.operands.len() >= 2,
        };
        if !arity_ok {
            problems.push(match self.operator {
                ColumnOperator::Assign => "assignment takes exactly one operand column".to_string(),
                op => format!("operator '{}' needs at least two operand columns", op.symbol()),
            });
        }

        for (i, operand) in self.operands.iter().enumerate() {
            match operand {
                None => problems.push(format!("operand {} has no column selected", i + 1)),
                Some(name) if !sheet.has_column(name) => {
                    problems.push(format!("unknown operand column '{}'", name))
                }
                Some(_) => {}
            }
        }
        problems
    }

    pub fn validate(&self, sheet: &Sheet) -> Result<()> {
        let problems = self.problems(sheet);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SheetError::InvalidColumnFormula(problems))
        }
    }

    /// Validate, then evaluate the formula for every row and write the results.
    ///
    /// Rows where an operand does not parse as a number, or where the result is
    /// not finite (division by zero), keep their current result value.
    pub fn apply(&self, sheet: &mut Sheet) -> Result<ApplyReport> {
        self.validate(sheet)?;
        let target = self.result_index(sheet)?;
        let operands = self
            .operands
            .iter()
            .flatten()
            .map(|name| sheet.require_column(name))
            .collect::<Result<Vec<usize>>>()?;

        let mut report = ApplyReport::default();
        for row in 0..sheet.row_count() {
            let value = match self.operator {
                ColumnOperator::Assign => Some(sheet.get_cell_at(CellPos::new(row, operands[0]))?.to_string()),
                _ => self.evaluate_row(sheet, row, &operands)?,
            };
            match value {
                Some(value) => {
                    sheet.set_cell_at(CellPos::new(row, target), &value)?;
                    report.written += 1;
                }
                None => report.skipped += 1,
            }
        }
        Ok(report)
    }

    fn result_index(&self, sheet: &Sheet) -> Result<usize> {
        let name = self
            .result_column
            .as_deref()
            .ok_or_else(|| SheetError::InvalidColumnFormula(vec!["no result column selected".to_string()]))?;
        sheet.require_column(name)
    }

    fn evaluate_row(&self, sheet: &Sheet, row: usize, operands: &[usize]) -> Result<Option<String>> {
        let mut values = Vec::with_capacity(operands.len());
        for &col in operands {
            match formula::parse_number(sheet.get_cell_at(CellPos::new(row, col))?) {
                Some(n) => values.push(n),
                None => return Ok(None),
            }
        }
        let Some((first, rest)) = values.split_first() else {
            return Ok(None);
        };
        let result = rest
            .iter()
            .fold(*first, |acc, &n| self.operator.combine(acc, n));
        if result.is_finite() {
            Ok(Some(formula::format_number(result)))
        } else {
            Ok(None)
        }
    }
}

impl fmt::Display for ColumnFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |c: &Option<String>| c.clone().unwrap_or_else(|| "?".to_string());
        let operands: Vec<String> = self.operands.iter().map(name).collect();
        match self.operator {
            ColumnOperator::Assign => write!(f, "{} = {}", name(&self.result_column), operands.join(", ")),
            op => write!(
                f,
                "{} = {}",
                name(&self.result_column),
                operands.join(&format!(" {} ", op.symbol()))
            ),
        }
    }
}

/// Validate every formula first; if any is invalid nothing is applied and all
/// problems are reported together, each prefixed with its 1-based position.
pub fn apply_all(formulas: &[ColumnFormula], sheet: &mut Sheet) -> Result<Vec<ApplyReport>> {
    let problems: Vec<String> = formulas
        .iter()
        .enumerate()
        .flat_map(|(i, f)| {
            f.problems(sheet)
                .into_iter()
                .map(move |p| format!("formula {}: {}", i + 1, p))
        })
        .collect();
    if !problems.is_empty() {
        return Err(SheetError::InvalidColumnFormula(problems));
    }
    formulas.iter().map(|f| f.apply(sheet)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollabConfig;

    fn sheet() -> Sheet {
        let columns = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        Sheet::with_columns(1, "t", columns, 10, &CollabConfig::default()).unwrap()
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let s = sheet();
        let formula = ColumnFormula {
            result_column: None,
            operator: ColumnOperator::Add,
            operands: vec![None],
        };
        let problems = formula.problems(&s);
        assert_eq!(problems.len(), 3, "{:?}", problems);
    }

    #[test]
    fn test_assign_needs_one_operand() {
        let s = sheet();
        assert!(ColumnFormula::new("C", ColumnOperator::Assign, &["A"]).validate(&s).is_ok());
        assert!(ColumnFormula::new("C", ColumnOperator::Assign, &["A", "B"]).validate(&s).is_err());
        assert!(ColumnFormula::new("C", ColumnOperator::Add, &["A"]).validate(&s).is_err());
    }

    #[test]
    fn test_division_by_zero_leaves_row_unchanged() {
        let mut s = sheet();
        s.set_cell(0, "A", "9").unwrap();
        s.set_cell(0, "B", "0").unwrap();
        s.set_cell(0, "C", "keep").unwrap();
        s.set_cell(1, "A", "9").unwrap();
        s.set_cell(1, "B", "2").unwrap();

        ColumnFormula::new("C", ColumnOperator::Divide, &["A", "B"])
            .apply(&mut s)
            .unwrap();
        assert_eq!(s.get_cell(0, "C").unwrap(), "keep");
        assert_eq!(s.get_cell(1, "C").unwrap(), "4.50");
    }

    #[test]
    fn test_folds_left_to_right() {
        let mut s = sheet();
        s.set_cell(0, "A", "20").unwrap();
        s.set_cell(0, "B", "5").unwrap();
        s.set_cell(0, "C", "3").unwrap();
        s.add_column("D").unwrap();
        let report = ColumnFormula::new("D", ColumnOperator::Subtract, &["A", "B", "C"])
            .apply(&mut s)
            .unwrap();
        assert_eq!(s.get_cell(0, "D").unwrap(), "12");
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped, s.row_count() - 1);
    }

    #[test]
    fn test_assign_is_idempotent() {
        let mut s = sheet();
        s.set_cell(0, "A", "=B1").unwrap();
        s.set_cell(1, "A", "text").unwrap();
        let f = ColumnFormula::new("C", ColumnOperator::Assign, &["A"]);
        f.apply(&mut s).unwrap();
        let once: Vec<String> = s.rows().map(|r| r.values()[2].clone()).collect();
        f.apply(&mut s).unwrap();
        let twice: Vec<String> = s.rows().map(|r| r.values()[2].clone()).collect();
        assert_eq!(once, twice);
        assert_eq!(s.get_cell(0, "C").unwrap(), "=B1");
    }

    #[test]
    fn test_apply_all_applies_nothing_when_one_is_invalid() {
        let mut s = sheet();
        s.set_cell(0, "A", "1").unwrap();
        s.set_cell(0, "B", "2").unwrap();
        let formulas = vec![
            ColumnFormula::new("C", ColumnOperator::Add, &["A", "B"]),
            ColumnFormula::new("Z", ColumnOperator::Add, &["A", "B"]),
        ];
        let err = apply_all(&formulas, &mut s).unwrap_err();
        assert!(err.to_string().contains("formula 2"));
        assert_eq!(s.get_cell(0, "C").unwrap(), "");
    }

    #[test]
    fn test_display() {
        let f = ColumnFormula::new("C", ColumnOperator::Multiply, &["A", "B"]);
        assert_eq!(f.to_string(), "C = A * B");
    }
}
