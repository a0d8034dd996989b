//! Cell formula evaluation.
//!
//! A raw cell value starting with `=` is a formula. Evaluation is a pure function
//! of the formula text and a grid snapshot and never fails: every problem turns
//! into [`ERROR_VALUE`].
//!
//! Referenced cells are read *raw*. A referenced cell that itself holds a formula
//! counts as `0` instead of being evaluated, so formulas never chain and a cycle
//! can never recurse.

use crate::cell::{CellPos, parse_cell_name};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

pub const FORMULA_MARKER: char = '=';
pub const ERROR_VALUE: &str = "#ERR";

lazy_static! {
    static ref FUNC_REGEX: Regex =
        Regex::new(r"^(SUM|AVERAGE|AVG|MAX|MIN|COUNT)\((.*)\)$").unwrap();
    static ref RANGE_REGEX: Regex = Regex::new(r"^([A-Z]+[0-9]+):([A-Z]+[0-9]+)$").unwrap();
    static ref REF_REGEX: Regex = Regex::new(r"[A-Z]+[0-9]+").unwrap();
}

/// Read access to raw cell values, implemented by the grid store.
pub trait CellSource {
    /// Raw value at `pos`, or `None` outside the grid.
    fn raw(&self, pos: CellPos) -> Option<&str>;

    /// (rows, columns)
    fn dimensions(&self) -> (usize, usize);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Average,
    Max,
    Min,
    Count,
}

impl Aggregate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SUM" => Some(Aggregate::Sum),
            "AVERAGE" | "AVG" => Some(Aggregate::Average),
            "MAX" => Some(Aggregate::Max),
            "MIN" => Some(Aggregate::Min),
            "COUNT" => Some(Aggregate::Count),
            _ => None,
        }
    }

    fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggregate::Sum => values.iter().sum(),
            Aggregate::Average => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregate::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregate::Count => values.len() as f64,
        }
    }
}

pub fn is_formula(raw: &str) -> bool {
    raw.starts_with(FORMULA_MARKER)
}

/// Evaluate `formula` (with or without the leading `=`) against `grid`.
pub fn evaluate(formula: &str, grid: &impl CellSource) -> String {
    let body = formula.strip_prefix(FORMULA_MARKER).unwrap_or(formula);
    let expr = body.trim().to_uppercase();
    if expr.is_empty() {
        return ERROR_VALUE.to_string();
    }

    let value = match FUNC_REGEX.captures(&expr) {
        Some(captures) => {
            let func = Aggregate::from_name(&captures[1]);
            func.and_then(|f| evaluate_aggregate(f, &captures[2], grid))
        }
        None => substitute_references(&expr, grid).and_then(|e| evaluate_arithmetic(&e)),
    };

    match value {
        Some(n) => format_number(n),
        None => ERROR_VALUE.to_string(),
    }
}

/// Integers print without a decimal point, everything else with two decimals.
/// NaN and infinities print as [`ERROR_VALUE`].
pub fn format_number(n: f64) -> String {
    if !n.is_finite() {
        return ERROR_VALUE.to_string();
    }
    // Avoid printing "-0"
    let n = if n == 0.0 { 0.0 } else { n };
    if n.fract() == 0.0 {
        format!("{:.0}", n)
    } else {
        format!("{:.2}", n)
    }
}

/// Parse a stored value as a finite number. Blank, text and `inf`/`NaN` spellings
/// are not numbers.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Raw value as seen by a formula: blank or missing cells read as "0".
fn read_raw<'a>(grid: &'a impl CellSource, pos: CellPos) -> &'a str {
    match grid.raw(pos) {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => "0",
    }
}

fn evaluate_aggregate(func: Aggregate, args: &str, grid: &impl CellSource) -> Option<f64> {
    let cells = resolve_arguments(args, grid)?;
    let values: Vec<f64> = cells
        .into_iter()
        .filter_map(|pos| parse_number(read_raw(grid, pos)))
        .collect();
    Some(func.apply(&values))
}

/// Expand `A1:B3` ranges (row-major, clamped to the grid) and comma-separated
/// references into positions.
fn resolve_arguments(args: &str, grid: &impl CellSource) -> Option<Vec<CellPos>> {
    let mut cells = Vec::new();
    for arg in args.split(',') {
        let arg: String = arg.chars().filter(|c| !c.is_whitespace()).collect();
        if let Some(captures) = RANGE_REGEX.captures(&arg) {
            let start = parse_cell_name(&captures[1])?;
            let end = parse_cell_name(&captures[2])?;
            cells.extend(expand_range(start, end, grid.dimensions()));
        } else {
            cells.push(parse_cell_name(&arg)?);
        }
    }
    Some(cells)
}

fn expand_range(a: CellPos, b: CellPos, (rows, cols): (usize, usize)) -> Vec<CellPos> {
    let (r1, r2) = (a.row.min(b.row), a.row.max(b.row));
    let (c1, c2) = (a.col.min(b.col), a.col.max(b.col));
    if rows == 0 || cols == 0 || r1 >= rows || c1 >= cols {
        return Vec::new();
    }
    let (r2, c2) = (r2.min(rows - 1), c2.min(cols - 1));
    (r1..=r2)
        .flat_map(|r| (c1..=c2).map(move |c| CellPos::new(r, c)))
        .collect()
}

/// Replace every `[A-Z]+[0-9]+` token with the referenced cell's number.
/// Formula cells, blanks and text all become `0`.
fn substitute_references(expr: &str, grid: &impl CellSource) -> Option<String> {
    let mut malformed = false;
    let replaced = REF_REGEX.replace_all(expr, |caps: &Captures| match parse_cell_name(&caps[0]) {
        Some(pos) => {
            let raw = read_raw(grid, pos);
            let value = if is_formula(raw) {
                0.0
            } else {
                parse_number(raw).unwrap_or(0.0)
            };
            format!("({})", value)
        }
        None => {
            malformed = true;
            String::new()
        }
    });
    if malformed {
        None
    } else {
        Some(replaced.into_owned())
    }
}

/// Evaluate a purely numeric infix expression with `+ - * /`, unary signs and
/// parentheses. Division by zero yields NaN.
pub fn evaluate_arithmetic(expr: &str) -> Option<f64> {
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return None;
    }
    Some(value)
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expression(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().filter(|c| *c == '+' || *c == '-') {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek().filter(|c| *c == '*' || *c == '/') {
            self.pos += 1;
            let rhs = self.factor()?;
            value = if op == '*' {
                value * rhs
            } else if rhs == 0.0 {
                f64::NAN
            } else {
                value / rhs
            };
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            '-' => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            '+' => {
                self.pos += 1;
                self.factor()
            }
            '(' => {
                self.pos += 1;
                let value = self.expression()?;
                if self.peek()? != ')' {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            _ => self.number(),
        }
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        let literal: String = self.tokens[start..self.pos].iter().collect();
        literal.parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Column-major test grid: `cols[c][r]`
    struct Grid {
        cols: Vec<Vec<&'static str>>,
    }

    impl CellSource for Grid {
        fn raw(&self, pos: CellPos) -> Option<&str> {
            self.cols.get(pos.col).and_then(|c| c.get(pos.row)).copied()
        }

        fn dimensions(&self) -> (usize, usize) {
            (self.cols.first().map_or(0, |c| c.len()), self.cols.len())
        }
    }

    fn grid() -> Grid {
        Grid {
            cols: vec![vec!["1", "2", "", "4", "5"], vec!["10", "0", "abc", "=A1", "-3"]],
        }
    }

    #[test]
    fn test_aggregates_over_range() {
        let g = grid();
        assert_eq!(evaluate("=SUM(A1:A5)", &g), "12");
        assert_eq!(evaluate("=AVERAGE(A1:A5)", &g), "2.40");
        assert_eq!(evaluate("=AVG(A1:A5)", &g), "2.40");
        assert_eq!(evaluate("=MAX(A1:A5)", &g), "5");
        assert_eq!(evaluate("=MIN(A1:A5)", &g), "0");
        assert_eq!(evaluate("=COUNT(A1:A5)", &g), "5");
    }

    #[test]
    fn test_aggregates_skip_text_and_formula_cells() {
        let g = grid();
        // B3 is text and B4 a formula: neither is a member
        assert_eq!(evaluate("=COUNT(B1:B5)", &g), "3");
        assert_eq!(evaluate("=SUM(B1:B5)", &g), "7");
        assert_eq!(evaluate("=sum(a1, b1, b5)", &g), "8");
    }

    #[test]
    fn test_range_clamped_to_grid() {
        let g = grid();
        assert_eq!(evaluate("=COUNT(A1:A500)", &g), "5");
        assert_eq!(evaluate("=SUM(Z1:Z9)", &g), "0");
        assert_eq!(evaluate("=SUM(A5:A1)", &g), "12");
    }

    #[test]
    fn test_arithmetic_with_references() {
        let g = grid();
        assert_eq!(evaluate("=A1+B1*2", &g), "21");
        assert_eq!(evaluate("=(A1+B1)*2", &g), "22");
        assert_eq!(evaluate("= a4 / a5 ", &g), "0.80");
        assert_eq!(evaluate("=A1-B5", &g), "4");
        assert_eq!(evaluate("=-A2*B5", &g), "6");
    }

    #[test]
    fn test_formula_and_text_references_read_zero() {
        let g = grid();
        assert_eq!(evaluate("=B4+1", &g), "1");
        assert_eq!(evaluate("=B3+A3+1", &g), "1");
    }

    #[test]
    fn test_division_by_zero_is_error() {
        let g = grid();
        assert_eq!(evaluate("=A1/B2", &g), ERROR_VALUE);
        assert_eq!(evaluate("=1/0", &g), ERROR_VALUE);
    }

    #[test]
    fn test_malformed_formulas_never_panic() {
        let g = grid();
        for bad in ["=", "=(1+2", "=1+", "=FOO(A1)", "=A0+1", "=SUM(A1:)", "=SUM(1,2)", "=1..2", "=)"] {
            assert_eq!(evaluate(bad, &g), ERROR_VALUE, "{}", bad);
        }
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let g = grid();
        let first = evaluate("=AVERAGE(A1:B5)", &g);
        assert_eq!(first, evaluate("=AVERAGE(A1:B5)", &g));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(30.0), "30");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.4), "2.40");
        assert_eq!(format_number(1.0 / 3.0), "0.33");
        assert_eq!(format_number(f64::NAN), ERROR_VALUE);
        assert_eq!(format_number(f64::INFINITY), ERROR_VALUE);
    }

    #[test]
    fn test_parse_number_rejects_non_finite() {
        assert_eq!(parse_number(" 4.5 "), Some(4.5));
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number(""), None);
    }
}
