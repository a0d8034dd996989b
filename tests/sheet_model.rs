use chrono::NaiveDate;
use cosheet::cell::CellPos;
use cosheet::column_formula::{self, ColumnFormula, ColumnOperator};
use cosheet::inventory::{self, ledger_column_names};
use cosheet::{CollabConfig, Sheet, SheetError, SheetTemplate};
use pretty_assertions::assert_eq;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

// Every row has exactly one value per column after any structural change
fn assert_rectangular(sheet: &Sheet) {
    for (i, row) in sheet.rows().enumerate() {
        assert_eq!(row.values().len(), sheet.column_count(), "row {} is ragged", i + 1);
    }
}

#[test]
fn test_structural_edits_keep_grid_rectangular() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    assert_eq!(sheet.row_count(), config.default_rows);
    assert_eq!(sheet.column_count(), config.default_columns);

    sheet.set_cell(4, "B", "x").unwrap();
    sheet.add_column("Notes").unwrap();
    assert_rectangular(&sheet);
    assert_eq!(sheet.get_cell(4, "Notes").unwrap(), "");

    sheet.insert_column(0, "First").unwrap();
    assert_rectangular(&sheet);
    assert_eq!(sheet.column_index("B"), Some(2));
    assert_eq!(sheet.get_cell(4, "B").unwrap(), "x");

    sheet.remove_column("First").unwrap();
    sheet.rename_column("B", "Qty").unwrap();
    assert_eq!(sheet.get_cell(4, "Qty").unwrap(), "x");

    let added = sheet.ensure_rows(150);
    assert_eq!(added, 150 - config.default_rows);
    sheet.remove_row(0).unwrap();
    assert_rectangular(&sheet);
    assert_eq!(sheet.get_cell(3, "Qty").unwrap(), "x");
}

#[test]
fn test_column_names_stay_unique() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    assert!(matches!(sheet.add_column("A"), Err(SheetError::DuplicateColumn(_))));
    assert!(matches!(sheet.rename_column("B", "C"), Err(SheetError::DuplicateColumn(_))));
    assert!(matches!(sheet.remove_column("Nope"), Err(SheetError::UnknownColumn(_))));
    assert!(matches!(
        sheet.set_cell(config.default_rows, "A", "1"),
        Err(SheetError::OutOfRange { .. })
    ));
}

#[test]
fn test_cell_formulas_display_computed_values() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    for (row, value) in ["2", "4", "6"].iter().enumerate() {
        sheet.set_cell(row, "A", value).unwrap();
    }
    let table = [
        ("=SUM(A1:A3)", "12"),
        ("=AVERAGE(A1:A3)", "4"),
        ("=MAX(A1:A3)", "6"),
        ("=MIN(A1:A3)", "2"),
        ("=COUNT(A1:A500)", "3"),
        ("=A1*A2+1", "9"),
        ("=A3/A1/2", "1.50"),
        ("=A1/0", "#ERR"),
        ("=SUM(A1:", "#ERR"),
    ];
    for (formula, expected) in table {
        sheet.set_cell(0, "C", formula).unwrap();
        assert_eq!(sheet.display_value(0, "C").unwrap(), expected, "{}", formula);
        // the raw text is what is stored
        assert_eq!(sheet.get_cell(0, "C").unwrap(), formula);
    }
    assert_eq!(sheet.display_value(1, "A").unwrap(), "4");
}

#[test]
fn test_column_formula_writes_values_once() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    sheet.set_cell(0, "A", "10").unwrap();
    sheet.set_cell(0, "B", "20").unwrap();
    sheet.set_cell(1, "A", "x").unwrap();

    let formula = ColumnFormula::new("C", ColumnOperator::Add, &["A", "B"]);
    assert_eq!(formula.to_string(), "C = A + B");
    let report = formula.apply(&mut sheet).unwrap();
    assert_eq!(sheet.get_cell(0, "C").unwrap(), "30");
    assert!(report.written >= 1);

    // values are written, not linked
    sheet.set_cell(0, "A", "abc").unwrap();
    assert_eq!(sheet.get_cell(0, "C").unwrap(), "30");

    // a row with a non-numeric operand is skipped and keeps its old result
    let again = formula.apply(&mut sheet).unwrap();
    assert_eq!(sheet.get_cell(0, "C").unwrap(), "30");
    assert_eq!(again.written, report.written - 1);
}

#[test]
fn test_invalid_column_formulas_touch_nothing() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    sheet.set_cell(0, "A", "1").unwrap();
    let formulas = [
        ColumnFormula::new("B", ColumnOperator::Assign, &["A"]),
        ColumnFormula::new("Missing", ColumnOperator::Add, &["A", "B"]),
    ];
    let err = column_formula::apply_all(&formulas, &mut sheet).unwrap_err();
    let SheetError::InvalidColumnFormula(problems) = err else {
        panic!("expected validation problems");
    };
    assert!(problems.iter().all(|p| p.starts_with("formula 2: ")));
    assert_eq!(sheet.get_cell(0, "B").unwrap(), "");
}

#[test]
fn test_inventory_totals_follow_the_ledger() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::from_template(1, "Stock", SheetTemplate::Inventory, &config, day(1));
    assert!(inventory::is_inventory(&sheet, &config));
    let (in_1, out_1) = ledger_column_names(day(1));
    assert_eq!(in_1, "IN 2024-03-01");

    sheet.set_cell(0, "Maintaining", "50").unwrap();
    sheet.set_cell(0, &in_1, "5").unwrap();
    sheet.set_cell(0, &out_1, "3").unwrap();
    inventory::recompute_row(&mut sheet, &config, 0).unwrap();
    assert_eq!(sheet.get_cell(0, "Total").unwrap(), "52");

    // the next day's OUT counts against the running total
    inventory::add_ledger_day(&mut sheet, &config, day(2)).unwrap();
    let (_, out_2) = ledger_column_names(day(2));
    sheet.set_cell(0, &out_2, "10").unwrap();
    inventory::recompute_row(&mut sheet, &config, 0).unwrap();
    assert_eq!(sheet.get_cell(0, "Total").unwrap(), "42");

    // no baseline, no total
    sheet.set_cell(0, "Maintaining", "").unwrap();
    assert!(inventory::recompute_row(&mut sheet, &config, 0).unwrap());
    assert_eq!(sheet.get_cell(0, "Total").unwrap(), "");

    sheet.set_cell(5, &in_1, "3").unwrap();
    inventory::recompute_totals(&mut sheet, &config);
    assert_eq!(sheet.get_cell(5, "Total").unwrap(), "");
}

#[test]
fn test_ledger_days_insert_before_total() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::from_template(1, "Stock", SheetTemplate::Inventory, &config, day(1));
    inventory::add_ledger_day(&mut sheet, &config, day(2)).unwrap();
    let (in_2, out_2) = ledger_column_names(day(2));
    let total = sheet.column_index("Total").unwrap();
    assert_eq!(sheet.column_index(&in_2), Some(total - 2));
    assert_eq!(sheet.column_index(&out_2), Some(total - 1));
    assert_rectangular(&sheet);

    let before = sheet.columns().to_vec();
    assert!(matches!(
        inventory::add_ledger_day(&mut sheet, &config, day(2)),
        Err(SheetError::LedgerDayExists(_))
    ));
    assert_eq!(sheet.columns(), before.as_slice());
    assert_eq!(inventory::ledger_dates(&sheet).len(), 2);
}

#[test]
fn test_critical_rows() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::from_template(1, "Stock", SheetTemplate::Inventory, &config, day(1));
    let (_, out_1) = ledger_column_names(day(1));
    // Gloves: 40 on hand, 35 out leaves 5, which is 87.5% consumed
    sheet.set_cell(0, &out_1, "35").unwrap();
    inventory::recompute_totals(&mut sheet, &config);
    assert_eq!(sheet.get_cell(0, "Total").unwrap(), "5");
    assert_eq!(inventory::critical_rows(&sheet, &config), vec![0]);
}

#[test]
fn test_formatting_and_row_labels() {
    let config = CollabConfig::default();
    let mut sheet = Sheet::new(1, "Grid", &config);
    sheet.set_row_label(2, Some("Subtotal"));
    assert_eq!(sheet.row_label(2), "Subtotal");
    assert_eq!(sheet.row_label(3), "4");
    sheet.set_row_label(2, None);
    assert_eq!(sheet.row_label(2), "3");

    let b2 = CellPos::parse("b2").unwrap();
    sheet.formatting_mut().update(b2, |f| f.bold = true);
    assert!(sheet.formatting().get(b2).is_some_and(|f| f.bold));
}
