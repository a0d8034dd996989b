//! Persistence gateway: the storage service the sheet core calls into.

use crate::config::CollabConfig;
use crate::coordinator::{EditorInfo, LockHolder};
use crate::edit_request::{EditRequest, EditRequestDraft, EditRequestStatus, RequestId};
use crate::error::Result;
use crate::format::SheetFormatting;
use crate::inventory;
use crate::spreadsheet::{Sheet, SheetId, SheetTemplate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A row keyed by column name, as stored.
pub type RowRecord = BTreeMap<String, String>;

/// Everything a load returns for one sheet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SheetSnapshot {
    pub id: SheetId,
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<RowRecord>,
    pub locked_by: Option<LockHolder>,
    pub editing: Option<EditorInfo>,
    pub visible_to_viewers: bool,
    pub password_protected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub row_label_header: Option<String>,
    pub row_labels: BTreeMap<usize, String>,
    /// Only present in full exports; the store keeps formatting client-side.
    pub formatting: Option<SheetFormatting>,
}

/// Body of a save: name, columns and every row that has at least one value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePayload {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<RowRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetStatus {
    pub is_locked: bool,
    pub locked_by: Option<LockHolder>,
    pub editing: Option<EditorInfo>,
}

impl SheetStatus {
    pub fn locked_by_name(&self) -> Option<&str> {
        self.locked_by.as_ref().map(|h| h.name.as_str())
    }
}

/// Storage operations, always on behalf of the authenticated user the gateway
/// was created for.
#[allow(async_fn_in_trait)]
pub trait PersistenceGateway {
    async fn load_sheet(&self, id: SheetId) -> Result<SheetSnapshot>;

    async fn save_sheet(&self, id: SheetId, payload: &SavePayload) -> Result<()>;

    async fn lock_sheet(&self, id: SheetId) -> Result<LockHolder>;

    async fn unlock_sheet(&self, id: SheetId) -> Result<()>;

    /// Start or re-assert the caller's edit session. Also used as the heartbeat.
    async fn start_edit_session(&self, id: SheetId) -> Result<()>;

    async fn get_sheet_status(&self, id: SheetId) -> Result<SheetStatus>;

    async fn submit_edit_request(&self, draft: &EditRequestDraft) -> Result<EditRequest>;

    async fn list_edit_requests(
        &self,
        sheet_id: SheetId,
        status: Option<EditRequestStatus>,
    ) -> Result<Vec<EditRequest>>;

    async fn resolve_edit_request(
        &self,
        request_id: RequestId,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<EditRequest>;

    async fn create_sheet(&self, name: &str, template: SheetTemplate) -> Result<SheetId>;

    async fn delete_sheet(&self, id: SheetId) -> Result<()>;
}

fn row_record(columns: &[String], values: &[String]) -> RowRecord {
    columns.iter().cloned().zip(values.iter().cloned()).collect()
}

impl SavePayload {
    /// Build the payload for `sheet`, dropping fully blank rows.
    pub fn from_sheet(sheet: &Sheet) -> Self {
        SavePayload {
            name: sheet.name.clone(),
            columns: sheet.columns().to_vec(),
            rows: sheet
                .rows()
                .filter(|r| !r.is_blank())
                .map(|r| row_record(sheet.columns(), r.values()))
                .collect(),
        }
    }
}

impl SheetSnapshot {
    /// Full snapshot of `sheet`, blank rows and formatting included.
    pub fn from_sheet(sheet: &Sheet) -> Self {
        SheetSnapshot {
            id: sheet.id,
            name: sheet.name.clone(),
            columns: sheet.columns().to_vec(),
            rows: sheet
                .rows()
                .map(|r| row_record(sheet.columns(), r.values()))
                .collect(),
            locked_by: None,
            editing: None,
            visible_to_viewers: sheet.visible_to_viewers,
            password_protected: sheet.password_protected,
            created_at: sheet.created_at,
            updated_at: sheet.updated_at,
            row_label_header: Some(sheet.row_label_header().to_string()),
            row_labels: sheet.custom_row_labels().clone(),
            formatting: Some(sheet.formatting().clone()),
        }
    }

    /// Rows as positional values in column order; missing keys become empty.
    pub fn grid_rows(&self) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .map(|record| {
                self.columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect()
    }

    /// Build a sheet, padded with blank rows up to the configured default.
    pub fn into_sheet(self, config: &CollabConfig) -> Sheet {
        let mut sheet = Sheet::new(self.id, &self.name, config);
        apply_snapshot(&mut sheet, self, config);
        sheet
    }
}

/// Replace the grid and metadata of `sheet` with `snapshot`.
///
/// Row labels are taken from the snapshot alone. Local formatting survives
/// when the snapshot carries none. Inventory totals
/// are derived again from the loaded ledger.
pub fn apply_snapshot(sheet: &mut Sheet, snapshot: SheetSnapshot, config: &CollabConfig) {
    let rows = snapshot.grid_rows();
    sheet.replace_grid(snapshot.columns, rows);
    sheet.ensure_rows(config.default_rows);
    sheet.name = snapshot.name;
    sheet.visible_to_viewers = snapshot.visible_to_viewers;
    sheet.password_protected = snapshot.password_protected;
    sheet.created_at = snapshot.created_at;
    sheet.updated_at = snapshot.updated_at;
    if let Some(header) = snapshot.row_label_header {
        sheet.rename_row_label_header(&header);
    }
    sheet.clear_row_labels();
    for (index, label) in snapshot.row_labels {
        sheet.set_row_label(index, Some(&label));
    }
    if let Some(formatting) = snapshot.formatting {
        sheet.set_formatting(formatting);
    }
    inventory::recompute_totals(sheet, config);
}
