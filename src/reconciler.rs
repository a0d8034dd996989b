//! Applies inbound realtime events to the local sheet and coordinator.
//!
//! Reconciliation never emits anything: the caller decides what to do with the
//! returned [`ReconcileOutcome`] (reload, re-announce). Applying the same event
//! twice leaves the same state as applying it once.

use crate::cell::CellPos;
use crate::config::CollabConfig;
use crate::coordinator::{Coordinator, EditorInfo, LockHolder};
use crate::events::{InboundEvent, parse_presence_users};
use crate::inventory::{self, InventoryLayout};
use crate::spreadsheet::{Sheet, SheetId};
use crate::user::User;
use chrono::Utc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A remote cell value was written.
    Applied {
        cell: CellPos,
        rows_added: usize,
        column_added: bool,
        total_recomputed: bool,
    },
    /// The presence set was replaced; holds the number of users kept.
    PresenceReplaced(usize),
    PresenceChanged,
    LockUpdated,
    /// Another user saved; the sheet should be reloaded.
    ReloadRequired,
    /// Another user saved while a local editor is open or local edits are
    /// unsaved; the reload was skipped.
    ReloadSkipped,
    GrantRecorded(CellPos),
    PendingCount(usize),
    RequestAcknowledged,
    /// The transport reconnected; presence must be announced again.
    Reannounce,
    Ignored(&'static str),
}

pub struct Reconciler<'a> {
    pub sheet: &'a mut Sheet,
    pub coordinator: &'a mut Coordinator,
    pub me: &'a User,
    pub config: &'a CollabConfig,
    /// Local edits are waiting for an autosave; a remote save must not reload
    /// over them.
    pub unsaved_changes: bool,
}

fn for_other_sheet(event_sheet: Option<SheetId>, open: SheetId) -> bool {
    event_sheet.is_some_and(|id| id != open)
}

impl Reconciler<'_> {
    pub fn apply(&mut self, event: &InboundEvent) -> ReconcileOutcome {
        let open = self.sheet.id;
        match event {
            InboundEvent::PresenceUpdate { sheet_id, users } => {
                if *sheet_id != open {
                    return ReconcileOutcome::Ignored("presence for another sheet");
                }
                let records = parse_presence_users(users);
                let presence = self.coordinator.presence_mut();
                presence.replace(records);
                ReconcileOutcome::PresenceReplaced(presence.len())
            }

            InboundEvent::CellFocused(focus) => {
                if for_other_sheet(focus.sheet_id, open) {
                    return ReconcileOutcome::Ignored("focus on another sheet");
                }
                if focus.user_id == self.me.id {
                    return ReconcileOutcome::Ignored("own focus");
                }
                match focus.to_record() {
                    Some(record) => {
                        self.coordinator.presence_mut().focus(record);
                        ReconcileOutcome::PresenceChanged
                    }
                    None => ReconcileOutcome::Ignored("unsupported role"),
                }
            }

            InboundEvent::CellBlurred(blur) => {
                if for_other_sheet(blur.sheet_id, open) {
                    return ReconcileOutcome::Ignored("blur on another sheet");
                }
                if blur.user_id == self.me.id {
                    return ReconcileOutcome::Ignored("own blur");
                }
                self.coordinator
                    .presence_mut()
                    .blur(blur.user_id, &blur.cell_ref);
                ReconcileOutcome::PresenceChanged
            }

            InboundEvent::CellUpdated {
                sheet_id,
                row_index,
                column_name,
                value,
            } => {
                if *sheet_id != open {
                    return ReconcileOutcome::Ignored("update for another sheet");
                }
                self.apply_cell_update(*row_index, column_name, value)
            }

            InboundEvent::SheetSaved {
                sheet_id,
                saved_by_id,
            } => {
                if *sheet_id != open {
                    return ReconcileOutcome::Ignored("save of another sheet");
                }
                if *saved_by_id == Some(self.me.id) {
                    return ReconcileOutcome::Ignored("own save");
                }
                if self.coordinator.has_open_editor() || self.unsaved_changes {
                    ReconcileOutcome::ReloadSkipped
                } else {
                    ReconcileOutcome::ReloadRequired
                }
            }

            InboundEvent::EditRequestNotification {
                sheet_id,
                pending_count,
            } => {
                if for_other_sheet(*sheet_id, open) || !self.me.is_elevated() {
                    return ReconcileOutcome::Ignored("notification not for this view");
                }
                match pending_count {
                    Some(count) => self.coordinator.set_pending_requests(*count),
                    None => self.coordinator.request_submitted(),
                }
                ReconcileOutcome::PendingCount(self.coordinator.pending_requests())
            }

            InboundEvent::EditRequestSubmitted { .. } => ReconcileOutcome::RequestAcknowledged,

            InboundEvent::EditRequestResolved {
                sheet_id,
                pending_count,
                ..
            } => {
                if for_other_sheet(*sheet_id, open) {
                    return ReconcileOutcome::Ignored("resolution on another sheet");
                }
                match pending_count {
                    Some(count) => self.coordinator.set_pending_requests(*count),
                    None => self.coordinator.request_resolved(),
                }
                ReconcileOutcome::PendingCount(self.coordinator.pending_requests())
            }

            InboundEvent::GrantTempAccess { sheet_id, cell_ref } => {
                if for_other_sheet(*sheet_id, open) {
                    return ReconcileOutcome::Ignored("grant on another sheet");
                }
                match CellPos::parse(cell_ref) {
                    Some(pos) => {
                        self.coordinator.grant(pos);
                        ReconcileOutcome::GrantRecorded(pos)
                    }
                    None => ReconcileOutcome::Ignored("malformed cell reference"),
                }
            }

            InboundEvent::SheetLockChanged {
                sheet_id,
                locked_by_id,
                locked_by_name,
                editing_user_id,
                editing_user_name,
            } => {
                if *sheet_id != open {
                    return ReconcileOutcome::Ignored("lock change on another sheet");
                }
                let holder = locked_by_id.map(|user_id| {
                    let since = self
                        .coordinator
                        .lock_holder()
                        .filter(|h| h.user_id == user_id)
                        .map_or_else(Utc::now, |h| h.since);
                    LockHolder {
                        user_id,
                        name: locked_by_name.clone().unwrap_or_else(|| user_id.to_string()),
                        since,
                    }
                });
                let editor = editing_user_id.map(|user_id| EditorInfo {
                    user_id,
                    name: editing_user_name
                        .clone()
                        .unwrap_or_else(|| user_id.to_string()),
                });
                self.coordinator.apply_lock_snapshot(holder, editor);
                ReconcileOutcome::LockUpdated
            }

            InboundEvent::Connect => ReconcileOutcome::Reannounce,
        }
    }

    /// Write a remote value, growing the grid to fit. `row_number` is 1-based.
    fn apply_cell_update(&mut self, row_number: usize, column: &str, value: &str) -> ReconcileOutcome {
        if row_number == 0 {
            return ReconcileOutcome::Ignored("row number 0");
        }
        if row_number > self.config.max_rows {
            log::warn!(
                "dropping remote update to row {} of sheet {}: limit is {} rows",
                row_number,
                self.sheet.id,
                self.config.max_rows
            );
            return ReconcileOutcome::Ignored("row beyond the row limit");
        }
        if column.trim().is_empty() {
            return ReconcileOutcome::Ignored("empty column name");
        }
        let rows_added = self.sheet.ensure_rows(row_number);
        let mut column_added = false;
        let col = match self.sheet.column_index(column) {
            Some(col) => col,
            None => match self.sheet.add_column(column) {
                Ok(col) => {
                    column_added = true;
                    col
                }
                Err(e) => {
                    log::warn!("cannot add remote column '{}': {}", column, e);
                    return ReconcileOutcome::Ignored("column could not be added");
                }
            },
        };
        let cell = CellPos::new(row_number - 1, col);
        if let Err(e) = self.sheet.set_cell_at(cell, value) {
            log::warn!("cannot apply remote update to {}: {}", cell, e);
            return ReconcileOutcome::Ignored("cell out of range");
        }

        let affects_total = InventoryLayout::detect(self.sheet, self.config)
            .is_some_and(|layout| layout.affects_total(col));
        let total_recomputed = affects_total
            && inventory::recompute_row(self.sheet, self.config, cell.row).unwrap_or(false);

        ReconcileOutcome::Applied {
            cell,
            rows_added,
            column_added,
            total_recomputed,
        }
    }
}
