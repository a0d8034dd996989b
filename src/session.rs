//! A [`SheetSession`] is one open sheet for one user.
//!
//! It owns the local [`Sheet`], the [`Coordinator`] state and the realtime
//! subscription, and it is the only place where they meet the persistence
//! gateway and the transport. Opening a sheet constructs a session, closing it
//! tears everything down; nothing outlives it.
//!
//! Local edits are applied immediately, then broadcast, then saved after a
//! debounce window. [`SheetSession::run`] drives the timers (autosave, the
//! presence/reload poll, edit-session heartbeats) together with inbound events.

use crate::cell::CellPos;
use crate::column_formula::{self, ApplyReport, ColumnFormula};
use crate::config::CollabConfig;
use crate::coordinator::{CellPolicy, Coordinator, LockOutcome};
use crate::edit_request::{EditRequest, EditRequestDraft, EditRequestStatus, RequestId};
use crate::error::{Result, SheetError};
use crate::events::{InboundEvent, OutboundEvent};
use crate::format::{CellFormat, MergedRange};
use crate::gateway::{self, PersistenceGateway, SavePayload, SheetStatus};
use crate::inventory::{self, InventoryLayout};
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::spreadsheet::{Sheet, SheetId};
use crate::transport::RealtimeTransport;
use crate::user::User;
use chrono::{Local, NaiveDate};
use std::future::{Future, pending};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Coalesces bursts of edits into one save after a quiet period.
#[derive(Debug)]
struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    fn new(delay: Duration) -> Self {
        Debouncer {
            delay,
            deadline: None,
        }
    }

    /// (Re)start the window from now.
    fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

/// What a committed cell edit turned into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { cell: CellPos, used_grant: bool },
    /// The cell is protected; an edit request was filed and the cell is unchanged.
    RequestSubmitted(EditRequest),
}

pub struct SheetSession<G: PersistenceGateway, T: RealtimeTransport> {
    gateway: G,
    transport: T,
    config: CollabConfig,
    user: User,
    sheet: Sheet,
    coordinator: Coordinator,
    inbound: Option<UnboundedReceiver<InboundEvent>>,
    column_formulas: Vec<ColumnFormula>,
    autosave: Debouncer,
    poll_ticks: u64,
    presence_retry_at: Option<Instant>,
    today: Option<NaiveDate>,
    closed: bool,
}

impl<G: PersistenceGateway, T: RealtimeTransport> SheetSession<G, T> {
    /// Load `sheet_id`, subscribe to realtime events, join the sheet's room and
    /// ask for the current presence.
    pub async fn open(
        gateway: G,
        transport: T,
        user: User,
        sheet_id: SheetId,
        config: CollabConfig,
    ) -> Result<Self> {
        let snapshot = gateway.load_sheet(sheet_id).await?;
        let mut coordinator = Coordinator::new();
        coordinator.apply_lock_snapshot(snapshot.locked_by.clone(), snapshot.editing.clone());
        let sheet = snapshot.into_sheet(&config);
        let inbound = Some(transport.subscribe());

        log::info!("{} opened sheet {} '{}'", user.username, sheet.id, sheet.name);
        let mut session = SheetSession {
            gateway,
            transport,
            autosave: Debouncer::new(config.autosave_debounce()),
            config,
            user,
            sheet,
            coordinator,
            inbound,
            column_formulas: Vec::new(),
            poll_ticks: 0,
            presence_retry_at: None,
            today: None,
            closed: false,
        };

        session.emit(OutboundEvent::JoinSheet { sheet_id }).await;
        session.emit(OutboundEvent::GetPresence { sheet_id }).await;
        if session.user.is_elevated() {
            match session
                .gateway
                .list_edit_requests(sheet_id, Some(EditRequestStatus::Pending))
                .await
            {
                Ok(pending) => session.coordinator.set_pending_requests(pending.len()),
                Err(e) => log::warn!("could not count pending edit requests: {}", e),
            }
        }
        Ok(session)
    }

    pub fn sheet(&self) -> &Sheet {
        &self.sheet
    }

    pub fn sheet_id(&self) -> SheetId {
        self.sheet.id
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn autosave_pending(&self) -> bool {
        self.autosave.is_pending()
    }

    /// Pin the date used to classify historical ledger columns.
    pub fn set_today(&mut self, today: NaiveDate) {
        self.today = Some(today);
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    pub fn display_value(&self, row: usize, column: &str) -> Result<String> {
        self.sheet.display_value(row, column)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SheetError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn check_write(&self) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.check_mutation(&self.user)
    }

    /// Best-effort send; failures are logged and the session carries on.
    async fn emit(&self, event: OutboundEvent) {
        log::debug!("emit {} on sheet {}", event.name(), self.sheet.id);
        if let Err(e) = self.transport.emit(event).await {
            log::warn!("realtime emit failed on sheet {}: {}", self.sheet.id, e);
        }
    }

    fn schedule_autosave(&mut self) {
        self.autosave.schedule();
    }

    // ---- cell editing ----

    /// Open an editor on a cell and announce the focus.
    ///
    /// Fails with [`SheetError::CellBusy`] when another user is shown on the cell.
    pub async fn begin_cell_edit(&mut self, row: usize, column: &str) -> Result<CellPos> {
        self.check_write()?;
        let pos = CellPos::new(row, self.sheet.require_column(column)?);
        self.sheet.get_cell_at(pos)?;
        if self.coordinator.editing_cell().is_some_and(|open| open != pos) {
            self.cancel_cell_edit().await;
        }
        self.coordinator.open_editor(&self.user, pos)?;
        self.emit(OutboundEvent::CellFocus {
            sheet_id: self.sheet.id,
            cell_ref: pos.to_ref(),
        })
        .await;
        Ok(pos)
    }

    /// Close the open editor without writing anything.
    pub async fn cancel_cell_edit(&mut self) {
        if let Some(pos) = self.coordinator.close_editor(&self.user) {
            self.emit(OutboundEvent::CellBlur {
                sheet_id: self.sheet.id,
                cell_ref: pos.to_ref(),
            })
            .await;
        }
    }

    async fn release_editor(&mut self, pos: CellPos) {
        if self.coordinator.editing_cell() == Some(pos) {
            self.cancel_cell_edit().await;
        }
    }

    /// Write a cell value.
    ///
    /// Every gate runs before the grid is touched: lock and role first, then the
    /// historical-cell policy. A protected cell without a grant turns into an
    /// edit request and stays unchanged.
    pub async fn commit_cell_edit(&mut self, row: usize, column: &str, value: &str) -> Result<CommitOutcome> {
        self.check_write()?;
        let col = self.sheet.require_column(column)?;
        let pos = CellPos::new(row, col);
        let current = self.sheet.get_cell_at(pos)?.to_string();

        let policy = self.coordinator.cell_policy(&self.user, column, pos, self.today());
        if policy == CellPolicy::NeedsRequest {
            let draft = EditRequestDraft {
                sheet_id: self.sheet.id,
                row,
                column: column.to_string(),
                cell_ref: pos.to_ref(),
                current_value: current,
                proposed_value: value.to_string(),
            };
            let request = self.gateway.submit_edit_request(&draft).await?;
            self.emit(OutboundEvent::RequestEdit {
                sheet_id: draft.sheet_id,
                row_number: row + 1,
                column_name: draft.column,
                cell_ref: draft.cell_ref,
                current_value: draft.current_value,
                proposed_value: draft.proposed_value,
            })
            .await;
            self.release_editor(pos).await;
            log::info!(
                "{} needs approval to edit {} on sheet {}; request {} filed",
                self.user.username,
                pos,
                self.sheet.id,
                request.id
            );
            return Ok(CommitOutcome::RequestSubmitted(request));
        }

        self.sheet.set_cell_at(pos, value)?;
        let used_grant = policy == CellPolicy::AllowedWithGrant && self.coordinator.consume_grant(pos);
        self.recompute_row(col, row);
        self.emit(OutboundEvent::CellUpdate {
            sheet_id: self.sheet.id,
            row_index: row + 1,
            column_name: column.to_string(),
            value: value.to_string(),
        })
        .await;
        self.schedule_autosave();
        self.release_editor(pos).await;
        Ok(CommitOutcome::Applied {
            cell: pos,
            used_grant,
        })
    }

    fn recompute_row(&mut self, col: usize, row: usize) {
        let affects_total = InventoryLayout::detect(&self.sheet, &self.config)
            .is_some_and(|layout| layout.affects_total(col));
        if affects_total {
            if let Err(e) = inventory::recompute_row(&mut self.sheet, &self.config, row) {
                log::warn!("could not recompute total of row {}: {}", row + 1, e);
            }
        }
    }

    // ---- structure ----

    pub fn add_column(&mut self, name: &str) -> Result<usize> {
        self.check_write()?;
        let index = self.sheet.add_column(name)?;
        self.schedule_autosave();
        Ok(index)
    }

    pub fn insert_column(&mut self, index: usize, name: &str) -> Result<()> {
        self.check_write()?;
        self.sheet.insert_column(index, name)?;
        self.schedule_autosave();
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<()> {
        self.check_write()?;
        self.sheet.remove_column(name)?;
        inventory::recompute_totals(&mut self.sheet, &self.config);
        self.schedule_autosave();
        Ok(())
    }

    /// Rename a column; declared column formulas follow the new name.
    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        self.check_write()?;
        self.sheet.rename_column(old, new)?;
        for formula in &mut self.column_formulas {
            let columns = formula
                .operands
                .iter_mut()
                .chain(std::iter::once(&mut formula.result_column));
            for column in columns.flatten() {
                if *column == old {
                    *column = new.to_string();
                }
            }
        }
        self.schedule_autosave();
        Ok(())
    }

    pub fn add_row(&mut self) -> Result<usize> {
        self.check_write()?;
        let index = self.sheet.add_row();
        self.schedule_autosave();
        Ok(index)
    }

    pub fn remove_row(&mut self, index: usize) -> Result<()> {
        self.check_write()?;
        self.sheet.remove_row(index)?;
        self.schedule_autosave();
        Ok(())
    }

    // ---- presentation (kept locally, not part of saves) ----

    pub fn format_cell(&mut self, row: usize, column: &str, edit: impl FnOnce(&mut CellFormat)) -> Result<()> {
        self.check_write()?;
        let pos = CellPos::new(row, self.sheet.require_column(column)?);
        self.sheet.get_cell_at(pos)?;
        self.sheet.formatting_mut().update(pos, edit);
        Ok(())
    }

    /// Merge the rectangle spanned by two references, e.g. `B2` and `C4`.
    pub fn merge_cells(&mut self, from: &str, to: &str) -> Result<()> {
        self.check_write()?;
        let parse = |r: &str| CellPos::parse(r).ok_or_else(|| SheetError::InvalidReference(r.to_string()));
        let range = MergedRange::new(parse(from)?, parse(to)?);
        self.sheet.get_cell_at(CellPos::new(range.max_row, range.max_col))?;
        self.sheet.formatting_mut().merge(range)
    }

    pub fn unmerge_cell(&mut self, reference: &str) -> Result<Option<MergedRange>> {
        self.check_write()?;
        let pos = CellPos::parse(reference).ok_or_else(|| SheetError::InvalidReference(reference.to_string()))?;
        Ok(self.sheet.formatting_mut().unmerge(pos))
    }

    pub fn collapse_row(&mut self, index: usize) {
        self.sheet.collapse_row(index);
    }

    pub fn expand_row(&mut self, index: usize) {
        self.sheet.expand_row(index);
    }

    pub fn set_column_width(&mut self, index: usize, width: u32) {
        self.sheet.set_column_width(index, width);
    }

    pub fn set_row_label(&mut self, index: usize, label: Option<&str>) {
        self.sheet.set_row_label(index, label);
    }

    pub fn rename_row_label_header(&mut self, header: &str) {
        self.sheet.rename_row_label_header(header);
    }

    // ---- column formulas ----

    /// Declare a column formula. It is only validated when applied.
    pub fn declare_column_formula(&mut self, formula: ColumnFormula) -> usize {
        self.column_formulas.push(formula);
        self.column_formulas.len() - 1
    }

    pub fn column_formulas(&self) -> &[ColumnFormula] {
        &self.column_formulas
    }

    pub fn remove_column_formula(&mut self, index: usize) -> Option<ColumnFormula> {
        (index < self.column_formulas.len()).then(|| self.column_formulas.remove(index))
    }

    pub fn apply_column_formula(&mut self, index: usize) -> Result<ApplyReport> {
        self.check_write()?;
        let formula = self.column_formulas.get(index).cloned().ok_or_else(|| {
            SheetError::InvalidColumnFormula(vec![format!("no column formula #{}", index + 1)])
        })?;
        let report = formula.apply(&mut self.sheet)?;
        inventory::recompute_totals(&mut self.sheet, &self.config);
        self.schedule_autosave();
        log::debug!("applied column formula {}: {:?}", formula, report);
        Ok(report)
    }

    /// Apply every declared formula in order, or none if any is invalid.
    pub fn apply_all_column_formulas(&mut self) -> Result<Vec<ApplyReport>> {
        self.check_write()?;
        let reports = column_formula::apply_all(&self.column_formulas, &mut self.sheet)?;
        inventory::recompute_totals(&mut self.sheet, &self.config);
        self.schedule_autosave();
        Ok(reports)
    }

    // ---- inventory ----

    /// Add the ledger columns for `date`. A date that already has them is
    /// reported as [`SheetError::LedgerDayExists`].
    pub fn add_ledger_day(&mut self, date: NaiveDate) -> Result<()> {
        self.check_write()?;
        inventory::add_ledger_day(&mut self.sheet, &self.config, date)?;
        self.schedule_autosave();
        Ok(())
    }

    pub fn critical_rows(&self) -> Vec<usize> {
        inventory::critical_rows(&self.sheet, &self.config)
    }

    // ---- locking and edit sessions ----

    pub async fn lock(&mut self) -> Result<LockOutcome> {
        self.ensure_open()?;
        self.coordinator.check_can_lock(&self.user)?;
        let already_held = self
            .coordinator
            .lock_holder()
            .is_some_and(|h| h.user_id == self.user.id);
        let holder = match self.gateway.lock_sheet(self.sheet.id).await {
            Ok(holder) => holder,
            Err(e) => {
                if let SheetError::LockedBy { .. } = e {
                    // our view was stale
                    if let Err(refresh) = self.refresh_status().await {
                        log::warn!("could not refresh status of sheet {}: {}", self.sheet.id, refresh);
                    }
                }
                return Err(e);
            }
        };
        let editor = self.coordinator.remote_editor().cloned();
        self.coordinator.apply_lock_snapshot(Some(holder), editor);
        log::info!("{} locked sheet {}", self.user.username, self.sheet.id);
        Ok(if already_held {
            LockOutcome::AlreadyHeld
        } else {
            LockOutcome::Acquired
        })
    }

    pub async fn unlock(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.coordinator.check_can_unlock(&self.user)?;
        let was_mine = self
            .coordinator
            .lock_holder()
            .is_some_and(|h| h.user_id == self.user.id);
        self.gateway.unlock_sheet(self.sheet.id).await?;
        self.coordinator.unlock(&self.user)?;
        if was_mine {
            self.coordinator.end_edit_session();
        }
        log::info!("{} unlocked sheet {}", self.user.username, self.sheet.id);
        Ok(())
    }

    /// Start an edit session; [`SheetSession::run`] re-asserts it on every
    /// heartbeat interval until the sheet is unlocked or closed.
    pub async fn start_edit_session(&mut self) -> Result<Uuid> {
        self.check_write()?;
        self.gateway.start_edit_session(self.sheet.id).await?;
        let token = self.coordinator.start_edit_session(&self.user).token;
        log::info!("{} started an edit session on sheet {}", self.user.username, self.sheet.id);
        Ok(token)
    }

    /// Re-assert the edit session. Returns whether the store was reached;
    /// failures are logged and the session stays active.
    pub async fn heartbeat(&mut self) -> bool {
        if self.closed || self.coordinator.edit_session().is_none() {
            return false;
        }
        let result = self.gateway.start_edit_session(self.sheet.id).await;
        let missed = self.coordinator.record_heartbeat(result.is_ok());
        if let Err(e) = result {
            log::warn!(
                "edit session heartbeat for sheet {} failed ({} in a row): {}",
                self.sheet.id,
                missed,
                e
            );
            return false;
        }
        true
    }

    pub async fn refresh_status(&mut self) -> Result<SheetStatus> {
        let status = self.gateway.get_sheet_status(self.sheet.id).await?;
        self.coordinator
            .apply_lock_snapshot(status.locked_by.clone(), status.editing.clone());
        Ok(status)
    }

    // ---- persistence ----

    /// Save immediately, cancelling any pending autosave.
    pub async fn save_now(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.autosave.cancel();
        let payload = SavePayload::from_sheet(&self.sheet);
        self.gateway.save_sheet(self.sheet.id, &payload).await?;
        log::debug!("saved sheet {} ({} rows)", self.sheet.id, payload.rows.len());
        Ok(())
    }

    /// Run a pending autosave now. A failed autosave is logged and scheduled again.
    pub async fn flush_autosave(&mut self) {
        if !self.autosave.is_pending() {
            return;
        }
        if let Err(e) = self.save_now().await {
            log::warn!("autosave of sheet {} failed, retrying: {}", self.sheet.id, e);
            self.schedule_autosave();
        }
    }

    /// Replace local data with the stored sheet.
    pub async fn reload(&mut self) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self.gateway.load_sheet(self.sheet.id).await?;
        let (holder, editor) = (snapshot.locked_by.clone(), snapshot.editing.clone());
        gateway::apply_snapshot(&mut self.sheet, snapshot, &self.config);
        self.coordinator.apply_lock_snapshot(holder, editor);
        log::info!("reloaded sheet {}", self.sheet.id);
        Ok(())
    }

    /// One poll interval: refresh presence, and on every n-th tick reload the
    /// sheet unless that would clobber local work.
    pub async fn poll_tick(&mut self) {
        if self.closed {
            return;
        }
        self.poll_ticks += 1;
        self.emit(OutboundEvent::GetPresence {
            sheet_id: self.sheet.id,
        })
        .await;
        if self.poll_ticks % u64::from(self.config.reload_every_ticks.max(1)) != 0 {
            return;
        }
        if self.coordinator.has_open_editor() || self.autosave.is_pending() {
            log::debug!("periodic reload of sheet {} deferred: local edits", self.sheet.id);
            return;
        }
        if let Err(e) = self.reload().await {
            log::warn!("periodic reload of sheet {} failed: {}", self.sheet.id, e);
        }
    }

    // ---- inbound ----

    fn reconcile(&mut self, event: &InboundEvent) -> ReconcileOutcome {
        Reconciler {
            sheet: &mut self.sheet,
            coordinator: &mut self.coordinator,
            me: &self.user,
            config: &self.config,
            unsaved_changes: self.autosave.is_pending(),
        }
        .apply(event)
    }

    /// Apply one inbound event and carry out what it calls for. Nothing applied
    /// here is re-emitted.
    pub async fn handle_inbound(&mut self, event: InboundEvent) -> ReconcileOutcome {
        if self.closed {
            return ReconcileOutcome::Ignored("session closed");
        }
        let outcome = self.reconcile(&event);
        log::debug!("inbound {} on sheet {}: {:?}", event.name(), self.sheet.id, outcome);
        match &outcome {
            ReconcileOutcome::ReloadRequired => {
                if let Err(e) = self.reload().await {
                    log::warn!("reload of sheet {} failed: {}", self.sheet.id, e);
                }
            }
            ReconcileOutcome::ReloadSkipped => {
                log::warn!(
                    "sheet {} was saved by another user while local edits are open or unsaved; reload skipped",
                    self.sheet.id
                );
            }
            ReconcileOutcome::Reannounce => self.handle_reconnect().await,
            _ => {}
        }
        outcome
    }

    /// Handle every event already queued, without waiting.
    pub async fn process_pending(&mut self) -> Vec<ReconcileOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let event = match self.inbound.as_mut().map(|rx| rx.try_recv()) {
                Some(Ok(event)) => event,
                _ => break,
            };
            outcomes.push(self.handle_inbound(event).await);
        }
        outcomes
    }

    /// Re-join the room and ask for presence now and again after a short delay.
    pub async fn handle_reconnect(&mut self) {
        let sheet_id = self.sheet.id;
        log::info!("realtime connection restored, re-announcing on sheet {}", sheet_id);
        self.emit(OutboundEvent::JoinSheet { sheet_id }).await;
        self.emit(OutboundEvent::GetPresence { sheet_id }).await;
        if let Some(pos) = self.coordinator.editing_cell() {
            self.emit(OutboundEvent::CellFocus {
                sheet_id,
                cell_ref: pos.to_ref(),
            })
            .await;
        }
        self.presence_retry_at = Some(Instant::now() + self.config.presence_retry_delay());
    }

    async fn presence_retry(&mut self) {
        self.presence_retry_at = None;
        self.emit(OutboundEvent::GetPresence {
            sheet_id: self.sheet.id,
        })
        .await;
    }

    // ---- edit requests ----

    pub async fn list_edit_requests(&self, status: Option<EditRequestStatus>) -> Result<Vec<EditRequest>> {
        self.ensure_open()?;
        self.gateway.list_edit_requests(self.sheet.id, status).await
    }

    /// Approve or reject a request. Approval is written by the store; the value
    /// is mirrored locally right away.
    pub async fn resolve_edit_request(
        &mut self,
        request_id: RequestId,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<EditRequest> {
        self.ensure_open()?;
        if !self.user.is_elevated() {
            return Err(SheetError::NotElevated);
        }
        let request = self
            .gateway
            .resolve_edit_request(request_id, approved, reason)
            .await?;
        self.emit(OutboundEvent::ResolveEditRequest {
            request_id,
            approved,
            reject_reason: reason.map(str::to_string),
        })
        .await;
        self.coordinator.request_resolved();

        if approved && request.sheet_id == self.sheet.id {
            if let Some(col) = self.sheet.column_index(&request.column) {
                self.sheet.ensure_rows(request.row + 1);
                self.sheet
                    .set_cell_at(CellPos::new(request.row, col), &request.proposed_value)?;
                self.recompute_row(col, request.row);
            }
        }
        log::info!(
            "{} {} edit request {} for {}",
            self.user.username,
            if approved { "approved" } else { "rejected" },
            request.id,
            request.cell_ref
        );
        Ok(request)
    }

    // ---- lifecycle ----

    /// Delete the sheet and close the session. Refused while another user
    /// holds the lock or an edit session.
    pub async fn delete_sheet(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.refresh_status().await?;
        self.coordinator.check_delete(&self.user)?;
        self.gateway.delete_sheet(self.sheet.id).await?;
        self.autosave.cancel();
        self.close().await;
        Ok(())
    }

    /// Tear the session down: drop any pending autosave, release the focused
    /// cell, leave the room and stop receiving events. Calling it twice is harmless.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.autosave.cancel() {
            log::debug!("pending autosave of sheet {} dropped on close", self.sheet.id);
        }
        self.cancel_cell_edit().await;
        self.emit(OutboundEvent::LeaveSheet {
            sheet_id: self.sheet.id,
        })
        .await;
        self.transport.detach();
        self.inbound = None;
        self.presence_retry_at = None;
        self.closed = true;
        log::info!("{} closed sheet {}", self.user.username, self.sheet.id);
    }

    /// Drive the session until `shutdown` resolves, then close it.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.ensure_open()?;
        let mut inbound = self.inbound.take();
        let start = Instant::now();
        let mut poll = time::interval_at(start + self.config.poll_interval(), self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = time::interval_at(
            start + self.config.heartbeat_interval(),
            self.config.heartbeat_interval(),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            let autosave_at = self.autosave.deadline();
            let retry_at = self.presence_retry_at;
            tokio::select! {
                _ = &mut shutdown => break,
                event = next_event(&mut inbound) => match event {
                    Some(event) => {
                        self.handle_inbound(event).await;
                    }
                    None => {
                        log::debug!("inbound events for sheet {} ended", self.sheet.id);
                        inbound = None;
                    }
                },
                _ = sleep_until_opt(autosave_at) => self.flush_autosave().await,
                _ = sleep_until_opt(retry_at) => self.presence_retry().await,
                _ = poll.tick() => self.poll_tick().await,
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }

        self.inbound = inbound;
        self.close().await;
        Ok(())
    }
}

async fn next_event(inbound: &mut Option<UnboundedReceiver<InboundEvent>>) -> Option<InboundEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}
