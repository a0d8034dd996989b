//! In-process authoritative sheet store.
//!
//! [`MemoryServer`] keeps every sheet, lock and edit request behind one mutex and
//! hands out a [`MemoryGateway`] per authenticated user. It enforces the same
//! role and lock rules a real storage service would and publishes
//! [`ServerNotice`]s after each change so a realtime hub can fan them out.

use crate::config::CollabConfig;
use crate::coordinator::{EditorInfo, LockHolder};
use crate::edit_request::{EditRequest, EditRequestDraft, EditRequestStatus, RequestId};
use crate::error::{Result, SheetError};
use crate::gateway::{PersistenceGateway, RowRecord, SavePayload, SheetSnapshot, SheetStatus};
use crate::saving;
use crate::spreadsheet::{Sheet, SheetId, SheetTemplate};
use crate::user::{User, UserId};
use chrono::{Local, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A change the server made, published to every listener.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerNotice {
    SheetSaved {
        sheet_id: SheetId,
        saved_by: UserId,
    },
    LockChanged {
        sheet_id: SheetId,
        locked_by: Option<LockHolder>,
        editing: Option<EditorInfo>,
    },
    SheetDeleted {
        sheet_id: SheetId,
    },
}

type NoticeListener = Box<dyn Fn(&ServerNotice) + Send + Sync>;

struct ServerState {
    config: CollabConfig,
    sheets: HashMap<SheetId, SheetSnapshot>,
    requests: BTreeMap<RequestId, EditRequest>,
    next_sheet_id: SheetId,
    next_request_id: RequestId,
    offline: bool,
    today: Option<NaiveDate>,
    save_count: usize,
}

impl ServerState {
    fn check_online(&self) -> Result<()> {
        if self.offline {
            Err(SheetError::Gateway("storage service unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn sheet(&self, id: SheetId) -> Result<&SheetSnapshot> {
        self.sheets.get(&id).ok_or(SheetError::SheetNotFound(id))
    }

    fn sheet_mut(&mut self, id: SheetId) -> Result<&mut SheetSnapshot> {
        self.sheets.get_mut(&id).ok_or(SheetError::SheetNotFound(id))
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    fn pending_count(&self, sheet_id: SheetId) -> usize {
        self.requests
            .values()
            .filter(|r| r.sheet_id == sheet_id && r.is_pending())
            .count()
    }
}

fn require_editor(user: &User) -> Result<()> {
    if user.can_edit() {
        Ok(())
    } else {
        Err(SheetError::ReadOnly {
            role: user.role.to_string(),
        })
    }
}

/// Writers other than the lock holder are refused unless elevated.
fn check_write(snapshot: &SheetSnapshot, user: &User) -> Result<()> {
    require_editor(user)?;
    match &snapshot.locked_by {
        Some(holder) if holder.user_id != user.id && !user.is_elevated() => Err(SheetError::LockedBy {
            name: holder.name.clone(),
        }),
        _ => Ok(()),
    }
}

fn lock_notice(snapshot: &SheetSnapshot) -> ServerNotice {
    ServerNotice::LockChanged {
        sheet_id: snapshot.id,
        locked_by: snapshot.locked_by.clone(),
        editing: snapshot.editing.clone(),
    }
}

#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    listeners: Arc<Mutex<Vec<NoticeListener>>>,
}

impl MemoryServer {
    pub fn new(config: CollabConfig) -> Self {
        MemoryServer {
            state: Arc::new(Mutex::new(ServerState {
                config,
                sheets: HashMap::new(),
                requests: BTreeMap::new(),
                next_sheet_id: 1,
                next_request_id: 1,
                offline: false,
                today: None,
                save_count: 0,
            })),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| SheetError::Gateway("server state poisoned".to_string()))
    }

    /// Call listeners with no server lock held, so they may query the server.
    fn publish(&self, notice: ServerNotice) {
        log::debug!("server notice {:?}", notice);
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(&notice);
            }
        }
    }

    pub fn add_listener(&self, listener: impl Fn(&ServerNotice) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// A gateway acting on behalf of `user`.
    pub fn connect(&self, user: User) -> MemoryGateway {
        MemoryGateway {
            server: self.clone(),
            user,
        }
    }

    /// Store a sheet built elsewhere, assigning it a fresh id.
    pub fn insert_sheet(&self, sheet: &Sheet) -> Result<SheetId> {
        let mut state = self.state()?;
        let id = state.next_sheet_id;
        state.next_sheet_id += 1;
        let mut snapshot = SheetSnapshot::from_sheet(sheet);
        snapshot.id = id;
        snapshot.formatting = None;
        state.sheets.insert(id, snapshot);
        Ok(id)
    }

    pub fn snapshot(&self, id: SheetId) -> Result<SheetSnapshot> {
        self.state()?.sheet(id).cloned()
    }

    /// Write the stored sheet to a compressed snapshot file. Locks and edit
    /// sessions are not exported.
    pub fn export_sheet(&self, id: SheetId, path: impl AsRef<Path>) -> Result<()> {
        let mut snapshot = self.snapshot(id)?;
        snapshot.locked_by = None;
        snapshot.editing = None;
        saving::save_snapshot(&snapshot, path)
    }

    /// Store a sheet read from a snapshot file under a fresh id.
    pub fn import_sheet(&self, path: impl AsRef<Path>) -> Result<SheetId> {
        let mut snapshot = saving::load_snapshot(path)?;
        let mut state = self.state()?;
        let id = state.next_sheet_id;
        state.next_sheet_id += 1;
        log::info!("imported sheet '{}' as {}", snapshot.name, id);
        snapshot.id = id;
        snapshot.locked_by = None;
        snapshot.editing = None;
        state.sheets.insert(id, snapshot);
        Ok(id)
    }

    pub fn request(&self, id: RequestId) -> Result<EditRequest> {
        self.state()?
            .requests
            .get(&id)
            .cloned()
            .ok_or(SheetError::RequestNotFound(id))
    }

    pub fn pending_count(&self, sheet_id: SheetId) -> usize {
        self.state().map(|s| s.pending_count(sheet_id)).unwrap_or(0)
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.state().map(|s| s.save_count).unwrap_or(0)
    }

    /// Make every gateway call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state() {
            state.offline = offline;
        }
    }

    /// Pin the server's calendar date (templates use it for the first ledger day).
    pub fn set_today(&self, today: NaiveDate) {
        if let Ok(mut state) = self.state() {
            state.today = Some(today);
        }
    }

    pub fn sheet_ids(&self) -> Vec<SheetId> {
        let mut ids: Vec<SheetId> = self
            .state()
            .map(|s| s.sheets.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

/// The store as seen by one user.
#[derive(Clone)]
pub struct MemoryGateway {
    server: MemoryServer,
    user: User,
}

impl MemoryGateway {
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

/// Set `column` of stored row `row`, growing the row list as needed.
fn write_cell(snapshot: &mut SheetSnapshot, row: usize, column: &str, value: &str) {
    let blank: RowRecord = snapshot
        .columns
        .iter()
        .map(|c| (c.clone(), String::new()))
        .collect();
    if snapshot.rows.len() <= row {
        snapshot.rows.resize(row + 1, blank);
    }
    snapshot.rows[row].insert(column.to_string(), value.to_string());
    snapshot.updated_at = Utc::now();
}

impl PersistenceGateway for MemoryGateway {
    async fn load_sheet(&self, id: SheetId) -> Result<SheetSnapshot> {
        let state = self.server.state()?;
        state.check_online()?;
        let snapshot = state.sheet(id)?;
        if !snapshot.visible_to_viewers && !self.user.can_edit() {
            return Err(SheetError::SheetNotFound(id));
        }
        Ok(snapshot.clone())
    }

    async fn save_sheet(&self, id: SheetId, payload: &SavePayload) -> Result<()> {
        {
            let mut state = self.server.state()?;
            state.check_online()?;
            let snapshot = state.sheet_mut(id)?;
            check_write(snapshot, &self.user)?;
            snapshot.name = payload.name.clone();
            snapshot.columns = payload.columns.clone();
            snapshot.rows = payload.rows.clone();
            snapshot.updated_at = Utc::now();
            state.save_count += 1;
        }
        log::debug!("sheet {} saved by {}", id, self.user.username);
        self.server.publish(ServerNotice::SheetSaved {
            sheet_id: id,
            saved_by: self.user.id,
        });
        Ok(())
    }

    async fn lock_sheet(&self, id: SheetId) -> Result<LockHolder> {
        let (holder, notice) = {
            let mut state = self.server.state()?;
            state.check_online()?;
            require_editor(&self.user)?;
            let snapshot = state.sheet_mut(id)?;
            match &snapshot.locked_by {
                Some(holder) if holder.user_id == self.user.id => return Ok(holder.clone()),
                Some(holder) => {
                    return Err(SheetError::LockedBy {
                        name: holder.name.clone(),
                    });
                }
                None => {}
            }
            let holder = LockHolder::new(&self.user);
            snapshot.locked_by = Some(holder.clone());
            (holder, lock_notice(snapshot))
        };
        log::info!("sheet {} locked by {}", id, holder.name);
        self.server.publish(notice);
        Ok(holder)
    }

    async fn unlock_sheet(&self, id: SheetId) -> Result<()> {
        let notice = {
            let mut state = self.server.state()?;
            state.check_online()?;
            let snapshot = state.sheet_mut(id)?;
            let Some(holder) = &snapshot.locked_by else {
                return Ok(());
            };
            if holder.user_id != self.user.id && !self.user.is_elevated() {
                return Err(SheetError::NotLockHolder);
            }
            let holder_id = holder.user_id;
            snapshot.locked_by = None;
            if snapshot.editing.as_ref().is_some_and(|e| e.user_id == holder_id) {
                snapshot.editing = None;
            }
            lock_notice(snapshot)
        };
        log::info!("sheet {} unlocked by {}", id, self.user.username);
        self.server.publish(notice);
        Ok(())
    }

    async fn start_edit_session(&self, id: SheetId) -> Result<()> {
        let notice = {
            let mut state = self.server.state()?;
            state.check_online()?;
            let snapshot = state.sheet_mut(id)?;
            check_write(snapshot, &self.user)?;
            let editor = EditorInfo {
                user_id: self.user.id,
                name: self.user.label().to_string(),
            };
            if snapshot.editing.as_ref() == Some(&editor) {
                None
            } else {
                snapshot.editing = Some(editor);
                Some(lock_notice(snapshot))
            }
        };
        if let Some(notice) = notice {
            self.server.publish(notice);
        }
        Ok(())
    }

    async fn get_sheet_status(&self, id: SheetId) -> Result<SheetStatus> {
        let state = self.server.state()?;
        state.check_online()?;
        let snapshot = state.sheet(id)?;
        Ok(SheetStatus {
            is_locked: snapshot.locked_by.is_some(),
            locked_by: snapshot.locked_by.clone(),
            editing: snapshot.editing.clone(),
        })
    }

    async fn submit_edit_request(&self, draft: &EditRequestDraft) -> Result<EditRequest> {
        let mut state = self.server.state()?;
        state.check_online()?;
        require_editor(&self.user)?;
        let snapshot = state.sheet(draft.sheet_id)?;
        if !snapshot.columns.contains(&draft.column) {
            return Err(SheetError::UnknownColumn(draft.column.clone()));
        }
        let id = state.next_request_id;
        state.next_request_id += 1;
        let request = EditRequest::from_draft(id, draft.clone(), &self.user);
        state.requests.insert(id, request.clone());
        log::info!(
            "edit request {} for {} on sheet {} submitted by {}",
            id,
            request.cell_ref,
            request.sheet_id,
            self.user.username
        );
        Ok(request)
    }

    async fn list_edit_requests(
        &self,
        sheet_id: SheetId,
        status: Option<EditRequestStatus>,
    ) -> Result<Vec<EditRequest>> {
        let state = self.server.state()?;
        state.check_online()?;
        state.sheet(sheet_id)?;
        Ok(state
            .requests
            .values()
            .filter(|r| r.sheet_id == sheet_id && r.matches(status))
            .filter(|r| self.user.is_elevated() || r.requested_by == self.user.id)
            .cloned()
            .collect())
    }

    /// Approval writes the proposed value into the stored sheet.
    async fn resolve_edit_request(
        &self,
        request_id: RequestId,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<EditRequest> {
        let (request, saved) = {
            let mut guard = self.server.state()?;
            let state = &mut *guard;
            state.check_online()?;
            let request = state
                .requests
                .get_mut(&request_id)
                .ok_or(SheetError::RequestNotFound(request_id))?;
            let sheet = state
                .sheets
                .get_mut(&request.sheet_id)
                .ok_or(SheetError::SheetNotFound(request.sheet_id))?;
            if approved && !sheet.columns.contains(&request.column) {
                return Err(SheetError::UnknownColumn(request.column.clone()));
            }
            request.resolve(approved, &self.user, reason)?;
            if approved {
                write_cell(sheet, request.row, &request.column, &request.proposed_value);
            }
            (request.clone(), approved)
        };
        log::info!(
            "edit request {} {} by {}",
            request.id,
            if approved { "approved" } else { "rejected" },
            self.user.username
        );
        if saved {
            self.server.publish(ServerNotice::SheetSaved {
                sheet_id: request.sheet_id,
                saved_by: self.user.id,
            });
        }
        Ok(request)
    }

    async fn create_sheet(&self, name: &str, template: SheetTemplate) -> Result<SheetId> {
        let id = {
            let mut state = self.server.state()?;
            state.check_online()?;
            require_editor(&self.user)?;
            let id = state.next_sheet_id;
            state.next_sheet_id += 1;
            let sheet = Sheet::from_template(id, name, template, &state.config, state.today());
            let mut snapshot = SheetSnapshot::from_sheet(&sheet);
            snapshot.formatting = None;
            snapshot.rows.retain(|r| r.values().any(|v| !v.trim().is_empty()));
            state.sheets.insert(id, snapshot);
            id
        };
        log::info!("sheet {} '{}' created by {}", id, name, self.user.username);
        Ok(id)
    }

    /// Refused while another user holds the lock or an edit session.
    async fn delete_sheet(&self, id: SheetId) -> Result<()> {
        {
            let mut state = self.server.state()?;
            state.check_online()?;
            require_editor(&self.user)?;
            let snapshot = state.sheet(id)?;
            if let Some(holder) = snapshot.locked_by.as_ref().filter(|h| h.user_id != self.user.id) {
                return Err(SheetError::SheetBusy {
                    by: holder.name.clone(),
                });
            }
            if let Some(editor) = snapshot.editing.as_ref().filter(|e| e.user_id != self.user.id) {
                return Err(SheetError::SheetBusy {
                    by: editor.name.clone(),
                });
            }
            state.sheets.remove(&id);
            state.requests.retain(|_, r| r.sheet_id != id);
        }
        log::info!("sheet {} deleted by {}", id, self.user.username);
        self.server.publish(ServerNotice::SheetDeleted { sheet_id: id });
        Ok(())
    }
}
