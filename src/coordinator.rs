//! Concurrency coordination for one open sheet.
//!
//! The coordinator owns the sheet lock state, the local edit session, the
//! presence board, one-time grants for historical cells and the pending
//! edit-request count. Every check here runs *before* the grid is touched; a
//! failed check means the mutation is not attempted at all.

use crate::cell::CellPos;
use crate::error::{Result, SheetError};
use crate::inventory;
use crate::presence::{PresenceBoard, PresenceRecord};
use crate::user::{User, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// The user holding a sheet lock, and since when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub user_id: UserId,
    pub name: String,
    pub since: DateTime<Utc>,
}

impl LockHolder {
    pub fn new(user: &User) -> Self {
        LockHolder {
            user_id: user.id,
            name: user.label().to_string(),
            since: Utc::now(),
        }
    }
}

/// Who has an edit session open on a sheet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorInfo {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LockState {
    #[default]
    Unlocked,
    LockedByUser(LockHolder),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The requester already held the lock.
    AlreadyHeld,
}

/// Result of the historical-cell policy for one edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellPolicy {
    Allowed,
    /// Allowed once; the grant is consumed by the next successful save.
    AllowedWithGrant,
    NeedsRequest,
}

/// This client's edit session: started explicitly, kept alive by heartbeats.
#[derive(Clone, Debug)]
pub struct EditSession {
    pub token: Uuid,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    missed_heartbeats: u32,
}

impl EditSession {
    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }
}

#[derive(Debug, Default)]
pub struct Coordinator {
    lock: LockState,
    remote_editor: Option<EditorInfo>,
    edit_session: Option<EditSession>,
    presence: PresenceBoard,
    open_editor: Option<CellPos>,
    grants: HashSet<CellPos>,
    pending_requests: usize,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    pub fn lock_holder(&self) -> Option<&LockHolder> {
        match &self.lock {
            LockState::LockedByUser(holder) => Some(holder),
            LockState::Unlocked => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_holder().is_some()
    }

    fn locked_by_other(&self, user: &User) -> Option<&LockHolder> {
        self.lock_holder().filter(|h| h.user_id != user.id)
    }

    /// Acquire the sheet lock. A lock held by someone else is never taken over,
    /// whatever the requester's role.
    pub fn lock(&mut self, user: &User) -> Result<LockOutcome> {
        self.check_can_lock(user)?;
        if self.lock_holder().is_some() {
            return Ok(LockOutcome::AlreadyHeld);
        }
        self.lock = LockState::LockedByUser(LockHolder::new(user));
        Ok(LockOutcome::Acquired)
    }

    /// The checks of [`Coordinator::lock`] without changing state.
    pub fn check_can_lock(&self, user: &User) -> Result<()> {
        if !user.can_edit() {
            return Err(SheetError::ReadOnly {
                role: user.role.to_string(),
            });
        }
        if let Some(holder) = self.locked_by_other(user) {
            return Err(SheetError::LockedBy {
                name: holder.name.clone(),
            });
        }
        Ok(())
    }

    /// Release the lock. Returns `false` when the sheet was not locked.
    pub fn unlock(&mut self, user: &User) -> Result<bool> {
        self.check_can_unlock(user)?;
        let was_locked = self.is_locked();
        self.lock = LockState::Unlocked;
        Ok(was_locked)
    }

    pub fn check_can_unlock(&self, user: &User) -> Result<()> {
        match self.lock_holder() {
            Some(holder) if holder.user_id != user.id && !user.is_elevated() => {
                Err(SheetError::NotLockHolder)
            }
            _ => Ok(()),
        }
    }

    /// May `user` change sheet data right now?
    pub fn check_mutation(&self, user: &User) -> Result<()> {
        if !user.can_edit() {
            return Err(SheetError::ReadOnly {
                role: user.role.to_string(),
            });
        }
        match self.locked_by_other(user) {
            Some(holder) if !user.is_elevated() => Err(SheetError::LockedBy {
                name: holder.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// May `user` delete the sheet? Refused while another user holds the lock
    /// or an edit session, for every role.
    pub fn check_delete(&self, user: &User) -> Result<()> {
        if !user.can_edit() {
            return Err(SheetError::ReadOnly {
                role: user.role.to_string(),
            });
        }
        if let Some(holder) = self.locked_by_other(user) {
            return Err(SheetError::SheetBusy {
                by: holder.name.clone(),
            });
        }
        match &self.remote_editor {
            Some(editor) if editor.user_id != user.id => Err(SheetError::SheetBusy {
                by: editor.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Overwrite lock and editor state with what the server reported.
    pub fn apply_lock_snapshot(&mut self, holder: Option<LockHolder>, editor: Option<EditorInfo>) {
        self.lock = match holder {
            Some(holder) => LockState::LockedByUser(holder),
            None => LockState::Unlocked,
        };
        self.remote_editor = editor;
    }

    pub fn remote_editor(&self) -> Option<&EditorInfo> {
        self.remote_editor.as_ref()
    }

    pub fn start_edit_session(&mut self, user: &User) -> &EditSession {
        let session = self.edit_session.insert(EditSession {
            token: Uuid::new_v4(),
            user_id: user.id,
            started_at: Utc::now(),
            missed_heartbeats: 0,
        });
        self.remote_editor = Some(EditorInfo {
            user_id: user.id,
            name: user.label().to_string(),
        });
        session
    }

    pub fn edit_session(&self) -> Option<&EditSession> {
        self.edit_session.as_ref()
    }

    pub fn end_edit_session(&mut self) -> Option<EditSession> {
        let session = self.edit_session.take()?;
        if self
            .remote_editor
            .as_ref()
            .is_some_and(|e| e.user_id == session.user_id)
        {
            self.remote_editor = None;
        }
        Some(session)
    }

    /// Record a heartbeat result and return the consecutive failure count.
    /// Failures never end the session.
    pub fn record_heartbeat(&mut self, delivered: bool) -> u32 {
        match self.edit_session.as_mut() {
            Some(session) if delivered => {
                session.missed_heartbeats = 0;
                0
            }
            Some(session) => {
                session.missed_heartbeats += 1;
                session.missed_heartbeats
            }
            None => 0,
        }
    }

    /// Classify an edit of `pos` in column `column` by `user`.
    pub fn cell_policy(&self, user: &User, column: &str, pos: CellPos, today: NaiveDate) -> CellPolicy {
        if user.is_elevated() || !inventory::is_historical_column(column, today) {
            CellPolicy::Allowed
        } else if self.grants.contains(&pos) {
            CellPolicy::AllowedWithGrant
        } else {
            CellPolicy::NeedsRequest
        }
    }

    pub fn grant(&mut self, pos: CellPos) {
        self.grants.insert(pos);
    }

    pub fn has_grant(&self, pos: CellPos) -> bool {
        self.grants.contains(&pos)
    }

    /// Use up the grant for `pos`. Returns whether there was one.
    pub fn consume_grant(&mut self, pos: CellPos) -> bool {
        self.grants.remove(&pos)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }

    pub fn set_pending_requests(&mut self, count: usize) {
        self.pending_requests = count;
    }

    pub fn request_submitted(&mut self) {
        self.pending_requests += 1;
    }

    pub fn request_resolved(&mut self) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
    }

    pub fn presence(&self) -> &PresenceBoard {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceBoard {
        &mut self.presence
    }

    /// Open a cell editor for `user` on `pos`.
    ///
    /// Blocked when the presence board shows another user focused on the cell.
    /// This is advisory: two users racing for the same cell can both get in.
    pub fn open_editor(&mut self, user: &User, pos: CellPos) -> Result<()> {
        let cell_ref = pos.to_ref();
        if let Some(other) = self.presence.focused_by_other(&cell_ref, user.id) {
            return Err(SheetError::CellBusy {
                cell_ref,
                by: other.label().to_string(),
            });
        }
        self.open_editor = Some(pos);
        self.presence
            .focus(PresenceRecord::from_user(user, Some(&cell_ref)));
        Ok(())
    }

    /// Close the open editor, returning the cell it was on.
    pub fn close_editor(&mut self, user: &User) -> Option<CellPos> {
        let pos = self.open_editor.take()?;
        self.presence.blur(user.id, &pos.to_ref());
        Some(pos)
    }

    pub fn editing_cell(&self) -> Option<CellPos> {
        self.open_editor
    }

    pub fn has_open_editor(&self) -> bool {
        self.open_editor.is_some()
    }
}
