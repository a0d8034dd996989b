//! Approval workflow for edits to protected (historical) cells.

use crate::error::{Result, SheetError};
use crate::spreadsheet::SheetId;
use crate::user::{User, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RequestId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditRequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl EditRequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EditRequestStatus::Pending)
    }
}

/// What a requester submits. `row` is the 0-based row index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequestDraft {
    pub sheet_id: SheetId,
    pub row: usize,
    pub column: String,
    pub cell_ref: String,
    pub current_value: String,
    pub proposed_value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub id: RequestId,
    pub sheet_id: SheetId,
    pub row: usize,
    pub column: String,
    pub cell_ref: String,
    pub current_value: String,
    pub proposed_value: String,
    pub requested_by: UserId,
    pub requester_name: String,
    pub status: EditRequestStatus,
    pub resolved_by: Option<UserId>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EditRequest {
    pub fn from_draft(id: RequestId, draft: EditRequestDraft, requester: &User) -> Self {
        EditRequest {
            id,
            sheet_id: draft.sheet_id,
            row: draft.row,
            column: draft.column,
            cell_ref: draft.cell_ref,
            current_value: draft.current_value,
            proposed_value: draft.proposed_value,
            requested_by: requester.id,
            requester_name: requester.label().to_string(),
            status: EditRequestStatus::Pending,
            resolved_by: None,
            reject_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Move a pending request to its terminal state.
    ///
    /// Only elevated users may resolve, and a request resolves exactly once.
    pub fn resolve(&mut self, approved: bool, resolver: &User, reason: Option<&str>) -> Result<()> {
        if !resolver.is_elevated() {
            return Err(SheetError::NotElevated);
        }
        if self.status.is_terminal() {
            return Err(SheetError::AlreadyResolved(self.id));
        }
        self.status = if approved {
            EditRequestStatus::Approved
        } else {
            EditRequestStatus::Rejected
        };
        self.resolved_by = Some(resolver.id);
        self.reject_reason = if approved {
            None
        } else {
            reason.map(str::to_string)
        };
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.status == EditRequestStatus::Pending
    }

    /// Filter used by request listings; `None` matches every status.
    pub fn matches(&self, filter: Option<EditRequestStatus>) -> bool {
        filter.is_none_or(|status| status == self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Role;

    fn request() -> EditRequest {
        let draft = EditRequestDraft {
            sheet_id: 3,
            row: 0,
            column: "IN 2024-01-01".to_string(),
            cell_ref: "D1".to_string(),
            current_value: "4".to_string(),
            proposed_value: "6".to_string(),
        };
        EditRequest::from_draft(9, draft, &User::new(5, "eve", Role::Editor))
    }

    #[test]
    fn test_resolve_once() {
        let admin = User::new(1, "root", Role::Admin);
        let mut req = request();
        assert!(req.is_pending());
        req.resolve(false, &admin, Some("wrong day")).unwrap();
        assert_eq!(req.status, EditRequestStatus::Rejected);
        assert_eq!(req.reject_reason.as_deref(), Some("wrong day"));
        assert!(matches!(
            req.resolve(true, &admin, None),
            Err(SheetError::AlreadyResolved(9))
        ));
        assert_eq!(req.status, EditRequestStatus::Rejected);
    }

    #[test]
    fn test_editor_cannot_resolve() {
        let mut req = request();
        let editor = User::new(6, "sam", Role::Editor);
        assert!(matches!(req.resolve(true, &editor, None), Err(SheetError::NotElevated)));
        assert!(req.is_pending());
    }

    #[test]
    fn test_status_filter() {
        let req = request();
        assert!(req.matches(None));
        assert!(req.matches(Some(EditRequestStatus::Pending)));
        assert!(!req.matches(Some(EditRequestStatus::Approved)));
    }
}
