use crate::user::{Role, User, UserId};
use serde::{Deserialize, Serialize};

/// Who is looking at a sheet, and at which cell
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub department: Option<String>,
    /// Reference of the focused cell ("B4"), if any
    pub current_cell: Option<String>,
}

fn filled(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl PresenceRecord {
    pub fn from_user(user: &User, current_cell: Option<&str>) -> Self {
        PresenceRecord {
            user_id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            department: user.department.clone(),
            current_cell: current_cell.map(str::to_string),
        }
    }

    /// Number of optional fields carrying a value.
    pub fn richness(&self) -> usize {
        [&self.display_name, &self.department, &self.current_cell]
            .into_iter()
            .filter(|f| filled(f))
            .count()
            + usize::from(!self.username.trim().is_empty())
    }

    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.username)
    }

    /// Copy the fields `other` has and this record lacks.
    fn fill_from(&mut self, other: &PresenceRecord) {
        if self.username.trim().is_empty() {
            self.username = other.username.clone();
        }
        if !filled(&self.display_name) && filled(&other.display_name) {
            self.display_name = other.display_name.clone();
        }
        if !filled(&self.department) && filled(&other.department) {
            self.department = other.department.clone();
        }
    }
}

/// One record per user: the richest one wins and, between equally rich records,
/// the later one. First-seen order of users is kept.
pub fn dedup_presence(records: impl IntoIterator<Item = PresenceRecord>) -> Vec<PresenceRecord> {
    let mut out: Vec<PresenceRecord> = Vec::new();
    for record in records {
        match out.iter_mut().find(|r| r.user_id == record.user_id) {
            Some(existing) => {
                if record.richness() >= existing.richness() {
                    *existing = record;
                }
            }
            None => out.push(record),
        }
    }
    out
}

/// The presence set of the open sheet.
#[derive(Clone, Debug, Default)]
pub struct PresenceBoard {
    users: Vec<PresenceRecord>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set with a server snapshot.
    pub fn replace(&mut self, records: impl IntoIterator<Item = PresenceRecord>) {
        self.users = dedup_presence(records);
    }

    pub fn users(&self) -> &[PresenceRecord] {
        &self.users
    }

    pub fn get(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.users.iter().find(|r| r.user_id == user_id)
    }

    /// Record that `record.user_id` focused `record.current_cell`, adding the
    /// user when unknown.
    pub fn focus(&mut self, record: PresenceRecord) {
        match self.users.iter_mut().find(|r| r.user_id == record.user_id) {
            Some(existing) => {
                existing.fill_from(&record);
                existing.current_cell = record.current_cell;
            }
            None => self.users.push(record),
        }
    }

    /// Clear the user's focus if it is still on `cell_ref`.
    pub fn blur(&mut self, user_id: UserId, cell_ref: &str) {
        if let Some(existing) = self.users.iter_mut().find(|r| r.user_id == user_id) {
            if existing
                .current_cell
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(cell_ref))
            {
                existing.current_cell = None;
            }
        }
    }

    pub fn remove(&mut self, user_id: UserId) -> Option<PresenceRecord> {
        let idx = self.users.iter().position(|r| r.user_id == user_id)?;
        Some(self.users.remove(idx))
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }

    /// Someone other than `me` focused on `cell_ref`.
    pub fn focused_by_other(&self, cell_ref: &str, me: UserId) -> Option<&PresenceRecord> {
        self.users.iter().find(|r| {
            r.user_id != me
                && r.current_cell
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(cell_ref))
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
