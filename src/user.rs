use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric user identifier as issued by the authentication service.
pub type UserId = i64;

/// Role of a user, ordered from most to least privileged
///
/// Admins and managers are *elevated*: they may release other users' locks,
/// edit historical ledger cells directly and resolve edit requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Editor,
    Viewer,
}

impl Role {
    /// Parse a role name as sent by the auth service or the realtime server.
    ///
    /// Unknown roles return `None`; presence entries carrying them are dropped.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "editor" | "user" => Some(Role::Editor),
            "viewer" | "readonly" | "read_only" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    pub fn can_edit(&self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated user as seen by the sheet core
///
/// Authentication itself happens elsewhere; the core only needs identity,
/// role and the optional presentation fields shown next to cursors.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,

    /// Login name (unique)
    pub username: String,

    /// Human-readable name, falls back to `username`
    pub display_name: Option<String>,

    pub role: Role,

    pub department: Option<String>,
}

impl User {
    pub fn new(id: UserId, username: &str, role: Role) -> Self {
        User {
            id,
            username: username.to_string(),
            display_name: None,
            role,
            department: None,
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn with_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }

    /// Name to show in lock and presence messages.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.username)
    }

    pub fn is_elevated(&self) -> bool {
        self.role.is_elevated()
    }

    pub fn can_edit(&self) -> bool {
        self.role.can_edit()
    }
}
